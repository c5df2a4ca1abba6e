use std::process::ExitCode;

use artifact_executor::cli::{self, Cli, Command};
use artifact_executor::error::ActionError;
use artifact_executor::executor::{self, ExecuteRequest, ExecutionOutcome};
use artifact_executor::logging::{init_logging, LogConfig};
use artifact_executor::object_store::ObjectStore;
use artifact_executor::shrinker::{self, TerminalPrompt};
use artifact_executor::tracer::SubprocessTracer;

use clap::Parser;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_config = LogConfig { level: cli.log_level, format: cli.log_format, ..Default::default() };
    if let Err(e) = init_logging(&log_config) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    match run(cli.command) {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "fatal error");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(command: Command) -> Result<ExitCode, ActionError> {
    match command {
        Command::Execute(args) => run_execute(args),
        Command::CacheFile(args) => run_cache_file(args),
        Command::IsCached(args) => run_is_cached(args),
        Command::Shrink(args) => run_shrink(args),
    }
}

fn run_execute(args: cli::ExecuteArgs) -> Result<ExitCode, ActionError> {
    let cache_dir = cli::resolve_cache_dir(args.cache_dir.clone())?;
    let env_path = args
        .resolved_env_path()
        .ok_or_else(|| ActionError::ConfigError("missing -e/--env environment manifest".to_string()))?;
    let program = args
        .resolved_program_path()
        .ok_or_else(|| ActionError::ConfigError("missing -p/--program".to_string()))?;
    let args_path = args
        .resolved_args_path()
        .ok_or_else(|| ActionError::ConfigError("missing -a/--args arguments manifest".to_string()))?;
    let inputs_path = args
        .resolved_inputs_path()
        .ok_or_else(|| ActionError::ConfigError("missing -i/--inputs manifest".to_string()))?;
    let outputs_path = args
        .resolved_outputs_path()
        .ok_or_else(|| ActionError::ConfigError("missing -o/--outputs manifest".to_string()))?;

    let env = cli::load_env_manifest(&env_path)?;
    let program_args = cli::load_args_manifest(&args_path)?;
    let declared_inputs = cli::load_path_list(&inputs_path)?;
    let declared_outputs = cli::load_path_list(&outputs_path)?;

    let working_dir = camino::Utf8PathBuf::try_from(std::env::current_dir().map_err(ActionError::Io)?)
        .map_err(|e| ActionError::Other(anyhow::anyhow!("non-UTF-8 working directory: {e}")))?;

    let store = ObjectStore::open(cache_dir)?;
    let tracer = SubprocessTracer::new();

    let outcome = executor::execute(
        &store,
        &tracer,
        ExecuteRequest {
            working_dir: &working_dir,
            env: &env,
            prog: &program,
            args: &program_args,
            declared_inputs: &declared_inputs,
            declared_outputs: &declared_outputs,
        },
    )?;

    match outcome {
        ExecutionOutcome::Hit { action_id } => {
            tracing::info!(action_id = %action_id, "cache hit, outputs replayed");
        }
        ExecutionOutcome::Miss { action_id, traced_input_count, traced_output_count } => {
            tracing::info!(
                action_id = %action_id,
                traced_input_count,
                traced_output_count,
                "cache miss, action executed and recorded"
            );
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn run_cache_file(args: cli::CacheFileArgs) -> Result<ExitCode, ActionError> {
    let cache_dir = cli::resolve_cache_dir(args.cache_dir)?;
    let store = ObjectStore::open(cache_dir)?;

    let (hash, size) = store.cache_file(&args.file, args.real_path.as_deref())?;
    println!("{hash}|{size}");
    Ok(ExitCode::SUCCESS)
}

fn run_is_cached(args: cli::IsCachedArgs) -> Result<ExitCode, ActionError> {
    let cache_dir = cli::resolve_cache_dir(args.cache_dir)?;
    let store = ObjectStore::open(cache_dir)?;

    if store.is_file_cached(&args.file) {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

fn run_shrink(args: cli::CacheDirArgs) -> Result<ExitCode, ActionError> {
    let cache_dir = cli::resolve_cache_dir(args.cache_dir)?;
    let store = ObjectStore::open(cache_dir)?;
    let prompt = TerminalPrompt::new();

    let summary = shrinker::shrink(&store, &prompt)?;
    tracing::info!(
        removed = summary.removed_actions,
        skipped = summary.skipped_actions,
        quit_early = summary.quit_early,
        swept_objects = summary.swept_objects,
        swept_paths = summary.swept_paths,
        "shrink complete"
    );
    Ok(ExitCode::SUCCESS)
}
