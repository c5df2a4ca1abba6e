//! # CLI surface (`spec.md` §6)
//!
//! Argument parsing and subcommand dispatch for the `artifact-executor`
//! binary. This module is the CLI glue the component table in `spec.md`
//! §2 calls an external collaborator to the cache/executor/shrinker core:
//! it loads manifests from disk and env vars and calls straight into
//! [`crate::executor`], [`crate::object_store`], and [`crate::shrinker`].

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};

use crate::logging::{LogFormat, LogLevel};

#[derive(Parser)]
#[command(name = "artifact-executor", about = "Content-addressed action cache and sandboxed executor")]
pub struct Cli {
    /// Logging verbosity, per `spec.md` §9's "runtime-configurable logging
    /// verbosity" redesign note.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: LogLevel,

    /// Logging output format.
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Replay a cached action or execute and cache it (`spec.md` §4.5).
    #[command(visible_aliases = ["exec", "artifact-execute"])]
    Execute(ExecuteArgs),
    /// Ingest a single file into the object store (`spec.md` §4.1).
    #[command(name = "cache-file")]
    CacheFile(CacheFileArgs),
    /// Exit 0 iff a file's fast-path cache stamp is current (`spec.md` §4.1).
    #[command(name = "is-cached")]
    IsCached(IsCachedArgs),
    /// Interactively remove cached actions and reclaim unreferenced objects
    /// (`spec.md` §4.6).
    Shrink(CacheDirArgs),
}

#[derive(Args)]
pub struct CacheDirArgs {
    #[arg(short = 'c', long = "cache", visible_alias = "cache-dir")]
    pub cache_dir: Option<Utf8PathBuf>,
}

#[derive(Args)]
pub struct ExecuteArgs {
    #[arg(short = 'c', long = "cache", visible_alias = "cache-dir")]
    pub cache_dir: Option<Utf8PathBuf>,

    #[arg(short = 'e', long = "env", visible_aliases = ["environment", "environment-manifest"])]
    pub env: Option<Utf8PathBuf>,

    #[arg(short = 'p', long = "program", visible_alias = "executable")]
    pub program: Option<Utf8PathBuf>,

    #[arg(short = 'a', long = "args", visible_alias = "arguments-manifest")]
    pub args: Option<Utf8PathBuf>,

    #[arg(short = 'i', long = "inputs", visible_alias = "inputs-manifest")]
    pub inputs: Option<Utf8PathBuf>,

    #[arg(short = 'o', long = "outputs", visible_alias = "outputs-manifest")]
    pub outputs: Option<Utf8PathBuf>,
}

#[derive(Args)]
pub struct CacheFileArgs {
    #[arg(short = 'c', long = "cache", visible_alias = "cache-dir")]
    pub cache_dir: Option<Utf8PathBuf>,

    #[arg(short = 'f', short_alias = 'i', long = "file", visible_alias = "input")]
    pub file: Utf8PathBuf,

    #[arg(short = 'p', short_alias = 'r', long = "path", visible_alias = "real-path")]
    pub real_path: Option<Utf8PathBuf>,
}

#[derive(Args)]
pub struct IsCachedArgs {
    #[arg(short = 'c', long = "cache", visible_alias = "cache-dir")]
    pub cache_dir: Option<Utf8PathBuf>,

    #[arg(short = 'f', short_alias = 'i', long = "file", visible_alias = "input")]
    pub file: Utf8PathBuf,
}

/// Resolve the cache directory from a flag, falling back to
/// `ARTIFACT_EXECUTOR_CACHE` (`spec.md` §6). A missing cache directory
/// with no fallback is a `ConfigError`.
pub fn resolve_cache_dir(flag: Option<Utf8PathBuf>) -> crate::error::ActionResult<Utf8PathBuf> {
    if let Some(path) = flag {
        return Ok(path);
    }
    std::env::var("ARTIFACT_EXECUTOR_CACHE")
        .map(Utf8PathBuf::from)
        .map_err(|_| {
            crate::error::ActionError::ConfigError(
                "cache directory not given via -c/--cache and ARTIFACT_EXECUTOR_CACHE is unset".to_string(),
            )
        })
}

fn resolve_path_flag(flag: Option<Utf8PathBuf>, env_var: &str) -> Option<Utf8PathBuf> {
    flag.or_else(|| std::env::var(env_var).ok().map(Utf8PathBuf::from))
}

/// Load a sorted `KEY=VALUE` environment manifest (`spec.md` §3).
pub fn load_env_manifest(path: &Utf8PathBuf) -> crate::error::ActionResult<BTreeMap<String, String>> {
    let text = read_manifest_file(path)?;
    let mut env = BTreeMap::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| {
            crate::error::ActionError::ConfigError(format!("malformed environment manifest line: {line:?}"))
        })?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}

/// Load a one-argument-per-line arguments manifest, preserving order
/// (`spec.md` §3).
pub fn load_args_manifest(path: &Utf8PathBuf) -> crate::error::ActionResult<Vec<String>> {
    let text = read_manifest_file(path)?;
    Ok(text.lines().filter(|l| !l.is_empty()).map(str::to_owned).collect())
}

/// Load a one-absolute-path-per-line inputs/outputs manifest (`spec.md`
/// §6). Distinct from [`crate::manifest::Manifest`], which additionally
/// carries hash/size — the CLI-facing manifest is just declared paths.
pub fn load_path_list(path: &Utf8PathBuf) -> crate::error::ActionResult<Vec<Utf8PathBuf>> {
    let text = read_manifest_file(path)?;
    Ok(text.lines().filter(|l| !l.is_empty()).map(Utf8PathBuf::from).collect())
}

fn read_manifest_file(path: &Utf8PathBuf) -> crate::error::ActionResult<String> {
    std::fs::read_to_string(path.as_std_path()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            crate::error::ActionError::ConfigError(format!("manifest file not found: {path}"))
        } else {
            crate::error::ActionError::Io(e)
        }
    })
}

impl ExecuteArgs {
    pub fn resolved_env_path(&self) -> Option<Utf8PathBuf> {
        resolve_path_flag(self.env.clone(), "ARTIFACT_EXECUTOR_ENV")
    }
    pub fn resolved_program_path(&self) -> Option<Utf8PathBuf> {
        resolve_path_flag(self.program.clone(), "ARTIFACT_EXECUTOR_PROGRAM")
    }
    pub fn resolved_args_path(&self) -> Option<Utf8PathBuf> {
        resolve_path_flag(self.args.clone(), "ARTIFACT_EXECUTOR_ARGS")
    }
    pub fn resolved_inputs_path(&self) -> Option<Utf8PathBuf> {
        resolve_path_flag(self.inputs.clone(), "ARTIFACT_EXECUTOR_INPUTS")
    }
    pub fn resolved_outputs_path(&self) -> Option<Utf8PathBuf> {
        resolve_path_flag(self.outputs.clone(), "ARTIFACT_EXECUTOR_OUTPUTS")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_env_manifest_parses_key_value_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("env")).unwrap();
        std::fs::write(path.as_std_path(), "A=1\nB=two\n").unwrap();

        let env = load_env_manifest(&path).unwrap();
        assert_eq!(env.get("A").unwrap(), "1");
        assert_eq!(env.get("B").unwrap(), "two");
    }

    #[test]
    fn load_args_manifest_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().join("args")).unwrap();
        std::fs::write(path.as_std_path(), "--flag\nvalue\n").unwrap();

        let args = load_args_manifest(&path).unwrap();
        assert_eq!(args, vec!["--flag".to_string(), "value".to_string()]);
    }

    #[test]
    fn resolve_cache_dir_prefers_flag_over_env() {
        let flag = Some(Utf8PathBuf::from("/from-flag"));
        assert_eq!(resolve_cache_dir(flag).unwrap(), Utf8PathBuf::from("/from-flag"));
    }
}
