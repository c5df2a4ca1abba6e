//! # Executor
//!
//! Orchestrates a single action: cache lookup, and on a miss, sandboxed
//! execution, trace folding, hermeticity and declaration checking, caching,
//! and publishing (`spec.md` §4.5).

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::action_key::{self, ActionKeyInputs};
use crate::digest::Digest;
use crate::error::{ActionError, ActionResult};
use crate::manifest::{Manifest, ManifestEntry};
use crate::object_store::ObjectStore;
use crate::sandbox::Sandbox;
use crate::timed_span;
use crate::trace_fsm::{self, TraceEvent};
use crate::tracer::CommandTracer;

/// Everything needed to run or replay one action.
pub struct ExecuteRequest<'a> {
    pub working_dir: &'a Utf8Path,
    pub env: &'a BTreeMap<String, String>,
    pub prog: &'a Utf8Path,
    pub args: &'a [String],
    pub declared_inputs: &'a [Utf8PathBuf],
    pub declared_outputs: &'a [Utf8PathBuf],
}

/// What happened when [`execute`] ran, for the CLI to report.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Hit { action_id: Digest },
    Miss {
        action_id: Digest,
        traced_input_count: usize,
        traced_output_count: usize,
    },
}

/// Run `execute(env, prog, args, declared_inputs, declared_outputs,
/// cache_dir)` per `spec.md` §4.5's control flow.
pub fn execute(
    store: &ObjectStore,
    tracer: &dyn CommandTracer,
    request: ExecuteRequest<'_>,
) -> ActionResult<ExecutionOutcome> {
    let _timing = timed_span!(tracing::Level::INFO, "execute", prog = %request.prog);

    let key = action_key::compute(
        store,
        ActionKeyInputs {
            working_dir: request.working_dir,
            env: request.env,
            prog: request.prog,
            args: request.args,
            declared_inputs: request.declared_inputs,
        },
    )?;

    let action_path = store.action_path(&key.action_id);
    if action_path.exists() {
        replay_hit(store, &key, &action_path)?;
        return Ok(ExecutionOutcome::Hit { action_id: key.action_id });
    }

    let (traced_input_count, traced_output_count) = run_miss(store, tracer, &request, &key)?;
    Ok(ExecutionOutcome::Miss {
        action_id: key.action_id,
        traced_input_count,
        traced_output_count,
    })
}

/// Parse the six recorded digests, verify the first five match what we just
/// computed (any mismatch means the record is corrupt), and restore every
/// output from the recorded outputs manifest.
fn replay_hit(store: &ObjectStore, key: &action_key::ActionKey, action_path: &Utf8Path) -> ActionResult<()> {
    let line = std::fs::read_to_string(action_path.as_std_path())?;
    let digests = parse_action_record(line.trim_end())?;

    verify_matches("wd", &digests.wd, &key.wd_digest)?;
    verify_matches("env", &digests.env, &key.env_digest)?;
    verify_matches("prog", &digests.prog, &key.prog_digest)?;
    verify_matches("args", &digests.args, &key.args_digest)?;
    verify_matches("inputs-manifest", &digests.inputs_manifest, &key.inputs_manifest_digest)?;

    let outputs_bytes = store.read_object(&digests.outputs_manifest)?;
    let outputs_manifest = Manifest::parse(&outputs_bytes)?;
    for entry in outputs_manifest.entries() {
        store.extract_object(&entry.hash, &entry.path)?;
        store.touch_path_index(&entry.path, &entry.hash, entry.size)?;
    }

    Ok(())
}

fn verify_matches(field: &'static str, expected: &Digest, actual: &Digest) -> ActionResult<()> {
    if expected != actual {
        return Err(ActionError::HashMismatch {
            field,
            expected: expected.to_hex(),
            actual: actual.to_hex(),
        });
    }
    Ok(())
}

pub(crate) struct ActionRecordDigests {
    pub wd: Digest,
    pub env: Digest,
    pub prog: Digest,
    pub args: Digest,
    pub inputs_manifest: Digest,
    pub outputs_manifest: Digest,
}

pub(crate) fn parse_action_record(line: &str) -> ActionResult<ActionRecordDigests> {
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() != 6 {
        return Err(ActionError::Other(anyhow::anyhow!(
            "action record has {} fields, expected 6: {line:?}",
            fields.len()
        )));
    }
    let parse = |s: &str| -> ActionResult<Digest> {
        s.parse()
            .map_err(|e| ActionError::Other(anyhow::anyhow!("malformed action record digest: {e}")))
    };
    Ok(ActionRecordDigests {
        wd: parse(fields[0])?,
        env: parse(fields[1])?,
        prog: parse(fields[2])?,
        args: parse(fields[3])?,
        inputs_manifest: parse(fields[4])?,
        outputs_manifest: parse(fields[5])?,
    })
}

fn run_miss(
    store: &ObjectStore,
    tracer: &dyn CommandTracer,
    request: &ExecuteRequest<'_>,
    key: &action_key::ActionKey,
) -> ActionResult<(usize, usize)> {
    let sandbox = Sandbox::create(store.root(), request.working_dir, request.prog, request.declared_inputs)?;
    let rebased_env = sandbox.rebase_env(request.env);

    let sandboxed_prog = sandbox.sandboxed_path(request.prog);
    let sandboxed_wd = sandbox.sandboxed_path(request.working_dir);
    let events = tracer.trace(&sandboxed_prog, request.args, &sandboxed_wd, &rebased_env)?;

    let states = trace_fsm::fold(&events)?;
    let (sandboxed_inputs, sandboxed_outputs) = trace_fsm::classify(&states);

    let traced_inputs = strip_sandbox_prefix(&sandbox, &sandboxed_inputs);
    let traced_outputs = strip_sandbox_prefix(&sandbox, &sandboxed_outputs);

    check_hermeticity(&sandbox, &sandboxed_inputs)?;
    check_hermeticity(&sandbox, &sandboxed_outputs)?;

    check_undeclared_inputs(request.declared_inputs, &traced_inputs)?;
    warn_on_untouched_declared_inputs(request.declared_inputs, &traced_inputs);
    check_missing_outputs(request.declared_outputs, &traced_outputs)?;

    // Caching traced inputs ingests their content into the object store;
    // the resulting manifest digest isn't persisted separately since the
    // action record's input key is already pinned by `key.inputs_manifest`.
    let _traced_inputs_manifest = cache_traced_paths(store, &sandbox, &traced_inputs)?;
    let outputs_manifest = cache_traced_paths(store, &sandbox, &traced_outputs)?;
    let outputs_manifest_digest = store.write_object(&outputs_manifest.to_bytes())?;

    for entry in outputs_manifest.entries() {
        sandbox.extract(&entry.path)?;
        store.touch_path_index(&entry.path, &entry.hash, entry.size)?;
    }

    let record = format!(
        "{}|{}|{}|{}|{}|{}\n",
        key.wd_digest,
        key.env_digest,
        key.prog_digest,
        key.args_digest,
        key.inputs_manifest_digest,
        outputs_manifest_digest,
    );
    let action_path = store.action_path(&key.action_id);
    write_action_record(&action_path, &record)?;

    Ok((traced_inputs.len(), traced_outputs.len()))
}

/// Traced paths under `S` are rewritten back to their real absolute form;
/// traced paths outside `S` are non-hermetic accesses and are passed
/// through unchanged (`spec.md` §4.5 step 6, "after stripping the `S`
/// prefix").
fn strip_sandbox_prefix(sandbox: &Sandbox, sandboxed_paths: &[Utf8PathBuf]) -> Vec<Utf8PathBuf> {
    sandboxed_paths
        .iter()
        .map(|p| {
            if p.starts_with(sandbox.root()) {
                pathdiff::diff_utf8_paths(p, sandbox.root())
                    .map(|rel| Utf8PathBuf::from(format!("/{rel}")))
                    .unwrap_or_else(|| p.clone())
            } else {
                p.clone()
            }
        })
        .collect()
}

fn check_hermeticity(sandbox: &Sandbox, sandboxed_paths: &[Utf8PathBuf]) -> ActionResult<()> {
    let findings = sandbox.check_hermetic_files(sandboxed_paths);
    for finding in findings {
        match finding {
            crate::sandbox::HermeticityFinding::Warning(path) => {
                tracing::warn!(path = %path, "non-hermetic access with identical content");
            }
            crate::sandbox::HermeticityFinding::Fatal(path) => {
                return Err(ActionError::NonHermeticDivergent(path));
            }
        }
    }
    Ok(())
}

/// Any traced input not in the declared set (outside `/proc/*`) is fatal
/// (`spec.md` §4.5 step 6).
fn check_undeclared_inputs(declared_inputs: &[Utf8PathBuf], traced_inputs: &[Utf8PathBuf]) -> ActionResult<()> {
    for traced in traced_inputs {
        if traced.starts_with("/proc") {
            continue;
        }
        if !declared_inputs.contains(traced) {
            return Err(ActionError::UndeclaredInput(traced.clone()));
        }
    }
    Ok(())
}

/// Declared inputs that were never touched by the traced program. The spec
/// calls this out as "currently unimplemented" upstream; here it's a
/// non-fatal warning hook rather than a silent no-op.
fn warn_on_untouched_declared_inputs(declared_inputs: &[Utf8PathBuf], traced_inputs: &[Utf8PathBuf]) {
    for declared in declared_inputs {
        if !traced_inputs.contains(declared) {
            tracing::warn!(path = %declared, "declared input was never touched by the traced program");
        }
    }
}

fn check_missing_outputs(declared_outputs: &[Utf8PathBuf], traced_outputs: &[Utf8PathBuf]) -> ActionResult<()> {
    for declared in declared_outputs {
        if !traced_outputs.contains(declared) {
            return Err(ActionError::MissingOutput(declared.clone()));
        }
    }
    Ok(())
}

/// Cache each traced path's sandboxed content and build its manifest.
fn cache_traced_paths(store: &ObjectStore, sandbox: &Sandbox, real_paths: &[Utf8PathBuf]) -> ActionResult<Manifest> {
    let mut entries = Vec::with_capacity(real_paths.len());
    for real_path in real_paths {
        let sandboxed = sandbox.sandboxed_path(real_path);
        let (hash, size) = store.cache_file(&sandboxed, Some(real_path))?;
        entries.push(ManifestEntry {
            path: real_path.clone(),
            hash,
            size,
        });
    }
    Ok(Manifest::new(entries))
}

fn write_action_record(action_path: &Utf8Path, record: &str) -> ActionResult<()> {
    if let Some(parent) = action_path.parent() {
        std::fs::create_dir_all(parent.as_std_path())?;
    }
    let mut tmp = tempfile::NamedTempFile::new_in(action_path.parent().unwrap().as_std_path())?;
    use std::io::Write as _;
    tmp.write_all(record.as_bytes())?;
    tmp.flush()?;
    tmp.persist(action_path.as_std_path())
        .map_err(|e| ActionError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::ScriptedTracer;

    fn open_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        let store = ObjectStore::open(root).unwrap();
        (dir, store)
    }

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        (dir, path)
    }

    /// A tracer that, given the sandboxed working directory it's invoked
    /// with, derives the sandbox root (by stripping the mirrored real
    /// working-directory suffix) and reports reads/writes against the
    /// sandboxed copies of the given real paths — standing in for what a
    /// real `cp`-style invocation traced inside the sandbox would report.
    struct CopyingScriptedTracer {
        real_working_dir: Utf8PathBuf,
        real_input: Utf8PathBuf,
        real_output: Utf8PathBuf,
    }

    impl CommandTracer for CopyingScriptedTracer {
        fn trace(
            &self,
            _prog: &Utf8Path,
            _args: &[String],
            sandboxed_working_dir: &Utf8Path,
            _env: &BTreeMap<String, String>,
        ) -> ActionResult<Vec<TraceEvent>> {
            let mirrored_wd = crate::object_store::mirror_relative(&self.real_working_dir);
            let root = sandboxed_working_dir
                .as_str()
                .strip_suffix(mirrored_wd.as_str())
                .map(|s| s.trim_end_matches('/'))
                .expect("sandboxed working dir must end with the mirrored real working dir");
            let root = Utf8PathBuf::from(root);

            let sandboxed = |real: &Utf8Path| -> Utf8PathBuf {
                let mut joined = root.clone();
                for comp in real.components() {
                    if let camino::Utf8Component::Normal(s) = comp {
                        joined.push(s);
                    }
                }
                joined
            };

            let sandboxed_out = sandboxed(&self.real_output);
            std::fs::write(sandboxed_out.as_std_path(), b"payload").unwrap();

            Ok(vec![
                TraceEvent::Read(sandboxed(&self.real_input)),
                TraceEvent::Write(sandboxed_out),
            ])
        }
    }

    /// `spec.md` §8 scenario 1: fresh miss, then a hit on replay.
    #[test]
    fn miss_then_hit_on_replay() {
        let (_store_guard, store) = open_store();
        let (_work_guard, work_dir) = utf8_tempdir();

        let prog = work_dir.join("cp");
        std::fs::write(prog.as_std_path(), b"fake-cp-binary").unwrap();
        let input = work_dir.join("in.txt");
        std::fs::write(input.as_std_path(), b"payload").unwrap();
        let output = work_dir.join("out.txt");

        let env = BTreeMap::new();
        let declared_inputs = vec![input.clone()];
        let declared_outputs = vec![output.clone()];

        let tracer = CopyingScriptedTracer {
            real_working_dir: work_dir.clone(),
            real_input: input.clone(),
            real_output: output.clone(),
        };

        let outcome = execute(
            &store,
            &tracer,
            ExecuteRequest {
                working_dir: &work_dir,
                env: &env,
                prog: &prog,
                args: &[],
                declared_inputs: &declared_inputs,
                declared_outputs: &declared_outputs,
            },
        )
        .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Miss { .. }));
        assert_eq!(std::fs::read(output.as_std_path()).unwrap(), b"payload");

        // Replay: same components, now a hit, and the output is restored
        // again (this time straight from the object store).
        std::fs::remove_file(output.as_std_path()).unwrap();
        let outcome = execute(
            &store,
            &tracer,
            ExecuteRequest {
                working_dir: &work_dir,
                env: &env,
                prog: &prog,
                args: &[],
                declared_inputs: &declared_inputs,
                declared_outputs: &declared_outputs,
            },
        )
        .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Hit { .. }));
        assert_eq!(std::fs::read(output.as_std_path()).unwrap(), b"payload");
    }

    /// `spec.md` §8 scenario 3: an undeclared input access is fatal.
    #[test]
    fn undeclared_input_is_rejected() {
        let (_store_guard, store) = open_store();
        let (_work_guard, work_dir) = utf8_tempdir();

        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();
        let undeclared = work_dir.join("sneaky.txt");
        std::fs::write(undeclared.as_std_path(), b"data").unwrap();

        struct SneakyTracer {
            real_working_dir: Utf8PathBuf,
            real_undeclared: Utf8PathBuf,
        }
        impl CommandTracer for SneakyTracer {
            fn trace(
                &self,
                _prog: &Utf8Path,
                _args: &[String],
                sandboxed_working_dir: &Utf8Path,
                _env: &BTreeMap<String, String>,
            ) -> ActionResult<Vec<TraceEvent>> {
                let mirrored_wd = crate::object_store::mirror_relative(&self.real_working_dir);
                let root = sandboxed_working_dir
                    .as_str()
                    .strip_suffix(mirrored_wd.as_str())
                    .map(|s| s.trim_end_matches('/'))
                    .unwrap();
                let mut joined = Utf8PathBuf::from(root);
                for comp in self.real_undeclared.components() {
                    if let camino::Utf8Component::Normal(s) = comp {
                        joined.push(s);
                    }
                }
                // Reported as a read inside the sandbox (so it passes the
                // hermeticity check trivially) but was never declared, so
                // it must still be rejected.
                Ok(vec![TraceEvent::Read(joined)])
            }
        }

        let env = BTreeMap::new();
        let tracer = SneakyTracer {
            real_working_dir: work_dir.clone(),
            real_undeclared: undeclared,
        };

        let err = execute(
            &store,
            &tracer,
            ExecuteRequest {
                working_dir: &work_dir,
                env: &env,
                prog: &prog,
                args: &[],
                declared_inputs: &[],
                declared_outputs: &[],
            },
        )
        .unwrap_err();
        assert!(matches!(err, ActionError::UndeclaredInput(_)));
    }

    #[test]
    fn parse_action_record_rejects_wrong_field_count() {
        assert!(parse_action_record("a|b|c").is_err());
    }

    #[test]
    fn hit_detects_corrupted_record_as_hash_mismatch() {
        let (_store_guard, store) = open_store();
        let (_work_guard, work_dir) = utf8_tempdir();

        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();
        let env = BTreeMap::new();

        let key = action_key::compute(
            &store,
            ActionKeyInputs {
                working_dir: &work_dir,
                env: &env,
                prog: &prog,
                args: &[],
                declared_inputs: &[],
            },
        )
        .unwrap();

        let action_path = store.action_path(&key.action_id);
        std::fs::create_dir_all(action_path.parent().unwrap().as_std_path()).unwrap();
        let bogus = Digest::of_bytes(b"not-the-real-digest");
        std::fs::write(
            action_path.as_std_path(),
            format!("{bogus}|{}|{}|{}|{}|{bogus}\n", key.env_digest, key.prog_digest, key.args_digest, key.inputs_manifest_digest),
        )
        .unwrap();

        let err = replay_hit(&store, &key, &action_path).unwrap_err();
        assert!(matches!(err, ActionError::HashMismatch { .. }));
    }
}
