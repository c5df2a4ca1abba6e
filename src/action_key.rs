//! # Action keying
//!
//! An action is the tuple `(WD, ENV, PROG, ARGS, INPUTS)` (`spec.md` §4.3).
//! Each component is canonicalized to a byte string, persisted as an object,
//! and the five resulting digests are concatenated and hashed again to
//! produce the action identifier — the same digest under which the action's
//! record eventually lives in `actions/`.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::digest::Digest;
use crate::error::ActionResult;
use crate::manifest::{Manifest, ManifestEntry};
use crate::object_store::ObjectStore;

/// The raw components of an action, before canonicalization.
pub struct ActionKeyInputs<'a> {
    pub working_dir: &'a Utf8Path,
    pub env: &'a BTreeMap<String, String>,
    pub prog: &'a Utf8Path,
    pub args: &'a [String],
    /// Absolute paths of declared inputs. `PROG` is hashed separately and
    /// folded into the inputs manifest alongside these.
    pub declared_inputs: &'a [Utf8PathBuf],
}

/// The five sub-digests plus the action identifier, all already persisted
/// as objects by the time this is returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionKey {
    pub action_id: Digest,
    pub wd_digest: Digest,
    pub env_digest: Digest,
    pub prog_digest: Digest,
    pub args_digest: Digest,
    pub inputs_manifest_digest: Digest,
    pub inputs_manifest: Manifest,
}

/// Canonicalize and hash an action's components (`spec.md` §4.3). Creates
/// objects for `wd`, `env`, `prog`, `args`, `inputs-manifest`, and the
/// identifier itself as a side effect — this happens on both hit and miss,
/// since the identifier can't be known before it does.
pub fn compute(store: &ObjectStore, inputs: ActionKeyInputs<'_>) -> ActionResult<ActionKey> {
    let wd_bytes = format!("{}\n", inputs.working_dir);
    let wd_digest = store.write_object(wd_bytes.as_bytes())?;

    let env_bytes = canonical_env(inputs.env);
    let env_digest = store.write_object(env_bytes.as_bytes())?;

    let prog_abs = resolve_real_path(inputs.prog)?;
    let (prog_digest, prog_size) = store.cache_file(&prog_abs, None)?;

    let args_bytes = canonical_args(inputs.args);
    let args_digest = store.write_object(args_bytes.as_bytes())?;

    let mut entries = Vec::with_capacity(inputs.declared_inputs.len() + 1);
    entries.push(ManifestEntry {
        path: prog_abs.clone(),
        hash: prog_digest,
        size: prog_size,
    });
    for input in inputs.declared_inputs {
        let abs = resolve_real_path(input)?;
        let (hash, size) = store.cache_file(&abs, None)?;
        entries.push(ManifestEntry { path: abs, hash, size });
    }
    let inputs_manifest = Manifest::new(entries);
    let inputs_manifest_digest = store.write_object(&inputs_manifest.to_bytes())?;

    let key_line = format!(
        "{wd_digest}.{env_digest}.{prog_digest}.{args_digest}.{inputs_manifest_digest}\n"
    );
    let action_id = store.write_object(key_line.as_bytes())?;

    Ok(ActionKey {
        action_id,
        wd_digest,
        env_digest,
        prog_digest,
        args_digest,
        inputs_manifest_digest,
        inputs_manifest,
    })
}

fn canonical_env(env: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in env {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

fn canonical_args(args: &[String]) -> String {
    let mut out = String::new();
    for arg in args {
        out.push_str(arg);
        out.push('\n');
    }
    out
}

/// Resolve a path to its canonical absolute form, the way `PROG` and
/// declared inputs are keyed (`spec.md` §4.3 "resolved to an absolute real
/// path").
fn resolve_real_path(path: &Utf8Path) -> ActionResult<Utf8PathBuf> {
    let canonical = std::fs::canonicalize(path.as_std_path())?;
    Ok(Utf8PathBuf::try_from(canonical)
        .map_err(|e| crate::error::ActionError::Other(anyhow::anyhow!("non-UTF-8 path: {e}")))?)
}
