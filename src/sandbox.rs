//! # Sandbox manager
//!
//! Builds the per-action sandbox directory tree `S`, rebases environment
//! paths into it, runs the traced program inside it, and checks the result
//! for hermeticity (`spec.md` §4.4).

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};

use crate::error::ActionResult;

/// `(sandbox_root, input_env) -> output_env`. The default rebasing rule is
/// [`rebase_paths_in_environment`]; callers needing different rebasing
/// semantics can supply their own via [`Sandbox::with_rebase_fn`].
pub type RebaseFn = fn(&Utf8Path, &BTreeMap<String, String>) -> BTreeMap<String, String>;

/// A fatal or advisory finding from [`Sandbox::check_hermetic_files`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HermeticityFinding {
    /// Non-sandboxed access whose content matched the sandbox copy.
    Warning(Utf8PathBuf),
    /// Non-sandboxed access with divergent or missing content. Fatal.
    Fatal(Utf8PathBuf),
}

/// A live sandbox. Its backing temp directory is removed when this value is
/// dropped, per `tempfile::TempDir`'s own `Drop` impl — there is no custom
/// cleanup hook, since "clean up on every exit path including panics" is
/// exactly what `TempDir`'s `Drop` already guarantees.
pub struct Sandbox {
    dir: tempfile::TempDir,
    root: Utf8PathBuf,
    rebase_fn: RebaseFn,
}

impl Sandbox {
    /// Allocate `S` under `cache_dir`, copy every declared input plus
    /// `prog` in at their real absolute paths, and mirror `working_dir`.
    pub fn create(
        cache_dir: &Utf8Path,
        working_dir: &Utf8Path,
        prog: &Utf8Path,
        declared_inputs: &[Utf8PathBuf],
    ) -> ActionResult<Self> {
        Self::create_with_rebase_fn(
            cache_dir,
            working_dir,
            prog,
            declared_inputs,
            rebase_paths_in_environment,
        )
    }

    /// As [`Sandbox::create`], but with a pluggable rebasing function
    /// (`spec.md` §4.4 "The rebasing rule is pluggable").
    pub fn create_with_rebase_fn(
        cache_dir: &Utf8Path,
        working_dir: &Utf8Path,
        prog: &Utf8Path,
        declared_inputs: &[Utf8PathBuf],
        rebase_fn: RebaseFn,
    ) -> ActionResult<Self> {
        std::fs::create_dir_all(cache_dir.as_std_path())?;
        let dir = tempfile::TempDir::new_in(cache_dir.as_std_path())?;
        let root = Utf8PathBuf::try_from(dir.path().to_owned())
            .map_err(|e| crate::error::ActionError::Other(anyhow::anyhow!("non-UTF-8 sandbox root: {e}")))?;

        let sandbox = Sandbox { dir, root, rebase_fn };

        sandbox.mirror_in(prog)?;
        for input in declared_inputs {
            sandbox.mirror_in(input)?;
        }
        std::fs::create_dir_all(sandbox.sandboxed_path(working_dir).as_std_path())?;

        Ok(sandbox)
    }

    /// With a caller-supplied rebasing function.
    pub fn with_rebase_fn(mut self, rebase_fn: RebaseFn) -> Self {
        self.rebase_fn = rebase_fn;
        self
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// `S/<real-absolute-path>`, stripping `real_path`'s leading `/`.
    pub fn sandboxed_path(&self, real_path: &Utf8Path) -> Utf8PathBuf {
        let mut joined = self.root.clone();
        for comp in real_path.components() {
            if let camino::Utf8Component::Normal(s) = comp {
                joined.push(s);
            }
        }
        joined
    }

    fn mirror_in(&self, real_path: &Utf8Path) -> ActionResult<()> {
        let dest = self.sandboxed_path(real_path);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        std::fs::copy(real_path.as_std_path(), dest.as_std_path())?;
        make_owner_writable(&dest)?;
        Ok(())
    }

    /// Rebase `env` into the sandbox using this sandbox's rebasing
    /// function, then run `f` with the rebased environment and the
    /// sandboxed working directory.
    pub fn rebase_env(&self, env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        (self.rebase_fn)(&self.root, env)
    }

    /// Compare every traced path outside `S` against its real-world
    /// content, per `spec.md` §4.4's hermeticity check. `/proc/*` is
    /// excluded from analysis.
    pub fn check_hermetic_files(&self, traced_paths: &[Utf8PathBuf]) -> Vec<HermeticityFinding> {
        let mut findings = Vec::new();

        for path in traced_paths {
            if path.starts_with(&self.root) {
                continue;
            }
            if path.starts_with("/proc") {
                continue;
            }

            let shadow = self.sandboxed_path(path);
            let real_bytes = std::fs::read(path.as_std_path());
            let shadow_bytes = std::fs::read(shadow.as_std_path());

            match (real_bytes, shadow_bytes) {
                (Ok(real), Ok(shadow)) if real == shadow => {
                    findings.push(HermeticityFinding::Warning(path.clone()));
                }
                _ => findings.push(HermeticityFinding::Fatal(path.clone())),
            }
        }

        findings
    }

    /// Copy `S/<declared_path>` out to `declared_path`, creating parent
    /// directories. Path-index touching is the caller's responsibility
    /// (the executor does it once it has the output's content hash).
    pub fn extract(&self, declared_path: &Utf8Path) -> ActionResult<()> {
        let src = self.sandboxed_path(declared_path);
        if let Some(parent) = declared_path.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        std::fs::copy(src.as_std_path(), declared_path.as_std_path())?;
        Ok(())
    }
}

/// Default environment rebasing rule (`spec.md` §4.4): rewrite any value
/// that is itself an absolute path, or that contains `:`-delimited
/// segments beginning with `/` (as in `PATH`), so every such segment is
/// prefixed with `sandbox_root`. Values with no absolute-path segments
/// pass through unchanged.
pub fn rebase_paths_in_environment(
    sandbox_root: &Utf8Path,
    input_env: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    input_env
        .iter()
        .map(|(key, value)| (key.clone(), rebase_value(sandbox_root, value)))
        .collect()
}

fn rebase_value(sandbox_root: &Utf8Path, value: &str) -> String {
    value
        .split(':')
        .map(|segment| {
            if segment.starts_with('/') {
                format!("{}{}", sandbox_root, segment)
            } else {
                segment.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(":")
}

fn make_owner_writable(path: &Utf8Path) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path.as_std_path())?.permissions();
        perms.set_mode(perms.mode() | 0o200);
        std::fs::set_permissions(path.as_std_path(), perms)
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path.as_std_path())?.permissions();
        perms.set_readonly(false);
        std::fs::set_permissions(path.as_std_path(), perms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utf8_tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::try_from(dir.path().to_owned()).unwrap();
        (dir, path)
    }

    #[test]
    fn mirrors_inputs_and_prog_into_sandbox() {
        let (_cache_dir_guard, cache_dir) = utf8_tempdir();
        let (_work_dir_guard, work_dir) = utf8_tempdir();

        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();
        let input = work_dir.join("in.txt");
        std::fs::write(input.as_std_path(), b"data").unwrap();

        let sandbox = Sandbox::create(&cache_dir, &work_dir, &prog, &[input.clone()]).unwrap();

        assert_eq!(std::fs::read(sandbox.sandboxed_path(&prog).as_std_path()).unwrap(), b"binary");
        assert_eq!(std::fs::read(sandbox.sandboxed_path(&input).as_std_path()).unwrap(), b"data");
        assert!(sandbox.sandboxed_path(&work_dir).is_dir());
    }

    #[test]
    fn rebase_rewrites_absolute_path_values_only() {
        let root = Utf8PathBuf::from("/tmp/sandbox-root");
        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), "/home/user".to_string());
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env.insert("NAME".to_string(), "plain-value".to_string());

        let rebased = rebase_paths_in_environment(&root, &env);

        assert_eq!(rebased["HOME"], "/tmp/sandbox-root/home/user");
        assert_eq!(rebased["PATH"], "/tmp/sandbox-root/usr/bin:/tmp/sandbox-root/bin");
        assert_eq!(rebased["NAME"], "plain-value");
    }

    #[test]
    fn hermeticity_check_warns_on_identical_divergence() {
        let (_cache_dir_guard, cache_dir) = utf8_tempdir();
        let (_work_dir_guard, work_dir) = utf8_tempdir();
        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();

        let sandbox = Sandbox::create(&cache_dir, &work_dir, &prog, &[]).unwrap();

        let outside = work_dir.join("outside.txt");
        std::fs::write(outside.as_std_path(), b"same").unwrap();
        let shadow = sandbox.sandboxed_path(&outside);
        std::fs::create_dir_all(shadow.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(shadow.as_std_path(), b"same").unwrap();

        let findings = sandbox.check_hermetic_files(&[outside]);
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0], HermeticityFinding::Warning(_)));
    }

    #[test]
    fn hermeticity_check_fatal_on_divergent_content() {
        let (_cache_dir_guard, cache_dir) = utf8_tempdir();
        let (_work_dir_guard, work_dir) = utf8_tempdir();
        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();

        let sandbox = Sandbox::create(&cache_dir, &work_dir, &prog, &[]).unwrap();

        let outside = work_dir.join("outside.txt");
        std::fs::write(outside.as_std_path(), b"real").unwrap();
        let shadow = sandbox.sandboxed_path(&outside);
        std::fs::create_dir_all(shadow.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(shadow.as_std_path(), b"different").unwrap();

        let findings = sandbox.check_hermetic_files(&[outside]);
        assert_eq!(findings.len(), 1);
        assert!(matches!(findings[0], HermeticityFinding::Fatal(_)));
    }

    #[test]
    fn proc_paths_excluded_from_hermeticity_check() {
        let (_cache_dir_guard, cache_dir) = utf8_tempdir();
        let (_work_dir_guard, work_dir) = utf8_tempdir();
        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();
        let sandbox = Sandbox::create(&cache_dir, &work_dir, &prog, &[]).unwrap();

        let findings = sandbox.check_hermetic_files(&[Utf8PathBuf::from("/proc/self/status")]);
        assert!(findings.is_empty());
    }

    #[test]
    fn paths_inside_sandbox_are_not_flagged() {
        let (_cache_dir_guard, cache_dir) = utf8_tempdir();
        let (_work_dir_guard, work_dir) = utf8_tempdir();
        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();
        let sandbox = Sandbox::create(&cache_dir, &work_dir, &prog, &[]).unwrap();

        let inside = sandbox.sandboxed_path(&prog);
        let findings = sandbox.check_hermetic_files(&[inside]);
        assert!(findings.is_empty());
    }

    #[test]
    fn extract_copies_sandbox_output_to_real_path() {
        let (_cache_dir_guard, cache_dir) = utf8_tempdir();
        let (_work_dir_guard, work_dir) = utf8_tempdir();
        let prog = work_dir.join("prog");
        std::fs::write(prog.as_std_path(), b"binary").unwrap();
        let sandbox = Sandbox::create(&cache_dir, &work_dir, &prog, &[]).unwrap();

        let declared_output = work_dir.join("out/result.txt");
        let sandboxed_output = sandbox.sandboxed_path(&declared_output);
        std::fs::create_dir_all(sandboxed_output.parent().unwrap().as_std_path()).unwrap();
        std::fs::write(sandboxed_output.as_std_path(), b"produced").unwrap();

        sandbox.extract(&declared_output).unwrap();
        assert_eq!(std::fs::read(declared_output.as_std_path()).unwrap(), b"produced");
    }
}
