//! # Content-addressed object store
//!
//! Backs the `objects/` and `path-index/` trees of a cache root
//! (`spec.md` §3, §4.1).
//!
//! ## Correctness guarantees
//!
//! 1. **Bit-exact content addressing.** Every object is named by the
//!    SHA-256 of its exact byte contents, hex-encoded lowercase. Replay
//!    depends on rehashing declared inputs and matching a stored digest, so
//!    this uses a cryptographic hash rather than a cheaper heuristic.
//!
//! 2. **At-most-once content copy per distinct content**, modulo the races
//!    described in `spec.md` §5 (two concurrent executors may both copy the
//!    same digest; since the destination path is a function of content, the
//!    result is idempotent).
//!
//! 3. **Atomic object writes.** Content lands in `objects/<h>` via a
//!    same-directory temp file plus rename, so a process killed mid-copy
//!    never leaves a partially-written object visible under its final name
//!    (`spec.md` §9: "use atomic rename from a temp sibling ... current
//!    source copies directly").
//!
//! 4. **Advisory path index.** `path-index/<alias>` entries are a stamp of
//!    the last observed `(hash, size)` for `alias`; they are trusted only
//!    while their mtime is newer than the real file's mtime.
//!
//! ## Known limitations
//!
//! The fast path in [`ObjectStore::cache_file`] can return a stale
//! `(hash, size)` if the caller mutated `real_path` without updating its
//! mtime. This is documented behavior, not a bug (`spec.md` §4.1).

use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use pathdiff::diff_utf8_paths;

use crate::digest::Digest;
use crate::error::{ActionError, ActionResult};

pub struct ObjectStore {
    root: Utf8PathBuf,
}

impl ObjectStore {
    /// Open a cache root, creating `objects/`, `path-index/`, and
    /// `actions/` if they don't already exist (`spec.md` §4.5 step 1).
    pub fn open(root: impl Into<Utf8PathBuf>) -> ActionResult<Self> {
        let root = root.into();
        let store = ObjectStore { root };
        std::fs::create_dir_all(store.objects_dir().as_std_path())?;
        std::fs::create_dir_all(store.path_index_dir().as_std_path())?;
        std::fs::create_dir_all(store.actions_dir().as_std_path())?;
        Ok(store)
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn objects_dir(&self) -> Utf8PathBuf {
        self.root.join("objects")
    }

    pub fn path_index_dir(&self) -> Utf8PathBuf {
        self.root.join("path-index")
    }

    pub fn actions_dir(&self) -> Utf8PathBuf {
        self.root.join("actions")
    }

    pub fn object_path(&self, digest: &Digest) -> Utf8PathBuf {
        self.objects_dir().join(digest.to_hex())
    }

    pub fn action_path(&self, action_id: &Digest) -> Utf8PathBuf {
        self.actions_dir().join(action_id.to_hex())
    }

    fn path_index_entry(&self, alias_path: &Utf8Path) -> Utf8PathBuf {
        self.path_index_dir().join(mirror_relative(alias_path))
    }

    // -----------------------------------------------------------------------
    // Ingest
    // -----------------------------------------------------------------------

    /// Ingest `real_path`'s content into the store, recording its stamp at
    /// `alias_path` (or `real_path` itself if no alias is given).
    ///
    /// Takes the fast path described in `spec.md` §4.1 when the path-index
    /// entry for the alias is newer than `real_path`'s mtime; otherwise
    /// rehashes the file.
    pub fn cache_file(
        &self,
        real_path: &Utf8Path,
        alias_path: Option<&Utf8Path>,
    ) -> ActionResult<(Digest, u64)> {
        let alias_path = alias_path.unwrap_or(real_path);
        let index_entry = self.path_index_entry(alias_path);

        if let Some((hash, size)) = self.fast_path_stamp(&index_entry, real_path)? {
            if !self.object_path(&hash).exists() {
                self.ingest_object_from_file(real_path, &hash)?;
            }
            return Ok((hash, size));
        }

        let hash = Digest::of_file(real_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ActionError::NotFound(real_path.to_owned())
            } else {
                ActionError::Io(e)
            }
        })?;
        let size = std::fs::metadata(real_path.as_std_path())?.len();

        if !self.object_path(&hash).exists() {
            self.ingest_object_from_file(real_path, &hash)?;
        }

        self.write_path_index_entry(&index_entry, &hash, size)?;
        Ok((hash, size))
    }

    /// Returns `true` iff `path` exists and its path-index entry exists and
    /// is strictly newer than `path`'s own mtime.
    pub fn is_file_cached(&self, path: &Utf8Path) -> bool {
        let index_entry = self.path_index_entry(path);
        matches!(self.fast_path_stamp(&index_entry, path), Ok(Some(_)))
    }

    fn fast_path_stamp(
        &self,
        index_entry: &Utf8Path,
        real_path: &Utf8Path,
    ) -> ActionResult<Option<(Digest, u64)>> {
        let Ok(real_meta) = std::fs::metadata(real_path.as_std_path()) else {
            return Ok(None);
        };
        let Ok(index_meta) = std::fs::metadata(index_entry.as_std_path()) else {
            return Ok(None);
        };

        let real_mtime = real_meta.modified()?;
        let index_mtime = index_meta.modified()?;
        if index_mtime <= real_mtime {
            return Ok(None);
        }

        let line = std::fs::read_to_string(index_entry.as_std_path())?;
        match parse_stamp_line(line.trim_end()) {
            Some(stamp) => Ok(Some(stamp)),
            None => Ok(None),
        }
    }

    fn write_path_index_entry(&self, index_entry: &Utf8Path, hash: &Digest, size: u64) -> ActionResult<()> {
        if let Some(parent) = index_entry.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        std::fs::write(index_entry.as_std_path(), format!("{hash}|{size}\n"))?;
        Ok(())
    }

    /// Overwrite the path-index entry for `path` with `(hash, size)` and
    /// ensure the entry's mtime is at least as new as `path`'s own mtime —
    /// used after extracting a cached output so the next `cache_file` call
    /// takes the fast path (`spec.md` §4.4 "Extraction").
    pub fn touch_path_index(&self, path: &Utf8Path, hash: &Digest, size: u64) -> ActionResult<()> {
        let index_entry = self.path_index_entry(path);
        self.write_path_index_entry(&index_entry, hash, size)?;

        // Ensure the entry's mtime strictly dominates the real file's mtime
        // even when both were just written within the same timestamp
        // quantum: bump the index file's mtime forward explicitly.
        if let Ok(real_meta) = std::fs::metadata(path.as_std_path()) {
            if let Ok(real_mtime) = real_meta.modified() {
                let newer = real_mtime + std::time::Duration::from_secs(1);
                let file = std::fs::OpenOptions::new().write(true).open(index_entry.as_std_path())?;
                let _ = file.set_modified(newer);
            }
        }
        Ok(())
    }

    fn ingest_object_from_file(&self, real_path: &Utf8Path, hash: &Digest) -> ActionResult<()> {
        let bytes = std::fs::read(real_path.as_std_path())?;
        self.write_object_bytes(hash, &bytes)
    }

    /// Content-address an in-memory byte slice, persisting it as an object
    /// if not already present, and return its digest. Used for the action
    /// keying sub-digests and manifests (`spec.md` §4.3), which are
    /// canonicalized in memory before being made objects.
    pub fn write_object(&self, bytes: &[u8]) -> ActionResult<Digest> {
        let hash = Digest::of_bytes(bytes);
        self.write_object_bytes(&hash, bytes)?;
        Ok(hash)
    }

    fn write_object_bytes(&self, hash: &Digest, bytes: &[u8]) -> ActionResult<()> {
        let dest = self.object_path(hash);
        if dest.exists() {
            return Ok(());
        }

        std::fs::create_dir_all(self.objects_dir().as_std_path())?;
        let mut tmp = tempfile::NamedTempFile::new_in(self.objects_dir().as_std_path())?;
        tmp.write_all(bytes)?;
        tmp.flush()?;

        match tmp.persist(dest.as_std_path()) {
            Ok(file) => {
                make_owner_writable(&file)?;
                Ok(())
            }
            Err(e) if dest.exists() => {
                // Another process/ingest won the race; content is a
                // function of the digest, so this is safe to ignore.
                let _ = e;
                Ok(())
            }
            Err(e) => Err(ActionError::Io(e.error)),
        }
    }

    pub fn read_object(&self, hash: &Digest) -> ActionResult<Vec<u8>> {
        let path = self.object_path(hash);
        std::fs::read(path.as_std_path()).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ActionError::NotFound(path)
            } else {
                ActionError::Io(e)
            }
        })
    }

    pub fn has_object(&self, hash: &Digest) -> bool {
        self.object_path(hash).exists()
    }

    /// Copy an object's content out to `dest`, creating parent directories.
    pub fn extract_object(&self, hash: &Digest, dest: &Utf8Path) -> ActionResult<()> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent.as_std_path())?;
        }
        let bytes = self.read_object(hash)?;
        std::fs::write(dest.as_std_path(), bytes)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Enumeration and deletion, for the shrinker (`spec.md` §4.6)
    // -----------------------------------------------------------------------

    /// Every digest currently present under `objects/`.
    pub fn list_object_digests(&self) -> ActionResult<Vec<Digest>> {
        let mut out = Vec::new();
        if !self.objects_dir().exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(self.objects_dir().as_std_path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(digest) = name.parse::<Digest>() {
                    out.push(digest);
                }
            }
        }
        Ok(out)
    }

    /// Every path-index leaf file, as its path relative to `path-index/`
    /// (the same form [`mirror_relative`] produces from an absolute path).
    pub fn list_path_index_entries(&self) -> ActionResult<Vec<Utf8PathBuf>> {
        let mut out = Vec::new();
        let root = self.path_index_dir();
        if !root.exists() {
            return Ok(out);
        }
        for entry in walkdir::WalkDir::new(root.as_std_path()) {
            let entry = entry.map_err(|e| ActionError::Other(anyhow::anyhow!("{e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = Utf8Path::from_path(entry.path())
                .ok_or_else(|| ActionError::Other(anyhow::anyhow!("non-UTF-8 path-index entry")))?;
            if let Some(rel) = diff_utf8_paths(path, &root) {
                out.push(rel);
            }
        }
        Ok(out)
    }

    /// Every action id currently recorded, with its record file's mtime.
    pub fn list_actions(&self) -> ActionResult<Vec<(Digest, std::time::SystemTime)>> {
        let mut out = Vec::new();
        if !self.actions_dir().exists() {
            return Ok(out);
        }
        for entry in std::fs::read_dir(self.actions_dir().as_std_path())? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
                continue;
            };
            let Ok(digest) = name.parse::<Digest>() else {
                continue;
            };
            let mtime = entry.metadata()?.modified()?;
            out.push((digest, mtime));
        }
        Ok(out)
    }

    pub fn remove_object(&self, digest: &Digest) -> ActionResult<()> {
        remove_file_if_present(&self.object_path(digest))
    }

    /// `rel_path` as returned by [`ObjectStore::list_path_index_entries`].
    pub fn remove_path_index_entry(&self, rel_path: &Utf8Path) -> ActionResult<()> {
        remove_file_if_present(&self.path_index_dir().join(rel_path))
    }

    pub fn remove_action(&self, action_id: &Digest) -> ActionResult<()> {
        remove_file_if_present(&self.action_path(action_id))
    }

    /// Remove any directory under `path-index/` left empty by
    /// [`ObjectStore::remove_path_index_entry`] calls, deepest first.
    pub fn prune_empty_path_index_dirs(&self) -> ActionResult<()> {
        let root = self.path_index_dir();
        if !root.exists() {
            return Ok(());
        }
        let mut dirs: Vec<_> = walkdir::WalkDir::new(root.as_std_path())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .map(|e| e.path().to_owned())
            .collect();
        // Deepest first so a parent empties out only after its children do.
        dirs.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for dir in dirs {
            if dir == root.as_std_path() {
                continue;
            }
            if std::fs::read_dir(&dir).map(|mut it| it.next().is_none()).unwrap_or(false) {
                let _ = std::fs::remove_dir(&dir);
            }
        }
        Ok(())
    }
}

fn make_owner_writable(file: &std::fs::File) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        let mode = perms.mode() | 0o200;
        perms.set_mode(mode);
        file.set_permissions(perms)
    }
    #[cfg(not(unix))]
    {
        let mut perms = file.metadata()?.permissions();
        perms.set_readonly(false);
        file.set_permissions(perms)
    }
}

fn remove_file_if_present(path: &Utf8Path) -> ActionResult<()> {
    match std::fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ActionError::Io(e)),
    }
}

fn parse_stamp_line(line: &str) -> Option<(Digest, u64)> {
    let (hash_str, size_str) = line.split_once('|')?;
    let hash = hash_str.parse().ok()?;
    let size = size_str.parse().ok()?;
    Some((hash, size))
}

/// Collapse an absolute path down to its `Normal` components, dropping any
/// root/prefix, for mirroring under `path-index/`.
pub fn mirror_relative(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();
    for comp in path.components() {
        if let camino::Utf8Component::Normal(s) = comp {
            out.push(s);
        }
    }
    out
}
