//! The manifest format shared by inputs manifests, outputs manifests, and
//! (indirectly) action records (`spec.md` §3).
//!
//! A manifest is a sorted, line-oriented record: each line is
//! `"<absolute-path>|<hash>|<size>"`. Canonical ordering is byte-wise ASCII
//! over the path field, so two manifests built from the same logical set of
//! `(path, content)` pairs always serialize identically and therefore hash
//! identically — this is what makes action identifiers deterministic
//! regardless of the order declared inputs were listed in (`spec.md` §8,
//! "Manifest canonicity").

use camino::{Utf8Path, Utf8PathBuf};

use crate::digest::Digest;
use crate::error::{ActionError, ActionResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestEntry {
    pub path: Utf8PathBuf,
    pub hash: Digest,
    pub size: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from entries in any order; sorts by path, per the
    /// canonical ordering rule.
    pub fn new(mut entries: Vec<ManifestEntry>) -> Self {
        entries.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));
        Manifest { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(entry.path.as_str());
            out.push('|');
            out.push_str(&entry.hash.to_hex());
            out.push('|');
            out.push_str(&entry.size.to_string());
            out.push('\n');
        }
        out.into_bytes()
    }

    pub fn parse(bytes: &[u8]) -> ActionResult<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ActionError::Other(anyhow::anyhow!("manifest is not valid UTF-8: {e}")))?;

        let mut entries = Vec::new();
        for line in text.lines() {
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, '|');
            let (Some(path_str), Some(hash_str), Some(size_str)) =
                (parts.next(), parts.next(), parts.next())
            else {
                return Err(ActionError::Other(anyhow::anyhow!(
                    "malformed manifest line: {line:?}"
                )));
            };

            let hash: Digest = hash_str
                .parse()
                .map_err(|e| ActionError::Other(anyhow::anyhow!("malformed manifest digest: {e}")))?;
            let size: u64 = size_str
                .parse()
                .map_err(|e| ActionError::Other(anyhow::anyhow!("malformed manifest size: {e}")))?;

            entries.push(ManifestEntry {
                path: Utf8PathBuf::from(path_str),
                hash,
                size,
            });
        }

        // Manifests are always sorted on disk, but don't trust that blindly.
        Ok(Manifest::new(entries))
    }

    pub fn paths(&self) -> impl Iterator<Item = &Utf8Path> {
        self.entries.iter().map(|e| e.path.as_path())
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }
}
