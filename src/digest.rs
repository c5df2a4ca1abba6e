//! Content digests.
//!
//! A [`Digest`] is the SHA-256 of some byte sequence, hex-encoded lowercase
//! on the wire (object filenames, manifest lines, action records). SHA-256
//! is used rather than a faster non-cryptographic hash because replay
//! correctness depends on rehashing declared inputs and comparing them
//! bit-exactly against a previously stored digest (`spec.md` §4.3, §8
//! "Hash-mismatch corruption").

use std::fmt;
use std::io::Read;
use std::str::FromStr;

use sha2::{Digest as _, Sha256};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Digest(hasher.finalize().into())
    }

    /// Hash a file's exact byte contents, streaming so large inputs don't
    /// need to be buffered in memory.
    pub fn of_file(path: &camino::Utf8Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path.as_std_path())?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(64);
        for byte in &self.0 {
            s.push_str(&format!("{byte:02x}"));
        }
        s
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl FromStr for Digest {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            anyhow::bail!("digest must be 64 hex characters, got {} in {:?}", s.len(), s);
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let pair = std::str::from_utf8(chunk).map_err(|e| anyhow::anyhow!("invalid hex in digest {s:?}: {e}"))?;
            bytes[i] = u8::from_str_radix(pair, 16)
                .map_err(|e| anyhow::anyhow!("invalid hex in digest {s:?}: {e}"))?;
        }
        Ok(Digest(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_hex() {
        let d = Digest::of_bytes(b"hello\n");
        let hex = d.to_hex();
        let parsed: Digest = hex.parse().unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn deterministic() {
        assert_eq!(Digest::of_bytes(b"same"), Digest::of_bytes(b"same"));
        assert_ne!(Digest::of_bytes(b"a"), Digest::of_bytes(b"b"));
    }

    #[test]
    fn rejects_malformed_hex() {
        assert!("not-a-digest".parse::<Digest>().is_err());
        assert!("ab".parse::<Digest>().is_err());
    }
}
