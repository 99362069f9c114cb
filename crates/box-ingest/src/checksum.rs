//! Streaming digest computation and verification.
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::io;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::warn;

const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumAlgorithm { Md5, Sha1, Sha256, Sha384, Sha512 }

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported checksum algorithm '{0}'")]
pub struct UnsupportedAlgorithm(pub String);

impl FromStr for ChecksumAlgorithm {
    type Err = UnsupportedAlgorithm;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" => Ok(Self::Sha1),
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            _ => Err(UnsupportedAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { Self::Md5 => "md5", Self::Sha1 => "sha1", Self::Sha256 => "sha256", Self::Sha384 => "sha384", Self::Sha512 => "sha512" })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Matched,
    Mismatched { expected: String, actual: String },
    /// The algorithm is not on the allow-list; the upload proceeds unverified.
    Skipped,
}

pub async fn compute_digest(path: &Path, algorithm: ChecksumAlgorithm) -> io::Result<String> {
    match algorithm {
        ChecksumAlgorithm::Md5 => stream_digest::<Md5>(path).await,
        ChecksumAlgorithm::Sha1 => stream_digest::<Sha1>(path).await,
        ChecksumAlgorithm::Sha256 => stream_digest::<Sha256>(path).await,
        ChecksumAlgorithm::Sha384 => stream_digest::<Sha384>(path).await,
        ChecksumAlgorithm::Sha512 => stream_digest::<Sha512>(path).await,
    }
}

async fn stream_digest<D: Digest>(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 { break; }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compare the file's digest against `expected` (hex, case-insensitive).
pub async fn verify(path: &Path, expected: &str, algorithm: &str) -> io::Result<Verification> {
    let algo = match algorithm.parse::<ChecksumAlgorithm>() {
        Ok(a) => a,
        Err(e) => { warn!(algorithm, path=%path.display(), "checksum_skipped_unsupported: {e}"); return Ok(Verification::Skipped); }
    };
    let actual = compute_digest(path, algo).await?;
    let expected = expected.trim().to_ascii_lowercase();
    if actual == expected { Ok(Verification::Matched) } else { Ok(Verification::Mismatched { expected, actual }) }
}
