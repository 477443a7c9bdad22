use std::io;
use std::io::Read;

use sha2::{Digest, Sha256};

use crate::error::Error;

/// Read-side adapter that hashes every byte passing through it.
///
/// Constructed with an expected digest it refuses end-of-stream until the
/// calculated digest matches; constructed without one, the calculated digest
/// is available through [`ChecksumReader::shasum`] once the stream has been
/// drained.
pub struct ChecksumReader<R: Read> {
    inner: R,
    hasher: Option<Sha256>,
    digest: Option<[u8; 32]>,
    expected: Option<String>,
}

impl<R: Read> ChecksumReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            digest: None,
            expected: None,
        }
    }

    pub fn with_expected(inner: R, expected: &str) -> Self {
        Self {
            inner,
            hasher: Some(Sha256::new()),
            digest: None,
            expected: Some(expected.to_string()),
        }
    }

    fn finalize(&mut self) -> [u8; 32] {
        if self.digest.is_none() {
            let hasher = self.hasher.take().unwrap_or_default();
            self.digest = Some(hasher.finalize().into());
        }
        self.digest.unwrap_or_default()
    }

    /// The finalized digest as lowercase hex. `None` until end-of-stream has
    /// been observed; stable across repeated calls afterwards.
    pub fn shasum(&self) -> Option<String> {
        self.digest.map(hex::encode)
    }

    pub fn shasum_bytes(&self) -> Option<[u8; 32]> {
        self.digest
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read> Read for ChecksumReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;

        if n == 0 {
            if buf.is_empty() {
                return Ok(0);
            }
            let calculated = hex::encode(self.finalize());
            if let Some(expected) = &self.expected {
                if &calculated != expected {
                    return Err(Error::ShasumMismatch {
                        expected: expected.clone(),
                        calculated,
                    }
                    .into());
                }
            }
            return Ok(0);
        }

        if let Some(hasher) = &mut self.hasher {
            hasher.update(&buf[..n]);
        }
        Ok(n)
    }
}
