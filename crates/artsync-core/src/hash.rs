//! MD5 helpers producing the base64 digests stored in manifests

use std::fs::File;
use std::io::Read;
use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

use crate::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Base64 MD5 of a string's UTF-8 bytes.
pub fn md5_string(s: &str) -> String {
    md5_bytes(s.as_bytes())
}

pub fn md5_bytes(bytes: &[u8]) -> String {
    STANDARD.encode(Md5::digest(bytes))
}

/// Streams a file through MD5 and returns the base64 digest.
pub fn md5_file_b64(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Md5::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(STANDARD.encode(hasher.finalize()))
}

/// Reader adapter that hashes everything read through it.
pub struct Md5Reader<R> {
    inner: R,
    hasher: Md5,
    len: u64,
}

impl<R: Read> Md5Reader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            len: 0,
        }
    }

    /// Base64 digest and byte count of what has been read so far.
    pub fn finish(self) -> (String, u64) {
        (STANDARD.encode(self.hasher.finalize()), self.len)
    }
}

impl<R: Read> Read for Md5Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.len += n as u64;
        Ok(n)
    }
}

/// Lowercase hex of the MD5 over `bytes`.
pub fn md5_hex(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

pub fn b64_to_hex(b64: &str) -> Result<String> {
    let raw = STANDARD
        .decode(b64)
        .map_err(|e| Error::InvalidDigest(format!("{}: {}", b64, e)))?;
    Ok(hex::encode(raw))
}

pub fn hex_to_b64(hex_digest: &str) -> Result<String> {
    let raw = hex::decode(hex_digest)
        .map_err(|e| Error::InvalidDigest(format!("{}: {}", hex_digest, e)))?;
    Ok(STANDARD.encode(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_md5_string_matches_known_value() {
        // md5("hi") = 49f68a5c8493ec2c0bf489821c21fc3b
        let b64 = md5_string("hi");
        assert_eq!(b64_to_hex(&b64).unwrap(), "49f68a5c8493ec2c0bf489821c21fc3b");
    }

    #[test]
    fn test_md5_file_matches_string() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello").unwrap();
        file.flush().unwrap();

        assert_eq!(md5_file_b64(file.path()).unwrap(), "XUFAKrxLKna5cZ2REBfFkg==");
        assert_eq!(md5_string("hello"), "XUFAKrxLKna5cZ2REBfFkg==");
    }

    #[test]
    fn test_md5_reader_hashes_what_passes_through() {
        let mut reader = Md5Reader::new(&b"hello"[..]);
        let mut out = Vec::new();
        std::io::copy(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(reader.finish(), ("XUFAKrxLKna5cZ2REBfFkg==".to_string(), 5));
    }

    #[test]
    fn test_hex_b64_conversions() {
        let b64 = md5_string("example");
        let hex_digest = b64_to_hex(&b64).unwrap();
        assert_eq!(hex_to_b64(&hex_digest).unwrap(), b64);
        assert!(matches!(b64_to_hex("!!not base64"), Err(Error::InvalidDigest(_))));
    }
}
