//! Checksum algorithms and file digests
//!
//! Downloads may carry an expected digest. The algorithm name is validated
//! when the transfer is created and the digest of the complete file is
//! compared once all bytes are on disk.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};

use crate::constants::files;
use crate::errors::{TransferError, TransferResult};

/// Supported checksum functions
///
/// Names are accepted case-insensitively; the canonical form is lowercase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub const ALL: [HashAlgorithm; 6] = [
        Self::Md5,
        Self::Sha1,
        Self::Sha224,
        Self::Sha256,
        Self::Sha384,
        Self::Sha512,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha224 => "sha224",
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Parse an optional algorithm name, defaulting to md5 when absent or empty
    pub fn parse_optional(name: Option<&str>) -> TransferResult<Self> {
        match name.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(name) => name.parse(),
        }
    }

    /// Digest of an in-memory buffer as lowercase hex
    pub fn digest_bytes(&self, data: &[u8]) -> String {
        let mut hasher = Hasher::new(*self);
        hasher.update(data);
        hasher.finalize_hex()
    }

    /// Digest of a whole file as lowercase hex
    ///
    /// The file is read on the blocking pool so the event loop never waits
    /// on disk reads.
    pub async fn digest_file(&self, path: &Path) -> std::io::Result<String> {
        let algorithm = *self;
        let path: PathBuf = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let mut file = std::fs::File::open(&path)?;
            let mut hasher = Hasher::new(algorithm);
            let mut buffer = vec![0u8; files::HASH_BUFFER_SIZE];
            loop {
                let read = file.read(&mut buffer)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
            }
            Ok(hasher.finalize_hex())
        })
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == lower)
            .ok_or_else(|| TransferError::validation(format!("Invalid hash algorithm: '{}'", s)))
    }
}

/// Compare two hex digests ignoring case
pub fn checksums_match(expected: &str, computed: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(computed.trim())
}

/// Incremental hasher over the supported algorithms
enum Hasher {
    Md5(md5::Context),
    Sha1(Sha1),
    Sha224(Sha224),
    Sha256(Sha256),
    Sha384(Sha384),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Md5 => Self::Md5(md5::Context::new()),
            HashAlgorithm::Sha1 => Self::Sha1(Sha1::new()),
            HashAlgorithm::Sha224 => Self::Sha224(Sha224::new()),
            HashAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => Self::Sha384(Sha384::new()),
            HashAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Md5(ctx) => ctx.consume(data),
            Self::Sha1(h) => h.update(data),
            Self::Sha224(h) => h.update(data),
            Self::Sha256(h) => h.update(data),
            Self::Sha384(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Self::Md5(ctx) => format!("{:x}", ctx.compute()),
            Self::Sha1(h) => hex::encode(h.finalize()),
            Self::Sha224(h) => hex::encode(h.finalize()),
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha384(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_algorithm_names_are_case_insensitive() {
        assert_eq!("SHA256".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha256);
        assert_eq!("Md5".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Md5);
        assert_eq!("sha512".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha512);
    }

    #[test]
    fn test_unknown_algorithm_is_validation_error() {
        let error = "crc32".parse::<HashAlgorithm>().unwrap_err();
        assert!(matches!(error, TransferError::Validation { .. }));
        assert!(error.to_string().contains("crc32"));
    }

    #[test]
    fn test_missing_algorithm_defaults_to_md5() {
        assert_eq!(HashAlgorithm::parse_optional(None).unwrap(), HashAlgorithm::Md5);
        assert_eq!(HashAlgorithm::parse_optional(Some("")).unwrap(), HashAlgorithm::Md5);
        assert!(HashAlgorithm::parse_optional(Some("whirlpool")).is_err());
    }

    #[test]
    fn test_known_digests() {
        // Reference digests of "abc"
        assert_eq!(
            HashAlgorithm::Md5.digest_bytes(b"abc"),
            "900150983cd24fb0d6963f7d28e17f72"
        );
        assert_eq!(
            HashAlgorithm::Sha1.digest_bytes(b"abc"),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            HashAlgorithm::Sha256.digest_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(HashAlgorithm::Sha224.digest_bytes(b"abc").len(), 56);
        assert_eq!(HashAlgorithm::Sha384.digest_bytes(b"abc").len(), 96);
        assert_eq!(HashAlgorithm::Sha512.digest_bytes(b"abc").len(), 128);
    }

    #[test]
    fn test_checksum_comparison_ignores_case() {
        assert!(checksums_match(
            "900150983CD24FB0D6963F7D28E17F72",
            "900150983cd24fb0d6963f7d28e17f72"
        ));
        assert!(!checksums_match("deadbeef", "900150983cd24fb0d6963f7d28e17f72"));
    }

    #[tokio::test]
    async fn test_file_digest_matches_buffer_digest() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("payload.bin");
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        for algorithm in HashAlgorithm::ALL {
            let from_file = algorithm.digest_file(&path).await.unwrap();
            assert_eq!(from_file, algorithm.digest_bytes(&data), "{}", algorithm);
        }
    }

    #[test]
    fn test_serde_uses_lowercase_names() {
        let json = serde_json::to_string(&HashAlgorithm::Sha384).unwrap();
        assert_eq!(json, "\"sha384\"");
        let parsed: HashAlgorithm = serde_json::from_str("\"sha1\"").unwrap();
        assert_eq!(parsed, HashAlgorithm::Sha1);
    }
}
