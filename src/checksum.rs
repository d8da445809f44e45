//! Checksum transforms for resync deduplication and online verify.
//!
//! A resync source with an agreed protocol version of 89 or later may read
//! the local block first and send only a digest; the target compares and
//! answers "in sync" without any payload transfer when the digests match.
//! Online verify uses the same transforms for its end-to-end compare.

use serde::{Deserialize, Serialize};

/// Selectable digest transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumAlgorithm {
    /// CRC32 (fast, weak; fine for dedup against a trusted peer)
    Crc32,
    /// BLAKE3 (cryptographic)
    Blake3,
}

impl ChecksumAlgorithm {
    /// Digest size in bytes.
    pub fn digest_size(self) -> usize {
        match self {
            Self::Crc32 => 4,
            Self::Blake3 => 32,
        }
    }

    /// Digest a contiguous byte range.
    pub fn digest(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(data);
                hasher.finalize().to_be_bytes().to_vec()
            }
            Self::Blake3 => blake3::hash(data).as_bytes().to_vec(),
        }
    }

    /// Digest a request's pages, page chain order.
    ///
    /// All but the last page are fully used; the last page may be partial.
    pub fn digest_pages(self, pages: &[bytes::Bytes], total_size: usize) -> Vec<u8> {
        match self {
            Self::Crc32 => {
                let mut hasher = crc32fast::Hasher::new();
                let mut remaining = total_size;
                for page in pages {
                    let take = remaining.min(page.len());
                    hasher.update(&page[..take]);
                    remaining -= take;
                }
                hasher.finalize().to_be_bytes().to_vec()
            }
            Self::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                let mut remaining = total_size;
                for page in pages {
                    let take = remaining.min(page.len());
                    hasher.update(&page[..take]);
                    remaining -= take;
                }
                hasher.finalize().as_bytes().to_vec()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_digest_sizes() {
        assert_eq!(ChecksumAlgorithm::Crc32.digest_size(), 4);
        assert_eq!(ChecksumAlgorithm::Blake3.digest_size(), 32);
    }

    #[test]
    fn test_digest_matches_itself() {
        let data = vec![0xAB; 4096];
        for alg in [ChecksumAlgorithm::Crc32, ChecksumAlgorithm::Blake3] {
            assert_eq!(alg.digest(&data), alg.digest(&data));
            assert_ne!(alg.digest(&data), alg.digest(&data[..4095]));
        }
    }

    #[test]
    fn test_digest_pages_equals_flat_digest() {
        let flat = vec![0x5A; 10_000];
        let pages = vec![
            Bytes::copy_from_slice(&flat[..4096]),
            Bytes::copy_from_slice(&flat[4096..8192]),
            Bytes::copy_from_slice(&flat[8192..]),
        ];
        for alg in [ChecksumAlgorithm::Crc32, ChecksumAlgorithm::Blake3] {
            assert_eq!(alg.digest_pages(&pages, flat.len()), alg.digest(&flat));
        }
    }
}
