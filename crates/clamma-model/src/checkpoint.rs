//! Checkpoint header parsing: FLOAT_V1's 7xu32 header and INT8_V2's
//! magic-prefixed 256-byte header (spec.md §6).

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::config::{ModelConfig, ModelVersion};
use crate::error::{ModelError, Result};

const INT8_MAGIC: u32 = 0x616b_3432;
const INT8_VERSION: u32 = 2;
const INT8_HEADER_LEN: u64 = 256;
const FLOAT_HEADER_LEN: u64 = 7 * 4;

/// The parsed header: config plus where the weight data region begins.
pub struct Header {
    pub config: ModelConfig,
    pub data_offset: u64,
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

/// Parse a checkpoint's header directly from `path`.
///
/// Reads at most 256 bytes up front; distinguishes FLOAT_V1 from INT8_V2 by
/// checking whether the first two u32s match the INT8 magic and version.
pub fn read_header(path: &Path) -> Result<Header> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();

    let mut probe = [0u8; INT8_HEADER_LEN as usize];
    let probe_len = (INT8_HEADER_LEN.min(file_len)) as usize;
    if probe_len < FLOAT_HEADER_LEN as usize {
        return Err(ModelError::ShortHeader {
            wanted: FLOAT_HEADER_LEN as usize,
            got: file_len,
        });
    }
    file.read_exact(&mut probe[..probe_len])?;

    parse_header(&probe[..probe_len], file_len)
}

/// Parse a checkpoint header already held in memory, for
/// `ModelAccess::AbsoluteAddress` images that never touch the filesystem.
pub fn parse_header_from_image(image: &[u8]) -> Result<Header> {
    let probe_len = INT8_HEADER_LEN.min(image.len() as u64) as usize;
    parse_header(&image[..probe_len], image.len() as u64)
}

fn parse_header(probe: &[u8], file_len: u64) -> Result<Header> {
    let probe_len = probe.len();
    if probe_len < FLOAT_HEADER_LEN as usize {
        return Err(ModelError::ShortHeader {
            wanted: FLOAT_HEADER_LEN as usize,
            got: file_len,
        });
    }

    let magic = read_u32(probe, 0);
    let version = read_u32(&probe, 4);

    if magic == INT8_MAGIC && version == INT8_VERSION {
        if probe_len < INT8_HEADER_LEN as usize {
            return Err(ModelError::ShortHeader {
                wanted: INT8_HEADER_LEN as usize,
                got: file_len,
            });
        }
        let dim = read_u32(&probe, 8) as usize;
        let hidden_dim = read_u32(&probe, 12) as usize;
        let n_layers = read_u32(&probe, 16) as usize;
        let n_heads = read_u32(&probe, 20) as usize;
        let n_kv_heads = read_u32(&probe, 24) as usize;
        let vocab_size_raw = read_u32(&probe, 28) as i32;
        let seq_len = read_u32(&probe, 32) as usize;
        let shared_classifier = probe[36] != 0;
        let group_size = read_u32(&probe, 37) as usize;

        let config = ModelConfig {
            dim,
            hidden_dim,
            n_layers,
            n_heads,
            n_kv_heads,
            vocab_size: vocab_size_raw.unsigned_abs() as usize,
            seq_len,
            group_size,
            shared_classifier,
            version: ModelVersion::Int8V2,
        };
        config.validate()?;
        return Ok(Header {
            config,
            data_offset: INT8_HEADER_LEN,
        });
    }

    let dim = magic as usize;
    let hidden_dim = version as usize;
    let n_layers = read_u32(&probe, 8) as usize;
    let n_heads = read_u32(&probe, 12) as usize;
    let n_kv_heads = read_u32(&probe, 16) as usize;
    let vocab_size_raw = read_u32(&probe, 20) as i32;
    let seq_len = read_u32(&probe, 24) as usize;

    let config = ModelConfig {
        dim,
        hidden_dim,
        n_layers,
        n_heads,
        n_kv_heads,
        vocab_size: vocab_size_raw.unsigned_abs() as usize,
        seq_len,
        group_size: 0,
        shared_classifier: vocab_size_raw > 0,
        version: ModelVersion::FloatV1,
    };
    config.validate()?;
    Ok(Header {
        config,
        data_offset: FLOAT_HEADER_LEN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn float_v1_header(dim: u32, vocab_size: i32) -> Vec<u8> {
        let mut bytes = Vec::new();
        for v in [dim, 172, 2, 8, 4] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(&vocab_size.to_le_bytes());
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes
    }

    #[test]
    fn parses_float_v1_header_with_shared_classifier() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&float_v1_header(64, 32)).unwrap();
        f.flush().unwrap();
        let h = read_header(f.path()).unwrap();
        assert_eq!(h.config.version, ModelVersion::FloatV1);
        assert_eq!(h.config.dim, 64);
        assert!(h.config.shared_classifier);
        assert_eq!(h.data_offset, 28);
    }

    #[test]
    fn negative_vocab_size_disables_shared_classifier() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&float_v1_header(64, -32)).unwrap();
        f.flush().unwrap();
        let h = read_header(f.path()).unwrap();
        assert_eq!(h.config.vocab_size, 32);
        assert!(!h.config.shared_classifier);
    }

    #[test]
    fn parses_int8_v2_header() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&INT8_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&INT8_VERSION.to_le_bytes());
        for v in [64u32, 172, 2, 8, 4, 32, 16] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.push(1); // shared_classifier
        bytes.extend_from_slice(&16u32.to_le_bytes()); // group_size
        bytes.resize(256, 0);

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&bytes).unwrap();
        f.flush().unwrap();
        let h = read_header(f.path()).unwrap();
        assert_eq!(h.config.version, ModelVersion::Int8V2);
        assert_eq!(h.config.group_size, 16);
        assert!(h.config.shared_classifier);
        assert_eq!(h.data_offset, 256);
    }

    #[test]
    fn parses_header_from_an_in_memory_image() {
        let h = parse_header_from_image(&float_v1_header(64, 32)).unwrap();
        assert_eq!(h.config.version, ModelVersion::FloatV1);
        assert_eq!(h.config.dim, 64);
    }

    #[test]
    fn rejects_truncated_header() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[0u8; 4]).unwrap();
        f.flush().unwrap();
        assert!(read_header(f.path()).is_err());
    }
}
