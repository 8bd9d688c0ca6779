//! Binary layer configuration format.
//!
//! Little-endian layout:
//!
//! ```text
//! [expert_count: i32][hidden_size: i32][max_concurrency: i32]
//! [weight_file_len: i32][sublayer_type_len: i32]
//! [weight_file bytes][0][sublayer_type bytes][0][zero pad to 8-byte string block]
//! [centroid_count: i64][centroid_count x f32]
//! ```
//!
//! String lengths exclude the terminator. The padding makes the combined
//! string block (both strings plus both terminators) a multiple of 8 bytes.

use std::path::PathBuf;

use crate::config::{MoELayerConfig, SublayerType};
use crate::error::{MoEError, Result};

const HEADER_INTS: usize = 5;
/// Fixed metadata: five i32 fields plus the i64 centroid count.
pub const METADATA_LENGTH: usize = HEADER_INTS * 4 + 8;

fn string_block_len(weight_file: &str, sublayer_type: &str) -> usize {
    let raw = weight_file.len() + sublayer_type.len() + 2;
    raw.div_ceil(8) * 8
}

fn weight_file_str(config: &MoELayerConfig) -> Result<&str> {
    config
        .weight_file
        .to_str()
        .ok_or_else(|| MoEError::config("weight file path is not valid UTF-8"))
}

/// Exact byte length [`serialize_config`] will produce.
pub fn serialization_size(config: &MoELayerConfig) -> Result<usize> {
    let weight_file = weight_file_str(config)?;
    Ok(METADATA_LENGTH
        + string_block_len(weight_file, config.sublayer_type.as_str())
        + config.centroids.len() * 4)
}

/// Encode `config` into the binary layout.
pub fn serialize_config(config: &MoELayerConfig) -> Result<Vec<u8>> {
    let weight_file = weight_file_str(config)?;
    if weight_file.contains('\0') {
        return Err(MoEError::config("weight file path contains a NUL byte"));
    }
    let sublayer_type = config.sublayer_type.as_str();

    let mut out = Vec::with_capacity(serialization_size(config)?);
    for value in [
        config.expert_count,
        config.hidden_size,
        config.max_concurrency,
        weight_file.len(),
        sublayer_type.len(),
    ] {
        let value = i32::try_from(value)
            .map_err(|_| MoEError::config(format!("{value} does not fit the i32 header field")))?;
        out.extend_from_slice(&value.to_le_bytes());
    }

    let block_start = out.len();
    out.extend_from_slice(weight_file.as_bytes());
    out.push(0);
    out.extend_from_slice(sublayer_type.as_bytes());
    out.push(0);
    out.resize(block_start + string_block_len(weight_file, sublayer_type), 0);

    out.extend_from_slice(&(config.centroids.len() as i64).to_le_bytes());
    for value in &config.centroids {
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(out)
}

/// Decode a configuration written by [`serialize_config`].
pub fn deserialize_config(bytes: &[u8]) -> Result<MoELayerConfig> {
    if bytes.len() < METADATA_LENGTH {
        return Err(MoEError::config(format!(
            "serialized layer is {} bytes, metadata alone needs {METADATA_LENGTH}",
            bytes.len()
        )));
    }
    let mut reader = Reader { bytes, pos: 0 };

    let mut header = [0usize; HEADER_INTS];
    for field in header.iter_mut() {
        let value = reader.i32()?;
        *field = usize::try_from(value)
            .map_err(|_| MoEError::config(format!("negative header field {value}")))?;
    }
    let [expert_count, hidden_size, max_concurrency, weight_file_len, sublayer_type_len] = header;

    let block_start = reader.pos;
    let weight_file = reader.c_string(weight_file_len)?.to_owned();
    let sublayer_type: SublayerType = reader.c_string(sublayer_type_len)?.parse()?;
    reader.pos = block_start + (weight_file_len + sublayer_type_len + 2).div_ceil(8) * 8;

    let count = reader.i64()?;
    let count = usize::try_from(count)
        .map_err(|_| MoEError::config(format!("negative centroid count {count}")))?;
    let remaining = bytes.len().saturating_sub(reader.pos);
    if count.checked_mul(4) != Some(remaining) {
        return Err(MoEError::config(format!(
            "{count} centroids need {} bytes, buffer has {remaining}",
            count.saturating_mul(4)
        )));
    }
    let centroids = bytes[reader.pos..]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok(MoELayerConfig {
        expert_count,
        hidden_size,
        max_concurrency,
        weight_file: PathBuf::from(weight_file),
        sublayer_type,
        centroids,
    })
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| MoEError::config("serialized layer is truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(buf))
    }

    fn c_string(&mut self, len: usize) -> Result<&'a str> {
        let raw = self.take(len + 1)?;
        let (text, terminator) = raw.split_at(len);
        if terminator != [0] {
            return Err(MoEError::config("serialized string is not NUL-terminated"));
        }
        std::str::from_utf8(text)
            .map_err(|e| MoEError::config(format!("serialized string is not UTF-8: {e}")))
    }
}
