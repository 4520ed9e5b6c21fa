//! GGUF header metadata extraction.
//!
//! Reads the key/value section of a GGUF (v2/v3) file into a flat string map
//! and derives the descriptive fields of a [`ModelConfig`] from it. Tensor
//! data is never read. Parsing is bounded by [`GgufConfig`] so a malformed or
//! hostile file cannot make the reader allocate or recurse without limit.
//!
//! Header layout:
//! - 0-3: magic `GGUF`
//! - 4-7: version (u32, little-endian)
//! - 8-15: tensor count (u64, little-endian)
//! - 16-23: metadata key/value count (u64, little-endian)
//! - then `count` entries of `key (string) | value type (u32) | value`

use crate::config::GgufConfig;
use crate::error::{Result, StoreError};
use crate::manifest::ModelConfig;
use crate::media::Format;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

const MAGIC: &[u8; 4] = b"GGUF";

/// Value type tags used in the key/value section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    fn from_u32(tag: u32) -> Result<Self> {
        Ok(match tag {
            0 => ValueType::U8,
            1 => ValueType::I8,
            2 => ValueType::U16,
            3 => ValueType::I16,
            4 => ValueType::U32,
            5 => ValueType::I32,
            6 => ValueType::F32,
            7 => ValueType::Bool,
            8 => ValueType::String,
            9 => ValueType::Array,
            10 => ValueType::U64,
            11 => ValueType::I64,
            12 => ValueType::F64,
            other => return Err(malformed(format!("unknown value type {}", other))),
        })
    }

    fn name(&self) -> &'static str {
        match self {
            ValueType::U8 => "uint8",
            ValueType::I8 => "int8",
            ValueType::U16 => "uint16",
            ValueType::I16 => "int16",
            ValueType::U32 => "uint32",
            ValueType::I32 => "int32",
            ValueType::F32 => "float32",
            ValueType::Bool => "bool",
            ValueType::String => "string",
            ValueType::Array => "array",
            ValueType::U64 => "uint64",
            ValueType::I64 => "int64",
            ValueType::F64 => "float64",
        }
    }

    /// Encoded size for fixed-width types.
    fn fixed_size(&self) -> Option<u64> {
        match self {
            ValueType::U8 | ValueType::I8 | ValueType::Bool => Some(1),
            ValueType::U16 | ValueType::I16 => Some(2),
            ValueType::U32 | ValueType::I32 | ValueType::F32 => Some(4),
            ValueType::U64 | ValueType::I64 | ValueType::F64 => Some(8),
            ValueType::String | ValueType::Array => None,
        }
    }
}

/// Parsed GGUF header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    /// Rendered metadata values, keyed by GGUF key.
    pub metadata: BTreeMap<String, String>,
}

impl GgufHeader {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Parse the header and metadata section from `reader`.
pub fn read_header<R: Read>(reader: &mut R) -> Result<GgufHeader> {
    let mut header = [0u8; 24];
    reader
        .read_exact(&mut header)
        .map_err(|e| malformed(format!("truncated header: {}", e)))?;

    if &header[..4] != MAGIC {
        return Err(malformed("missing GGUF magic".to_string()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(malformed(format!("unsupported GGUF version {}", version)));
    }
    let tensor_count = le_u64(&header[8..16]);
    let kv_count = le_u64(&header[16..24]);

    let mut metadata = BTreeMap::new();
    for _ in 0..kv_count {
        if metadata.len() >= GgufConfig::MAX_KEYS {
            debug!("GGUF metadata truncated at {} keys", GgufConfig::MAX_KEYS);
            break;
        }
        let key = read_string(reader)?;
        let value_type = ValueType::from_u32(read_u32(reader)?)?;
        if let Some(value) = read_value(reader, value_type)? {
            metadata.insert(key, value);
        }
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        metadata,
    })
}

/// Extract metadata from the GGUF file at `path`.
///
/// Any failure yields an empty map; metadata is descriptive only.
pub fn extract_metadata(path: &Path) -> BTreeMap<String, String> {
    match read_header_from_path(path) {
        Ok(header) => header.metadata,
        Err(e) => {
            debug!("Skipping GGUF metadata for {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}

pub fn read_header_from_path(path: &Path) -> Result<GgufHeader> {
    let file = File::open(path).map_err(|e| StoreError::io_with_path(e, path))?;
    read_header(&mut BufReader::new(file))
}

/// Build the config for a GGUF model made of `paths` (one file, or the shards
/// of one model in order). Metadata comes from the first file.
pub fn config_from_files(paths: &[PathBuf]) -> ModelConfig {
    let total_size: u64 = paths
        .iter()
        .filter_map(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .sum();

    let metadata = paths
        .first()
        .map(|p| extract_metadata(p))
        .unwrap_or_default();

    let architecture = metadata
        .get("general.architecture")
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    let parameters = metadata
        .get("general.size_label")
        .map(|s| s.trim().to_string())
        .or_else(|| {
            metadata
                .get("general.parameter_count")
                .and_then(|s| s.parse::<u64>().ok())
                .map(format_parameters)
        })
        .unwrap_or_default();
    let quantization = metadata
        .get("general.file_type")
        .and_then(|s| s.parse::<u32>().ok())
        .map(|t| file_type_name(t).to_string())
        .unwrap_or_default();
    let context_size = (!architecture.is_empty())
        .then(|| metadata.get(&format!("{}.context_length", architecture)))
        .flatten()
        .and_then(|s| s.parse::<u64>().ok());

    ModelConfig {
        format: Some(Format::Gguf),
        quantization,
        parameters,
        architecture,
        size: format_size(total_size),
        gguf: metadata,
        context_size,
        ..Default::default()
    }
}

/// Name of a `general.file_type` quantization scheme.
pub fn file_type_name(file_type: u32) -> &'static str {
    match file_type {
        0 => "F32",
        1 => "F16",
        2 => "Q4_0",
        3 => "Q4_1",
        7 => "Q8_0",
        8 => "Q5_0",
        9 => "Q5_1",
        10 => "Q2_K",
        11 => "Q3_K_S",
        12 => "Q3_K_M",
        13 => "Q3_K_L",
        14 => "Q4_K_S",
        15 => "Q4_K_M",
        16 => "Q5_K_S",
        17 => "Q5_K_M",
        18 => "Q6_K",
        19 => "IQ2_XXS",
        20 => "IQ2_XS",
        21 => "Q2_K_S",
        22 => "IQ3_XS",
        23 => "IQ3_XXS",
        24 => "IQ1_S",
        25 => "IQ4_NL",
        26 => "IQ3_S",
        27 => "IQ3_M",
        28 => "IQ2_S",
        29 => "IQ2_M",
        30 => "IQ4_XS",
        31 => "IQ1_M",
        32 => "BF16",
        36 => "TQ1_0",
        37 => "TQ2_0",
        _ => "unknown",
    }
}

/// Binary-unit size, e.g. `"4.07 GiB"`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}

/// Short parameter count, e.g. `"135M"` or `"8.03B"`.
pub fn format_parameters(count: u64) -> String {
    let c = count as f64;
    if c >= 1e9 {
        format!("{:.2}B", c / 1e9)
    } else if c >= 1e6 {
        format!("{:.0}M", c / 1e6)
    } else if c >= 1e3 {
        format!("{:.0}K", c / 1e3)
    } else {
        count.to_string()
    }
}

fn malformed(reason: String) -> StoreError {
    StoreError::Other(format!("Malformed GGUF: {}", reason))
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

fn read_array<R: Read, const N: usize>(reader: &mut R) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|e| malformed(format!("truncated value: {}", e)))?;
    Ok(buf)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32> {
    Ok(u32::from_le_bytes(read_array(reader)?))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    Ok(u64::from_le_bytes(read_array(reader)?))
}

/// Read a length-prefixed string, refusing ones over the string limit.
fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = read_u64(reader)?;
    if len > GgufConfig::MAX_STRING_LEN {
        return Err(malformed(format!("string of {} bytes exceeds limit", len)));
    }
    let mut buf = vec![0u8; len as usize];
    reader
        .read_exact(&mut buf)
        .map_err(|e| malformed(format!("truncated string: {}", e)))?;
    String::from_utf8(buf).map_err(|_| malformed("invalid UTF-8 in string".to_string()))
}

fn skip_bytes<R: Read>(reader: &mut R, len: u64) -> Result<()> {
    let copied = io::copy(&mut reader.by_ref().take(len), &mut io::sink())
        .map_err(|e| malformed(format!("failed to skip value: {}", e)))?;
    if copied != len {
        return Err(malformed("truncated value".to_string()));
    }
    Ok(())
}

/// Read one value and render it, or `None` when it is only summarized away
/// (over-long strings).
fn read_value<R: Read>(reader: &mut R, value_type: ValueType) -> Result<Option<String>> {
    let rendered = match value_type {
        ValueType::U8 => u8::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::I8 => i8::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::U16 => u16::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::I16 => i16::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::U32 => u32::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::I32 => i32::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::F32 => f32::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::U64 => u64::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::I64 => i64::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::F64 => f64::from_le_bytes(read_array(reader)?).to_string(),
        ValueType::Bool => (read_array::<_, 1>(reader)?[0] != 0).to_string(),
        ValueType::String => {
            let len = read_u64(reader)?;
            if len > GgufConfig::MAX_STRING_LEN {
                skip_bytes(reader, len)?;
                return Ok(None);
            }
            let mut buf = vec![0u8; len as usize];
            reader
                .read_exact(&mut buf)
                .map_err(|e| malformed(format!("truncated string: {}", e)))?;
            String::from_utf8_lossy(&buf).into_owned()
        }
        ValueType::Array => {
            let element_type = ValueType::from_u32(read_u32(reader)?)?;
            let len = read_u64(reader)?;
            skip_array(reader, element_type, len, 1)?;
            format!("[{}; {}]", element_type.name(), len)
        }
    };
    Ok(Some(rendered))
}

/// Skip `len` elements of `element_type`, tracking nesting depth.
fn skip_array<R: Read>(reader: &mut R, element_type: ValueType, len: u64, depth: usize) -> Result<()> {
    if depth > GgufConfig::MAX_ARRAY_DEPTH {
        return Err(malformed("array nesting too deep".to_string()));
    }

    if let Some(size) = element_type.fixed_size() {
        let total = len
            .checked_mul(size)
            .ok_or_else(|| malformed("array size overflow".to_string()))?;
        return skip_bytes(reader, total);
    }

    if len > GgufConfig::MAX_ARRAY_SKIP_LEN {
        return Err(malformed(format!("array of {} elements exceeds limit", len)));
    }
    for _ in 0..len {
        match element_type {
            ValueType::String => {
                let str_len = read_u64(reader)?;
                skip_bytes(reader, str_len)?;
            }
            ValueType::Array => {
                let inner_type = ValueType::from_u32(read_u32(reader)?)?;
                let inner_len = read_u64(reader)?;
                skip_array(reader, inner_type, inner_len, depth + 1)?;
            }
            other => return Err(malformed(format!("unexpected {} array", other.name()))),
        }
    }
    Ok(())
}
