//! Minimal NumPy `.npy` reader/writer for dark frames.
//!
//! Supports format versions 1.0–3.0, C order, little-endian integer and float dtypes.
//! Every array is widened to `f64` on load and written back as `<f8`.

use std::fs;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};

use crate::error::{AppResult, DaqError};

const MAGIC: &[u8] = b"\x93NUMPY";
const HEADER_ALIGN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dtype {
    F8,
    F4,
    U1,
    U2,
    U4,
    U8,
    I1,
    I2,
    I4,
    I8,
}

impl Dtype {
    fn parse(descr: &str) -> Result<Self, String> {
        let (order, code) = descr.split_at(descr.len().min(1));
        let dtype = match code {
            "f8" => Dtype::F8,
            "f4" => Dtype::F4,
            "u1" => Dtype::U1,
            "u2" => Dtype::U2,
            "u4" => Dtype::U4,
            "u8" => Dtype::U8,
            "i1" => Dtype::I1,
            "i2" => Dtype::I2,
            "i4" => Dtype::I4,
            "i8" => Dtype::I8,
            _ => return Err(format!("unsupported dtype '{descr}'")),
        };
        match order {
            "<" | "|" => Ok(dtype),
            ">" if dtype.width() == 1 => Ok(dtype),
            _ => Err(format!("unsupported byte order in dtype '{descr}'")),
        }
    }

    fn width(self) -> usize {
        match self {
            Dtype::U1 | Dtype::I1 => 1,
            Dtype::U2 | Dtype::I2 => 2,
            Dtype::F4 | Dtype::U4 | Dtype::I4 => 4,
            Dtype::F8 | Dtype::U8 | Dtype::I8 => 8,
        }
    }

    fn decode(self, b: &[u8]) -> f64 {
        match self {
            Dtype::F8 => f64::from_le_bytes(le(b)),
            Dtype::F4 => f32::from_le_bytes(le(b)) as f64,
            Dtype::U1 => b[0] as f64,
            Dtype::I1 => b[0] as i8 as f64,
            Dtype::U2 => u16::from_le_bytes(le(b)) as f64,
            Dtype::I2 => i16::from_le_bytes(le(b)) as f64,
            Dtype::U4 => u32::from_le_bytes(le(b)) as f64,
            Dtype::I4 => i32::from_le_bytes(le(b)) as f64,
            Dtype::U8 => u64::from_le_bytes(le(b)) as f64,
            Dtype::I8 => i64::from_le_bytes(le(b)) as f64,
        }
    }
}

fn le<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut buf = [0u8; N];
    buf.copy_from_slice(&bytes[..N]);
    buf
}

/// Read an `.npy` file into a dynamic-dimension `f64` array.
pub fn read_npy(path: &Path) -> AppResult<ArrayD<f64>> {
    let bytes = fs::read(path)?;
    parse_npy(&bytes).map_err(|reason| DaqError::Calibration {
        path: path.to_path_buf(),
        reason,
    })
}

/// Write an `f64` array as a version 1.0 `.npy` file.
pub fn write_npy(path: &Path, array: &ArrayD<f64>) -> AppResult<()> {
    fs::write(path, encode_npy(array))?;
    Ok(())
}

pub(crate) fn parse_npy(bytes: &[u8]) -> Result<ArrayD<f64>, String> {
    if bytes.len() < 10 || !bytes.starts_with(MAGIC) {
        return Err("missing NUMPY magic".to_string());
    }
    let (header_len, header_start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 if bytes.len() >= 12 => (
            u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize,
            12,
        ),
        major => return Err(format!("unsupported format version {major}")),
    };
    let data_start = header_start + header_len;
    let header = bytes
        .get(header_start..data_start)
        .ok_or("truncated header")?;
    let header = std::str::from_utf8(header).map_err(|e| format!("header is not text: {e}"))?;

    let dtype = Dtype::parse(&quoted_value(header, "descr")?)?;
    if header_value(header, "fortran_order")?.starts_with("True") {
        return Err("Fortran-ordered arrays are not supported".to_string());
    }
    let shape = parse_shape(header)?;

    let (count, byte_len) = shape
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .and_then(|count| Some((count, count.checked_mul(dtype.width())?)))
        .ok_or_else(|| format!("shape {shape:?} too large"))?;
    let payload = &bytes[data_start..];
    if payload.len() < byte_len {
        return Err(format!(
            "expected {byte_len} bytes of data, found {}",
            payload.len()
        ));
    }
    let values = payload
        .chunks_exact(dtype.width())
        .take(count)
        .map(|chunk| dtype.decode(chunk))
        .collect();
    ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| e.to_string())
}

fn encode_npy(array: &ArrayD<f64>) -> Vec<u8> {
    let shape = match array.shape() {
        [n] => format!("({n},)"),
        dims => format!(
            "({})",
            dims.iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    };
    let mut header = format!("{{'descr': '<f8', 'fortran_order': False, 'shape': {shape}, }}");
    // magic(6) + version(2) + length(2) + header + '\n'
    let unpadded = MAGIC.len() + 4 + header.len() + 1;
    let padding = (HEADER_ALIGN - unpadded % HEADER_ALIGN) % HEADER_ALIGN;
    header.push_str(&" ".repeat(padding));
    header.push('\n');

    let mut out = Vec::with_capacity(MAGIC.len() + 4 + header.len() + array.len() * 8);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&[1, 0]);
    out.extend_from_slice(&(header.len() as u16).to_le_bytes());
    out.extend_from_slice(header.as_bytes());
    for value in array.iter() {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Raw text following `'key':` in the header dict.
fn header_value<'a>(header: &'a str, key: &str) -> Result<&'a str, String> {
    let needle = format!("'{key}'");
    let start = header
        .find(&needle)
        .ok_or_else(|| format!("header has no '{key}' entry"))?;
    let rest = &header[start + needle.len()..];
    let colon = rest
        .find(':')
        .ok_or_else(|| format!("malformed '{key}' entry"))?;
    Ok(rest[colon + 1..].trim_start())
}

fn quoted_value(header: &str, key: &str) -> Result<String, String> {
    let value = header_value(header, key)?;
    let quote = value
        .chars()
        .next()
        .filter(|c| *c == '\'' || *c == '"')
        .ok_or_else(|| format!("'{key}' is not a string"))?;
    value[1..]
        .split(quote)
        .next()
        .map(str::to_string)
        .ok_or_else(|| format!("unterminated '{key}' string"))
}

fn parse_shape(header: &str) -> Result<Vec<usize>, String> {
    let value = header_value(header, "shape")?;
    let inner = value
        .strip_prefix('(')
        .and_then(|v| v.split(')').next())
        .ok_or("malformed shape tuple")?;
    inner
        .split(',')
        .map(str::trim)
        .filter(|dim| !dim.is_empty())
        .map(|dim| dim.trim_end_matches('L').parse::<usize>())
        .collect::<Result<_, _>>()
        .map_err(|e| format!("bad shape dimension: {e}"))
}
