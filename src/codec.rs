//! Element types and the binary sample codec.
//!
//! Slices store their samples as a flat byte sequence. Fixed-width types are
//! written little-endian. The 24-bit types are packed into three bytes per
//! sample, least significant byte first (`u24`, `i24`) or most significant
//! byte first (`u24_be`, `i24_be`).
//!
//! Values outside the representable range of an integral type are clamped to
//! the nearest boundary. The clamping is reported back to the caller in the
//! returned [`Encoded`] / [`Packed24`] and logged; no value is ever dropped.
//!
//! # Examples
//!
//! ```
//! use slice_recorder::codec::{decode_packed24, encode_packed24, ByteOrder};
//!
//! let packed = encode_packed24(&[-1, 0, 8_388_607], ByteOrder::Lsb, true);
//! assert!(packed.clamped.is_empty());
//! assert_eq!(packed.bytes.len(), 9);
//!
//! let decoded = decode_packed24(&packed.bytes, ByteOrder::Lsb, true).unwrap();
//! assert_eq!(decoded, vec![-1, 0, 8_388_607]);
//! ```

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

const I24_MIN: i64 = -(1 << 23);
const I24_MAX: i64 = (1 << 23) - 1;
const U24_MAX: i64 = (1 << 24) - 1;

/// Byte order of a packed 24-bit sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    /// Least significant byte first.
    Lsb,
    /// Most significant byte first.
    Msb,
}

/// Element type of a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    U8,
    I8,
    U16,
    I16,
    U24,
    I24,
    #[serde(rename = "u24_be")]
    U24Be,
    #[serde(rename = "i24_be")]
    I24Be,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

/// A value after casting to an element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cast {
    pub value: f64,
    /// The input had a fractional part and was rounded.
    pub rounded: bool,
    /// The input was outside the representable range and was clamped.
    pub clamped: bool,
}

impl DType {
    /// Size of one encoded sample in bytes.
    pub fn size(self) -> usize {
        match self {
            DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 => 2,
            DType::U24 | DType::I24 | DType::U24Be | DType::I24Be => 3,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    pub fn is_integral(self) -> bool {
        !matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            DType::I8 | DType::I16 | DType::I24 | DType::I24Be | DType::I32 | DType::I64 | DType::F32 | DType::F64
        )
    }

    /// Inclusive representable range, as `f64`.
    pub fn range(self) -> (f64, f64) {
        match self {
            DType::U8 => (0.0, u8::MAX as f64),
            DType::I8 => (i8::MIN as f64, i8::MAX as f64),
            DType::U16 => (0.0, u16::MAX as f64),
            DType::I16 => (i16::MIN as f64, i16::MAX as f64),
            DType::U24 | DType::U24Be => (0.0, U24_MAX as f64),
            DType::I24 | DType::I24Be => (I24_MIN as f64, I24_MAX as f64),
            DType::U32 => (0.0, u32::MAX as f64),
            DType::I32 => (i32::MIN as f64, i32::MAX as f64),
            DType::U64 => (0.0, u64::MAX as f64),
            DType::I64 => (i64::MIN as f64, i64::MAX as f64),
            DType::F32 => (f32::MIN as f64, f32::MAX as f64),
            DType::F64 => (f64::MIN, f64::MAX),
        }
    }

    /// Number of samples a slice of `capacity_bytes` holds. Never zero.
    pub fn samples_per_slice(self, capacity_bytes: usize) -> usize {
        (capacity_bytes / self.size()).max(1)
    }

    /// Validates `value` for this element type.
    ///
    /// Integral types round fractional values and clamp out-of-range ones
    /// (the caller logs both). Unsigned types reject negative values, and
    /// every integral type rejects non-finite values. `f32` values are
    /// narrowed to the nearest `f32`, so the result is exactly what a
    /// reload decodes.
    pub fn cast(self, value: f64) -> Result<Cast> {
        match self {
            DType::F64 => return Ok(Cast { value, rounded: false, clamped: false }),
            DType::F32 => {
                let (lo, hi) = self.range();
                let clamped = if value.is_finite() { value.clamp(lo, hi) } else { value };
                return Ok(Cast { value: clamped as f32 as f64, rounded: false, clamped: clamped != value });
            }
            _ => {}
        }
        if !value.is_finite() {
            return Err(Error::InvalidInput(format!("{} cannot hold non-finite value {}", self, value)));
        }
        if !self.is_signed() && value < 0.0 {
            return Err(Error::InvalidInput(format!("{} cannot hold negative value {}", self, value)));
        }
        let rounded = value.round();
        let (lo, hi) = self.range();
        let clamped = rounded.clamp(lo, hi);
        Ok(Cast { value: clamped, rounded: rounded != value, clamped: clamped != rounded })
    }

    fn packed24(self) -> Option<(ByteOrder, bool)> {
        match self {
            DType::U24 => Some((ByteOrder::Lsb, false)),
            DType::I24 => Some((ByteOrder::Lsb, true)),
            DType::U24Be => Some((ByteOrder::Msb, false)),
            DType::I24Be => Some((ByteOrder::Msb, true)),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DType::U8 => "u8",
            DType::I8 => "i8",
            DType::U16 => "u16",
            DType::I16 => "i16",
            DType::U24 => "u24",
            DType::I24 => "i24",
            DType::U24Be => "u24_be",
            DType::I24Be => "i24_be",
            DType::U32 => "u32",
            DType::I32 => "i32",
            DType::U64 => "u64",
            DType::I64 => "i64",
            DType::F32 => "f32",
            DType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Packed 24-bit output together with the indices that had to be clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packed24 {
    pub bytes: Vec<u8>,
    pub clamped: Vec<usize>,
}

/// Encoded sample bytes together with the number of clamped values.
#[derive(Debug, Clone, PartialEq)]
pub struct Encoded {
    pub bytes: Vec<u8>,
    pub clamped: usize,
}

/// Packs `values` into three bytes each.
///
/// Values outside `[-2^23, 2^23 - 1]` (signed) or `[0, 2^24 - 1]` (unsigned)
/// are clamped and their indices returned in [`Packed24::clamped`].
pub fn encode_packed24(values: &[i64], order: ByteOrder, signed: bool) -> Packed24 {
    let (lo, hi) = if signed { (I24_MIN, I24_MAX) } else { (0, U24_MAX) };
    let mut bytes = Vec::with_capacity(values.len() * 3);
    let mut clamped = Vec::new();

    for (i, &v) in values.iter().enumerate() {
        let v = if v < lo || v > hi {
            clamped.push(i);
            v.clamp(lo, hi)
        } else {
            v
        };
        let raw = (v as u32) & 0x00FF_FFFF;
        let le = [raw as u8, (raw >> 8) as u8, (raw >> 16) as u8];
        match order {
            ByteOrder::Lsb => bytes.extend_from_slice(&le),
            ByteOrder::Msb => bytes.extend_from_slice(&[le[2], le[1], le[0]]),
        }
    }

    if !clamped.is_empty() {
        warn!(count = clamped.len(), signed, "Clamped out-of-range values while packing 24-bit samples");
    }
    Packed24 { bytes, clamped }
}

/// Unpacks three-byte samples.
///
/// # Errors
///
/// [`Error::Codec`] if `bytes.len()` is not a multiple of three.
pub fn decode_packed24(bytes: &[u8], order: ByteOrder, signed: bool) -> Result<Vec<i64>> {
    if bytes.len() % 3 != 0 {
        return Err(Error::Codec(format!("packed 24-bit buffer of {} bytes is not a multiple of 3", bytes.len())));
    }
    let mut reader = ByteReader::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() / 3);
    while let Some(b) = reader.read_bytes(3) {
        let raw = match order {
            ByteOrder::Lsb => b[0] as u32 | (b[1] as u32) << 8 | (b[2] as u32) << 16,
            ByteOrder::Msb => b[2] as u32 | (b[1] as u32) << 8 | (b[0] as u32) << 16,
        };
        let v = if signed && raw & 0x0080_0000 != 0 {
            raw as i64 - (1 << 24)
        } else {
            raw as i64
        };
        out.push(v);
    }
    Ok(out)
}

/// Encodes `values` as `dtype` samples.
///
/// Integral types expect values already passed through [`DType::cast`];
/// anything still out of range is clamped and counted.
pub fn encode_values(values: &[f64], dtype: DType) -> Encoded {
    if let Some((order, signed)) = dtype.packed24() {
        let ints: Vec<i64> = values.iter().map(|v| v.round() as i64).collect();
        let packed = encode_packed24(&ints, order, signed);
        return Encoded { bytes: packed.bytes, clamped: packed.clamped.len() };
    }

    let (lo, hi) = dtype.range();
    let mut bytes = Vec::with_capacity(values.len() * dtype.size());
    let mut clamped = 0;
    for &v in values {
        let v = if dtype.is_integral() && (v < lo || v > hi) {
            clamped += 1;
            v.clamp(lo, hi)
        } else {
            v
        };
        // `as` saturates float-to-int conversions, matching the clamp above.
        match dtype {
            DType::U8 => bytes.push(v as u8),
            DType::I8 => bytes.push(v as i8 as u8),
            DType::U16 => bytes.extend_from_slice(&(v as u16).to_le_bytes()),
            DType::I16 => bytes.extend_from_slice(&(v as i16).to_le_bytes()),
            DType::U32 => bytes.extend_from_slice(&(v as u32).to_le_bytes()),
            DType::I32 => bytes.extend_from_slice(&(v as i32).to_le_bytes()),
            DType::U64 => bytes.extend_from_slice(&(v as u64).to_le_bytes()),
            DType::I64 => bytes.extend_from_slice(&(v as i64).to_le_bytes()),
            DType::F32 => bytes.extend_from_slice(&(v as f32).to_le_bytes()),
            DType::F64 => bytes.extend_from_slice(&v.to_le_bytes()),
            DType::U24 | DType::I24 | DType::U24Be | DType::I24Be => unreachable!("handled above"),
        }
    }

    if clamped > 0 {
        warn!(count = clamped, dtype = %dtype, "Clamped out-of-range values while encoding");
    }
    Encoded { bytes, clamped }
}

/// Decodes `dtype` samples from `bytes`.
///
/// # Errors
///
/// [`Error::Codec`] if the length is not a multiple of the element size.
pub fn decode_values(bytes: &[u8], dtype: DType) -> Result<Vec<f64>> {
    if let Some((order, signed)) = dtype.packed24() {
        return Ok(decode_packed24(bytes, order, signed)?.into_iter().map(|v| v as f64).collect());
    }

    let size = dtype.size();
    if bytes.len() % size != 0 {
        return Err(Error::Codec(format!(
            "{} bytes is not a whole number of {} samples",
            bytes.len(),
            dtype
        )));
    }

    let mut reader = ByteReader::new(bytes);
    let mut out = Vec::with_capacity(bytes.len() / size);
    while let Some(b) = reader.read_bytes(size) {
        let v = match dtype {
            DType::U8 => b[0] as f64,
            DType::I8 => b[0] as i8 as f64,
            DType::U16 => u16::from_le_bytes([b[0], b[1]]) as f64,
            DType::I16 => i16::from_le_bytes([b[0], b[1]]) as f64,
            DType::U32 => u32::from_le_bytes(reader_array(b)) as f64,
            DType::I32 => i32::from_le_bytes(reader_array(b)) as f64,
            DType::F32 => f32::from_le_bytes(reader_array(b)) as f64,
            DType::U64 => u64::from_le_bytes(reader_array(b)) as f64,
            DType::I64 => i64::from_le_bytes(reader_array(b)) as f64,
            DType::F64 => f64::from_le_bytes(reader_array(b)),
            DType::U24 | DType::I24 | DType::U24Be | DType::I24Be => unreachable!("handled above"),
        };
        out.push(v);
    }
    Ok(out)
}

fn reader_array<const N: usize>(b: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&b[..N]);
    out
}

/// Sequential reader over a byte buffer.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Reads `len` bytes from the current position.
    ///
    /// # Returns
    /// `Some(&[u8])` if there are enough bytes remaining, `None` otherwise
    fn read_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.pos + len <= self.data.len() {
            let slice = &self.data[self.pos..self.pos + len];
            self.pos += len;
            Some(slice)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_layout() {
        let packed = encode_packed24(&[0x010203], ByteOrder::Msb, false);
        assert_eq!(packed.bytes, vec![0x01, 0x02, 0x03]);
        let packed = encode_packed24(&[0x010203], ByteOrder::Lsb, false);
        assert_eq!(packed.bytes, vec![0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_negative_sign_extension() {
        let packed = encode_packed24(&[-2], ByteOrder::Lsb, true);
        assert_eq!(packed.bytes, vec![0xFE, 0xFF, 0xFF]);
        assert_eq!(decode_packed24(&packed.bytes, ByteOrder::Lsb, true).unwrap(), vec![-2]);
        // The same bytes read unsigned are a large positive number.
        assert_eq!(decode_packed24(&packed.bytes, ByteOrder::Lsb, false).unwrap(), vec![0xFF_FFFE]);
    }

    #[test]
    fn test_cast_rules() {
        assert_eq!(DType::U8.cast(3.4).unwrap(), Cast { value: 3.0, rounded: true, clamped: false });
        assert_eq!(DType::I16.cast(-7.0).unwrap(), Cast { value: -7.0, rounded: false, clamped: false });
        assert_eq!(DType::U8.cast(300.0).unwrap(), Cast { value: 255.0, rounded: false, clamped: true });
        assert!(DType::U16.cast(-1.0).is_err());
        assert!(DType::I32.cast(f64::NAN).is_err());
        assert_eq!(DType::F32.cast(0.25).unwrap().value, 0.25);
        assert_eq!(DType::F32.cast(36.1).unwrap().value, 36.1f32 as f64);
        assert_eq!(DType::F32.cast(1e40).unwrap(), Cast { value: f32::MAX as f64, rounded: false, clamped: true });
        assert!(DType::F32.cast(f64::NAN).unwrap().value.is_nan());
        assert_eq!(DType::F64.cast(36.1).unwrap().value, 36.1);
    }

    #[test]
    fn test_samples_per_slice() {
        assert_eq!(DType::U8.samples_per_slice(24), 24);
        assert_eq!(DType::I24.samples_per_slice(24), 8);
        assert_eq!(DType::F64.samples_per_slice(24), 3);
        assert_eq!(DType::F64.samples_per_slice(4), 1);
    }
}
