//! Dense HyperLogLog sketch over a [`Bitmap`].
//!
//! Registers are 6 bits wide, packed five to a host-native `u32` word
//! so no register ever straddles a word. The packed form in the bitmap
//! is the persisted form; there is no separate decoded array, so the
//! register file is consistent with the sketch at all times. Word order
//! follows the host byte order, which makes register files non-portable
//! across architectures of differing endianness.

use crate::bitmap::Bitmap;
use crate::{HlldError, Result};

/// 16 registers.
pub const MIN_PRECISION: u8 = 4;
/// 262,144 registers.
pub const MAX_PRECISION: u8 = 18;

const REG_WIDTH: u64 = 6;
const REG_PER_WORD: u64 = 32 / REG_WIDTH;

/// Hashes a key for [`Hll::add_hash`]. The sketch consumes the low 64
/// bits of a high-quality 128-bit (or wider) digest.
pub fn hash_key(key: &[u8]) -> u64 {
    let digest = blake3::hash(key);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().unwrap())
}

/// Variance upper bound for a precision: `1.04 / sqrt(2^p)`.
pub fn error_for_precision(precision: u8) -> Result<f64> {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return Err(HlldError::InvalidArgument(format!(
            "precision {precision} out of range"
        )));
    }
    let registers = (1u64 << precision) as f64;
    Ok(1.04 / registers.sqrt())
}

/// Smallest precision whose error bound is at or below `err`.
pub fn precision_for_error(err: f64) -> Result<u8> {
    if err <= 0.0 || err >= 1.0 {
        return Err(HlldError::InvalidArgument(format!(
            "error rate {err} out of range"
        )));
    }
    for precision in MIN_PRECISION..=MAX_PRECISION {
        if error_for_precision(precision)? <= err {
            return Ok(precision);
        }
    }
    Err(HlldError::InvalidArgument(format!(
        "error rate {err} requires precision above {MAX_PRECISION}"
    )))
}

/// Bytes needed to pack the registers of a precision, or 0 when the
/// precision is out of range.
pub fn bytes_for_precision(precision: u8) -> u64 {
    if !(MIN_PRECISION..=MAX_PRECISION).contains(&precision) {
        return 0;
    }
    let registers = 1u64 << precision;
    registers.div_ceil(REG_PER_WORD) * 4
}

pub struct Hll {
    precision: u8,
    bitmap: Bitmap,
}

impl Hll {
    /// A fresh in-memory sketch.
    pub fn new(precision: u8) -> Result<Self> {
        let bytes = bytes_for_precision(precision);
        if bytes == 0 {
            return Err(HlldError::InvalidArgument(format!(
                "precision {precision} out of range"
            )));
        }
        Self::from_bitmap(precision, Bitmap::anonymous(bytes)?)
    }

    /// Wraps an existing register bitmap. The bitmap length must match
    /// the precision exactly; a differently-sized register file is
    /// refused rather than reinterpreted.
    pub fn from_bitmap(precision: u8, bitmap: Bitmap) -> Result<Self> {
        let expected = bytes_for_precision(precision);
        if expected == 0 {
            return Err(HlldError::InvalidArgument(format!(
                "precision {precision} out of range"
            )));
        }
        if bitmap.len() != expected {
            return Err(HlldError::SizeMismatch {
                expected,
                found: bitmap.len(),
            });
        }
        Ok(Self { precision, bitmap })
    }

    pub fn precision(&self) -> u8 {
        self.precision
    }

    pub fn byte_size(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Releases the sketch, handing back the register bitmap.
    pub fn into_bitmap(self) -> Bitmap {
        self.bitmap
    }

    fn register(&self, idx: u64) -> u32 {
        let word = (idx / REG_PER_WORD) as usize * 4;
        let w = u32::from_ne_bytes(self.bitmap.as_slice()[word..word + 4].try_into().unwrap());
        (w >> (REG_WIDTH * (idx % REG_PER_WORD))) & 0x3F
    }

    fn set_register(&mut self, idx: u64, value: u32) {
        let word = (idx / REG_PER_WORD) as usize * 4;
        let shift = REG_WIDTH * (idx % REG_PER_WORD);
        let bytes = self.bitmap.as_mut_slice();
        let mut w = u32::from_ne_bytes(bytes[word..word + 4].try_into().unwrap());
        w &= !(0x3F << shift);
        w |= value << shift;
        bytes[word..word + 4].copy_from_slice(&w.to_ne_bytes());
    }

    /// Convenience wrapper hashing the key first.
    pub fn add(&mut self, key: &[u8]) {
        self.add_hash(hash_key(key));
    }

    /// Observes a hashed key: the top `p` bits pick a register, the
    /// rank of the remainder (with a sentinel bounding the scan) is
    /// folded in with max.
    pub fn add_hash(&mut self, hash: u64) {
        let p = self.precision;
        let idx = hash >> (64 - p);
        let w = (hash << p) | (1u64 << (p - 1));
        let rank = w.leading_zeros() + 1;
        if rank > self.register(idx) {
            self.set_register(idx, rank);
        }
    }

    /// Cardinality estimate with small- and large-range corrections.
    pub fn estimate(&self) -> f64 {
        let m = 1u64 << self.precision;
        let mut sum = 0f64;
        let mut zeros = 0u64;
        for i in 0..m {
            let r = self.register(i);
            if r == 0 {
                zeros += 1;
            }
            sum += 1.0 / (1u64 << r) as f64;
        }

        let m = m as f64;
        let alpha = match m as u64 {
            16 => 0.673,
            32 => 0.697,
            64 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / m),
        };
        let raw = alpha * m * m / sum;

        if raw <= 2.5 * m && zeros > 0 {
            m * (m / zeros as f64).ln()
        } else if raw > (1u64 << 32) as f64 / 30.0 {
            let two32 = (1u64 << 32) as f64;
            -two32 * (1.0 - raw / two32).ln()
        } else {
            raw
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_precision_rejected() {
        assert!(Hll::new(MIN_PRECISION - 1).is_err());
        assert!(Hll::new(MAX_PRECISION + 1).is_err());
        assert!(Hll::new(MIN_PRECISION).is_ok());
        assert!(Hll::new(MAX_PRECISION).is_ok());
    }

    #[test]
    fn test_empty_estimate_is_zero() {
        let h = Hll::new(10).unwrap();
        assert_eq!(h.estimate(), 0.0);
    }

    #[test]
    fn test_register_packing_roundtrip() {
        let mut h = Hll::new(10).unwrap();
        for i in 0..1024 {
            h.set_register(i, (i % 64) as u32);
        }
        for i in 0..1024 {
            assert_eq!(h.register(i), (i % 64) as u32, "register {i}");
        }
    }

    #[test]
    fn test_add_hash_targets_top_bits() {
        let mut h = Hll::new(4).unwrap();
        // Register index comes from the top 4 bits; the payload below
        // is all zero, so the sentinel at bit p-1 bounds the rank.
        h.add_hash(0xF000_0000_0000_0000);
        assert_eq!(h.register(15), 61);
        // All-ones payload has rank 1.
        h.add_hash(0x0FFF_FFFF_FFFF_FFFF);
        assert_eq!(h.register(0), 1);
    }

    #[test]
    fn test_add_keeps_max_rank() {
        let mut h = Hll::new(4).unwrap();
        h.add_hash(0x0FFF_FFFF_FFFF_FFFF);
        assert_eq!(h.register(0), 1);
        h.add_hash(0x00FF_FFFF_FFFF_FFFF);
        assert_eq!(h.register(0), 5);
        h.add_hash(0x0FFF_FFFF_FFFF_FFFF);
        assert_eq!(h.register(0), 5);
    }

    #[test]
    fn test_small_set_estimate() {
        let mut h = Hll::new(10).unwrap();
        for i in 0..100 {
            h.add(format!("test{i}").as_bytes());
        }
        let s = h.estimate();
        assert!(s > 95.0 && s < 105.0, "estimate {s}");
    }

    #[test]
    fn test_estimate_from_external_bitmap() {
        let bm = Bitmap::anonymous(bytes_for_precision(10)).unwrap();
        let mut h = Hll::from_bitmap(10, bm).unwrap();
        for i in 0..100 {
            h.add(format!("test{i}").as_bytes());
        }
        let s = h.estimate();
        assert!(s > 95.0 && s < 105.0, "estimate {s}");
    }

    #[test]
    fn test_error_bound() {
        let mut h = Hll::new(14).unwrap();
        for i in 0..10_000 {
            h.add(format!("test{i}").as_bytes());
        }
        let s = h.estimate();
        assert!(s > 9900.0 && s < 10100.0, "estimate {s}");
    }

    #[test]
    fn test_error_bound_large() {
        // Well past the linear-counting cutover, into the raw regime.
        let mut h = Hll::new(12).unwrap();
        for i in 0..100_000 {
            h.add(format!("test{i}").as_bytes());
        }
        let s = h.estimate();
        let bound = 3.0 * error_for_precision(12).unwrap();
        let err = (s - 100_000.0).abs() / 100_000.0;
        assert!(err <= bound, "estimate {s} off by {err}");
    }

    #[test]
    fn test_duplicates_do_not_count() {
        let mut h = Hll::new(12).unwrap();
        for _ in 0..10 {
            for i in 0..500 {
                h.add(format!("key{i}").as_bytes());
            }
        }
        let s = h.estimate();
        assert!(s > 480.0 && s < 520.0, "estimate {s}");
    }

    #[test]
    fn test_precision_for_error() {
        assert!(precision_for_error(1.0).is_err());
        assert!(precision_for_error(0.0).is_err());
        assert!(precision_for_error(1e-9).is_err());
        assert_eq!(precision_for_error(0.02).unwrap(), 12);
        assert_eq!(precision_for_error(0.01).unwrap(), 14);
        assert_eq!(precision_for_error(0.005).unwrap(), 16);
    }

    #[test]
    fn test_error_for_precision() {
        assert!(error_for_precision(3).is_err());
        assert!(error_for_precision(20).is_err());
        assert_eq!(error_for_precision(12).unwrap(), 0.01625);
        assert_eq!(error_for_precision(10).unwrap(), 0.0325);
        assert_eq!(error_for_precision(16).unwrap(), 0.0040625);
    }

    #[test]
    fn test_error_precision_inverse() {
        for p in MIN_PRECISION..=MAX_PRECISION {
            let err = error_for_precision(p).unwrap();
            assert_eq!(precision_for_error(err).unwrap(), p);
        }
    }

    #[test]
    fn test_bytes_for_precision() {
        assert_eq!(bytes_for_precision(3), 0);
        assert_eq!(bytes_for_precision(20), 0);
        assert_eq!(bytes_for_precision(10), 820);
        assert_eq!(bytes_for_precision(12), 3280);
        assert_eq!(bytes_for_precision(16), 52432);
    }
}
