//! Extended-precision (`long double`) conversion
//!
//! The host only carries doubles, so `long double` values are widened on the
//! way out and rounded on the way back. The native format is picked from the
//! type's size and the target: plain double at 8 bytes, x87 80-bit on x86,
//! IEEE binary128 elsewhere.

const F64_EXP_BIAS: i32 = 1023;
const EXT_EXP_BIAS: i32 = 16383;
const EXT_EXP_MAX: u16 = 0x7fff;

/// Native encoding of `long double` for a given storage size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Double,
    X87,
    Binary128,
}

impl Encoding {
    pub fn for_size(size: usize) -> Self {
        match size {
            8 => Self::Double,
            _ if cfg!(any(target_arch = "x86", target_arch = "x86_64")) => Self::X87,
            _ => Self::Binary128,
        }
    }
}

/// Write `value` into `size` bytes at `dst`
///
/// # Safety
/// `dst` must be valid for `size` bytes of writes.
pub unsafe fn write(dst: *mut u8, size: usize, value: f64) {
    let out = std::slice::from_raw_parts_mut(dst, size);
    out.fill(0);
    match Encoding::for_size(size) {
        Encoding::Double => out[..8].copy_from_slice(&value.to_ne_bytes()),
        Encoding::X87 => out[..10].copy_from_slice(&f64_to_x87(value)),
        Encoding::Binary128 => out[..16].copy_from_slice(&f64_to_binary128(value).to_ne_bytes()),
    }
}

/// Read a `long double` of `size` bytes at `src`, rounded to a double
///
/// # Safety
/// `src` must be valid for `size` bytes of reads.
pub unsafe fn read(src: *const u8, size: usize) -> f64 {
    let bytes = std::slice::from_raw_parts(src, size);
    match Encoding::for_size(size) {
        Encoding::Double => f64::from_ne_bytes(bytes[..8].try_into().unwrap_or([0; 8])),
        Encoding::X87 => x87_to_f64(bytes[..10].try_into().unwrap_or([0; 10])),
        Encoding::Binary128 => {
            binary128_to_f64(u128::from_ne_bytes(bytes[..16].try_into().unwrap_or([0; 16])))
        }
    }
}

/// x87 80-bit: 64-bit mantissa with explicit integer bit, then sign and
/// 15-bit exponent, little-endian
pub fn f64_to_x87(value: f64) -> [u8; 10] {
    let bits = value.to_bits();
    let sign = ((bits >> 63) as u16) << 15;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);

    let (e, m): (u16, u64) = match exp {
        0 if frac == 0 => (0, 0),
        0 => {
            // subnormal double: normalize so the integer bit is set
            let lz = frac.leading_zeros();
            ((EXT_EXP_BIAS - 1011 - lz as i32) as u16, frac << lz)
        }
        0x7ff => (EXT_EXP_MAX, (1u64 << 63) | (frac << 11)),
        _ => ((exp - F64_EXP_BIAS + EXT_EXP_BIAS) as u16, (1u64 << 63) | (frac << 11)),
    };

    let mut out = [0u8; 10];
    out[..8].copy_from_slice(&m.to_le_bytes());
    out[8..].copy_from_slice(&(sign | e).to_le_bytes());
    out
}

pub fn x87_to_f64(bytes: [u8; 10]) -> f64 {
    let mut m_bytes = [0u8; 8];
    m_bytes.copy_from_slice(&bytes[..8]);
    let m = u64::from_le_bytes(m_bytes);
    let se = u16::from_le_bytes([bytes[8], bytes[9]]);
    let negative = se & 0x8000 != 0;
    let e = se & EXT_EXP_MAX;

    let magnitude = if e == EXT_EXP_MAX {
        if m << 1 == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if m == 0 {
        0.0
    } else {
        let e = if e == 0 { 1 } else { i32::from(e) };
        scale(m as f64, e - EXT_EXP_BIAS - 63)
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// IEEE binary128: sign, 15-bit exponent, 112-bit fraction
pub fn f64_to_binary128(value: f64) -> u128 {
    let bits = value.to_bits();
    let sign = u128::from(bits >> 63) << 127;
    let exp = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);

    let (e, f): (u128, u128) = match exp {
        0 if frac == 0 => (0, 0),
        0 => {
            let lz = frac.leading_zeros() as i32;
            let mant = frac << (lz - 11);
            let biased = EXT_EXP_BIAS - 1011 - lz;
            (biased as u128, u128::from(mant & ((1u64 << 52) - 1)) << 60)
        }
        0x7ff => (u128::from(EXT_EXP_MAX), u128::from(frac) << 60),
        _ => ((exp - F64_EXP_BIAS + EXT_EXP_BIAS) as u128, u128::from(frac) << 60),
    };

    sign | (e << 112) | f
}

pub fn binary128_to_f64(bits: u128) -> f64 {
    let negative = bits >> 127 != 0;
    let e = ((bits >> 112) as u16) & EXT_EXP_MAX;
    let frac = bits & ((1u128 << 112) - 1);

    let magnitude = if e == EXT_EXP_MAX {
        if frac == 0 {
            f64::INFINITY
        } else {
            f64::NAN
        }
    } else if e == 0 && frac == 0 {
        0.0
    } else {
        let (implicit, e) = if e == 0 { (0u128, 1) } else { (1u128 << 112, i32::from(e)) };
        let m = ((implicit | frac) >> 60) as u64;
        scale(m as f64, e - EXT_EXP_BIAS - 52)
    };

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// `x * 2^k` without intermediate overflow or underflow of the power
fn scale(mut x: f64, mut k: i32) -> f64 {
    while k > 1000 {
        x *= 2f64.powi(1000);
        k -= 1000;
    }
    while k < -1000 {
        x *= 2f64.powi(-1000);
        k += 1000;
    }
    x * 2f64.powi(k)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLES: [f64; 9] = [
        0.0,
        1.0,
        -1.5,
        3.141592653589793,
        1e300,
        -2.5e-300,
        f64::MAX,
        f64::MIN_POSITIVE,
        5e-324,
    ];

    #[test]
    fn test_x87_round_trip() {
        for v in SAMPLES {
            assert_eq!(x87_to_f64(f64_to_x87(v)).to_bits(), v.to_bits(), "{v}");
        }
        assert_eq!(x87_to_f64(f64_to_x87(f64::INFINITY)), f64::INFINITY);
        assert!(x87_to_f64(f64_to_x87(f64::NAN)).is_nan());
    }

    #[test]
    fn test_x87_known_encoding() {
        // 1.0 = mantissa 0x8000000000000000, exponent 0x3fff
        let bytes = f64_to_x87(1.0);
        assert_eq!(&bytes[..8], &(1u64 << 63).to_le_bytes());
        assert_eq!(&bytes[8..], &0x3fffu16.to_le_bytes());
    }

    #[test]
    fn test_binary128_round_trip() {
        for v in SAMPLES {
            assert_eq!(binary128_to_f64(f64_to_binary128(v)).to_bits(), v.to_bits(), "{v}");
        }
        assert_eq!(f64_to_binary128(1.0), 0x3fffu128 << 112);
        assert_eq!(binary128_to_f64(f64_to_binary128(f64::NEG_INFINITY)), f64::NEG_INFINITY);
    }

    #[test]
    fn test_write_read_native() {
        let mut buf = [0u8; 16];
        unsafe {
            write(buf.as_mut_ptr(), 16, 2.75);
            assert_eq!(read(buf.as_ptr(), 16), 2.75);
            write(buf.as_mut_ptr(), 8, -4.0);
            assert_eq!(read(buf.as_ptr(), 8), -4.0);
        }
    }
}
