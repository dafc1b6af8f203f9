//! GF(2^16) arithmetic via log/antilog tables.
//!
//! The field is generated by the primitive polynomial
//! `x^16 + x^12 + x^3 + x + 1` (0x1100B), the same discipline the classic
//! erasure-coding word size of 16 bits uses. Multiplication and division go
//! through the tables; addition is XOR.

use lazy_static::lazy_static;

/// Encoding word size in bits.
pub const WORD_BITS: u32 = 16;
/// Encoding word size in bytes.
pub const WORD_BYTES: usize = 2;
/// Number of field elements.
pub const FIELD_SIZE: usize = 1 << WORD_BITS;
/// Multiplicative group order.
pub const GROUP_ORDER: usize = FIELD_SIZE - 1;

const PRIMITIVE_POLY: u32 = 0x1_100B;

struct Tables {
    log: Vec<u16>,
    alog: Vec<u16>,
}

lazy_static! {
    static ref TABLES: Tables = {
        let mut log = vec![0_u16; FIELD_SIZE];
        let mut alog = vec![0_u16; 2 * GROUP_ORDER];
        let mut value: u32 = 1;
        for power in 0..GROUP_ORDER {
            alog[power] = value as u16;
            log[value as usize] = power as u16;
            value <<= 1;
            if value & (1 << WORD_BITS) != 0 {
                value ^= PRIMITIVE_POLY;
            }
        }
        // Mirror the antilog table so products of two logs index directly.
        for power in GROUP_ORDER..2 * GROUP_ORDER {
            alog[power] = alog[power - GROUP_ORDER];
        }
        Tables { log, alog }
    };
}

/// Field addition (and subtraction).
#[inline]
#[must_use]
pub const fn gf_add(a: u16, b: u16) -> u16 {
    a ^ b
}

/// Field multiplication.
#[inline]
#[must_use]
pub fn gf_mul(a: u16, b: u16) -> u16 {
    if a == 0 || b == 0 {
        return 0;
    }
    let tables = &*TABLES;
    let index = tables.log[a as usize] as usize + tables.log[b as usize] as usize;
    tables.alog[index]
}

/// Multiplicative inverse. Panics on zero in debug builds only through the
/// table lookup; callers must not pass zero.
#[inline]
#[must_use]
pub fn gf_inv(a: u16) -> u16 {
    debug_assert_ne!(a, 0, "zero has no inverse");
    let tables = &*TABLES;
    let index = GROUP_ORDER - tables.log[a as usize] as usize;
    tables.alog[index]
}

/// Field division.
#[inline]
#[must_use]
pub fn gf_div(a: u16, b: u16) -> u16 {
    if a == 0 {
        return 0;
    }
    gf_mul(a, gf_inv(b))
}

/// Exponentiation by squaring through the tables.
#[must_use]
pub fn gf_pow(base: u16, exponent: u32) -> u16 {
    if exponent == 0 {
        return 1;
    }
    if base == 0 {
        return 0;
    }
    let tables = &*TABLES;
    let log = u64::from(tables.log[base as usize]);
    let index = (log * u64::from(exponent)) % GROUP_ORDER as u64;
    tables.alog[index as usize]
}

/// Reference carry-less multiply used to cross-check the tables.
#[cfg(test)]
fn gf_mul_reference(mut a: u32, mut b: u32) -> u16 {
    let mut product: u32 = 0;
    while b != 0 {
        if b & 1 != 0 {
            product ^= a;
        }
        b >>= 1;
        a <<= 1;
        if a & (1 << WORD_BITS) != 0 {
            a ^= PRIMITIVE_POLY;
        }
    }
    product as u16
}
