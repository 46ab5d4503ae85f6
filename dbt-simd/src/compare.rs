//! 逐通道比较。每个结果通道为全 1（真）或全 0（假）。
//!
//! `lt/gt/le/ge` 按有符号解释通道，`ult/ugt/ule/uge` 按无符号解释。

use crate::{LaneWidth, Vector128, lane_mask};

fn compare_signed(
    a: Vector128,
    b: Vector128,
    width: LaneWidth,
    pred: impl Fn(i64, i64) -> bool,
) -> Vector128 {
    a.zip_lanes(b, width, |x, y| {
        lane_mask(width, pred(width.sign_extend(x), width.sign_extend(y)))
    })
}

fn compare_unsigned(
    a: Vector128,
    b: Vector128,
    width: LaneWidth,
    pred: impl Fn(u64, u64) -> bool,
) -> Vector128 {
    a.zip_lanes(b, width, |x, y| lane_mask(width, pred(x, y)))
}

pub fn v128_eq(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_unsigned(a, b, width, |x, y| x == y)
}

pub fn v128_ne(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_unsigned(a, b, width, |x, y| x != y)
}

pub fn v128_lt(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_signed(a, b, width, |x, y| x < y)
}

pub fn v128_gt(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_signed(a, b, width, |x, y| x > y)
}

pub fn v128_le(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_signed(a, b, width, |x, y| x <= y)
}

pub fn v128_ge(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_signed(a, b, width, |x, y| x >= y)
}

pub fn v128_ult(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_unsigned(a, b, width, |x, y| x < y)
}

pub fn v128_ugt(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_unsigned(a, b, width, |x, y| x > y)
}

pub fn v128_ule(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_unsigned(a, b, width, |x, y| x <= y)
}

pub fn v128_uge(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    compare_unsigned(a, b, width, |x, y| x >= y)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signed_vs_unsigned_bytes() {
        // 0x80 作为有符号是 -128，作为无符号是 128
        let a = Vector128::splat(LaneWidth::B8, 0x80);
        let b = Vector128::splat(LaneWidth::B8, 0x01);
        assert_eq!(v128_lt(a, b, LaneWidth::B8), Vector128::ONES);
        assert_eq!(v128_ugt(a, b, LaneWidth::B8), Vector128::ONES);
        assert_eq!(v128_gt(a, b, LaneWidth::B8), Vector128::ZERO);
    }

    #[test]
    fn test_mixed_lanes() {
        let a = Vector128::new(0x0000_0001_0000_0005, 0);
        let b = Vector128::new(0x0000_0001_0000_0004, 0);
        let r = v128_eq(a, b, LaneWidth::B32);
        assert_eq!(r.lo, 0xFFFF_FFFF_0000_0000);
        assert_eq!(r.hi, u64::MAX);
        let ge = v128_ge(a, b, LaneWidth::B32);
        assert_eq!(ge, Vector128::ONES);
        let ne = v128_ne(a, b, LaneWidth::B32);
        assert_eq!(ne.lo, 0x0000_0000_FFFF_FFFF);
    }

    #[test]
    fn test_le_ule_64() {
        let a = Vector128::new(u64::MAX, 3);
        let b = Vector128::new(0, 3);
        assert_eq!(v128_le(a, b, LaneWidth::B64), Vector128::ONES);
        assert_eq!(v128_ule(a, b, LaneWidth::B64), Vector128::new(0, u64::MAX));
        assert_eq!(v128_uge(a, b, LaneWidth::B64), Vector128::ONES);
        assert_eq!(v128_ult(a, b, LaneWidth::B64), Vector128::ZERO);
    }
}
