//! 逐通道整数算术，按通道宽度回绕，不产生溢出异常。

use crate::{LaneWidth, Vector128};

/// 逐通道加法
pub fn v128_add(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    if width == LaneWidth::B64 {
        return Vector128::new(a.lo.wrapping_add(b.lo), a.hi.wrapping_add(b.hi));
    }
    a.zip_lanes(b, width, |x, y| x.wrapping_add(y))
}

/// 逐通道减法
pub fn v128_sub(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    if width == LaneWidth::B64 {
        return Vector128::new(a.lo.wrapping_sub(b.lo), a.hi.wrapping_sub(b.hi));
    }
    a.zip_lanes(b, width, |x, y| x.wrapping_sub(y))
}

/// 逐通道乘法，保留低位
pub fn v128_mul(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    a.zip_lanes(b, width, |x, y| x.wrapping_mul(y))
}

/// 逐通道取负
pub fn v128_neg(a: Vector128, width: LaneWidth) -> Vector128 {
    a.map_lanes(width, |x| x.wrapping_neg())
}
