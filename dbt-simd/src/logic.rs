//! 整体逻辑运算与移位
//!
//! `v128_shl`/`v128_shr`/`v128_sar` 把 128 位当作一个整体移位，位会在
//! 低/高两个半部之间流动；`*_lanes` 变体按通道独立移位。

use crate::{LaneWidth, Vector128};

pub fn v128_and(a: Vector128, b: Vector128) -> Vector128 {
    Vector128::new(a.lo & b.lo, a.hi & b.hi)
}

pub fn v128_or(a: Vector128, b: Vector128) -> Vector128 {
    Vector128::new(a.lo | b.lo, a.hi | b.hi)
}

pub fn v128_xor(a: Vector128, b: Vector128) -> Vector128 {
    Vector128::new(a.lo ^ b.lo, a.hi ^ b.hi)
}

pub fn v128_not(a: Vector128) -> Vector128 {
    Vector128::new(!a.lo, !a.hi)
}

/// a & !b
pub fn v128_bic(a: Vector128, b: Vector128) -> Vector128 {
    Vector128::new(a.lo & !b.lo, a.hi & !b.hi)
}

/// a | !b
pub fn v128_orn(a: Vector128, b: Vector128) -> Vector128 {
    Vector128::new(a.lo | !b.lo, a.hi | !b.hi)
}

/// 128 位逻辑左移，移位量 >= 128 时结果为 0
pub fn v128_shl(a: Vector128, amount: u32) -> Vector128 {
    match amount {
        0 => a,
        1..=63 => Vector128::new(a.lo << amount, (a.hi << amount) | (a.lo >> (64 - amount))),
        64..=127 => Vector128::new(0, a.lo << (amount - 64)),
        _ => Vector128::ZERO,
    }
}

/// 128 位逻辑右移，移位量 >= 128 时结果为 0
pub fn v128_shr(a: Vector128, amount: u32) -> Vector128 {
    match amount {
        0 => a,
        1..=63 => Vector128::new((a.lo >> amount) | (a.hi << (64 - amount)), a.hi >> amount),
        64..=127 => Vector128::new(a.hi >> (amount - 64), 0),
        _ => Vector128::ZERO,
    }
}

/// 128 位算术右移，移位量 >= 128 时结果为最高位的符号填充
pub fn v128_sar(a: Vector128, amount: u32) -> Vector128 {
    let fill = ((a.hi as i64) >> 63) as u64;
    match amount {
        0 => a,
        1..=63 => Vector128::new(
            (a.lo >> amount) | (a.hi << (64 - amount)),
            ((a.hi as i64) >> amount) as u64,
        ),
        64..=127 => Vector128::new(((a.hi as i64) >> (amount - 64)) as u64, fill),
        _ => Vector128::new(fill, fill),
    }
}

/// 逐通道左移（SHL 立即数形式），移位量超过通道宽度时通道清零
pub fn v128_shl_lanes(a: Vector128, amount: u32, width: LaneWidth) -> Vector128 {
    if amount >= width.bits() {
        return Vector128::ZERO;
    }
    a.map_lanes(width, |x| x << amount)
}

/// 逐通道逻辑右移（USHR），移位量等于通道宽度时结果为 0
pub fn v128_ushr_lanes(a: Vector128, amount: u32, width: LaneWidth) -> Vector128 {
    if amount >= width.bits() {
        return Vector128::ZERO;
    }
    a.map_lanes(width, |x| x >> amount)
}

/// 逐通道算术右移（SSHR），移位量饱和到通道宽度减一
pub fn v128_sshr_lanes(a: Vector128, amount: u32, width: LaneWidth) -> Vector128 {
    let amount = amount.min(width.bits() - 1);
    a.map_lanes(width, |x| (width.sign_extend(x) >> amount) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shl_crosses_halves() {
        let a = Vector128::new(0x8000_0000_0000_0001, 0);
        assert_eq!(v128_shl(a, 1), Vector128::new(2, 1));
        assert_eq!(v128_shl(a, 64), Vector128::new(0, 0x8000_0000_0000_0001));
        assert_eq!(v128_shl(a, 127), Vector128::new(0, 0x8000_0000_0000_0000));
        assert_eq!(v128_shl(a, 128), Vector128::ZERO);
    }

    #[test]
    fn test_shr_crosses_halves() {
        let a = Vector128::new(0, 1);
        assert_eq!(v128_shr(a, 1), Vector128::new(0x8000_0000_0000_0000, 0));
        assert_eq!(v128_shr(a, 64), Vector128::new(1, 0));
        assert_eq!(v128_shr(a, 200), Vector128::ZERO);
    }

    #[test]
    fn test_sar_sign_fill() {
        let neg = Vector128::new(0, 0x8000_0000_0000_0000);
        assert_eq!(v128_sar(neg, 64), Vector128::new(0x8000_0000_0000_0000, u64::MAX));
        assert_eq!(v128_sar(neg, 127), Vector128::ONES);
        assert_eq!(v128_sar(neg, 128), Vector128::ONES);
        assert_eq!(v128_sar(neg, 1000), Vector128::ONES);
        let pos = Vector128::new(u64::MAX, 0x7FFF_FFFF_FFFF_FFFF);
        assert_eq!(v128_sar(pos, 128), Vector128::ZERO);
    }

    #[test]
    fn test_lane_shifts() {
        let a = Vector128::splat(LaneWidth::B16, 0x8001);
        assert_eq!(v128_shl_lanes(a, 1, LaneWidth::B16), Vector128::splat(LaneWidth::B16, 0x0002));
        assert_eq!(v128_ushr_lanes(a, 15, LaneWidth::B16), Vector128::splat(LaneWidth::B16, 1));
        assert_eq!(v128_ushr_lanes(a, 16, LaneWidth::B16), Vector128::ZERO);
        assert_eq!(v128_sshr_lanes(a, 16, LaneWidth::B16), Vector128::ONES);
    }

    #[test]
    fn test_bic_orn() {
        let a = Vector128::new(0xFF00, 0xF0);
        let b = Vector128::new(0x0F00, 0xFF);
        assert_eq!(v128_bic(a, b), Vector128::new(0xF000, 0));
        assert_eq!(v128_orn(Vector128::ZERO, Vector128::ONES), Vector128::ZERO);
    }
}
