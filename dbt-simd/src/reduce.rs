//! 跨通道归约，返回单个通道宽度的标量。

use crate::{LaneWidth, Vector128};

fn lanes(a: Vector128, width: LaneWidth) -> impl Iterator<Item = u64> {
    (0..width.lanes()).map(move |i| a.lane(width, i))
}

/// 所有通道求和，结果按通道宽度回绕
pub fn v128_addv(a: Vector128, width: LaneWidth) -> u64 {
    lanes(a, width).fold(0u64, |acc, x| acc.wrapping_add(x)) & width.mask()
}

/// 无符号最大值
pub fn v128_umaxv(a: Vector128, width: LaneWidth) -> u64 {
    lanes(a, width).max().unwrap_or(0)
}

/// 无符号最小值
pub fn v128_uminv(a: Vector128, width: LaneWidth) -> u64 {
    lanes(a, width).min().unwrap_or(0)
}

/// 有符号最大值（按通道宽度符号扩展后返回）
pub fn v128_smaxv(a: Vector128, width: LaneWidth) -> i64 {
    lanes(a, width)
        .map(|x| width.sign_extend(x))
        .max()
        .unwrap_or(0)
}

/// 有符号最小值
pub fn v128_sminv(a: Vector128, width: LaneWidth) -> i64 {
    lanes(a, width)
        .map(|x| width.sign_extend(x))
        .min()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addv_wraps_to_lane() {
        let a = Vector128::splat(LaneWidth::B8, 0x20);
        // 16 * 0x20 = 0x200 -> 0x00
        assert_eq!(v128_addv(a, LaneWidth::B8), 0);
        let b = Vector128::new(0x0003_0002_0001_0000, 0);
        assert_eq!(v128_addv(b, LaneWidth::B16), 6);
    }

    #[test]
    fn test_signed_and_unsigned_extremes_differ() {
        let a = Vector128::new(0x0000_0000_0000_80_7F, 0);
        assert_eq!(v128_umaxv(a, LaneWidth::B8), 0x80);
        assert_eq!(v128_smaxv(a, LaneWidth::B8), 0x7F);
        assert_eq!(v128_sminv(a, LaneWidth::B8), -128);
        assert_eq!(v128_uminv(a, LaneWidth::B8), 0);
    }

    #[test]
    fn test_64bit_reductions() {
        let a = Vector128::new(u64::MAX, 1);
        assert_eq!(v128_umaxv(a, LaneWidth::B64), u64::MAX);
        assert_eq!(v128_sminv(a, LaneWidth::B64), -1);
        assert_eq!(v128_addv(a, LaneWidth::B64), 0);
    }
}
