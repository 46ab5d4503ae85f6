//! dbt-simd - 客户机 128 位向量运算库
//!
//! 为解释器提供向量指令的回退实现，同时作为 JIT 生成代码的参考结果。
//!
//! ## 特性
//! - 8/16/32/64 位通道参数化的算术运算（按通道宽度回绕）
//! - 128 位整体逻辑运算与跨半部移位
//! - 逐通道比较，结果为全 1 / 全 0 掩码
//! - 跨通道归约（有符号与无符号分开）
//! - zip / ext / 按字节提取与插入
//!
//! 所有函数都是纯函数，不会失败。

use serde::{Deserialize, Serialize};

mod arith;
mod compare;
mod logic;
mod permute;
mod reduce;

pub use arith::{v128_add, v128_mul, v128_neg, v128_sub};
pub use compare::{
    v128_eq, v128_ge, v128_gt, v128_le, v128_lt, v128_ne, v128_uge, v128_ugt, v128_ule,
    v128_ult,
};
pub use logic::{
    v128_and, v128_bic, v128_not, v128_or, v128_orn, v128_sar, v128_shl, v128_shl_lanes,
    v128_shr, v128_sshr_lanes, v128_ushr_lanes, v128_xor,
};
pub use permute::{v128_ext, v128_extract, v128_insert, v128_zip_hi, v128_zip_lo};
pub use reduce::{v128_addv, v128_smaxv, v128_sminv, v128_umaxv, v128_uminv};

/// 向量通道宽度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LaneWidth {
    B8,
    B16,
    B32,
    B64,
}

impl LaneWidth {
    /// 按指令中的 2 位 size 字段解码（00=8, 01=16, 10=32, 11=64）
    pub const fn from_size_field(size: u32) -> Self {
        match size & 0b11 {
            0 => LaneWidth::B8,
            1 => LaneWidth::B16,
            2 => LaneWidth::B32,
            _ => LaneWidth::B64,
        }
    }

    pub const fn bits(self) -> u32 {
        match self {
            LaneWidth::B8 => 8,
            LaneWidth::B16 => 16,
            LaneWidth::B32 => 32,
            LaneWidth::B64 => 64,
        }
    }

    pub const fn bytes(self) -> usize {
        (self.bits() / 8) as usize
    }

    /// 128 位向量中的通道数量
    pub const fn lanes(self) -> usize {
        (128 / self.bits()) as usize
    }

    /// 单个通道的位掩码
    pub const fn mask(self) -> u64 {
        match self {
            LaneWidth::B64 => u64::MAX,
            w => (1u64 << w.bits()) - 1,
        }
    }

    /// 将通道值按符号扩展为 i64
    pub const fn sign_extend(self, value: u64) -> i64 {
        let shift = 64 - self.bits();
        ((value << shift) as i64) >> shift
    }
}

/// 128 位向量值，低 64 位与高 64 位分开存放
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vector128 {
    pub lo: u64,
    pub hi: u64,
}

impl Vector128 {
    pub const ZERO: Vector128 = Vector128 { lo: 0, hi: 0 };
    pub const ONES: Vector128 = Vector128 {
        lo: u64::MAX,
        hi: u64::MAX,
    };

    pub const fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    pub const fn from_u128(value: u128) -> Self {
        Self {
            lo: value as u64,
            hi: (value >> 64) as u64,
        }
    }

    pub const fn to_u128(self) -> u128 {
        ((self.hi as u128) << 64) | self.lo as u128
    }

    /// 小端字节序：字节 0 为最低有效字节
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self::from_u128(u128::from_le_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 16] {
        self.to_u128().to_le_bytes()
    }

    /// 每个通道都写入同一个值
    pub fn splat(width: LaneWidth, value: u64) -> Self {
        (0..width.lanes()).fold(Self::ZERO, |acc, i| acc.with_lane(width, i, value))
    }

    /// 读取第 `index` 个通道，越界返回 0
    pub fn lane(self, width: LaneWidth, index: usize) -> u64 {
        if index >= width.lanes() {
            return 0;
        }
        let shift = index as u32 * width.bits();
        (self.to_u128() >> shift) as u64 & width.mask()
    }

    /// 替换第 `index` 个通道，越界时原样返回
    pub fn with_lane(self, width: LaneWidth, index: usize, value: u64) -> Self {
        if index >= width.lanes() {
            return self;
        }
        let shift = index as u32 * width.bits();
        let mask = (width.mask() as u128) << shift;
        let merged = (self.to_u128() & !mask) | (((value & width.mask()) as u128) << shift);
        Self::from_u128(merged)
    }

    /// 清除高 64 位（64 位向量形式的写回语义）
    pub const fn clear_upper(self) -> Self {
        Self { lo: self.lo, hi: 0 }
    }

    pub(crate) fn map_lanes(self, width: LaneWidth, op: impl Fn(u64) -> u64) -> Self {
        (0..width.lanes()).fold(Self::ZERO, |acc, i| {
            acc.with_lane(width, i, op(self.lane(width, i)))
        })
    }

    pub(crate) fn zip_lanes(
        self,
        other: Self,
        width: LaneWidth,
        op: impl Fn(u64, u64) -> u64,
    ) -> Self {
        (0..width.lanes()).fold(Self::ZERO, |acc, i| {
            acc.with_lane(width, i, op(self.lane(width, i), other.lane(width, i)))
        })
    }
}

impl From<u128> for Vector128 {
    fn from(value: u128) -> Self {
        Self::from_u128(value)
    }
}

impl From<Vector128> for u128 {
    fn from(value: Vector128) -> Self {
        value.to_u128()
    }
}

/// 比较结果转换为通道掩码
pub(crate) fn lane_mask(width: LaneWidth, cond: bool) -> u64 {
    if cond { width.mask() } else { 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_roundtrip() {
        let v = Vector128::new(0x0807_0605_0403_0201, 0x100F_0E0D_0C0B_0A09);
        assert_eq!(v.lane(LaneWidth::B8, 0), 0x01);
        assert_eq!(v.lane(LaneWidth::B8, 15), 0x10);
        assert_eq!(v.lane(LaneWidth::B16, 4), 0x0A09);
        assert_eq!(v.lane(LaneWidth::B32, 1), 0x0807_0605);
        assert_eq!(v.lane(LaneWidth::B64, 1), 0x100F_0E0D_0C0B_0A09);
        assert_eq!(v.lane(LaneWidth::B8, 16), 0);
    }

    #[test]
    fn test_with_lane_masks_value() {
        let v = Vector128::ZERO.with_lane(LaneWidth::B16, 7, 0x1_FFFF);
        assert_eq!(v, Vector128::new(0, 0xFFFF_0000_0000_0000));
        assert_eq!(v.with_lane(LaneWidth::B16, 8, 1), v);
    }

    #[test]
    fn test_sign_extend() {
        assert_eq!(LaneWidth::B8.sign_extend(0x80), -128);
        assert_eq!(LaneWidth::B16.sign_extend(0x7FFF), 0x7FFF);
        assert_eq!(LaneWidth::B64.sign_extend(u64::MAX), -1);
    }

    #[test]
    fn test_bytes_little_endian() {
        let mut bytes = [0u8; 16];
        bytes[0] = 0xAA;
        bytes[15] = 0x55;
        let v = Vector128::from_bytes(bytes);
        assert_eq!(v.lo, 0xAA);
        assert_eq!(v.hi, 0x5500_0000_0000_0000);
        assert_eq!(v.to_bytes(), bytes);
    }

    #[test]
    fn test_splat() {
        let v = Vector128::splat(LaneWidth::B32, 0xDEAD_BEEF);
        assert_eq!(v, Vector128::new(0xDEAD_BEEF_DEAD_BEEF, 0xDEAD_BEEF_DEAD_BEEF));
    }
}
