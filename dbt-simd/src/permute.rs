//! 通道重排：zip、ext 以及按字节提取/插入。
//!
//! 字节索引越界（>15）不是错误：提取返回 0，插入保持原值。

use crate::{LaneWidth, Vector128, logic::v128_shl, logic::v128_shr};

/// 交错两个向量的低半部分通道：a0, b0, a1, b1, ...
pub fn v128_zip_lo(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    zip_from(a, b, width, 0)
}

/// 交错两个向量的高半部分通道
pub fn v128_zip_hi(a: Vector128, b: Vector128, width: LaneWidth) -> Vector128 {
    zip_from(a, b, width, width.lanes() / 2)
}

fn zip_from(a: Vector128, b: Vector128, width: LaneWidth, base: usize) -> Vector128 {
    (0..width.lanes() / 2).fold(Vector128::ZERO, |acc, i| {
        acc.with_lane(width, 2 * i, a.lane(width, base + i))
            .with_lane(width, 2 * i + 1, b.lane(width, base + i))
    })
}

/// 从 `lo:hi` 的 256 位拼接中取出从字节 `bytes` 开始的 16 字节（EXT）
pub fn v128_ext(lo: Vector128, hi: Vector128, bytes: u32) -> Vector128 {
    if bytes == 0 {
        return lo;
    }
    if bytes >= 16 {
        return hi;
    }
    let bits = bytes * 8;
    let low_part = v128_shr(lo, bits);
    let high_part = v128_shl(hi, 128 - bits);
    Vector128::new(low_part.lo | high_part.lo, low_part.hi | high_part.hi)
}

/// 读取字节 `index`，越界返回 0
pub fn v128_extract(a: Vector128, index: usize) -> u8 {
    a.lane(LaneWidth::B8, index) as u8
}

/// 写入字节 `index`，越界时原样返回
pub fn v128_insert(a: Vector128, index: usize, value: u8) -> Vector128 {
    a.with_lane(LaneWidth::B8, index, value as u64)
}
