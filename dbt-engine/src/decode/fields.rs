//! 指令字段提取
//!
//! 字段位置固定：Rd/Rt 0–4，Rn 5–9，Rt2/Ra 10–14，Rm 16–20。

/// 取 `[lo, lo+len)` 位
#[inline]
pub const fn bits(encoding: u32, lo: u32, len: u32) -> u32 {
    (encoding >> lo) & ((1u32 << len) - 1)
}

#[inline]
pub const fn bit(encoding: u32, n: u32) -> bool {
    (encoding >> n) & 1 != 0
}

#[inline]
pub const fn rd(encoding: u32) -> u8 {
    bits(encoding, 0, 5) as u8
}

#[inline]
pub const fn rn(encoding: u32) -> u8 {
    bits(encoding, 5, 5) as u8
}

#[inline]
pub const fn ra(encoding: u32) -> u8 {
    bits(encoding, 10, 5) as u8
}

#[inline]
pub const fn rm(encoding: u32) -> u8 {
    bits(encoding, 16, 5) as u8
}

/// 把低 `width` 位作为有符号数扩展到 64 位
#[inline]
pub const fn sign_extend(value: u64, width: u32) -> i64 {
    let shift = 64 - width;
    ((value << shift) as i64) >> shift
}

/// 取字段并按字段宽度符号扩展
#[inline]
pub const fn signed_field(encoding: u32, lo: u32, len: u32) -> i64 {
    sign_extend(bits(encoding, lo, len) as u64, len)
}

/// 以 4 字节为单位的 PC 相对目标
#[inline]
pub const fn pc_relative(pc: u64, words: i64) -> u64 {
    pc.wrapping_add((words << 2) as u64)
}

/// 展开 8 位浮点立即数 (FMOV #imm)，返回双精度位模式
pub fn expand_fp_imm64(imm8: u8) -> u64 {
    let sign = u64::from(imm8 >> 7);
    let b6 = u64::from((imm8 >> 6) & 1);
    let exp = ((b6 ^ 1) << 10) | (if b6 == 1 { 0xFF } else { 0 } << 2) | u64::from((imm8 >> 4) & 3);
    let frac = u64::from(imm8 & 0xF) << 48;
    (sign << 63) | (exp << 52) | frac
}

/// 展开 8 位浮点立即数，返回单精度位模式
pub fn expand_fp_imm32(imm8: u8) -> u32 {
    let sign = u32::from(imm8 >> 7);
    let b6 = u32::from((imm8 >> 6) & 1);
    let exp = ((b6 ^ 1) << 7) | (if b6 == 1 { 0x1F } else { 0 } << 2) | u32::from((imm8 >> 4) & 3);
    let frac = u32::from(imm8 & 0xF) << 19;
    (sign << 31) | (exp << 23) | frac
}
