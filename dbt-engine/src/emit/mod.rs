//! 代码发射器
//!
//! [`Emitter`] 是只追加的宿主机代码缓冲区，容量固定；超出容量时返回
//! [`EmitError::Overflow`]，不会截断。x86-64 指令编码在 [`x86`] 中以
//! `Emitter` 方法的形式提供。
//!
//! ## 寄存器映射
//!
//! - 客户机通用寄存器不分配宿主寄存器，生成代码通过 `[rdi + 偏移]`
//!   访问保存区中的槽位，见 [`gpr_slot`]。
//! - 客户机向量寄存器映射到 XMM，编号取低 4 位（[`host_xmm`]）。宿主机只有
//!   16 个 XMM，因此 V16–V31 与 V0–V15 共用宿主寄存器。这是已知的别名限制，
//!   由 `VectorAliasPolicy` 决定拒绝翻译还是告警后继续。

pub mod features;
pub mod x86;

use thiserror::Error;

use dbt_core::Reg31;
use dbt_core::save_area::{gpr_offset, offsets};

pub use features::HostFeatures;
pub use x86::{Alu, Gpr, Mem, Precision, Shift, Width, Xmm};

/// 宿主机向量寄存器数量
pub const HOST_VECTOR_REGS: u8 = 16;

/// 发射错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    #[error("emit buffer overflow: capacity {capacity} bytes, {requested} more requested")]
    Overflow { capacity: usize, requested: usize },

    #[error("short branch distance {distance} out of range")]
    BranchOutOfRange { distance: isize },
}

/// 宿主机代码缓冲区
#[derive(Debug, Clone)]
pub struct Emitter {
    buf: Vec<u8>,
    capacity: usize,
}

/// 待回填的 rel8 跳转
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Rel8Fixup {
    /// 位移字节的位置
    at: usize,
}

impl Emitter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(64 * 1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// 丢弃 `len` 之后的字节，用于撤销失败的指令
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }

    fn reserve(&self, n: usize) -> Result<(), EmitError> {
        if n > self.remaining() {
            return Err(EmitError::Overflow {
                capacity: self.capacity,
                requested: n,
            });
        }
        Ok(())
    }

    pub fn emit_u8(&mut self, byte: u8) -> Result<(), EmitError> {
        self.reserve(1)?;
        self.buf.push(byte);
        Ok(())
    }

    pub fn emit_u16(&mut self, value: u16) -> Result<(), EmitError> {
        self.emit_bytes(&value.to_le_bytes())
    }

    pub fn emit_u32(&mut self, value: u32) -> Result<(), EmitError> {
        self.emit_bytes(&value.to_le_bytes())
    }

    pub fn emit_u64(&mut self, value: u64) -> Result<(), EmitError> {
        self.emit_bytes(&value.to_le_bytes())
    }

    /// 整体追加；空间不足时一个字节也不写
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), EmitError> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// 发射短跳转的操作码和占位位移，稍后用 [`Emitter::bind`] 回填
    pub fn jump_rel8(&mut self, opcode: u8) -> Result<Rel8Fixup, EmitError> {
        self.emit_bytes(&[opcode, 0])?;
        Ok(Rel8Fixup {
            at: self.buf.len() - 1,
        })
    }

    /// 跳回已发射的位置 `target`
    pub fn jump_back_rel8(&mut self, opcode: u8, target: usize) -> Result<(), EmitError> {
        let distance = target as isize - (self.buf.len() as isize + 2);
        let rel = i8::try_from(distance).map_err(|_| EmitError::BranchOutOfRange { distance })?;
        self.emit_bytes(&[opcode, rel as u8])
    }

    /// 把短跳转的目标绑定到当前位置
    pub fn bind(&mut self, fixup: Rel8Fixup) -> Result<(), EmitError> {
        let distance = self.buf.len() as isize - (fixup.at as isize + 1);
        let rel = i8::try_from(distance).map_err(|_| EmitError::BranchOutOfRange { distance })?;
        self.buf[fixup.at] = rel as u8;
        Ok(())
    }
}

/// 客户机向量寄存器对应的 XMM 编号（取低 4 位）
pub const fn host_xmm(guest: u8) -> Xmm {
    guest & 0x0F
}

/// 是否与另一个客户机寄存器共用宿主 XMM
pub const fn is_aliased(guest: u8) -> bool {
    guest >= HOST_VECTOR_REGS
}

/// 客户机通用寄存器在保存区中的位移；零寄存器返回 `None`
pub fn gpr_slot(index: u8, r31: Reg31) -> Option<i32> {
    match index {
        0..=30 => Some(gpr_offset(index) as i32),
        _ => match r31 {
            Reg31::Sp => Some(offsets::SP as i32),
            Reg31::Zero => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_little_endian() {
        let mut e = Emitter::new(32);
        e.emit_u8(0x90).unwrap();
        e.emit_u16(0x1234).unwrap();
        e.emit_u32(0xDEAD_BEEF).unwrap();
        e.emit_u64(0x0102_0304_0506_0708).unwrap();
        assert_eq!(
            e.bytes(),
            &[0x90, 0x34, 0x12, 0xEF, 0xBE, 0xAD, 0xDE, 8, 7, 6, 5, 4, 3, 2, 1]
        );
    }

    #[test]
    fn test_overflow_is_explicit_and_atomic() {
        let mut e = Emitter::new(4);
        e.emit_u16(0xFFFF).unwrap();
        assert_eq!(
            e.emit_u32(1),
            Err(EmitError::Overflow { capacity: 4, requested: 4 })
        );
        assert_eq!(e.len(), 2);
        e.emit_u16(0).unwrap();
        assert!(e.emit_u8(0).is_err());
    }

    #[test]
    fn test_rel8_fixup() {
        let mut e = Emitter::new(16);
        let fix = e.jump_rel8(0x74).unwrap();
        e.emit_bytes(&[0x90, 0x90, 0x90]).unwrap();
        e.bind(fix).unwrap();
        assert_eq!(e.bytes(), &[0x74, 0x03, 0x90, 0x90, 0x90]);
    }

    #[test]
    fn test_vector_aliasing_is_low_four_bits() {
        assert_eq!(host_xmm(1), 1);
        assert_eq!(host_xmm(17), 1);
        assert_eq!(host_xmm(31), 15);
        assert!(is_aliased(16));
        assert!(!is_aliased(15));
    }

    #[test]
    fn test_gpr_slots() {
        assert_eq!(gpr_slot(0, Reg31::Zero), Some(0x210));
        assert_eq!(gpr_slot(30, Reg31::Zero), Some(0x300));
        assert_eq!(gpr_slot(31, Reg31::Sp), Some(0x308));
        assert_eq!(gpr_slot(31, Reg31::Zero), None);
    }
}
