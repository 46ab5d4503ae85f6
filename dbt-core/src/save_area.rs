//! 上下文保存区
//!
//! 固定布局的字节镜像，用于在翻译边界（例如宿主调用前后）序列化
//! [`CpuContext`]。生成代码运行时 RDI 指向一个 `SaveArea`，并通过
//! [`offsets`] 中的偏移直接访问客户机寄存器。
//!
//! | 偏移    | 内容                                 |
//! |---------|--------------------------------------|
//! | 0x000   | 布局版本号 (u32)                     |
//! | 0x004   | 块退出原因 (u32，见 [`BlockExit`])   |
//! | 0x008   | FPSR (u32)                           |
//! | 0x00c   | FPCR (u32)                           |
//! | 0x010   | V0..V31，每个 16 字节（低 8 字节在前）|
//! | 0x210   | X0..X29，每个 8 字节                 |
//! | 0x300   | LR                                   |
//! | 0x308   | SP                                   |
//! | 0x310   | PC                                   |
//! | 0x318   | NZCV                                 |
//! | 0x320   | 独占监视器地址 (u64)                 |
//! | 0x328   | 独占监视器记录的值 (u64)             |
//! | 0x330   | 独占监视器访问大小 (u32，0 为开放)   |
//! | 0x334   | 保留                                 |
//!
//! 退出原因只在生成代码返回调度器时有意义，不属于 [`CpuContext`]；`save`
//! 总是把它写为 [`BlockExit::Next`]。
//!
//! 字节偏移只在本模块中出现；其余代码通过 [`CpuContext`] 的访问器读写寄存器。

use crate::context::{CpuContext, ExclusiveMonitor, GPR_COUNT, VECTOR_COUNT};
use crate::error::ContextError;
use crate::Vector128;

/// 保存区总大小
pub const SAVE_AREA_SIZE: usize = 0x340;

/// 当前布局版本。任何偏移变化都必须递增该值。
pub const SAVE_AREA_VERSION: u32 = 2;

/// 字段偏移
pub mod offsets {
    pub const VERSION: usize = 0x000;
    pub const EXIT: usize = 0x004;
    pub const FPSR: usize = 0x008;
    pub const FPCR: usize = 0x00C;
    pub const VECTORS: usize = 0x010;
    pub const GPRS: usize = 0x210;
    pub const LR: usize = 0x300;
    pub const SP: usize = 0x308;
    pub const PC: usize = 0x310;
    pub const NZCV: usize = 0x318;
    pub const MONITOR_ADDR: usize = 0x320;
    pub const MONITOR_VALUE: usize = 0x328;
    pub const MONITOR_SIZE: usize = 0x330;
}

/// 生成代码返回调度器的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlockExit {
    /// 块执行完毕，PC 是下一条要执行的指令
    Next = 0,
    /// 块在 PC 处的指令之前退出，这条指令要交给解释器
    Interpret = 1,
}

impl BlockExit {
    pub const fn code(self) -> u32 {
        self as u32
    }

    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(BlockExit::Next),
            1 => Some(BlockExit::Interpret),
            _ => None,
        }
    }
}

/// Xn（n ≤ 30）在保存区中的偏移，30 即 LR
pub const fn gpr_offset(index: u8) -> usize {
    offsets::GPRS + (index as usize) * 8
}

/// Vn 在保存区中的偏移
pub const fn vector_offset(index: u8) -> usize {
    offsets::VECTORS + ((index & 0x1F) as usize) * 16
}

/// 固定大小的上下文镜像
#[derive(Clone, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct SaveArea {
    bytes: [u8; SAVE_AREA_SIZE],
}

impl std::fmt::Debug for SaveArea {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveArea")
            .field("version", &self.version())
            .field("pc", &format_args!("{:#x}", self.read_u64(offsets::PC)))
            .finish_non_exhaustive()
    }
}

impl Default for SaveArea {
    fn default() -> Self {
        Self::new()
    }
}

impl SaveArea {
    /// 创建带版本号的空保存区
    pub fn new() -> Self {
        let mut area = Self {
            bytes: [0; SAVE_AREA_SIZE],
        };
        area.write_u32(offsets::VERSION, SAVE_AREA_VERSION);
        area
    }

    /// 从外部缓冲区复制（例如持久化后的快照）
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ContextError> {
        if bytes.len() < SAVE_AREA_SIZE {
            return Err(ContextError::BufferTooSmall {
                len: bytes.len(),
                required: SAVE_AREA_SIZE,
            });
        }
        let mut area = Self {
            bytes: [0; SAVE_AREA_SIZE],
        };
        area.bytes.copy_from_slice(&bytes[..SAVE_AREA_SIZE]);
        area.check_version()?;
        Ok(area)
    }

    pub fn as_bytes(&self) -> &[u8; SAVE_AREA_SIZE] {
        &self.bytes
    }

    /// 生成代码使用的基址（RDI）
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.bytes.as_mut_ptr()
    }

    pub fn version(&self) -> u32 {
        self.read_u32(offsets::VERSION)
    }

    /// 直接读取 PC 字段（块出口写回的下一条客户机地址）
    pub fn pc(&self) -> u64 {
        self.read_u64(offsets::PC)
    }

    /// 最近一次块退出的原因
    pub fn exit(&self) -> Result<BlockExit, ContextError> {
        let code = self.read_u32(offsets::EXIT);
        BlockExit::from_code(code).ok_or(ContextError::UnknownExit(code))
    }

    pub fn set_exit(&mut self, exit: BlockExit) {
        self.write_u32(offsets::EXIT, exit.code());
    }

    fn check_version(&self) -> Result<(), ContextError> {
        match self.version() {
            SAVE_AREA_VERSION => Ok(()),
            found => Err(ContextError::UnsupportedVersion {
                found,
                expected: SAVE_AREA_VERSION,
            }),
        }
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        u32::from_le_bytes(raw)
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[offset..offset + 8]);
        u64::from_le_bytes(raw)
    }

    fn write_u64(&mut self, offset: usize, value: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// 将上下文序列化到保存区
pub fn save(ctx: &CpuContext, area: &mut SaveArea) {
    area.write_u32(offsets::VERSION, SAVE_AREA_VERSION);
    area.set_exit(BlockExit::Next);
    area.write_u32(offsets::FPSR, ctx.fp.fpsr);
    area.write_u32(offsets::FPCR, ctx.fp.fpcr);

    for i in 0..VECTOR_COUNT {
        let v = ctx.vec.v[i];
        let at = vector_offset(i as u8);
        area.write_u64(at, v.lo);
        area.write_u64(at + 8, v.hi);
    }

    for i in 0..GPR_COUNT {
        area.write_u64(gpr_offset(i as u8), ctx.gpr.x[i]);
    }
    area.write_u64(offsets::LR, ctx.gpr.lr);
    area.write_u64(offsets::SP, ctx.gpr.sp);
    area.write_u64(offsets::PC, ctx.gpr.pc);
    area.write_u64(offsets::NZCV, ctx.gpr.nzcv);

    area.write_u64(offsets::MONITOR_ADDR, ctx.monitor.addr);
    area.write_u64(offsets::MONITOR_VALUE, ctx.monitor.value);
    area.write_u32(offsets::MONITOR_SIZE, ctx.monitor.size);
}

/// 从保存区恢复上下文；版本号不匹配时不修改 `ctx`
pub fn restore(area: &SaveArea, ctx: &mut CpuContext) -> Result<(), ContextError> {
    area.check_version()?;

    ctx.fp.fpsr = area.read_u32(offsets::FPSR);
    ctx.fp.fpcr = area.read_u32(offsets::FPCR);

    for i in 0..VECTOR_COUNT {
        let at = vector_offset(i as u8);
        ctx.vec.v[i] = Vector128::new(area.read_u64(at), area.read_u64(at + 8));
    }

    for i in 0..GPR_COUNT {
        ctx.gpr.x[i] = area.read_u64(gpr_offset(i as u8));
    }
    ctx.gpr.lr = area.read_u64(offsets::LR);
    ctx.gpr.sp = area.read_u64(offsets::SP);
    ctx.gpr.pc = area.read_u64(offsets::PC);
    ctx.gpr.nzcv = area.read_u64(offsets::NZCV);

    ctx.monitor = ExclusiveMonitor {
        addr: area.read_u64(offsets::MONITOR_ADDR),
        value: area.read_u64(offsets::MONITOR_VALUE),
        size: area.read_u32(offsets::MONITOR_SIZE),
    };
    Ok(())
}

impl CpuContext {
    /// 序列化为新的保存区
    pub fn to_save_area(&self) -> SaveArea {
        let mut area = SaveArea::new();
        save(self, &mut area);
        area
    }

    /// 从保存区构造上下文
    pub fn from_save_area(area: &SaveArea) -> Result<Self, ContextError> {
        let mut ctx = CpuContext::default();
        restore(area, &mut ctx)?;
        Ok(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_constants() {
        assert_eq!(vector_offset(31) + 16, offsets::GPRS);
        assert_eq!(gpr_offset(30), offsets::LR);
        assert_eq!(offsets::NZCV + 8, offsets::MONITOR_ADDR);
        assert!(offsets::MONITOR_SIZE + 4 <= SAVE_AREA_SIZE);
        assert_eq!(SAVE_AREA_SIZE % 16, 0);
    }

    #[test]
    fn test_exit_code() {
        let mut area = CpuContext::new().to_save_area();
        assert_eq!(area.exit(), Ok(BlockExit::Next));
        area.set_exit(BlockExit::Interpret);
        assert_eq!(&area.as_bytes()[4..8], &1u32.to_le_bytes());
        assert_eq!(area.exit(), Ok(BlockExit::Interpret));
        area.write_u32(offsets::EXIT, 9);
        assert_eq!(area.exit(), Err(ContextError::UnknownExit(9)));
    }

    #[test]
    fn test_monitor_round_trip() {
        let mut ctx = CpuContext::new();
        ctx.monitor.arm(0x8000, 4, 0xFEED);
        let area = ctx.to_save_area();
        assert_eq!(&area.as_bytes()[0x320..0x328], &0x8000u64.to_le_bytes());
        assert_eq!(&area.as_bytes()[0x330..0x334], &4u32.to_le_bytes());
        assert_eq!(CpuContext::from_save_area(&area).unwrap().monitor, ctx.monitor);
    }

    #[test]
    fn test_field_positions() {
        let mut ctx = CpuContext::new();
        ctx.fp.fpsr = 0x1122_3344;
        ctx.fp.fpcr = 0x0040_0000;
        ctx.vec.v[1] = Vector128::new(0xAAAA, 0xBBBB);
        ctx.gpr.x[2] = 0xCCCC;
        ctx.gpr.pc = 0x4000;
        ctx.gpr.nzcv = 0x6000_0000;

        let area = ctx.to_save_area();
        let bytes = area.as_bytes();
        assert_eq!(&bytes[0x08..0x0C], &0x1122_3344u32.to_le_bytes());
        assert_eq!(&bytes[0x0C..0x10], &0x0040_0000u32.to_le_bytes());
        assert_eq!(&bytes[0x20..0x28], &0xAAAAu64.to_le_bytes());
        assert_eq!(&bytes[0x28..0x30], &0xBBBBu64.to_le_bytes());
        assert_eq!(&bytes[0x220..0x228], &0xCCCCu64.to_le_bytes());
        assert_eq!(area.pc(), 0x4000);
        assert_eq!(&bytes[0x318..0x320], &0x6000_0000u64.to_le_bytes());
        assert_eq!(&bytes[0x00..0x04], &SAVE_AREA_VERSION.to_le_bytes());
    }

    #[test]
    fn test_restore_rejects_unknown_version() {
        let mut raw = [0u8; SAVE_AREA_SIZE];
        raw[0] = 7;
        let err = SaveArea::from_bytes(&raw).unwrap_err();
        assert_eq!(
            err,
            ContextError::UnsupportedVersion {
                found: 7,
                expected: SAVE_AREA_VERSION
            }
        );
    }

    #[test]
    fn test_from_bytes_too_small() {
        let err = SaveArea::from_bytes(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, ContextError::BufferTooSmall { len: 16, .. }));
    }
}
