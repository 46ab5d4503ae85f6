//! 宿主机浮点控制/状态寄存器访问
//!
//! 只有 AArch64 宿主机能在用户态直接读写 FPCR/FPSR。其他宿主机上
//! 读取返回 0，写入不生效；调用方通过 [`capability`] 查询当前能力，
//! 写入函数也会返回实际生效的能力。

/// 宿主机浮点寄存器访问能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostFpAccess {
    /// 可以直接读写
    Native,
    /// 不可访问：读为 0，写被忽略
    Unavailable,
}

impl HostFpAccess {
    pub fn is_native(self) -> bool {
        self == HostFpAccess::Native
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "aarch64")] {
        use std::arch::asm;

        pub fn capability() -> HostFpAccess {
            HostFpAccess::Native
        }

        pub fn read_host_fpcr() -> u32 {
            let value: u64;
            // SAFETY: 读取 FPCR 在 EL0 下总是允许
            unsafe { asm!("mrs {0}, fpcr", out(reg) value, options(nomem, nostack)) };
            value as u32
        }

        pub fn read_host_fpsr() -> u32 {
            let value: u64;
            // SAFETY: 同上
            unsafe { asm!("mrs {0}, fpsr", out(reg) value, options(nomem, nostack)) };
            value as u32
        }

        pub fn write_host_fpcr(value: u32) -> HostFpAccess {
            // SAFETY: 只改变当前线程的浮点环境
            unsafe { asm!("msr fpcr, {0}", in(reg) value as u64, options(nomem, nostack)) };
            HostFpAccess::Native
        }

        pub fn write_host_fpsr(value: u32) -> HostFpAccess {
            // SAFETY: 同上
            unsafe { asm!("msr fpsr, {0}", in(reg) value as u64, options(nomem, nostack)) };
            HostFpAccess::Native
        }
    } else {
        pub fn capability() -> HostFpAccess {
            HostFpAccess::Unavailable
        }

        pub fn read_host_fpcr() -> u32 {
            0
        }

        pub fn read_host_fpsr() -> u32 {
            0
        }

        pub fn write_host_fpcr(value: u32) -> HostFpAccess {
            log::trace!("host FPCR write ignored ({value:#x}): no user-space access");
            HostFpAccess::Unavailable
        }

        pub fn write_host_fpsr(value: u32) -> HostFpAccess {
            log::trace!("host FPSR write ignored ({value:#x}): no user-space access");
            HostFpAccess::Unavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_is_consistent() {
        let cap = capability();
        if cap.is_native() {
            let fpcr = read_host_fpcr();
            assert_eq!(write_host_fpcr(fpcr), HostFpAccess::Native);
            assert_eq!(read_host_fpcr(), fpcr);
        } else {
            assert_eq!(read_host_fpcr(), 0);
            assert_eq!(read_host_fpsr(), 0);
            assert_eq!(write_host_fpsr(0x1F), HostFpAccess::Unavailable);
            assert_eq!(read_host_fpsr(), 0);
        }
    }
}
