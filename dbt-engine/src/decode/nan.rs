//! 浮点 NaN 规则
//!
//! 客户机规则：输入中第一个信号 NaN 优先（静默化并置 IOC），否则取第一个静默 NaN；
//! 没有 NaN 输入却得到无效结果时返回默认 NaN（符号位为 0）并置 IOC。
//! FPCR.DN 置位时，NaN 结果一律换成默认 NaN。
//!
//! 宿主 SSE 选择 NaN 的顺序和默认 NaN 的符号都不同。发射的代码只要有 NaN 输入
//! 就走侧出口交给解释器，本地只修正没有 NaN 输入时的无效结果。

use dbt_core::context::FPSR_IOC;
use dbt_core::{CpuContext, GuestAddr};

use super::{emit_raise_fpsr, emit_side_exit};
use crate::emit::x86::{Cond, Gpr, Precision, Width, Xmm};
use crate::emit::{EmitError, Emitter};

/// 按位处理浮点值
pub(crate) trait FloatBits: Copy + PartialEq {
    const DEFAULT_NAN: Self;

    fn is_nan(self) -> bool;
    fn is_signaling(self) -> bool;
    fn quieted(self) -> Self;
    fn is_infinite(self) -> bool;
    fn is_zero(self) -> bool;

    fn is_quiet_nan(self) -> bool {
        self.is_nan() && !self.is_signaling()
    }
}

macro_rules! impl_float_bits {
    ($t:ty, $default:expr, $quiet:expr) => {
        impl FloatBits for $t {
            const DEFAULT_NAN: Self = <$t>::from_bits($default);

            fn is_nan(self) -> bool {
                <$t>::is_nan(self)
            }

            fn is_signaling(self) -> bool {
                <$t>::is_nan(self) && self.to_bits() & $quiet == 0
            }

            fn quieted(self) -> Self {
                <$t>::from_bits(self.to_bits() | $quiet)
            }

            fn is_infinite(self) -> bool {
                <$t>::is_infinite(self)
            }

            fn is_zero(self) -> bool {
                self == 0.0
            }
        }
    };
}

impl_float_bits!(f32, 0x7FC0_0000, 1 << 22);
impl_float_bits!(f64, 0x7FF8_0000_0000_0000, 1 << 51);

pub(crate) const fn default_nan_bits(precision: Precision) -> u64 {
    match precision {
        Precision::Single => 0x7FC0_0000,
        Precision::Double => 0x7FF8_0000_0000_0000,
    }
}

/// 按操作数顺序挑选 NaN 结果；没有 NaN 输入时返回 `None`
pub(crate) fn process_nans<T: FloatBits>(ctx: &mut CpuContext, inputs: &[T]) -> Option<T> {
    let picked = match inputs.iter().find(|v| v.is_signaling()) {
        Some(snan) => {
            ctx.raise_fp_exception(FPSR_IOC);
            Some(snan.quieted())
        }
        None => inputs.iter().copied().find(|v| v.is_nan()),
    };
    picked.map(|nan| if ctx.default_nan_mode() { T::DEFAULT_NAN } else { nan })
}

/// 无 NaN 输入时产生的 NaN 都是无效运算
pub(crate) fn check_invalid<T: FloatBits>(ctx: &mut CpuContext, value: T) -> T {
    if value.is_nan() {
        ctx.raise_fp_exception(FPSR_IOC);
        T::DEFAULT_NAN
    } else {
        value
    }
}

/// 任一输入为 NaN 时走侧出口
///
/// `ucomis x, x` 只在 x 为 NaN 时置 PF；各检查共用一个出口桩。
pub(crate) fn emit_nan_inputs_exit(
    em: &mut Emitter,
    pc: GuestAddr,
    precision: Precision,
    inputs: &[Xmm],
) -> Result<(), EmitError> {
    let mut exits = Vec::with_capacity(inputs.len());
    for (i, &reg) in inputs.iter().enumerate() {
        if inputs[..i].contains(&reg) {
            continue;
        }
        em.ucomis(precision, reg, reg)?;
        exits.push(em.jcc_rel8(Cond::P)?);
    }
    let over = em.jmp_rel8()?;
    for fixup in exits {
        em.bind(fixup)?;
    }
    emit_side_exit(em, pc)?;
    em.bind(over)
}

/// 把 `d` 中的宿主 NaN 换成客户机默认 NaN 并置 IOC
///
/// 只用于已经排除了 NaN 输入的运算。写入会清零其余位。
pub(crate) fn emit_default_nan_if_invalid(em: &mut Emitter, precision: Precision, d: Xmm) -> Result<(), EmitError> {
    em.ucomis(precision, d, d)?;
    let done = em.jcc_rel8(Cond::Np)?;
    em.mov_imm64(Gpr::Rax, default_nan_bits(precision))?;
    let width = match precision {
        Precision::Double => Width::W64,
        Precision::Single => Width::W32,
    };
    em.mov_to_xmm(width, d, Gpr::Rax)?;
    emit_raise_fpsr(em, FPSR_IOC)?;
    em.bind(done)
}
