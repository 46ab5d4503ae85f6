//! 宿主机 CPU 特性检测
//!
//! 发射器只依赖 SSE2 基线；需要更高特性的指令形式在特性缺失时返回
//! `Unimplemented`，由解释器兜底。

use serde::Serialize;

/// 发射器关心的宿主机扩展
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HostFeatures {
    /// palignr
    pub ssse3: bool,
    /// roundsd/ss、pmulld、pinsrb/d/q、pextrb/d/q、pcmpeqq、pmaxuw/ud
    pub sse41: bool,
    /// pcmpgtq
    pub sse42: bool,
    /// VEX 标量 FMA（同时要求操作系统启用 AVX 状态保存）
    pub fma: bool,
}

impl HostFeatures {
    /// 只有 SSE2 基线
    pub const fn baseline() -> Self {
        Self {
            ssse3: false,
            sse41: false,
            sse42: false,
            fma: false,
        }
    }

    /// 全部可用，用于测试与离线翻译
    pub const fn all() -> Self {
        Self {
            ssse3: true,
            sse41: true,
            sse42: true,
            fma: true,
        }
    }

    /// 检测当前宿主机
    pub fn detect() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self::detect_x86_64()
        }

        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::baseline()
        }
    }

    #[cfg(target_arch = "x86_64")]
    fn detect_x86_64() -> Self {
        use raw_cpuid::CpuId;

        let cpuid = CpuId::new();
        let mut features = Self::baseline();

        if let Some(info) = cpuid.get_feature_info() {
            features.ssse3 = info.has_ssse3();
            features.sse41 = info.has_sse41();
            features.sse42 = info.has_sse42();
            features.fma = info.has_fma() && info.has_avx() && info.has_oxsave();
        }

        log::debug!("host features: {features:?}");
        features
    }
}
