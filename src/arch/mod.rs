// ============================================================================
// src/arch/mod.rs - x86_64 ハードウェアアクセス
// CPUID・MSR・割り込みフラグをトレイトとして抽象化する
// ============================================================================

pub mod cpuid;
pub mod irq;
pub mod msr;

pub use cpuid::{CpuFeatures, CpuInfo, CpuSignature, Cpuid, CpuidResult, Vendor, intel_model};
pub use irq::{IrqControl, IrqGuard, with_interrupts_disabled};
pub use msr::MsrAccess;

#[cfg(target_arch = "x86_64")]
pub use cpuid::NativeCpuid;
#[cfg(target_arch = "x86_64")]
pub use irq::NativeIrq;
#[cfg(target_arch = "x86_64")]
pub use msr::NativeMsr;
