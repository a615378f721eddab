// ============================================================================
// src/resource/vendor.rs - ベンダー別の戦略
//
// Intel と AMD はレジスタ配置・帯域制御の方式が異なる。機能検出時に一度だけ
// ベンダーを判定し、以降は選ばれた戦略オブジェクト越しに処理する。
// ============================================================================

use core::ops::Range;

use super::{Resource, ResourceId, ResourceTable, ThrottleMode};
use crate::arch::msr::{
    MSR_IA32_L3_CBM_BASE, MSR_IA32_MBA_BW_BASE, MSR_IA32_MBA_THRTL_BASE, MSR_IA32_SMBA_BW_BASE,
};
use crate::arch::{CpuFeatures, Cpuid, MsrAccess, Vendor, intel_model};
use crate::options::{Capabilities, RdtFlag};

/// 帯域の最大値 (%)
pub const MAX_MBA_BW: u32 = 100;

// ============================================================================
// 制御値の書き込み（レジスタチャネル）
// ============================================================================

/// ドメインの制御値配列の一部をレジスタへ書き込む戦略
///
/// `cpu` はドメインに属するCPUで、書き込みはそのCPU上で行われる。
pub trait CtrlWriter: Send + Sync {
    fn update(
        &self,
        r: &Resource,
        cpu: u32,
        ctrl_val: &[u32],
        range: Range<u32>,
        msr: &dyn MsrAccess,
    );
}

/// 書き込み範囲を制御値配列の長さに切り詰める
fn clamp(ctrl_val: &[u32], range: Range<u32>) -> Range<u32> {
    let len = ctrl_val.len() as u32;
    range.start.min(len)..range.end.min(len)
}

/// キャッシュビットマスク: 値をそのまま書く
#[derive(Debug, Default)]
pub struct CatWriter;

pub static CAT_WRITER: CatWriter = CatWriter;

impl CtrlWriter for CatWriter {
    fn update(&self, r: &Resource, cpu: u32, ctrl_val: &[u32], range: Range<u32>, msr: &dyn MsrAccess) {
        for i in clamp(ctrl_val, range) {
            msr.write(cpu, r.msr_base + i, ctrl_val[i as usize] as u64);
        }
    }
}

/// Intel MBA: 帯域 (%) を遅延値に変換して書く
#[derive(Debug, Default)]
pub struct IntelMbaWriter;

pub static INTEL_MBA_WRITER: IntelMbaWriter = IntelMbaWriter;

impl IntelMbaWriter {
    /// 帯域 (%) → 遅延値
    pub fn delay_bw_map(bw: u32, r: &Resource) -> u32 {
        if r.membw.delay_linear {
            return MAX_MBA_BW.saturating_sub(bw);
        }
        warn_once!("Non Linear delay-bw map not supported but queried");
        MAX_MBA_BW
    }
}

impl CtrlWriter for IntelMbaWriter {
    fn update(&self, r: &Resource, cpu: u32, ctrl_val: &[u32], range: Range<u32>, msr: &dyn MsrAccess) {
        for i in clamp(ctrl_val, range) {
            let delay = Self::delay_bw_map(ctrl_val[i as usize], r);
            msr.write(cpu, r.msr_base + i, delay as u64);
        }
    }
}

/// AMD MBA / SMBA: 帯域値をそのまま書く
#[derive(Debug, Default)]
pub struct AmdMbaWriter;

pub static AMD_MBA_WRITER: AmdMbaWriter = AmdMbaWriter;

impl CtrlWriter for AmdMbaWriter {
    fn update(&self, r: &Resource, cpu: u32, ctrl_val: &[u32], range: Range<u32>, msr: &dyn MsrAccess) {
        for i in clamp(ctrl_val, range) {
            msr.write(cpu, r.msr_base + i, ctrl_val[i as usize] as u64);
        }
    }
}

// ============================================================================
// 機能検出のベンダー別処理
// ============================================================================

/// 機能検出中のベンダー別処理
pub trait VendorOps: Sync {
    /// 検出前のリソース既定値
    fn init_res_defs(&self, r: &mut Resource);

    /// 既知の不具合への対処
    ///
    /// 割り当て機能を直接確定させた場合は true を返す。
    fn check_quirks(&self, _table: &mut ResourceTable, _msr: &dyn MsrAccess, _cpu: u32) -> bool {
        false
    }

    /// MBA の設定を読み取る
    fn mem_config(&self, _cpuid: &dyn Cpuid, _caps: &Capabilities, _r: &mut Resource) -> bool {
        false
    }

    /// SMBA の設定を読み取る
    fn slow_mem_config(&self, _cpuid: &dyn Cpuid, _r: &mut Resource) -> bool {
        false
    }
}

/// ベンダーに対応する戦略
pub fn ops_for(vendor: Vendor) -> &'static dyn VendorOps {
    match vendor {
        Vendor::Intel => &IntelOps,
        Vendor::Amd => &AmdOps,
        Vendor::Unknown => &GenericOps,
    }
}

/// Intel
pub struct IntelOps;

impl VendorOps for IntelOps {
    fn init_res_defs(&self, r: &mut Resource) {
        match r.rid {
            ResourceId::L3 | ResourceId::L2 => {
                r.cache.arch_has_per_cpu_cfg = false;
                r.cache.min_cbm_bits = 1;
            }
            ResourceId::Mba => {
                r.msr_base = MSR_IA32_MBA_THRTL_BASE;
                r.writer = Some(&INTEL_MBA_WRITER);
            }
            ResourceId::Smba => {}
        }
    }

    fn check_quirks(&self, table: &mut ResourceTable, msr: &dyn MsrAccess, cpu: u32) -> bool {
        let sig = table.signature;
        if sig.is_intel_model(intel_model::HASWELL_X) {
            if table.caps.options().is_forced_off(RdtFlag::L3Cat) {
                return false;
            }
            return cache_alloc_hsw_probe(table, msr, cpu);
        }
        if sig.is_intel_model(intel_model::SKYLAKE_X) {
            if sig.stepping <= 4 {
                table.caps.force_off("cmt,mbmtotal,mbmlocal,l3cat");
            } else {
                table.caps.force_off("l3cat");
            }
            table.mon.mbm_correction_quirk = true;
        } else if sig.is_intel_model(intel_model::BROADWELL_X) {
            table.mon.mbm_correction_quirk = true;
        }
        false
    }

    fn mem_config(&self, cpuid: &dyn Cpuid, caps: &Capabilities, r: &mut Resource) -> bool {
        let leaf = cpuid.cpuid_count(0x10, 3);
        r.num_closid = (leaf.edx & 0xffff) + 1;
        let max_delay = (leaf.eax & 0xfff) + 1;
        r.membw.max_bw = MAX_MBA_BW;
        r.membw.arch_needs_linear = true;
        if leaf.ecx & (1 << 2) != 0 {
            r.membw.delay_linear = true;
            r.membw.min_bw = MAX_MBA_BW.saturating_sub(max_delay);
            r.membw.bw_gran = MAX_MBA_BW.saturating_sub(max_delay);
        } else {
            // 非線形の遅延値を持つ製品は未対応
            log::info!("MBA b/w map not implemented for non-linear delay");
            return false;
        }

        r.membw.throttle_mode = if caps.boot_cpu_has(CpuFeatures::PER_THREAD_MBA) {
            ThrottleMode::PerThread
        } else {
            ThrottleMode::Max
        };
        r.alloc_capable = true;
        true
    }
}

/// Haswell サーバーは CPUID で L3 CAT を列挙しない
///
/// 最大の 20 ビットマスクを書いて読み戻し、保持されていれば CAT 有りとみなす。
fn cache_alloc_hsw_probe(table: &mut ResourceTable, msr: &dyn MsrAccess, cpu: u32) -> bool {
    let max_cbm: u64 = (1 << 20) - 1;

    if msr.write_safe(cpu, MSR_IA32_L3_CBM_BASE, max_cbm).is_err() {
        return false;
    }
    if msr.read(cpu, MSR_IA32_L3_CBM_BASE) != max_cbm {
        return false;
    }

    let r = table.get_mut(ResourceId::L3);
    r.num_closid = 4;
    r.cache.cbm_len = 20;
    r.cache.shareable_bits = 0xc0000;
    r.cache.min_cbm_bits = 2;
    r.cache.arch_has_sparse_bitmasks = false;
    r.alloc_capable = true;
    true
}

/// AMD
pub struct AmdOps;

impl AmdOps {
    /// CPUID 0x8000_0020 のサブリーフ (MBA: 1, SMBA: 2)
    fn get_mem_config(cpuid: &dyn Cpuid, r: &mut Resource) -> bool {
        let subleaf = if r.rid == ResourceId::Smba { 2 } else { 1 };
        let leaf = cpuid.cpuid_count(0x8000_0020, subleaf);
        r.num_closid = leaf.edx + 1;
        r.membw.max_bw = 1u32.checked_shl(leaf.eax).unwrap_or(0);

        // 遅延モデルではない
        r.membw.delay_linear = false;
        r.membw.arch_needs_linear = false;
        r.membw.throttle_mode = ThrottleMode::Undefined;
        r.membw.min_bw = 0;
        r.membw.bw_gran = 1;

        r.alloc_capable = true;
        true
    }
}

impl VendorOps for AmdOps {
    fn init_res_defs(&self, r: &mut Resource) {
        match r.rid {
            ResourceId::L3 | ResourceId::L2 => {
                r.cache.arch_has_sparse_bitmasks = true;
                r.cache.arch_has_per_cpu_cfg = true;
                r.cache.min_cbm_bits = 0;
            }
            ResourceId::Mba => {
                r.msr_base = MSR_IA32_MBA_BW_BASE;
                r.writer = Some(&AMD_MBA_WRITER);
            }
            ResourceId::Smba => {
                r.msr_base = MSR_IA32_SMBA_BW_BASE;
                r.writer = Some(&AMD_MBA_WRITER);
            }
        }
    }

    fn mem_config(&self, cpuid: &dyn Cpuid, _caps: &Capabilities, r: &mut Resource) -> bool {
        Self::get_mem_config(cpuid, r)
    }

    fn slow_mem_config(&self, cpuid: &dyn Cpuid, r: &mut Resource) -> bool {
        Self::get_mem_config(cpuid, r)
    }
}

/// その他のベンダー（キャッシュ割り当て・監視のみ）
pub struct GenericOps;

impl VendorOps for GenericOps {
    fn init_res_defs(&self, _r: &mut Resource) {}
}
