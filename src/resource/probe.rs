// ============================================================================
// src/resource/probe.rs - ブート時の機能検出
//
// ブートCPU上で一度だけ実行する。機能が無いことはエラーではなく、
// 該当リソースが capable にならないだけ。
// ============================================================================

use alloc::sync::Arc;

use super::mon::{MBM_CNTR_WIDTH_BASE, MonFeatures};
use super::vendor::{VendorOps, ops_for};
use super::{ResourceId, ResourceTable, Scope};
use crate::arch::{CpuFeatures, CpuInfo, Cpuid, MsrAccess, Vendor};
use crate::options::{Capabilities, RdtOptions};
use crate::sync::Rcu;

/// リソース表を検出する
///
/// 1. ベンダー既定値の適用
/// 2. クワーク処理（上書き表への強制OFF追加を含む）
/// 3. 割り当て機能・監視機能の検出
pub fn probe(
    cpuid: &dyn Cpuid,
    msr: &dyn MsrAccess,
    boot_cpu: u32,
    options: RdtOptions,
    rcu: &Arc<Rcu>,
) -> ResourceTable {
    let info = CpuInfo::detect(cpuid);
    let mut table = ResourceTable::new(info.signature, Capabilities::new(info.features, options), rcu);
    let ops = ops_for(info.signature.vendor);

    for r in table.iter_mut() {
        ops.init_res_defs(r);
    }

    let quirk_alloc = ops.check_quirks(&mut table, msr, boot_cpu);

    table.alloc_capable = quirk_alloc || get_alloc_resources(&mut table, cpuid, ops);
    table.mon_capable = get_mon_resources(&mut table, &info);

    log::debug!(
        "resctrl: probed {:?} family {:#x} model {:#x}: features {:?}",
        info.signature.vendor,
        info.signature.family,
        info.signature.model,
        info.features
    );
    table
}

/// Sub-NUMA Clustering 向けに L3 監視を調整する
///
/// L3 を `nodes` 個のノードが分け合うとき、RMID と占有量スケールを
/// ノード数で割り、監視ドメインをノード単位にする。
pub fn apply_snc(table: &mut ResourceTable, nodes: u32) {
    if !table.mon_capable || nodes <= 1 {
        return;
    }
    table.mon.snc_nodes_per_l3 = nodes;
    table.mon.num_rmid /= nodes;
    table.mon.occupancy_scale /= nodes;

    let num_rmid = table.mon.num_rmid;
    let r = table.get_mut(ResourceId::L3);
    r.mon_scope = Some(Scope::L3Node);
    r.num_rmid = num_rmid;
    log::info!("resctrl: Sub-NUMA Cluster mode detected with {} nodes per L3 cache", nodes);
}

/// CPUID 0x10 のサブリーフ (1: L3, 2: L2) からキャッシュ割り当ての設定を読む
fn cache_alloc_cfg(table: &mut ResourceTable, cpuid: &dyn Cpuid, rid: ResourceId, subleaf: u32) {
    let is_intel = table.vendor() == Vendor::Intel;
    let leaf = cpuid.cpuid_count(0x10, subleaf);
    let r = table.get_mut(rid);

    r.num_closid = (leaf.edx & 0xffff) + 1;
    r.cache.cbm_len = (leaf.eax & 0x1f) + 1;
    r.cache.shareable_bits = leaf.ebx & r.default_ctrl();
    if is_intel {
        r.cache.arch_has_sparse_bitmasks = leaf.ecx & (1 << 3) != 0;
    }
    r.alloc_capable = true;
}

/// CDP は既定で無効。有効化は管理操作で行う
fn cdp_config(table: &mut ResourceTable, rid: ResourceId) {
    let r = table.get_mut(rid);
    r.set_cdp_flag(false);
    r.cdp_capable = true;
}

fn get_alloc_resources(table: &mut ResourceTable, cpuid: &dyn Cpuid, ops: &dyn VendorOps) -> bool {
    if !table.caps.boot_cpu_has(CpuFeatures::RDT_A) {
        return false;
    }

    let mut ret = false;

    if table.caps.has_feature(CpuFeatures::CAT_L3) {
        cache_alloc_cfg(table, cpuid, ResourceId::L3, 1);
        if table.caps.has_feature(CpuFeatures::CDP_L3) {
            cdp_config(table, ResourceId::L3);
        }
        ret = true;
    }
    if table.caps.has_feature(CpuFeatures::CAT_L2) {
        // 0x10.2 は 0x10.1 と同じ形式
        cache_alloc_cfg(table, cpuid, ResourceId::L2, 2);
        if table.caps.has_feature(CpuFeatures::CDP_L2) {
            cdp_config(table, ResourceId::L2);
        }
        ret = true;
    }

    if table.caps.has_feature(CpuFeatures::MBA) {
        let caps = table.caps.clone();
        if ops.mem_config(cpuid, &caps, table.get_mut(ResourceId::Mba)) {
            ret = true;
        }
    }

    if table.caps.has_feature(CpuFeatures::SMBA)
        && ops.slow_mem_config(cpuid, table.get_mut(ResourceId::Smba))
    {
        ret = true;
    }

    ret
}

fn get_mon_resources(table: &mut ResourceTable, info: &CpuInfo) -> bool {
    let mut features = MonFeatures::empty();
    features.set(
        MonFeatures::LLC_OCCUPANCY,
        table.caps.has_feature(CpuFeatures::CQM_OCCUP_LLC),
    );
    features.set(
        MonFeatures::MBM_TOTAL,
        table.caps.has_feature(CpuFeatures::CQM_MBM_TOTAL),
    );
    features.set(
        MonFeatures::MBM_LOCAL,
        table.caps.has_feature(CpuFeatures::CQM_MBM_LOCAL),
    );

    if features.is_empty() {
        return false;
    }
    let Some(max_rmid) = info.cache_max_rmid else {
        return false;
    };

    table.mon.features = features;
    table.mon.num_rmid = max_rmid + 1;
    table.mon.occupancy_scale = info.cache_occ_scale.unwrap_or(0);
    table.mon.mbm_width = MBM_CNTR_WIDTH_BASE + info.mbm_width_offset.unwrap_or(0);

    let num_rmid = table.mon.num_rmid;
    let r = table.get_mut(ResourceId::L3);
    r.mon_scope = Some(Scope::L3Cache);
    r.num_rmid = num_rmid;
    r.mon_capable = true;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::msr::{MSR_IA32_MBA_BW_BASE, MSR_IA32_MBA_THRTL_BASE};
    use crate::arch::{CpuidResult, intel_model};
    use crate::resource::ThrottleMode;
    use crate::test::mock::{MockCpuid, MockMsr};

    fn run(cpuid: &MockCpuid, options: &str) -> ResourceTable {
        probe(
            cpuid,
            &MockMsr::new(),
            0,
            RdtOptions::parse(options),
            &Arc::new(Rcu::new()),
        )
    }

    #[test]
    fn test_probe_intel() {
        let t = run(&MockCpuid::intel_rdt(), "");
        assert!(t.alloc_capable && t.mon_capable);

        let l3 = t.get(ResourceId::L3);
        assert!(l3.alloc_capable && l3.mon_capable);
        assert_eq!(l3.cache.cbm_len, 11);
        assert_eq!(l3.cache.shareable_bits, 0x600);
        assert_eq!(l3.num_closid, 16);
        assert!(l3.cdp_capable && !l3.cdp_enabled());
        assert_eq!(l3.default_ctrl(), 0x7ff);

        let l2 = t.get(ResourceId::L2);
        assert!(l2.alloc_capable && !l2.mon_capable);
        assert_eq!(l2.cache.cbm_len, 8);

        let mba = t.get(ResourceId::Mba);
        assert!(mba.alloc_capable);
        assert_eq!(mba.msr_base, MSR_IA32_MBA_THRTL_BASE);
        assert_eq!(mba.num_closid, 8);
        assert_eq!(mba.membw.max_bw, 100);
        assert_eq!(mba.membw.min_bw, 10);
        assert_eq!(mba.membw.bw_gran, 10);
        assert!(mba.membw.delay_linear);
        assert_eq!(mba.membw.throttle_mode, ThrottleMode::Max);

        assert!(!t.get(ResourceId::Smba).alloc_capable);

        assert_eq!(t.mon.num_rmid, 0x100);
        assert_eq!(t.mon.mbm_width, 24);
        assert!(t.mon.is_mbm_total_enabled() && t.mon.is_mbm_local_enabled());
    }

    #[test]
    fn test_probe_amd() {
        let t = run(&MockCpuid::amd_qos(), "");
        let mba = t.get(ResourceId::Mba);
        assert!(mba.alloc_capable);
        assert_eq!(mba.msr_base, MSR_IA32_MBA_BW_BASE);
        assert_eq!(mba.membw.max_bw, 1 << 11);
        assert_eq!(mba.num_closid, 16);
        assert_eq!(mba.membw.throttle_mode, ThrottleMode::Undefined);

        let smba = t.get(ResourceId::Smba);
        assert!(smba.alloc_capable);
        assert_eq!(smba.membw.bw_gran, 1);

        let l3 = t.get(ResourceId::L3);
        assert!(l3.cache.arch_has_per_cpu_cfg);
        assert_eq!(t.mon.mbm_width, 24 + 20);
    }

    #[test]
    fn test_options_remove_resources() {
        let t = run(&MockCpuid::intel_rdt(), "!l3cat,!mba,!cmt,!mbmtotal,!mbmlocal");
        assert!(!t.get(ResourceId::L3).alloc_capable);
        assert!(!t.get(ResourceId::Mba).alloc_capable);
        assert!(t.get(ResourceId::L2).alloc_capable);
        assert!(t.alloc_capable);
        assert!(!t.mon_capable);
        assert!(!t.get(ResourceId::L3).is_capable());
    }

    #[test]
    fn test_cdp_forced_off() {
        let t = run(&MockCpuid::intel_rdt(), "!l3cdp");
        assert!(!t.get(ResourceId::L3).cdp_capable);
    }

    #[test]
    fn test_per_thread_throttle() {
        let cpuid = MockCpuid::intel_rdt();
        cpuid.or_bits(0x10, 3, CpuidResult { eax: 0, ebx: 0, ecx: 1, edx: 0 });
        let t = run(&cpuid, "");
        assert_eq!(t.get(ResourceId::Mba).membw.throttle_mode, ThrottleMode::PerThread);
    }

    #[test]
    fn test_skylake_quirk_applies_after_user_options() {
        let cpuid = MockCpuid::intel_rdt();
        cpuid.signature(6, intel_model::SKYLAKE_X, 3);
        let t = run(&cpuid, "l3cat");
        assert!(!t.get(ResourceId::L3).alloc_capable);
        assert!(!t.mon_capable);
        assert!(t.get(ResourceId::L2).alloc_capable);
    }

    #[test]
    fn test_snc_splits_rmids() {
        let mut t = run(&MockCpuid::intel_rdt(), "");
        let scale = t.mon.occupancy_scale;
        apply_snc(&mut t, 1);
        assert!(!t.mon.snc_enabled());
        assert_eq!(t.get(ResourceId::L3).mon_scope, Some(Scope::L3Cache));

        apply_snc(&mut t, 2);
        assert!(t.mon.snc_enabled());
        assert_eq!(t.mon.num_rmid, 0x80);
        assert_eq!(t.mon.occupancy_scale, scale / 2);
        let l3 = t.get(ResourceId::L3);
        assert_eq!(l3.mon_scope, Some(Scope::L3Node));
        assert_eq!(l3.num_rmid, 0x80);
    }

    #[test]
    fn test_nothing_capable() {
        let t = run(&MockCpuid::new(Vendor::Intel), "");
        assert!(!t.alloc_capable && !t.mon_capable);
        assert_eq!(t.capable().count(), 0);
    }
}
