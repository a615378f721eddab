// ============================================================================
// src/platform/mod.rs - 外部コラボレータ
//
// resctrl のコアが依存するカーネルの他の部分をトレイトとして切り出す。
// - トポロジ: CPU → キャッシュID / NUMAノード
// - プレゼンテーション層: ドメインのオンライン/オフライン通知
// - ホットプラグ: オンライン/オフラインハンドラの登録
// - クロスコール: 他CPU上でのMSR書き込み
// ============================================================================

pub mod topology;

use alloc::sync::Arc;

use crate::arch::{Cpuid, IrqControl, MsrAccess};
use crate::cpumask::CpuMask;
use crate::domain::{CtrlDomain, MonDomain};
use crate::error::{ResctrlError, ResctrlResult};
use crate::resource::Resource;

pub use topology::TableTopology;

/// CPUトポロジの参照
pub trait Topology: Send + Sync {
    /// `cpu` が属するレベル `level` のキャッシュのID
    fn cache_id(&self, cpu: u32, level: u32) -> Option<u32>;

    /// `cpu` が属する NUMA ノード
    fn cpu_to_node(&self, cpu: u32) -> Option<u32>;

    /// 1つの L3 を分け合う NUMA ノード数 (Sub-NUMA Clustering)
    ///
    /// SNC が無効なら 1。
    fn snc_nodes_per_l3(&self) -> u32 {
        1
    }
}

/// プレゼンテーション層（ファイルシステム）への通知
pub trait ResctrlFs: Send + Sync {
    /// ブート時の初期化。失敗するとブート全体が中止される
    fn init(&self) -> ResctrlResult<()>;

    fn exit(&self);

    /// CPUの関連付けリセット後に呼ばれる
    fn online_cpu(&self, cpu: u32);

    /// ドメインから外れる前に呼ばれる
    fn offline_cpu(&self, cpu: u32);

    /// 新しい制御ドメインがリストに載った。エラーを返すとドメインは取り消される
    fn online_ctrl_domain(&self, r: &Resource, d: &CtrlDomain) -> ResctrlResult<()>;

    /// 制御ドメインがリストから外れる直前
    fn offline_ctrl_domain(&self, r: &Resource, d: &CtrlDomain);

    fn online_mon_domain(&self, r: &Resource, d: &MonDomain) -> ResctrlResult<()>;

    fn offline_mon_domain(&self, r: &Resource, d: &MonDomain);
}

/// CPUのオンライン/オフラインを受け取るハンドラ
pub trait CpuHotplugHandler: Send + Sync {
    fn online_cpu(&self, cpu: u32) -> ResctrlResult<()>;

    fn offline_cpu(&self, cpu: u32) -> ResctrlResult<()>;
}

/// 登録済みハンドラの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HotplugState(pub u32);

/// ホットプラグハンドラの登録先
pub trait HotplugManager: Send + Sync {
    /// ハンドラを登録する
    ///
    /// 登録時点でオンラインのCPUそれぞれについて、そのCPU上で `online_cpu` を呼ぶ。
    fn setup_state(
        &self,
        name: &'static str,
        handler: Arc<dyn CpuHotplugHandler>,
    ) -> ResctrlResult<HotplugState>;

    /// 登録を解除する
    ///
    /// オンラインのCPUそれぞれについて `offline_cpu` を呼んでから解除する。
    fn remove_state(&self, state: HotplugState);
}

/// 指定CPU上での関数実行（関数呼び出しIPI）
///
/// MSR は CPU ローカルなので、別ドメインのレジスタはそのドメインの
/// CPU 上で書く必要がある。どちらも `f` の完了まで戻らない。
pub trait CrossCall: Send + Sync {
    /// `cpu` 上で `f(cpu)` を実行する
    fn call_on(&self, cpu: u32, f: &mut dyn FnMut(u32)) -> ResctrlResult<()>;

    /// `mask` のいずれかのCPU上で `f(cpu)` を実行する
    fn call_any(&self, mask: &CpuMask, f: &mut dyn FnMut(u32)) -> ResctrlResult<()> {
        let cpu = mask.first().ok_or(ResctrlError::InvalidArgument)?;
        self.call_on(cpu, f)
    }
}

/// コアが使うコラボレータ一式
#[derive(Clone)]
pub struct Platform {
    pub cpuid: Arc<dyn Cpuid>,
    pub msr: Arc<dyn MsrAccess>,
    pub irq: Arc<dyn IrqControl>,
    pub topology: Arc<dyn Topology>,
    pub fs: Arc<dyn ResctrlFs>,
    pub hotplug: Arc<dyn HotplugManager>,
    pub cross_call: Arc<dyn CrossCall>,
}

#[cfg(target_arch = "x86_64")]
impl Platform {
    /// 実機の CPUID / MSR / 割り込みフラグを使う
    ///
    /// `cross_call` はカーネルの関数呼び出しIPIで実装すること。
    pub fn native(
        topology: Arc<dyn Topology>,
        fs: Arc<dyn ResctrlFs>,
        hotplug: Arc<dyn HotplugManager>,
        cross_call: Arc<dyn CrossCall>,
    ) -> Self {
        use crate::arch::{NativeCpuid, NativeIrq, NativeMsr};

        Self {
            cpuid: Arc::new(NativeCpuid),
            msr: Arc::new(NativeMsr),
            irq: Arc::new(NativeIrq),
            topology,
            fs,
            hotplug,
            cross_call,
        }
    }
}
