// ============================================================================
// src/domain/mod.rs - ハードウェアドメイン
//
// ドメインは「リソース × トポロジ単位（キャッシュID / NUMAノード）」ごとの
// ハードウェアインスタンス。最初のメンバーCPUのオンラインで生成され、
// 最後のメンバーCPUのオフラインで破棄される。
// ============================================================================

pub mod ctrl;
pub mod lifecycle;
pub mod mon;
pub mod registry;

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crate::cpumask::CpuMask;
use crate::error::{ResctrlError, ResctrlResult};

pub use ctrl::{CtrlDomain, PseudoLockRegion};
pub use lifecycle::Transition;
pub use mon::{ArchMbmState, MonDomain};
pub use registry::{DomainList, DomainListGuard, DomainListLock, DomainSnapshot};

/// 制御ドメイン・監視ドメイン共通のヘッダ
#[derive(Debug)]
pub struct DomainHeader {
    /// トポロジID（リスト内で一意）
    pub id: u32,
    /// メンバーCPU（リストに載っている間は空にならない）
    pub cpu_mask: CpuMask,
}

impl DomainHeader {
    pub fn new(id: u32, cpu: u32) -> Self {
        Self {
            id,
            cpu_mask: CpuMask::single(cpu),
        }
    }
}

/// ドメインリストに載せられる型
pub trait Domain: Send + Sync {
    fn header(&self) -> &DomainHeader;

    fn id(&self) -> u32 {
        self.header().id
    }
}

/// ドメインと配列の生存数（確保/解放の帳尻）
#[derive(Debug, Default)]
pub struct DomainCounters {
    ctrl_domains: AtomicUsize,
    mon_domains: AtomicUsize,
    ctrl_arrays: AtomicUsize,
    mbm_arrays: AtomicUsize,
    /// 故障注入: 残り回数ぶんの配列確保を失敗させる
    inject_failures: AtomicU32,
}

/// [`DomainCounters`] のスナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DomainStats {
    /// 生存している制御ドメイン
    pub ctrl_domains: usize,
    /// 生存している監視ドメイン
    pub mon_domains: usize,
    /// 生存している制御値配列
    pub ctrl_arrays: usize,
    /// 生存している MBM カウンタ配列
    pub mbm_arrays: usize,
}

impl DomainStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Counter {
    CtrlDomain,
    MonDomain,
    CtrlArray,
    MbmArray,
}

impl DomainCounters {
    pub const fn new() -> Self {
        Self {
            ctrl_domains: AtomicUsize::new(0),
            mon_domains: AtomicUsize::new(0),
            ctrl_arrays: AtomicUsize::new(0),
            mbm_arrays: AtomicUsize::new(0),
            inject_failures: AtomicU32::new(0),
        }
    }

    fn counter(&self, which: Counter) -> &AtomicUsize {
        match which {
            Counter::CtrlDomain => &self.ctrl_domains,
            Counter::MonDomain => &self.mon_domains,
            Counter::CtrlArray => &self.ctrl_arrays,
            Counter::MbmArray => &self.mbm_arrays,
        }
    }

    pub(crate) fn inc(&self, which: Counter) {
        self.counter(which).fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec(&self, which: Counter) {
        self.counter(which).fetch_sub(1, Ordering::Relaxed);
    }

    /// 次の `count` 回の配列確保を失敗させる
    pub fn inject_alloc_failures(&self, count: u32) {
        self.inject_failures.store(count, Ordering::Relaxed);
    }

    /// 配列確保の前に呼ぶ。注入された失敗があれば消費してエラーを返す
    pub(crate) fn check_alloc(&self) -> ResctrlResult<()> {
        let injected = self
            .inject_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(ResctrlError::AllocationFailure),
            Err(_) => Ok(()),
        }
    }

    pub fn snapshot(&self) -> DomainStats {
        DomainStats {
            ctrl_domains: self.ctrl_domains.load(Ordering::Relaxed),
            mon_domains: self.mon_domains.load(Ordering::Relaxed),
            ctrl_arrays: self.ctrl_arrays.load(Ordering::Relaxed),
            mbm_arrays: self.mbm_arrays.load(Ordering::Relaxed),
        }
    }
}
