// ============================================================================
// src/domain/mon.rs - 監視ドメイン
// ============================================================================

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{Counter, Domain, DomainCounters, DomainHeader};
use crate::error::ResctrlResult;
use crate::resource::MonConfig;

/// RMID ごとの MBM カウンタ状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchMbmState {
    /// 折り返しを考慮して積算したチャンク数
    pub chunks: u64,
    /// 前回読み取ったカウンタ値
    pub prev_msr: u64,
}

/// 監視ドメイン
pub struct MonDomain {
    hdr: DomainHeader,
    /// L3 キャッシュの識別子
    ci_id: u32,
    mbm_total: Option<Mutex<Vec<ArchMbmState>>>,
    mbm_local: Option<Mutex<Vec<ArchMbmState>>>,
    counters: Arc<DomainCounters>,
}

fn alloc_mbm(num_rmid: u32, counters: &DomainCounters) -> ResctrlResult<Vec<ArchMbmState>> {
    counters.check_alloc()?;
    let mut v = Vec::new();
    v.try_reserve_exact(num_rmid as usize)?;
    v.resize(num_rmid as usize, ArchMbmState::default());
    Ok(v)
}

impl MonDomain {
    /// 有効な MBM イベントのカウンタ配列だけを確保したドメインを作る
    ///
    /// 途中で確保に失敗した場合、確保済みの配列は解放される。
    pub fn new(
        id: u32,
        cpu: u32,
        ci_id: u32,
        mon: &MonConfig,
        counters: &Arc<DomainCounters>,
    ) -> ResctrlResult<Self> {
        let mbm_total = if mon.is_mbm_total_enabled() {
            Some(alloc_mbm(mon.num_rmid, counters)?)
        } else {
            None
        };
        let mbm_local = if mon.is_mbm_local_enabled() {
            Some(alloc_mbm(mon.num_rmid, counters)?)
        } else {
            None
        };

        counters.inc(Counter::MonDomain);
        for _ in mbm_total.iter().chain(mbm_local.iter()) {
            counters.inc(Counter::MbmArray);
        }
        Ok(Self {
            hdr: DomainHeader::new(id, cpu),
            ci_id,
            mbm_total: mbm_total.map(Mutex::new),
            mbm_local: mbm_local.map(Mutex::new),
            counters: counters.clone(),
        })
    }

    pub fn ci_id(&self) -> u32 {
        self.ci_id
    }

    pub fn has_mbm_total(&self) -> bool {
        self.mbm_total.is_some()
    }

    pub fn has_mbm_local(&self) -> bool {
        self.mbm_local.is_some()
    }

    /// 総帯域カウンタの状態 (`rmid` が範囲外、またはイベント無効なら None)
    pub fn mbm_total_state(&self, rmid: u32) -> Option<ArchMbmState> {
        self.mbm_total.as_ref()?.lock().get(rmid as usize).copied()
    }

    pub fn mbm_local_state(&self, rmid: u32) -> Option<ArchMbmState> {
        self.mbm_local.as_ref()?.lock().get(rmid as usize).copied()
    }

    /// 全 RMID のカウンタ状態をリセット（RMID の再利用時）
    pub fn reset_mbm_states(&self) {
        for arr in self.mbm_total.iter().chain(self.mbm_local.iter()) {
            arr.lock().fill(ArchMbmState::default());
        }
    }
}

impl Domain for MonDomain {
    fn header(&self) -> &DomainHeader {
        &self.hdr
    }
}

impl Drop for MonDomain {
    fn drop(&mut self) {
        for _ in self.mbm_total.iter().chain(self.mbm_local.iter()) {
            self.counters.dec(Counter::MbmArray);
        }
        self.counters.dec(Counter::MonDomain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::MonFeatures;

    fn mon(features: MonFeatures) -> MonConfig {
        MonConfig {
            num_rmid: 32,
            features,
            ..Default::default()
        }
    }

    #[test]
    fn test_arrays_only_for_enabled_events() {
        let counters = Arc::new(DomainCounters::new());
        let d = MonDomain::new(1, 0, 1, &mon(MonFeatures::MBM_LOCAL), &counters).unwrap();
        assert!(!d.has_mbm_total());
        assert!(d.has_mbm_local());
        assert_eq!(d.mbm_local_state(31), Some(ArchMbmState::default()));
        assert_eq!(d.mbm_local_state(32), None);
        assert_eq!(counters.snapshot().mbm_arrays, 1);

        let occ = MonDomain::new(2, 1, 2, &mon(MonFeatures::LLC_OCCUPANCY), &counters).unwrap();
        assert!(!occ.has_mbm_total() && !occ.has_mbm_local());
        assert_eq!(counters.snapshot().mbm_arrays, 1);

        drop(d);
        drop(occ);
        assert!(counters.snapshot().is_empty());
    }

    #[test]
    fn test_allocation_failure_counts_nothing() {
        let all = mon(MonFeatures::MBM_TOTAL | MonFeatures::MBM_LOCAL);
        let counters = Arc::new(DomainCounters::new());
        counters.inject_alloc_failures(1);
        assert!(MonDomain::new(0, 0, 0, &all, &counters).is_err());
        assert!(counters.snapshot().is_empty());

        let d = MonDomain::new(0, 0, 0, &all, &counters).unwrap();
        assert_eq!(counters.snapshot().mbm_arrays, 2);
        drop(d);
        assert!(counters.snapshot().is_empty());
    }
}
