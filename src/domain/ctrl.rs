// ============================================================================
// src/domain/ctrl.rs - 制御ドメイン
// ============================================================================

use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::{Counter, Domain, DomainCounters, DomainHeader};
use crate::error::ResctrlResult;

/// キャッシュ疑似ロック領域
///
/// ドメインへの逆参照（ドメインID）を持ち、ドメインの破棄時にクリアされる。
#[derive(Debug)]
pub struct PseudoLockRegion {
    pub closid: u32,
    pub cbm: u32,
    domain: Mutex<Option<u32>>,
}

impl PseudoLockRegion {
    pub fn new(closid: u32, cbm: u32) -> Self {
        Self {
            closid,
            cbm,
            domain: Mutex::new(None),
        }
    }

    /// 領域を持つドメインのID（ドメインが破棄されていれば None）
    pub fn domain(&self) -> Option<u32> {
        *self.domain.lock()
    }
}

/// 制御ドメイン
pub struct CtrlDomain {
    hdr: DomainHeader,
    /// CLOSID ごとの制御値（`num_closid` 要素）
    ctrl_val: Mutex<Vec<u32>>,
    plr: Mutex<Option<Arc<PseudoLockRegion>>>,
    counters: Arc<DomainCounters>,
}

impl CtrlDomain {
    /// 全 CLOSID を `default` で初期化したドメインを作る
    pub fn new(
        id: u32,
        cpu: u32,
        num_closid: u32,
        default: u32,
        counters: &Arc<DomainCounters>,
    ) -> ResctrlResult<Self> {
        counters.check_alloc()?;
        let mut ctrl_val = Vec::new();
        ctrl_val.try_reserve_exact(num_closid as usize)?;
        ctrl_val.resize(num_closid as usize, default);

        counters.inc(Counter::CtrlDomain);
        counters.inc(Counter::CtrlArray);
        Ok(Self {
            hdr: DomainHeader::new(id, cpu),
            ctrl_val: Mutex::new(ctrl_val),
            plr: Mutex::new(None),
            counters: counters.clone(),
        })
    }

    /// 制御値を読み書きする
    pub fn with_ctrl_val<R>(&self, f: impl FnOnce(&mut [u32]) -> R) -> R {
        f(&mut self.ctrl_val.lock())
    }

    pub fn ctrl_val(&self, closid: u32) -> Option<u32> {
        self.ctrl_val.lock().get(closid as usize).copied()
    }

    /// 制御値配列の先頭アドレス（再確保されていないことの確認用）
    pub fn ctrl_val_ptr(&self) -> *const u32 {
        self.ctrl_val.lock().as_ptr()
    }

    /// 疑似ロック領域を結び付ける
    pub fn attach_pseudo_lock(&self, plr: Arc<PseudoLockRegion>) {
        *plr.domain.lock() = Some(self.hdr.id);
        *self.plr.lock() = Some(plr);
    }

    pub fn pseudo_lock(&self) -> Option<Arc<PseudoLockRegion>> {
        self.plr.lock().clone()
    }

    /// ドメイン破棄時: 疑似ロック領域からの逆参照をクリアする
    pub(crate) fn release_pseudo_lock(&self) {
        if let Some(plr) = self.plr.lock().take() {
            *plr.domain.lock() = None;
        }
    }
}

impl Domain for CtrlDomain {
    fn header(&self) -> &DomainHeader {
        &self.hdr
    }
}

impl Drop for CtrlDomain {
    fn drop(&mut self) {
        self.counters.dec(Counter::CtrlArray);
        self.counters.dec(Counter::CtrlDomain);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResctrlError;

    #[test]
    fn test_defaults_and_accounting() {
        let counters = Arc::new(DomainCounters::new());
        let d = CtrlDomain::new(7, 0, 16, 0x7ff, &counters).unwrap();
        assert_eq!(d.id(), 7);
        assert_eq!(d.ctrl_val(15), Some(0x7ff));
        assert_eq!(d.ctrl_val(16), None);
        assert_eq!(counters.snapshot().ctrl_arrays, 1);
        drop(d);
        assert!(counters.snapshot().is_empty());
    }

    #[test]
    fn test_allocation_failure_leaves_no_trace() {
        let counters = Arc::new(DomainCounters::new());
        counters.inject_alloc_failures(1);
        let err = CtrlDomain::new(0, 0, 4, 1, &counters).err();
        assert_eq!(err, Some(ResctrlError::AllocationFailure));
        assert!(counters.snapshot().is_empty());
    }

    #[test]
    fn test_pseudo_lock_back_reference() {
        let counters = Arc::new(DomainCounters::new());
        let d = CtrlDomain::new(3, 0, 4, 0xf, &counters).unwrap();
        let plr = Arc::new(PseudoLockRegion::new(1, 0x3));
        d.attach_pseudo_lock(plr.clone());
        assert_eq!(plr.domain(), Some(3));
        d.release_pseudo_lock();
        assert_eq!(plr.domain(), None);
        assert!(d.pseudo_lock().is_none());
    }
}
