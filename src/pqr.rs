// ============================================================================
// src/pqr.rs - CPUごとの CLOSID/RMID 関連付け状態
//
// PQR_ASSOC は CPUローカルなレジスタで、現在実行中のタスクがどの制御グループ
// (CLOSID) と監視グループ (RMID) に属するかを示す。オンライン/オフライン時に
// 予約済みの「グループなし」状態へ戻す。
// ============================================================================

use crate::arch::msr::{MSR_IA32_PQR_ASSOC, pqr_assoc_value};
use crate::arch::{IrqControl, IrqGuard, MsrAccess};
use crate::percpu::PerCpu;

/// 予約済み CLOSID（デフォルトグループ）
pub const RESERVED_CLOSID: u32 = 0;
/// 予約済み RMID（デフォルトグループ）
pub const RESERVED_RMID: u32 = 0;

/// 1CPUの関連付け状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PqrState {
    /// PQR_ASSOC に書かれている CLOSID
    pub cur_closid: u32,
    /// PQR_ASSOC に書かれている RMID
    pub cur_rmid: u32,
    /// このCPUのデフォルト CLOSID
    pub default_closid: u32,
    /// このCPUのデフォルト RMID
    pub default_rmid: u32,
}

impl PqrState {
    /// 予約値にリセットされた状態
    pub const RESET: Self = Self {
        cur_closid: RESERVED_CLOSID,
        cur_rmid: RESERVED_RMID,
        default_closid: RESERVED_CLOSID,
        default_rmid: RESERVED_RMID,
    };
}

impl Default for PqrState {
    fn default() -> Self {
        Self::RESET
    }
}

/// 全CPUの関連付け状態
pub struct PqrStates {
    states: PerCpu<PqrState>,
}

impl PqrStates {
    pub fn new() -> Self {
        Self {
            states: PerCpu::new(|_| PqrState::RESET),
        }
    }

    /// `cpu` の関連付けを予約値に戻し、PQR_ASSOC に書き込む
    ///
    /// `cpu` 自身の上で呼ぶこと。割り込みはこの中で禁止する。
    /// 何度呼んでも同じ状態になる。
    pub fn clear_closid_rmid(&self, cpu: u32, irq: &dyn IrqControl, msr: &dyn MsrAccess) {
        let _irq = IrqGuard::new(irq);
        // SAFETY: 自CPU上で割り込み禁止中
        let updated = unsafe {
            self.states.with_local(cpu, |state| {
                *state = PqrState::RESET;
            })
        };
        if updated.is_some() {
            msr.write(
                cpu,
                MSR_IA32_PQR_ASSOC,
                pqr_assoc_value(RESERVED_CLOSID, RESERVED_RMID),
            );
        }
    }

    /// `cpu` の関連付け状態を読み取る
    ///
    /// # Safety
    /// `cpu` 自身の上で呼ぶか、`cpu` がこの状態を並行して更新していないこと。
    pub unsafe fn read(&self, cpu: u32, irq: &dyn IrqControl) -> Option<PqrState> {
        let _irq = IrqGuard::new(irq);
        // SAFETY: 呼び出し元の契約
        unsafe { self.states.with_local(cpu, |state| *state) }
    }

    /// `cpu` の現在の関連付けを書き換える（スケジューラからのタスク切り替え用）
    ///
    /// 値が変わらない場合は MSR へ書き込まない。
    ///
    /// # Safety
    /// `cpu` 自身の上で呼ぶこと。
    pub unsafe fn switch_to(
        &self,
        cpu: u32,
        closid: u32,
        rmid: u32,
        irq: &dyn IrqControl,
        msr: &dyn MsrAccess,
    ) {
        let _irq = IrqGuard::new(irq);
        // SAFETY: 呼び出し元の契約 + 割り込み禁止中
        let changed = unsafe {
            self.states.with_local(cpu, |state| {
                if state.cur_closid == closid && state.cur_rmid == rmid {
                    return false;
                }
                state.cur_closid = closid;
                state.cur_rmid = rmid;
                true
            })
        };
        if changed == Some(true) {
            msr.write(cpu, MSR_IA32_PQR_ASSOC, pqr_assoc_value(closid, rmid));
        }
    }
}

impl Default for PqrStates {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::mock::{MockIrq, MockMsr};

    #[test]
    fn test_clear_is_idempotent() {
        let irq = MockIrq::new();
        let msr = MockMsr::new();
        let pqr = PqrStates::new();

        unsafe { pqr.switch_to(1, 3, 7, &irq, &msr) };
        assert_eq!(msr.value(1, MSR_IA32_PQR_ASSOC), Some(pqr_assoc_value(3, 7)));

        pqr.clear_closid_rmid(1, &irq, &msr);
        let first = unsafe { pqr.read(1, &irq) };
        pqr.clear_closid_rmid(1, &irq, &msr);
        let second = unsafe { pqr.read(1, &irq) };

        assert_eq!(first, Some(PqrState::RESET));
        assert_eq!(first, second);
        assert_eq!(msr.value(1, MSR_IA32_PQR_ASSOC), Some(0));
        assert!(!irq.disabled());
    }

    #[test]
    fn test_switch_skips_redundant_write() {
        let irq = MockIrq::new();
        let msr = MockMsr::new();
        let pqr = PqrStates::new();

        unsafe {
            pqr.switch_to(0, 2, 2, &irq, &msr);
            pqr.switch_to(0, 2, 2, &irq, &msr);
        }
        assert_eq!(msr.writes_to(MSR_IA32_PQR_ASSOC).len(), 1);
    }
}
