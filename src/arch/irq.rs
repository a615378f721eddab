// ============================================================================
// src/arch/irq.rs - 割り込み禁止区間
//
// CPUローカルな状態 (PQR関連付け) の読み書きは、割り込み禁止の状態で
// 自CPUからのみ行う。ロックは不要。
//
// 参考: Linux の local_irq_save / local_irq_restore
// ============================================================================

/// 割り込みフラグ操作の抽象化
pub trait IrqControl: Send + Sync {
    /// 割り込みフラグを保存して割り込みを禁止
    ///
    /// # Returns
    /// 元の割り込み有効状態 (true = 有効だった)
    fn save_and_disable(&self) -> bool;

    /// 割り込みを復元（元々有効だった場合のみ有効化）
    fn restore(&self, was_enabled: bool);
}

/// 実機の RFLAGS.IF 操作
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeIrq;

#[cfg(target_arch = "x86_64")]
impl IrqControl for NativeIrq {
    #[inline]
    fn save_and_disable(&self) -> bool {
        use x86_64::instructions::interrupts;

        let was_enabled = interrupts::are_enabled();
        if was_enabled {
            interrupts::disable();
        }
        was_enabled
    }

    #[inline]
    fn restore(&self, was_enabled: bool) {
        if was_enabled {
            x86_64::instructions::interrupts::enable();
        }
    }
}

/// 割り込み禁止区間のガード
///
/// ドロップ時に元の割り込み状態に復元する。
pub struct IrqGuard<'a> {
    ctl: &'a dyn IrqControl,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    pub fn new(ctl: &'a dyn IrqControl) -> Self {
        let was_enabled = ctl.save_and_disable();
        Self { ctl, was_enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.ctl.restore(self.was_enabled);
    }
}

/// 割り込みを禁止した状態で処理を実行
pub fn with_interrupts_disabled<F, R>(ctl: &dyn IrqControl, f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = IrqGuard::new(ctl);
    f()
}
