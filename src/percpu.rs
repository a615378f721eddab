// ============================================================================
// src/percpu.rs - Per-CPU データ
//
// CPU IDで添字付けされた固定長スロット配列。各スロットはキャッシュラインに
// 揃え、所有CPUだけが割り込み禁止状態で読み書きする。
// ============================================================================

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;

use crate::cpumask::MAX_CPUS;
use crate::sync::CacheLinePadded;

/// CPUごとに1スロットを持つ配列
pub struct PerCpu<T> {
    slots: Box<[CacheLinePadded<UnsafeCell<T>>]>,
}

// SAFETY: 各スロットは所有CPUからのみ、割り込み禁止区間内でアクセスされる
// （`with_local` の契約）。異なるスロット間で共有は発生しない
unsafe impl<T: Send> Sync for PerCpu<T> {}
unsafe impl<T: Send> Send for PerCpu<T> {}

impl<T> PerCpu<T> {
    /// すべてのスロットを `init` で初期化
    pub fn new(mut init: impl FnMut(u32) -> T) -> Self {
        let slots: Vec<_> = (0..MAX_CPUS as u32)
            .map(|cpu| CacheLinePadded::new(UnsafeCell::new(init(cpu))))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    /// スロット数
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 自CPUのスロットを操作
    ///
    /// 範囲外のCPUは `None`。
    ///
    /// # Safety
    /// 呼び出し元は `cpu` 上で、割り込みを禁止した状態で実行していること。
    /// 同じスロットへの並行アクセスは存在してはならない。
    pub unsafe fn with_local<R>(&self, cpu: u32, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slot = self.slots.get(cpu as usize)?;
        // SAFETY: 呼び出し元の契約により、このスロットへの参照は他に存在しない
        Some(f(unsafe { &mut *slot.get() }))
    }
}
