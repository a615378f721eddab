// ============================================================================
// src/sync/rcu.rs - 読み取り側ロックフリーな遅延解放 (RCU)
// ============================================================================
//!
//! # RCU (Read-Copy-Update)
//!
//! 読み取り側はロックを取らずに [`RcuReadGuard`] の区間内で共有データを参照し、
//! 更新側は新しいバージョンを公開してから [`Rcu::synchronize`] で
//! 「公開前に読み始めた読み取り側がすべて抜けた」ことを待ってから旧バージョンを解放する。
//!
//! ## 猶予期間の検出
//! 読み取り側カウンタを2面持ち、`synchronize` はフェーズを2回反転させて
//! それぞれ旧フェーズのカウンタが0になるまで待つ。1回目の反転直前に
//! フェーズを読んだ読み取り側も、2回目の待機で捕捉される。
//!
//! 更新側同士の排他は呼び出し元の責任（ドメインリストではドメイン変更ロック）。

use alloc::boxed::Box;
use core::marker::PhantomData;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};
use spin::Mutex;

use super::backoff::{Backoff, CacheLinePadded};

/// RCU ドメイン
pub struct Rcu {
    /// 現在の読み取りフェーズ（下位1ビットがカウンタのインデックス）
    phase: AtomicUsize,
    /// フェーズごとの読み取り中カウンタ
    readers: [CacheLinePadded<AtomicUsize>; 2],
    /// 猶予期間の検出を直列化
    gp_lock: Mutex<()>,
    /// 完了した猶予期間の数
    completed: AtomicU64,
}

impl Rcu {
    pub const fn new() -> Self {
        Self {
            phase: AtomicUsize::new(0),
            readers: [
                CacheLinePadded::new(AtomicUsize::new(0)),
                CacheLinePadded::new(AtomicUsize::new(0)),
            ],
            gp_lock: Mutex::new(()),
            completed: AtomicU64::new(0),
        }
    }

    /// 読み取り側クリティカルセクションを開始
    ///
    /// ネスト可能。ガードを保持したまま同じ `Rcu` の `synchronize` を呼ぶとデッドロックする。
    #[inline]
    pub fn read_lock(&self) -> RcuReadGuard<'_> {
        let idx = self.phase.load(Ordering::SeqCst) & 1;
        self.readers[idx].fetch_add(1, Ordering::SeqCst);
        RcuReadGuard { rcu: self, idx }
    }

    /// 猶予期間の終了を待つ
    ///
    /// 戻った時点で、呼び出し前に開始したすべての読み取り側区間が終了している。
    pub fn synchronize(&self) {
        let _gp = self.gp_lock.lock();
        for _ in 0..2 {
            let old = self.phase.fetch_add(1, Ordering::SeqCst) & 1;
            let mut backoff = Backoff::new();
            while self.readers[old].load(Ordering::SeqCst) != 0 {
                backoff.snooze();
            }
        }
        self.completed.fetch_add(1, Ordering::Release);
    }

    /// 完了した猶予期間の数
    pub fn grace_periods(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// 現在読み取り区間内にいる読み取り側の数（デバッグ用）
    pub fn active_readers(&self) -> usize {
        self.readers[0].load(Ordering::SeqCst) + self.readers[1].load(Ordering::SeqCst)
    }
}

impl Default for Rcu {
    fn default() -> Self {
        Self::new()
    }
}

/// 読み取り側クリティカルセクションのガード
///
/// ドロップで区間が終了する。
pub struct RcuReadGuard<'a> {
    rcu: &'a Rcu,
    idx: usize,
}

impl RcuReadGuard<'_> {
    /// このガードが `rcu` のものか
    pub fn is_for(&self, rcu: &Rcu) -> bool {
        core::ptr::eq(self.rcu, rcu)
    }
}

impl Drop for RcuReadGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        self.rcu.readers[self.idx].fetch_sub(1, Ordering::SeqCst);
    }
}

/// RCU で公開されるポインタ
///
/// 読み取り側は常に完全に初期化済みの値だけを観測する
/// （値を構築してからポインタを公開するため）。
pub struct RcuPtr<T> {
    ptr: AtomicPtr<T>,
    _marker: PhantomData<Box<T>>,
}

// SAFETY: 値は複数スレッドから共有参照され (Sync)、
// 解放は任意のスレッドで行われる (Send)
unsafe impl<T: Send + Sync> Send for RcuPtr<T> {}
unsafe impl<T: Send + Sync> Sync for RcuPtr<T> {}

impl<T> RcuPtr<T> {
    pub fn new(value: T) -> Self {
        Self {
            ptr: AtomicPtr::new(Box::into_raw(Box::new(value))),
            _marker: PhantomData,
        }
    }

    /// 読み取り区間内で現在の値を参照
    #[inline]
    pub fn load<'g>(&'g self, guard: &'g RcuReadGuard<'_>) -> &'g T {
        let _ = guard;
        // SAFETY: ガードが生きている間は公開済みの値は解放されない
        unsafe { self.load_unchecked() }
    }

    /// ガードなしで現在の値を参照
    ///
    /// # Safety
    /// 呼び出し元は (a) 返した参照の寿命を読み取りガードの内側に収めるか、
    /// (b) 更新側の排他を保持していること（更新側以外は旧値を解放しない）
    #[inline]
    pub unsafe fn load_unchecked(&self) -> &T {
        // SAFETY: ポインタは常に Box 由来の有効な値を指す
        unsafe { &*self.ptr.load(Ordering::SeqCst) }
    }

    /// 新しい値を公開し、旧い値を退避する
    ///
    /// 旧い値は [`Retired`] のドロップ時、猶予期間の後に解放される。
    pub fn replace<'r>(&self, rcu: &'r Rcu, value: T) -> Retired<'r, T> {
        let new = Box::into_raw(Box::new(value));
        let old = self.ptr.swap(new, Ordering::SeqCst);
        Retired {
            rcu,
            // Box::into_raw は null を返さない
            ptr: NonNull::new(old),
        }
    }
}

impl<T> Drop for RcuPtr<T> {
    fn drop(&mut self) {
        let ptr = *self.ptr.get_mut();
        // SAFETY: &mut self なので読み取り側は存在しない
        unsafe { drop(Box::from_raw(ptr)) };
    }
}

/// 公開を取り下げられ、猶予期間後の解放を待つ値
#[must_use = "退避した値はドロップ時に猶予期間を待つ"]
pub struct Retired<'r, T> {
    rcu: &'r Rcu,
    ptr: Option<NonNull<T>>,
}

impl<T> Retired<'_, T> {
    /// 猶予期間を待って解放する
    pub fn reclaim(self) {
        drop(self);
    }
}

impl<T> Drop for Retired<'_, T> {
    fn drop(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            self.rcu.synchronize();
            // SAFETY: 公開は取り下げ済みで、猶予期間が過ぎたので参照する読み取り側はいない
            unsafe { drop(Box::from_raw(ptr.as_ptr())) };
        }
    }
}
