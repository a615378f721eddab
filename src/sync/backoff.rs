// ============================================================================
// src/sync/backoff.rs - 猶予期間待ちのバックオフとカウンタのパディング
// ============================================================================

/// spin_loop 回数の上限は 2^GP_SPIN_SHIFT_MAX
const GP_SPIN_SHIFT_MAX: u32 = 6;

/// 読み取り側カウンタが 0 になるのを待つ間の指数バックオフ
#[derive(Debug, Default)]
pub struct Backoff {
    shift: u32,
}

impl Backoff {
    #[inline]
    pub const fn new() -> Self {
        Self { shift: 0 }
    }

    /// 2^shift 回 spin_loop ヒントを出し、次回の回数を倍にする
    #[inline]
    pub fn snooze(&mut self) {
        for _ in 0..self.spins() {
            core::hint::spin_loop();
        }
        self.shift = (self.shift + 1).min(GP_SPIN_SHIFT_MAX);
    }

    #[inline]
    fn spins(&self) -> u32 {
        1 << self.shift
    }
}

/// 読み取り側カウンタを別々のキャッシュラインに置く
#[repr(C, align(64))]
pub struct CacheLinePadded<T> {
    value: T,
}

impl<T> CacheLinePadded<T> {
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> core::ops::Deref for CacheLinePadded<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.value
    }
}
