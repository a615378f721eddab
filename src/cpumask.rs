// ============================================================================
// src/cpumask.rs - CPUマスク
//
// ドメインのメンバーCPU集合。更新はドメイン変更ロック下でのみ行われ、
// 読み取り側はロックなしで参照するため各ワードはアトミック。
// ============================================================================

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// サポートする最大CPU数
pub const MAX_CPUS: usize = 256;

const WORDS: usize = MAX_CPUS / 64;

/// 固定長のCPUビットマップ
pub struct CpuMask {
    words: [AtomicU64; WORDS],
}

impl CpuMask {
    pub const fn new() -> Self {
        Self {
            words: [const { AtomicU64::new(0) }; WORDS],
        }
    }

    /// 1CPUだけを含むマスク
    pub fn single(cpu: u32) -> Self {
        let mask = Self::new();
        mask.set(cpu);
        mask
    }

    #[inline]
    fn locate(cpu: u32) -> Option<(usize, u64)> {
        let cpu = cpu as usize;
        (cpu < MAX_CPUS).then(|| (cpu / 64, 1u64 << (cpu % 64)))
    }

    /// CPUを追加。範囲外のCPUは無視して false を返す
    pub fn set(&self, cpu: u32) -> bool {
        match Self::locate(cpu) {
            Some((w, bit)) => {
                self.words[w].fetch_or(bit, Ordering::Release);
                true
            }
            None => false,
        }
    }

    /// CPUを除去
    pub fn clear(&self, cpu: u32) {
        if let Some((w, bit)) = Self::locate(cpu) {
            self.words[w].fetch_and(!bit, Ordering::Release);
        }
    }

    pub fn test(&self, cpu: u32) -> bool {
        Self::locate(cpu)
            .map(|(w, bit)| self.words[w].load(Ordering::Acquire) & bit != 0)
            .unwrap_or(false)
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| w.load(Ordering::Acquire) == 0)
    }

    /// メンバー数
    pub fn weight(&self) -> u32 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Acquire).count_ones())
            .sum()
    }

    /// 最小番号のメンバー
    pub fn first(&self) -> Option<u32> {
        self.iter().next()
    }

    /// メンバーを昇順に列挙
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(w, word)| {
            let mut bits = word.load(Ordering::Acquire);
            core::iter::from_fn(move || {
                if bits == 0 {
                    return None;
                }
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                Some((w * 64) as u32 + bit)
            })
        })
    }
}

impl Default for CpuMask {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CpuMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}
