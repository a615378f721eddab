// ============================================================================
// src/resource/mon.rs - 監視 (CMT / MBM) の設定
// ============================================================================

use bitflags::bitflags;
use core::fmt;

/// MBM カウンタの基本幅（ビット）
pub const MBM_CNTR_WIDTH_BASE: u32 = 24;

/// 監視イベント
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonEvent {
    /// L3 占有量
    LlcOccupancy,
    /// 総メモリ帯域
    MbmTotal,
    /// ローカルメモリ帯域
    MbmLocal,
}

impl MonEvent {
    pub const fn name(self) -> &'static str {
        match self {
            MonEvent::LlcOccupancy => "llc_occupancy",
            MonEvent::MbmTotal => "mbm_total_bytes",
            MonEvent::MbmLocal => "mbm_local_bytes",
        }
    }

    pub const fn flag(self) -> MonFeatures {
        match self {
            MonEvent::LlcOccupancy => MonFeatures::LLC_OCCUPANCY,
            MonEvent::MbmTotal => MonFeatures::MBM_TOTAL,
            MonEvent::MbmLocal => MonFeatures::MBM_LOCAL,
        }
    }
}

impl fmt::Display for MonEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// 有効な監視イベント
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MonFeatures: u8 {
        const LLC_OCCUPANCY = 1 << 0;
        const MBM_TOTAL = 1 << 1;
        const MBM_LOCAL = 1 << 2;
    }
}

/// L3 監視の設定（ブート時に確定）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MonConfig {
    /// RMID 数（カウンタ配列の長さ）
    pub num_rmid: u32,
    /// 占有量カウンタのスケール (バイト/単位)
    pub occupancy_scale: u32,
    /// MBM カウンタ幅（ビット）
    pub mbm_width: u32,
    /// 有効なイベント
    pub features: MonFeatures,
    /// MBM カウンタ補正が必要なモデル (Broadwell-X / Skylake-X)
    pub mbm_correction_quirk: bool,
    /// 1つの L3 を分け合う SNC ノード数（0 と 1 は SNC なし）
    pub snc_nodes_per_l3: u32,
}

impl MonConfig {
    pub fn is_enabled(&self, evt: MonEvent) -> bool {
        self.features.contains(evt.flag())
    }

    pub fn is_mbm_total_enabled(&self) -> bool {
        self.is_enabled(MonEvent::MbmTotal)
    }

    pub fn is_mbm_local_enabled(&self) -> bool {
        self.is_enabled(MonEvent::MbmLocal)
    }

    pub fn snc_enabled(&self) -> bool {
        self.snc_nodes_per_l3 > 1
    }

    /// 有効なイベントを列挙
    pub fn events(&self) -> impl Iterator<Item = MonEvent> + '_ {
        [MonEvent::LlcOccupancy, MonEvent::MbmTotal, MonEvent::MbmLocal]
            .into_iter()
            .filter(|evt| self.is_enabled(*evt))
    }
}
