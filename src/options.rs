// ============================================================================
// src/options.rs - `rdt=` ブートオプションによる機能の強制ON/OFF
//
// 書式: カンマ区切りの機能名。`!name` で強制OFF、`name` で強制ON。
// 未知の名前は無視する。強制ONはハードウェアに無い機能を作り出せない。
// 強制OFFと強制ONの両方が指定された場合は OFF が優先される。
// ============================================================================

use crate::arch::CpuFeatures;
use crate::resource::mon::MonEvent;

/// 上書き可能な機能
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdtFlag {
    Cmt,
    MbmTotal,
    MbmLocal,
    L3Cat,
    L3Cdp,
    L2Cat,
    L2Cdp,
    Mba,
    Smba,
    Bmec,
}

impl RdtFlag {
    pub const ALL: [RdtFlag; 10] = [
        RdtFlag::Cmt,
        RdtFlag::MbmTotal,
        RdtFlag::MbmLocal,
        RdtFlag::L3Cat,
        RdtFlag::L3Cdp,
        RdtFlag::L2Cat,
        RdtFlag::L2Cdp,
        RdtFlag::Mba,
        RdtFlag::Smba,
        RdtFlag::Bmec,
    ];

    /// オプション名
    pub const fn name(self) -> &'static str {
        match self {
            RdtFlag::Cmt => "cmt",
            RdtFlag::MbmTotal => "mbmtotal",
            RdtFlag::MbmLocal => "mbmlocal",
            RdtFlag::L3Cat => "l3cat",
            RdtFlag::L3Cdp => "l3cdp",
            RdtFlag::L2Cat => "l2cat",
            RdtFlag::L2Cdp => "l2cdp",
            RdtFlag::Mba => "mba",
            RdtFlag::Smba => "smba",
            RdtFlag::Bmec => "bmec",
        }
    }

    /// 対応するハードウェア機能フラグ
    pub const fn feature(self) -> CpuFeatures {
        match self {
            RdtFlag::Cmt => CpuFeatures::CQM_OCCUP_LLC,
            RdtFlag::MbmTotal => CpuFeatures::CQM_MBM_TOTAL,
            RdtFlag::MbmLocal => CpuFeatures::CQM_MBM_LOCAL,
            RdtFlag::L3Cat => CpuFeatures::CAT_L3,
            RdtFlag::L3Cdp => CpuFeatures::CDP_L3,
            RdtFlag::L2Cat => CpuFeatures::CAT_L2,
            RdtFlag::L2Cdp => CpuFeatures::CDP_L2,
            RdtFlag::Mba => CpuFeatures::MBA,
            RdtFlag::Smba => CpuFeatures::SMBA,
            RdtFlag::Bmec => CpuFeatures::BMEC,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.name() == name)
    }

    /// 機能フラグに対応するオプション（上書き対象外の機能は None）
    pub fn for_feature(feature: CpuFeatures) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.feature() == feature)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// 1機能ぶんの上書き状態
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdtOption {
    pub force_off: bool,
    pub force_on: bool,
}

/// 上書き表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RdtOptions {
    options: [RdtOption; RdtFlag::ALL.len()],
}

impl RdtOptions {
    pub const fn new() -> Self {
        Self {
            options: [RdtOption {
                force_off: false,
                force_on: false,
            }; RdtFlag::ALL.len()],
        }
    }

    /// オプション文字列を解析して新しい表を作る
    pub fn parse(s: &str) -> Self {
        let mut opts = Self::new();
        opts.apply(s);
        opts
    }

    /// オプション文字列を既存の表に追加適用する
    ///
    /// クワーク処理がユーザー指定の後から強制OFFを追加するのに使う。
    pub fn apply(&mut self, s: &str) {
        let s = s.strip_prefix('=').unwrap_or(s);
        for tok in s.split(',') {
            let tok = tok.trim();
            let (force_off, name) = match tok.strip_prefix('!') {
                Some(name) => (true, name),
                None => (false, tok),
            };
            let Some(flag) = RdtFlag::from_name(name) else {
                if !name.is_empty() {
                    verbose!("rdt: ignoring unknown option '{}'", name);
                }
                continue;
            };
            let opt = &mut self.options[flag.index()];
            if force_off {
                opt.force_off = true;
            } else {
                opt.force_on = true;
            }
        }
    }

    pub fn get(&self, flag: RdtFlag) -> RdtOption {
        self.options[flag.index()]
    }

    pub fn is_forced_off(&self, flag: RdtFlag) -> bool {
        self.get(flag).force_off
    }

    pub fn is_forced_on(&self, flag: RdtFlag) -> bool {
        self.get(flag).force_on
    }
}

/// 生のハードウェア機能 + 上書き表
///
/// 機能チェックはすべてここを経由する。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    raw: CpuFeatures,
    options: RdtOptions,
}

impl Capabilities {
    pub fn new(raw: CpuFeatures, options: RdtOptions) -> Self {
        Self { raw, options }
    }

    /// 上書きを考慮しない生の機能
    pub fn boot_cpu_has(&self, feature: CpuFeatures) -> bool {
        self.raw.contains(feature)
    }

    /// 上書きを考慮した機能の有無
    ///
    /// 生の値が false なら false。強制OFFなら false。それ以外は true。
    pub fn has_feature(&self, feature: CpuFeatures) -> bool {
        if !self.boot_cpu_has(feature) {
            return false;
        }
        let Some(flag) = RdtFlag::for_feature(feature) else {
            return true;
        };
        // 生の値が true なので、強制ONの有無は結果に影響しない
        !self.options.is_forced_off(flag)
    }

    /// MBM イベントの設定変更 (BMEC) が可能か
    pub fn is_evt_configurable(&self, evt: MonEvent) -> bool {
        let evt_feature = match evt {
            MonEvent::MbmTotal => CpuFeatures::CQM_MBM_TOTAL,
            MonEvent::MbmLocal => CpuFeatures::CQM_MBM_LOCAL,
            MonEvent::LlcOccupancy => return false,
        };
        self.has_feature(CpuFeatures::BMEC) && self.has_feature(evt_feature)
    }

    /// 強制OFFを追加（クワーク用）
    pub fn force_off(&mut self, names: &str) {
        let mut s = alloc::string::String::new();
        for name in names.split(',') {
            if !s.is_empty() {
                s.push(',');
            }
            s.push('!');
            s.push_str(name.trim());
        }
        self.options.apply(&s);
    }

    pub fn options(&self) -> &RdtOptions {
        &self.options
    }

    pub fn raw(&self) -> CpuFeatures {
        self.raw
    }
}
