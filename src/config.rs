// ============================================================================
// src/config.rs - 実行時設定
//
// カーネルコマンドラインの `rdt=` オプションから作る。
// 例: `rdt=!l3cat,mba` (L3 CAT を強制OFF、MBA を強制ON)
// ============================================================================

use alloc::string::String;

use crate::options::RdtOptions;

/// コマンドライン上のオプション名
pub const RDT_CMDLINE_KEY: &str = "rdt";

/// resctrl の設定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResctrlConfig {
    /// `rdt=` の値（カンマ区切りの機能名）
    pub rdt_options: String,
    /// 機能検出を行うブートCPU
    pub boot_cpu: u32,
}

impl ResctrlConfig {
    pub fn new(rdt_options: &str) -> Self {
        Self {
            rdt_options: String::from(rdt_options),
            boot_cpu: 0,
        }
    }

    /// カーネルコマンドライン全体から `rdt=` を探す
    ///
    /// 複数回指定された場合は連結する（後のものが追加で適用される）。
    pub fn from_cmdline(cmdline: &str) -> Self {
        let mut cfg = Self::default();
        for arg in cmdline.split_ascii_whitespace() {
            let Some(value) = arg.strip_prefix(RDT_CMDLINE_KEY) else {
                continue;
            };
            if !value.starts_with('=') {
                continue;
            }
            if !cfg.rdt_options.is_empty() {
                cfg.rdt_options.push(',');
            }
            cfg.rdt_options.push_str(value.trim_start_matches('='));
        }
        cfg
    }

    pub fn with_boot_cpu(mut self, cpu: u32) -> Self {
        self.boot_cpu = cpu;
        self
    }

    /// 上書き表に変換
    pub fn options(&self) -> RdtOptions {
        RdtOptions::parse(&self.rdt_options)
    }
}
