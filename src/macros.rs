// ============================================================================
// src/macros.rs - ログ用マクロ
// ============================================================================

/// 発生箇所ごとに一度だけ警告を出力する
///
/// トポロジ解決の失敗など、CPUごとに繰り返し発生しうる警告に使用する。
#[macro_export]
macro_rules! warn_once {
    ($($arg:tt)*) => {{
        static WARNED: core::sync::atomic::AtomicBool =
            core::sync::atomic::AtomicBool::new(false);
        if !WARNED.swap(true, core::sync::atomic::Ordering::Relaxed) {
            $crate::__log::warn!($($arg)*);
        }
    }};
}

/// `verbose_logging` フィーチャー有効時のみ出力するトレース
macro_rules! verbose {
    ($($arg:tt)*) => {{
        if cfg!(feature = "verbose_logging") {
            log::debug!($($arg)*);
        }
    }};
}
