//! 統一エラーハンドリングモジュール
//!
//! resctrl 全体で使用されるエラー型を定義します。
//! ドメイン遷移中の失敗はすべて遷移境界で処理され、
//! ホットプラグハンドラの外へは伝播しません。

use alloc::collections::TryReserveError;
use core::fmt;

use crate::resource::{ResourceId, Scope};

/// resctrl の統一エラー型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResctrlError {
    /// 機能がハードウェアに存在しない（致命的ではない）
    Unsupported,
    /// 割り当て・監視のいずれのリソースも検出されなかった
    NoResources,
    /// CPUからドメインIDを解決できない
    TopologyUnresolved { cpu: u32, scope: Scope },
    /// 監視ドメインに必要なL3キャッシュ識別子が見つからない
    CacheInfoMissing { cpu: u32 },
    /// 制御値配列・カウンタ配列の確保に失敗
    AllocationFailure,
    /// プレゼンテーション層がオンライン遷移を拒否した
    NotificationFailure,
    /// オフライン対象のドメインがリストに存在しない
    ConfigInconsistency { resource: ResourceId, id: u32 },
    /// ホットプラグハンドラの登録に失敗
    Hotplug,
    /// 例外付きMSR書き込みが #GP を起こした
    MsrFault { msr: u32 },
    /// 無効な引数
    InvalidArgument,
}

impl fmt::Display for ResctrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResctrlError::Unsupported => write!(f, "not supported"),
            ResctrlError::NoResources => write!(f, "no allocation or monitoring resources"),
            ResctrlError::TopologyUnresolved { cpu, scope } => {
                write!(f, "can't find domain id for CPU:{} scope:{}", cpu, scope)
            }
            ResctrlError::CacheInfoMissing { cpu } => {
                write!(f, "can't find L3 cache for CPU:{}", cpu)
            }
            ResctrlError::AllocationFailure => write!(f, "out of memory"),
            ResctrlError::NotificationFailure => write!(f, "domain online rejected"),
            ResctrlError::ConfigInconsistency { resource, id } => {
                write!(f, "no domain id={} for resource {}", id, resource)
            }
            ResctrlError::Hotplug => write!(f, "hotplug state setup failed"),
            ResctrlError::MsrFault { msr } => write!(f, "MSR {:#x} write faulted", msr),
            ResctrlError::InvalidArgument => write!(f, "invalid argument"),
        }
    }
}

impl From<TryReserveError> for ResctrlError {
    fn from(_: TryReserveError) -> Self {
        ResctrlError::AllocationFailure
    }
}

/// resctrl の結果型エイリアス
pub type ResctrlResult<T> = Result<T, ResctrlError>;

// ===== Error extension trait =====

/// エラーに追加情報を付加するためのトレイト
pub trait ErrorContext<T> {
    /// エラーにコンテキスト情報を追加
    fn context(self, ctx: &'static str) -> Result<T, ContextualError>;
}

/// コンテキスト付きエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextualError {
    pub error: ResctrlError,
    pub context: &'static str,
}

impl<T, E: Into<ResctrlError>> ErrorContext<T> for Result<T, E> {
    fn context(self, ctx: &'static str) -> Result<T, ContextualError> {
        self.map_err(|e| ContextualError {
            error: e.into(),
            context: ctx,
        })
    }
}

impl fmt::Display for ContextualError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.context, self.error)
    }
}
