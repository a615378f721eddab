//! Resource Director ドメイン管理 (resctrl) for ExoRust Kernel
//!
//! キャッシュ割り当て (CAT)・メモリ帯域割り当て (MBA/SMBA)・使用量監視 (CMT/MBM)
//! のハードウェアドメインを、CPUトポロジ（キャッシュ共有グループ・NUMAノード）に
//! 追従させて管理します。
//!
//! ## 構成
//! - [`resource::probe`]: ブート時の機能検出（ベンダー別）
//! - [`options`]: `rdt=` ブートオプションによる機能の強制ON/OFF
//! - [`domain::registry`]: RCUで保護されたドメインリスト
//! - [`domain::lifecycle`]: CPUのオンライン/オフラインに伴うドメインの生成・破棄
//! - [`pqr`]: CPUごとのCLOSID/RMID関連付け状態のリセット
//! - [`resctrl`]: 上記をまとめるコンテキストとブート/終了エントリポイント
//!
//! ハードウェアアクセスはすべて [`platform`] と [`arch`] のトレイト越しに行うため、
//! ホスト上では [`test::mock`] のモックハードウェアで全ライフサイクルを検証できます。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[doc(hidden)]
pub use log as __log;

#[macro_use]
mod macros;

pub mod arch;
pub mod config;
pub mod cpumask;
pub mod domain;
pub mod error;
pub mod options;
pub mod percpu;
pub mod platform;
pub mod pqr;
pub mod resctrl;
pub mod resource;
pub mod sync;
pub mod test;

pub use config::ResctrlConfig;
pub use domain::{CtrlDomain, DomainStats, MonDomain};
pub use error::{ResctrlError, ResctrlResult};
pub use platform::Platform;
pub use resctrl::Resctrl;
pub use resource::{Resource, ResourceId, Scope};
