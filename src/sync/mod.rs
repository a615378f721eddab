// ============================================================================
// src/sync/mod.rs - 同期プリミティブ
// 読み取り側ロックフリーな遅延解放 (RCU) とスピン待機の補助
// ============================================================================

pub mod backoff;
pub mod rcu;

pub use backoff::{Backoff, CacheLinePadded};
pub use rcu::{Rcu, RcuPtr, RcuReadGuard, Retired};
