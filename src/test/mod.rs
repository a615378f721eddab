// ============================================================================
// src/test/mod.rs - テスト支援
// ホスト上でライフサイクル全体を動かすためのモックハードウェア
// ============================================================================

pub mod mock;

pub use mock::{
    FsEvent, MockCpuid, MockCrossCall, MockHotplug, MockIrq, MockMsr, MockPlatform, RecordingFs,
};
