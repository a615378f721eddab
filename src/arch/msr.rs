// ============================================================================
// src/arch/msr.rs - MSR アクセス（レジスタチャネル）
// ============================================================================
//!
//! RDT の制御値・関連付けレジスタはすべて MSR で、
//! 書き込みは対象CPU上で行う必要がある（CPUローカルなレジスタのため）。
//! コアは [`MsrAccess`] 越しにのみハードウェアへ触れる。

use crate::error::{ResctrlError, ResctrlResult};

/// CLOSID/RMID 関連付けレジスタ
pub const MSR_IA32_PQR_ASSOC: u32 = 0xc8f;
/// L3 QoS 設定 (CDP有効化ビット)
pub const MSR_IA32_L3_QOS_CFG: u32 = 0xc81;
/// L2 QoS 設定 (CDP有効化ビット)
pub const MSR_IA32_L2_QOS_CFG: u32 = 0xc82;
/// L3 キャッシュビットマスクの先頭
pub const MSR_IA32_L3_CBM_BASE: u32 = 0xc90;
/// L2 キャッシュビットマスクの先頭
pub const MSR_IA32_L2_CBM_BASE: u32 = 0xd10;
/// Intel MBA 遅延値の先頭
pub const MSR_IA32_MBA_THRTL_BASE: u32 = 0xd50;
/// AMD MBA 帯域値の先頭
pub const MSR_IA32_MBA_BW_BASE: u32 = 0xc000_0200;
/// AMD SMBA 帯域値の先頭
pub const MSR_IA32_SMBA_BW_BASE: u32 = 0xc000_0280;

/// QOS_CFG の CDP 有効化ビット
pub const QOS_CFG_CDP_ENABLE: u64 = 1 << 0;

/// SNC 時の RMID 共有設定
pub const MSR_RMID_SNC_CONFIG: u32 = 0xca0;
/// セット時: RMID を L3 全体で共有 / クリア時: SNC ノードごとに分割
pub const RMID_SNC_CONFIG_SHARED: u64 = 1 << 0;

/// MSR 読み書きの抽象化
///
/// `cpu` は書き込みが実行されるべきCPU。ネイティブ実装は呼び出し元が
/// すでにそのCPU上で動作していることを前提とする。
pub trait MsrAccess: Send + Sync {
    /// MSR読み取り
    fn read(&self, cpu: u32, msr: u32) -> u64;

    /// MSR書き込み
    fn write(&self, cpu: u32, msr: u32, value: u64);

    /// #GP を捕捉するMSR書き込み
    ///
    /// 存在が保証されないレジスタ（クワーク検出用）に使う。
    fn write_safe(&self, cpu: u32, msr: u32, value: u64) -> ResctrlResult<()>;
}

/// 実機の RDMSR / WRMSR
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeMsr;

#[cfg(target_arch = "x86_64")]
impl MsrAccess for NativeMsr {
    fn read(&self, _cpu: u32, msr: u32) -> u64 {
        // SAFETY: RDT検出済みのレジスタのみ読み取る（カーネルモード前提）
        unsafe { x86_64::registers::model_specific::Msr::new(msr).read() }
    }

    fn write(&self, _cpu: u32, msr: u32, value: u64) {
        let mut reg = x86_64::registers::model_specific::Msr::new(msr);
        // SAFETY: RDT検出済みのレジスタのみ書き込む（カーネルモード前提）
        unsafe { reg.write(value) }
    }

    /// #GP を捕捉できないので書き込まずに失敗を返す
    ///
    /// 呼び出し側はレジスタが無いものとして扱う。
    fn write_safe(&self, _cpu: u32, msr: u32, _value: u64) -> ResctrlResult<()> {
        // TODO: #GP フィックスアップ表ができたら WRMSR を実行してフォールトを捕捉する
        Err(ResctrlError::MsrFault { msr })
    }
}

/// PQR_ASSOC に書き込む値 (下位32ビット: RMID, 上位32ビット: CLOSID)
#[inline]
pub const fn pqr_assoc_value(closid: u32, rmid: u32) -> u64 {
    ((closid as u64) << 32) | rmid as u64
}
