// ============================================================================
// src/arch/cpuid.rs - CPUID による RDT 機能検出
// ============================================================================
//!
//! # CPU機能検出
//!
//! RDT (Resource Director Technology) / AMD PQoS 関連の CPUID リーフを読み取り、
//! 生のハードウェア機能フラグ [`CpuFeatures`] と監視パラメータを抽出します。
//! `rdt=` オプションによる上書きはここでは適用しません（[`crate::options`] を参照）。

use bitflags::bitflags;

bitflags! {
    /// RDT 関連のハードウェア機能フラグ（上書き適用前の生の値）
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CpuFeatures: u32 {
        /// 割り当て機能の列挙 (CPUID.7.0:EBX[15])
        const RDT_A = 1 << 0;
        /// 監視機能の列挙 (CPUID.7.0:EBX[12])
        const CQM_LLC = 1 << 1;
        /// LLC占有量監視
        const CQM_OCCUP_LLC = 1 << 2;
        /// 総メモリ帯域監視
        const CQM_MBM_TOTAL = 1 << 3;
        /// ローカルメモリ帯域監視
        const CQM_MBM_LOCAL = 1 << 4;
        /// L3 キャッシュ割り当て
        const CAT_L3 = 1 << 5;
        /// L2 キャッシュ割り当て
        const CAT_L2 = 1 << 6;
        /// L3 コード/データ優先度
        const CDP_L3 = 1 << 7;
        /// L2 コード/データ優先度
        const CDP_L2 = 1 << 8;
        /// メモリ帯域割り当て
        const MBA = 1 << 9;
        /// 低速メモリ帯域割り当て (AMD)
        const SMBA = 1 << 10;
        /// 帯域監視イベント設定 (AMD)
        const BMEC = 1 << 11;
        /// スレッド単位のMBAスロットリング
        const PER_THREAD_MBA = 1 << 12;
    }
}

/// CPUID 命令の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// CPUID 命令の抽象化
///
/// 実機では [`NativeCpuid`]、テストではモックを使用する。
pub trait Cpuid: Send + Sync {
    /// `leaf` / `subleaf` を指定して CPUID を実行
    fn cpuid_count(&self, leaf: u32, subleaf: u32) -> CpuidResult;
}

/// 実機の CPUID 命令
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeCpuid;

#[cfg(target_arch = "x86_64")]
impl Cpuid for NativeCpuid {
    #[allow(unused_unsafe)]
    fn cpuid_count(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        // SAFETY: x86_64 では CPUID 命令は常に利用可能
        let r = unsafe { core::arch::x86_64::__cpuid_count(leaf, subleaf) };
        CpuidResult {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        }
    }
}

/// CPUベンダー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    Amd,
    Unknown,
}

impl Vendor {
    /// CPUID.0 のベンダー文字列 (EBX, EDX, ECX の順) から判定
    pub fn from_cpuid(leaf0: &CpuidResult) -> Self {
        let mut id = [0u8; 12];
        id[0..4].copy_from_slice(&leaf0.ebx.to_le_bytes());
        id[4..8].copy_from_slice(&leaf0.edx.to_le_bytes());
        id[8..12].copy_from_slice(&leaf0.ecx.to_le_bytes());
        match &id {
            b"GenuineIntel" => Vendor::Intel,
            b"AuthenticAMD" | b"HygonGenuine" => Vendor::Amd,
            _ => Vendor::Unknown,
        }
    }

    /// ベンダー文字列を CPUID.0 のレジスタ並びにエンコード
    pub fn to_cpuid_regs(self) -> (u32, u32, u32) {
        let id: &[u8; 12] = match self {
            Vendor::Intel => b"GenuineIntel",
            Vendor::Amd => b"AuthenticAMD",
            Vendor::Unknown => b"UnknownCPU!!",
        };
        let word = |i: usize| u32::from_le_bytes([id[i], id[i + 1], id[i + 2], id[i + 3]]);
        (word(0), word(4), word(8))
    }
}

/// Intel のファミリー6 モデル番号（クワーク対象）
pub mod intel_model {
    pub const HASWELL_X: u32 = 0x3F;
    pub const BROADWELL_X: u32 = 0x4F;
    pub const SKYLAKE_X: u32 = 0x55;
}

/// CPUシグネチャ (ベンダー / ファミリー / モデル / ステッピング)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSignature {
    pub vendor: Vendor,
    pub family: u32,
    pub model: u32,
    pub stepping: u32,
}

impl CpuSignature {
    /// CPUID.1:EAX からシグネチャをデコード
    pub fn decode(vendor: Vendor, eax: u32) -> Self {
        let base_family = (eax >> 8) & 0xf;
        let mut family = base_family;
        if base_family == 0xf {
            family += (eax >> 20) & 0xff;
        }
        let mut model = (eax >> 4) & 0xf;
        if base_family == 0x6 || base_family == 0xf {
            model |= ((eax >> 16) & 0xf) << 4;
        }
        Self {
            vendor,
            family,
            model,
            stepping: eax & 0xf,
        }
    }

    /// シグネチャを CPUID.1:EAX にエンコード（decode の逆）
    pub fn encode(&self) -> u32 {
        let (base_family, ext_family) = if self.family >= 0xf {
            (0xf, self.family - 0xf)
        } else {
            (self.family, 0)
        };
        (self.stepping & 0xf)
            | ((self.model & 0xf) << 4)
            | (base_family << 8)
            | (((self.model >> 4) & 0xf) << 16)
            | ((ext_family & 0xff) << 20)
    }

    /// Intel ファミリー6 の特定モデルか
    pub fn is_intel_model(&self, model: u32) -> bool {
        self.vendor == Vendor::Intel && self.family == 6 && self.model == model
    }
}

/// AMD が MBM カウンタ幅オフセットを報告しない場合の既定値
pub const MBM_CNTR_WIDTH_OFFSET_AMD: u32 = 20;

/// ブートCPUで検出した RDT 関連情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuInfo {
    pub signature: CpuSignature,
    pub features: CpuFeatures,
    /// 最大RMID (CPUID.F.1:ECX)。監視機能が無い場合は None
    pub cache_max_rmid: Option<u32>,
    /// 占有量カウンタのスケール (バイト/単位)
    pub cache_occ_scale: Option<u32>,
    /// MBM カウンタ幅のオフセット (24ビットからの追加分)
    pub mbm_width_offset: Option<u32>,
}

impl CpuInfo {
    /// CPUID を読み取って RDT 関連情報を検出
    pub fn detect(cpuid: &dyn Cpuid) -> Self {
        let leaf0 = cpuid.cpuid_count(0, 0);
        let max_leaf = leaf0.eax;
        let vendor = Vendor::from_cpuid(&leaf0);
        let max_ext_leaf = cpuid.cpuid_count(0x8000_0000, 0).eax;

        let signature = if max_leaf >= 1 {
            CpuSignature::decode(vendor, cpuid.cpuid_count(1, 0).eax)
        } else {
            CpuSignature::decode(vendor, 0)
        };

        let mut features = CpuFeatures::empty();

        if max_leaf >= 7 {
            let ebx = cpuid.cpuid_count(7, 0).ebx;
            features.set(CpuFeatures::CQM_LLC, ebx & (1 << 12) != 0);
            features.set(CpuFeatures::RDT_A, ebx & (1 << 15) != 0);
        }

        let mut info = CpuInfo {
            signature,
            features,
            cache_max_rmid: None,
            cache_occ_scale: None,
            mbm_width_offset: None,
        };

        if max_leaf >= 0xf && info.features.contains(CpuFeatures::CQM_LLC) {
            info.detect_monitoring(cpuid);
        }
        if max_leaf >= 0x10 {
            info.detect_allocation(cpuid);
        }
        if vendor == Vendor::Amd {
            if max_ext_leaf >= 0x8000_0008 {
                let ebx = cpuid.cpuid_count(0x8000_0008, 0).ebx;
                info.features.set(CpuFeatures::MBA, ebx & (1 << 6) != 0);
            }
            if max_ext_leaf >= 0x8000_0020 {
                let ebx = cpuid.cpuid_count(0x8000_0020, 0).ebx;
                info.features.set(CpuFeatures::SMBA, ebx & (1 << 2) != 0);
                info.features.set(CpuFeatures::BMEC, ebx & (1 << 3) != 0);
            }
        }

        info
    }

    /// CPUID.F: 監視機能 (CMT / MBM)
    fn detect_monitoring(&mut self, cpuid: &dyn Cpuid) {
        // 占有量監視が無くても後で上書きされない値として残る
        self.cache_max_rmid = Some(cpuid.cpuid_count(0xf, 0).ebx);

        let sub1 = cpuid.cpuid_count(0xf, 1);
        self.features.set(CpuFeatures::CQM_OCCUP_LLC, sub1.edx & (1 << 0) != 0);
        self.features.set(CpuFeatures::CQM_MBM_TOTAL, sub1.edx & (1 << 1) != 0);
        self.features.set(CpuFeatures::CQM_MBM_LOCAL, sub1.edx & (1 << 2) != 0);

        if self.features.intersects(
            CpuFeatures::CQM_OCCUP_LLC | CpuFeatures::CQM_MBM_TOTAL | CpuFeatures::CQM_MBM_LOCAL,
        ) {
            self.cache_max_rmid = Some(sub1.ecx);
            self.cache_occ_scale = Some(sub1.ebx);
            let mut offset = sub1.eax & 0xff;
            if self.signature.vendor == Vendor::Amd && offset == 0 {
                offset = MBM_CNTR_WIDTH_OFFSET_AMD;
            }
            self.mbm_width_offset = Some(offset);
        }
    }

    /// CPUID.10: 割り当て機能 (CAT / CDP / MBA)
    fn detect_allocation(&mut self, cpuid: &dyn Cpuid) {
        let ebx = cpuid.cpuid_count(0x10, 0).ebx;
        self.features.set(CpuFeatures::CAT_L3, ebx & (1 << 1) != 0);
        self.features.set(CpuFeatures::CAT_L2, ebx & (1 << 2) != 0);
        if self.signature.vendor != Vendor::Amd {
            self.features.set(CpuFeatures::MBA, ebx & (1 << 3) != 0);
        }

        if self.features.contains(CpuFeatures::CAT_L3) {
            let ecx = cpuid.cpuid_count(0x10, 1).ecx;
            self.features.set(CpuFeatures::CDP_L3, ecx & (1 << 2) != 0);
        }
        if self.features.contains(CpuFeatures::CAT_L2) {
            let ecx = cpuid.cpuid_count(0x10, 2).ecx;
            self.features.set(CpuFeatures::CDP_L2, ecx & (1 << 2) != 0);
        }
        if self.features.contains(CpuFeatures::MBA) {
            let ecx = cpuid.cpuid_count(0x10, 3).ecx;
            self.features.set(CpuFeatures::PER_THREAD_MBA, ecx & (1 << 0) != 0);
        }
    }
}
