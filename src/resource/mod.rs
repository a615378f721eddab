// ============================================================================
// src/resource/mod.rs - リソース記述子
//
// リソースの種類ごと (L3 / L2 / MB / SMBA) に1つ。ブート時の機能検出でのみ
// 書き換えられ、その後は読み取り専用（CDP有効フラグのみドメイン変更ロック下で
// 切り替わる）。
// ============================================================================

pub mod mon;
pub mod probe;
pub mod vendor;

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::msr::{MSR_IA32_L2_CBM_BASE, MSR_IA32_L3_CBM_BASE};
use crate::arch::{CpuSignature, Vendor};
use crate::domain::registry::DomainList;
use crate::domain::{CtrlDomain, MonDomain};
use crate::options::Capabilities;
use crate::sync::Rcu;

pub use mon::{MonConfig, MonEvent, MonFeatures};
pub use probe::{apply_snc, probe};
pub use vendor::{CtrlWriter, VendorOps};

/// リソースの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ResourceId {
    L3,
    L2,
    Mba,
    Smba,
}

impl ResourceId {
    pub const ALL: [ResourceId; 4] = [ResourceId::L3, ResourceId::L2, ResourceId::Mba, ResourceId::Smba];

    /// プレゼンテーション層に見せる名前
    pub const fn name(self) -> &'static str {
        match self {
            ResourceId::L3 => "L3",
            ResourceId::L2 => "L2",
            ResourceId::Mba => "MB",
            ResourceId::Smba => "SMBA",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// ドメインをまとめるトポロジの単位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    L2Cache,
    L3Cache,
    L3Node,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scope::L2Cache => "L2 cache",
            Scope::L3Cache => "L3 cache",
            Scope::L3Node => "L3 node",
        })
    }
}

/// スキーマの形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    /// キャッシュウェイのビットマスク
    Bitmap,
    /// 帯域の値域
    Range,
}

/// 帯域スロットリングの単位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThrottleMode {
    #[default]
    Undefined,
    /// コア内スレッドの最大値で制限
    Max,
    /// スレッド単位
    PerThread,
}

/// キャッシュ割り当てのパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheProps {
    /// ビットマスク長
    pub cbm_len: u32,
    /// マスクに必要な最小ビット数
    pub min_cbm_bits: u32,
    /// 他エージェントと共有されるビット
    pub shareable_bits: u32,
    /// 非連続なマスクを許すか
    pub arch_has_sparse_bitmasks: bool,
    /// CDP 設定がCPUごとか
    pub arch_has_per_cpu_cfg: bool,
}

/// 帯域割り当てのパラメータ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MembwProps {
    pub max_bw: u32,
    pub min_bw: u32,
    pub bw_gran: u32,
    /// 遅延値が帯域に線形に対応するか
    pub delay_linear: bool,
    /// 線形でない値をプレゼンテーション層が扱えないか
    pub arch_needs_linear: bool,
    pub throttle_mode: ThrottleMode,
}

/// リソース記述子
pub struct Resource {
    pub rid: ResourceId,
    pub ctrl_scope: Scope,
    /// 監視ドメインの単位（監視をサポートするリソースのみ）
    pub mon_scope: Option<Scope>,
    pub alloc_capable: bool,
    pub mon_capable: bool,
    pub schema_fmt: SchemaFormat,
    pub cache: CacheProps,
    pub membw: MembwProps,
    /// ハードウェアの CLOSID 数（制御値配列の長さ）
    pub num_closid: u32,
    /// RMID 数（監視リソースのみ）
    pub num_rmid: u32,
    pub cdp_capable: bool,
    cdp_enabled: AtomicBool,
    /// 制御値レジスタの先頭
    pub msr_base: u32,
    /// 制御値をレジスタへ書き込む戦略
    pub writer: Option<&'static dyn CtrlWriter>,
    pub ctrl_domains: DomainList<CtrlDomain>,
    pub mon_domains: DomainList<MonDomain>,
}

impl Resource {
    fn new(
        rid: ResourceId,
        ctrl_scope: Scope,
        mon_scope: Option<Scope>,
        schema_fmt: SchemaFormat,
        msr_base: u32,
        writer: Option<&'static dyn CtrlWriter>,
        rcu: &Arc<Rcu>,
    ) -> Self {
        Self {
            rid,
            ctrl_scope,
            mon_scope,
            alloc_capable: false,
            mon_capable: false,
            schema_fmt,
            cache: CacheProps::default(),
            membw: MembwProps::default(),
            num_closid: 0,
            num_rmid: 0,
            cdp_capable: false,
            cdp_enabled: AtomicBool::new(false),
            msr_base,
            writer,
            ctrl_domains: DomainList::new(rcu.clone()),
            mon_domains: DomainList::new(rcu.clone()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.rid.name()
    }

    /// 割り当て・監視のどちらかが可能か
    pub fn is_capable(&self) -> bool {
        self.alloc_capable || self.mon_capable
    }

    /// 「制御なし」を表す制御値
    ///
    /// ビットマスクは全ビット、帯域は最大値。
    pub fn default_ctrl(&self) -> u32 {
        match self.schema_fmt {
            SchemaFormat::Bitmap => {
                let len = self.cache.cbm_len.min(32);
                ((1u64 << len) - 1) as u32
            }
            SchemaFormat::Range => self.membw.max_bw,
        }
    }

    pub fn cdp_enabled(&self) -> bool {
        self.cdp_enabled.load(Ordering::Acquire)
    }

    /// ドメイン変更ロック下でのみ呼ぶ
    pub(crate) fn set_cdp_flag(&self, enable: bool) {
        self.cdp_enabled.store(enable, Ordering::Release);
    }

    /// プレゼンテーション層が使える CLOSID 数
    ///
    /// CDP 有効時はコード/データで2つずつ消費するため半分になる。
    pub fn num_closid_usable(&self) -> u32 {
        if self.cdp_enabled() {
            self.num_closid / 2
        } else {
            self.num_closid
        }
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("name", &self.name())
            .field("alloc_capable", &self.alloc_capable)
            .field("mon_capable", &self.mon_capable)
            .field("num_closid", &self.num_closid)
            .field("cdp_enabled", &self.cdp_enabled())
            .finish_non_exhaustive()
    }
}

/// 全リソースの表（ブート時の検出結果）
pub struct ResourceTable {
    resources: [Resource; 4],
    pub signature: CpuSignature,
    pub caps: Capabilities,
    pub mon: MonConfig,
    pub alloc_capable: bool,
    pub mon_capable: bool,
}

impl ResourceTable {
    /// ベンダー既定値を適用する前の表
    pub fn new(signature: CpuSignature, caps: Capabilities, rcu: &Arc<Rcu>) -> Self {
        use vendor::CAT_WRITER;

        let resources = [
            Resource::new(
                ResourceId::L3,
                Scope::L3Cache,
                Some(Scope::L3Cache),
                SchemaFormat::Bitmap,
                MSR_IA32_L3_CBM_BASE,
                Some(&CAT_WRITER),
                rcu,
            ),
            Resource::new(
                ResourceId::L2,
                Scope::L2Cache,
                None,
                SchemaFormat::Bitmap,
                MSR_IA32_L2_CBM_BASE,
                Some(&CAT_WRITER),
                rcu,
            ),
            Resource::new(ResourceId::Mba, Scope::L3Cache, None, SchemaFormat::Range, 0, None, rcu),
            Resource::new(ResourceId::Smba, Scope::L3Cache, None, SchemaFormat::Range, 0, None, rcu),
        ];
        Self {
            resources,
            signature,
            caps,
            mon: MonConfig::default(),
            alloc_capable: false,
            mon_capable: false,
        }
    }

    pub fn vendor(&self) -> Vendor {
        self.signature.vendor
    }

    pub fn get(&self, rid: ResourceId) -> &Resource {
        &self.resources[rid.index()]
    }

    pub(crate) fn get_mut(&mut self, rid: ResourceId) -> &mut Resource {
        &mut self.resources[rid.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Resource> {
        self.resources.iter_mut()
    }

    /// 割り当て・監視のどちらかが可能なリソース
    pub fn capable(&self) -> impl Iterator<Item = &Resource> {
        self.iter().filter(|r| r.is_capable())
    }

    pub fn alloc_capable_resources(&self) -> impl Iterator<Item = &Resource> {
        self.iter().filter(|r| r.alloc_capable)
    }

    pub fn mon_capable_resources(&self) -> impl Iterator<Item = &Resource> {
        self.iter().filter(|r| r.mon_capable)
    }
}
