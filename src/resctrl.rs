// ============================================================================
// src/resctrl.rs - resctrl コンテキスト
//
// ブート時の機能検出結果、ドメイン変更ロック、CPUごとの関連付け状態、
// コラボレータを1つにまとめる。ホットプラグハンドラとして登録され、
// CPUのオンライン/オフラインでドメインを更新する。
//
// オンライン:  ロック → 各リソースのドメインに参加 → アンロック
//              → 関連付けリセット → プレゼンテーション層へ通知
// オフライン:  プレゼンテーション層へ通知 → ロック → 各リソースのドメインから離脱
//              → アンロック → 関連付けリセット
// ============================================================================

use alloc::sync::Arc;
use spin::Mutex;

use crate::config::ResctrlConfig;
use crate::cpumask::MAX_CPUS;
use crate::domain::lifecycle::{DomainCtx, domain_add_cpu, domain_remove_cpu, reconfigure_cdp};
use crate::domain::registry::DomainListLock;
use crate::domain::{Domain, DomainCounters, DomainStats, PseudoLockRegion};
use crate::error::{ErrorContext, ResctrlError, ResctrlResult};
use crate::platform::{CpuHotplugHandler, HotplugState, Platform};
use crate::pqr::{PqrState, PqrStates};
use crate::resource::{Resource, ResourceId, ResourceTable, SchemaFormat, apply_snc, probe};
use crate::sync::Rcu;

/// ホットプラグハンドラの登録名
pub const HOTPLUG_NAME: &str = "x86/resctrl/cat:online:";

/// resctrl のコンテキスト
pub struct Resctrl {
    table: ResourceTable,
    rcu: Arc<Rcu>,
    domain_lock: DomainListLock,
    pqr: PqrStates,
    platform: Platform,
    counters: Arc<DomainCounters>,
    hotplug_state: Mutex<Option<HotplugState>>,
}

impl Resctrl {
    /// 機能を検出し、ホットプラグハンドラとプレゼンテーション層を初期化する
    ///
    /// 割り当て・監視のどちらも使えなければ [`ResctrlError::NoResources`]。
    pub fn init(config: &ResctrlConfig, platform: Platform) -> ResctrlResult<Arc<Self>> {
        let rcu = Arc::new(Rcu::new());
        let mut table = probe(
            &*platform.cpuid,
            &*platform.msr,
            config.boot_cpu,
            config.options(),
            &rcu,
        );
        apply_snc(&mut table, platform.topology.snc_nodes_per_l3());

        if !table.alloc_capable && !table.mon_capable {
            log::info!("resctrl: no allocation or monitoring resources");
            return Err(ResctrlError::NoResources);
        }

        let this = Arc::new(Self {
            table,
            rcu,
            domain_lock: DomainListLock::new(),
            pqr: PqrStates::new(),
            platform,
            counters: Arc::new(DomainCounters::new()),
            hotplug_state: Mutex::new(None),
        });

        let handler: Arc<dyn CpuHotplugHandler> = this.clone();
        let state = this
            .platform
            .hotplug
            .setup_state(HOTPLUG_NAME, handler)
            .context("resctrl: hotplug setup")
            .map_err(|e| {
                log::error!("{}", e);
                ResctrlError::Hotplug
            })?;

        if let Err(e) = this.platform.fs.init().context("resctrl: filesystem init") {
            log::error!("{}", e);
            this.platform.hotplug.remove_state(state);
            return Err(e.error);
        }
        *this.hotplug_state.lock() = Some(state);

        for r in this.table.alloc_capable_resources() {
            log::info!("{} allocation detected", r.name());
        }
        for r in this.table.mon_capable_resources() {
            log::info!("{} monitoring detected", r.name());
        }

        Ok(this)
    }

    /// ハンドラの登録を解除し、プレゼンテーション層を終了する
    pub fn shutdown(&self) {
        let state = self.hotplug_state.lock().take();
        if let Some(state) = state {
            self.platform.hotplug.remove_state(state);
            self.platform.fs.exit();
        }
    }

    fn ctx(&self) -> DomainCtx<'_> {
        DomainCtx {
            msr: &*self.platform.msr,
            topology: &*self.platform.topology,
            fs: &*self.platform.fs,
            mon: &self.table.mon,
            counters: &self.counters,
        }
    }

    /// CPUのオンライン（そのCPU上で呼ばれる）
    pub fn online_cpu(&self, cpu: u32) {
        if cpu as usize >= MAX_CPUS {
            log::warn!("resctrl: CPU {} beyond MAX_CPUS, ignored", cpu);
            return;
        }

        {
            let guard = self.domain_lock.lock();
            let ctx = self.ctx();
            for r in self.table.capable() {
                let _ = domain_add_cpu(cpu, r, &ctx, &guard);
            }
        }

        self.pqr
            .clear_closid_rmid(cpu, &*self.platform.irq, &*self.platform.msr);
        self.platform.fs.online_cpu(cpu);
        verbose!("resctrl: CPU {} online", cpu);
    }

    /// CPUのオフライン（そのCPU上で呼ばれる）
    pub fn offline_cpu(&self, cpu: u32) {
        if cpu as usize >= MAX_CPUS {
            return;
        }

        self.platform.fs.offline_cpu(cpu);

        {
            let guard = self.domain_lock.lock();
            let ctx = self.ctx();
            for r in self.table.capable() {
                let _ = domain_remove_cpu(cpu, r, &ctx, &guard);
            }
        }

        self.pqr
            .clear_closid_rmid(cpu, &*self.platform.irq, &*self.platform.msr);
        verbose!("resctrl: CPU {} offline", cpu);
    }

    /// `cpu` の関連付け状態
    ///
    /// # Safety
    /// `cpu` 自身の上で呼ぶか、`cpu` のオンライン/オフライン処理と並行しないこと。
    pub unsafe fn pqr_state(&self, cpu: u32) -> Option<PqrState> {
        // SAFETY: 呼び出し元の契約
        unsafe { self.pqr.read(cpu, &*self.platform.irq) }
    }

    pub fn resources(&self) -> &ResourceTable {
        &self.table
    }

    pub fn resource(&self, rid: ResourceId) -> &Resource {
        self.table.get(rid)
    }

    /// 生存しているドメインと配列の数
    pub fn domain_stats(&self) -> DomainStats {
        self.counters.snapshot()
    }

    /// 配列確保の故障注入
    pub fn domain_counters(&self) -> &DomainCounters {
        &self.counters
    }

    /// ドメインリストが使う RCU
    pub fn rcu(&self) -> &Rcu {
        &self.rcu
    }

    /// CDP の有効/無効を切り替える（管理操作）
    ///
    /// 各制御ドメインの CPU 上で QoS 設定レジスタを書き直す。
    /// CPUごとの設定を持つ場合はドメイン内の全CPU、それ以外はいずれか1CPU。
    pub fn set_cdp_enabled(&self, rid: ResourceId, enable: bool) -> ResctrlResult<()> {
        let r = self.table.get(rid);
        if !r.alloc_capable || !r.cdp_capable {
            return Err(ResctrlError::Unsupported);
        }

        let _guard = self.domain_lock.lock();
        r.set_cdp_flag(enable);

        let msr = &*self.platform.msr;
        let cross_call = &*self.platform.cross_call;
        let mut write = |cpu: u32| reconfigure_cdp(r, cpu, msr);
        for d in r.ctrl_domains.read().iter() {
            let mask = &d.header().cpu_mask;
            if r.cache.arch_has_per_cpu_cfg {
                for cpu in mask.iter() {
                    cross_call.call_on(cpu, &mut write)?;
                }
            } else {
                cross_call.call_any(mask, &mut write)?;
            }
        }
        log::info!("{}: CDP {}", r.name(), if enable { "enabled" } else { "disabled" });
        Ok(())
    }

    /// 1つの CLOSID の制御値を更新し、ハードウェアへ書き込む
    pub fn update_ctrl(&self, rid: ResourceId, domain_id: u32, closid: u32, value: u32) -> ResctrlResult<()> {
        let r = self.table.get(rid);
        if !r.alloc_capable {
            return Err(ResctrlError::Unsupported);
        }
        if closid >= r.num_closid {
            return Err(ResctrlError::InvalidArgument);
        }

        let guard = self.domain_lock.lock();
        let (found, _) = r.ctrl_domains.find(&guard, domain_id);
        let missing = ResctrlError::ConfigInconsistency {
            resource: rid,
            id: domain_id,
        };
        let d = found.ok_or(missing)?;
        let mask = &d.header().cpu_mask;
        if mask.is_empty() {
            return Err(missing);
        }

        let msr = &*self.platform.msr;
        let cross_call = &*self.platform.cross_call;
        d.with_ctrl_val(|vals| {
            if let Some(slot) = vals.get_mut(closid as usize) {
                *slot = value;
            }
            match r.writer {
                // MSR はドメイン内のCPU上で書く
                Some(writer) => cross_call.call_any(mask, &mut |cpu| {
                    writer.update(r, cpu, &*vals, closid..closid + 1, msr)
                }),
                None => Ok(()),
            }
        })
    }

    /// キャッシュ疑似ロック領域を制御ドメインに結び付ける
    pub fn pseudo_lock(
        &self,
        rid: ResourceId,
        domain_id: u32,
        closid: u32,
        cbm: u32,
    ) -> ResctrlResult<Arc<PseudoLockRegion>> {
        let r = self.table.get(rid);
        if !r.alloc_capable || r.schema_fmt != SchemaFormat::Bitmap {
            return Err(ResctrlError::Unsupported);
        }
        if closid >= r.num_closid || cbm & !r.default_ctrl() != 0 {
            return Err(ResctrlError::InvalidArgument);
        }

        let guard = self.domain_lock.lock();
        let (found, _) = r.ctrl_domains.find(&guard, domain_id);
        let d = found.ok_or(ResctrlError::ConfigInconsistency {
            resource: rid,
            id: domain_id,
        })?;
        let plr = Arc::new(PseudoLockRegion::new(closid, cbm));
        d.attach_pseudo_lock(plr.clone());
        Ok(plr)
    }
}

impl CpuHotplugHandler for Resctrl {
    fn online_cpu(&self, cpu: u32) -> ResctrlResult<()> {
        Resctrl::online_cpu(self, cpu);
        Ok(())
    }

    fn offline_cpu(&self, cpu: u32) -> ResctrlResult<()> {
        Resctrl::offline_cpu(self, cpu);
        Ok(())
    }
}

// ============================================================================
// グローバルインスタンス（カーネルのブート/終了処理から使う）
// ============================================================================

static RESCTRL: Mutex<Option<Arc<Resctrl>>> = Mutex::new(None);

/// グローバルインスタンスを初期化する
pub fn init(config: &ResctrlConfig, platform: Platform) -> ResctrlResult<()> {
    let mut slot = RESCTRL.lock();
    if slot.is_some() {
        return Err(ResctrlError::InvalidArgument);
    }
    *slot = Some(Resctrl::init(config, platform)?);
    Ok(())
}

/// グローバルインスタンス
pub fn get() -> Option<Arc<Resctrl>> {
    RESCTRL.lock().clone()
}

/// グローバルインスタンスを終了する
pub fn shutdown() {
    let instance = RESCTRL.lock().take();
    if let Some(rc) = instance {
        rc.shutdown();
    }
}
