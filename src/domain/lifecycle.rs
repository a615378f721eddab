// ============================================================================
// src/domain/lifecycle.rs - ドメインのライフサイクル
//
// (リソース, トポロジID) ごとの状態遷移。制御ドメインと監視ドメインは独立。
//
//   不在 --最初のCPUオンライン--> 活動中   確保・既定値の書き込み・リスト挿入・通知
//   活動中 --CPUオンライン-->     活動中   メンバー追加
//   活動中 --CPUオフライン-->     活動中   メンバー除去
//   活動中 --最後のCPUオフライン--> 不在   通知・リスト除去・猶予期間・解放
//
// すべてドメイン変更ロック下で、対象CPU自身の上で実行される。
// 失敗はここで処理し、部分的に確保したものは解放してCPUをドメインに
// 入れないまま戻る。
// ============================================================================

use alloc::sync::Arc;

use super::{CtrlDomain, Domain, DomainCounters, DomainListGuard, MonDomain};
use crate::arch::MsrAccess;
use crate::arch::msr::{
    MSR_IA32_L2_QOS_CFG, MSR_IA32_L3_QOS_CFG, MSR_RMID_SNC_CONFIG, QOS_CFG_CDP_ENABLE,
    RMID_SNC_CONFIG_SHARED,
};
use crate::error::{ResctrlError, ResctrlResult};
use crate::platform::{ResctrlFs, Topology};
use crate::resource::{MonConfig, Resource, ResourceId, Scope};

/// 遷移に必要なコラボレータ
pub struct DomainCtx<'a> {
    pub msr: &'a dyn MsrAccess,
    pub topology: &'a dyn Topology,
    pub fs: &'a dyn ResctrlFs,
    pub mon: &'a MonConfig,
    pub counters: &'a Arc<DomainCounters>,
}

/// CPUのオンライン/オフラインで起きた遷移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 不在 → 活動中（ドメインID）
    Created(u32),
    /// 既存ドメインへのメンバー追加
    Joined(u32),
    /// メンバー除去（ドメインは残る）
    Left(u32),
    /// 活動中 → 不在
    Destroyed(u32),
}

/// CPU とスコープからドメインIDを求める
pub fn domain_id_from_scope(topology: &dyn Topology, cpu: u32, scope: Scope) -> ResctrlResult<u32> {
    let id = match scope {
        Scope::L2Cache => topology.cache_id(cpu, 2),
        Scope::L3Cache => topology.cache_id(cpu, 3),
        Scope::L3Node => topology.cpu_to_node(cpu),
    };
    id.ok_or(ResctrlError::TopologyUnresolved { cpu, scope })
}

/// `cpu` 上の QoS 設定レジスタに CDP 有効ビットを書く
///
/// CDP 非対応のリソースでは何もしない。
pub fn reconfigure_cdp(r: &Resource, cpu: u32, msr: &dyn MsrAccess) {
    if !r.cdp_capable {
        return;
    }
    let reg = match r.rid {
        ResourceId::L3 => MSR_IA32_L3_QOS_CFG,
        ResourceId::L2 => MSR_IA32_L2_QOS_CFG,
        ResourceId::Mba | ResourceId::Smba => return,
    };
    let value = if r.cdp_enabled() { QOS_CFG_CDP_ENABLE } else { 0 };
    msr.write(cpu, reg, value);
}

/// SNC 有効時、`cpu` の RMID を SNC ノードごとに分割する
///
/// 既定ではファームウェアが RMID を L3 全体で共有する設定にしている。
pub fn configure_rmid_sharing(mon: &MonConfig, cpu: u32, msr: &dyn MsrAccess) {
    if !mon.snc_enabled() {
        return;
    }
    let value = msr.read(cpu, MSR_RMID_SNC_CONFIG);
    msr.write(cpu, MSR_RMID_SNC_CONFIG, value & !RMID_SNC_CONFIG_SHARED);
}

// ============================================================================
// 制御ドメイン
// ============================================================================

pub fn domain_add_cpu_ctrl(
    cpu: u32,
    r: &Resource,
    ctx: &DomainCtx<'_>,
    guard: &DomainListGuard<'_>,
) -> ResctrlResult<Transition> {
    let id = domain_id_from_scope(ctx.topology, cpu, r.ctrl_scope).inspect_err(|_| {
        warn_once!(
            "Can't find control domain id for CPU:{} scope:{} for resource {}",
            cpu,
            r.ctrl_scope,
            r.name()
        );
    })?;

    let (found, pos) = r.ctrl_domains.find(guard, id);
    if let Some(d) = found {
        d.header().cpu_mask.set(cpu);
        if r.cache.arch_has_per_cpu_cfg {
            reconfigure_cdp(r, cpu, ctx.msr);
        }
        return Ok(Transition::Joined(id));
    }

    let d = CtrlDomain::new(id, cpu, r.num_closid, r.default_ctrl(), ctx.counters)?;

    reconfigure_cdp(r, cpu, ctx.msr);
    if let Some(writer) = r.writer {
        d.with_ctrl_val(|vals| writer.update(r, cpu, vals, 0..r.num_closid, ctx.msr));
    }

    let d = r.ctrl_domains.insert(guard, pos, d)?;

    if let Err(e) = ctx.fs.online_ctrl_domain(r, &d) {
        log::warn!("{}: control domain {} online rejected: {}", r.name(), id, e);
        drop(d);
        if let Some(unlinked) = r.ctrl_domains.remove(guard, id) {
            drop(unlinked.quiesce());
        }
        return Err(ResctrlError::NotificationFailure);
    }

    verbose!("{}: control domain {} created by CPU {}", r.name(), id, cpu);
    Ok(Transition::Created(id))
}

pub fn domain_remove_cpu_ctrl(
    cpu: u32,
    r: &Resource,
    ctx: &DomainCtx<'_>,
    guard: &DomainListGuard<'_>,
) -> ResctrlResult<Transition> {
    let id = domain_id_from_scope(ctx.topology, cpu, r.ctrl_scope).inspect_err(|_| {
        warn_once!(
            "Can't find control domain id for CPU:{} scope:{} for resource {}",
            cpu,
            r.ctrl_scope,
            r.name()
        );
    })?;

    let (found, _) = r.ctrl_domains.find(guard, id);
    let Some(d) = found else {
        log::warn!(
            "Can't find control domain for id={} for CPU {} for resource {}",
            id,
            cpu,
            r.name()
        );
        return Err(ResctrlError::ConfigInconsistency { resource: r.rid, id });
    };

    // マスクを先に空にする。リストから外れて猶予期間が明けるまで、読み取り側は
    // メンバーが空のドメインを見うる。ロック保持側が空のドメインを見ることはない。
    d.header().cpu_mask.clear(cpu);
    if !d.header().cpu_mask.is_empty() {
        return Ok(Transition::Left(id));
    }

    ctx.fs.offline_ctrl_domain(r, &d);
    drop(d);
    if let Some(unlinked) = r.ctrl_domains.remove(guard, id) {
        let d = unlinked.quiesce();
        // 疑似ロック領域はドメインより長生きしうる
        d.release_pseudo_lock();
    }

    verbose!("{}: control domain {} destroyed", r.name(), id);
    Ok(Transition::Destroyed(id))
}

// ============================================================================
// 監視ドメイン
// ============================================================================

pub fn domain_add_cpu_mon(
    cpu: u32,
    r: &Resource,
    ctx: &DomainCtx<'_>,
    guard: &DomainListGuard<'_>,
) -> ResctrlResult<Transition> {
    let scope = r.mon_scope.ok_or(ResctrlError::Unsupported)?;
    let id = domain_id_from_scope(ctx.topology, cpu, scope).inspect_err(|_| {
        warn_once!(
            "Can't find monitor domain id for CPU:{} scope:{} for resource {}",
            cpu,
            scope,
            r.name()
        );
    })?;

    let (found, pos) = r.mon_domains.find(guard, id);
    if let Some(d) = found {
        d.header().cpu_mask.set(cpu);
        return Ok(Transition::Joined(id));
    }

    let Some(ci_id) = ctx.topology.cache_id(cpu, 3) else {
        warn_once!("Can't find L3 cache for CPU:{} resource {}", cpu, r.name());
        return Err(ResctrlError::CacheInfoMissing { cpu });
    };

    configure_rmid_sharing(ctx.mon, cpu, ctx.msr);

    let d = MonDomain::new(id, cpu, ci_id, ctx.mon, ctx.counters)?;
    let d = r.mon_domains.insert(guard, pos, d)?;

    if let Err(e) = ctx.fs.online_mon_domain(r, &d) {
        log::warn!("{}: monitor domain {} online rejected: {}", r.name(), id, e);
        drop(d);
        if let Some(unlinked) = r.mon_domains.remove(guard, id) {
            drop(unlinked.quiesce());
        }
        return Err(ResctrlError::NotificationFailure);
    }

    verbose!("{}: monitor domain {} created by CPU {}", r.name(), id, cpu);
    Ok(Transition::Created(id))
}

pub fn domain_remove_cpu_mon(
    cpu: u32,
    r: &Resource,
    ctx: &DomainCtx<'_>,
    guard: &DomainListGuard<'_>,
) -> ResctrlResult<Transition> {
    let scope = r.mon_scope.ok_or(ResctrlError::Unsupported)?;
    let id = domain_id_from_scope(ctx.topology, cpu, scope).inspect_err(|_| {
        warn_once!(
            "Can't find monitor domain id for CPU:{} scope:{} for resource {}",
            cpu,
            scope,
            r.name()
        );
    })?;

    let (found, _) = r.mon_domains.find(guard, id);
    let Some(d) = found else {
        log::warn!(
            "Can't find monitor domain for id={} for CPU {} for resource {}",
            id,
            cpu,
            r.name()
        );
        return Err(ResctrlError::ConfigInconsistency { resource: r.rid, id });
    };

    // 制御ドメインと同じく、空のマスクは猶予期間が明けるまで読み取り側に見える
    d.header().cpu_mask.clear(cpu);
    if !d.header().cpu_mask.is_empty() {
        return Ok(Transition::Left(id));
    }

    ctx.fs.offline_mon_domain(r, &d);
    drop(d);
    if let Some(unlinked) = r.mon_domains.remove(guard, id) {
        drop(unlinked.quiesce());
    }

    verbose!("{}: monitor domain {} destroyed", r.name(), id);
    Ok(Transition::Destroyed(id))
}

// ============================================================================
// リソース単位
// ============================================================================

/// `cpu` をリソースの制御・監視ドメインに加える
///
/// 失敗はログに残して他方の処理を続ける。戻り値は (制御, 監視) の結果。
pub fn domain_add_cpu(
    cpu: u32,
    r: &Resource,
    ctx: &DomainCtx<'_>,
    guard: &DomainListGuard<'_>,
) -> (Option<ResctrlResult<Transition>>, Option<ResctrlResult<Transition>>) {
    let ctrl = r.alloc_capable.then(|| domain_add_cpu_ctrl(cpu, r, ctx, guard));
    let mon = r.mon_capable.then(|| domain_add_cpu_mon(cpu, r, ctx, guard));
    for res in ctrl.iter().chain(mon.iter()) {
        if let Err(e) = res {
            log::debug!("{}: CPU {} online: {}", r.name(), cpu, e);
        }
    }
    (ctrl, mon)
}

/// `cpu` をリソースの制御・監視ドメインから外す
pub fn domain_remove_cpu(
    cpu: u32,
    r: &Resource,
    ctx: &DomainCtx<'_>,
    guard: &DomainListGuard<'_>,
) -> (Option<ResctrlResult<Transition>>, Option<ResctrlResult<Transition>>) {
    let ctrl = r.alloc_capable.then(|| domain_remove_cpu_ctrl(cpu, r, ctx, guard));
    let mon = r.mon_capable.then(|| domain_remove_cpu_mon(cpu, r, ctx, guard));
    for res in ctrl.iter().chain(mon.iter()) {
        if let Err(e) = res {
            log::debug!("{}: CPU {} offline: {}", r.name(), cpu, e);
        }
    }
    (ctrl, mon)
}
