// ============================================================================
// src/domain/registry.rs - ドメインリスト
//
// リソースごとに、トポロジIDの昇順に並んだドメインのリストを持つ。
//
// - 読み取り: ロックなし。RCU 読み取り区間内で不変のスナップショットを走査する
// - 構造の変更: ドメイン変更ロック下でのみ。新しいスナップショットを作って公開し、
//   猶予期間の後に旧スナップショットを解放する
//
// ノードは完全に構築されてから公開されるため、読み取り側が初期化途中の
// ドメインを観測することはない。
// ============================================================================

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use spin::{Mutex, MutexGuard};

use super::Domain;
use crate::error::{ResctrlError, ResctrlResult};
use crate::sync::{Rcu, RcuPtr, RcuReadGuard, Retired};

/// ドメイン変更ロック
///
/// 全リソースのドメインリストの構造変更を直列化する、システムで1つのロック。
pub struct DomainListLock {
    inner: Mutex<()>,
}

impl DomainListLock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> DomainListGuard<'_> {
        DomainListGuard {
            _guard: self.inner.lock(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl Default for DomainListLock {
    fn default() -> Self {
        Self::new()
    }
}

/// ドメイン変更ロックを保持していることの証明
///
/// リストを変更する操作はすべてこのガードを引数に取る。
pub struct DomainListGuard<'a> {
    _guard: MutexGuard<'a, ()>,
}

/// 新しいIDをリストの昇順を保って挿入できる位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertPos(usize);

impl InsertPos {
    pub fn index(self) -> usize {
        self.0
    }
}

/// RCU で保護されたドメインリスト
pub struct DomainList<D> {
    rcu: Arc<Rcu>,
    head: RcuPtr<Vec<Arc<D>>>,
}

impl<D: Domain> DomainList<D> {
    pub fn new(rcu: Arc<Rcu>) -> Self {
        Self {
            rcu,
            head: RcuPtr::new(Vec::new()),
        }
    }

    /// ロックなしでリストを読む
    ///
    /// 返したスナップショットが生きている間、含まれるドメインは解放されない。
    pub fn read(&self) -> DomainSnapshot<'_, D> {
        let guard = self.rcu.read_lock();
        // SAFETY: 参照の寿命はスナップショット内のガードの寿命に収まる
        let list = unsafe { self.head.load_unchecked() };
        DomainSnapshot {
            list: list.as_slice(),
            _guard: guard,
        }
    }

    /// 更新側から現在のリストを参照
    fn current<'g>(&'g self, _guard: &'g DomainListGuard<'_>) -> &'g [Arc<D>] {
        // SAFETY: 旧スナップショットを解放するのはロック保持者だけで、
        // ここではロックを保持している
        unsafe { self.head.load_unchecked() }.as_slice()
    }

    /// IDでドメインを探す
    ///
    /// 既存のドメインと、存在しない場合の挿入位置を1回の探索で返す。
    pub fn find(&self, guard: &DomainListGuard<'_>, id: u32) -> (Option<Arc<D>>, InsertPos) {
        let list = self.current(guard);
        match list.binary_search_by_key(&id, |d| d.id()) {
            Ok(i) => (Some(list[i].clone()), InsertPos(i)),
            Err(i) => (None, InsertPos(i)),
        }
    }

    /// 完全に構築されたドメインを `pos` に挿入して公開する
    ///
    /// `pos` は同じロック区間内の [`find`](Self::find) で得たもの。
    /// 昇順が崩れる位置は拒否する。
    pub fn insert(&self, guard: &DomainListGuard<'_>, pos: InsertPos, domain: D) -> ResctrlResult<Arc<D>> {
        let list = self.current(guard);
        let id = domain.id();
        let i = pos.0;
        let ordered = i <= list.len()
            && (i == 0 || list[i - 1].id() < id)
            && (i == list.len() || list[i].id() > id);
        if !ordered {
            return Err(ResctrlError::InvalidArgument);
        }

        let mut next = Vec::new();
        next.try_reserve_exact(list.len() + 1)?;
        let domain = Arc::new(domain);
        next.extend_from_slice(&list[..i]);
        next.push(domain.clone());
        next.extend_from_slice(&list[i..]);

        self.head.replace(&self.rcu, next).reclaim();
        Ok(domain)
    }

    /// IDのドメインをリストから外す
    ///
    /// 外したドメインは [`Unlinked::quiesce`] で猶予期間を待ってから解放する。
    /// オフライン通知の後に呼ばれるため失敗しない（縮小側の確保は中断しない）。
    pub fn remove(&self, guard: &DomainListGuard<'_>, id: u32) -> Option<Unlinked<'_, D>> {
        let list = self.current(guard);
        let i = list.binary_search_by_key(&id, |d| d.id()).ok()?;

        let mut next = Vec::with_capacity(list.len() - 1);
        next.extend_from_slice(&list[..i]);
        next.extend_from_slice(&list[i + 1..]);
        let domain = list[i].clone();

        let retired = self.head.replace(&self.rcu, next);
        Some(Unlinked { retired, domain })
    }

    /// 更新側から見た要素数
    pub fn len_locked(&self, guard: &DomainListGuard<'_>) -> usize {
        self.current(guard).len()
    }
}

impl<D: Domain> fmt::Debug for DomainList<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.read().ids()).finish()
    }
}

/// 公開を取り下げたドメイン
#[must_use = "外したドメインは quiesce してから解放する"]
pub struct Unlinked<'a, D> {
    retired: Retired<'a, Vec<Arc<D>>>,
    domain: Arc<D>,
}

impl<D> Unlinked<'_, D> {
    /// リストから外れたドメイン（まだ読み取り側が参照しているかもしれない）
    pub fn domain(&self) -> &D {
        &self.domain
    }

    /// 猶予期間を待つ
    ///
    /// 戻り値のドメインは、外す前に始まった読み取り側からもう参照されない。
    pub fn quiesce(self) -> Arc<D> {
        let Unlinked { retired, domain } = self;
        retired.reclaim();
        domain
    }
}

/// 読み取り区間内のリストのスナップショット
pub struct DomainSnapshot<'a, D> {
    list: &'a [Arc<D>],
    _guard: RcuReadGuard<'a>,
}

impl<D: Domain> DomainSnapshot<'_, D> {
    pub fn iter(&self) -> impl Iterator<Item = &D> {
        self.list.iter().map(|d| &**d)
    }

    pub fn get(&self, id: u32) -> Option<&D> {
        self.list
            .binary_search_by_key(&id, |d| d.id())
            .ok()
            .map(|i| &*self.list[i])
    }

    pub fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.list.iter().map(|d| d.id())
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }
}
