// ============================================================================
// src/test/mock.rs - モックハードウェア
//
// CPUID 表・MSR レジスタファイル・割り込みフラグ・プレゼンテーション層・
// ホットプラグ管理をメモリ上で再現する。すべて記録を取り、テストから検査できる。
// ============================================================================

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use hashbrown::{HashMap, HashSet};
use spin::Mutex;

use crate::arch::{CpuSignature, Cpuid, CpuidResult, IrqControl, MsrAccess, Vendor};
use crate::domain::{CtrlDomain, Domain, MonDomain};
use crate::error::{ResctrlError, ResctrlResult};
use crate::platform::topology::TableTopology;
use crate::platform::{
    CpuHotplugHandler, CrossCall, HotplugManager, HotplugState, Platform, ResctrlFs,
};
use crate::resource::{Resource, ResourceId};

// ============================================================================
// CPUID
// ============================================================================

/// (leaf, subleaf) → レジスタ値 の表。未登録のリーフは 0 を返す。
pub struct MockCpuid {
    leaves: Mutex<HashMap<(u32, u32), CpuidResult>>,
}

impl MockCpuid {
    /// ベンダー文字列と最大リーフだけを持つCPU
    pub fn new(vendor: Vendor) -> Self {
        let (ebx, edx, ecx) = vendor.to_cpuid_regs();
        let (max_ext, family, model) = match vendor {
            Vendor::Amd => (0x8000_0020, 0x19, 0x11),
            _ => (0x8000_0008, 6, 0x6A),
        };
        let this = Self {
            leaves: Mutex::new(HashMap::new()),
        };
        this.set(0, 0, CpuidResult { eax: 0x20, ebx, ecx, edx });
        this.set(0x8000_0000, 0, CpuidResult { eax: max_ext, ..Default::default() });
        this.signature(family, model, 1);
        this
    }

    /// L3/L2 CAT・L3 CDP・MBA・CMT/MBM を持つ Intel サーバー
    pub fn intel_rdt() -> Self {
        let this = Self::new(Vendor::Intel);
        this.set(7, 0, CpuidResult { ebx: (1 << 12) | (1 << 15), ..Default::default() });
        this.set(0x10, 0, CpuidResult { ebx: (1 << 1) | (1 << 2) | (1 << 3), ..Default::default() });
        this.set(0x10, 1, CpuidResult { eax: 10, ebx: 0x600, ecx: 1 << 2, edx: 15 });
        this.set(0x10, 2, CpuidResult { eax: 7, ebx: 0, ecx: 0, edx: 7 });
        this.set(0x10, 3, CpuidResult { eax: 89, ebx: 0, ecx: 1 << 2, edx: 7 });
        this.set_monitoring();
        this
    }

    /// L3 CAT/CDP・MBA・SMBA・BMEC・CMT/MBM を持つ AMD サーバー
    pub fn amd_qos() -> Self {
        let this = Self::new(Vendor::Amd);
        this.set(7, 0, CpuidResult { ebx: (1 << 12) | (1 << 15), ..Default::default() });
        this.set(0x10, 0, CpuidResult { ebx: 1 << 1, ..Default::default() });
        this.set(0x10, 1, CpuidResult { eax: 15, ebx: 0, ecx: 1 << 2, edx: 15 });
        this.set(0x8000_0008, 0, CpuidResult { ebx: 1 << 6, ..Default::default() });
        this.set(0x8000_0020, 0, CpuidResult { ebx: (1 << 2) | (1 << 3), ..Default::default() });
        this.set(0x8000_0020, 1, CpuidResult { eax: 11, ebx: 0, ecx: 0, edx: 15 });
        this.set(0x8000_0020, 2, CpuidResult { eax: 11, ebx: 0, ecx: 0, edx: 15 });
        this.set_monitoring();
        this
    }

    fn set_monitoring(&self) {
        self.set(0xf, 0, CpuidResult { ebx: 0xff, ..Default::default() });
        self.set(0xf, 1, CpuidResult { eax: 0, ebx: 64, ecx: 0xff, edx: 0b111 });
    }

    pub fn set(&self, leaf: u32, subleaf: u32, regs: CpuidResult) {
        self.leaves.lock().insert((leaf, subleaf), regs);
    }

    /// 既存のレジスタ値にビットを追加
    pub fn or_bits(&self, leaf: u32, subleaf: u32, bits: CpuidResult) {
        let mut leaves = self.leaves.lock();
        let regs = leaves.entry((leaf, subleaf)).or_default();
        regs.eax |= bits.eax;
        regs.ebx |= bits.ebx;
        regs.ecx |= bits.ecx;
        regs.edx |= bits.edx;
    }

    /// CPUID.1:EAX のシグネチャを書き換える
    pub fn signature(&self, family: u32, model: u32, stepping: u32) {
        let vendor = Vendor::from_cpuid(&self.cpuid_count(0, 0));
        let eax = CpuSignature {
            vendor,
            family,
            model,
            stepping,
        }
        .encode();
        self.leaves
            .lock()
            .entry((1, 0))
            .or_default()
            .eax = eax;
    }
}

impl Cpuid for MockCpuid {
    fn cpuid_count(&self, leaf: u32, subleaf: u32) -> CpuidResult {
        self.leaves
            .lock()
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }
}

// ============================================================================
// MSR
// ============================================================================

#[derive(Default)]
struct MsrFile {
    regs: HashMap<(u32, u32), u64>,
    log: Vec<(u32, u32, u64)>,
    write_masks: HashMap<u32, u64>,
    faulting: HashSet<u32>,
    running_on: Option<u32>,
    foreign: Vec<(u32, u32)>,
}

/// CPUごとの MSR レジスタファイル
///
/// 書き込みはすべて (cpu, msr, 値) として記録される。
#[derive(Default)]
pub struct MockMsr {
    file: Mutex<MsrFile>,
}

impl MockMsr {
    pub fn new() -> Self {
        Self::default()
    }

    /// 一度も書かれていなければ None
    pub fn value(&self, cpu: u32, msr: u32) -> Option<u64> {
        self.file.lock().regs.get(&(cpu, msr)).copied()
    }

    /// 記録を残さずにレジスタ値を設定
    pub fn set(&self, cpu: u32, msr: u32, value: u64) {
        self.file.lock().regs.insert((cpu, msr), value);
    }

    pub fn writes(&self) -> Vec<(u32, u32, u64)> {
        self.file.lock().log.clone()
    }

    /// 指定 MSR への書き込みだけを (cpu, 値) で
    pub fn writes_to(&self, msr: u32) -> Vec<(u32, u64)> {
        self.file
            .lock()
            .log
            .iter()
            .filter(|(_, m, _)| *m == msr)
            .map(|(cpu, _, v)| (*cpu, *v))
            .collect()
    }

    pub fn clear_log(&self) {
        self.file.lock().log.clear();
    }

    /// 実装されていないビットを落とす（書いた値が読み戻せない）
    pub fn set_write_mask(&self, msr: u32, mask: u64) {
        self.file.lock().write_masks.insert(msr, mask);
    }

    /// 例外付き書き込みが #GP を起こす MSR
    pub fn set_faulting(&self, msr: u32) {
        self.file.lock().faulting.insert(msr);
    }

    /// 実行中のCPUを設定し、以前の値を返す
    ///
    /// 設定中は、別CPU宛ての読み書きを [`foreign_accesses`](Self::foreign_accesses) に記録する。
    /// 実機では他CPUの MSR には触れられない。
    pub fn set_running_on(&self, cpu: Option<u32>) -> Option<u32> {
        core::mem::replace(&mut self.file.lock().running_on, cpu)
    }

    /// 実行中CPU以外を対象にした (cpu, msr)
    pub fn foreign_accesses(&self) -> Vec<(u32, u32)> {
        self.file.lock().foreign.clone()
    }
}

impl MsrFile {
    fn check_cpu(&mut self, cpu: u32, msr: u32) {
        if self.running_on.is_some_and(|cur| cur != cpu) {
            self.foreign.push((cpu, msr));
        }
    }
}

impl MsrAccess for MockMsr {
    fn read(&self, cpu: u32, msr: u32) -> u64 {
        let mut file = self.file.lock();
        file.check_cpu(cpu, msr);
        file.regs.get(&(cpu, msr)).copied().unwrap_or(0)
    }

    fn write(&self, cpu: u32, msr: u32, value: u64) {
        let mut file = self.file.lock();
        file.check_cpu(cpu, msr);
        let stored = match file.write_masks.get(&msr) {
            Some(mask) => value & mask,
            None => value,
        };
        file.regs.insert((cpu, msr), stored);
        file.log.push((cpu, msr, value));
    }

    fn write_safe(&self, cpu: u32, msr: u32, value: u64) -> ResctrlResult<()> {
        if self.file.lock().faulting.contains(&msr) {
            return Err(ResctrlError::MsrFault { msr });
        }
        self.write(cpu, msr, value);
        Ok(())
    }
}

// ============================================================================
// 割り込みフラグ
// ============================================================================

/// 割り込みフラグ（全CPUで1つ）
pub struct MockIrq {
    enabled: AtomicBool,
    saves: AtomicUsize,
}

impl MockIrq {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn disabled(&self) -> bool {
        !self.enabled.load(Ordering::SeqCst)
    }

    /// save_and_disable の呼び出し回数
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

impl Default for MockIrq {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqControl for MockIrq {
    fn save_and_disable(&self) -> bool {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.enabled.swap(false, Ordering::SeqCst)
    }

    fn restore(&self, was_enabled: bool) {
        if was_enabled {
            self.enabled.store(true, Ordering::SeqCst);
        }
    }
}

// ============================================================================
// プレゼンテーション層
// ============================================================================

/// プレゼンテーション層が受け取った通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEvent {
    Init,
    Exit,
    OnlineCpu(u32),
    OfflineCpu(u32),
    OnlineCtrl(ResourceId, u32),
    OfflineCtrl(ResourceId, u32),
    OnlineMon(ResourceId, u32),
    OfflineMon(ResourceId, u32),
}

/// 通知を記録するだけのプレゼンテーション層
///
/// 受理された通知だけを記録する。拒否した通知は残らない。
#[derive(Default)]
pub struct RecordingFs {
    events: Mutex<Vec<FsEvent>>,
    fail_init: AtomicBool,
    fail_online_ctrl: AtomicBool,
    fail_online_mon: AtomicBool,
}

impl RecordingFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FsEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&FsEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    /// 制御ドメインのオンラインを拒否する
    pub fn fail_online_ctrl(&self, fail: bool) {
        self.fail_online_ctrl.store(fail, Ordering::SeqCst);
    }

    /// 監視ドメインのオンラインを拒否する
    pub fn fail_online_mon(&self, fail: bool) {
        self.fail_online_mon.store(fail, Ordering::SeqCst);
    }

    fn record(&self, event: FsEvent) {
        self.events.lock().push(event);
    }

    fn accept(&self, fail: &AtomicBool, event: FsEvent) -> ResctrlResult<()> {
        if fail.load(Ordering::SeqCst) {
            return Err(ResctrlError::NotificationFailure);
        }
        self.record(event);
        Ok(())
    }
}

impl ResctrlFs for RecordingFs {
    fn init(&self) -> ResctrlResult<()> {
        self.accept(&self.fail_init, FsEvent::Init)
    }

    fn exit(&self) {
        self.record(FsEvent::Exit);
    }

    fn online_cpu(&self, cpu: u32) {
        self.record(FsEvent::OnlineCpu(cpu));
    }

    fn offline_cpu(&self, cpu: u32) {
        self.record(FsEvent::OfflineCpu(cpu));
    }

    fn online_ctrl_domain(&self, r: &Resource, d: &CtrlDomain) -> ResctrlResult<()> {
        self.accept(&self.fail_online_ctrl, FsEvent::OnlineCtrl(r.rid, d.id()))
    }

    fn offline_ctrl_domain(&self, r: &Resource, d: &CtrlDomain) {
        self.record(FsEvent::OfflineCtrl(r.rid, d.id()));
    }

    fn online_mon_domain(&self, r: &Resource, d: &MonDomain) -> ResctrlResult<()> {
        self.accept(&self.fail_online_mon, FsEvent::OnlineMon(r.rid, d.id()))
    }

    fn offline_mon_domain(&self, r: &Resource, d: &MonDomain) {
        self.record(FsEvent::OfflineMon(r.rid, d.id()));
    }
}

// ============================================================================
// ホットプラグ管理
// ============================================================================

#[derive(Default)]
struct HotplugInner {
    online: Vec<u32>,
    handlers: Vec<(HotplugState, Arc<dyn CpuHotplugHandler>)>,
}

/// CPUのオンライン集合と登録済みハンドラ
///
/// ハンドラはロックを外してから呼ぶため、ハンドラ内から再入できる。
#[derive(Default)]
pub struct MockHotplug {
    inner: Mutex<HotplugInner>,
    next_state: AtomicU32,
    fail_setup: AtomicBool,
}

impl MockHotplug {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登録前にオンラインにしておく
    pub fn set_online(&self, cpu: u32) {
        let mut inner = self.inner.lock();
        if !inner.online.contains(&cpu) {
            inner.online.push(cpu);
        }
    }

    pub fn online_cpus(&self) -> Vec<u32> {
        self.inner.lock().online.clone()
    }

    pub fn registered(&self) -> usize {
        self.inner.lock().handlers.len()
    }

    pub fn fail_setup(&self, fail: bool) {
        self.fail_setup.store(fail, Ordering::SeqCst);
    }

    fn handlers(&self) -> Vec<Arc<dyn CpuHotplugHandler>> {
        self.inner
            .lock()
            .handlers
            .iter()
            .map(|(_, h)| h.clone())
            .collect()
    }

    /// CPUをオンラインにし、登録順にハンドラを呼ぶ。既にオンラインなら何もしない。
    pub fn cpu_up(&self, cpu: u32) {
        {
            let mut inner = self.inner.lock();
            if inner.online.contains(&cpu) {
                return;
            }
            inner.online.push(cpu);
        }
        for h in self.handlers() {
            let _ = h.online_cpu(cpu);
        }
    }

    /// 登録と逆順にハンドラを呼んでから、CPUをオフラインにする
    pub fn cpu_down(&self, cpu: u32) {
        if !self.inner.lock().online.contains(&cpu) {
            return;
        }
        for h in self.handlers().iter().rev() {
            let _ = h.offline_cpu(cpu);
        }
        self.inner.lock().online.retain(|c| *c != cpu);
    }
}

impl HotplugManager for MockHotplug {
    fn setup_state(
        &self,
        _name: &'static str,
        handler: Arc<dyn CpuHotplugHandler>,
    ) -> ResctrlResult<HotplugState> {
        if self.fail_setup.load(Ordering::SeqCst) {
            return Err(ResctrlError::Hotplug);
        }
        let state = HotplugState(self.next_state.fetch_add(1, Ordering::SeqCst));
        let online = {
            let mut inner = self.inner.lock();
            inner.handlers.push((state, handler.clone()));
            inner.online.clone()
        };
        for cpu in online {
            let _ = handler.online_cpu(cpu);
        }
        Ok(state)
    }

    fn remove_state(&self, state: HotplugState) {
        let (handler, online) = {
            let inner = self.inner.lock();
            let handler = inner
                .handlers
                .iter()
                .find(|(s, _)| *s == state)
                .map(|(_, h)| h.clone());
            (handler, inner.online.clone())
        };
        if let Some(handler) = handler {
            for cpu in online {
                let _ = handler.offline_cpu(cpu);
            }
        }
        self.inner.lock().handlers.retain(|(s, _)| *s != state);
    }
}

// ============================================================================
// クロスコール
// ============================================================================

/// 対象CPU上で実行したことにして、その場で関数を呼ぶ
///
/// 実行中は [`MockMsr`] の実行中CPUを対象CPUに切り替える。
pub struct MockCrossCall {
    msr: Arc<MockMsr>,
    calls: Mutex<Vec<u32>>,
}

impl MockCrossCall {
    pub fn new(msr: Arc<MockMsr>) -> Self {
        Self {
            msr,
            calls: Mutex::new(Vec::new()),
        }
    }

    /// 呼び出し先CPUの履歴
    pub fn calls(&self) -> Vec<u32> {
        self.calls.lock().clone()
    }

    fn run_on<R>(&self, cpu: u32, f: impl FnOnce() -> R) -> R {
        let prev = self.msr.set_running_on(Some(cpu));
        let ret = f();
        self.msr.set_running_on(prev);
        ret
    }
}

impl CrossCall for MockCrossCall {
    fn call_on(&self, cpu: u32, f: &mut dyn FnMut(u32)) -> ResctrlResult<()> {
        self.calls.lock().push(cpu);
        self.run_on(cpu, || f(cpu));
        Ok(())
    }
}

// ============================================================================
// まとめ
// ============================================================================

/// モック一式の組み立て
pub struct MockPlatform {
    pub cpuid: Arc<MockCpuid>,
    pub msr: Arc<MockMsr>,
    pub irq: Arc<MockIrq>,
    pub topology: Arc<TableTopology>,
    pub fs: Arc<RecordingFs>,
    pub hotplug: Arc<MockHotplug>,
    pub cross_call: Arc<MockCrossCall>,
}

impl MockPlatform {
    pub fn new(cpuid: MockCpuid) -> Self {
        let msr = Arc::new(MockMsr::new());
        Self {
            cpuid: Arc::new(cpuid),
            cross_call: Arc::new(MockCrossCall::new(msr.clone())),
            msr,
            irq: Arc::new(MockIrq::new()),
            topology: Arc::new(TableTopology::new()),
            fs: Arc::new(RecordingFs::new()),
            hotplug: Arc::new(MockHotplug::new()),
        }
    }

    /// CPUのトポロジ (L2 ID / L3 ID / ノード) を登録
    pub fn cpu(self, cpu: u32, l2_id: u32, l3_id: u32, node: u32) -> Self {
        self.topology.set(
            cpu,
            crate::platform::topology::CpuTopology {
                l2_id: Some(l2_id),
                l3_id: Some(l3_id),
                node: Some(node),
            },
        );
        self
    }

    /// 初期化前からオンラインのCPU
    pub fn online(self, cpus: &[u32]) -> Self {
        for &cpu in cpus {
            self.hotplug.set_online(cpu);
        }
        self
    }

    pub fn platform(&self) -> Platform {
        Platform {
            cpuid: self.cpuid.clone(),
            msr: self.msr.clone(),
            irq: self.irq.clone(),
            topology: self.topology.clone(),
            fs: self.fs.clone(),
            hotplug: self.hotplug.clone(),
            cross_call: self.cross_call.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_mask_and_fault() {
        let msr = MockMsr::new();
        msr.set_write_mask(0x10, 0xff);
        msr.write(1, 0x10, 0x1234);
        assert_eq!(msr.read(1, 0x10), 0x34);
        assert_eq!(msr.writes(), [(1, 0x10, 0x1234)]);

        msr.set_faulting(0x20);
        assert_eq!(msr.write_safe(0, 0x20, 1), Err(ResctrlError::MsrFault { msr: 0x20 }));
        assert_eq!(msr.value(0, 0x20), None);
    }

    #[test]
    fn test_cross_call_switches_running_cpu() {
        let msr = Arc::new(MockMsr::new());
        let cc = MockCrossCall::new(msr.clone());
        msr.set_running_on(Some(0));
        msr.write(3, 0x10, 1);
        assert_eq!(msr.foreign_accesses(), [(3, 0x10)]);

        cc.call_on(3, &mut |cpu| msr.write(cpu, 0x11, 2)).unwrap();
        assert_eq!(msr.foreign_accesses(), [(3, 0x10)]);
        assert_eq!(cc.calls(), [3]);
        // 呼び出し後は元のCPUに戻る
        assert_eq!(msr.set_running_on(None), Some(0));
    }

    #[test]
    fn test_cpuid_signature() {
        let cpuid = MockCpuid::new(Vendor::Intel);
        cpuid.signature(6, 0x55, 4);
        let sig = CpuSignature::decode(Vendor::Intel, cpuid.cpuid_count(1, 0).eax);
        assert_eq!((sig.family, sig.model, sig.stepping), (6, 0x55, 4));
    }
}
