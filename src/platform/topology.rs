// ============================================================================
// src/platform/topology.rs - 表によるトポロジ
//
// ブート時にACPI/CPUIDから得たトポロジを表として保持する。
// CPUのホットアドで行が追加される。
// ============================================================================

use hashbrown::{HashMap, HashSet};
use spin::RwLock;

use super::Topology;

/// 1CPUぶんのトポロジ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTopology {
    pub l2_id: Option<u32>,
    pub l3_id: Option<u32>,
    pub node: Option<u32>,
}

/// CPU ID → トポロジ の表
#[derive(Debug, Default)]
pub struct TableTopology {
    cpus: RwLock<HashMap<u32, CpuTopology>>,
}

impl TableTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// CPUのトポロジを登録（既存の行は置き換える）
    pub fn set(&self, cpu: u32, topo: CpuTopology) {
        self.cpus.write().insert(cpu, topo);
    }

    /// L2 / L3 / ノードをまとめて登録
    pub fn with_cpu(self, cpu: u32, l2_id: u32, l3_id: u32, node: u32) -> Self {
        self.set(
            cpu,
            CpuTopology {
                l2_id: Some(l2_id),
                l3_id: Some(l3_id),
                node: Some(node),
            },
        );
        self
    }

    pub fn remove(&self, cpu: u32) -> Option<CpuTopology> {
        self.cpus.write().remove(&cpu)
    }

    pub fn get(&self, cpu: u32) -> Option<CpuTopology> {
        self.cpus.read().get(&cpu).copied()
    }
}

impl Topology for TableTopology {
    fn cache_id(&self, cpu: u32, level: u32) -> Option<u32> {
        let topo = self.get(cpu)?;
        match level {
            2 => topo.l2_id,
            3 => topo.l3_id,
            _ => None,
        }
    }

    fn cpu_to_node(&self, cpu: u32) -> Option<u32> {
        self.get(cpu)?.node
    }

    fn snc_nodes_per_l3(&self) -> u32 {
        let cpus = self.cpus.read();
        let mut nodes: HashMap<u32, HashSet<u32>> = HashMap::new();
        for topo in cpus.values() {
            if let (Some(l3), Some(node)) = (topo.l3_id, topo.node) {
                nodes.entry(l3).or_default().insert(node);
            }
        }
        nodes.values().map(|n| n.len() as u32).max().unwrap_or(1).max(1)
    }
}
