use std::{fmt, str::FromStr};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::{CopyKind, ReplicaMode};

/// Kind of a secondary copy hanging off another copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChainLink {
    Vault,
    Mirror,
    ReplicaVault,
    ReplicaMirror,
    CloudTarget,
}

impl ChainLink {
    pub fn copy_kind(&self) -> CopyKind {
        match self {
            ChainLink::Vault => CopyKind::Vault,
            ChainLink::Mirror => CopyKind::Mirror,
            ChainLink::ReplicaVault => CopyKind::Replica(ReplicaMode::Vault),
            ChainLink::ReplicaMirror => CopyKind::Replica(ReplicaMode::Mirror),
            ChainLink::CloudTarget => CopyKind::CloudTarget,
        }
    }

    pub fn name_prefix(&self) -> &'static str {
        match self {
            ChainLink::Vault => "Vault_",
            ChainLink::Mirror => "Mirror_",
            ChainLink::ReplicaVault => "Replica_Vault_",
            ChainLink::ReplicaMirror => "Replica_Mirror_",
            ChainLink::CloudTarget => "C2C_Target_",
        }
    }

    pub fn is_mirror(&self) -> bool {
        self.copy_kind().is_mirror()
    }
}

/// Where a planned copy attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutNode {
    Primary,
    /// Index into the plan of an earlier step.
    Step(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutRole {
    FirstNode,
    SecondNode,
    FanoutVault,
    FanoutMirror,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutStep {
    pub parent: LayoutNode,
    pub link: ChainLink,
    pub role: LayoutRole,
    /// Array tier the copy lives on, the primary being tier 0.
    pub tier: usize,
}

/// Copy topologies below a primary snap copy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationLayout {
    Pv,
    Pm,
    Pvm,
    Pmv,
    Pmm,
    PvReplica,
    PmReplica,
    PvmReplica,
    PmvReplica,
    PmmReplica,
    PvvReplica,
    PvReplicaC2c,
    Fanout { vaults: usize, mirrors: usize },
    All,
}

impl ReplicationLayout {
    pub fn plan(&self) -> Vec<LayoutStep> {
        use ChainLink::*;
        use LayoutNode::*;
        use LayoutRole::*;

        let first = |link| LayoutStep {
            parent: Primary,
            link,
            role: FirstNode,
            tier: 1,
        };
        let second = |link| LayoutStep {
            parent: Step(0),
            link,
            role: SecondNode,
            tier: 2,
        };
        let fan = |parent: LayoutNode, link: ChainLink| {
            let tier = match parent {
                Primary => 1,
                Step(_) => 2,
            };
            let role = if link.is_mirror() {
                FanoutMirror
            } else {
                FanoutVault
            };
            LayoutStep {
                parent,
                link,
                role,
                tier,
            }
        };

        match self {
            ReplicationLayout::Pv => vec![first(Vault)],
            ReplicationLayout::Pm => vec![first(Mirror)],
            ReplicationLayout::Pvm => vec![first(Vault), second(Mirror)],
            ReplicationLayout::Pmv => vec![first(Mirror), second(Vault)],
            ReplicationLayout::Pmm => vec![first(Mirror), second(Mirror)],
            ReplicationLayout::PvReplica => vec![first(ReplicaVault)],
            ReplicationLayout::PmReplica => vec![first(ReplicaMirror)],
            ReplicationLayout::PvmReplica => vec![first(ReplicaVault), second(ReplicaMirror)],
            ReplicationLayout::PmvReplica => vec![first(ReplicaMirror), second(ReplicaVault)],
            ReplicationLayout::PmmReplica => vec![first(ReplicaMirror), second(ReplicaMirror)],
            ReplicationLayout::PvvReplica => vec![first(ReplicaVault), second(ReplicaVault)],
            ReplicationLayout::PvReplicaC2c => vec![first(CloudTarget)],
            ReplicationLayout::Fanout { vaults, mirrors } => {
                let mut steps = Vec::with_capacity(vaults + mirrors);
                steps.extend((0..*vaults).map(|_| fan(Primary, ReplicaVault)));
                steps.extend((0..*mirrors).map(|_| fan(Primary, ReplicaMirror)));
                steps
            }
            // pv, pm, pmv, pvm, pm1, pmm, pv1, pvv
            ReplicationLayout::All => vec![
                fan(Primary, ReplicaVault),
                fan(Primary, ReplicaMirror),
                fan(Step(1), ReplicaVault),
                fan(Step(0), ReplicaMirror),
                fan(Primary, ReplicaMirror),
                fan(Step(4), ReplicaMirror),
                fan(Primary, ReplicaVault),
                fan(Step(6), ReplicaVault),
            ],
        }
    }

    /// Number of arrays the layout spans, the primary array included.
    pub fn tiers(&self) -> usize {
        self.plan().iter().map(|s| s.tier).max().unwrap_or(0) + 1
    }

    /// Layouts where a mirror's source copy keeps one cycle during aging
    /// validation instead of being spooled.
    pub fn mirror_source_keeps_cycle(&self) -> bool {
        matches!(
            self,
            ReplicationLayout::Pvm | ReplicationLayout::PvmReplica | ReplicationLayout::All
        )
    }
}

impl fmt::Display for ReplicationLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReplicationLayout::Pv => "pv",
            ReplicationLayout::Pm => "pm",
            ReplicationLayout::Pvm => "pvm",
            ReplicationLayout::Pmv => "pmv",
            ReplicationLayout::Pmm => "pmm",
            ReplicationLayout::PvReplica => "pv_replica",
            ReplicationLayout::PmReplica => "pm_replica",
            ReplicationLayout::PvmReplica => "pvm_replica",
            ReplicationLayout::PmvReplica => "pmv_replica",
            ReplicationLayout::PmmReplica => "pmm_replica",
            ReplicationLayout::PvvReplica => "pvv_replica",
            ReplicationLayout::PvReplicaC2c => "pv_replica_c2c",
            ReplicationLayout::Fanout { vaults, mirrors } => {
                return write!(f, "fanout({}v,{}m)", vaults, mirrors)
            }
            ReplicationLayout::All => "all",
        };
        f.write_str(name)
    }
}

impl FromStr for ReplicationLayout {
    type Err = anyhow::Error;

    /// Accepts the short names, `fanout` takes `fanout:<vaults>:<mirrors>`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let layout = match s.as_str() {
            "pv" => ReplicationLayout::Pv,
            "pm" => ReplicationLayout::Pm,
            "pvm" => ReplicationLayout::Pvm,
            "pmv" => ReplicationLayout::Pmv,
            "pmm" => ReplicationLayout::Pmm,
            "pv_replica" => ReplicationLayout::PvReplica,
            "pm_replica" => ReplicationLayout::PmReplica,
            "pvm_replica" => ReplicationLayout::PvmReplica,
            "pmv_replica" => ReplicationLayout::PmvReplica,
            "pmm_replica" => ReplicationLayout::PmmReplica,
            "pvv_replica" => ReplicationLayout::PvvReplica,
            "pv_replica_c2c" => ReplicationLayout::PvReplicaC2c,
            "all" => ReplicationLayout::All,
            other => {
                let mut parts = other.split(':');
                if parts.next() != Some("fanout") {
                    return Err(anyhow!("unknown replication layout: {}", other));
                }
                let vaults = parts.next().unwrap_or("1").parse()?;
                let mirrors = parts.next().unwrap_or("1").parse()?;
                ReplicationLayout::Fanout { vaults, mirrors }
            }
        };
        Ok(layout)
    }
}

/// Names of the copies a layout produced, in creation order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutCopies {
    pub first_node: Option<String>,
    pub second_node: Option<String>,
    pub fanout_vaults: Vec<String>,
    pub fanout_mirrors: Vec<String>,
    pub created: Vec<String>,
}

impl LayoutCopies {
    pub fn record(&mut self, role: LayoutRole, name: String) {
        match role {
            LayoutRole::FirstNode => self.first_node = Some(name.clone()),
            LayoutRole::SecondNode => self.second_node = Some(name.clone()),
            LayoutRole::FanoutVault => self.fanout_vaults.push(name.clone()),
            LayoutRole::FanoutMirror => self.fanout_mirrors.push(name.clone()),
        }
        self.created.push(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_layouts() {
        let plan = ReplicationLayout::Pvm.plan();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].link, ChainLink::Vault);
        assert_eq!(plan[0].parent, LayoutNode::Primary);
        assert_eq!(plan[1].link, ChainLink::Mirror);
        assert_eq!(plan[1].parent, LayoutNode::Step(0));
        assert_eq!(ReplicationLayout::Pvm.tiers(), 3);
        assert_eq!(ReplicationLayout::PvReplicaC2c.tiers(), 2);
    }

    #[test]
    fn test_fanout_layout() {
        let plan = ReplicationLayout::Fanout {
            vaults: 2,
            mirrors: 3,
        }
        .plan();
        assert_eq!(plan.len(), 5);
        assert!(plan.iter().all(|s| s.parent == LayoutNode::Primary));
        assert_eq!(
            plan.iter()
                .filter(|s| s.role == LayoutRole::FanoutMirror)
                .count(),
            3
        );
    }

    #[test]
    fn test_all_layout_parents_precede_children() {
        let plan = ReplicationLayout::All.plan();
        assert_eq!(plan.len(), 8);
        for (idx, step) in plan.iter().enumerate() {
            if let LayoutNode::Step(parent) = step.parent {
                assert!(parent < idx);
                assert_eq!(step.tier, 2);
            }
        }
    }

    #[test]
    fn test_parse_layouts() {
        assert_eq!(
            "PVM_Replica".parse::<ReplicationLayout>().unwrap(),
            ReplicationLayout::PvmReplica
        );
        assert_eq!(
            "fanout:2:1".parse::<ReplicationLayout>().unwrap(),
            ReplicationLayout::Fanout {
                vaults: 2,
                mirrors: 1
            }
        );
        assert!("pvx".parse::<ReplicationLayout>().is_err());
        assert!(ReplicationLayout::All.mirror_source_keeps_cycle());
        assert!(!ReplicationLayout::Pmm.mirror_source_keeps_cycle());
    }
}
