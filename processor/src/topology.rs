use std::{collections::HashSet, sync::Arc};

use data_model::{
    ChainLink,
    CopyKind,
    LayoutCopies,
    LayoutNode,
    ReplicationLayout,
    Retention,
    ScenarioContext,
    StorageCopy,
    StorageCopyBuilder,
};
use state_store::CopyPersistence;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Storage-policy copies and their source edges.
///
/// Copies form a DAG rooted at snap copies. Every mutation goes through the
/// persistence layer; nothing is cached between calls.
pub struct CopyTopology {
    copies: Arc<dyn CopyPersistence>,
    policy: String,
}

/// Whether following source edges from `from` reaches `target`.
fn reaches(copies: &[StorageCopy], from: &str, target: &str) -> bool {
    let mut seen = HashSet::new();
    let mut current = Some(from.to_string());
    while let Some(name) = current {
        if name == target {
            return true;
        }
        if !seen.insert(name.clone()) {
            return false;
        }
        current = copies
            .iter()
            .find(|c| c.name == name)
            .and_then(|c| c.source_copy.clone());
    }
    false
}

impl CopyTopology {
    pub fn new(copies: Arc<dyn CopyPersistence>, policy: impl Into<String>) -> Self {
        Self {
            copies,
            policy: policy.into(),
        }
    }

    pub fn policy(&self) -> &str {
        &self.policy
    }

    pub async fn copies(&self) -> Result<Vec<StorageCopy>> {
        Ok(self.copies.list_copies(&self.policy).await?)
    }

    pub async fn get_copy(&self, name: &str) -> Result<StorageCopy> {
        self.copies
            .get_copy(&self.policy, name)
            .await?
            .ok_or_else(|| Error::CopyNotFound {
                policy: self.policy.clone(),
                name: name.to_string(),
            })
    }

    /// Creates a copy, or returns the existing one when a copy of the same
    /// name and shape is already on the policy.
    pub async fn create_copy(
        &self,
        name: &str,
        kind: CopyKind,
        source_copy: Option<&str>,
        array_name: &str,
        retention: Retention,
    ) -> Result<StorageCopy> {
        let existing = self.copies().await?;

        if let Some(copy) = existing.iter().find(|c| c.name == name) {
            if copy.same_shape(kind, source_copy, array_name) {
                debug!(copy = name, policy = %self.policy, "copy exists, reusing");
                return Ok(copy.clone());
            }
            if let Some(source) = source_copy {
                if reaches(&existing, source, name) {
                    return Err(Error::TopologyCycle {
                        name: name.to_string(),
                        source_copy: source.to_string(),
                    });
                }
            }
            return Err(Error::DuplicateCopy {
                policy: self.policy.clone(),
                name: name.to_string(),
            });
        }

        match (kind.is_root(), source_copy) {
            (true, Some(_)) => {
                return Err(Error::InvalidCopy {
                    name: name.to_string(),
                    reason: "snap copies have no source".to_string(),
                })
            }
            (false, None) => {
                return Err(Error::InvalidCopy {
                    name: name.to_string(),
                    reason: format!("{} copies need a source copy", kind),
                })
            }
            _ => {}
        }

        if let Some(source) = source_copy {
            if source == name {
                return Err(Error::TopologyCycle {
                    name: name.to_string(),
                    source_copy: source.to_string(),
                });
            }
            if !existing.iter().any(|c| c.name == source) {
                return Err(Error::MissingSourceCopy {
                    name: name.to_string(),
                    source_copy: source.to_string(),
                });
            }
        }

        let copy = StorageCopyBuilder::default()
            .policy(self.policy.clone())
            .name(name.to_string())
            .kind(kind)
            .source_copy(source_copy.map(|s| s.to_string()))
            .retention(retention)
            .array_name(array_name.to_string())
            .build()?;
        let copy = self.copies.create_copy(copy).await?;
        info!(
            copy = %copy.name,
            kind = %copy.kind,
            source = copy.source_copy.as_deref().unwrap_or("-"),
            array = %copy.array_name,
            "created copy"
        );
        Ok(copy)
    }

    /// Creates a chain below `source_copy`, each copy sourced from the
    /// previous one. Copy `i` lives on `arrays[i]`, or the last array when
    /// fewer are given.
    pub async fn create_secondary_chain(
        &self,
        source_copy: &str,
        links: &[ChainLink],
        arrays: &[String],
        retention: Retention,
    ) -> Result<Vec<StorageCopy>> {
        if arrays.is_empty() && !links.is_empty() {
            return Err(Error::InvalidCopy {
                name: source_copy.to_string(),
                reason: "no arrays given for the chain".to_string(),
            });
        }
        let mut created = Vec::with_capacity(links.len());
        let mut parent = source_copy.to_string();
        for (idx, link) in links.iter().enumerate() {
            let name = format!("{}{}_{}", link.name_prefix(), source_copy, idx + 1);
            let array = &arrays[idx.min(arrays.len() - 1)];
            let copy = self
                .create_copy(&name, link.copy_kind(), Some(&parent), array, retention)
                .await?;
            parent = copy.name.clone();
            created.push(copy);
        }
        Ok(created)
    }

    /// Creates the copies of `layout` below the scenario's primary copy.
    /// `arrays[tier]` hosts the copies of each tier, the primary being tier 0.
    pub async fn build_layout(
        &self,
        ctx: &mut ScenarioContext,
        layout: ReplicationLayout,
        arrays: &[String],
        retention: Retention,
    ) -> Result<LayoutCopies> {
        let plan = layout.plan();
        if arrays.len() < layout.tiers() {
            return Err(Error::InvalidCopy {
                name: ctx.primary_copy.clone(),
                reason: format!(
                    "layout {} spans {} arrays, {} configured",
                    layout,
                    layout.tiers(),
                    arrays.len()
                ),
            });
        }

        let mut names: Vec<String> = Vec::with_capacity(plan.len());
        let mut copies = LayoutCopies::default();
        for (idx, step) in plan.iter().enumerate() {
            let parent = match step.parent {
                LayoutNode::Primary => ctx.primary_copy.clone(),
                LayoutNode::Step(parent) => names[parent].clone(),
            };
            let name = format!("{}{}", step.link.name_prefix(), idx + 1);
            let copy = self
                .create_copy(
                    &name,
                    step.link.copy_kind(),
                    Some(&parent),
                    &arrays[step.tier],
                    retention,
                )
                .await?;
            names.push(copy.name.clone());
            copies.record(step.role, copy.name);
        }

        info!(%layout, copies = ?copies.created, "built replication layout");
        ctx.layout = Some(layout);
        ctx.copies = copies.clone();
        Ok(copies)
    }

    /// Deletes a leaf copy. Missing copies are already deleted.
    pub async fn delete_copy(&self, name: &str) -> Result<()> {
        let existing = self.copies().await?;
        if !existing.iter().any(|c| c.name == name) {
            debug!(copy = name, "copy already deleted");
            return Ok(());
        }
        let dependents = existing
            .iter()
            .filter(|c| c.source_copy.as_deref() == Some(name))
            .map(|c| c.name.clone())
            .collect::<Vec<_>>();
        if !dependents.is_empty() {
            return Err(Error::CopyHasDependents {
                name: name.to_string(),
                dependents,
            });
        }
        self.copies.delete_copy(&self.policy, name).await?;
        info!(copy = name, "deleted copy");
        Ok(())
    }

    /// Deletes every copy of the policy, dependents before their sources.
    pub async fn cleanup(&self) -> Result<Vec<String>> {
        let mut remaining = self.copies().await?;
        let mut deleted = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let leaves = remaining
                .iter()
                .filter(|c| {
                    !remaining
                        .iter()
                        .any(|other| other.source_copy.as_deref() == Some(c.name.as_str()))
                })
                .map(|c| c.name.clone())
                .collect::<Vec<_>>();
            let Some(first) = leaves.first() else {
                return Err(Error::TopologyCycle {
                    name: remaining[0].name.clone(),
                    source_copy: remaining[0].source_copy.clone().unwrap_or_default(),
                });
            };
            debug!(leaf = %first, count = leaves.len(), "deleting leaf copies");
            for name in &leaves {
                self.delete_copy(name).await?;
            }
            remaining.retain(|c| !leaves.contains(&c.name));
            deleted.extend(leaves);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use data_model::{
        test_objects::tests::{mock_scenario, test_arrays, TEST_ARRAY, TEST_POLICY},
        ChainLink,
        CopyKind,
        ReplicaMode,
        ReplicationLayout,
        Retention,
    };
    use state_store::SimulatedBackend;

    use super::CopyTopology;
    use crate::error::Error;

    fn topology() -> CopyTopology {
        CopyTopology::new(Arc::new(SimulatedBackend::default()), TEST_POLICY)
    }

    async fn chain(topology: &CopyTopology) {
        topology
            .create_copy("Snap1", CopyKind::Snap, None, TEST_ARRAY, Retention::default())
            .await
            .unwrap();
        topology
            .create_copy(
                "Vault1",
                CopyKind::Vault,
                Some("Snap1"),
                TEST_ARRAY,
                Retention::default(),
            )
            .await
            .unwrap();
        topology
            .create_copy(
                "Mirror1",
                CopyKind::Mirror,
                Some("Vault1"),
                TEST_ARRAY,
                Retention::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_chain_and_cycle_rejection() {
        let topology = topology();
        chain(&topology).await;

        let copies = topology.copies().await.unwrap();
        let edges = copies
            .iter()
            .map(|c| (c.name.as_str(), c.source_copy.as_deref()))
            .collect::<Vec<_>>();
        assert_eq!(
            edges,
            vec![
                ("Snap1", None),
                ("Vault1", Some("Snap1")),
                ("Mirror1", Some("Vault1")),
            ]
        );

        let res = topology
            .create_copy(
                "Snap1",
                CopyKind::Snap,
                Some("Mirror1"),
                TEST_ARRAY,
                Retention::default(),
            )
            .await;
        assert!(matches!(res, Err(Error::TopologyCycle { .. })));

        let res = topology
            .create_copy(
                "Vault2",
                CopyKind::Vault,
                Some("Vault2"),
                TEST_ARRAY,
                Retention::default(),
            )
            .await;
        assert!(matches!(res, Err(Error::TopologyCycle { .. })));
    }

    #[tokio::test]
    async fn test_create_copy_is_idempotent() {
        let topology = topology();
        chain(&topology).await;

        let again = topology
            .create_copy(
                "Vault1",
                CopyKind::Vault,
                Some("Snap1"),
                TEST_ARRAY,
                Retention::single_cycle(),
            )
            .await
            .unwrap();
        assert_eq!(again.retention, Retention::default());
        assert_eq!(topology.copies().await.unwrap().len(), 3);

        let res = topology
            .create_copy(
                "Vault1",
                CopyKind::Mirror,
                Some("Snap1"),
                TEST_ARRAY,
                Retention::default(),
            )
            .await;
        assert!(matches!(res, Err(Error::DuplicateCopy { .. })));
    }

    #[tokio::test]
    async fn test_invalid_sources() {
        let topology = topology();
        let res = topology
            .create_copy(
                "Vault1",
                CopyKind::Vault,
                Some("Nope"),
                TEST_ARRAY,
                Retention::default(),
            )
            .await;
        assert!(matches!(res, Err(Error::MissingSourceCopy { .. })));

        let res = topology
            .create_copy("Vault1", CopyKind::Vault, None, TEST_ARRAY, Retention::default())
            .await;
        assert!(matches!(res, Err(Error::InvalidCopy { .. })));
        assert!(res.unwrap_err().is_precondition());
    }

    #[tokio::test]
    async fn test_delete_leaf_only_and_cleanup() {
        let topology = topology();
        chain(&topology).await;

        let res = topology.delete_copy("Vault1").await;
        assert!(matches!(
            res,
            Err(Error::CopyHasDependents { ref dependents, .. }) if dependents == &vec!["Mirror1".to_string()]
        ));

        topology.delete_copy("Mirror1").await.unwrap();
        topology.delete_copy("Mirror1").await.unwrap();

        let deleted = topology.cleanup().await.unwrap();
        assert_eq!(deleted, vec!["Vault1".to_string(), "Snap1".to_string()]);
        assert!(topology.copies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secondary_chain() {
        let topology = topology();
        topology
            .create_copy("Snap1", CopyKind::Snap, None, TEST_ARRAY, Retention::default())
            .await
            .unwrap();
        let created = topology
            .create_secondary_chain(
                "Snap1",
                &[ChainLink::ReplicaVault, ChainLink::ReplicaMirror],
                &test_arrays()[1..],
                Retention::default(),
            )
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(created[0].name, "Replica_Vault_Snap1_1");
        assert_eq!(created[0].kind, CopyKind::Replica(ReplicaMode::Vault));
        assert_eq!(created[1].source_copy.as_deref(), Some("Replica_Vault_Snap1_1"));
        assert_eq!(created[1].array_name, test_arrays()[2]);
    }

    #[tokio::test]
    async fn test_build_layouts() {
        let topology = topology();
        let mut ctx = mock_scenario();
        topology
            .create_copy("Snap1", CopyKind::Snap, None, TEST_ARRAY, Retention::default())
            .await
            .unwrap();

        let copies = topology
            .build_layout(&mut ctx, ReplicationLayout::All, &test_arrays(), Retention::default())
            .await
            .unwrap();
        assert_eq!(copies.created.len(), 8);
        assert_eq!(copies.fanout_vaults.len(), 4);
        assert_eq!(copies.fanout_mirrors.len(), 4);
        assert_eq!(ctx.secondary_copies().len(), 8);
        assert_eq!(ctx.layout, Some(ReplicationLayout::All));

        let pvm = topology
            .build_layout(
                &mut mock_scenario(),
                ReplicationLayout::Pvm,
                &test_arrays()[..2],
                Retention::default(),
            )
            .await;
        assert!(matches!(pvm, Err(Error::InvalidCopy { .. })));
    }
}
