//! Task manager
//!
//! Owns the tree file, the mirror and the gateway, and runs the whole cycle
//! for an utterance: load, interpret, parse, resolve ids, reconcile, roll up,
//! persist the tree, then write through to the mirror.

use std::collections::HashMap;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::api::{parse_response, Gateway, GatewayError, HttpGateway, ParsedResponse, Payload};
use crate::config::Config;
use crate::identity::{IdMapping, IdentityResolver};
use crate::models::{Operation, TaskFields, TaskNode, TaskQuery, TaskTree, TreeStats};
use crate::reconcile::{
    BatchReport, ChangeSet, ParsedOperation, ReconcileError, Reconciler, Strategy, TaskSummary,
};
use crate::store::{Mirror, StoreError, SyncReport, TaskRecord, TreeStore};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("no language model gateway configured")]
    NoGateway,

    #[error("nothing to interpret: input is empty")]
    EmptyInput,
}

/// Result of one utterance or applied response
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub strategy: Strategy,
    pub report: BatchReport,
    /// The model's reply to the user
    pub message: Option<String>,
    /// Why the model's reply could not be fully used
    pub diagnostic: Option<String>,
    pub tree: TaskTree,
}

impl ChatOutcome {
    pub fn changed(&self) -> bool {
        !self.report.changes.is_empty() || self.strategy == Strategy::FullReplacement
    }
}

/// Snapshot for display
#[derive(Debug, Clone, Serialize)]
pub struct Overview {
    pub stats: TreeStats,
    pub mirror_rows: usize,
}

pub struct TaskManager<G = HttpGateway> {
    trees: TreeStore,
    mirror: Mirror,
    gateway: Option<G>,
    reconciler: Reconciler,
}

impl<G: Gateway> TaskManager<G> {
    /// Opens the stores under `config.data_dir`, without a gateway
    pub fn open(config: &Config) -> Result<Self, ManagerError> {
        let trees = TreeStore::new(config.tree_path()).with_lock_timeout(config.lock_timeout);
        let mirror = Mirror::open(config.mirror_path())?;
        Ok(Self::from_parts(trees, mirror, Reconciler::new(config.reconcile)))
    }

    pub fn from_parts(trees: TreeStore, mirror: Mirror, reconciler: Reconciler) -> Self {
        Self {
            trees,
            mirror,
            gateway: None,
            reconciler,
        }
    }

    pub fn with_gateway(mut self, gateway: G) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn gateway(&self) -> Option<&G> {
        self.gateway.as_ref()
    }

    /// Interprets `input` with the model and applies what it proposes
    pub async fn process_input(&mut self, input: &str) -> Result<ChatOutcome, ManagerError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ManagerError::EmptyInput);
        }
        let gateway = self.gateway.as_ref().ok_or(ManagerError::NoGateway)?;

        // The model call can be slow, so the lock is only taken once the
        // reply is in hand; the tree is reloaded under the lock.
        let snapshot = self.load()?;
        let raw = gateway.interpret(&snapshot, input).await?;
        info!(chars = raw.len(), "received model reply");

        self.apply_response(parse_response(&raw))
    }

    /// Applies an already parsed model reply
    pub fn apply_response(&mut self, parsed: ParsedResponse) -> Result<ChatOutcome, ManagerError> {
        let ParsedResponse {
            payload,
            message,
            diagnostic,
        } = parsed;

        let (strategy, report, tree) = match payload {
            Payload::Operations(operations) => {
                let (report, tree) = self.apply_operations(operations)?;
                (Strategy::OperationList, report, tree)
            }
            Payload::Tree(root) => {
                let (mapping, tree) = self.replace_tree(root)?;
                let report = BatchReport {
                    mapping,
                    ..BatchReport::default()
                };
                (Strategy::FullReplacement, report, tree)
            }
        };

        Ok(ChatOutcome {
            strategy,
            report,
            message,
            diagnostic,
            tree,
        })
    }

    /// Loads the tree; when a corrupt file had to be replaced, the mirror is
    /// cleared so it cannot outlive the tasks it described.
    fn load(&self) -> Result<TaskTree, ManagerError> {
        let loaded = self.trees.load_checked()?;
        if loaded.healed {
            let cleared = self.mirror.clear()?;
            warn!(cleared, "tree file was corrupt, cleared the mirror");
        }
        Ok(loaded.tree)
    }

    fn resolver(&self, tree: &TaskTree) -> Result<IdentityResolver, ManagerError> {
        Ok(IdentityResolver::from_tree(tree).with_known_ids(self.mirror.ids()?))
    }

    /// Applies a batch best-effort and persists whatever succeeded
    pub fn apply_operations(
        &mut self,
        operations: Vec<ParsedOperation>,
    ) -> Result<(BatchReport, TaskTree), ManagerError> {
        let _lock = self.trees.lock()?;
        let mut tree = self.load()?;
        let resolver = self.resolver(&tree)?;

        let report = self.reconciler.apply_operations(&mut tree, operations, &resolver);
        self.persist(&tree, &report.changes)?;
        Ok((report, tree))
    }

    /// Adopts a proposed tree wholesale and resyncs the mirror
    pub fn replace_tree(&mut self, proposed: TaskNode) -> Result<(IdMapping, TaskTree), ManagerError> {
        let _lock = self.trees.lock()?;
        let prior = self.load()?;
        let resolver = self.resolver(&prior)?;

        let (tree, mapping) = self.reconciler.replace_tree(&prior, proposed, &resolver);
        self.trees.save(&tree)?;

        if let Err(err) = self.resync_after_replace(&tree, &mapping, &resolver) {
            error!(error = %err, "tree saved but mirror sync failed; run `sync` to repair");
            return Err(err.into());
        }
        Ok((mapping, tree))
    }

    /// Saves the tree, then writes the changed rows through to the mirror
    fn persist(&mut self, tree: &TaskTree, changes: &ChangeSet) -> Result<(), ManagerError> {
        if changes.is_empty() {
            return Ok(());
        }
        self.trees.save(tree)?;

        if let Err(err) = self.write_through(tree, changes) {
            error!(error = %err, "tree saved but mirror write failed; run `sync` to repair");
            return Err(err.into());
        }
        Ok(())
    }

    fn write_through(&mut self, tree: &TaskTree, changes: &ChangeSet) -> Result<(), StoreError> {
        self.mirror.delete_many(&changes.removed)?;
        self.mirror
            .sync_nodes(tree, &changes.touched, &changes.extensions)?;
        Ok(())
    }

    /// Carries rows of renamed known ids forward, then resyncs everything
    fn resync_after_replace(
        &mut self,
        tree: &TaskTree,
        mapping: &IdMapping,
        resolver: &IdentityResolver,
    ) -> Result<SyncReport, StoreError> {
        for (old, new) in mapping.renames() {
            if resolver.is_known(old) && !tree.contains(old) {
                self.mirror.migrate_id(old, new)?;
            }
        }
        self.mirror.sync_tree(tree, &HashMap::new())
    }

    fn mutate<T>(
        &mut self,
        apply: impl FnOnce(&Reconciler, &mut TaskTree, &mut ChangeSet) -> Result<T, ReconcileError>,
    ) -> Result<T, ManagerError> {
        let _lock = self.trees.lock()?;
        let mut tree = self.load()?;
        let mut changes = ChangeSet::default();
        let value = apply(&self.reconciler, &mut tree, &mut changes)?;
        self.persist(&tree, &changes)?;
        Ok(value)
    }

    pub fn add_task(&mut self, parent_id: &str, fields: TaskFields) -> Result<String, ManagerError> {
        self.mutate(|reconciler, tree, changes| {
            reconciler.add(tree, parent_id, None, &fields, changes)
        })
    }

    pub fn update_task(&mut self, id: &str, fields: TaskFields) -> Result<(), ManagerError> {
        self.mutate(|reconciler, tree, changes| reconciler.update(tree, id, &fields, changes))
    }

    /// Deletes a task and its descendants, returning how many were removed
    pub fn delete_task(&mut self, id: &str) -> Result<usize, ManagerError> {
        self.mutate(|reconciler, tree, changes| reconciler.delete(tree, id, changes))
    }

    pub fn query(&self, query: &TaskQuery) -> Result<Vec<TaskSummary>, ManagerError> {
        let tree = self.load()?;
        Ok(self.reconciler.query(&tree, query))
    }

    pub fn tree(&self) -> Result<TaskTree, ManagerError> {
        self.load()
    }

    pub fn task(&self, id: &str) -> Result<Option<TaskNode>, ManagerError> {
        Ok(self.load()?.find(id).cloned())
    }

    pub fn record(&self, id: &str) -> Result<Option<TaskRecord>, ManagerError> {
        Ok(self.mirror.get(id)?)
    }

    pub fn records(&self) -> Result<Vec<TaskRecord>, ManagerError> {
        Ok(self.mirror.all()?)
    }

    pub fn overview(&self) -> Result<Overview, ManagerError> {
        Ok(Overview {
            stats: self.load()?.stats(),
            mirror_rows: self.mirror.count()?,
        })
    }

    /// Replaces the tree with a root-only tree and clears the mirror
    pub fn reset_tree(&mut self) -> Result<TaskTree, ManagerError> {
        let _lock = self.trees.lock()?;
        let tree = self.trees.reset()?;
        let cleared = self.mirror.clear()?;
        warn!(cleared, "reset task tree");
        Ok(tree)
    }

    /// Rebuilds the mirror from the tree, dropping rows for vanished tasks
    pub fn resync(&mut self) -> Result<SyncReport, ManagerError> {
        let _lock = self.trees.lock()?;
        let tree = self.load()?;
        Ok(self.mirror.sync_tree(&tree, &HashMap::new())?)
    }
}

/// Convenience for callers that build single operations by hand
pub fn operations<I>(ops: I) -> Vec<ParsedOperation>
where
    I: IntoIterator<Item = Operation>,
{
    ops.into_iter().map(Ok).collect()
}
