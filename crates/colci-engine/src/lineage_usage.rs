//! Column usage from the Discovery API's column lineage
//!
//! Pruning is synchronous, so lineage is fetched ahead of time. Lookups the
//! pruner needs but that were not prefetched are answered conservatively (the
//! column counts as consumed) and recorded; the orchestrator fetches them and
//! prunes again until nothing is missing.

use colci_cloud::{CollaboratorError, LineageSource};
use colci_core::{canonical_column, Node, NodeId};
use colci_sql::{ColumnUsage, Consumption, UsageVerdict};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::debug;

/// (upstream unique id, canonical column)
type LineageKey = (NodeId, String);

#[derive(Debug, Default)]
pub struct LineageUsage {
    consumers: BTreeMap<LineageKey, BTreeSet<NodeId>>,
    missing: Mutex<BTreeSet<LineageKey>>,
}

impl LineageUsage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the direct consumers of one column
    pub fn insert(&mut self, unique_id: &str, column: &str, consumers: BTreeSet<NodeId>) {
        self.consumers
            .insert((unique_id.to_string(), canonical_column(column)), consumers);
    }

    /// Fetch every given (node, column) pair that is not known yet
    pub async fn fetch(
        &mut self,
        source: &dyn LineageSource,
        keys: impl IntoIterator<Item = LineageKey>,
    ) -> Result<usize, CollaboratorError> {
        let mut fetched = 0;
        for (unique_id, column) in keys {
            let key = (unique_id, canonical_column(&column));
            if self.consumers.contains_key(&key) {
                continue;
            }

            let consumers = source.column_consumers(&key.0, &key.1).await?;
            debug!(node = %key.0, column = %key.1, consumers = consumers.len(), "Fetched column lineage");
            self.consumers.insert(key, consumers);
            fetched += 1;
        }
        Ok(fetched)
    }

    /// Lookups answered without lineage since the last call; clears the record
    pub fn take_missing(&self) -> BTreeSet<LineageKey> {
        match self.missing.lock() {
            Ok(mut missing) => std::mem::take(&mut *missing),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }

    fn record_missing(&self, key: LineageKey) {
        match self.missing.lock() {
            Ok(mut missing) => {
                missing.insert(key);
            }
            Err(poisoned) => {
                poisoned.into_inner().insert(key);
            }
        }
    }
}

impl ColumnUsage for LineageUsage {
    fn consumption(&self, upstream: &Node, downstream: &Node, changed: &BTreeSet<String>) -> UsageVerdict {
        let mut consumed = BTreeSet::new();

        for column in changed {
            let key = (upstream.unique_id.clone(), canonical_column(column));
            match self.consumers.get(&key) {
                Some(consumers) => {
                    if consumers.contains(&downstream.unique_id) {
                        consumed.insert(key.1);
                    }
                }
                None => {
                    consumed.insert(key.1.clone());
                    self.record_missing(key);
                }
            }
        }

        // Lineage does not say which downstream outputs a column feeds, so
        // names carry over unchanged.
        if consumed.is_empty() {
            UsageVerdict::exact(Consumption::None)
        } else {
            UsageVerdict::exact(Consumption::Columns(consumed))
        }
    }
}
