use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collection::CompactionReport;
use crate::error::{PartialDeletionError, Result, ValidationError};
use crate::model::{CollectionKind, Filter, Scope};
use crate::RecallDb;

/// Record count per collection, in purge order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionStats(BTreeMap<CollectionKind, usize>);

impl CollectionStats {
    pub fn get(&self, kind: CollectionKind) -> usize {
        self.0.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }

    pub fn is_all_zero(&self) -> bool {
        self.0.values().all(|n| *n == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (CollectionKind, usize)> + '_ {
        self.0.iter().map(|(k, n)| (*k, *n))
    }
}

impl FromIterator<(CollectionKind, usize)> for CollectionStats {
    fn from_iter<I: IntoIterator<Item = (CollectionKind, usize)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub user_id: String,
    pub deleted_count: usize,
    pub per_collection: CollectionStats,
}

impl RecallDb {
    pub fn get_collection_stats(&self) -> Result<CollectionStats> {
        CollectionKind::ALL
            .iter()
            .map(|&kind| self.collections.count(kind).map(|n| (kind, n)))
            .collect()
    }

    pub fn get_user_stats(&self, user_id: &str) -> Result<CollectionStats> {
        self.scoped_stats(&Scope::user(user_id))
    }

    /// Counts for `scope`, or for whole collections when `None`.
    pub fn stats(&self, scope: Option<&Scope>) -> Result<CollectionStats> {
        match scope {
            Some(scope) => self.scoped_stats(scope),
            None => self.get_collection_stats(),
        }
    }

    fn scoped_stats(&self, scope: &Scope) -> Result<CollectionStats> {
        let filter = scope.to_filter()?;
        CollectionKind::ALL
            .iter()
            .map(|&kind| self.collections.count_where(kind, &filter).map(|n| (kind, n)))
            .collect()
    }

    /// Erases every record of `user_id` from all five collections.
    ///
    /// Collections are purged in a fixed order and each must confirm zero
    /// remaining records before the next starts. The first failure stops the
    /// cascade with a [`PartialDeletionError`] naming what was cleared, so the
    /// caller can retry the rest.
    pub fn clear_user_data(&self, user_id: &str) -> Result<PurgeReport> {
        if user_id.trim().is_empty() {
            return Err(ValidationError::MissingField("user_id").into());
        }
        let filter = Filter::user(user_id);
        let mut cleared = Vec::with_capacity(CollectionKind::ALL.len());

        for kind in CollectionKind::ALL {
            match self.purge_collection(kind, &filter) {
                Ok(removed) => cleared.push((kind, removed)),
                Err(reason) => {
                    warn!(user_id, collection = %kind, %reason, "purge stopped part-way");
                    return Err(PartialDeletionError {
                        user_id: user_id.to_string(),
                        cleared,
                        failed: kind,
                        reason,
                    }
                    .into());
                }
            }
        }

        let report = PurgeReport {
            user_id: user_id.to_string(),
            deleted_count: cleared.iter().map(|(_, n)| n).sum(),
            per_collection: cleared.into_iter().collect(),
        };
        info!(user_id, deleted = report.deleted_count, "user data purged");
        Ok(report)
    }

    /// Alias of [`RecallDb::clear_user_data`] under its transport name.
    pub fn purge(&self, user_id: &str) -> Result<PurgeReport> {
        self.clear_user_data(user_id)
    }

    fn purge_collection(&self, kind: CollectionKind, filter: &Filter) -> std::result::Result<usize, String> {
        let removed = self.collections.delete_where(kind, filter).map_err(|e| e.to_string())?;
        let left = self.collections.count_where(kind, filter).map_err(|e| e.to_string())?;
        if left != 0 {
            return Err(format!("{left} records still present after delete"));
        }
        Ok(removed)
    }

    /// Drops every record of `kind` for all users, returning how many were live.
    pub fn clear(&self, kind: CollectionKind) -> Result<usize> {
        self.collections.clear(kind)
    }

    /// Rewrites every collection's segment without superseded frames.
    pub fn compact(&self) -> Result<Vec<CompactionReport>> {
        CollectionKind::ALL
            .iter()
            .map(|&kind| self.collections.compact(kind))
            .collect()
    }

    /// Compacts only collections with at least `min_dead` superseded frames.
    pub fn compact_garbage(&self, min_dead: u64) -> Result<Vec<CompactionReport>> {
        let mut reports = Vec::new();
        for kind in CollectionKind::ALL {
            if self.collections.dead_frames(kind)? >= min_dead.max(1) {
                reports.push(self.collections.compact(kind)?);
            }
        }
        Ok(reports)
    }
}
