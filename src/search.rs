use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::model::{CollectionKind, Filter, Metadata, Record, Scope};
use crate::vector::Metric;
use crate::RecallDb;

/// One ranked hit of a similarity search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarRecord {
    pub id: String,
    pub document: String,
    pub metadata: Metadata,
    /// Raw metric distance, lower is closer.
    pub distance: f32,
    /// Metric-aware similarity in `[0, 100]`.
    pub similarity: f32,
}

impl SimilarRecord {
    fn from_hit(record: Record, distance: f32, metric: Metric) -> Self {
        Self {
            id: record.id,
            document: record.document,
            metadata: record.metadata,
            distance,
            similarity: metric.similarity_percent(distance),
        }
    }
}

impl RecallDb {
    /// Nearest records of `kind` to `text`, restricted to `scope`, closest first.
    ///
    /// `n_results` defaults to the configured default and must lie in
    /// `1..=max_results`. Embedding failures propagate unchanged.
    pub fn find_similar(
        &self,
        kind: CollectionKind,
        text: &str,
        scope: &Scope,
        n_results: Option<usize>,
    ) -> Result<Vec<SimilarRecord>> {
        let k = self.check_results(n_results)?;
        let filter = scope.to_filter()?;
        self.search(kind, text, &filter, k)
    }

    /// Alias of [`RecallDb::find_similar`] under its transport name.
    pub fn query_similar(
        &self,
        kind: CollectionKind,
        text: &str,
        scope: &Scope,
        n_results: Option<usize>,
    ) -> Result<Vec<SimilarRecord>> {
        self.find_similar(kind, text, scope, n_results)
    }

    pub(crate) fn check_results(&self, n_results: Option<usize>) -> Result<usize> {
        let max = self.config.max_results;
        let k = n_results.unwrap_or(self.config.default_results);
        if k == 0 || k > max {
            return Err(ValidationError::ResultsOutOfRange { actual: k, max }.into());
        }
        Ok(k)
    }

    pub(crate) fn search(
        &self,
        kind: CollectionKind,
        text: &str,
        filter: &Filter,
        k: usize,
    ) -> Result<Vec<SimilarRecord>> {
        if text.trim().is_empty() {
            return Err(ValidationError::MissingField("text").into());
        }
        filter.validate()?;

        let vector = self.embedder.embed(text)?;
        let metric = self.collections.metric();
        let hits: Vec<SimilarRecord> = self
            .collections
            .query(kind, &vector, k, filter)?
            .into_iter()
            .map(|(record, distance)| SimilarRecord::from_hit(record, distance, metric))
            .collect();

        debug!(collection = %kind, k, hits = hits.len(), "similarity search");
        Ok(hits)
    }
}
