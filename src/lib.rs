pub mod model;
pub mod storage;
pub mod vector;
pub mod index;
pub mod filter;
pub mod error;
pub mod config;
pub mod collection;
pub mod embedding;
pub mod artifact;
pub mod search;
pub mod context;
pub mod lifecycle;
pub mod manager;
pub mod protocol;
pub mod server;
pub mod parser;

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::artifact::{ReviewArtifact, ReviewReport};
use crate::collection::CollectionStore;
use crate::config::EngineConfig;
use crate::embedding::Embedder;
use crate::error::{Result, StorageError, ValidationError};
use crate::model::{unix_now, CollectionKind, Metadata, Record, StoredDocument, PROJECT_ID, USER_ID};
use crate::vector::Metric;

pub use crate::artifact::ReviewKind;
pub use crate::context::ContextBundle;
pub use crate::error::Error;
pub use crate::lifecycle::{CollectionStats, PurgeReport};
pub use crate::model::Scope;
pub use crate::search::SimilarRecord;

const REVIEW_TYPE: &str = "review_type";

/// Handle to one deployment of the context memory engine.
///
/// Construct it once with [`RecallDb::open`] and share it by reference or
/// `Arc`; every operation is safe to call concurrently.
pub struct RecallDb {
    config: EngineConfig,
    collections: CollectionStore,
    embedder: Arc<dyn Embedder>,
}

impl fmt::Debug for RecallDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecallDb")
            .field("data_dir", &self.config.data_dir)
            .field("metric", &self.collections.metric())
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

impl RecallDb {
    /// Opens (or creates) the deployment at `config.data_dir`, replaying
    /// every collection segment.
    pub fn open(config: EngineConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        let collections =
            CollectionStore::open(&config.data_dir, config.metric, config.strict_durability)?;
        info!(
            data_dir = %config.data_dir.display(),
            embedder = embedder.name(),
            "recall engine ready"
        );
        Ok(Self {
            config,
            collections,
            embedder,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metric(&self) -> Metric {
        self.collections.metric()
    }

    /// Vector length shared by every record, once the first write fixed it.
    pub fn dimension(&self) -> Result<Option<usize>> {
        self.collections.dimension()
    }

    pub fn embedder_name(&self) -> &str {
        self.embedder.name()
    }

    /// Embeds `document` and writes it to `kind`, returning the record id.
    ///
    /// Without an `id` a fresh UUID is used. A `project_context` record is
    /// always keyed by its `project_id`; a different explicit id is rejected.
    /// Review records without a `review_type` are tagged with their
    /// collection's default so context queries find them.
    pub fn store(
        &self,
        kind: CollectionKind,
        id: Option<&str>,
        document: &str,
        mut metadata: Metadata,
    ) -> Result<String> {
        let id = id.filter(|id| !id.trim().is_empty());
        let id = match kind {
            CollectionKind::ProjectContext => {
                let project_id = metadata
                    .get_str(PROJECT_ID)
                    .filter(|p| !p.is_empty())
                    .ok_or(ValidationError::MissingField(PROJECT_ID))?;
                if let Some(id) = id.filter(|id| *id != project_id) {
                    return Err(ValidationError::ProjectIdMismatch {
                        id: id.to_string(),
                        project_id: project_id.to_string(),
                    }
                    .into());
                }
                project_id.to_string()
            }
            _ => id.map_or_else(|| Uuid::new_v4().to_string(), str::to_string),
        };

        let default_review = match kind {
            CollectionKind::SecurityReviews => Some(ReviewKind::Security),
            CollectionKind::LogicReviews => Some(ReviewKind::Logic),
            _ => None,
        };
        if let Some(review) = default_review {
            if metadata.get(REVIEW_TYPE).is_none() {
                metadata.insert(REVIEW_TYPE, review.name());
            }
        }

        self.put(kind, id, document.to_string(), metadata)
    }

    fn put(
        &self,
        kind: CollectionKind,
        id: String,
        document: String,
        mut metadata: Metadata,
    ) -> Result<String> {
        if metadata.user_id().is_none() {
            return Err(ValidationError::MissingField(USER_ID).into());
        }
        if document.trim().is_empty() {
            return Err(ValidationError::MissingField("document").into());
        }
        if metadata.get("timestamp").is_none() {
            metadata.insert("timestamp", unix_now());
        }

        let vector = self.embedder.embed(&document)?;
        self.collections.upsert(
            kind,
            Record {
                id: id.clone(),
                vector,
                document,
                metadata,
            },
        )?;
        debug!(collection = %kind, %id, "stored");
        Ok(id)
    }

    pub fn get(&self, kind: CollectionKind, id: &str) -> Result<StoredDocument> {
        self.collections
            .get(kind, id)?
            .map(StoredDocument::from)
            .ok_or_else(|| {
                StorageError::NotFound {
                    collection: kind.name().to_string(),
                    id: id.to_string(),
                }
                .into()
            })
    }

    /// Stores a submitted file. Re-storing the same `(user, submission)`
    /// overwrites the earlier code.
    pub fn store_code_submission(
        &self,
        user_id: &str,
        project_id: &str,
        submission_id: &str,
        filename: &str,
        code: &str,
        language: Option<&str>,
    ) -> Result<String> {
        require(USER_ID, user_id)?;
        require(PROJECT_ID, project_id)?;
        require("submission_id", submission_id)?;
        require("code", code)?;

        let language = language.filter(|l| !l.is_empty()).unwrap_or("unknown");
        let id = Uuid::new_v5(
            &Uuid::NAMESPACE_OID,
            format!("{user_id}:{submission_id}").as_bytes(),
        );
        let document = format!("File: {filename}\nLanguage: {language}\nCode:\n{code}");
        let metadata = Metadata::new()
            .with(USER_ID, user_id)
            .with(PROJECT_ID, project_id)
            .with("submission_id", submission_id)
            .with("filename", filename)
            .with("language", language)
            .with("kind", "code_submission");

        self.put(CollectionKind::CodeSubmissions, id.to_string(), document, metadata)
    }

    /// Stores every finding of a review as its own record. Stops at the
    /// first failure; findings before it stay stored.
    pub fn store_review(
        &self,
        user_id: &str,
        project_id: &str,
        submission_id: Option<&str>,
        review_time: Option<&str>,
        artifacts: &[ReviewArtifact],
    ) -> Result<Vec<String>> {
        require(USER_ID, user_id)?;
        require(PROJECT_ID, project_id)?;

        let mut ids = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let mut metadata = artifact
                .metadata()
                .with(USER_ID, user_id)
                .with(PROJECT_ID, project_id);
            if let Some(submission_id) = submission_id {
                metadata.insert("submission_id", submission_id);
            }
            if let Some(review_time) = review_time {
                metadata.insert("review_time", review_time);
            }
            ids.push(self.put(
                artifact.collection(),
                Uuid::new_v4().to_string(),
                artifact.document(),
                metadata,
            )?);
        }
        Ok(ids)
    }

    pub fn store_review_report(
        &self,
        user_id: &str,
        project_id: &str,
        submission_id: Option<&str>,
        report: &ReviewReport,
    ) -> Result<Vec<String>> {
        self.store_review(
            user_id,
            project_id,
            submission_id,
            report.review_time.as_deref(),
            &report.artifacts(),
        )
    }

    /// Records an interaction such as a stated preference. Engine-owned keys
    /// win over same-named keys in `extra`.
    pub fn store_user_interaction(
        &self,
        user_id: &str,
        interaction_type: &str,
        context: &str,
        extra: Metadata,
    ) -> Result<String> {
        require(USER_ID, user_id)?;
        require("interaction_type", interaction_type)?;

        let mut metadata = Metadata::new()
            .with(USER_ID, user_id)
            .with("interaction_type", interaction_type)
            .with("kind", "user_interaction");
        metadata.merge_missing(&extra);

        self.put(
            CollectionKind::UserContext,
            Uuid::new_v4().to_string(),
            context.to_string(),
            metadata,
        )
    }

    /// Writes the one context record of `project_id`, replacing any earlier
    /// one. A project already owned by another user is refused.
    pub fn store_project_context(
        &self,
        user_id: &str,
        project_id: &str,
        project_name: &str,
        description: &str,
        files: &[String],
    ) -> Result<String> {
        require(USER_ID, user_id)?;
        require(PROJECT_ID, project_id)?;

        let document = format!(
            "Project: {project_name}\nDescription: {description}\nFiles: {}",
            files.join(", ")
        );
        let metadata = Metadata::new()
            .with(USER_ID, user_id)
            .with(PROJECT_ID, project_id)
            .with("project_name", project_name)
            .with("file_count", files.len())
            .with("kind", "project_context");

        self.put(CollectionKind::ProjectContext, project_id.to_string(), document, metadata)
    }

    /// Exact lookup; a project owned by another user reads as absent.
    pub fn get_project_context(
        &self,
        user_id: &str,
        project_id: &str,
    ) -> Result<Option<StoredDocument>> {
        if project_id.trim().is_empty() {
            return Ok(None);
        }
        Ok(self
            .collections
            .get(CollectionKind::ProjectContext, project_id)?
            .filter(|record| record.metadata.user_id() == Some(user_id))
            .map(StoredDocument::from))
    }

    /// Forces every segment to stable storage. Writes are already durable
    /// under strict durability; this matters only when it is off.
    pub fn flush(&self) -> Result<()> {
        self.collections.flush()
    }

    pub fn close(self) -> Result<()> {
        self.flush()?;
        info!(data_dir = %self.config.data_dir.display(), "recall engine closed");
        Ok(())
    }
}

fn require(field: &'static str, value: &str) -> std::result::Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField(field));
    }
    Ok(())
}
