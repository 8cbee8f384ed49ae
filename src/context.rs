//! Historical context for one review request.
//!
//! Every source is fetched on its own; a failing source is logged and left
//! empty so the review can go ahead with whatever context is available.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::artifact::ReviewKind;
use crate::error::{Result, ValidationError};
use crate::model::{CollectionKind, Filter, Scope, StoredDocument};
use crate::search::SimilarRecord;
use crate::RecallDb;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextBundle {
    pub similar_code: Vec<SimilarRecord>,
    pub past_issues: Vec<SimilarRecord>,
    pub project_context: Option<StoredDocument>,
    pub user_preferences: Vec<SimilarRecord>,
    /// Sources that failed and were left empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

impl ContextBundle {
    pub fn is_empty(&self) -> bool {
        self.similar_code.is_empty()
            && self.past_issues.is_empty()
            && self.project_context.is_none()
            && self.user_preferences.is_empty()
    }

    fn settle<T: Default>(&mut self, source: &str, outcome: Result<T>) -> T {
        match outcome {
            Ok(value) => value,
            Err(e) => {
                warn!(source, error = %e, "context source unavailable");
                self.degraded.push(source.to_string());
                T::default()
            }
        }
    }
}

impl RecallDb {
    /// Assembles the context bundle for reviewing `code_snippet`.
    ///
    /// Only an invalid scope or an empty snippet is an error. Each source keeps its own ordering
    /// and holds at most the configured per-source count.
    pub fn get_enhanced_context(
        &self,
        user_id: &str,
        project_id: &str,
        code_snippet: &str,
        review_type: ReviewKind,
    ) -> Result<ContextBundle> {
        let scope = Scope::project(user_id, project_id);
        let scoped = scope.to_filter()?;
        if code_snippet.trim().is_empty() {
            return Err(ValidationError::MissingField("code_snippet").into());
        }
        let k = self.config.context_results;
        let mut bundle = ContextBundle::default();

        let similar = self.search(CollectionKind::CodeSubmissions, code_snippet, &scoped, k);
        bundle.similar_code = bundle.settle("similar_code", similar);

        let issues_filter = match review_type {
            ReviewKind::Security => scoped.clone(),
            ReviewKind::Logic | ReviewKind::Testing => {
                scoped.clone().and("review_type", review_type.name())
            }
        };
        let issues = self.search(review_type.collection(), code_snippet, &issues_filter, k);
        bundle.past_issues = bundle.settle("past_issues", issues);

        let project = self.get_project_context(user_id, project_id);
        bundle.project_context = bundle.settle("project_context", project);

        let preferences = self.search(
            CollectionKind::UserContext,
            &format!("preferences for {review_type} review"),
            &Filter::user(user_id),
            self.config.preference_results,
        );
        bundle.user_preferences = bundle.settle("user_preferences", preferences);

        debug!(
            user_id,
            project_id,
            %review_type,
            similar = bundle.similar_code.len(),
            issues = bundle.past_issues.len(),
            preferences = bundle.user_preferences.len(),
            degraded = bundle.degraded.len(),
            "context assembled"
        );
        Ok(bundle)
    }

    /// Alias of [`RecallDb::get_enhanced_context`] under its transport name.
    pub fn get_context(
        &self,
        user_id: &str,
        project_id: &str,
        code_snippet: &str,
        review_type: ReviewKind,
    ) -> Result<ContextBundle> {
        self.get_enhanced_context(user_id, project_id, code_snippet, review_type)
    }
}
