use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pretty_assertions::assert_eq;
use tempfile::TempDir;

use recall::artifact::{LogicFinding, ReviewArtifact, ReviewReport, SecurityFinding};
use recall::config::EngineConfig;
use recall::embedding::{Embedder, HashEmbedder};
use recall::error::{EmbeddingError, StorageError, ValidationError};
use recall::model::{CollectionKind, Metadata};
use recall::{Error, RecallDb, ReviewKind, Scope};

const DIM: usize = 64;

fn open(dir: &TempDir) -> RecallDb {
    open_with(dir, Arc::new(HashEmbedder::new(DIM)))
}

fn open_with(dir: &TempDir, embedder: Arc<dyn Embedder>) -> RecallDb {
    RecallDb::open(EngineConfig::new(dir.path()), embedder).unwrap()
}

fn owned(user: &str, project: &str) -> Metadata {
    Metadata::new().with("user_id", user).with("project_id", project)
}

/// Hashing embedder that fails exactly on one numbered call.
struct FlakyEmbedder {
    inner: HashEmbedder,
    calls: AtomicUsize,
    fail_on: AtomicUsize,
}

impl FlakyEmbedder {
    fn new() -> Self {
        Self {
            inner: HashEmbedder::new(DIM),
            calls: AtomicUsize::new(0),
            fail_on: AtomicUsize::new(usize::MAX),
        }
    }

    /// Fails the `n`th call from now, counting from 1.
    fn fail_nth(&self, n: usize) {
        self.fail_on
            .store(self.calls.load(Ordering::SeqCst) + n, Ordering::SeqCst);
    }
}

impl Embedder for FlakyEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call == self.fail_on.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Unavailable("provider down".into()));
        }
        self.inner.embed(text)
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

#[test]
fn scoped_search_then_purge() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let code = CollectionKind::CodeSubmissions;

    let a = db
        .store(code, None, "def add(a, b): return a + b", owned("u1", "p1"))
        .unwrap();
    let b = db
        .store(code, None, "def sub(a, b): return a - b", owned("u1", "p1"))
        .unwrap();
    db.store(code, None, "def add(a, b): return a + b", owned("u1", "p2"))
        .unwrap();

    let hits = db
        .find_similar(code, "def add(a, b): return a + b", &Scope::project("u1", "p1"), Some(5))
        .unwrap();
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, a);
    assert_eq!(hits[1].id, b);
    assert!(hits[0].distance.abs() < 1e-4);
    assert!(hits[0].similarity > 99.9);
    assert!(hits[0].distance <= hits[1].distance);
    for hit in &hits {
        assert_eq!(hit.metadata.get_str("project_id"), Some("p1"));
    }

    let report = db.clear_user_data("u1").unwrap();
    assert_eq!(report.deleted_count, 3);
    assert_eq!(report.per_collection.get(code), 3);
    assert!(db.get_user_stats("u1").unwrap().is_all_zero());
    assert!(db
        .find_similar(code, "def add", &Scope::user("u1"), None)
        .unwrap()
        .is_empty());
}

#[test]
fn dropping_the_project_broadens_results() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let code = CollectionKind::CodeSubmissions;
    for (user, project) in [("u1", "p1"), ("u1", "p2"), ("u2", "p1")] {
        db.store(code, None, "let total = items.iter().sum();", owned(user, project))
            .unwrap();
    }

    let narrow = db
        .find_similar(code, "items sum", &Scope::project("u1", "p1"), None)
        .unwrap();
    let broad = db.find_similar(code, "items sum", &Scope::user("u1"), None).unwrap();
    assert_eq!(narrow.len(), 1);
    assert_eq!(broad.len(), 2);
    assert!(broad.iter().all(|h| h.metadata.user_id() == Some("u1")));
}

#[test]
fn fresh_deployment_reports_zero_everywhere() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    let stats = db.get_collection_stats().unwrap();
    assert_eq!(stats.total(), 0);
    for kind in CollectionKind::ALL {
        assert_eq!(stats.get(kind), 0);
    }
    assert_eq!(stats.iter().count(), CollectionKind::ALL.len());
    assert_eq!(db.dimension().unwrap(), None);

    let purged = db.clear_user_data("nobody").unwrap();
    assert_eq!(purged.deleted_count, 0);
}

#[test]
fn result_count_is_bounded() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let scope = Scope::user("u1");
    let code = CollectionKind::CodeSubmissions;

    for n in [0, 51] {
        let err = db.find_similar(code, "anything", &scope, Some(n)).unwrap_err();
        assert!(matches!(
            err,
            Error::Validation(ValidationError::ResultsOutOfRange { max: 50, .. })
        ));
    }
    assert!(db.find_similar(code, "anything", &scope, Some(50)).unwrap().is_empty());
    assert!(matches!(
        db.find_similar(code, "anything", &Scope::user(""), None),
        Err(Error::Validation(ValidationError::MissingField("user_id")))
    ));
}

#[test]
fn resubmitting_overwrites_in_place() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);

    let first = db
        .store_code_submission("u1", "p1", "sub-1", "main.py", "print(1)", Some("python"))
        .unwrap();
    let second = db
        .store_code_submission("u1", "p1", "sub-1", "main.py", "print(2)", Some("python"))
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(db.get_collection_stats().unwrap().get(CollectionKind::CodeSubmissions), 1);

    let doc = db.get(CollectionKind::CodeSubmissions, &first).unwrap();
    assert_eq!(doc.document, "File: main.py\nLanguage: python\nCode:\nprint(2)");
    assert_eq!(doc.metadata.get_str("submission_id"), Some("sub-1"));
    assert!(doc.metadata.get("timestamp").and_then(|t| t.as_i64()).is_some());

    let other_user = db
        .store_code_submission("u2", "p1", "sub-1", "main.py", "print(3)", None)
        .unwrap();
    assert_ne!(other_user, first);
}

#[test]
fn records_survive_reopen_and_a_torn_tail() {
    let dir = TempDir::new().unwrap();
    let id = {
        let db = open(&dir);
        let id = db
            .store(CollectionKind::SecurityReviews, None, "eval on user input", owned("u1", "p1"))
            .unwrap();
        db.store_user_interaction("u1", "preference", "prefers terse reviews", Metadata::new())
            .unwrap();
        db.close().unwrap();
        id
    };

    let segment = dir.path().join("security_reviews.seg");
    let mut file = OpenOptions::new().append(true).open(&segment).unwrap();
    file.write_all(&[0xAB; 7]).unwrap();
    drop(file);

    let db = open(&dir);
    let doc = db.get(CollectionKind::SecurityReviews, &id).unwrap();
    assert_eq!(doc.document, "eval on user input");
    assert_eq!(db.get_user_stats("u1").unwrap().total(), 2);
    assert_eq!(db.dimension().unwrap(), Some(DIM));

    db.store(CollectionKind::SecurityReviews, None, "after recovery", owned("u1", "p1"))
        .unwrap();
    drop(db);
    let db = open(&dir);
    assert_eq!(db.get_collection_stats().unwrap().get(CollectionKind::SecurityReviews), 2);
}

#[test]
fn embedder_dimension_is_pinned() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir);
        db.store(CollectionKind::CodeSubmissions, None, "fn main() {}", owned("u1", "p1"))
            .unwrap();
    }

    let db = open_with(&dir, Arc::new(HashEmbedder::new(DIM * 2)));
    let err = db
        .store(CollectionKind::LogicReviews, None, "off by one", owned("u1", "p1"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Storage(StorageError::DimensionMismatch { expected: DIM, actual }) if actual == DIM * 2
    ));
    assert_eq!(db.get_collection_stats().unwrap().total(), 1);
}

#[test]
fn missing_record_is_not_found() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let err = db.get(CollectionKind::UserContext, "missing").unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[test]
fn project_context_belongs_to_its_owner() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let files = vec!["app.py".to_string(), "db.py".to_string()];
    db.store_project_context("u1", "p1", "shop", "online shop backend", &files)
        .unwrap();

    let doc = db.get_project_context("u1", "p1").unwrap().unwrap();
    assert_eq!(doc.id, "p1");
    assert_eq!(
        doc.document,
        "Project: shop\nDescription: online shop backend\nFiles: app.py, db.py"
    );
    assert!(db.get_project_context("u2", "p1").unwrap().is_none());
    assert!(db.get_project_context("u1", "p9").unwrap().is_none());

    db.store_project_context("u1", "p1", "shop", "rewritten in rust", &files)
        .unwrap();
    assert_eq!(db.get_collection_stats().unwrap().get(CollectionKind::ProjectContext), 1);
}

#[test]
fn review_findings_are_split_by_kind() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let findings = vec![
        ReviewArtifact::Security(SecurityFinding {
            filename: "app.py".into(),
            line: Some(3),
            severity: "high".into(),
            score: Some(8.0),
            feedback: "SQL built from user input".into(),
        }),
        ReviewArtifact::Logic(LogicFinding {
            filename: Some("app.py".into()),
            function: "total".into(),
            feedback: "off by one in loop bound".into(),
        }),
    ];

    let ids = db
        .store_review("u1", "p1", Some("sub-1"), Some("2025-01-01T00:00:00Z"), &findings)
        .unwrap();
    assert_eq!(ids.len(), 2);

    let stats = db.get_user_stats("u1").unwrap();
    assert_eq!(stats.get(CollectionKind::SecurityReviews), 1);
    assert_eq!(stats.get(CollectionKind::LogicReviews), 1);

    let security = db.get(CollectionKind::SecurityReviews, &ids[0]).unwrap();
    assert_eq!(security.metadata.get_str("severity"), Some("high"));
    assert_eq!(security.metadata.get_str("submission_id"), Some("sub-1"));

    let report = ReviewReport::parse(
        r#"{"files": [{"filename": "db.py", "issues": [{"line": 9, "feedback": "weak hash"}]}]}"#,
    )
    .unwrap();
    db.store_review_report("u1", "p1", None, &report).unwrap();
    assert_eq!(
        db.get_user_stats("u1").unwrap().get(CollectionKind::SecurityReviews),
        2
    );
}

#[test]
fn interaction_keeps_engine_owned_keys() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let extra = Metadata::new().with("user_id", "intruder").with("channel", "ide");
    let id = db
        .store_user_interaction("u1", "preference", "explain fixes with examples", extra)
        .unwrap();

    let doc = db.get(CollectionKind::UserContext, &id).unwrap();
    assert_eq!(doc.metadata.user_id(), Some("u1"));
    assert_eq!(doc.metadata.get_str("channel"), Some("ide"));
}

#[test]
fn context_bundle_collects_every_source() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    db.store_code_submission("u1", "p1", "s1", "auth.py", "password = request.args['pw']", None)
        .unwrap();
    db.store(
        CollectionKind::SecurityReviews,
        None,
        "Security Issue in auth.py\nFinding: password read from query string",
        owned("u1", "p1"),
    )
    .unwrap();
    db.store_project_context("u1", "p1", "auth", "login service", &[]).unwrap();
    db.store_user_interaction("u1", "preference", "preferences for security review: be strict", Metadata::new())
        .unwrap();
    db.store_code_submission("u2", "p1", "s1", "auth.py", "password = request.args['pw']", None)
        .unwrap();

    let bundle = db
        .get_enhanced_context("u1", "p1", "password = request.args['pw']", ReviewKind::Security)
        .unwrap();
    assert_eq!(bundle.similar_code.len(), 1);
    assert_eq!(bundle.similar_code[0].metadata.user_id(), Some("u1"));
    assert_eq!(bundle.past_issues.len(), 1);
    assert_eq!(bundle.project_context.as_ref().map(|d| d.id.as_str()), Some("p1"));
    assert_eq!(bundle.user_preferences.len(), 1);
    assert!(bundle.degraded.is_empty());

    let logic = db
        .get_enhanced_context("u1", "p1", "password = request.args['pw']", ReviewKind::Logic)
        .unwrap();
    assert!(logic.past_issues.is_empty());
}

#[test]
fn context_for_unknown_user_is_empty() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    db.store_code_submission("u1", "p1", "s1", "a.py", "x = 1", None).unwrap();

    let bundle = db
        .get_context("ghost", "p1", "x = 1", ReviewKind::Testing)
        .unwrap();
    assert!(bundle.is_empty());
    assert!(bundle.degraded.is_empty());
}

#[test]
fn failing_source_degrades_the_bundle() {
    let dir = TempDir::new().unwrap();
    let embedder = Arc::new(FlakyEmbedder::new());
    let db = open_with(&dir, embedder.clone());
    db.store_code_submission("u1", "p1", "s1", "a.py", "query = 'SELECT ' + name", None)
        .unwrap();
    db.store(
        CollectionKind::SecurityReviews,
        None,
        "string-built SQL query",
        owned("u1", "p1"),
    )
    .unwrap();
    db.store_user_interaction("u1", "preference", "wants fix suggestions", Metadata::new())
        .unwrap();

    // Sources embed in order: similar code, past issues, preferences.
    embedder.fail_nth(2);
    let bundle = db
        .get_enhanced_context("u1", "p1", "query = 'SELECT ' + name", ReviewKind::Security)
        .unwrap();
    assert_eq!(bundle.degraded, vec!["past_issues".to_string()]);
    assert!(bundle.past_issues.is_empty());
    assert_eq!(bundle.similar_code.len(), 1);
    assert_eq!(bundle.user_preferences.len(), 1);

    embedder.fail_nth(1);
    let bundle = db
        .get_enhanced_context("u1", "p1", "query = 'SELECT ' + name", ReviewKind::Security)
        .unwrap();
    assert_eq!(bundle.degraded, vec!["similar_code".to_string()]);
    assert!(bundle.similar_code.is_empty());
    assert_eq!(bundle.past_issues.len(), 1);
    assert!(bundle.project_context.is_none());

    embedder.fail_nth(1);
    let err = db
        .find_similar(CollectionKind::CodeSubmissions, "SELECT", &Scope::user("u1"), None)
        .unwrap_err();
    assert_eq!(err.kind(), "embedding");
}

#[test]
fn empty_inputs_are_rejected() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    assert!(matches!(
        db.store(CollectionKind::UserContext, None, "no owner", Metadata::new()),
        Err(Error::Validation(ValidationError::MissingField("user_id")))
    ));
    assert!(matches!(
        db.store(CollectionKind::ProjectContext, None, "no project", Metadata::new().with("user_id", "u1")),
        Err(Error::Validation(ValidationError::MissingField("project_id")))
    ));
    assert!(matches!(
        db.get_enhanced_context("", "p1", "x", ReviewKind::Logic),
        Err(Error::Validation(ValidationError::MissingField("user_id")))
    ));
    assert_eq!(db.get_collection_stats().unwrap().total(), 0);
}

#[test]
fn damaged_purge_frame_fails_reopen_instead_of_resurrecting() {
    let dir = TempDir::new().unwrap();
    {
        let db = open(&dir);
        db.store(CollectionKind::CodeSubmissions, None, "secret = 'a'", owned("u1", "p1"))
            .unwrap();
        db.clear_user_data("u1").unwrap();
        db.store(CollectionKind::CodeSubmissions, None, "print('c')", owned("u2", "p1"))
            .unwrap();
        db.close().unwrap();
    }

    // Frames: put(u1), delete(u1), put(u2). Damage the delete frame's body.
    let segment = dir.path().join("code_submissions.seg");
    let mut raw = std::fs::read(&segment).unwrap();
    let first_len = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
    let delete_frame = 12 + first_len;
    raw[delete_frame + 12 + 1] ^= 0xFF;
    std::fs::write(&segment, &raw).unwrap();

    let reopened = RecallDb::open(EngineConfig::new(dir.path()), Arc::new(HashEmbedder::new(DIM)));
    assert!(matches!(
        reopened,
        Err(Error::Storage(StorageError::Corrupt { .. }))
    ));
    assert_eq!(std::fs::read(&segment).unwrap(), raw);
}

#[test]
fn project_context_cannot_be_taken_over() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    db.store_project_context("u1", "p1", "shop", "u1's shop", &[]).unwrap();

    let err = db
        .store_project_context("u2", "p1", "shop", "u2's shop", &[])
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::OwnerMismatch { .. })
    ));
    let doc = db.get_project_context("u1", "p1").unwrap().unwrap();
    assert!(doc.document.contains("u1's shop"));
    assert!(db.get_project_context("u2", "p1").unwrap().is_none());
}

#[test]
fn project_context_id_must_be_the_project() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let kind = CollectionKind::ProjectContext;

    let err = db
        .store(kind, Some("other-id"), "project notes", owned("u3", "p9"))
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::ProjectIdMismatch { .. })
    ));

    let id = db.store(kind, Some("p9"), "project notes", owned("u3", "p9")).unwrap();
    assert_eq!(id, "p9");
    db.store(kind, None, "revised notes", owned("u3", "p9")).unwrap();
    assert_eq!(db.get_collection_stats().unwrap().get(kind), 1);
    let doc = db.get_project_context("u3", "p9").unwrap().unwrap();
    assert_eq!(doc.document, "revised notes");
}

#[test]
fn generic_review_records_reach_the_context() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let id = db
        .store(CollectionKind::LogicReviews, None, "loop never terminates", owned("u1", "p1"))
        .unwrap();
    assert_eq!(
        db.get(CollectionKind::LogicReviews, &id).unwrap().metadata.get_str("review_type"),
        Some("logic")
    );
    let tagged = db
        .store(
            CollectionKind::LogicReviews,
            None,
            "missing edge case test",
            owned("u1", "p1").with("review_type", "testing"),
        )
        .unwrap();
    assert_eq!(
        db.get(CollectionKind::LogicReviews, &tagged).unwrap().metadata.get_str("review_type"),
        Some("testing")
    );

    let bundle = db
        .get_enhanced_context("u1", "p1", "while true: pass", ReviewKind::Logic)
        .unwrap();
    assert_eq!(bundle.past_issues.len(), 1);
    assert_eq!(bundle.past_issues[0].id, id);
}

#[test]
fn clear_drops_every_user_in_one_collection() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    for user in ["u1", "u2"] {
        db.store(CollectionKind::UserContext, None, "likes short reviews", owned(user, "p1"))
            .unwrap();
        db.store(CollectionKind::SecurityReviews, None, "xss in template", owned(user, "p1"))
            .unwrap();
    }

    assert_eq!(db.clear(CollectionKind::UserContext).unwrap(), 2);
    let stats = db.get_collection_stats().unwrap();
    assert_eq!(stats.get(CollectionKind::UserContext), 0);
    assert_eq!(stats.get(CollectionKind::SecurityReviews), 2);
    assert!(db
        .find_similar(CollectionKind::UserContext, "short reviews", &Scope::user("u1"), None)
        .unwrap()
        .is_empty());
}

#[test]
fn concurrent_writers_of_one_id_leave_one_whole_record() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    let kind = CollectionKind::CodeSubmissions;
    let writers = 8;

    std::thread::scope(|s| {
        for i in 0..writers {
            let db = &db;
            s.spawn(move || {
                for round in 0..5 {
                    let document = format!("writer {i} round {round} fn handler_{i}() {{}}");
                    let metadata = owned("u1", "p1").with("writer", i as i64);
                    db.store(kind, Some("shared"), &document, metadata).unwrap();
                }
            });
        }
    });

    assert_eq!(db.get_collection_stats().unwrap().get(kind), 1);
    let doc = db.get(kind, "shared").unwrap();
    let writer = doc.metadata.get("writer").and_then(|w| w.as_i64()).unwrap();
    assert!(doc.document.starts_with(&format!("writer {writer} ")));

    // The stored vector belongs to the stored document.
    let hits = db
        .find_similar(kind, &doc.document, &Scope::user("u1"), Some(1))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].distance.abs() < 1e-4);
}

#[test]
fn purge_racing_with_queries_ends_empty() {
    let dir = TempDir::new().unwrap();
    let db = open(&dir);
    for n in 0..20 {
        db.store_code_submission("u1", "p1", &format!("s{n}"), "a.py", &format!("x = {n}"), None)
            .unwrap();
        db.store_user_interaction("u1", "preference", &format!("note {n}"), Metadata::new())
            .unwrap();
    }
    db.store_code_submission("u2", "p1", "s0", "a.py", "x = 0", None).unwrap();

    std::thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..25 {
                    let hits = db
                        .find_similar(CollectionKind::CodeSubmissions, "x = 1", &Scope::user("u1"), None)
                        .unwrap();
                    assert!(hits.iter().all(|h| h.metadata.user_id() == Some("u1")));
                }
            });
        }
        let report = db.clear_user_data("u1").unwrap();
        assert_eq!(report.deleted_count, 40);
        assert!(db.get_user_stats("u1").unwrap().is_all_zero());
    });

    assert!(db.get_user_stats("u1").unwrap().is_all_zero());
    assert!(db
        .find_similar(CollectionKind::CodeSubmissions, "x = 1", &Scope::user("u1"), None)
        .unwrap()
        .is_empty());
    assert_eq!(db.get_user_stats("u2").unwrap().total(), 1);
}
