//! Typed review findings and their stored form.
//!
//! A finding renders to the same document text every time, so repeated
//! findings embed identically and cluster together in similarity search.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::model::{CollectionKind, Metadata};

const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewKind {
    Security,
    Logic,
    Testing,
}

impl ReviewKind {
    pub fn name(&self) -> &'static str {
        match self {
            ReviewKind::Security => "security",
            ReviewKind::Logic => "logic",
            ReviewKind::Testing => "testing",
        }
    }

    /// Collection holding past findings of this kind.
    pub fn collection(&self) -> CollectionKind {
        match self {
            ReviewKind::Security => CollectionKind::SecurityReviews,
            ReviewKind::Logic | ReviewKind::Testing => CollectionKind::LogicReviews,
        }
    }
}

impl fmt::Display for ReviewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ReviewKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "security" => Ok(ReviewKind::Security),
            "logic" => Ok(ReviewKind::Logic),
            "testing" | "test" => Ok(ReviewKind::Testing),
            _ => Err(ValidationError::UnknownReviewType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityFinding {
    pub filename: String,
    pub line: Option<i64>,
    pub severity: String,
    pub score: Option<f64>,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicFinding {
    pub filename: Option<String>,
    pub function: String,
    pub feedback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub filename: Option<String>,
    pub case_id: String,
    pub description: String,
    pub input: Value,
    pub expected_output: Value,
    pub test_type: String,
    pub notes: String,
}

/// One finding of a review, stored as one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReviewArtifact {
    Security(SecurityFinding),
    Logic(LogicFinding),
    Testing(TestCase),
}

impl ReviewArtifact {
    pub fn kind(&self) -> ReviewKind {
        match self {
            ReviewArtifact::Security(_) => ReviewKind::Security,
            ReviewArtifact::Logic(_) => ReviewKind::Logic,
            ReviewArtifact::Testing(_) => ReviewKind::Testing,
        }
    }

    pub fn collection(&self) -> CollectionKind {
        self.kind().collection()
    }

    /// Embedding input for this finding.
    pub fn document(&self) -> String {
        match self {
            ReviewArtifact::Security(f) => format!(
                "Security Issue in {}\nLine: {}\nSeverity: {}\nFinding: {}",
                f.filename,
                f.line.map_or_else(|| "N/A".to_string(), |l| l.to_string()),
                f.severity,
                f.feedback.trim()
            ),
            ReviewArtifact::Logic(f) => format!(
                "Logic Error in function: {}\nIssue: {}",
                f.function,
                f.feedback.trim()
            ),
            // serde_json::Value maps keep their keys sorted, so this is stable.
            ReviewArtifact::Testing(t) => format!(
                "Test Case {} ({}) for {}\nDescription: {}\nInput: {}\nExpected: {}\nNotes: {}",
                t.case_id,
                t.test_type,
                t.filename.as_deref().unwrap_or(UNKNOWN),
                t.description.trim(),
                t.input,
                t.expected_output,
                t.notes.trim()
            ),
        }
    }

    /// Finding-specific metadata. Scope fields are added by the caller.
    pub fn metadata(&self) -> Metadata {
        let meta = Metadata::new().with("review_type", self.kind().name());
        match self {
            ReviewArtifact::Security(f) => {
                let meta = meta
                    .with("kind", "security_issue")
                    .with("filename", f.filename.as_str())
                    .with("line", f.line.unwrap_or(0))
                    .with("severity", f.severity.as_str());
                match f.score {
                    Some(score) => meta.with("score", score),
                    None => meta,
                }
            }
            ReviewArtifact::Logic(f) => {
                let meta = meta
                    .with("kind", "logic_error")
                    .with("function", f.function.as_str());
                match &f.filename {
                    Some(filename) => meta.with("filename", filename),
                    None => meta,
                }
            }
            ReviewArtifact::Testing(t) => meta
                .with("kind", "test_case")
                .with("filename", t.filename.as_deref().unwrap_or(UNKNOWN))
                .with("test_case_id", t.case_id.as_str())
                .with("test_type", t.test_type.as_str()),
        }
    }
}

/// The JSON a review model returns, in any of its three shapes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReviewReport {
    #[serde(default)]
    pub review_time: Option<String>,
    #[serde(default)]
    files: Vec<ReportFile>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ReportFile {
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    issues: Vec<RawIssue>,
    #[serde(default, rename = "logic Errors", alias = "logic_errors")]
    logic_errors: Vec<RawLogicError>,
    #[serde(default)]
    test_cases: Vec<RawTestCase>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawSeverity {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    score: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawIssue {
    #[serde(default)]
    line: Option<Value>,
    #[serde(default)]
    severity: Option<RawSeverity>,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawLogicError {
    #[serde(default)]
    function: Option<String>,
    #[serde(default)]
    feedback: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawTestCase {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    expected_output: Value,
    #[serde(default)]
    test_type: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

impl ReviewReport {
    pub fn parse(json: &str) -> Result<Self, ValidationError> {
        serde_json::from_str(json).map_err(|e| ValidationError::MalformedReport(e.to_string()))
    }

    /// Every finding in file order.
    pub fn artifacts(&self) -> Vec<ReviewArtifact> {
        let mut out = Vec::new();
        for file in &self.files {
            let filename = file.filename.clone().filter(|f| !f.is_empty());

            for issue in &file.issues {
                let severity = issue.severity.clone().unwrap_or_default();
                out.push(ReviewArtifact::Security(SecurityFinding {
                    filename: filename.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    line: issue.line.as_ref().and_then(lenient_int),
                    severity: severity.level.unwrap_or_else(|| "low".to_string()),
                    score: severity.score.as_ref().and_then(lenient_float),
                    feedback: issue.feedback.clone().unwrap_or_default(),
                }));
            }

            for error in &file.logic_errors {
                out.push(ReviewArtifact::Logic(LogicFinding {
                    filename: filename.clone(),
                    function: error.function.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    feedback: error.feedback.clone().unwrap_or_default(),
                }));
            }

            for (idx, case) in file.test_cases.iter().enumerate() {
                let case_id = match &case.id {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => format!("TC{:03}", idx + 1),
                };
                out.push(ReviewArtifact::Testing(TestCase {
                    filename: filename.clone(),
                    case_id,
                    description: case.description.clone().unwrap_or_default(),
                    input: case.input.clone(),
                    expected_output: case.expected_output.clone(),
                    test_type: case.test_type.clone().unwrap_or_else(|| UNKNOWN.to_string()),
                    notes: case.notes.clone().unwrap_or_default(),
                }));
            }
        }
        out
    }
}

fn lenient_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn lenient_float(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
