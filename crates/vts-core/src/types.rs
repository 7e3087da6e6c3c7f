//! Core types for VTS
//!
//! Defines the values that flow between stages:
//! - Risk categories and per-category configuration tables
//! - Categorization results
//! - Test cases, batches and the merged suite

use crate::document::DocumentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;
use vts_audit::RunId;

/// Unique suite identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SuiteId(pub Ulid);

impl SuiteId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for SuiteId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique categorization identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CategorizationId(pub Ulid);

impl CategorizationId {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CategorizationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CategorizationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Regulatory risk category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "ambiguous")]
    Ambiguous,
}

impl Category {
    /// Every concrete category, in ascending risk order
    pub const CONCRETE: [Category; 4] = [Self::One, Self::Three, Self::Four, Self::Five];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::One => "1",
            Self::Three => "3",
            Self::Four => "4",
            Self::Five => "5",
            Self::Ambiguous => "ambiguous",
        }
    }

    #[inline]
    #[must_use]
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Self::Ambiguous)
    }

    /// Interpret a model-supplied category
    ///
    /// Accepts the integers 1, 3, 4, 5 or a string holding one of them,
    /// optionally prefixed with `category`, or `ambiguous`. Anything else is
    /// rejected rather than mapped to a nearby category.
    #[must_use]
    pub fn parse_model_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => match n.as_u64()? {
                1 => Some(Self::One),
                3 => Some(Self::Three),
                4 => Some(Self::Four),
                5 => Some(Self::Five),
                _ => None,
            },
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambiguous => f.write_str("ambiguous"),
            other => write!(f, "category {}", other.as_str()),
        }
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        let bare = lowered
            .strip_prefix("category")
            .map_or(lowered.as_str(), str::trim_start);
        match bare {
            "1" => Ok(Self::One),
            "3" => Ok(Self::Three),
            "4" => Ok(Self::Four),
            "5" => Ok(Self::Five),
            "ambiguous" => Ok(Self::Ambiguous),
            _ => Err(format!("unknown category: {s}")),
        }
    }
}

/// One value per concrete category
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CategoryTable<T> {
    pub category_1: T,
    pub category_3: T,
    pub category_4: T,
    pub category_5: T,
}

impl<T: Copy> CategoryTable<T> {
    /// Value for a category; `None` for `Ambiguous`
    #[must_use]
    pub fn get(&self, category: Category) -> Option<T> {
        match category {
            Category::One => Some(self.category_1),
            Category::Three => Some(self.category_3),
            Category::Four => Some(self.category_4),
            Category::Five => Some(self.category_5),
            Category::Ambiguous => None,
        }
    }

    /// `(category, value)` pairs in category order
    pub fn iter(&self) -> impl Iterator<Item = (Category, T)> + '_ {
        Category::CONCRETE
            .into_iter()
            .filter_map(|c| self.get(c).map(|v| (c, v)))
    }
}

/// Output of the categorization stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationResult {
    pub id: CategorizationId,
    pub category: Category,
    /// Always within [0, 1]
    pub confidence: f64,
    /// The model's value before clamping; present only when it was clamped
    pub raw_confidence: Option<f64>,
    pub rationale: String,
    pub model_used: String,
    pub timestamp: DateTime<Utc>,
}

/// Risk level of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            _ => Err(format!("unknown risk level: {s}")),
        }
    }
}

/// One generated test case
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,
    pub title: String,
    pub category_tags: Vec<String>,
    pub risk_level: RiskLevel,
    pub steps: Vec<String>,
    pub expected_result: String,
    /// Requirement identifiers this case covers
    pub traceability_refs: BTreeSet<String>,
    pub generated_at: DateTime<Utc>,
    /// 1-based index of the batch that produced the case
    pub batch_index: usize,
    /// Attempt within the batch that produced the case
    pub attempt: u32,
}

/// Terminal or pending state of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Planned, no attempt finished yet
    Pending,
    /// Holds at least `requested_count` cases
    Succeeded,
    /// Exhausted its attempts
    Failed,
    /// Last attempt timed out, or the run deadline fired
    TimedOut,
}

/// One independently retried generation batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestBatch {
    /// 1-based; batches run and merge in this order
    pub batch_index: usize,
    pub requested_count: usize,
    pub generated_cases: Vec<TestCase>,
    pub status: BatchStatus,
    pub attempt_count: u32,
    pub error: Option<crate::error::StageFailure>,
}

impl TestBatch {
    #[must_use]
    pub fn pending(batch_index: usize, requested_count: usize) -> Self {
        Self {
            batch_index,
            requested_count,
            generated_cases: Vec::new(),
            status: BatchStatus::Pending,
            attempt_count: 0,
            error: None,
        }
    }

    #[inline]
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == BatchStatus::Succeeded
    }
}

/// Merged output of the generation stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSuite {
    pub id: SuiteId,
    pub run_id: RunId,
    pub document_id: DocumentId,
    pub category: Category,
    /// Succeeded batches' cases in batch order
    pub cases: Vec<TestCase>,
    pub batch_count: usize,
    /// Indices of batches that did not contribute
    pub failed_batches: Vec<usize>,
    /// Cases dropped because a later-timestamped case had the same id
    pub duplicates_removed: usize,
    pub created_at: DateTime<Utc>,
}

impl TestSuite {
    #[inline]
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failed_batches.is_empty()
    }
}

/// Overall outcome of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    CompletedWithConsultation,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn category_from_model_values() {
        assert_eq!(Category::parse_model_value(&json!(4)), Some(Category::Four));
        assert_eq!(Category::parse_model_value(&json!("3")), Some(Category::Three));
        assert_eq!(
            Category::parse_model_value(&json!("Category 5")),
            Some(Category::Five)
        );
        assert_eq!(
            Category::parse_model_value(&json!("AMBIGUOUS")),
            Some(Category::Ambiguous)
        );
    }

    #[test]
    fn category_rejects_unknown_values() {
        for value in [json!(2), json!(0), json!(-1), json!(4.5), json!("two"), json!(null), json!([4])] {
            assert_eq!(Category::parse_model_value(&value), None, "{value}");
        }
    }

    #[test]
    fn category_serde_uses_numbers_as_strings() {
        assert_eq!(serde_json::to_value(Category::Four).unwrap(), json!("4"));
        let parsed: Category = serde_json::from_value(json!("ambiguous")).unwrap();
        assert_eq!(parsed, Category::Ambiguous);
    }

    #[test]
    fn table_lookup() {
        let table = CategoryTable {
            category_1: 1,
            category_3: 3,
            category_4: 4,
            category_5: 5,
        };
        assert_eq!(table.get(Category::Four), Some(4));
        assert_eq!(table.get(Category::Ambiguous), None);
        let values: Vec<_> = table.iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![1, 3, 4, 5]);
    }

    #[test]
    fn risk_level_parse_is_case_insensitive() {
        assert_eq!("HIGH".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert!("severe".parse::<RiskLevel>().is_err());
    }
}
