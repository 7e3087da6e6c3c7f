//! Run configuration
//!
//! One immutable [`RunConfig`] governs a run. It loads from TOML with every
//! section optional; durations are integer milliseconds.
//!
//! ```toml
//! validation_mode = false
//! confidence_clamp_tolerance = 0.05
//!
//! [thresholds]
//! category_1 = 0.60
//! category_3 = 0.70
//! category_4 = 0.85
//! category_5 = 0.90
//!
//! [timeouts]
//! batch_ms = 45000
//! run_deadline_ms = 600000
//!
//! [generation]
//! batch_size = 5
//! max_concurrent_batches = 2
//! ```

use crate::analysis::AnalysisKind;
use crate::error::ConfigurationError;
use crate::retry::RetryPolicy;
use crate::types::{Category, CategoryTable};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use vts_gateway::DEFAULT_MAX_RESPONSE_BYTES;

/// Complete configuration of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Minimum confidence to proceed without consultation
    pub thresholds: CategoryTable<f64>,
    /// Permits bypassing a bypassable consultation
    pub validation_mode: bool,
    /// How far outside [0, 1] a confidence may fall and still be clamped
    pub confidence_clamp_tolerance: f64,
    pub models: ModelConfig,
    pub timeouts: TimeoutConfig,
    pub analysis: AnalysisConfig,
    pub generation: GenerationConfig,
}

impl RunConfig {
    /// Parse and validate TOML
    ///
    /// # Errors
    /// Returns `Parse` for malformed TOML or any validation error
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigurationError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    ///
    /// # Errors
    /// Returns `Io` if the file cannot be read, otherwise as [`Self::from_toml_str`]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    #[must_use]
    pub fn with_validation_mode(mut self, enabled: bool) -> Self {
        self.validation_mode = enabled;
        self
    }

    #[must_use]
    pub fn with_threshold(mut self, category: Category, value: f64) -> Self {
        match category {
            Category::One => self.thresholds.category_1 = value,
            Category::Three => self.thresholds.category_3 = value,
            Category::Four => self.thresholds.category_4 = value,
            Category::Five => self.thresholds.category_5 = value,
            Category::Ambiguous => {}
        }
        self
    }

    #[must_use]
    pub fn with_target_cases(mut self, targets: CategoryTable<usize>) -> Self {
        self.generation.target_cases = targets;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.generation.batch_size = batch_size;
        self
    }

    #[must_use]
    pub fn with_max_concurrent_batches(mut self, max: usize) -> Self {
        self.generation.max_concurrent_batches = max;
        self
    }

    #[must_use]
    pub fn with_analysis_tasks(mut self, tasks: Vec<AnalysisKind>) -> Self {
        self.analysis.tasks = tasks;
        self
    }

    #[must_use]
    pub fn with_analysis_retry(mut self, retry: RetryPolicy) -> Self {
        self.analysis.retry = retry;
        self
    }

    #[must_use]
    pub fn with_generation_retry(mut self, retry: RetryPolicy) -> Self {
        self.generation.retry = retry;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Threshold for a category; `None` for `Ambiguous`
    #[must_use]
    pub fn threshold(&self, category: Category) -> Option<f64> {
        self.thresholds.get(category)
    }

    /// Check every bound
    ///
    /// # Errors
    /// Returns the first violated bound
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        for (category, value) in self.thresholds.iter() {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigurationError::ThresholdOutOfRange {
                    category: category.to_string(),
                    value,
                });
            }
        }

        let tolerance = self.confidence_clamp_tolerance;
        if !(0.0..1.0).contains(&tolerance) {
            return Err(ConfigurationError::InvalidTolerance(tolerance));
        }

        self.timeouts.validate()?;
        self.analysis.validate()?;
        self.generation.validate()?;
        Ok(())
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            thresholds: CategoryTable {
                category_1: 0.60,
                category_3: 0.70,
                category_4: 0.85,
                category_5: 0.90,
            },
            validation_mode: false,
            confidence_clamp_tolerance: 0.05,
            models: ModelConfig::default(),
            timeouts: TimeoutConfig::default(),
            analysis: AnalysisConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

/// Model identifiers per stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub categorization: String,
    pub analysis: String,
    pub generation: String,
    pub max_response_bytes: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            categorization: "categorizer-v1".to_string(),
            analysis: "analyst-v1".to_string(),
            generation: "generator-v1".to_string(),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        }
    }
}

/// Per-call and per-run time bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub categorization_ms: u64,
    /// Bound on each analysis attempt
    pub analysis_ms: u64,
    /// Bound on each batch attempt
    pub batch_ms: u64,
    /// How long to wait for a human decision
    pub consultation_ms: u64,
    /// Whole-run deadline; unbounded when absent
    pub run_deadline_ms: Option<u64>,
}

impl TimeoutConfig {
    #[must_use]
    pub fn categorization(&self) -> Duration {
        Duration::from_millis(self.categorization_ms)
    }

    #[must_use]
    pub fn analysis(&self) -> Duration {
        Duration::from_millis(self.analysis_ms)
    }

    #[must_use]
    pub fn batch(&self) -> Duration {
        Duration::from_millis(self.batch_ms)
    }

    #[must_use]
    pub fn consultation(&self) -> Duration {
        Duration::from_millis(self.consultation_ms)
    }

    #[must_use]
    pub fn run_deadline(&self) -> Option<Duration> {
        self.run_deadline_ms.map(Duration::from_millis)
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let bounds = [
            ("categorization_ms", self.categorization_ms),
            ("analysis_ms", self.analysis_ms),
            ("batch_ms", self.batch_ms),
            ("consultation_ms", self.consultation_ms),
            ("run_deadline_ms", self.run_deadline_ms.unwrap_or(1)),
        ];
        match bounds.iter().find(|(_, ms)| *ms == 0) {
            Some((name, _)) => Err(ConfigurationError::ZeroTimeout(*name)),
            None => Ok(()),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            categorization_ms: 30_000,
            analysis_ms: 60_000,
            batch_ms: 90_000,
            consultation_ms: 15 * 60_000,
            run_deadline_ms: None,
        }
    }
}

/// Parallel analysis settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Tasks fanned out for every categorized document
    pub tasks: Vec<AnalysisKind>,
    pub retry: RetryPolicy,
}

impl AnalysisConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.tasks.is_empty() {
            return Err(ConfigurationError::NoAnalysisTasks);
        }
        let mut seen = HashSet::new();
        for kind in &self.tasks {
            if !seen.insert(kind) {
                return Err(ConfigurationError::DuplicateAnalysisTask(kind.to_string()));
            }
        }
        self.retry.validate("analysis")
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            tasks: AnalysisKind::ALL.to_vec(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Batched suite generation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub batch_size: usize,
    /// Batches in flight at once; 1 runs them strictly in order
    pub max_concurrent_batches: usize,
    /// Total cases requested per category
    pub target_cases: CategoryTable<usize>,
    pub retry: RetryPolicy,
}

impl GenerationConfig {
    fn validate(&self) -> Result<(), ConfigurationError> {
        if self.batch_size == 0 {
            return Err(ConfigurationError::ZeroBatchSize);
        }
        if self.max_concurrent_batches == 0 {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        if let Some((category, _)) = self.target_cases.iter().find(|(_, n)| *n == 0) {
            return Err(ConfigurationError::ZeroTargetCount(category.to_string()));
        }
        self.retry.validate("generation")
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_concurrent_batches: 1,
            target_cases: CategoryTable {
                category_1: 5,
                category_3: 10,
                category_4: 20,
                category_5: 30,
            },
            retry: RetryPolicy::default(),
        }
    }
}
