//! VTS Core - requirements-to-test-suite orchestration
//!
//! A run takes one requirements [`Document`] through categorization,
//! parallel analysis, a consultation gate and batched suite generation,
//! recording every stage boundary in a signed audit chain.
//!
//! # Example
//!
//! ```rust,ignore
//! use vts_core::{Document, Orchestrator, RunConfig};
//!
//! let orchestrator = Orchestrator::new(RunConfig::default(), gateway, signer, sink);
//! let result = orchestrator.run(&Document::new("urs.md", content)).await?;
//! result.verify()?;
//! ```

#![allow(missing_docs)]

pub mod analysis;
pub mod categorization;
pub mod config;
pub mod consultation;
pub mod document;
pub mod error;
pub mod generation;
pub mod ingestion;
pub mod orchestrator;
pub mod resolver;
pub mod retry;
pub mod stage;
pub mod types;

pub use analysis::{AnalysisCoordinator, AnalysisKind, AnalysisReport, AnalysisTask, TaskStatus};
pub use categorization::{parse_categorization, CategorizationStage, ParsedCategorization};
pub use config::{AnalysisConfig, GenerationConfig, ModelConfig, RunConfig, TimeoutConfig};
pub use consultation::{
    ConsultationGate, ConsultationId, ConsultationReason, ConsultationRequirement, Decision,
    GateSignals, GateState, Resolution,
};
pub use document::{Document, DocumentId, DocumentMetadata};
pub use error::{
    ConfigurationError, ErrorKind, GateError, IngestionError, OrchestrationError, ResolverError,
    Result, StageFailure, StateMachineError,
};
pub use generation::{merge_suite, plan_batches, GenerationOutcome, SuiteGenerator};
pub use ingestion::{DocumentLoader, FsDocumentLoader};
pub use orchestrator::{Orchestrator, RunResult};
pub use resolver::{ChannelResolver, ConsultationResolver, PendingConsultation, ReviewQueue};
pub use retry::RetryPolicy;
pub use stage::Stage;
pub use types::{
    BatchStatus, CategorizationId, CategorizationResult, Category, CategoryTable, RiskLevel,
    RunStatus, SuiteId, TestBatch, TestCase, TestSuite,
};
