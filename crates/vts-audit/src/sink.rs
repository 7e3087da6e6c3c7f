//! Audit sinks

use crate::error::AuditError;
use crate::record::{AuditRecord, RunId};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Durable destination for audit records
///
/// Records arrive in chain order; a sink must store them in that order and
/// return them unchanged from [`AuditSink::read_chain`].
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Append one record
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Read a run's chain in append order
    async fn read_chain(&self, run_id: RunId) -> Result<Vec<AuditRecord>, AuditError>;
}

/// In-memory sink for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    chains: RwLock<HashMap<RunId, Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct access to stored records
    ///
    /// Lets operators and tests simulate storage corruption; the recorder's
    /// verification must then fail.
    pub fn with_chain_mut<R>(&self, run_id: RunId, f: impl FnOnce(&mut Vec<AuditRecord>) -> R) -> R {
        let mut chains = self.chains.write();
        f(chains.entry(run_id).or_default())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        self.chains
            .write()
            .entry(record.run_id)
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn read_chain(&self, run_id: RunId) -> Result<Vec<AuditRecord>, AuditError> {
        Ok(self.chains.read().get(&run_id).cloned().unwrap_or_default())
    }
}
