//! Consultation resolution boundary
//!
//! The orchestrator submits a raised [`ConsultationRequirement`] and then
//! waits, bounded by the configured consultation timeout, for a
//! [`Resolution`]. [`ChannelResolver`] hands requirements to an in-process
//! [`ReviewQueue`] for embedding applications and tests.

use crate::consultation::{ConsultationId, ConsultationRequirement, Resolution};
use crate::error::ResolverError;
use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};

/// Source of human decisions
#[async_trait]
pub trait ConsultationResolver: Send + Sync {
    /// Hand a consultation to reviewers
    async fn submit(&self, requirement: &ConsultationRequirement) -> Result<(), ResolverError>;

    /// Wait for the decision on a submitted consultation
    async fn await_resolution(&self, id: ConsultationId) -> Result<Resolution, ResolverError>;
}

/// A consultation waiting on a reviewer
#[derive(Debug)]
pub struct PendingConsultation {
    pub requirement: ConsultationRequirement,
    responder: oneshot::Sender<Resolution>,
}

impl PendingConsultation {
    /// Deliver a decision
    ///
    /// # Errors
    /// - `UnknownRequirement` if the resolution answers another consultation
    /// - `Closed` if the run stopped waiting
    pub fn respond(self, resolution: Resolution) -> Result<(), ResolverError> {
        if resolution.requirement_id != self.requirement.id {
            return Err(ResolverError::UnknownRequirement(
                resolution.requirement_id.to_string(),
            ));
        }
        self.responder
            .send(resolution)
            .map_err(|_| ResolverError::Closed)
    }

    /// # Errors
    /// Returns `Closed` if the run stopped waiting
    pub fn approve(self, reviewer: &str, rationale: &str) -> Result<(), ResolverError> {
        let resolution = Resolution::approve(self.requirement.id, reviewer, rationale);
        self.respond(resolution)
    }

    /// # Errors
    /// Returns `Closed` if the run stopped waiting
    pub fn reject(self, reviewer: &str, rationale: &str) -> Result<(), ResolverError> {
        let resolution = Resolution::reject(self.requirement.id, reviewer, rationale);
        self.respond(resolution)
    }
}

/// Reviewer side of a [`ChannelResolver`]
#[derive(Debug)]
pub struct ReviewQueue {
    rx: mpsc::UnboundedReceiver<PendingConsultation>,
}

impl ReviewQueue {
    /// Next submitted consultation; `None` once the resolver is dropped
    pub async fn recv(&mut self) -> Option<PendingConsultation> {
        self.rx.recv().await
    }
}

/// In-process resolver backed by tokio channels
#[derive(Debug)]
pub struct ChannelResolver {
    pending: DashMap<ConsultationId, oneshot::Receiver<Resolution>>,
    outbox: mpsc::UnboundedSender<PendingConsultation>,
}

impl ChannelResolver {
    #[must_use]
    pub fn new() -> (Self, ReviewQueue) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                pending: DashMap::new(),
                outbox,
            },
            ReviewQueue { rx },
        )
    }

    /// Consultations submitted but not yet awaited
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[async_trait]
impl ConsultationResolver for ChannelResolver {
    async fn submit(&self, requirement: &ConsultationRequirement) -> Result<(), ResolverError> {
        let (responder, receiver) = oneshot::channel();
        self.pending.insert(requirement.id, receiver);
        let pending = PendingConsultation {
            requirement: requirement.clone(),
            responder,
        };
        if self.outbox.send(pending).is_err() {
            self.pending.remove(&requirement.id);
            return Err(ResolverError::Closed);
        }
        tracing::debug!(consultation = %requirement.id, "consultation queued for review");
        Ok(())
    }

    async fn await_resolution(&self, id: ConsultationId) -> Result<Resolution, ResolverError> {
        let (_, receiver) = self
            .pending
            .remove(&id)
            .ok_or_else(|| ResolverError::UnknownRequirement(id.to_string()))?;
        receiver.await.map_err(|_| ResolverError::Closed)
    }
}
