//! Monitoring channel.
//!
//! Every attempt start, attempt end and retry decision is published on a
//! bounded broadcast channel and logged through `tracing`. Slow subscribers
//! lose the oldest events (`RecvError::Lagged`); senders never wait.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::{Execution, Outcome};

/// What happened to an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// Handler is about to run
    Started,
    /// Attempt finished with the given outcome
    Finished(Outcome),
    /// Attempt failed and another one is scheduled
    RetryScheduled { delay_ms: u64 },
}

#[derive(Debug, Clone)]
pub struct MonitorEvent {
    pub job_name: String,
    pub execution_id: Ulid,
    pub attempt: u32,
    pub kind: EventKind,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Set on the last event of a firing
    pub terminal: bool,
}

impl MonitorEvent {
    fn from_execution(execution: &Execution, kind: EventKind, terminal: bool) -> Self {
        let duration_ms = match kind {
            EventKind::Started => 0,
            _ => execution.duration_ms(),
        };
        Self {
            job_name: execution.job_name.clone(),
            execution_id: execution.id,
            attempt: execution.attempt,
            kind,
            duration_ms,
            timestamp: Utc::now(),
            terminal,
        }
    }

    pub fn started(execution: &Execution) -> Self {
        Self::from_execution(execution, EventKind::Started, false)
    }

    pub fn finished(execution: &Execution, outcome: Outcome, terminal: bool) -> Self {
        Self::from_execution(execution, EventKind::Finished(outcome), terminal)
    }

    pub fn retry_scheduled(execution: &Execution, delay_ms: u64) -> Self {
        Self::from_execution(execution, EventKind::RetryScheduled { delay_ms }, false)
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        match &self.kind {
            EventKind::Finished(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Publisher side of the monitoring channel.
#[derive(Debug, Clone)]
pub struct Monitor {
    tx: broadcast::Sender<MonitorEvent>,
}

impl Monitor {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Log and publish `event`. Having no subscribers is fine.
    pub fn emit(&self, event: MonitorEvent) {
        match &event.kind {
            EventKind::Started => tracing::debug!(
                job = %event.job_name,
                execution = %event.execution_id,
                attempt = event.attempt,
                "Job started"
            ),
            EventKind::Finished(Outcome::Success) => tracing::info!(
                job = %event.job_name,
                execution = %event.execution_id,
                attempt = event.attempt,
                duration_ms = event.duration_ms,
                "Job completed successfully"
            ),
            EventKind::Finished(Outcome::Skipped(reason)) => tracing::info!(
                job = %event.job_name,
                execution = %event.execution_id,
                attempt = event.attempt,
                reason = %reason,
                "Job skipped"
            ),
            EventKind::Finished(outcome) if event.terminal => tracing::error!(
                job = %event.job_name,
                execution = %event.execution_id,
                attempt = event.attempt,
                duration_ms = event.duration_ms,
                outcome = %outcome,
                "Job failed"
            ),
            EventKind::Finished(outcome) => tracing::warn!(
                job = %event.job_name,
                execution = %event.execution_id,
                attempt = event.attempt,
                duration_ms = event.duration_ms,
                outcome = %outcome,
                "Job attempt failed"
            ),
            EventKind::RetryScheduled { delay_ms } => tracing::info!(
                job = %event.job_name,
                execution = %event.execution_id,
                attempt = event.attempt,
                delay_ms = *delay_ms,
                "Retry scheduled"
            ),
        }
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
