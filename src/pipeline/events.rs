//! Non-blocking publication of pipeline events to the presentation layer.

use crate::pipeline::types::PipelineEvent;
use crossbeam_channel::{Sender, TrySendError};

/// Cloneable handle that publishes [`PipelineEvent`]s without ever blocking
/// a pipeline stage. When the consumer falls behind, events are dropped.
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventPublisher {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A publisher that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn publish(&self, event: PipelineEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(?event, "event consumer is behind, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}
