//! Structured progress events.
//!
//! A [`Ranker`](super::Ranker) emits events into a [`ProgressReporter`]; the
//! caller consumes them from the paired [`ProgressStream`]. The stream is
//! finite (it ends once every reporter clone is dropped) and can be read once.

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use serde::Serialize;

use crate::category::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    SelectingCandidates,
    Prompting,
    AwaitingOracle,
    Validating,
    Persisting,
    Completed,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub category: Category,
    pub phase: Phase,
    pub processed: usize,
    pub total: usize,
}

pub type ProgressStream = UnboundedReceiver<ProgressEvent>;

/// Sending half. The default reporter discards everything.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    tx: Option<UnboundedSender<ProgressEvent>>,
}

impl ProgressReporter {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, category: Category, phase: Phase, processed: usize, total: usize) {
        if let Some(tx) = &self.tx {
            // A dropped receiver just means nobody is listening.
            let _ = tx.unbounded_send(ProgressEvent {
                category,
                phase,
                processed,
                total,
            });
        }
    }
}

pub fn progress_channel() -> (ProgressReporter, ProgressStream) {
    let (tx, rx) = unbounded();
    (ProgressReporter { tx: Some(tx) }, rx)
}
