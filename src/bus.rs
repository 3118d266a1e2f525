//! Pipeline event channel.
//!
//! A bounded mpsc queue decouples scrape completion from downstream
//! notification work. The pipeline owns the sending half; the alert
//! notifier owns the receiving half. Dropping the last sender closes the
//! channel, so subscriber lifetime is explicit rather than hidden behind a
//! global emitter.

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::util::env::env_parse;

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    RunCompleted {
        run_id: Uuid,
        website_ids: Vec<i64>,
        products_seen: u64,
        prices_recorded: u64,
    },
}

pub type EventSender = mpsc::Sender<PipelineEvent>;
pub type EventReceiver = mpsc::Receiver<PipelineEvent>;

/// Bounded event channel; depth is a deployment tunable.
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::channel(env_parse("PIPELINE_EVENT_DEPTH", 16usize))
}
