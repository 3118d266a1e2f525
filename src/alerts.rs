//! Price-drop alerts.
//!
//! Users register a watch (product + target price). After each pipeline run
//! the notifier task wakes up (on the run-completed event, after a short
//! grace delay) and emails every watch whose product latest price sits at
//! or below its threshold. The pipeline never awaits this work.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::bus::{EventReceiver, PipelineEvent};
use crate::catalog::{AlertTrigger, CatalogStore};
use crate::util::env::env_parse;

/// Delivery boundary. Production wires an SMTP-backed implementation;
/// everywhere else runs the dry-run logger.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_price_drop(&self, trigger: &AlertTrigger) -> Result<()>;
}

/// Dry-run notifier: logs what would have been sent.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_price_drop(&self, trigger: &AlertTrigger) -> Result<()> {
        info!(
            email = %trigger.email,
            product = %trigger.product_name,
            threshold_minor = trigger.threshold_minor,
            current_minor = trigger.current_minor,
            "dry-run price drop notification"
        );
        Ok(())
    }
}

/// Grace period between run completion and alert evaluation.
pub fn alert_delay() -> Duration {
    Duration::from_millis(env_parse("ALERT_DELAY_MS", 5_000u64))
}

/// Evaluate due watches and dispatch one notification per trigger.
/// Per-trigger delivery failures are logged and do not stop the rest.
pub async fn notify_due_alerts<S: CatalogStore + ?Sized>(
    store: &S,
    notifier: &dyn Notifier,
) -> Result<usize> {
    let triggers = store.due_price_alerts().await?;
    let mut sent = 0usize;
    for trigger in &triggers {
        match notifier.send_price_drop(trigger).await {
            Ok(()) => sent += 1,
            Err(err) => {
                warn!(watch_id = trigger.watch_id, error = %err, "price drop notification failed");
            }
        }
    }
    if !triggers.is_empty() {
        info!(due = triggers.len(), sent, "price drop alerts dispatched");
    }
    Ok(sent)
}

/// Long-running notifier task: owns the receiving half of the pipeline
/// event channel and exits when the channel closes.
pub async fn run_alert_notifier<S: CatalogStore + ?Sized>(
    store: Arc<S>,
    notifier: Arc<dyn Notifier>,
    mut events: EventReceiver,
    delay: Duration,
) {
    while let Some(event) = events.recv().await {
        let PipelineEvent::RunCompleted { run_id, .. } = event;
        tokio::time::sleep(delay).await;
        if let Err(err) = notify_due_alerts(store.as_ref(), notifier.as_ref()).await {
            error!(%run_id, error = %err, "alert evaluation failed");
        }
    }
}
