// Log notifier
// Writes the notification to the structured log. Always delivers.

use crate::fingerprint::short;
use crate::models::Obligation;
use crate::notifier::{format_amount, ActionOutcome, Notifier};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn act(&self, obligation: &Obligation) -> ActionOutcome {
        info!(
            fingerprint = %short(&obligation.fingerprint),
            taxpayer_id = %obligation.taxpayer_id,
            period = %obligation.period,
            kind = %obligation.kind,
            due_at = %obligation.due_at,
            amount = obligation.amount.map(format_amount).as_deref().unwrap_or("-"),
            currency = obligation.currency.as_deref().unwrap_or("-"),
            "Obligation notification"
        );
        ActionOutcome::Delivered
    }
}
