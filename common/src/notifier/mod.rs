// Notifiers (action executors)
// Deliver one obligation to the outside world and classify the result.

pub mod log;
pub mod telegram;
pub mod webhook;

pub use log::LogNotifier;
pub use telegram::TelegramNotifier;
pub use webhook::WebhookNotifier;

use crate::evaluator::round_amount;
use crate::fingerprint::short;
use crate::models::Obligation;
use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;

/// Result of one delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Delivered,
    /// Worth retrying on a later run
    Transient(String),
    /// Needs operator intervention
    Permanent(String),
}

impl ActionOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, ActionOutcome::Delivered)
    }
}

/// Notifier performs the action for an obligation.
///
/// Delivery failures are outcomes, not errors: a notifier never aborts a run.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn act(&self, obligation: &Obligation) -> ActionOutcome;
}

/// Map an HTTP status to an outcome: 2xx delivered, 408/429/5xx transient,
/// any other status permanent.
pub fn classify_status(status: StatusCode, body: &str) -> ActionOutcome {
    if status.is_success() {
        return ActionOutcome::Delivered;
    }

    let reason = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), truncate(body, 200))
    };

    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        ActionOutcome::Transient(reason)
    } else {
        ActionOutcome::Permanent(reason)
    }
}

/// Map a transport error. Timeouts and connection failures are transient;
/// a request that could not even be built is permanent.
pub fn classify_error(err: &reqwest::Error) -> ActionOutcome {
    if err.is_builder() {
        ActionOutcome::Permanent(format!("invalid request: {}", err))
    } else if err.is_timeout() {
        ActionOutcome::Transient(format!("timed out: {}", err))
    } else {
        ActionOutcome::Transient(format!("request failed: {}", err))
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Format an amount with space thousands separators and two decimals:
/// `1234567.5` becomes `1 234 567.50`.
pub fn format_amount(amount: Decimal) -> String {
    let rounded = round_amount(amount);
    let text = format!("{:.2}", rounded.abs());
    let (whole, fraction) = text.split_once('.').unwrap_or((text.as_str(), "00"));

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push(' ');
        }
        grouped.push(ch);
    }

    let sign = if rounded.is_sign_negative() && !rounded.is_zero() {
        "-"
    } else {
        ""
    };
    format!("{}{}.{}", sign, grouped, fraction)
}

/// Escape text for Telegram HTML parse mode
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// HTML notification body shared by the chat notifiers
pub fn render_message(obligation: &Obligation) -> String {
    let mut lines = vec![
        format!("<b>{}</b>", obligation.kind.label()),
        format!("Taxpayer: {}", escape_html(&obligation.taxpayer_id)),
        format!("Period: {}", escape_html(&obligation.period)),
        format!("Due: {}", obligation.due_at.format("%Y-%m-%d %H:%M UTC")),
    ];

    if let Some(amount) = obligation.amount {
        let currency = obligation
            .currency
            .as_deref()
            .map(|c| format!(" {}", escape_html(c)))
            .unwrap_or_default();
        lines.push(format!("Amount: <b>{}</b>{}", format_amount(amount), currency));
    }
    if let Some(description) = &obligation.description {
        lines.push(escape_html(description));
    }
    lines.push(format!("<code>{}</code>", short(&obligation.fingerprint)));

    lines.join("\n")
}
