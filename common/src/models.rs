use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::str::FromStr;
use uuid::Uuid;

// Helper functions for Tz serialization
pub(crate) fn serialize_tz<S>(tz: &Tz, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&tz.to_string())
}

pub(crate) fn deserialize_tz<'de, D>(deserializer: D) -> Result<Tz, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Tz::from_str(&s).map_err(serde::de::Error::custom)
}

pub(crate) fn default_tz() -> Tz {
    chrono_tz::UTC
}

// ============================================================================
// Source Models
// ============================================================================

/// RawCandidate is the fixed shape every source adapter normalizes into.
///
/// Monetary values stay decimal strings until the evaluator parses them, so no
/// float ever touches an amount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCandidate {
    pub taxpayer_id: String,
    pub period: String,
    pub kind: String,
    pub due_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_amount: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub resolved: bool,
}

// ============================================================================
// Obligation Models
// ============================================================================

/// Category of tax-related work
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ObligationKind {
    FilingDue,
    PaymentDue,
    EstimateReminder,
    Overdue,
}

impl ObligationKind {
    /// Parse a source category, tolerating case, `_`/space separators and short aliases
    pub fn parse_category(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase().replace(|c: char| c == '_' || c == ' ', "-");
        match normalized.as_str() {
            "filing-due" | "filing" | "return-due" => Some(ObligationKind::FilingDue),
            "payment-due" | "payment" => Some(ObligationKind::PaymentDue),
            "estimate-reminder" | "estimate" | "estimated-payment" => {
                Some(ObligationKind::EstimateReminder)
            }
            "overdue" => Some(ObligationKind::Overdue),
            _ => None,
        }
    }

    /// Human readable label used in notification messages
    pub fn label(&self) -> &'static str {
        match self {
            ObligationKind::FilingDue => "Filing due",
            ObligationKind::PaymentDue => "Payment due",
            ObligationKind::EstimateReminder => "Estimated payment reminder",
            ObligationKind::Overdue => "Overdue",
        }
    }
}

impl std::fmt::Display for ObligationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObligationKind::FilingDue => write!(f, "filing-due"),
            ObligationKind::PaymentDue => write!(f, "payment-due"),
            ObligationKind::EstimateReminder => write!(f, "estimate-reminder"),
            ObligationKind::Overdue => write!(f, "overdue"),
        }
    }
}

impl FromStr for ObligationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_category(s).ok_or_else(|| format!("Invalid obligation kind: {}", s))
    }
}

impl TryFrom<String> for ObligationKind {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// ObligationStatus tracks where an obligation is in its lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ObligationStatus {
    Pending,
    Notified,
    Failed,
    Superseded,
}

impl std::fmt::Display for ObligationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObligationStatus::Pending => write!(f, "pending"),
            ObligationStatus::Notified => write!(f, "notified"),
            ObligationStatus::Failed => write!(f, "failed"),
            ObligationStatus::Superseded => write!(f, "superseded"),
        }
    }
}

impl FromStr for ObligationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ObligationStatus::Pending),
            "notified" => Ok(ObligationStatus::Notified),
            "failed" => Ok(ObligationStatus::Failed),
            "superseded" => Ok(ObligationStatus::Superseded),
            _ => Err(format!("Invalid obligation status: {}", s)),
        }
    }
}

impl TryFrom<String> for ObligationStatus {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// Obligation is the normalized unit of work, one per fingerprint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct Obligation {
    pub fingerprint: String,
    pub taxpayer_id: String,
    pub period: String,
    /// Source category the fingerprint is derived from
    #[sqlx(try_from = "String")]
    pub category: ObligationKind,
    /// Effective kind; differs from `category` once the obligation is overdue
    #[sqlx(try_from = "String")]
    pub kind: ObligationKind,
    pub due_at: DateTime<Utc>,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: ObligationStatus,
}

impl Obligation {
    /// Merge freshly evaluated fields into a stored obligation.
    ///
    /// Identity stays the same and a `notified` status is never downgraded.
    /// Otherwise only supersession (or its reversal) changes the stored status;
    /// `failed` stays until an action record says otherwise.
    pub fn merge_from(&mut self, fresh: &Obligation) {
        debug_assert_eq!(self.fingerprint, fresh.fingerprint);
        self.kind = fresh.kind;
        self.due_at = fresh.due_at;
        self.amount = fresh.amount;
        self.currency = fresh.currency.clone();
        self.description = fresh.description.clone();
        self.status = match (self.status, fresh.status) {
            (ObligationStatus::Notified, _) => ObligationStatus::Notified,
            (_, ObligationStatus::Superseded) => ObligationStatus::Superseded,
            (ObligationStatus::Superseded, fresh_status) => fresh_status,
            (stored, _) => stored,
        };
    }
}

// ============================================================================
// ActionRecord Models
// ============================================================================

/// Outcome persisted in an ActionRecord
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
}

impl std::fmt::Display for RecordOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordOutcome::Success => write!(f, "success"),
            RecordOutcome::TransientFailure => write!(f, "transient_failure"),
            RecordOutcome::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

impl FromStr for RecordOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RecordOutcome::Success),
            "transient_failure" => Ok(RecordOutcome::TransientFailure),
            "permanent_failure" => Ok(RecordOutcome::PermanentFailure),
            _ => Err(format!("Invalid record outcome: {}", s)),
        }
    }
}

impl TryFrom<String> for RecordOutcome {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::from_str(&s)
    }
}

/// ActionRecord is durable evidence that an obligation was acted upon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, FromRow)]
pub struct ActionRecord {
    pub fingerprint: String,
    pub acted_at: DateTime<Utc>,
    #[sqlx(try_from = "String")]
    pub outcome: RecordOutcome,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ActionRecord {
    /// A first-attempt success record
    pub fn success(fingerprint: impl Into<String>, acted_at: DateTime<Utc>, attempt_count: i32) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            acted_at,
            outcome: RecordOutcome::Success,
            attempt_count,
            last_error: None,
            next_attempt_at: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RecordOutcome::Success
    }

    pub fn is_permanent_failure(&self) -> bool {
        self.outcome == RecordOutcome::PermanentFailure
    }

    /// Obligation status implied by this record
    pub fn obligation_status(&self) -> ObligationStatus {
        match self.outcome {
            RecordOutcome::Success => ObligationStatus::Notified,
            RecordOutcome::TransientFailure | RecordOutcome::PermanentFailure => {
                ObligationStatus::Failed
            }
        }
    }
}

// ============================================================================
// Schedule Models
// ============================================================================

/// Schedule defines when the bot should run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Schedule {
    Interval {
        interval_seconds: u64,
    },
    Daily {
        /// Local wall-clock time, `HH:MM`
        time: String,
        #[serde(
            default = "default_tz",
            serialize_with = "serialize_tz",
            deserialize_with = "deserialize_tz"
        )]
        timezone: Tz,
    },
    Cron {
        expression: String,
        #[serde(
            default = "default_tz",
            serialize_with = "serialize_tz",
            deserialize_with = "deserialize_tz"
        )]
        timezone: Tz,
    },
    OnDemand,
}

// ============================================================================
// Run Models
// ============================================================================

/// TriggerSource represents how a run was started
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Scheduled,
    Manual,
    Startup,
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerSource::Scheduled => write!(f, "scheduled"),
            TriggerSource::Manual => write!(f, "manual"),
            TriggerSource::Startup => write!(f, "startup"),
        }
    }
}

impl FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(TriggerSource::Scheduled),
            "manual" => Ok(TriggerSource::Manual),
            "startup" => Ok(TriggerSource::Startup),
            _ => Err(format!("Invalid trigger source: {}", s)),
        }
    }
}

/// Phases of a single run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Fetching,
    Evaluating,
    Filtering,
    Acting,
    Recording,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RunPhase::Idle => "idle",
            RunPhase::Fetching => "fetching",
            RunPhase::Evaluating => "evaluating",
            RunPhase::Filtering => "filtering",
            RunPhase::Acting => "acting",
            RunPhase::Recording => "recording",
        };
        write!(f, "{}", name)
    }
}

/// How a run ended as a whole
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    SourceUnavailable,
    StoreUnavailable,
    SkippedOverlap,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Completed => write!(f, "completed"),
            RunOutcome::SourceUnavailable => write!(f, "source_unavailable"),
            RunOutcome::StoreUnavailable => write!(f, "store_unavailable"),
            RunOutcome::SkippedOverlap => write!(f, "skipped_overlap"),
        }
    }
}

impl FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(RunOutcome::Completed),
            "source_unavailable" => Ok(RunOutcome::SourceUnavailable),
            "store_unavailable" => Ok(RunOutcome::StoreUnavailable),
            "skipped_overlap" => Ok(RunOutcome::SkippedOverlap),
            _ => Err(format!("Invalid run outcome: {}", s)),
        }
    }
}

/// Why an evaluated obligation was not acted on in this run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyHandled,
    NotYetDue,
    Superseded,
    BackingOff,
    AwaitingOperator,
    CircuitOpen,
    ShuttingDown,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::AlreadyHandled => write!(f, "already_handled"),
            SkipReason::NotYetDue => write!(f, "not_yet_due"),
            SkipReason::Superseded => write!(f, "superseded"),
            SkipReason::BackingOff => write!(f, "backing_off"),
            SkipReason::AwaitingOperator => write!(f, "awaiting_operator"),
            SkipReason::CircuitOpen => write!(f, "circuit_open"),
            SkipReason::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Aggregated result of one run, for operators and for the exit code
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub trigger: TriggerSource,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: RunOutcome,
    pub phase_reached: RunPhase,
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: BTreeMap<SkipReason, usize>,
    pub evaluation_errors: usize,
    /// Fingerprints that reached permanent failure during this run
    pub permanent_failures: Vec<String>,
    /// Fingerprints still parked in permanent failure from earlier runs
    pub awaiting_operator: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    pub fn new(trigger: TriggerSource, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            trigger,
            started_at,
            finished_at: None,
            outcome: RunOutcome::Completed,
            phase_reached: RunPhase::Idle,
            fetched: 0,
            succeeded: 0,
            failed: 0,
            skipped: BTreeMap::new(),
            evaluation_errors: 0,
            permanent_failures: Vec::new(),
            awaiting_operator: Vec::new(),
            error: None,
        }
    }

    pub fn skip(&mut self, reason: SkipReason) {
        *self.skipped.entry(reason).or_insert(0) += 1;
    }

    pub fn skipped_total(&self) -> usize {
        self.skipped.values().sum()
    }

    /// Whether every obligation that was attempted committed successfully
    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed && self.failed == 0
    }

    /// Process exit code for one-shot invocations.
    ///
    /// 0: clean, 1: permanent failure reached in this run, 2: fetch or store failed.
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RunOutcome::SourceUnavailable | RunOutcome::StoreUnavailable => 2,
            RunOutcome::SkippedOverlap => 0,
            RunOutcome::Completed if !self.permanent_failures.is_empty() => 1,
            RunOutcome::Completed => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obligation(status: ObligationStatus) -> Obligation {
        Obligation {
            fingerprint: "fp".to_string(),
            taxpayer_id: "tp-1".to_string(),
            period: "2026-Q1".to_string(),
            category: ObligationKind::FilingDue,
            kind: ObligationKind::FilingDue,
            due_at: Utc.with_ymd_and_hms(2026, 4, 15, 23, 59, 59).unwrap(),
            amount: Some(Decimal::new(12346, 2)),
            currency: Some("HUF".to_string()),
            description: None,
            status,
        }
    }

    #[test]
    fn test_kind_aliases() {
        assert_eq!(
            ObligationKind::parse_category("Filing_Due"),
            Some(ObligationKind::FilingDue)
        );
        assert_eq!(
            ObligationKind::parse_category(" payment "),
            Some(ObligationKind::PaymentDue)
        );
        assert_eq!(
            ObligationKind::parse_category("estimate reminder"),
            Some(ObligationKind::EstimateReminder)
        );
        assert_eq!(ObligationKind::parse_category("lottery"), None);
    }

    #[test]
    fn test_status_round_trip_through_db_strings() {
        for status in [
            ObligationStatus::Pending,
            ObligationStatus::Notified,
            ObligationStatus::Failed,
            ObligationStatus::Superseded,
        ] {
            assert_eq!(ObligationStatus::from_str(&status.to_string()), Ok(status));
        }
        assert!(RecordOutcome::from_str("maybe").is_err());
    }

    #[test]
    fn test_merge_never_downgrades_notified() {
        let mut stored = obligation(ObligationStatus::Notified);
        let mut fresh = obligation(ObligationStatus::Pending);
        fresh.amount = Some(Decimal::new(50000, 2));
        fresh.kind = ObligationKind::Overdue;

        stored.merge_from(&fresh);

        assert_eq!(stored.status, ObligationStatus::Notified);
        assert_eq!(stored.amount, Some(Decimal::new(50000, 2)));
        assert_eq!(stored.kind, ObligationKind::Overdue);
        assert_eq!(stored.category, ObligationKind::FilingDue);
    }

    #[test]
    fn test_merge_updates_status_when_not_notified() {
        let mut stored = obligation(ObligationStatus::Failed);
        stored.merge_from(&obligation(ObligationStatus::Superseded));
        assert_eq!(stored.status, ObligationStatus::Superseded);
    }

    #[test]
    fn test_merge_keeps_failed_and_revives_superseded() {
        let mut stored = obligation(ObligationStatus::Failed);
        stored.merge_from(&obligation(ObligationStatus::Pending));
        assert_eq!(stored.status, ObligationStatus::Failed);

        let mut stored = obligation(ObligationStatus::Superseded);
        stored.merge_from(&obligation(ObligationStatus::Pending));
        assert_eq!(stored.status, ObligationStatus::Pending);
    }

    #[test]
    fn test_exit_codes() {
        let mut summary = RunSummary::new(TriggerSource::Manual, Utc::now());
        assert_eq!(summary.exit_code(), 0);

        summary.permanent_failures.push("fp".to_string());
        assert_eq!(summary.exit_code(), 1);

        summary.outcome = RunOutcome::SourceUnavailable;
        assert_eq!(summary.exit_code(), 2);

        summary.outcome = RunOutcome::SkippedOverlap;
        assert_eq!(summary.exit_code(), 0);
    }

    #[test]
    fn test_schedule_deserializes_from_tagged_table() {
        let schedule: Schedule = serde_json::from_value(serde_json::json!({
            "mode": "daily",
            "time": "09:30",
            "timezone": "Europe/Budapest"
        }))
        .unwrap();
        assert_eq!(
            schedule,
            Schedule::Daily {
                time: "09:30".to_string(),
                timezone: chrono_tz::Europe::Budapest,
            }
        );
    }
}
