// Rule evaluator: RawCandidate -> Obligation
//
// Pure function of (candidate, now, rules). No clock reads, no I/O.
// Money is fixed-point throughout and rounded once, half-up to the cent.

use crate::config::RulesConfig;
use crate::errors::EvaluationError;
use crate::fingerprint::fingerprint;
use crate::models::{Obligation, ObligationKind, ObligationStatus, RawCandidate};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

/// Decimal places every computed amount is rounded to
pub const AMOUNT_SCALE: u32 = 2;

/// Largest amount the obligation store holds (`NUMERIC(20, 2)`)
pub fn max_amount() -> Decimal {
    Decimal::from_i128_with_scale(99_999_999_999_999_999_999, AMOUNT_SCALE)
}

/// Round half-up (midpoint away from zero) to the cent
pub fn round_amount(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero)
}

/// Converts raw candidates into normalized obligations
#[derive(Debug, Clone)]
pub struct RuleEvaluator {
    grace: Duration,
    lead_time: Duration,
    timezone: Tz,
    default_currency: Option<String>,
}

impl RuleEvaluator {
    pub fn new(rules: &RulesConfig) -> Self {
        Self {
            grace: Duration::hours(rules.grace_period_hours),
            lead_time: Duration::days(rules.lead_time_days),
            timezone: rules.timezone,
            default_currency: rules.default_currency.clone(),
        }
    }

    /// Normalize one candidate.
    ///
    /// Obligations past due by more than the grace window are reclassified as
    /// `overdue`; resolved candidates come back `superseded`.
    pub fn evaluate(
        &self,
        raw: &RawCandidate,
        now: DateTime<Utc>,
    ) -> Result<Obligation, EvaluationError> {
        let taxpayer_id = required("taxpayer_id", &raw.taxpayer_id)?;
        let period = required("period", &raw.period)?;
        let kind_text = required("kind", &raw.kind)?;
        let due_text = required("due_at", &raw.due_at)?;

        let category = ObligationKind::parse_category(kind_text)
            .ok_or_else(|| EvaluationError::UnknownKind(kind_text.to_string()))?;
        let due_at = self.parse_due_at(due_text)?;
        let amount = compute_amount(raw)?;

        let kind = if now - due_at > self.grace {
            ObligationKind::Overdue
        } else {
            category
        };

        let status = if raw.resolved {
            ObligationStatus::Superseded
        } else {
            ObligationStatus::Pending
        };

        let currency = raw
            .currency
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_uppercase)
            .or_else(|| self.default_currency.clone());

        Ok(Obligation {
            fingerprint: fingerprint(taxpayer_id, period, category),
            taxpayer_id: taxpayer_id.to_string(),
            period: period.to_string(),
            category,
            kind,
            due_at,
            amount,
            currency,
            description: raw
                .description
                .as_deref()
                .map(str::trim)
                .filter(|d| !d.is_empty())
                .map(str::to_string),
            status,
        })
    }

    /// An obligation becomes actionable `lead_time` before it is due
    pub fn is_actionable(&self, obligation: &Obligation, now: DateTime<Utc>) -> bool {
        now >= obligation.due_at - self.lead_time
    }

    /// Accepts RFC 3339 timestamps or plain dates; a plain date means the end
    /// of that day in the configured timezone.
    fn parse_due_at(&self, value: &str) -> Result<DateTime<Utc>, EvaluationError> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
            return Ok(ts.with_timezone(&Utc));
        }

        let invalid = || EvaluationError::InvalidDate {
            field: "due_at".to_string(),
            value: value.to_string(),
        };

        let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| invalid())?;
        let end_of_day = NaiveTime::from_hms_opt(23, 59, 59).ok_or_else(invalid)?;
        self.timezone
            .from_local_datetime(&date.and_time(end_of_day))
            .earliest()
            .map(|local| local.with_timezone(&Utc))
            .ok_or_else(invalid)
    }
}

fn required<'a>(field: &str, value: &'a str) -> Result<&'a str, EvaluationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EvaluationError::MissingField(field.to_string()));
    }
    Ok(trimmed)
}

/// Parse an optional decimal field. Accepts `1 234.50`, `1_234.5`, `15%` (as 0.15).
fn parse_decimal(field: &str, value: Option<&str>) -> Result<Option<Decimal>, EvaluationError> {
    let Some(text) = value else {
        return Ok(None);
    };

    let cleaned: String = text
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '_')
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }

    let invalid = || EvaluationError::InvalidAmount {
        field: field.to_string(),
        value: text.to_string(),
    };

    let (digits, percent) = match cleaned.strip_suffix('%') {
        Some(stripped) => (stripped, true),
        None => (cleaned.as_str(), false),
    };

    let mut parsed = Decimal::from_str(digits)
        .or_else(|_| Decimal::from_scientific(digits))
        .map_err(|_| invalid())?;
    if percent {
        parsed = parsed.checked_div(Decimal::ONE_HUNDRED).ok_or_else(invalid)?;
    }

    if parsed.is_sign_negative() && !parsed.is_zero() {
        return Err(EvaluationError::NegativeAmount {
            field: field.to_string(),
            value: text.to_string(),
        });
    }
    Ok(Some(parsed))
}

/// Explicit amount wins; otherwise `max(base × rate, minimum)`; otherwise the
/// minimum alone. Rounded once at the end.
fn compute_amount(raw: &RawCandidate) -> Result<Option<Decimal>, EvaluationError> {
    let explicit = parse_decimal("amount", raw.amount.as_deref())?;
    let base = parse_decimal("base_amount", raw.base_amount.as_deref())?;
    let rate = parse_decimal("rate", raw.rate.as_deref())?;
    let minimum = parse_decimal("minimum_amount", raw.minimum_amount.as_deref())?;

    let unrounded = match (explicit, base, rate) {
        (Some(amount), _, _) => Some(amount),
        (None, Some(base), Some(rate)) => {
            let computed = base
                .checked_mul(rate)
                .ok_or_else(|| EvaluationError::InvalidAmount {
                    field: "base_amount".to_string(),
                    value: format!("{} x {}", base, rate),
                })?;
            Some(match minimum {
                Some(min) => computed.max(min),
                None => computed,
            })
        }
        (None, Some(_), None) => return Err(EvaluationError::MissingField("rate".to_string())),
        (None, None, Some(_)) => {
            return Err(EvaluationError::MissingField("base_amount".to_string()))
        }
        (None, None, None) => minimum,
    };

    let Some(amount) = unrounded.map(round_amount) else {
        return Ok(None);
    };
    if amount > max_amount() {
        return Err(EvaluationError::AmountOutOfRange {
            value: amount.to_string(),
            limit: max_amount().to_string(),
        });
    }
    Ok(Some(amount))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> RulesConfig {
        RulesConfig {
            grace_period_hours: 24,
            lead_time_days: 7,
            timezone: chrono_tz::Europe::Budapest,
            default_currency: Some("HUF".to_string()),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn candidate() -> RawCandidate {
        RawCandidate {
            taxpayer_id: "tp-1".to_string(),
            period: "2026-02".to_string(),
            kind: "filing-due".to_string(),
            due_at: "2026-03-03T12:00:00Z".to_string(),
            amount: Some("123.455".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_rounds_half_up_to_the_cent() {
        let evaluator = RuleEvaluator::new(&rules());
        let obligation = evaluator.evaluate(&candidate(), now()).unwrap();
        assert_eq!(obligation.amount, Some(Decimal::new(12346, 2)));
        assert_eq!(obligation.kind, ObligationKind::FilingDue);
        assert_eq!(obligation.status, ObligationStatus::Pending);
        assert_eq!(obligation.currency.as_deref(), Some("HUF"));
    }

    #[test]
    fn test_large_amount_keeps_its_cents() {
        let mut raw = candidate();
        raw.amount = Some("12345678901234567.89".to_string());
        let obligation = RuleEvaluator::new(&rules()).evaluate(&raw, now()).unwrap();
        assert_eq!(
            obligation.amount,
            Some(Decimal::from_str("12345678901234567.89").unwrap())
        );
    }

    #[test]
    fn test_amount_beyond_storable_range_is_rejected() {
        let evaluator = RuleEvaluator::new(&rules());

        let mut raw = candidate();
        raw.amount = Some("999999999999999999.99".to_string());
        assert_eq!(evaluator.evaluate(&raw, now()).unwrap().amount, Some(max_amount()));

        for too_big in ["1e19", "1000000000000000000", "999999999999999999.995"] {
            raw.amount = Some(too_big.to_string());
            assert!(
                matches!(
                    evaluator.evaluate(&raw, now()),
                    Err(EvaluationError::AmountOutOfRange { .. })
                ),
                "{}",
                too_big
            );
        }

        raw.amount = None;
        raw.base_amount = Some("100000000000000000000".to_string());
        raw.rate = Some("50%".to_string());
        assert!(matches!(
            evaluator.evaluate(&raw, now()),
            Err(EvaluationError::AmountOutOfRange { .. })
        ));
    }

    #[test]
    fn test_round_amount_midpoints() {
        assert_eq!(round_amount(Decimal::new(1005, 3)), Decimal::new(101, 2));
        assert_eq!(round_amount(Decimal::new(1004, 3)), Decimal::new(100, 2));
        assert_eq!(round_amount(Decimal::new(2675, 3)), Decimal::new(268, 2));
    }

    #[test]
    fn test_base_times_rate_with_minimum_floor() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.amount = None;
        raw.base_amount = Some("100 000".to_string());
        raw.rate = Some("13%".to_string());
        raw.minimum_amount = Some("41964".to_string());

        // 100000 * 0.13 = 13000 < 41964
        let obligation = evaluator.evaluate(&raw, now()).unwrap();
        assert_eq!(obligation.amount, Some(Decimal::new(4196400, 2)));

        raw.base_amount = Some("500000".to_string());
        let obligation = evaluator.evaluate(&raw, now()).unwrap();
        assert_eq!(obligation.amount, Some(Decimal::new(6500000, 2)));
    }

    #[test]
    fn test_base_without_rate_is_rejected() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.amount = None;
        raw.base_amount = Some("1000".to_string());
        assert_eq!(
            evaluator.evaluate(&raw, now()),
            Err(EvaluationError::MissingField("rate".to_string()))
        );
    }

    #[test]
    fn test_negative_amount_is_rejected() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.amount = Some("-5".to_string());
        assert!(matches!(
            evaluator.evaluate(&raw, now()),
            Err(EvaluationError::NegativeAmount { .. })
        ));
    }

    #[test]
    fn test_unknown_kind_is_an_evaluation_error() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.kind = "lottery-win".to_string();
        assert_eq!(
            evaluator.evaluate(&raw, now()),
            Err(EvaluationError::UnknownKind("lottery-win".to_string()))
        );
    }

    #[test]
    fn test_missing_taxpayer_is_an_evaluation_error() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.taxpayer_id = "   ".to_string();
        assert_eq!(
            evaluator.evaluate(&raw, now()),
            Err(EvaluationError::MissingField("taxpayer_id".to_string()))
        );
    }

    #[test]
    fn test_past_grace_window_becomes_overdue_not_dropped() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.due_at = "2026-02-20T00:00:00Z".to_string();
        let obligation = evaluator.evaluate(&raw, now()).unwrap();
        assert_eq!(obligation.kind, ObligationKind::Overdue);
        assert_eq!(obligation.category, ObligationKind::FilingDue);
    }

    #[test]
    fn test_within_grace_window_keeps_kind() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.due_at = "2026-03-01T00:00:00Z".to_string();
        let obligation = evaluator.evaluate(&raw, now()).unwrap();
        assert_eq!(obligation.kind, ObligationKind::FilingDue);
    }

    #[test]
    fn test_overdue_does_not_change_fingerprint() {
        let evaluator = RuleEvaluator::new(&rules());
        let on_time = evaluator.evaluate(&candidate(), now()).unwrap();
        let late = evaluator
            .evaluate(&candidate(), now() + Duration::days(30))
            .unwrap();
        assert_eq!(late.kind, ObligationKind::Overdue);
        assert_eq!(on_time.fingerprint, late.fingerprint);
    }

    #[test]
    fn test_plain_date_means_end_of_day_local() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.due_at = "2026-03-16".to_string();
        let obligation = evaluator.evaluate(&raw, now()).unwrap();
        // Budapest is UTC+1 in March before DST
        assert_eq!(
            obligation.due_at,
            Utc.with_ymd_and_hms(2026, 3, 16, 22, 59, 59).unwrap()
        );
    }

    #[test]
    fn test_invalid_date_is_rejected() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.due_at = "next tuesday".to_string();
        assert!(matches!(
            evaluator.evaluate(&raw, now()),
            Err(EvaluationError::InvalidDate { .. })
        ));
    }

    #[test]
    fn test_resolved_candidate_is_superseded() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.resolved = true;
        let obligation = evaluator.evaluate(&raw, now()).unwrap();
        assert_eq!(obligation.status, ObligationStatus::Superseded);
    }

    #[test]
    fn test_actionability_uses_lead_time() {
        let evaluator = RuleEvaluator::new(&rules());
        let mut raw = candidate();
        raw.due_at = "2026-03-20T00:00:00Z".to_string();
        let far = evaluator.evaluate(&raw, now()).unwrap();
        assert!(!evaluator.is_actionable(&far, now()));
        assert!(evaluator.is_actionable(&far, now() + Duration::days(12)));

        let near = evaluator.evaluate(&candidate(), now()).unwrap();
        assert!(evaluator.is_actionable(&near, now()));
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let evaluator = RuleEvaluator::new(&rules());
        let first = evaluator.evaluate(&candidate(), now()).unwrap();
        let second = evaluator.evaluate(&candidate(), now()).unwrap();
        assert_eq!(first, second);
    }
}
