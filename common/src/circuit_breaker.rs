// Circuit breaker around the notifier
//
// Consecutive transient delivery failures open the circuit; while it is open
// the remaining obligations of the run are deferred without spending an
// attempt. Permanent failures never count against the receiver.

use crate::config::CircuitBreakerConfig;
use crate::models::Obligation;
use crate::notifier::{ActionOutcome, Notifier};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Externally visible breaker position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    /// Cool-down elapsed; one probe delivery is in flight
    HalfOpen,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

impl Phase {
    fn state(&self) -> CircuitState {
        match self {
            Phase::Closed { .. } => CircuitState::Closed,
            Phase::Open { .. } => CircuitState::Open,
            Phase::HalfOpen => CircuitState::HalfOpen,
        }
    }
}

/// Returned instead of an outcome when the circuit is open
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Circuit breaker '{name}' is open")]
pub struct CircuitOpen {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cool_down: Duration,
    phase: Arc<RwLock<Phase>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cool_down: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cool_down,
            phase: Arc::new(RwLock::new(Phase::Closed { failures: 0 })),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.timeout_seconds),
        )
    }

    pub async fn state(&self) -> CircuitState {
        self.phase.read().await.state()
    }

    /// Consecutive transient failures while closed
    pub async fn failures(&self) -> u32 {
        match *self.phase.read().await {
            Phase::Closed { failures } => failures,
            _ => self.failure_threshold,
        }
    }

    /// Deliver through the breaker. A call exceeding `limit` is a
    /// transient failure and counts against the receiver.
    pub async fn act(
        &self,
        notifier: &dyn Notifier,
        obligation: &Obligation,
        limit: Duration,
    ) -> Result<ActionOutcome, CircuitOpen> {
        self.admit().await?;

        let outcome = tokio::time::timeout(limit, notifier.act(obligation))
            .await
            .unwrap_or_else(|_| {
                ActionOutcome::Transient(format!(
                    "{} notifier timed out after {}s",
                    notifier.name(),
                    limit.as_secs()
                ))
            });

        match &outcome {
            ActionOutcome::Delivered => self.settle(true).await,
            ActionOutcome::Transient(_) => self.settle(false).await,
            // The receiver answered; only a pending probe cares
            ActionOutcome::Permanent(_) => self.probe_answered().await,
        }
        Ok(outcome)
    }

    /// Closed admits everyone. After the cool-down exactly one caller becomes
    /// the probe; everyone else is rejected until the probe settles.
    async fn admit(&self) -> Result<(), CircuitOpen> {
        let mut phase = self.phase.write().await;
        match *phase {
            Phase::Closed { .. } => Ok(()),
            Phase::Open { since } if since.elapsed() >= self.cool_down => {
                info!(circuit_breaker = %self.name, "Cool-down elapsed, probing receiver");
                *phase = Phase::HalfOpen;
                Ok(())
            }
            Phase::Open { .. } | Phase::HalfOpen => Err(CircuitOpen {
                name: self.name.clone(),
            }),
        }
    }

    async fn settle(&self, delivered: bool) {
        let mut phase = self.phase.write().await;
        let next = match (*phase, delivered) {
            (Phase::HalfOpen, true) => {
                info!(circuit_breaker = %self.name, "Receiver recovered, circuit closed");
                Phase::Closed { failures: 0 }
            }
            (Phase::Closed { .. }, true) => Phase::Closed { failures: 0 },
            (Phase::Closed { failures }, false) if failures + 1 < self.failure_threshold => {
                Phase::Closed {
                    failures: failures + 1,
                }
            }
            (Phase::Open { since }, true) => Phase::Open { since },
            (_, false) => {
                warn!(
                    circuit_breaker = %self.name,
                    threshold = self.failure_threshold,
                    cool_down_secs = self.cool_down.as_secs(),
                    "Receiver failing, circuit opened"
                );
                Phase::Open {
                    since: Instant::now(),
                }
            }
        };
        *phase = next;
    }

    async fn probe_answered(&self) {
        let mut phase = self.phase.write().await;
        if let Phase::HalfOpen = *phase {
            info!(circuit_breaker = %self.name, "Receiver answered probe, circuit closed");
            *phase = Phase::Closed { failures: 0 };
        }
    }

    /// Back to Closed; called at the start of every run
    pub async fn reset(&self) {
        *self.phase.write().await = Phase::Closed { failures: 0 };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ObligationKind, ObligationStatus};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::sleep;

    /// Replays scripted outcomes and counts calls
    struct Scripted {
        outcomes: Mutex<Vec<ActionOutcome>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut outcomes: Vec<ActionOutcome>) -> Self {
            outcomes.reverse();
            Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Notifier for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn act(&self, _obligation: &Obligation) -> ActionOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(ActionOutcome::Delivered)
        }
    }

    fn obligation() -> Obligation {
        Obligation {
            fingerprint: "fp".to_string(),
            taxpayer_id: "tp".to_string(),
            period: "2026-Q1".to_string(),
            category: ObligationKind::FilingDue,
            kind: ObligationKind::FilingDue,
            due_at: Utc::now(),
            amount: None,
            currency: None,
            description: None,
            status: ObligationStatus::Pending,
        }
    }

    const LIMIT: Duration = Duration::from_secs(5);

    fn transient() -> ActionOutcome {
        ActionOutcome::Transient("HTTP 503".to_string())
    }

    #[tokio::test]
    async fn test_opens_after_threshold_and_rejects() {
        let cb = CircuitBreaker::new("notifier", 2, Duration::from_secs(60));
        let notifier = Scripted::new(vec![transient(), transient()]);

        assert_eq!(cb.act(&notifier, &obligation(), LIMIT).await, Ok(transient()));
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.act(&notifier, &obligation(), LIMIT).await, Ok(transient()));
        assert_eq!(cb.state().await, CircuitState::Open);

        let rejected = cb.act(&notifier, &obligation(), LIMIT).await;
        assert!(rejected.is_err());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }

    struct Hanging;

    #[async_trait]
    impl Notifier for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn act(&self, _obligation: &Obligation) -> ActionOutcome {
            sleep(Duration::from_secs(60)).await;
            ActionOutcome::Delivered
        }
    }

    #[tokio::test]
    async fn test_timeout_is_transient_and_counts() {
        let cb = CircuitBreaker::new("notifier", 1, Duration::from_secs(60));
        let outcome = cb
            .act(&Hanging, &obligation(), Duration::from_millis(50))
            .await
            .unwrap();
        assert!(matches!(outcome, ActionOutcome::Transient(reason) if reason.contains("timed out")));
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_permanent_failures_do_not_trip() {
        let cb = CircuitBreaker::new("notifier", 1, Duration::from_secs(60));
        let notifier = Scripted::new(vec![ActionOutcome::Permanent("HTTP 400".to_string())]);
        cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::Closed);
        assert_eq!(cb.failures().await, 0);
    }

    #[tokio::test]
    async fn test_half_open_probe_closes_on_success() {
        let cb = CircuitBreaker::new("notifier", 1, Duration::from_millis(100));
        let notifier = Scripted::new(vec![transient()]);
        cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::Open);

        sleep(Duration::from_millis(150)).await;

        assert_eq!(
            cb.act(&notifier, &obligation(), LIMIT).await,
            Ok(ActionOutcome::Delivered)
        );
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let cb = CircuitBreaker::new("notifier", 1, Duration::from_millis(100));
        let notifier = Scripted::new(vec![transient(), transient()]);
        cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        sleep(Duration::from_millis(150)).await;
        cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_and_reset_closes() {
        let cb = CircuitBreaker::new("notifier", 3, Duration::from_secs(60));
        let notifier = Scripted::new(vec![transient(), transient(), ActionOutcome::Delivered]);
        for _ in 0..2 {
            cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        }
        assert_eq!(cb.failures().await, 2);
        cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        assert_eq!(cb.failures().await, 0);

        let tripping = Scripted::new(vec![transient(), transient(), transient()]);
        for _ in 0..3 {
            cb.act(&tripping, &obligation(), LIMIT).await.unwrap();
        }
        assert_eq!(cb.state().await, CircuitState::Open);
        cb.reset().await;
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    struct Slow(AtomicUsize);

    #[async_trait]
    impl Notifier for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn act(&self, _obligation: &Obligation) -> ActionOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            sleep(Duration::from_millis(50)).await;
            ActionOutcome::Delivered
        }
    }

    #[tokio::test]
    async fn test_half_open_admits_a_single_probe() {
        let cb = CircuitBreaker::new("notifier", 1, Duration::from_millis(100));
        cb.act(&Scripted::new(vec![transient()]), &obligation(), LIMIT)
            .await
            .unwrap();
        sleep(Duration::from_millis(150)).await;

        let slow = Slow(AtomicUsize::new(0));
        let (o1, o2, o3) = (obligation(), obligation(), obligation());
        let (first, second, third) = tokio::join!(
            cb.act(&slow, &o1, LIMIT),
            cb.act(&slow, &o2, LIMIT),
            cb.act(&slow, &o3, LIMIT),
        );

        let admitted = [&first, &second, &third]
            .iter()
            .filter(|result| result.is_ok())
            .count();
        assert_eq!(admitted, 1);
        assert_eq!(slow.0.load(Ordering::SeqCst), 1);
        assert_eq!(cb.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_permanent_probe_answer_closes() {
        let cb = CircuitBreaker::new("notifier", 1, Duration::from_millis(100));
        let notifier = Scripted::new(vec![
            transient(),
            ActionOutcome::Permanent("HTTP 400".to_string()),
        ]);
        cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        sleep(Duration::from_millis(150)).await;

        cb.act(&notifier, &obligation(), LIMIT).await.unwrap();
        assert_eq!(cb.state().await, CircuitState::Closed);
    }
}
