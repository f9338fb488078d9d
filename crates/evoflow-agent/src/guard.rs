//! Admission control for the shared model provider.
//!
//! One [`AdmissionController`] is shared by every model call of a process
//! (node execution, self-improvement, judging, repair). Guards return
//! rejections as values and never retry on their own.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use evoflow_core::config::LimitsConfig;
use evoflow_core::error::AdmissionRejection;

pub struct AdmissionController {
    window: Duration,
    max_requests: usize,
    enable_spending_limits: bool,
    max_spend_usd: f64,
    requests: Mutex<VecDeque<Instant>>,
    spent_usd: Mutex<f64>,
}

impl AdmissionController {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            window: Duration::from_millis(limits.rate_window_ms),
            max_requests: limits.max_requests_per_window,
            enable_spending_limits: limits.enable_spending_limits,
            max_spend_usd: limits.max_spend_usd,
            requests: Mutex::new(VecDeque::new()),
            spent_usd: Mutex::new(0.0),
        }
    }

    /// A controller that admits everything.
    pub fn unlimited() -> Self {
        Self::new(&LimitsConfig {
            rate_window_ms: 1,
            max_requests_per_window: usize::MAX,
            enable_spending_limits: false,
            max_spend_usd: f64::INFINITY,
        })
    }

    /// Sliding-window rate limit. An admitted call is recorded; a rejected one is not.
    pub fn rate_limit(&self) -> Result<(), AdmissionRejection> {
        self.check_rate_at(Instant::now())
    }

    fn check_rate_at(&self, now: Instant) -> Result<(), AdmissionRejection> {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);

        while let Some(front) = requests.front() {
            if now.saturating_duration_since(*front) >= self.window {
                requests.pop_front();
            } else {
                break;
            }
        }

        if requests.len() >= self.max_requests {
            return Err(AdmissionRejection::RateLimited {
                in_window: requests.len(),
                max_requests: self.max_requests,
                window_ms: self.window.as_millis() as u64,
            });
        }

        requests.push_back(now);
        Ok(())
    }

    /// Refuse once the accumulated spend has reached the ceiling.
    pub fn spending_guard(&self) -> Result<(), AdmissionRejection> {
        if !self.enable_spending_limits {
            return Ok(());
        }
        let current = self.total_spent();
        if current >= self.max_spend_usd {
            return Err(AdmissionRejection::SpendLimit {
                current,
                limit: self.max_spend_usd,
            });
        }
        Ok(())
    }

    /// Add the cost of a billed call to the shared total.
    pub fn record_spend(&self, usd: f64) {
        if !usd.is_finite() || usd <= 0.0 {
            return;
        }
        let mut spent = self.spent_usd.lock().unwrap_or_else(PoisonError::into_inner);
        *spent += usd;
        debug!(usd, total = *spent, "Recorded model spend");
    }

    pub fn total_spent(&self) -> f64 {
        *self.spent_usd.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run both guards. Spend is checked first so a refused call never
    /// occupies a rate-window slot.
    pub fn admit(&self) -> Result<(), AdmissionRejection> {
        self.spending_guard()?;
        self.rate_limit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_requests: usize, window_ms: u64) -> LimitsConfig {
        LimitsConfig {
            rate_window_ms: window_ms,
            max_requests_per_window: max_requests,
            enable_spending_limits: true,
            max_spend_usd: 1.0,
        }
    }

    #[test]
    fn test_one_rejection_past_capacity_then_recovers() {
        let guard = AdmissionController::new(&limits(3, 1000));
        let t0 = Instant::now();

        let outcomes: Vec<_> = (0..4)
            .map(|i| guard.check_rate_at(t0 + Duration::from_millis(i * 10)))
            .collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_err()).count(), 1);
        assert!(matches!(
            outcomes[3],
            Err(AdmissionRejection::RateLimited {
                in_window: 3,
                max_requests: 3,
                window_ms: 1000
            })
        ));

        // first request falls out of the window
        assert!(guard.check_rate_at(t0 + Duration::from_millis(1001)).is_ok());
    }

    #[test]
    fn test_rejected_call_is_not_recorded() {
        let guard = AdmissionController::new(&limits(1, 1000));
        let t0 = Instant::now();
        assert!(guard.check_rate_at(t0).is_ok());
        for i in 1..5 {
            assert!(guard.check_rate_at(t0 + Duration::from_millis(i)).is_err());
        }
        // only the admitted call occupied the window
        assert!(guard.check_rate_at(t0 + Duration::from_millis(1000)).is_ok());
    }

    #[test]
    fn test_spending_guard() {
        let guard = AdmissionController::new(&limits(10, 1000));
        assert!(guard.spending_guard().is_ok());
        guard.record_spend(0.6);
        assert!(guard.spending_guard().is_ok());
        guard.record_spend(0.5);
        match guard.spending_guard() {
            Err(AdmissionRejection::SpendLimit { current, limit }) => {
                assert!((current - 1.1).abs() < 1e-9);
                assert_eq!(limit, 1.0);
            }
            other => panic!("expected spend rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_spending_guard_disabled() {
        let mut l = limits(10, 1000);
        l.enable_spending_limits = false;
        let guard = AdmissionController::new(&l);
        guard.record_spend(100.0);
        assert!(guard.spending_guard().is_ok());
        assert_eq!(guard.total_spent(), 100.0);
    }

    #[test]
    fn test_invalid_spend_ignored() {
        let guard = AdmissionController::unlimited();
        guard.record_spend(f64::NAN);
        guard.record_spend(-1.0);
        assert_eq!(guard.total_spent(), 0.0);
    }

    #[test]
    fn test_admit_checks_spend_before_rate() {
        let guard = AdmissionController::new(&limits(1, 60_000));
        guard.record_spend(5.0);
        assert!(matches!(guard.admit(), Err(AdmissionRejection::SpendLimit { .. })));
        assert!(guard.rate_limit().is_ok());
    }

    #[test]
    fn test_concurrent_callers_never_exceed_cap() {
        let guard = std::sync::Arc::new(AdmissionController::new(&limits(25, 60_000)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = guard.clone();
                std::thread::spawn(move || (0..10).filter(|_| g.rate_limit().is_ok()).count())
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 25);
    }
}
