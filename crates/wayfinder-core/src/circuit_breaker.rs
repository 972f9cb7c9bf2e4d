//! Per-source circuit breakers.
//!
//! Stops calling a failing source for a cool-down period after repeated
//! high-severity failures.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[N high/critical errors]--> OPEN --[cool-down]--> HALF_OPEN (one trial)
//!                                        ^                        |
//!                                        +-------[failure]--------+
//! CLOSED <----------------------------[success]-------------------+
//! ```
//!
//! All breakers live in one [`CircuitBreakerTable`]: an arena of breaker
//! slots plus a source-name index. The table itself is not synchronised;
//! its owner (the [`ErrorHandler`](crate::error_handler::ErrorHandler))
//! keeps it behind a mutex.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::AppError;
use crate::error_handler::Severity;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Requests flow normally.
    Closed,
    /// Requests are rejected immediately.
    Open,
    /// A single trial request is allowed to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration shared by every breaker in a table.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive high/critical errors before the circuit opens.
    pub failure_threshold: u32,

    /// Time to wait before transitioning from Open to Half-Open.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.failure_threshold == 0 {
            return Err(AppError::ConfigError(
                "circuit breaker failure_threshold must be at least 1".into(),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(AppError::ConfigError(
                "circuit breaker cooldown must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Snapshot of one breaker, for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub source: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub times_opened: u64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug)]
struct Breaker {
    source: String,
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    trial_started_at: Option<Instant>,
    times_opened: u64,
    last_error_message: Option<String>,
}

impl Breaker {
    fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: None,
            trial_started_at: None,
            times_opened: 0,
            last_error_message: None,
        }
    }

    fn remaining_cooldown(&self, cooldown: Duration) -> Duration {
        self.opened_at
            .map(|t| cooldown.saturating_sub(t.elapsed()))
            .unwrap_or(cooldown)
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.trial_started_at = None;
        self.times_opened += 1;
    }

    /// A trial is in flight unless it was abandoned for a full cool-down.
    fn trial_in_flight(&self, cooldown: Duration) -> bool {
        self.trial_started_at
            .is_some_and(|t| t.elapsed() < cooldown)
    }
}

/// Keyed table of per-source breakers.
#[derive(Debug)]
pub struct CircuitBreakerTable {
    config: CircuitBreakerConfig,
    breakers: Vec<Breaker>,
    index: HashMap<String, usize>,
}

impl CircuitBreakerTable {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn slot(&mut self, source: &str) -> &mut Breaker {
        let idx = match self.index.get(source) {
            Some(&idx) => idx,
            None => {
                let idx = self.breakers.len();
                self.breakers.push(Breaker::new(source));
                self.index.insert(source.to_string(), idx);
                idx
            }
        };
        let cooldown = self.config.cooldown;
        let breaker = &mut self.breakers[idx];
        maybe_transition_to_half_open(breaker, cooldown);
        breaker
    }

    /// Returns the current state, handling lazy Open → HalfOpen transitions.
    pub fn state(&mut self, source: &str) -> CircuitState {
        self.slot(source).state
    }

    /// Whether a call to `source` would be admitted right now.
    ///
    /// Does not consume the half-open trial.
    pub fn is_available(&mut self, source: &str) -> bool {
        let cooldown = self.config.cooldown;
        let breaker = self.slot(source);
        match breaker.state {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => !breaker.trial_in_flight(cooldown),
        }
    }

    /// Admits a call or returns how long the caller should wait.
    ///
    /// In half-open state exactly one caller is admitted; the others are
    /// rejected until that trial records a success or a failure.
    pub fn try_acquire(&mut self, source: &str) -> Result<(), Duration> {
        let cooldown = self.config.cooldown;
        let breaker = self.slot(source);
        match breaker.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(breaker.remaining_cooldown(cooldown)),
            CircuitState::HalfOpen => {
                if breaker.trial_in_flight(cooldown) {
                    return Err(breaker
                        .trial_started_at
                        .map(|t| cooldown.saturating_sub(t.elapsed()))
                        .unwrap_or(cooldown));
                }
                tracing::debug!(source = %breaker.source, "Admitting half-open trial call");
                breaker.trial_started_at = Some(Instant::now());
                Ok(())
            }
        }
    }

    pub fn record_success(&mut self, source: &str) {
        let breaker = self.slot(source);
        match breaker.state {
            CircuitState::HalfOpen => {
                tracing::info!(source = %breaker.source, "Circuit breaker closing after successful trial");
                breaker.state = CircuitState::Closed;
                breaker.failure_count = 0;
                breaker.opened_at = None;
                breaker.trial_started_at = None;
                breaker.last_error_message = None;
            }
            CircuitState::Closed => {
                breaker.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Records a failed call. Only high and critical errors count toward
    /// the threshold. Lower-severity failures are transparent to the streak:
    /// they neither count nor reset it, so only a success breaks a run of
    /// high/critical errors. During a half-open trial a lower-severity
    /// failure just frees the trial slot.
    pub fn record_failure(&mut self, source: &str, severity: Severity, message: &str) {
        let threshold = self.config.failure_threshold;
        let breaker = self.slot(source);
        breaker.last_error_message = Some(message.to_string());

        if !severity.trips_breaker() {
            if breaker.state == CircuitState::HalfOpen {
                breaker.trial_started_at = None;
            }
            return;
        }

        match breaker.state {
            CircuitState::Closed => {
                breaker.failure_count += 1;
                if breaker.failure_count >= threshold {
                    tracing::warn!(
                        source = %breaker.source,
                        failures = breaker.failure_count,
                        error = %message,
                        "Circuit breaker opening after {} consecutive failures",
                        breaker.failure_count
                    );
                    breaker.open();
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    source = %breaker.source,
                    error = %message,
                    "Circuit breaker trial failed, returning to open state"
                );
                breaker.failure_count += 1;
                breaker.open();
            }
            CircuitState::Open => {}
        }
    }

    pub fn reset(&mut self, source: &str) {
        let breaker = self.slot(source);
        tracing::info!(source = %breaker.source, "Circuit breaker manually reset");
        *breaker = Breaker::new(source);
    }

    pub fn stats(&mut self, source: &str) -> CircuitBreakerStats {
        let cooldown = self.config.cooldown;
        let breaker = self.slot(source);
        snapshot(breaker, cooldown)
    }

    /// Snapshots of every breaker seen so far, in first-seen order.
    pub fn all_stats(&mut self) -> Vec<CircuitBreakerStats> {
        let cooldown = self.config.cooldown;
        self.breakers
            .iter_mut()
            .map(|b| {
                maybe_transition_to_half_open(b, cooldown);
                snapshot(b, cooldown)
            })
            .collect()
    }
}

fn snapshot(breaker: &Breaker, cooldown: Duration) -> CircuitBreakerStats {
    CircuitBreakerStats {
        source: breaker.source.clone(),
        state: breaker.state,
        failure_count: breaker.failure_count,
        times_opened: breaker.times_opened,
        last_error: breaker.last_error_message.clone(),
        time_until_half_open: (breaker.state == CircuitState::Open)
            .then(|| breaker.remaining_cooldown(cooldown)),
    }
}

fn maybe_transition_to_half_open(breaker: &mut Breaker, cooldown: Duration) {
    if breaker.state == CircuitState::Open
        && let Some(opened_at) = breaker.opened_at
        && opened_at.elapsed() >= cooldown
    {
        tracing::info!(
            source = %breaker.source,
            "Circuit breaker transitioning to half-open state"
        );
        breaker.state = CircuitState::HalfOpen;
        breaker.trial_started_at = None;
    }
}
