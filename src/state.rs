//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every relay actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (many handlers and actors hold a reference)
//! - **RwLock**: Many readers OR one writer at a time
//! - **Poisoning**: A panicking writer poisons the lock; the metrics and
//!   config here stay usable afterwards, so poisoned guards are recovered
//!   with `PoisonError::into_inner` instead of propagating the panic
//!
//! ### Explicit handles instead of globals
//! The voice session lock is a cloneable handle owned by `AppState`. Tests
//! build their own `AppState` and never see each other's lock.

use crate::config::AppConfig;
use crate::relay::session::RelayStats;
use crate::voice_lock::{LockEvent, Subscription, VoiceSessionLock};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tracing::info;

#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Counters updated by the middleware, the relay and the lock observer
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// When the server started
    pub start_time: Instant,

    /// Process-wide voice session lock
    pub voice_lock: VoiceSessionLock,

    /// Keeps the metrics/logging listener registered for the state's lifetime
    _lock_observer: Arc<Subscription>,
}

/// Metrics collected across all HTTP requests and relay sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Relay connections currently open
    pub active_sessions: u32,

    /// Key: endpoint name (e.g., "GET /health")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    pub relay: RelayTotals,

    /// Number of voice lock state changes observed
    pub lock_transitions: u64,
}

/// Totals over every finished relay session.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayTotals {
    pub sessions_opened: u64,
    pub sessions_closed: u64,
    pub handshake_failures: u64,
    pub frames_to_vendor: u64,
    pub frames_to_client: u64,
    pub bytes_to_vendor: u64,
    pub bytes_to_client: u64,
    pub frames_discarded: u64,
}

/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState with the given configuration.
    ///
    /// Registers a listener on the voice lock that logs every transition and
    /// counts it in the metrics.
    pub fn new(config: AppConfig) -> Self {
        let metrics = Arc::new(RwLock::new(AppMetrics::default()));
        let voice_lock = VoiceSessionLock::new();

        let observed = Arc::clone(&metrics);
        let lock_observer = voice_lock.subscribe(move |event: &LockEvent| {
            let holder = match event {
                LockEvent::Acquired(holder) | LockEvent::Released(holder) => Some(holder),
                LockEvent::ForceReleased { previous } => previous.as_ref(),
            };
            info!(
                event = event.as_str(),
                locked = event.is_locked(),
                session_id = holder.map(|h| h.session_id.as_str()).unwrap_or("-"),
                owner = holder.map(|h| h.owner.as_str()).unwrap_or("-"),
                "Voice session lock changed"
            );
            observed
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .lock_transitions += 1;
        });

        Self {
            config: Arc::new(RwLock::new(config)),
            metrics,
            start_time: Instant::now(),
            voice_lock,
            _lock_observer: Arc::new(lock_observer),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the configuration after validating it.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = new_config;
        Ok(())
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Reserve a relay slot if fewer than `max_sessions` are open.
    ///
    /// Check and increment happen under one write lock, so two upgrades
    /// racing for the last slot cannot both win.
    pub fn try_open_relay_session(&self, max_sessions: usize) -> bool {
        let mut metrics = self.write_metrics();
        if metrics.active_sessions as usize >= max_sessions {
            return false;
        }
        metrics.active_sessions += 1;
        metrics.relay.sessions_opened += 1;
        true
    }

    /// Give back a slot taken by [`try_open_relay_session`](Self::try_open_relay_session)
    /// and fold the session's counters into the totals.
    pub fn close_relay_session(&self, stats: RelayStats, handshake_failed: bool) {
        let mut metrics = self.write_metrics();
        metrics.active_sessions = metrics.active_sessions.saturating_sub(1);

        let relay = &mut metrics.relay;
        relay.sessions_closed += 1;
        if handshake_failed {
            relay.handshake_failures += 1;
        }
        relay.frames_to_vendor += stats.frames_to_vendor;
        relay.frames_to_client += stats.frames_to_client;
        relay.bytes_to_vendor += stats.bytes_to_vendor;
        relay.bytes_to_client += stats.bytes_to_client;
        relay.frames_discarded += stats.frames_discarded;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate between 0.0 and 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
