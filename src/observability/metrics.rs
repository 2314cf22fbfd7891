//! Thread-safe metrics collection system
//!
//! Atomic counters for the hot paths (job dispatch, publishing, connection
//! churn) and mutex-protected collections for per-action timing data.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Job dispatch
    jobs_received: AtomicU64,
    jobs_in_flight: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_duplicate: AtomicU64,
    jobs_requeued: AtomicU64,
    processing_times: Mutex<Vec<u64>>,
    action_stats: Mutex<HashMap<String, ActionStats>>,

    // Transport
    transport_connected: AtomicBool,
    active_transport: Mutex<Option<String>>,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    failovers: AtomicU64,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
    messages_dropped: AtomicU64,
    messages_received: AtomicU64,
    heartbeats_sent: AtomicU64,
    last_heartbeat: AtomicU64,
    connection_start_time: AtomicU64,

    // Lifecycle
    agent_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
    degraded: AtomicBool,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_received: AtomicU64::new(0),
            jobs_in_flight: AtomicU64::new(0),
            jobs_completed: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_rejected: AtomicU64::new(0),
            jobs_duplicate: AtomicU64::new(0),
            jobs_requeued: AtomicU64::new(0),
            processing_times: Mutex::new(Vec::new()),
            action_stats: Mutex::new(HashMap::new()),
            transport_connected: AtomicBool::new(false),
            active_transport: Mutex::new(None),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            heartbeats_sent: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            agent_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
            degraded: AtomicBool::new(false),
        }
    }

    // Job dispatch metrics
    pub fn job_received(&self) {
        self.jobs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_started(&self) {
        self.jobs_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_completed(&self, action: &str, duration: Duration) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.finish_job(action, duration, true);
    }

    pub fn job_failed(&self, action: &str, duration: Duration) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        self.finish_job(action, duration, false);
    }

    fn finish_job(&self, action: &str, duration: Duration, success: bool) {
        // Saturating: a reset between start and finish must not wrap
        let _ = self
            .jobs_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });

        let millis = duration.as_millis() as u64;
        if let Ok(mut times) = self.processing_times.lock() {
            push_bounded(&mut times, millis);
        }
        if let Ok(mut stats) = self.action_stats.lock() {
            let entry = stats.entry(action.to_string()).or_default();
            entry.executions += 1;
            entry.last_execution = current_timestamp();
            push_bounded(&mut entry.execution_times, millis);
            if !success {
                entry.failures += 1;
            }
        }
    }

    pub fn job_rejected(&self) {
        self.jobs_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_duplicate(&self) {
        self.jobs_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    pub fn job_requeued(&self) {
        self.jobs_requeued.fetch_add(1, Ordering::Relaxed);
    }

    // Transport metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.transport_connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.transport_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.transport_connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_active_transport(&self, transport: Option<&str>) {
        if let Ok(mut active) = self.active_transport.lock() {
            *active = transport.map(str::to_string);
        }
        self.degraded.store(transport.is_none(), Ordering::Relaxed);
    }

    pub fn active_transport(&self) -> Option<String> {
        self.active_transport.lock().ok().and_then(|a| a.clone())
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn message_published(&self) {
        self.messages_published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn publish_failed(&self) {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_dropped(&self) {
        self.messages_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_sent(&self) {
        self.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
        self.last_heartbeat
            .store(current_timestamp(), Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_agent_state(&self, state: &str) {
        if let Ok(mut current_state) = self.agent_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn uptime(&self) -> Duration {
        let start = self.uptime_start.load(Ordering::Relaxed);
        Duration::from_secs(current_timestamp().saturating_sub(start))
    }

    pub fn jobs_in_flight(&self) -> u64 {
        self.jobs_in_flight.load(Ordering::Relaxed)
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed.load(Ordering::Relaxed)
    }

    pub fn jobs_failed(&self) -> u64 {
        self.jobs_failed.load(Ordering::Relaxed)
    }

    /// Reset all metrics (useful for testing)
    pub fn reset(&self) {
        for counter in [
            &self.jobs_received,
            &self.jobs_in_flight,
            &self.jobs_completed,
            &self.jobs_failed,
            &self.jobs_rejected,
            &self.jobs_duplicate,
            &self.jobs_requeued,
            &self.connection_attempts,
            &self.connections_established,
            &self.connection_failures,
            &self.connections_lost,
            &self.failovers,
            &self.messages_published,
            &self.publish_failures,
            &self.messages_dropped,
            &self.messages_received,
            &self.heartbeats_sent,
            &self.last_heartbeat,
            &self.connection_start_time,
            &self.state_transitions,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.transport_connected.store(false, Ordering::Relaxed);
        self.degraded.store(false, Ordering::Relaxed);
        self.uptime_start
            .store(current_timestamp(), Ordering::Relaxed);

        if let Ok(mut times) = self.processing_times.lock() {
            times.clear();
        }
        if let Ok(mut stats) = self.action_stats.lock() {
            stats.clear();
        }
        if let Ok(mut active) = self.active_transport.lock() {
            *active = None;
        }
        if let Ok(mut state) = self.agent_state.lock() {
            *state = "initializing".to_string();
        }
    }

    /// Calculate processing time statistics (avg, p50, p95, p99)
    fn processing_time_statistics(&self) -> (f64, f64, f64, f64) {
        let Ok(times) = self.processing_times.lock() else {
            return (0.0, 0.0, 0.0, 0.0);
        };
        if times.is_empty() {
            return (0.0, 0.0, 0.0, 0.0);
        }

        let mut sorted_times = times.clone();
        sorted_times.sort_unstable();

        let avg = sorted_times.iter().sum::<u64>() as f64 / sorted_times.len() as f64;
        (
            avg,
            percentile(&sorted_times, 50.0),
            percentile(&sorted_times, 95.0),
            percentile(&sorted_times, 99.0),
        )
    }

    fn action_snapshots(&self) -> HashMap<String, ActionStatsSnapshot> {
        let Ok(stats) = self.action_stats.lock() else {
            return HashMap::new();
        };

        stats
            .iter()
            .map(|(name, stats)| {
                let avg_execution_time_ms = if stats.execution_times.is_empty() {
                    0.0
                } else {
                    stats.execution_times.iter().sum::<u64>() as f64
                        / stats.execution_times.len() as f64
                };
                let success_rate = if stats.executions == 0 {
                    0.0
                } else {
                    (stats.executions - stats.failures) as f64 / stats.executions as f64
                };
                (
                    name.clone(),
                    ActionStatsSnapshot {
                        executions: stats.executions,
                        failures: stats.failures,
                        avg_execution_time_ms,
                        last_execution: stats.last_execution,
                        success_rate,
                    },
                )
            })
            .collect()
    }

    /// Get complete metrics snapshot
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let (avg_processing_time_ms, p50, p95, p99) = self.processing_time_statistics();

        let connected = self.transport_connected.load(Ordering::Relaxed);
        let start_time = self.connection_start_time.load(Ordering::Relaxed);
        let connection_duration_seconds = if connected && start_time > 0 {
            now.saturating_sub(start_time)
        } else {
            0
        };

        MetricsSnapshot {
            jobs: JobMetrics {
                jobs_received: self.jobs_received.load(Ordering::Relaxed),
                jobs_in_flight: self.jobs_in_flight.load(Ordering::Relaxed),
                jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
                jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
                jobs_rejected: self.jobs_rejected.load(Ordering::Relaxed),
                jobs_duplicate: self.jobs_duplicate.load(Ordering::Relaxed),
                jobs_requeued: self.jobs_requeued.load(Ordering::Relaxed),
                avg_processing_time_ms,
                processing_time_p50_ms: p50,
                processing_time_p95_ms: p95,
                processing_time_p99_ms: p99,
                actions: self.action_snapshots(),
            },
            transport: TransportMetrics {
                active: self.active_transport(),
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                failovers: self.failovers.load(Ordering::Relaxed),
                messages_published: self.messages_published.load(Ordering::Relaxed),
                publish_failures: self.publish_failures.load(Ordering::Relaxed),
                messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
                messages_received: self.messages_received.load(Ordering::Relaxed),
                heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
                last_heartbeat: self.last_heartbeat.load(Ordering::Relaxed),
                connection_duration_seconds,
            },
            lifecycle: LifecycleMetrics {
                current_state: self
                    .agent_state
                    .lock()
                    .map(|s| s.clone())
                    .unwrap_or_else(|_| "unknown".to_string()),
                uptime_seconds: self.uptime().as_secs(),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
                degraded: self.is_degraded(),
            },
            timestamp: now,
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct ActionStats {
    executions: u64,
    failures: u64,
    execution_times: Vec<u64>, // milliseconds
    last_execution: u64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub jobs: JobMetrics,
    pub transport: TransportMetrics,
    pub lifecycle: LifecycleMetrics,
    pub timestamp: u64,
}

#[derive(Debug, Serialize)]
pub struct JobMetrics {
    pub jobs_received: u64,
    pub jobs_in_flight: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_rejected: u64,
    pub jobs_duplicate: u64,
    pub jobs_requeued: u64,
    pub avg_processing_time_ms: f64,
    pub processing_time_p50_ms: f64,
    pub processing_time_p95_ms: f64,
    pub processing_time_p99_ms: f64,
    pub actions: HashMap<String, ActionStatsSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct ActionStatsSnapshot {
    pub executions: u64,
    pub failures: u64,
    pub avg_execution_time_ms: f64,
    pub last_execution: u64,
    pub success_rate: f64,
}

#[derive(Debug, Serialize)]
pub struct TransportMetrics {
    pub active: Option<String>,
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub failovers: u64,
    pub messages_published: u64,
    pub publish_failures: u64,
    pub messages_dropped: u64,
    pub messages_received: u64,
    pub heartbeats_sent: u64,
    pub last_heartbeat: u64,
    pub connection_duration_seconds: u64,
}

#[derive(Debug, Serialize)]
pub struct LifecycleMetrics {
    pub current_state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
    pub degraded: bool,
}

fn push_bounded(samples: &mut Vec<u64>, value: u64) {
    samples.push(value);
    if samples.len() > MAX_TIMING_SAMPLES {
        samples.remove(0);
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_data: &[u64], percentile: f64) -> f64 {
    if sorted_data.is_empty() {
        return 0.0;
    }

    let len = sorted_data.len();
    let index = (percentile / 100.0) * (len - 1) as f64;

    if index.fract() == 0.0 {
        sorted_data[index as usize] as f64
    } else {
        let lower_value = sorted_data[index.floor() as usize] as f64;
        let upper_value = sorted_data[index.ceil() as usize] as f64;
        lower_value + (upper_value - lower_value) * index.fract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_job_metrics() {
        let collector = MetricsCollector::new();

        collector.job_received();
        collector.job_started();
        collector.job_completed("deploy_application", Duration::from_millis(1500));

        let metrics = collector.get_metrics();
        assert_eq!(metrics.jobs.jobs_received, 1);
        assert_eq!(metrics.jobs.jobs_completed, 1);
        assert_eq!(metrics.jobs.jobs_in_flight, 0);
        assert!(metrics.jobs.avg_processing_time_ms > 1400.0);
    }

    #[test]
    fn test_in_flight_never_underflows() {
        let collector = MetricsCollector::new();
        collector.job_failed("deploy_application", Duration::from_millis(1));
        assert_eq!(collector.jobs_in_flight(), 0);
        assert_eq!(collector.jobs_failed(), 1);
    }

    #[test]
    fn test_action_stats() {
        let collector = MetricsCollector::new();
        collector.job_started();
        collector.job_completed("install_database", Duration::from_millis(500));
        collector.job_started();
        collector.job_failed("install_database", Duration::from_millis(300));

        let metrics = collector.get_metrics();
        let stats = metrics.jobs.actions.get("install_database").unwrap();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.success_rate, 0.5);
        assert!(stats.avg_execution_time_ms > 350.0);
    }

    #[test]
    fn test_transport_metrics_and_degraded_flag() {
        let collector = MetricsCollector::new();

        collector.connection_attempt();
        collector.connection_established();
        collector.set_active_transport(Some("queue"));
        collector.message_published();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.transport.connection_attempts, 1);
        assert_eq!(metrics.transport.connections_established, 1);
        assert_eq!(metrics.transport.messages_published, 1);
        assert_eq!(metrics.transport.active.as_deref(), Some("queue"));
        assert!(metrics.transport.connected);
        assert!(!metrics.lifecycle.degraded);

        collector.connection_lost();
        collector.set_active_transport(None);
        let metrics = collector.get_metrics();
        assert!(!metrics.transport.connected);
        assert!(metrics.lifecycle.degraded);
    }

    #[test]
    fn test_thread_safety() {
        let collector = Arc::new(MetricsCollector::new());

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let collector = Arc::clone(&collector);
                thread::spawn(move || {
                    for _ in 0..100 {
                        collector.job_received();
                        collector.message_published();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = collector.get_metrics();
        assert_eq!(metrics.jobs.jobs_received, 1000);
        assert_eq!(metrics.transport.messages_published, 1000);
    }

    #[test]
    fn test_percentile_calculation() {
        let data = vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10];

        assert!((percentile(&data, 50.0) - 5.5).abs() < 0.1);
        assert!((percentile(&data, 95.0) - 9.55).abs() < 0.1);
        assert!((percentile(&data, 0.0) - 1.0).abs() < 0.1);
        assert!((percentile(&data, 100.0) - 10.0).abs() < 0.1);
        assert_eq!(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn test_timing_samples_are_bounded() {
        let collector = MetricsCollector::new();
        for i in 0..1500 {
            collector.job_completed("health_check", Duration::from_millis(i));
        }
        let times = collector.processing_times.lock().unwrap();
        assert_eq!(times.len(), MAX_TIMING_SAMPLES);
    }

    #[test]
    fn test_reset_functionality() {
        let collector = MetricsCollector::new();

        collector.job_received();
        collector.connection_established();
        collector.set_active_transport(Some("duplex"));
        collector.set_agent_state("running");

        collector.reset();

        let metrics = collector.get_metrics();
        assert_eq!(metrics.jobs.jobs_received, 0);
        assert!(!metrics.transport.connected);
        assert!(metrics.transport.active.is_none());
        assert_eq!(metrics.lifecycle.current_state, "initializing");
    }
}
