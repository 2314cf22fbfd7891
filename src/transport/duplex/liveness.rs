//! Socket liveness probing
//!
//! One probe is outstanding at a time. A probe is answered by any
//! `heartbeat_ack` frame or pong; an unanswered probe past its deadline
//! means the socket is dead even if TCP has not noticed yet.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct LivenessProbe {
    timeout: Duration,
    outstanding_since: Option<Instant>,
    last_response: Option<Instant>,
}

impl LivenessProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            outstanding_since: None,
            last_response: None,
        }
    }

    /// Record a probe sent at `now`; an already outstanding probe keeps its deadline
    pub fn probe_sent(&mut self, now: Instant) {
        self.outstanding_since.get_or_insert(now);
    }

    pub fn response_received(&mut self, now: Instant) {
        self.outstanding_since = None;
        self.last_response = Some(now);
    }

    pub fn is_outstanding(&self) -> bool {
        self.outstanding_since.is_some()
    }

    /// When the outstanding probe expires, if one is outstanding
    pub fn deadline(&self) -> Option<Instant> {
        self.outstanding_since.map(|sent| sent + self.timeout)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn last_response(&self) -> Option<Instant> {
        self.last_response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_probe_is_idle() {
        let probe = LivenessProbe::new(Duration::from_secs(10));
        assert!(!probe.is_outstanding());
        assert_eq!(probe.deadline(), None);
        assert!(!probe.is_expired(Instant::now()));
    }

    #[test]
    fn test_unanswered_probe_expires_after_timeout() {
        let start = Instant::now();
        let mut probe = LivenessProbe::new(Duration::from_secs(10));
        probe.probe_sent(start);
        assert!(!probe.is_expired(start + Duration::from_secs(9)));
        assert!(probe.is_expired(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_response_clears_probe() {
        let start = Instant::now();
        let mut probe = LivenessProbe::new(Duration::from_secs(10));
        probe.probe_sent(start);
        probe.response_received(start + Duration::from_secs(1));
        assert!(!probe.is_outstanding());
        assert!(!probe.is_expired(start + Duration::from_secs(60)));
        assert_eq!(probe.last_response(), Some(start + Duration::from_secs(1)));
    }

    #[test]
    fn test_second_probe_keeps_first_deadline() {
        let start = Instant::now();
        let mut probe = LivenessProbe::new(Duration::from_secs(10));
        probe.probe_sent(start);
        probe.probe_sent(start + Duration::from_secs(5));
        assert_eq!(probe.deadline(), Some(start + Duration::from_secs(10)));
    }
}
