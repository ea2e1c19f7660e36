//! UDP interface contracts: the periodic ACK exchange and the optional
//! downlink watchdog.
//!
//! The socket itself lives in the transport driver; this module tracks
//! the protocol state. Every `request_period` the sender marks the next
//! outbound packet with ACK_REQUEST; a countdown decrements on each
//! unanswered request and reaching zero tells the driver to close the
//! socket and requery DNS.

use crate::types::flags;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct AckConfig {
    /// How often an ACK is requested from the server.
    pub request_period: Duration,
    /// Unanswered requests tolerated before the link is declared stale.
    pub max_unacked: u8,
    /// Reboot the device when no authenticated downlink arrives within
    /// this window while the interface is up.
    pub downlink_timeout: Option<Duration>,
}

impl Default for AckConfig {
    fn default() -> Self {
        Self {
            request_period: Duration::from_secs(30),
            max_unacked: 3,
            downlink_timeout: None,
        }
    }
}

/// Per-socket ACK and downlink bookkeeping.
#[derive(Debug)]
pub struct AckTracker {
    config: AckConfig,
    last_request: Option<Instant>,
    remaining: u8,
    last_downlink: Instant,
}

impl AckTracker {
    pub fn new(config: AckConfig, now: Instant) -> Self {
        let remaining = config.max_unacked;
        Self {
            config,
            last_request: None,
            remaining,
            last_downlink: now,
        }
    }

    /// Flag bits to merge into the next outbound packet.
    ///
    /// Sets ACK_REQUEST when the request period has elapsed and spends
    /// one countdown step.
    pub fn tx_flags(&mut self, now: Instant) -> u16 {
        let due = match self.last_request {
            None => true,
            Some(at) => now.duration_since(at) >= self.config.request_period,
        };
        if !due || self.remaining == 0 {
            return 0;
        }
        self.last_request = Some(now);
        self.remaining -= 1;
        flags::ACK_REQUEST
    }

    /// Server answered; the link is alive.
    pub fn ack_received(&mut self) {
        self.remaining = self.config.max_unacked;
        self.last_request = None;
    }

    /// True once every tolerated request has gone unanswered. The driver
    /// closes the socket and re-executes DNS resolution.
    pub fn link_stale(&self) -> bool {
        self.remaining == 0
    }

    /// Record an authenticated downlink packet.
    pub fn downlink_received(&mut self, now: Instant) {
        self.last_downlink = now;
    }

    /// True when the downlink watchdog window has been exceeded.
    pub fn downlink_overdue(&self, now: Instant) -> bool {
        match self.config.downlink_timeout {
            Some(window) => now.duration_since(self.last_downlink) > window,
            None => false,
        }
    }

    /// Reset after a reconnect.
    pub fn reset(&mut self, now: Instant) {
        self.remaining = self.config.max_unacked;
        self.last_request = None;
        self.last_downlink = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_unacked: u8) -> (AckTracker, Instant) {
        let now = Instant::now();
        let t = AckTracker::new(
            AckConfig {
                request_period: Duration::from_secs(10),
                max_unacked,
                downlink_timeout: Some(Duration::from_secs(60)),
            },
            now,
        );
        (t, now)
    }

    #[test]
    fn test_first_packet_requests_ack() {
        let (mut t, now) = tracker(3);
        assert_eq!(t.tx_flags(now), flags::ACK_REQUEST);
        // Within the period no further request is made.
        assert_eq!(t.tx_flags(now + Duration::from_secs(1)), 0);
    }

    #[test]
    fn test_countdown_exhaustion_marks_stale() {
        let (mut t, now) = tracker(2);
        assert_eq!(t.tx_flags(now), flags::ACK_REQUEST);
        assert!(!t.link_stale());
        assert_eq!(t.tx_flags(now + Duration::from_secs(10)), flags::ACK_REQUEST);
        assert!(t.link_stale());
        // Stale links request nothing further.
        assert_eq!(t.tx_flags(now + Duration::from_secs(20)), 0);
    }

    #[test]
    fn test_ack_restores_countdown() {
        let (mut t, now) = tracker(1);
        assert_eq!(t.tx_flags(now), flags::ACK_REQUEST);
        assert!(t.link_stale());
        t.ack_received();
        assert!(!t.link_stale());
        assert_eq!(t.tx_flags(now + Duration::from_secs(10)), flags::ACK_REQUEST);
    }

    #[test]
    fn test_downlink_watchdog_window() {
        let (mut t, now) = tracker(3);
        assert!(!t.downlink_overdue(now + Duration::from_secs(59)));
        assert!(t.downlink_overdue(now + Duration::from_secs(61)));
        t.downlink_received(now + Duration::from_secs(61));
        assert!(!t.downlink_overdue(now + Duration::from_secs(100)));
    }

    #[test]
    fn test_no_downlink_watchdog_when_unconfigured() {
        let now = Instant::now();
        let t = AckTracker::new(AckConfig::default(), now);
        assert!(!t.downlink_overdue(now + Duration::from_secs(3600)));
    }
}
