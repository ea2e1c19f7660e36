//! Software watchdog channels for the pipeline tasks.
//!
//! Each pipeline loop registers a channel at start-up and feeds it at the
//! top and bottom of every iteration. The monitor reports the first
//! channel that misses the period; acting on that (logging the reason
//! and rebooting) is the platform's responsibility.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{interval, Instant};
use tracing::error;

/// One registered watchdog channel.
pub struct WatchdogChannel {
    name: &'static str,
    last_feed: Mutex<Instant>,
}

impl WatchdogChannel {
    pub fn feed(&self) {
        *self.last_feed.lock().unwrap() = Instant::now();
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Process watchdog over any number of task channels.
pub struct Watchdog {
    period: Duration,
    channels: Mutex<Vec<Arc<WatchdogChannel>>>,
}

impl Watchdog {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            channels: Mutex::new(Vec::new()),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn register(&self, name: &'static str) -> Arc<WatchdogChannel> {
        let channel = Arc::new(WatchdogChannel {
            name,
            last_feed: Mutex::new(Instant::now()),
        });
        self.channels.lock().unwrap().push(channel.clone());
        channel
    }

    /// First channel that has missed the period, if any.
    pub fn expired(&self, now: Instant) -> Option<&'static str> {
        let channels = self.channels.lock().unwrap();
        for channel in channels.iter() {
            let last = *channel.last_feed.lock().unwrap();
            if now.duration_since(last) > self.period {
                return Some(channel.name);
            }
        }
        None
    }

    /// Monitor loop; resolves with the name of the first stuck task.
    pub async fn run(self: Arc<Self>) -> &'static str {
        let mut tick = interval(self.period / 4);
        loop {
            tick.tick().await;
            if let Some(name) = self.expired(Instant::now()) {
                error!(task = name, "watchdog channel expired");
                return name;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fed_channel_never_expires() {
        let wd = Watchdog::new(Duration::from_millis(50));
        let ch = wd.register("rx");
        ch.feed();
        assert_eq!(wd.expired(Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_starved_channel_expires() {
        let wd = Watchdog::new(Duration::from_millis(50));
        let _ch = wd.register("tx");
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(wd.expired(Instant::now()), Some("tx"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeding_defers_expiry() {
        let wd = Watchdog::new(Duration::from_millis(50));
        let ch = wd.register("rx");
        tokio::time::advance(Duration::from_millis(40)).await;
        ch.feed();
        tokio::time::advance(Duration::from_millis(40)).await;
        assert_eq!(wd.expired(Instant::now()), None);
        tokio::time::advance(Duration::from_millis(20)).await;
        assert_eq!(wd.expired(Instant::now()), Some("rx"));
    }
}
