use std::{
    sync::{Mutex, Weak},
    time::Duration,
};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{lock, Inner};

/// Idle tracking for the keep-alive heartbeat.
///
/// Both directions are tracked separately; the connection counts as idle for as long as the
/// more recently active direction has been quiet. A direction that never saw any traffic
/// counts as idle for a full interval.
pub(crate) enum KeepAliveTracker {
    Disabled,
    Enabled(Heartbeat),
}

pub(crate) struct Heartbeat {
    interval: Duration,
    last_send: Mutex<Option<Instant>>,
    last_receive: Mutex<Option<Instant>>,
    stop: CancellationToken,
}

impl KeepAliveTracker {
    pub fn new(interval: Option<Duration>) -> Self {
        match interval {
            Some(interval) if !interval.is_zero() => Self::Enabled(Heartbeat {
                interval,
                last_send: Mutex::new(None),
                last_receive: Mutex::new(None),
                stop: CancellationToken::new(),
            }),
            _ => Self::Disabled,
        }
    }

    pub fn interval(&self) -> Option<Duration> {
        match self {
            Self::Disabled => None,
            Self::Enabled(heartbeat) => Some(heartbeat.interval),
        }
    }

    pub fn on_data_sent(&self) {
        if let Self::Enabled(heartbeat) = self {
            *lock(&heartbeat.last_send) = Some(Instant::now());
        }
    }

    pub fn on_data_received(&self) {
        if let Self::Enabled(heartbeat) = self {
            *lock(&heartbeat.last_receive) = Some(Instant::now());
        }
    }

    /// Time since the last activity in either direction.
    pub fn idle_time(&self) -> Duration {
        let Self::Enabled(heartbeat) = self else {
            return Duration::ZERO;
        };
        let since = |slot: &Mutex<Option<Instant>>| {
            lock(slot).map_or(heartbeat.interval, |at| at.elapsed())
        };
        since(&heartbeat.last_send).min(since(&heartbeat.last_receive))
    }

    /// `None` when a keep-alive is due, otherwise the time left until it will be.
    pub fn time_until_due(&self) -> Option<Duration> {
        let interval = self.interval()?;
        let idle = self.idle_time();
        (idle < interval).then(|| interval - idle)
    }

    /// Spawns the heartbeat timer. It only holds a weak reference to the connection and
    /// exits once the connection is gone or the tracker is disposed.
    pub fn start(&self, inner: Weak<Inner>) {
        let Self::Enabled(heartbeat) = self else {
            return;
        };
        let stop = heartbeat.stop.clone();
        let mut delay = heartbeat.interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let Some(inner) = inner.upgrade() else {
                    break;
                };
                match inner.on_keep_alive().await {
                    Some(next) => delay = next,
                    None => break,
                }
            }
        });
    }

    /// Stops the timer. Safe to call repeatedly.
    pub fn dispose(&self) {
        if let Self::Enabled(heartbeat) = self {
            heartbeat.stop.cancel();
        }
    }
}
