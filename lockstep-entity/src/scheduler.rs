//! Automatic tick scheduling.
//!
//! Each wake runs due ticks, flushes, and arms the next wake. The timer is a
//! spawned task that posts a message back to the entity mailbox; re-arming
//! aborts the previous task and bumps the generation so a message that was
//! already in flight is recognised as stale.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::trace;

use lockstep_journal::ModelTimeline;

use crate::config::TickScheduleConfig;

/// Tick timer of one entity.
#[derive(Debug)]
pub struct TickScheduler {
    config: TickScheduleConfig,
    generation: u64,
    timer: Option<JoinHandle<()>>,
    scheduled_with_clients: Option<bool>,
}

impl TickScheduler {
    pub fn new(config: TickScheduleConfig) -> Self {
        Self {
            config,
            generation: 0,
            timer: None,
            scheduled_with_clients: None,
        }
    }

    /// Wall-clock time of the next wake.
    ///
    /// A zero interval means "next tick boundary". Intervals past the end of
    /// the calendar saturate at the latest representable time.
    pub fn next_wake(&self, timeline: &ModelTimeline, now: DateTime<Utc>, has_clients: bool) -> DateTime<Utc> {
        let interval = self.config.interval(has_clients);
        if interval.is_zero() {
            timeline.time_of_tick(timeline.current_tick + 1)
        } else {
            chrono::Duration::from_std(interval)
                .ok()
                .and_then(|interval| now.checked_add_signed(interval))
                .unwrap_or(DateTime::<Utc>::MAX_UTC)
        }
    }

    /// Whether the client set changed since the timer was last armed.
    pub fn needs_reschedule(&self, has_clients: bool) -> bool {
        self.scheduled_with_clients != Some(has_clients)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a timer message belongs to the currently armed timer.
    pub fn is_current(&self, generation: u64) -> bool {
        self.timer.is_some() && generation == self.generation
    }

    /// Cancel the old timer and arm a new one posting `make(generation)`.
    ///
    /// Without a mailbox only the bookkeeping is updated.
    pub fn arm<T, F>(
        &mut self,
        timeline: &ModelTimeline,
        now: DateTime<Utc>,
        has_clients: bool,
        mailbox: Option<&mpsc::WeakSender<T>>,
        make: F,
    ) -> Duration
    where
        T: Send + 'static,
        F: FnOnce(u64) -> T + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        self.scheduled_with_clients = Some(has_clients);

        let wake = self.next_wake(timeline, now, has_clients);
        let delay = (wake - now).to_std().unwrap_or(Duration::ZERO);
        trace!(generation = self.generation, ?delay, has_clients, "Tick timer armed");

        if let Some(mailbox) = mailbox {
            let mailbox = mailbox.clone();
            let generation = self.generation;
            self.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(sender) = mailbox.upgrade() {
                    let _ = sender.send(make(generation)).await;
                }
            }));
        }
        delay
    }

    /// Abort the pending timer, if any.
    pub fn cancel(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl Drop for TickScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_next_wake_depends_on_clients() {
        let scheduler = TickScheduler::new(TickScheduleConfig::default());
        let mut timeline = ModelTimeline::new(10, t0());
        timeline.current_tick = 4;
        let now = t0() + chrono::Duration::milliseconds(420);

        assert_eq!(
            scheduler.next_wake(&timeline, now, false),
            now + chrono::Duration::seconds(5)
        );
        assert_eq!(
            scheduler.next_wake(&timeline, now, true),
            t0() + chrono::Duration::milliseconds(500)
        );
    }

    #[test]
    fn test_explicit_client_interval() {
        let scheduler = TickScheduler::new(TickScheduleConfig {
            when_no_clients_connected_ms: 5_000,
            with_clients_connected_ms: 250,
        });
        let timeline = ModelTimeline::new(10, t0());
        assert_eq!(
            scheduler.next_wake(&timeline, t0(), true),
            t0() + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_huge_interval_saturates() {
        let mut scheduler = TickScheduler::new(TickScheduleConfig {
            when_no_clients_connected_ms: u64::MAX,
            with_clients_connected_ms: 10_000_000_000_000_000,
        });
        let timeline = ModelTimeline::new(10, t0());

        assert_eq!(scheduler.next_wake(&timeline, t0(), false), DateTime::<Utc>::MAX_UTC);
        assert_eq!(scheduler.next_wake(&timeline, t0(), true), DateTime::<Utc>::MAX_UTC);

        let delay = scheduler.arm::<u64, _>(&timeline, t0(), false, None, |g| g);
        assert!(delay > Duration::from_secs(100 * 365 * 24 * 3600));
    }

    #[test]
    fn test_arm_without_mailbox_tracks_client_state() {
        let mut scheduler = TickScheduler::new(TickScheduleConfig::default());
        let timeline = ModelTimeline::new(10, t0());
        assert!(scheduler.needs_reschedule(false));

        let delay = scheduler.arm::<u64, _>(&timeline, t0(), false, None, |g| g);
        assert_eq!(delay, Duration::from_secs(5));
        assert!(!scheduler.needs_reschedule(false));
        assert!(scheduler.needs_reschedule(true));
        assert!(!scheduler.is_current(scheduler.generation()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearming_supersedes_previous_timer() {
        let (tx, mut rx) = mpsc::channel::<u64>(4);
        let weak = tx.downgrade();
        let mut scheduler = TickScheduler::new(TickScheduleConfig::default());
        let timeline = ModelTimeline::new(10, t0());

        scheduler.arm(&timeline, t0(), false, Some(&weak), |g| g);
        let delay = scheduler.arm(&timeline, t0(), true, Some(&weak), |g| g);
        assert_eq!(delay, Duration::from_millis(100));

        let generation = rx.recv().await.unwrap();
        assert_eq!(generation, 2);
        assert!(scheduler.is_current(generation));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }
}
