//! Active driver behind `LeaderboardReset`/`TournamentEnd`/`TournamentReset`
//! (spec §4.5 "Reset events", §9 "the scheduler subscribes per leaderboard
//! and debounces concurrent fires"). `current_partition`/`session_window`
//! only roll the partition key forward passively when something happens to
//! touch a leaderboard; this is what actually fires the runtime handlers at
//! each schedule tick, the same self-contained-task-owns-its-lifecycle
//! shape as the match engine's tick task (`mtch/scheduler.rs`).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::clock::now_epoch_secs;
use crate::leaderboard::{Leaderboard, LeaderboardCache, LeaderboardStorage};
use crate::runtime::{InvocationMode, Runtime, RuntimeContext};

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);
const DISCOVERY_PAGE_SIZE: usize = 200;

/// Discovers leaderboards with a `reset_schedule` and owns exactly one
/// fire-loop task per leaderboard id, spawned under the shared
/// `TaskTracker` and stopped by the shared `CancellationToken` the same way
/// `main.rs` shuts down every other background task.
pub struct ResetScheduler<S: LeaderboardStorage> {
    cache: Arc<LeaderboardCache<S>>,
    runtime: Arc<Runtime>,
    tracker: TaskTracker,
    token: CancellationToken,
    scheduled: Mutex<HashSet<String>>,
}

impl<S: LeaderboardStorage> ResetScheduler<S> {
    pub fn new(
        cache: Arc<LeaderboardCache<S>>,
        runtime: Arc<Runtime>,
        tracker: TaskTracker,
        token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            runtime,
            tracker,
            token,
            scheduled: Mutex::new(HashSet::new()),
        })
    }

    /// Spawns the discovery loop under the tracker. Call once at startup;
    /// leaderboards created afterward are picked up on the next discovery
    /// pass rather than requiring a restart.
    pub fn start(self: &Arc<Self>) {
        let this = self.clone();
        self.tracker.spawn(async move { this.discovery_loop().await });
    }

    async fn discovery_loop(self: Arc<Self>) {
        loop {
            if let Err(err) = self.discover_once().await {
                warn!(%err, "leaderboard reset scheduler discovery pass failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(DISCOVERY_INTERVAL) => {}
                () = self.token.cancelled() => return,
            }
        }
    }

    async fn discover_once(self: &Arc<Self>) -> crate::error::CoreResult<()> {
        let mut after: Option<String> = None;
        loop {
            let (page, next) = self.cache.list_all(DISCOVERY_PAGE_SIZE, after.as_deref()).await?;
            let page_len = page.len();
            for leaderboard in page {
                if leaderboard.reset_schedule.is_some() {
                    self.ensure_scheduled(leaderboard);
                }
            }
            match next {
                Some(cursor) if page_len > 0 => after = Some(cursor),
                _ => break,
            }
        }
        Ok(())
    }

    fn ensure_scheduled(self: &Arc<Self>, leaderboard: Leaderboard) {
        {
            let mut scheduled = self.scheduled.lock();
            if !scheduled.insert(leaderboard.id.clone()) {
                return;
            }
        }
        let this = self.clone();
        self.tracker.spawn(async move { this.fire_loop(leaderboard).await });
    }

    /// Owns one leaderboard's reset lifecycle end to end: sleep to the next
    /// schedule tick, fire the matching invocation modes, re-read the
    /// leaderboard (its config may have changed, or it may be gone) and
    /// repeat. One task per leaderboard id makes "debounces concurrent
    /// fires" automatic — there is never more than one fire in flight for
    /// a given leaderboard.
    async fn fire_loop(&self, mut leaderboard: Leaderboard) {
        loop {
            let Some(schedule) = leaderboard.reset_schedule.clone() else {
                self.scheduled.lock().remove(&leaderboard.id);
                return;
            };

            let now = now_epoch_secs();
            let next = schedule.next(now);
            let delay = Duration::from_secs((next - now).max(1) as u64);

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                () = self.token.cancelled() => return,
            }

            self.fire(&leaderboard, next).await;

            match self.cache.get(&leaderboard.id).await {
                Ok(refreshed) => leaderboard = refreshed,
                Err(_) => {
                    info!(leaderboard_id = %leaderboard.id, "leaderboard gone, stopping its reset loop");
                    self.scheduled.lock().remove(&leaderboard.id);
                    return;
                }
            }
        }
    }

    async fn fire(&self, leaderboard: &Leaderboard, epoch: i64) {
        for mode in self.modes_for(leaderboard, epoch) {
            let key = mode.registration_key();
            if !self.runtime.is_registered(&key) {
                continue;
            }
            if let Err(err) = self.runtime.invoke(RuntimeContext::default(), mode).await {
                warn!(leaderboard_id = %leaderboard.id, %err, "reset handler failed");
            }
        }
    }

    /// At each schedule tick a plain leaderboard fires `LeaderboardReset`.
    /// A tournament additionally fires `TournamentEnd` when the session
    /// that's closing already reached its duration, and always fires
    /// `TournamentReset` for the session the tick is opening (spec §4.5
    /// "Tournament-End/Tournament-Reset handlers fire at duration-end and
    /// reset-boundary respectively").
    fn modes_for(&self, leaderboard: &Leaderboard, epoch: i64) -> Vec<InvocationMode> {
        if !leaderboard.is_tournament() {
            return vec![InvocationMode::LeaderboardReset {
                leaderboard_id: leaderboard.id.clone(),
            }];
        }

        let mut modes = Vec::new();
        let (closing_start, closing_end) = leaderboard.session_window(epoch.saturating_sub(1));
        if closing_end <= epoch && closing_start < epoch {
            modes.push(InvocationMode::TournamentEnd {
                leaderboard_id: leaderboard.id.clone(),
            });
        }
        modes.push(InvocationMode::TournamentReset {
            leaderboard_id: leaderboard.id.clone(),
        });
        modes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leaderboard::{InMemoryLeaderboardStorage, Operator, SortOrder};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration as StdDuration;

    fn every_second_schedule() -> &'static str {
        "* * * * * *"
    }

    #[tokio::test]
    async fn fires_leaderboard_reset_on_every_tick() {
        let cache = LeaderboardCache::new(InMemoryLeaderboardStorage::new());
        cache
            .create(
                "lb",
                SortOrder::Descending,
                Operator::Best,
                Some(every_second_schedule()),
                false,
                false,
                true,
                serde_json::Value::Null,
            )
            .await
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_for_handler = fired.clone();
        let runtime = Arc::new(
            Runtime::builder()
                .register("leaderboard_reset", move |_ctx: RuntimeContext, _payload: serde_json::Value| {
                    let fired = fired_for_handler.clone();
                    async move {
                        fired.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }
                })
                .build(),
        );

        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let scheduler = ResetScheduler::new(cache, runtime, tracker.clone(), token.clone());
        scheduler.start();

        tokio::time::sleep(StdDuration::from_millis(2_200)).await;
        assert!(fired.load(Ordering::SeqCst) >= 1, "expected at least one leaderboard_reset fire");

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn leaderboards_without_a_reset_schedule_are_never_scheduled() {
        let cache = LeaderboardCache::new(InMemoryLeaderboardStorage::new());
        cache
            .create("lb", SortOrder::Descending, Operator::Best, None, false, false, true, serde_json::Value::Null)
            .await
            .unwrap();

        let runtime = Arc::new(Runtime::builder().build());
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let scheduler = ResetScheduler::new(cache, runtime, tracker.clone(), token.clone());
        scheduler.discover_once().await.unwrap();
        assert!(scheduler.scheduled.lock().is_empty());

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
