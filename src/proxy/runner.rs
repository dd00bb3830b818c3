// Copyright FlowProxy Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Bounded-frequency scheduling of the sync loop.
//!
//! External kicks land on a one-slot channel, so any number of events
//! between two ticks collapses into a single run. A token bucket enforces
//! the minimum interval with a small burst budget, and a timer guarantees an
//! involuntary run at least every max interval.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::signal::Shutdown;

struct TokenBucket {
    capacity: u32,
    tokens: u32,
    refill: Duration,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill: Duration, now: Instant) -> Self {
        Self {
            capacity: capacity.max(1),
            tokens: capacity.max(1),
            refill,
            last_refill: now,
        }
    }

    /// Take one token, or report how long until the next one is available.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let refills = (elapsed.as_nanos() / self.refill.as_nanos().max(1)) as u32;
        if refills > 0 {
            self.tokens = (self.tokens.saturating_add(refills)).min(self.capacity);
            self.last_refill += self.refill * refills;
        }
        if self.tokens == 0 {
            let since = now.saturating_duration_since(self.last_refill);
            return Err(self.refill.saturating_sub(since));
        }
        self.tokens -= 1;
        Ok(())
    }
}

pub struct BoundedFrequencyRunner {
    name: String,
    min_interval: Duration,
    max_interval: Duration,
    burst: u32,
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
}

/// Cloneable trigger for the runner. Safe to call from any thread; calls
/// between two ticks coalesce.
#[derive(Clone)]
pub struct RunnerHandle {
    tx: mpsc::Sender<()>,
}

impl RunnerHandle {
    pub fn run(&self) {
        // A full slot means a tick is already pending, which is exactly
        // the coalescing we want.
        let _ = self.tx.try_send(());
    }
}

impl BoundedFrequencyRunner {
    pub fn new(
        name: impl Into<String>,
        min_interval: Duration,
        max_interval: Duration,
        burst: u32,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            name: name.into(),
            min_interval,
            max_interval,
            burst,
            tx,
            rx,
        }
    }

    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            tx: self.tx.clone(),
        }
    }

    /// Drive `tick` until shutdown, or until `tick` returns false to report
    /// an unrecoverable condition. The in-flight tick always completes;
    /// kicks pending at shutdown are dropped.
    pub async fn run<F>(mut self, shutdown: Shutdown, mut tick: F)
    where
        F: FnMut() -> bool,
    {
        let mut bucket = TokenBucket::new(self.burst, self.min_interval, Instant::now());
        let wait = shutdown.wait();
        tokio::pin!(wait);
        debug!(runner = %self.name, "starting");
        loop {
            tokio::select! {
                _ = &mut wait => {
                    debug!(runner = %self.name, "stop requested");
                    return;
                }
                _ = self.rx.recv() => {
                    trace!(runner = %self.name, "triggered");
                }
                _ = tokio::time::sleep(self.max_interval) => {
                    trace!(runner = %self.name, "max interval elapsed");
                }
            }
            if let Err(delay) = bucket.try_take(Instant::now()) {
                tokio::select! {
                    _ = &mut wait => {
                        debug!(runner = %self.name, "stop requested while rate limited");
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                let _ = bucket.try_take(Instant::now());
            }
            // Anything queued up to here is covered by this tick.
            while self.rx.try_recv().is_ok() {}
            if !tick() {
                debug!(runner = %self.name, "stopping on tick request");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn token_bucket_enforces_min_interval_with_burst() {
        let start = Instant::now();
        let min = Duration::from_secs(1);
        let mut bucket = TokenBucket::new(2, min, start);

        // The burst budget allows back-to-back runs.
        assert!(bucket.try_take(start).is_ok());
        assert!(bucket.try_take(start + Duration::from_millis(10)).is_ok());

        // The third run must wait for the next refill.
        let delay = bucket
            .try_take(start + Duration::from_millis(20))
            .unwrap_err();
        assert!(delay <= min);
        assert!(delay >= Duration::from_millis(900));

        // After the refill the run goes through.
        assert!(bucket.try_take(start + min + Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn token_bucket_caps_at_capacity() {
        let start = Instant::now();
        let mut bucket = TokenBucket::new(2, Duration::from_secs(1), start);
        // A long idle period must not accumulate more than the burst budget.
        let later = start + Duration::from_secs(100);
        assert!(bucket.try_take(later).is_ok());
        assert!(bucket.try_take(later).is_ok());
        assert!(bucket.try_take(later).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn kicks_coalesce_into_one_tick() {
        let runner = BoundedFrequencyRunner::new(
            "test",
            Duration::from_millis(100),
            Duration::from_secs(3600),
            1,
        );
        let handle = runner.handle();
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = ticks.clone();
        let shutdown = Shutdown::new();
        let trigger = shutdown.trigger();

        handle.run();
        handle.run();
        handle.run();

        let task = tokio::spawn(runner.run(shutdown, move || {
            counted.fetch_add(1, Ordering::SeqCst);
            true
        }));
        // Give the runner a chance to drain the queued kicks.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        trigger.shutdown_now().await;
        task.await.unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn max_interval_forces_a_tick() {
        let runner = BoundedFrequencyRunner::new(
            "test",
            Duration::from_millis(10),
            Duration::from_millis(200),
            2,
        );
        let ticks = Arc::new(AtomicUsize::new(0));
        let counted = ticks.clone();
        let shutdown = Shutdown::new();
        let trigger = shutdown.trigger();

        let task = tokio::spawn(runner.run(shutdown, move || {
            counted.fetch_add(1, Ordering::SeqCst);
            true
        }));
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert!(ticks.load(Ordering::SeqCst) >= 2);

        trigger.shutdown_now().await;
        task.await.unwrap();
    }
}
