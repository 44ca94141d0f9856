//! Cooperative control loop.
//!
//! One [`Controller`] owns the storage engine and the position source. Each
//! iteration polls the source, advances the session machine and checks for
//! a stop request. Nothing else touches the engine while the loop runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::error::Result;
use crate::flash::BlockDevice;
use crate::sample::PositionSource;
use crate::storage::{ActiveSession, SessionState, StopReason, Storage};

/// A handle for asking a running controller to stop.
///
/// Cheap to clone and safe to move into a signal handler task.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stop_signal: Arc<AtomicBool>,
}

impl StopHandle {
    /// Create a new handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to finalize the session and return.
    pub fn stop(&self) {
        self.stop_signal.store(true, Ordering::SeqCst);
    }

    /// Check if a stop has been requested.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.stop_signal.load(Ordering::SeqCst)
    }
}

/// Snapshot of the loop for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    /// Loop iterations so far.
    pub iterations: u64,
    /// Session machine state.
    pub state: SessionState,
    /// Session being recorded.
    pub session: Option<ActiveSession>,
    /// Why the last session ended.
    pub last_stop: Option<StopReason>,
}

/// Drives a [`Storage`] from a [`PositionSource`].
#[derive(Debug)]
pub struct Controller<D, S> {
    storage: Storage<D>,
    source: S,
    step: Duration,
    clock: Instant,
    iterations: u64,
    handle: StopHandle,
}

impl<D: BlockDevice, S: PositionSource> Controller<D, S> {
    /// Controller whose clock advances by `step` every iteration.
    pub fn new(storage: Storage<D>, source: S, step: Duration) -> Self {
        Self {
            storage,
            source,
            step,
            clock: Instant::now(),
            iterations: 0,
            handle: StopHandle::new(),
        }
    }

    /// Handle for stopping the loop from elsewhere.
    #[must_use]
    pub fn handle(&self) -> StopHandle {
        self.handle.clone()
    }

    /// Current loop status.
    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            iterations: self.iterations,
            state: self.storage.state(),
            session: self.storage.active_session(),
            last_stop: self.storage.last_stop(),
        }
    }

    /// The engine being driven.
    #[must_use]
    pub fn storage(&self) -> &Storage<D> {
        &self.storage
    }

    /// Stop driving and hand the engine back.
    #[must_use]
    pub fn into_storage(self) -> Storage<D> {
        self.storage
    }

    /// Request a session start.
    ///
    /// # Errors
    ///
    /// See [`Storage::request_start`].
    pub fn start(&mut self) -> Result<SessionState> {
        self.storage.request_start(&mut self.source, self.clock)
    }

    /// Run one loop iteration. Returns `false` once the loop should end.
    ///
    /// The loop ends when a stop was requested, the feed finished, or the
    /// session machine went back to idle on its own.
    ///
    /// # Errors
    ///
    /// Propagates session and device errors.
    pub fn step(&mut self) -> Result<bool> {
        self.iterations += 1;
        self.clock += self.step;

        if self.handle.should_stop() {
            info!("Stop requested");
            self.finish()?;
            return Ok(false);
        }

        self.source.poll();
        if self.source.is_finished() {
            info!("Position feed finished");
            self.finish()?;
            return Ok(false);
        }

        let state = self.storage.poll(&mut self.source, self.clock)?;
        debug!(iteration = self.iterations, %state, "Loop iteration");
        Ok(state != SessionState::Idle)
    }

    fn finish(&mut self) -> Result<()> {
        if self.storage.state() != SessionState::Idle {
            self.storage.request_stop()?;
        }
        Ok(())
    }

    /// Step on a timer every `period` until the loop ends.
    ///
    /// # Errors
    ///
    /// Propagates the first error from [`step`](Self::step).
    pub async fn run(&mut self, period: Duration) -> Result<ControllerStatus> {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.step()? {
                break;
            }
        }

        Ok(self.status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::{FlashGeometry, FlashLayout, MemoryFlash};
    use crate::sample::{ReplaySource, HEADER_LINE};
    use crate::storage::SessionSettings;

    const FEED: &str = "\
latitude,longitude,elevation,time,speed_kmh\r
52.500000,13.400000,30,2024-05-01 09:00:00,0\r
52.500100,13.400100,31,2024-05-01 09:00:01,12\r
52.500200,13.400200,32,2024-05-01 09:00:02,25\r
52.500300,13.400300,33,2024-05-01 09:00:03,31\r
52.500400,13.400400,34,2024-05-01 09:00:04,18\r
";

    fn storage() -> Storage<MemoryFlash> {
        let capacity = 64 * 1024;
        Storage::open(
            MemoryFlash::new(FlashGeometry {
                capacity,
                page_size: 256,
                sector_size: 4096,
            }),
            FlashLayout::new(8192, capacity),
            SessionSettings::default(),
        )
        .unwrap()
    }

    fn controller(warmup: u32) -> Controller<MemoryFlash, ReplaySource> {
        Controller::new(
            storage(),
            ReplaySource::from_text(FEED).with_warmup(warmup),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_stop_handle() {
        let handle = StopHandle::new();
        assert!(!handle.should_stop());

        let clone = handle.clone();
        clone.stop();
        assert!(handle.should_stop());
    }

    #[test]
    fn test_records_whole_feed() {
        let mut ctl = controller(2);
        assert_eq!(ctl.start().unwrap(), SessionState::PendingStart);

        while ctl.step().unwrap() {}

        let status = ctl.status();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.last_stop, Some(StopReason::Requested));

        let storage = ctl.into_storage();
        let files = storage.list();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "20240501_090000.csv");
        assert!(!files[0].incomplete);
        // Every fix is stored byte for byte after the header.
        assert_eq!(files[0].size as usize, FEED.len());
        assert!(FEED.starts_with(HEADER_LINE));
    }

    #[test]
    fn test_stop_request_finalizes() {
        let mut ctl = controller(0);
        ctl.start().unwrap();
        assert!(ctl.step().unwrap());
        assert!(ctl.step().unwrap());

        ctl.handle().stop();
        assert!(!ctl.step().unwrap());

        let storage = ctl.into_storage();
        let files = storage.list();
        assert_eq!(files.len(), 1);
        assert!(!files[0].incomplete);
    }

    #[tokio::test]
    async fn test_run_until_feed_ends() {
        let mut ctl = controller(0);
        ctl.start().unwrap();

        let status = ctl.run(Duration::from_millis(1)).await.unwrap();
        assert_eq!(status.state, SessionState::Idle);
        assert_eq!(status.iterations, 6);
        assert_eq!(ctl.storage().list().len(), 1);
    }
}
