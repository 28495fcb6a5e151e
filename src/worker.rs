//! Cancellation and pacing shared by staff and drone threads.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::SupplyError;
use crate::health_monitor::WorkerMonitor;
use crate::types::WorkerId;

/// Cooperative stop signal for one worker.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Why a worker step stopped early.
#[derive(Debug)]
pub enum Halt {
    /// Normal shutdown path.
    Cancelled,
    Failed(SupplyError),
}

impl From<SupplyError> for Halt {
    fn from(err: SupplyError) -> Self {
        Halt::Failed(err)
    }
}

/// Log a failed worker step. Menu edits racing a pass are routine.
pub fn report_failure(id: &WorkerId, err: &SupplyError) {
    match err {
        SupplyError::ConcurrentMutation => log::debug!("{id}: {err}; retrying next pass"),
        SupplyError::Persistence(_) => log::error!("{id}: {err}"),
        _ => log::warn!("{id}: {err}"),
    }
}

/// Per-worker handle on the token, the heartbeat monitor and pacing.
pub struct WorkerCtx {
    id: WorkerId,
    token: CancelToken,
    monitor: Arc<WorkerMonitor>,
    slice: Duration,
}

impl WorkerCtx {
    pub fn new(id: WorkerId, token: CancelToken, monitor: Arc<WorkerMonitor>, slice: Duration) -> Self {
        monitor.register(id.clone());
        Self {
            id,
            token,
            monitor,
            slice,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Loop-boundary check; also counts as a heartbeat.
    pub fn checkpoint(&self) -> Result<(), Halt> {
        if self.token.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        self.monitor.heartbeat(&self.id);
        Ok(())
    }

    /// Sleep in small slices so cancellation is noticed promptly.
    pub fn sleep(&self, duration: Duration) -> Result<(), Halt> {
        let deadline = Instant::now() + duration;
        loop {
            self.checkpoint()?;
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            thread::sleep(self.slice.min(deadline - now));
        }
    }
}

/// A running worker thread.
pub struct WorkerHandle {
    token: CancelToken,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn a named thread running `body` with a fresh token.
    pub fn spawn(
        id: &WorkerId,
        body: impl FnOnce(CancelToken) + Send + 'static,
    ) -> std::io::Result<Self> {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let join = thread::Builder::new()
            .name(id.to_string())
            .spawn(move || body(worker_token))?;
        Ok(Self { token, join })
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancel and wait for the thread to unwind.
    pub fn stop(self) {
        self.token.cancel();
        if self.join.join().is_err() {
            log::error!("worker thread panicked before stopping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(token: CancelToken) -> WorkerCtx {
        WorkerCtx::new(
            WorkerId::Staff("test".into()),
            token,
            Arc::new(WorkerMonitor::new()),
            Duration::from_millis(1),
        )
    }

    #[test]
    fn sleep_returns_after_duration() {
        let ctx = ctx(CancelToken::new());
        let start = Instant::now();
        ctx.sleep(Duration::from_millis(15)).expect("not cancelled");
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn sleep_stops_early_on_cancel() {
        let token = CancelToken::new();
        let ctx = ctx(token.clone());
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            token.cancel();
        });
        let start = Instant::now();
        let result = ctx.sleep(Duration::from_secs(10));
        assert!(matches!(result, Err(Halt::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().expect("canceller panicked");
    }

    #[test]
    fn stop_joins_the_thread() {
        let id = WorkerId::Drone(1);
        let handle = WorkerHandle::spawn(&id, |token| {
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("spawn");
        assert!(!handle.is_finished());
        handle.stop();
    }
}
