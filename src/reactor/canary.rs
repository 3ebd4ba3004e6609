//! Canary: the reactor liveness watchdog.
//!
//! An independent OS thread samples the reactor's tasks-executed counter at
//! a fixed interval. If the counter fails to advance for longer than the
//! stall timeout, the canary raises a liveness alarm (log event plus
//! callback); when the counter next advances it raises a revived signal.
//! The canary holds no other shared state and performs no recovery — a
//! stuck task is an operator/process-supervision concern.
//!
//! A counter that only moves when work runs cannot distinguish a stalled
//! loop from an idle one, so starting a canary also installs a periodic
//! heartbeat task on the reactor with the sampling interval as its period.
//! The alarm therefore means "the loop cannot run even a trivial task".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::{Reactor, Schedule};
use crate::error::AppResult;

const HEARTBEAT_KEY: &str = "canary/heartbeat";

/// Handle to a running canary thread. Dropping the handle asks the thread
/// to exit; [`Canary::stop`] additionally joins it.
pub struct Canary {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Canary {
    /// Start watching `reactor`. `on_stall` fires once when the counter
    /// stops advancing for longer than `timeout`; `on_revive` fires once
    /// when it moves again after a stall.
    pub fn watch<F, G>(
        reactor: &Reactor,
        interval: Duration,
        timeout: Duration,
        on_stall: F,
        on_revive: G,
    ) -> AppResult<Canary>
    where
        F: FnMut() + Send + 'static,
        G: FnMut() + Send + 'static,
    {
        reactor.schedule(
            HEARTBEAT_KEY,
            Schedule::every(interval.as_secs_f64()),
            || {},
        );

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let reactor = reactor.clone();
        let handle = std::thread::Builder::new()
            .name("canary".into())
            .spawn(move || watch_loop(reactor, interval, timeout, on_stall, on_revive, stop_flag))?;

        Ok(Canary {
            stop,
            handle: Some(handle),
        })
    }

    /// Ask the canary thread to exit and wait for it.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Canary {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

fn watch_loop<F, G>(
    reactor: Reactor,
    interval: Duration,
    timeout: Duration,
    mut on_stall: F,
    mut on_revive: G,
    stop: Arc<AtomicBool>,
) where
    F: FnMut() + Send + 'static,
    G: FnMut() + Send + 'static,
{
    let mut last_count = reactor.tasks_executed();
    let mut last_advance = Instant::now();
    let mut stalled = false;

    while !stop.load(Ordering::Relaxed) {
        std::thread::sleep(interval);
        if stop.load(Ordering::Relaxed) {
            return;
        }

        let count = reactor.tasks_executed();
        if count != last_count {
            last_count = count;
            last_advance = Instant::now();
            if stalled {
                stalled = false;
                info!("reactor revived, tasks executing again");
                on_revive();
            }
        } else if !stalled && last_advance.elapsed() > timeout {
            stalled = true;
            error!(
                stalled_for_secs = last_advance.elapsed().as_secs_f64(),
                "reactor liveness alarm: tasks-executed counter is not advancing"
            );
            on_stall();
        }
    }
}
