//! Small shared helpers: the periodic worker thread used by the dispatcher and
//! the repeat checker, axis math, and lock accessors.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Sender};
use tracing::{debug, error, info};

use crate::error::InputError;

/// Thread that runs a task at a fixed interval until it is stopped.
///
/// A panic inside one run is logged and the loop keeps going, so one bad
/// cycle never takes the whole worker down.
#[derive(Debug)]
pub struct PeriodicWorker {
    name: String,
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicWorker {
    pub fn spawn<F>(
        name: impl Into<String>,
        interval: Duration,
        mut task: F,
    ) -> Result<Self, InputError>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let thread_name = name.clone();

        debug!("Spawning periodic worker '{}' every {:?}", name, interval);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let ticker = crossbeam_channel::tick(interval);
                loop {
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(ticker) -> _ => {
                            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                                error!(
                                    "Periodic task '{}' panicked, skipping cycle: {}",
                                    thread_name,
                                    panic_message(payload.as_ref())
                                );
                            }
                        }
                    }
                }
                debug!("Periodic worker '{}' finished", thread_name);
            })
            .map_err(|e| InputError::ThreadError(format!("failed to spawn '{}': {}", name, e)))?;

        Ok(Self {
            name,
            interval,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Signals the worker and waits at most `grace` for the thread to exit.
    ///
    /// A worker still busy after `grace` is detached and reported as
    /// [`InputError::ShutdownTimeout`].
    pub fn stop(&mut self, grace: Duration) -> Result<(), InputError> {
        // Dropping the sender disconnects the stop channel.
        self.stop_tx.take();
        match self.handle.take() {
            Some(handle) => join_within(handle, grace, &self.name),
            None => Ok(()),
        }
    }
}

impl Drop for PeriodicWorker {
    fn drop(&mut self) {
        self.stop_tx.take();
    }
}

/// Joins `handle` if it finishes within `grace`; otherwise leaves it detached.
pub fn join_within(handle: JoinHandle<()>, grace: Duration, name: &str) -> Result<(), InputError> {
    if handle.thread().id() == thread::current().id() {
        debug!("Thread '{}' is stopping itself, not joining", name);
        return Ok(());
    }
    let deadline = Instant::now() + grace;
    loop {
        if handle.is_finished() {
            if handle.join().is_err() {
                error!("Thread '{}' ended with a panic", name);
            }
            return Ok(());
        }
        if Instant::now() >= deadline {
            info!("Thread '{}' still running after {:?}, detaching", name, grace);
            return Err(InputError::ShutdownTimeout(format!(
                "thread '{}' did not finish within {:?}",
                name, grace
            )));
        }
        thread::sleep(Duration::from_millis(1));
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Applies a deadband to an axis value and rescales the remainder.
///
/// `scale` is the magnitude of the axis range (1 for -1..1, 100 for -100..100).
pub fn deadband(value: f64, dead: f64, scale: f64) -> f64 {
    let mut dead = dead.abs();
    if dead == scale {
        dead = scale * 0.99;
    }

    let shifted = if value >= dead {
        value - dead
    } else if value <= -dead {
        value + dead
    } else {
        0.0
    };

    (shifted / (scale - dead)) * scale
}

/// Converts `value` from the `[cur_min, cur_max]` scale to `[new_min, new_max]`.
pub fn rescale(value: f64, cur_min: f64, cur_max: f64, new_min: f64, new_max: f64) -> f64 {
    ((value - cur_min) / (cur_max - cur_min)) * (new_max - new_min) + new_min
}
