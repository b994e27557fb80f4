//! Child side of the process boundary: runs a backend loop and writes every
//! event as one line of [`crate::wire`] output.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

use crate::backend::{Backend, LoopHooks};
use crate::device::{Joystick, Key};
use crate::error::InputError;
use crate::util::lock;
use crate::wire::{self, WireEvent};

struct RelayWriter<W> {
    out: Mutex<W>,
    broken: AtomicBool,
}

impl<W: Write> RelayWriter<W> {
    fn send(&self, event: &WireEvent) {
        if self.broken.load(Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.write_line(event) {
            // The parent went away; end the loop instead of spinning.
            warn!("Relay output failed, stopping: {}", e);
            self.broken.store(true, Ordering::SeqCst);
        }
    }

    fn write_line(&self, event: &WireEvent) -> Result<(), InputError> {
        let line = wire::encode(event)?;
        let mut out = lock(&self.out);
        writeln!(out, "{}", line)?;
        out.flush()?;
        Ok(())
    }
}

/// Runs `backend` until `alive` turns false or the output breaks, writing
/// events to `out`. Returns the writer.
pub fn relay<W, A>(backend: &dyn Backend, out: W, alive: A) -> Result<W, InputError>
where
    W: Write + Send + 'static,
    A: Fn() -> bool + Send + Sync + 'static,
{
    let writer = Arc::new(RelayWriter {
        out: Mutex::new(out),
        broken: AtomicBool::new(false),
    });

    let hooks = {
        let (on_add, on_remove, on_key, liveness) =
            (writer.clone(), writer.clone(), writer.clone(), writer.clone());
        LoopHooks {
            on_add: Box::new(move |device: Arc<Joystick>| {
                on_add.send(&WireEvent::DeviceAdded {
                    device: device.info().clone(),
                })
            }),
            on_remove: Box::new(move |device: Arc<Joystick>| {
                on_remove.send(&WireEvent::DeviceRemoved {
                    device: device.ident(),
                })
            }),
            on_key: Box::new(move |key: Key| on_key.send(&WireEvent::key(&key))),
            is_alive: Box::new(move || !liveness.broken.load(Ordering::SeqCst) && alive()),
        }
    };

    info!("Relaying events from backend '{}'", backend.name());
    let result = backend.run_event_loop(&hooks);
    drop(hooks);
    debug!("Relay loop finished");

    let writer = Arc::try_unwrap(writer)
        .map_err(|_| InputError::ThreadError("relay writer still shared".to_string()))?;
    result?;
    Ok(writer.out.into_inner().unwrap_or_else(PoisonError::into_inner))
}
