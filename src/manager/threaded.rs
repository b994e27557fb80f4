use std::fmt;
use std::sync::{Arc, Mutex};
use std::thread;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::backend::{Backend, LoopHooks};
use crate::device::{Joystick, Key};
use crate::error::InputError;
use crate::manager::{dispatcher, liveness, ActiveRun, AlivePredicate, EventCore, EventManager};
use crate::util::lock;

/// Runs the backend loop on a dedicated thread of this process.
pub struct ThreadEventManager {
    core: Arc<EventCore>,
    backend: Arc<dyn Backend>,
    alive_when: Option<AlivePredicate>,
    run: Mutex<Option<ActiveRun>>,
}

impl ThreadEventManager {
    pub(crate) fn from_parts(
        core: Arc<EventCore>,
        backend: Arc<dyn Backend>,
        alive_when: Option<AlivePredicate>,
    ) -> Self {
        Self {
            core,
            backend,
            alive_when,
            run: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    // Events arriving after cancellation are dropped so a late backend
    // cannot repopulate the registry once stop() cleared it.
    fn loop_hooks(&self, token: &CancellationToken) -> LoopHooks {
        let on_add = {
            let (core, token) = (self.core.clone(), token.clone());
            move |device: Arc<Joystick>| {
                if !token.is_cancelled() {
                    core.save_device(device);
                }
            }
        };
        let on_remove = {
            let (core, token) = (self.core.clone(), token.clone());
            move |device: Arc<Joystick>| {
                if !token.is_cancelled() {
                    core.delete_device(&device);
                }
            }
        };
        let on_key = {
            let (core, token) = (self.core.clone(), token.clone());
            move |key: Key| {
                if !token.is_cancelled() {
                    core.save_key_event(key);
                }
            }
        };

        LoopHooks {
            on_add: Box::new(on_add),
            on_remove: Box::new(on_remove),
            on_key: Box::new(on_key),
            is_alive: Box::new(liveness(token, self.alive_when.clone())),
        }
    }
}

impl EventManager for ThreadEventManager {
    fn core(&self) -> &Arc<EventCore> {
        &self.core
    }

    fn start(&self) -> Result<(), InputError> {
        if let Err(e) = self.stop() {
            debug!("Previous run did not stop cleanly: {}", e);
        }

        let name = self.core.settings().name.clone();
        info!("Starting event manager '{}' on backend '{}'", name, self.backend.name());

        let token = CancellationToken::new();
        if let Some(repeater) = self.core.repeater() {
            repeater.start()?;
        }
        let mut dispatcher = dispatcher::spawn(self.core.clone()).map_err(|e| {
            self.core.reset();
            e
        })?;

        let hooks = self.loop_hooks(&token);
        let backend = self.backend.clone();
        let thread_name = format!("{}-backend", name);
        let spawned = thread::Builder::new().name(thread_name.clone()).spawn(move || {
            debug!("Backend thread started");
            match backend.run_event_loop(&hooks) {
                Ok(()) => info!("Backend '{}' loop finished", backend.name()),
                Err(e) => error!("Backend '{}' loop failed: {}", backend.name(), e),
            }
        });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                dispatcher.stop(self.core.settings().activity_timeout).ok();
                self.core.reset();
                return Err(InputError::ThreadError(format!(
                    "failed to spawn '{}': {}",
                    thread_name, e
                )));
            }
        };

        *lock(&self.run) = Some(ActiveRun {
            token,
            name: thread_name,
            backend: Some(handle),
            dispatcher,
        });
        Ok(())
    }

    fn stop(&self) -> Result<(), InputError> {
        let run = lock(&self.run).take();
        let result = match run {
            Some(run) => {
                info!("Stopping event manager '{}'", self.core.settings().name);
                run.shutdown(self.core.settings().shutdown_grace)
            }
            None => Ok(()),
        };
        self.core.reset();
        result
    }

    fn is_running(&self) -> bool {
        lock(&self.run).as_ref().is_some_and(ActiveRun::is_live)
    }
}

impl fmt::Debug for ThreadEventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadEventManager")
            .field("backend", &self.backend.name())
            .field("running", &self.is_running())
            .field("core", &self.core)
            .finish()
    }
}

impl Drop for ThreadEventManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("Event manager dropped while backend still running: {}", e);
        }
    }
}
