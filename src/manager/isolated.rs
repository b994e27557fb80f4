use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::device::Joystick;
use crate::error::InputError;
use crate::manager::{dispatcher, liveness, ActiveRun, AlivePredicate, EventCore, EventManager};
use crate::util::lock;
use crate::wire::{self, WireEvent};

const ALIVE_POLL: Duration = Duration::from_millis(20);

/// Program that writes wire events to its stdout, usually `padstream relay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl RelayCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// This executable's `relay` subcommand.
    pub fn current_exe() -> Result<Self, InputError> {
        Ok(Self::new(std::env::current_exe()?).arg("relay"))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

impl fmt::Display for RelayCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Parent side of the process boundary: mirrors the relay's events into the
/// local core.
struct RelayReader {
    core: Arc<EventCore>,
    command: RelayCommand,
    token: CancellationToken,
    is_alive: Box<dyn Fn() -> bool + Send + Sync>,
}

impl RelayReader {
    fn run(self) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Failed to build relay reader runtime: {}", e);
                return;
            }
        };
        if let Err(e) = runtime.block_on(self.pump()) {
            error!("Relay reader stopped: {}", e);
        }
    }

    fn spawn_child(&self) -> Result<Child, InputError> {
        info!("Spawning relay: {}", self.command);
        Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InputError::TransportError(format!("failed to spawn '{}': {}", self.command, e))
            })
    }

    async fn pump(&self) -> Result<(), InputError> {
        let mut child = self.spawn_child()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InputError::TransportError("relay stdout not captured".to_string()))?;
        let mut lines = BufReader::new(stdout).lines();
        let mut alive_check = tokio::time::interval(ALIVE_POLL);

        let outcome = loop {
            tokio::select! {
                _ = self.token.cancelled() => break Ok(()),
                _ = alive_check.tick() => {
                    if !(self.is_alive)() {
                        debug!("Liveness check failed, closing relay");
                        break Ok(());
                    }
                }
                line = lines.next_line() => match line {
                    Ok(Some(line)) => self.handle_line(&line),
                    Ok(None) => {
                        info!("Relay closed its output");
                        break Ok(());
                    }
                    Err(e) => break Err(InputError::TransportError(e.to_string())),
                },
            }
        };

        if let Err(e) = child.kill().await {
            debug!("Relay already exited: {}", e);
        }
        outcome
    }

    fn handle_line(&self, line: &str) {
        if line.trim().is_empty() || self.token.is_cancelled() {
            return;
        }
        trace!("Relay line: {}", line);
        match wire::decode(line) {
            Ok(event) => self.apply(event),
            Err(e) => warn!("Skipping relay line: {}", e),
        }
    }

    fn apply(&self, event: WireEvent) {
        match event {
            WireEvent::DeviceAdded { device } => {
                self.core.save_device(Joystick::new(device, None));
            }
            WireEvent::DeviceRemoved { device } => match self.core.device(&device) {
                Ok(joystick) => self.core.delete_device(&joystick),
                Err(_) => debug!("Relay removed unknown device '{}'", device),
            },
            WireEvent::Key { key } => self.core.save_key_event(key.into_key()),
        }
    }
}

/// Runs the backend in a relay child process and reads its events back.
///
/// Repeats are generated in this process, so the relay should run without a
/// repeater of its own.
pub struct ProcessEventManager {
    core: Arc<EventCore>,
    command: RelayCommand,
    alive_when: Option<AlivePredicate>,
    run: Mutex<Option<ActiveRun>>,
}

impl ProcessEventManager {
    pub(crate) fn from_parts(
        core: Arc<EventCore>,
        command: RelayCommand,
        alive_when: Option<AlivePredicate>,
    ) -> Self {
        Self {
            core,
            command,
            alive_when,
            run: Mutex::new(None),
        }
    }

    pub fn command(&self) -> &RelayCommand {
        &self.command
    }
}

impl EventManager for ProcessEventManager {
    fn core(&self) -> &Arc<EventCore> {
        &self.core
    }

    fn start(&self) -> Result<(), InputError> {
        if let Err(e) = self.stop() {
            debug!("Previous run did not stop cleanly: {}", e);
        }

        let name = self.core.settings().name.clone();
        info!("Starting process event manager '{}'", name);

        let token = CancellationToken::new();
        if let Some(repeater) = self.core.repeater() {
            repeater.start()?;
        }
        let mut dispatcher = dispatcher::spawn(self.core.clone()).map_err(|e| {
            self.core.reset();
            e
        })?;

        let reader = RelayReader {
            core: self.core.clone(),
            command: self.command.clone(),
            token: token.clone(),
            is_alive: Box::new(liveness(&token, self.alive_when.clone())),
        };
        let thread_name = format!("{}-relay", name);
        let handle = match thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || reader.run())
        {
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

    /// Cancels the reader, which kills the relay child.
    fn stop(&self) -> Result<(), InputError> {
        let run = lock(&self.run).take();
        let result = match run {
            Some(run) => {
                info!("Stopping process event manager '{}'", self.core.settings().name);
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

impl fmt::Debug for ProcessEventManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEventManager")
            .field("command", &self.command)
            .field("running", &self.is_running())
            .field("core", &self.core)
            .finish()
    }
}

impl Drop for ProcessEventManager {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            debug!("Process event manager dropped before the relay exited: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_command_display() {
        let command = RelayCommand::new("/usr/bin/padstream")
            .arg("relay")
            .args(["--script", "pad.toml"]);
        assert_eq!(command.to_string(), "/usr/bin/padstream relay --script pad.toml");
    }
}
