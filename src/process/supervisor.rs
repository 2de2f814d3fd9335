use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_derive::Deserialize;

use crate::config::deserialize_duration;
use crate::control::StopToken;
use crate::core::GenericResult;
use crate::report::Journal;
use crate::util::sys::{join_thread_ignoring_result, spawn_thread};

use super::Invocation;
use super::sys;

const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);
const OUTPUT_DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProcessSettings {
    #[serde(default = "default_poll_interval", deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    #[serde(default = "default_kill_retries")]
    pub kill_retries: u32,
    #[serde(default = "default_kill_retry_wait", deserialize_with = "deserialize_duration")]
    pub kill_retry_wait: Duration,
}

impl Default for ProcessSettings {
    fn default() -> ProcessSettings {
        ProcessSettings {
            poll_interval: default_poll_interval(),
            kill_retries: default_kill_retries(),
            kill_retry_wait: default_kill_retry_wait(),
        }
    }
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_kill_retries() -> u32 {
    5
}

fn default_kill_retry_wait() -> Duration {
    Duration::from_millis(500)
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Completion {
    Exited(i32),
    /// Cancelled and terminated.
    Stopped,
    /// Cancelled, but the process survived all termination attempts.
    Unstoppable,
}

pub struct Handle {
    name: String,
    child: Child,
    output_readers: Vec<JoinHandle<()>>,
}

impl Handle {
    pub fn pid(&self) -> Pid {
        Pid::from_raw(self.child.id() as i32)
    }
}

pub struct ProcessSupervisor {
    settings: ProcessSettings,
    journal: Arc<dyn Journal>,
}

impl ProcessSupervisor {
    pub fn new(settings: ProcessSettings, journal: Arc<dyn Journal>) -> ProcessSupervisor {
        ProcessSupervisor {settings, journal}
    }

    /// Starts the process and runs it to completion or, on stop request, terminates it.
    pub fn run(&self, invocation: &Invocation, stop: &StopToken) -> GenericResult<Completion> {
        let mut handle = self.start(invocation)?;

        match self.wait_or_cancel(&mut handle, stop)? {
            Completion::Stopped => {
                if self.kill(handle) {
                    Ok(Completion::Stopped)
                } else {
                    Ok(Completion::Unstoppable)
                }
            },
            completion => Ok(completion),
        }
    }

    pub fn start(&self, invocation: &Invocation) -> GenericResult<Handle> {
        debug!("Running `{}`...", invocation);

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .envs(invocation.env.iter().map(|(name, value)| (name, value)))
            .stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped())
            // Own process group, so the whole tree can be terminated at once
            .process_group(0)
            .spawn().map_err(|e| format!("Unable to run {:?}: {}", invocation.program, e))?;

        let name = invocation.name();
        let mut output_readers = Vec::new();

        let outputs: [(&str, Option<Box<dyn Read + Send>>); 2] = [
            ("stdout", child.stdout.take().map(|stdout| Box::new(stdout) as Box<dyn Read + Send>)),
            ("stderr", child.stderr.take().map(|stderr| Box::new(stderr) as Box<dyn Read + Send>)),
        ];

        for (stream, output) in outputs {
            let Some(output) = output else {
                continue;
            };

            let journal = self.journal.clone();
            match spawn_thread(&format!("{} {} reader", name, stream), move || forward_output(output, journal)) {
                Ok(reader) => output_readers.push(reader),
                Err(err) => error!("Unable to forward {} {}: {}.", name, stream, err),
            }
        }

        Ok(Handle {name, child, output_readers})
    }

    /// Waits for the process termination polling the stop flag. Returns `Completion::Stopped`
    /// leaving the process running if stop has been requested.
    pub fn wait_or_cancel(&self, handle: &mut Handle, stop: &StopToken) -> GenericResult<Completion> {
        loop {
            let status = handle.child.try_wait().map_err(|e| format!(
                "Failed to wait() {}: {}", handle.name, e))?;

            if let Some(status) = status {
                self.drain_output(handle, stop);

                // Termination by signal has no exit code
                let code = status.code().unwrap_or(-1);
                debug!("{} has exited with {} exit code.", handle.name, code);

                return Ok(Completion::Exited(code));
            }

            if stop.is_stopped() {
                return Ok(Completion::Stopped);
            }

            thread::sleep(self.settings.poll_interval);
        }
    }

    /// Waits for the output readers to forward the rest of the output. Descendants left running in
    /// background may hold the pipes open indefinitely, so the readers are detached on timeout or
    /// stop request.
    fn drain_output(&self, handle: &mut Handle, stop: &StopToken) {
        let deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;

        while handle.output_readers.iter().any(|reader| !reader.is_finished()) {
            if stop.is_stopped() || Instant::now() >= deadline {
                debug!("{} output is held open by its descendants. Detaching from it.", handle.name);
                handle.output_readers.clear();
                return;
            }
            thread::sleep(self.settings.poll_interval.min(OUTPUT_DRAIN_POLL_INTERVAL));
        }

        for reader in handle.output_readers.drain(..) {
            join_thread_ignoring_result(reader);
        }
    }

    /// Terminates the process and everything it has spawned. Handle based termination isn't
    /// reliable for processes which spawn workers, so survivors are looked up by name and killed
    /// again a limited number of times.
    pub fn kill(&self, mut handle: Handle) -> bool {
        let name = handle.name.clone();
        let group = handle.pid();

        debug!("Terminating {}...", name);
        send_group_signal(group, Signal::SIGTERM);

        let mut attempt = 0;

        loop {
            thread::sleep(self.settings.kill_retry_wait);

            let exited = matches!(handle.child.try_wait(), Ok(Some(_)));
            let survivors = sys::find_processes(&name, group);

            if exited && survivors.is_empty() {
                debug!("{} has been terminated.", name);
                break;
            }

            if attempt >= self.settings.kill_retries {
                error!("Unable to terminate {}: it's still running after {} attempts.", name, attempt + 1);
                return false;
            }
            attempt += 1;

            warn!("{} is still running. Killing it (attempt #{})...", name, attempt);
            send_group_signal(group, Signal::SIGKILL);
            for pid in survivors {
                if let Err(err) = signal::kill(pid, Signal::SIGKILL) {
                    if err != Errno::ESRCH {
                        warn!("Failed to kill {} ({}): {}.", name, pid, err);
                    }
                }
            }
        }

        // The readers may still be blocked by orphaned grandchildren holding the pipes, so don't
        // wait for them.
        handle.output_readers.clear();
        true
    }
}

fn send_group_signal(group: Pid, signal: Signal) {
    if let Err(err) = signal::killpg(group, signal) {
        if err != Errno::ESRCH {
            warn!("Failed to send {} to {} process group: {}.", signal, group, err);
        }
    }
}

fn forward_output(output: Box<dyn Read + Send>, journal: Arc<dyn Journal>) {
    let mut reader = BufReader::new(output);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    journal.log_line(text);
                }
            },
            Err(err) => {
                debug!("Output reading error: {}.", err);
                break;
            },
        }
    }
}
