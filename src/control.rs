use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, info};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::core::{EmptyResult, GenericResult};
use crate::util::sys::spawn_thread;

/// Cooperative cancellation flag shared by the scheduler and every engine it drives.
#[derive(Clone, Default)]
pub struct StopToken {
    stopped: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> StopToken {
        Default::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleeps for the specified duration waking up early on stop. Returns false if stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(50);

        let deadline = Instant::now() + duration;

        loop {
            if self.is_stopped() {
                return false;
            }

            let now = Instant::now();
            if now >= deadline {
                return true;
            }

            thread::sleep(SLICE.min(deadline - now));
        }
    }
}

pub type RestartSender = Sender<()>;
pub type RestartReceiver = Receiver<()>;

pub fn restart_channel() -> (RestartSender, RestartReceiver) {
    mpsc::channel()
}

static TERMINATE_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELOAD_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(signum: libc::c_int) {
    if signum == libc::SIGHUP {
        RELOAD_REQUESTED.store(true, Ordering::SeqCst);
    } else {
        TERMINATE_REQUESTED.store(true, Ordering::SeqCst);
    }
}

pub fn install_signal_handlers() -> EmptyResult {
    let action = SigAction::new(SigHandler::Handler(handle_signal), SaFlags::SA_RESTART, SigSet::empty());

    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
        // Safety: the handler only touches atomics
        unsafe { signal::sigaction(signal, &action) }.map_err(|e| format!(
            "Unable to install {} handler: {}", signal, e))?;
    }

    Ok(())
}

/// Translates process signals and configuration file changes into stop and restart events.
pub struct Watcher {
    config_path: PathBuf,
    stop: StopToken,
    restart: RestartSender,
    tick: Duration,
}

impl Watcher {
    pub fn new(config_path: &str, stop: StopToken, restart: RestartSender, tick: Duration) -> Watcher {
        Watcher {config_path: PathBuf::from(config_path), stop, restart, tick}
    }

    pub fn spawn(self) -> GenericResult<thread::JoinHandle<()>> {
        spawn_thread("control watcher", move || self.run())
    }

    fn run(self) {
        let mut last_modified = self.config_modification_time();

        while self.stop.sleep(self.tick) {
            if TERMINATE_REQUESTED.swap(false, Ordering::SeqCst) {
                info!("Got a termination request. Stopping...");
                self.stop.stop();
                break;
            }

            let mut restart = RELOAD_REQUESTED.swap(false, Ordering::SeqCst);

            let modified = self.config_modification_time();
            if modified != last_modified {
                debug!("{:?} has been changed.", self.config_path);
                last_modified = modified;
                restart = true;
            }

            if restart && self.restart.send(()).is_err() {
                break;
            }
        }
    }

    fn config_modification_time(&self) -> Option<SystemTime> {
        fs::metadata(&self.config_path).and_then(|metadata| metadata.modified()).ok()
    }
}
