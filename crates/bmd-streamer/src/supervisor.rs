//! Process-wide coordination: hotplug, signals, worker accounting.
//!
//! The supervisor owns the libusb context and the loaded firmware
//! images.  Every hotplug arrival of a known product spawns one worker
//! thread; the event loop keeps pumping until a termination signal has
//! been seen *and* the last worker has drained.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context as _;
use bmd_device::firmware::FirmwareImage;
use bmd_device::protocol::VID_BLACKMAGIC_DESIGN;
use rusb::UsbContext as _;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::worker;

/// Set from the signal handler; folded into [`SupervisorState`] by the
/// event loop.
static TERMINATION_SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_termination_signal(_signal: libc::c_int) {
    TERMINATION_SIGNALLED.store(true, Ordering::SeqCst);
}

/// Run flag and worker accounting shared with every worker thread.
pub struct SupervisorState {
    running: AtomicBool,
    workers: AtomicUsize,
}

impl SupervisorState {
    /// Fresh state: running, no workers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            workers: AtomicUsize::new(0),
        }
    }

    /// True until shutdown has been requested.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Request shutdown.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Outstanding worker threads.
    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }
}

impl Default for SupervisorState {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the worker count when a worker thread ends, however it
/// ends.
struct WorkerGuard(Arc<SupervisorState>);

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        self.0.workers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct HotplugHandler {
    state: Arc<SupervisorState>,
    config: Arc<Config>,
}

impl rusb::Hotplug<rusb::Context> for HotplugHandler {
    fn device_arrived(&mut self, device: rusb::Device<rusb::Context>) {
        if !self.state.running() {
            return;
        }
        self.state.workers.fetch_add(1, Ordering::SeqCst);
        let guard = WorkerGuard(Arc::clone(&self.state));
        let state = Arc::clone(&self.state);
        let config = Arc::clone(&self.config);
        let spawned = thread::Builder::new()
            .name("bmd-worker".into())
            .spawn(move || {
                let _guard = guard;
                worker::run_device(state, config, device);
            });
        if let Err(e) = spawned {
            // The dropped closure takes the guard with it, so the count
            // stays balanced.
            error!("failed to spawn worker thread: {e}");
        }
    }

    fn device_left(&mut self, _device: rusb::Device<rusb::Context>) {
        // Workers notice on their own: outstanding transfers fail with
        // NoDevice and the sticky fault winds the threads down.
        debug!("device left");
    }
}

/// Install the process signal dispositions.
///
/// SIGTERM/SIGINT request an orderly shutdown; SIGPIPE is ignored so a
/// closed downstream sink surfaces as a write error; SIGCHLD is left
/// default and children are reaped non-blocking from the event loop.
fn install_signal_handlers() {
    // SAFETY: the handler only stores to an atomic, which is
    // async-signal-safe; SIG_IGN installs no handler at all.
    unsafe {
        libc::signal(
            libc::SIGTERM,
            on_termination_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            on_termination_signal as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Reap any exited stream children without blocking.
fn reap_children() {
    loop {
        // SAFETY: waitpid with WNOHANG never blocks and a null status
        // pointer is allowed.
        let pid = unsafe { libc::waitpid(-1, std::ptr::null_mut(), libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        debug!(pid, "reaped stream child");
    }
}

/// Supervisor main loop; returns when shut down and drained.
///
/// # Errors
///
/// Missing firmware files, libusb initialization failure, or an
/// unsupported libusb without hotplug; all startup failures map to
/// exit code 1.
pub fn run(mut config: Config) -> anyhow::Result<()> {
    install_signal_handlers();

    config.firmwares = FirmwareImage::load_standard_set(&config.firmware_dir)
        .context("failed to load firmware images")?;
    for fw in &config.firmwares {
        debug!("firmware image {:04x}: {} bytes", fw.device_id, fw.size());
    }

    let usb = rusb::Context::new().context("failed to initialize usb library")?;
    anyhow::ensure!(
        rusb::has_hotplug(),
        "this libusb build has no hotplug support"
    );

    let state = Arc::new(SupervisorState::new());
    let handler = HotplugHandler {
        state: Arc::clone(&state),
        config: Arc::new(config),
    };
    let _registration = rusb::HotplugBuilder::new()
        .vendor_id(VID_BLACKMAGIC_DESIGN)
        .enumerate(true)
        .register(&usb, Box::new(handler))
        .context("failed to register hotplug callback")?;

    info!("waiting for devices");
    while state.running() || state.worker_count() > 0 {
        if TERMINATION_SIGNALLED.swap(false, Ordering::SeqCst) && state.running() {
            info!("termination signal received; draining workers");
            state.stop();
        }
        if let Err(e) = usb.handle_events(Some(std::time::Duration::from_millis(100))) {
            return Err(e).context("usb event loop failed");
        }
        reap_children();
    }
    info!("all workers drained");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_running_with_no_workers() {
        let state = SupervisorState::new();
        assert!(state.running());
        assert_eq!(state.worker_count(), 0);
    }

    #[test]
    fn stop_is_sticky() {
        let state = SupervisorState::new();
        state.stop();
        assert!(!state.running());
        state.stop();
        assert!(!state.running());
    }

    #[test]
    fn worker_guard_decrements_on_drop() {
        let state = Arc::new(SupervisorState::new());
        state.workers.fetch_add(1, Ordering::SeqCst);
        {
            let _guard = WorkerGuard(Arc::clone(&state));
            assert_eq!(state.worker_count(), 1);
        }
        assert_eq!(state.worker_count(), 0);
    }
}
