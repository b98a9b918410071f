//! Run lifecycle of a scan: numbering, bring-up, the worker thread, stopping
//! and teardown.

use crate::{
    configure_all, global_reset, CancelToken, CommandSink, Conf, Connector, Frontend,
    InterruptGuard, MaskStepSequencer, Readout, RegisterModel, Result, ScanError,
    ScanRecordStore, RunSettings,
};
use crossbeam_channel::{after, bounded, never, select, tick, Receiver};
use log::{error, info, warn};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// A measurement routine run by a [`ScanController`].
pub trait Scan: Send + 'static {
    type Params: Send + 'static;

    /// The measurement body. Should return soon after `ctx.stop_requested()`.
    fn scan(&mut self, ctx: &mut ScanContext<'_>, params: Self::Params) -> anyhow::Result<()>;

    /// Post-processing of a finished run.
    fn analyze(&mut self, identity: &ScanIdentity) -> anyhow::Result<()>;
}

/// Who is running and where the output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanIdentity {
    pub identifier: String,
    pub data_path: PathBuf,
    /// Assigned by `start`.
    pub run_number: Option<u64>,
}

impl ScanIdentity {
    pub fn new(identifier: &str, data_path: impl Into<PathBuf>) -> Self {
        Self {
            identifier: identifier.trim_start_matches(['/', '\\']).to_owned(),
            data_path: data_path.into(),
            run_number: None,
        }
    }

    /// `<data_path>/<identifier>_<run_number>`, the stem of every file the
    /// run writes.
    pub fn output_prefix(&self) -> Option<PathBuf> {
        self.run_number
            .map(|n| self.data_path.join(format!("{}_{n}", self.identifier)))
    }
}

/// What a running scan can touch.
pub struct ScanContext<'a> {
    pub commands: &'a mut dyn CommandSink,
    pub register: &'a mut dyn RegisterModel,
    pub readout: &'a mut dyn Readout,
    pub cancel: &'a CancelToken,
    pub identity: &'a ScanIdentity,
}

impl ScanContext<'_> {
    pub fn stop_requested(&self) -> bool {
        self.cancel.is_set()
    }

    /// A mask-step sequencer on this device that honours the stop flag.
    pub fn sequencer(&mut self) -> MaskStepSequencer<'_> {
        MaskStepSequencer::new(&mut *self.commands, &mut *self.register, &self.identity.identifier)
            .with_cancel(self.cancel.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Push the full chip configuration before the scan.
    pub configure: bool,
    /// Snapshot the configuration at start and put it back at stop.
    pub restore_configuration: bool,
    /// Run the scan on a worker thread; only then Ctrl-C can stop it.
    pub background: bool,
    pub global_reset: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            configure: true,
            restore_configuration: false,
            background: false,
            global_reset: true,
        }
    }
}

impl From<&RunSettings> for RunOptions {
    fn from(s: &RunSettings) -> Self {
        Self {
            configure: s.configure,
            restore_configuration: s.restore_configuration,
            background: s.background,
            global_reset: s.global_reset,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveRun {
    run_number: u64,
    background: bool,
    restore_configuration: bool,
}

struct Worker {
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Starts and stops runs of one scan on one device.
///
/// At most one run is active per controller. `stop` must follow every
/// successful `start`, also when a foreground scan returned an error.
pub struct ScanController<S: Scan> {
    identity: ScanIdentity,
    store: ScanRecordStore,
    frontend: Arc<Mutex<Frontend>>,
    scan: Arc<Mutex<S>>,
    cancel: CancelToken,
    failed: Arc<AtomicBool>,
    poll_interval: Duration,
    active: Option<ActiveRun>,
    worker: Option<Worker>,
    interrupt: Option<InterruptGuard>,
}

impl<S: Scan> ScanController<S> {
    /// Connects to the device and downloads the FPGA firmware if configured.
    pub fn new(conf: &Conf, connector: &dyn Connector, scan: S) -> Result<Self> {
        let mut frontend = connector.connect()?;
        if let Err(e) = bring_up(&mut frontend, conf) {
            let _ = frontend.transport.dispose();
            return Err(e);
        }

        let identity = ScanIdentity::new(&conf.scan.identifier, &conf.scan.data_path);
        Ok(Self {
            store: ScanRecordStore::new(&identity.data_path),
            identity,
            frontend: Arc::new(Mutex::new(frontend)),
            scan: Arc::new(Mutex::new(scan)),
            cancel: CancelToken::new(),
            failed: Arc::new(AtomicBool::new(false)),
            poll_interval: conf.scan.poll_interval(),
            active: None,
            worker: None,
            interrupt: None,
        })
    }

    pub fn identity(&self) -> &ScanIdentity {
        &self.identity
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn store(&self) -> &ScanRecordStore {
        &self.store
    }

    /// Whether a background scan thread is still alive.
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    pub fn start(&mut self, options: RunOptions, params: S::Params) -> Result<()> {
        if self.active.is_some() || self.worker.is_some() {
            return Err(ScanError::AlreadyRunning);
        }
        self.failed.store(false, Ordering::SeqCst);

        let run_number = self.store.next_run_number(&self.identity.identifier)?;
        self.identity.run_number = Some(run_number);

        if let Err(e) = self.prepare(options) {
            return Err(self.abort_start(run_number, e));
        }

        self.active = Some(ActiveRun {
            run_number,
            background: options.background,
            restore_configuration: options.restore_configuration,
        });
        self.cancel.clear();

        info!(
            "Starting scan {} with ID {run_number} (output path: {})",
            self.identity.identifier,
            self.identity.data_path.display()
        );
        if options.background {
            if let Err(e) = self.spawn_worker(run_number, params) {
                self.active = None;
                self.cancel.set();
                return Err(self.abort_start(run_number, e));
            }
            info!("Press Ctrl-C to stop scan loop");
            self.interrupt = Some(InterruptGuard::install(&self.cancel));
            Ok(())
        } else {
            match run_scan(&self.frontend, &self.scan, &self.cancel, &self.identity, params) {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.failed.store(true, Ordering::SeqCst);
                    Err(ScanError::Scan(e))
                }
            }
        }
    }

    /// Waits for the run to end and tears it down. Returns whether the run
    /// completed, i.e. it was neither interrupted, timed out nor failed.
    ///
    /// With a `timeout`, the stop flag is forced once it expires. The worker
    /// is still joined afterwards, so a worker that ignores the flag keeps
    /// this call blocked.
    pub fn stop(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let run = self
            .active
            .take()
            .ok_or_else(|| ScanError::InvalidState("no scan was started".into()))?;
        if run.background != self.worker.is_some() {
            self.active = Some(run);
            return Err(ScanError::InvalidState(
                "thread is running where no thread was expected".into(),
            ));
        }

        let mut completed = true;
        if let Some(worker) = self.worker.take() {
            if !self.wait_for_worker(&worker, timeout) {
                completed = false;
            }
            self.interrupt = None;
            if self.cancel.was_interrupted() {
                completed = false;
            }
            self.cancel.set();
            if worker.handle.join().is_err() {
                error!("Scan thread terminated abnormally");
                self.failed.store(true, Ordering::SeqCst);
            }
        }
        self.cancel.set();
        if self.failed.load(Ordering::SeqCst) {
            completed = false;
        }

        let restored = if run.restore_configuration {
            info!("Restoring FE configuration");
            self.restore_configuration()
        } else {
            Ok(())
        };
        if let Err(e) = &restored {
            error!("Restoring configuration failed: {e}");
            completed = false;
        }

        info!(
            "Stopped scan {} with ID {}",
            self.identity.identifier, run.run_number
        );
        let mut frontend = self.frontend.lock();
        if let Err(e) = frontend.readout.print_status() {
            warn!("Readout status unavailable: {e}");
        }
        if let Err(e) = frontend.transport.dispose() {
            warn!("Releasing device failed: {e}");
        }
        drop(frontend);

        self.store
            .finalize(&self.identity.identifier, run.run_number, completed)?;
        restored?;
        Ok(completed)
    }

    pub fn analyze(&mut self) -> anyhow::Result<()> {
        self.scan.lock().analyze(&self.identity)
    }

    /// Releases the device and records the run as aborted after a failed
    /// start.
    fn abort_start(&self, run_number: u64, e: ScanError) -> ScanError {
        error!("Scan {} with ID {run_number} not started: {e}", self.identity.identifier);
        if let Err(de) = self.frontend.lock().transport.dispose() {
            warn!("Releasing device failed: {de}");
        }
        if let Err(fe) = self.store.finalize(&self.identity.identifier, run_number, false) {
            error!("Could not record aborted run {run_number}: {fe}");
        }
        e
    }

    fn prepare(&self, options: RunOptions) -> Result<()> {
        let mut guard = self.frontend.lock();
        let frontend = &mut *guard;
        if options.global_reset {
            global_reset(&mut *frontend.commands, &*frontend.register)?;
        }
        if options.configure {
            configure_all(&mut *frontend.commands, &*frontend.register)?;
        }

        frontend.readout.reset_receiver()?;
        let sync = frontend.readout.channel_sync_status()?;
        frontend.readout.print_status()?;
        if !sync.iter().any(|&s| s) {
            return Err(ScanError::NoSync);
        }

        // Taken last so a refused start leaves no restore point behind.
        if options.restore_configuration {
            frontend
                .register
                .create_restore_point(&self.identity.identifier)?;
        }
        Ok(())
    }

    fn spawn_worker(&mut self, run_number: u64, params: S::Params) -> Result<()> {
        let (done_tx, done_rx) = bounded::<()>(1);
        let frontend = Arc::clone(&self.frontend);
        let scan = Arc::clone(&self.scan);
        let cancel = self.cancel.clone();
        let failed = Arc::clone(&self.failed);
        let identity = self.identity.clone();

        let handle = thread::Builder::new()
            .name(format!("{} with ID {run_number}", identity.identifier))
            .spawn(move || {
                // Disconnects `done` however the scan ends.
                let _done = done_tx;
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    run_scan(&frontend, &scan, &cancel, &identity, params)
                }));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Scan {} failed: {e:#}", identity.identifier);
                        failed.store(true, Ordering::SeqCst);
                    }
                    Err(_) => {
                        error!("Scan {} panicked", identity.identifier);
                        failed.store(true, Ordering::SeqCst);
                    }
                }
            })?;
        self.worker = Some(Worker {
            handle,
            done: done_rx,
        });
        Ok(())
    }

    /// Blocks until the worker finishes or the stop flag is set. Returns
    /// `false` if the timeout forced the stop.
    fn wait_for_worker(&self, worker: &Worker, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(after).unwrap_or_else(never);
        let ticker = tick(self.poll_interval);
        while !self.cancel.is_set() {
            select! {
                recv(worker.done) -> _ => break,
                recv(deadline) -> _ => {
                    warn!(
                        "Scan timeout after {:.1} second(s)",
                        timeout.unwrap_or_default().as_secs_f64()
                    );
                    self.cancel.set();
                    return false;
                }
                recv(ticker) -> _ => {}
            }
        }
        true
    }

    fn restore_configuration(&self) -> Result<()> {
        let mut guard = self.frontend.lock();
        let frontend = &mut *guard;
        frontend.register.restore(&self.identity.identifier)?;
        configure_all(&mut *frontend.commands, &*frontend.register)
    }
}

impl<S: Scan> Drop for ScanController<S> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            warn!(
                "Scan {} dropped while running; requesting stop",
                self.identity.identifier
            );
            self.cancel.set();
        }
    }
}

fn bring_up(frontend: &mut Frontend, conf: &Conf) -> Result<()> {
    let board_id = frontend.transport.board_id().map_err(|e| {
        ScanError::Device(format!(
            "Can't communicate with USB board. Reset USB board! ({e})"
        ))
    })?;
    info!("Found USB board with ID {board_id}");

    if let Some(bit_file) = &conf.device.bit_file {
        download_firmware(frontend, bit_file, conf.device.force_download)?;
    }
    Ok(())
}

fn download_firmware(frontend: &mut Frontend, bit_file: &Path, force: bool) -> Result<()> {
    if frontend.transport.firmware_loaded()? && !force {
        info!("FPGA already configured, skipping download of bitstream");
        return Ok(());
    }
    info!("Downloading bitstream to FPGA: {}", bit_file.display());
    frontend.transport.load_firmware(bit_file).map_err(|e| {
        ScanError::Device(format!("Can't program FPGA firmware. Reset USB board! ({e})"))
    })?;
    thread::sleep(Duration::from_secs(1));
    Ok(())
}

fn run_scan<S: Scan>(
    frontend: &Mutex<Frontend>,
    scan: &Mutex<S>,
    cancel: &CancelToken,
    identity: &ScanIdentity,
    params: S::Params,
) -> anyhow::Result<()> {
    let mut guard = frontend.lock();
    let frontend = &mut *guard;
    let mut ctx = ScanContext {
        commands: &mut *frontend.commands,
        register: &mut *frontend.register,
        readout: &mut *frontend.readout,
        cancel,
        identity,
    };
    scan.lock().scan(&mut ctx, params)
}
