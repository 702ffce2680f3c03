//! External engine API.
//!
//! [`Engine::run_suite`] moves the session onto a dedicated worker thread and
//! returns a [`SuiteRunHandle`] immediately. Progress flows back over an
//! unbounded channel, so the worker never waits on an observer. The session
//! is released on the worker before the completion event is sent.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, instrument, warn, Span};

use crate::capability::CapabilityProbe;
use crate::config::EngineConfig;
use crate::error::{EngineError, SessionError};
use crate::orchestrator::{CancelToken, Orchestrator, ProgressEvent, RetryPolicy};
use crate::result::SuiteRun;
use crate::session::{Session, SessionManager};
use crate::testcase::{self, TestCase};
use crate::traits::{CapturePort, DeviceDescriptor, DeviceId};

/// Event delivered to observers of a suite run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// A test case changed status or published partial metrics.
    Progress(ProgressEvent),
    /// The run finished; always the last event.
    Completed(SuiteRun),
}

type ActiveRuns = Arc<Mutex<HashSet<DeviceId>>>;

/// Removes a device from the active set when the worker exits, even by panic.
struct ActiveGuard {
    active: ActiveRuns,
    device: DeviceId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.lock().remove(&self.device);
    }
}

/// Entry point for connecting to cameras and running suites.
pub struct Engine {
    sessions: SessionManager,
    probe: Arc<dyn CapabilityProbe>,
    capture_timeout: Duration,
    retry: RetryPolicy,
    active: ActiveRuns,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("capture_timeout", &self.capture_timeout)
            .field("retry", &self.retry)
            .field("active", &self.active.lock().len())
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Engine over `port`, using `probe` to decide which cases can run.
    pub fn new(
        port: Arc<dyn CapturePort>,
        probe: Arc<dyn CapabilityProbe>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            sessions: SessionManager::new(port),
            probe,
            capture_timeout: config.capture.timeout,
            retry: config.retry,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Devices visible to the capture port.
    pub fn devices(&self) -> Result<Vec<DeviceDescriptor>, EngineError> {
        Ok(self.sessions.devices()?)
    }

    /// Whether a suite run is executing on `device`.
    pub fn is_running(&self, device: &DeviceId) -> bool {
        self.active.lock().contains(device)
    }

    /// Acquire an exclusive session on `device`.
    #[instrument(skip(self), fields(device = %device))]
    pub fn connect(&self, device: &DeviceId) -> Result<Session, EngineError> {
        if self.is_running(device) {
            return Err(EngineError::RunInProgress(device.clone()));
        }
        let descriptor = self.sessions.find(device)?;
        Ok(self.sessions.acquire(&descriptor)?)
    }

    /// Start `cases` against `session` on a worker thread.
    ///
    /// The session is owned by the worker for the whole run and released
    /// when the run ends. A second run on the same device while one is in
    /// flight is rejected.
    #[instrument(skip_all, fields(device = %session.descriptor().id, cases = cases.len()))]
    pub fn run_suite(
        &self,
        session: Session,
        cases: Vec<TestCase>,
    ) -> Result<SuiteRunHandle, EngineError> {
        let mut session = session;
        let device = session.descriptor().id.clone();
        if !session.is_open() {
            return Err(SessionError::SessionClosed.into());
        }
        if let Some(id) = testcase::duplicate_id(&cases) {
            return Err(EngineError::DuplicateTestId(id.to_owned()));
        }
        if !self.active.lock().insert(device.clone()) {
            return Err(EngineError::RunInProgress(device));
        }
        let guard = ActiveGuard {
            active: Arc::clone(&self.active),
            device: device.clone(),
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancelToken::new();
        let capabilities = self.probe.probe(session.descriptor());
        info!(?capabilities, "starting suite run");

        let progress_tx: UnboundedSender<RunEvent> = tx.clone();
        let orchestrator = Orchestrator::new(capabilities)
            .with_capture_timeout(self.capture_timeout)
            .with_retry(self.retry)
            .with_cancel_token(cancel.clone())
            .on_progress(Box::new(move |event| {
                // A dropped receiver only means nobody is listening.
                let _ = progress_tx.send(RunEvent::Progress(event));
            }));

        let span = Span::current();
        let worker = std::thread::Builder::new()
            .name(format!("suite-{device}"))
            .spawn(move || {
                let _entered = span.enter();
                let run = orchestrator.run(&mut session, &cases);
                session.release();
                drop(guard);
                if tx.send(RunEvent::Completed(run.clone())).is_err() {
                    warn!("suite run completed with no observer attached");
                }
                run
            })
            .map_err(EngineError::WorkerSpawn)?;

        Ok(SuiteRunHandle {
            device,
            cancel,
            events: Some(rx),
            worker,
        })
    }

    /// Request cancellation of a running suite.
    pub fn cancel(&self, handle: &SuiteRunHandle) {
        handle.cancel();
    }
}

/// Handle on one in-flight suite run.
#[derive(Debug)]
pub struct SuiteRunHandle {
    device: DeviceId,
    cancel: CancelToken,
    events: Option<UnboundedReceiver<RunEvent>>,
    worker: JoinHandle<SuiteRun>,
}

impl SuiteRunHandle {
    /// Device under test.
    pub const fn device(&self) -> &DeviceId {
        &self.device
    }

    /// Raise the cancellation flag. The in-flight case ends as ERROR within
    /// one capture timeout; the rest are skipped.
    pub fn cancel(&self) {
        info!(device = %self.device, "suite run cancellation requested");
        self.cancel.cancel();
    }

    /// Whether the worker has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    /// Take the event stream. Only one consumer may exist.
    pub fn events(&mut self) -> Result<UnboundedReceiver<RunEvent>, EngineError> {
        self.events.take().ok_or(EngineError::AlreadySubscribed)
    }

    /// Deliver events to callbacks on a dispatcher thread.
    ///
    /// `on_progress` receives every progress event in order; `on_complete`
    /// receives the final suite run once.
    pub fn subscribe<P, C>(&mut self, mut on_progress: P, on_complete: C) -> Result<(), EngineError>
    where
        P: FnMut(ProgressEvent) + Send + 'static,
        C: FnOnce(SuiteRun) + Send + 'static,
    {
        let mut events = self.events()?;
        std::thread::Builder::new()
            .name(format!("suite-events-{}", self.device))
            .spawn(move || {
                while let Some(event) = events.blocking_recv() {
                    match event {
                        RunEvent::Progress(progress) => on_progress(progress),
                        RunEvent::Completed(run) => {
                            on_complete(run);
                            break;
                        }
                    }
                }
            })
            .map_err(EngineError::WorkerSpawn)?;
        Ok(())
    }

    /// Block until the run finishes and return it.
    pub fn wait(self) -> Result<SuiteRun, EngineError> {
        self.worker.join().map_err(|_| EngineError::WorkerPanicked)
    }
}
