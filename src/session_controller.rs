use crate::acquisition::{AcquisitionSession, SessionEnd};
use crate::config_protocol::ConfigProtocol;
use crate::sinks::{SampleSink, SinkDirectory, SinkFactory};
use crate::transport::{AcquisitionError, Connect, LinkReader, RunFlag, Transport};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Synchronizing,
    Streaming,
    Faulted,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::Stopped => 0,
            SessionState::Synchronizing => 1,
            SessionState::Streaming => 2,
            SessionState::Faulted => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Synchronizing,
            2 => SessionState::Streaming,
            3 => SessionState::Faulted,
            _ => SessionState::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
struct SharedState(Arc<AtomicU8>);

impl SharedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Stopped.as_u8())))
    }

    fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SessionState) {
        log::debug!("Session state -> {:?}", state);
        self.0.store(state.as_u8(), Ordering::Release);
    }
}

/// Starts and stops acquisition sessions on a background thread.
///
/// Every `start()` opens a fresh link through the connector and runs the
/// full handshake. `stop()` returns only after the acquisition thread has
/// restored the line, closed it, and exited.
pub struct SessionController<C: Connect, F: SinkFactory> {
    connector: C,
    factory: Arc<F>,
    sinks: SinkDirectory<F::Sink>,
    state: SharedState,
    run: RunFlag,
    worker: Option<JoinHandle<SessionEnd>>,
}

impl<C: Connect, F: SinkFactory> SessionController<C, F> {
    pub fn new(connector: C, factory: F) -> Self {
        Self::with_sinks(connector, factory, SinkDirectory::new())
    }

    /// Use a directory the consumer already holds, so sinks from earlier
    /// controllers carry over by title
    pub fn with_sinks(connector: C, factory: F, sinks: SinkDirectory<F::Sink>) -> Self {
        let run = RunFlag::new();
        run.request_stop();
        Self {
            connector,
            factory: Arc::new(factory),
            sinks,
            state: SharedState::new(),
            run,
            worker: None,
        }
    }

    pub fn sinks(&self) -> &SinkDirectory<F::Sink> {
        &self.sinks
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    /// True between a successful `start()` and the matching `stop()`
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// The flag the current session polls; clearing it ends the session
    /// without joining the thread
    pub fn run_flag(&self) -> RunFlag {
        self.run.clone()
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Open the link and spawn the acquisition thread.
    ///
    /// Must not be called while a session is running.
    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        debug_assert!(self.worker.is_none(), "start() called twice without stop()");

        let link = self.connector.connect()?;
        let run = RunFlag::new();
        self.run = run.clone();
        self.state.set(SessionState::Synchronizing);

        let factory = Arc::clone(&self.factory);
        let sinks = self.sinks.clone();
        let state = self.state.clone();
        let spawned = thread::Builder::new()
            .name("serial-acquisition".to_string())
            .spawn(move || acquire(link, run, &*factory, &sinks, &state));

        match spawned {
            Ok(worker) => {
                log::info!("Acquisition thread started");
                self.worker = Some(worker);
                Ok(())
            }
            Err(e) => {
                self.run.request_stop();
                self.state.set(SessionState::Stopped);
                Err(e.into())
            }
        }
    }

    /// Stop the session and wait for the acquisition thread to exit.
    ///
    /// The acquisition thread owns the link, so this only clears the run
    /// flag and joins. A blocked read notices the flag once the transport's
    /// read timeout elapses (10 ms with the default
    /// [`LinkSettings`](crate::transport::LinkSettings)); the thread
    /// then restores the line settings and closes the link before it exits.
    /// A transport that never times out would keep `stop()` waiting.
    ///
    /// Returns why the session ended; a session that faulted on its own
    /// before `stop()` reports its failure here.
    pub fn stop(&mut self) -> Result<SessionEnd, AcquisitionError> {
        self.run.request_stop();
        let Some(worker) = self.worker.take() else {
            log::warn!("stop() called without a running session");
            return Ok(SessionEnd::Stopped);
        };

        let end = worker.join().map_err(|_| AcquisitionError::ThreadPanicked);
        self.state.set(SessionState::Stopped);
        log::info!("Acquisition thread joined");
        end
    }
}

impl<C: Connect, F: SinkFactory> Drop for SessionController<C, F> {
    fn drop(&mut self) {
        if self.worker.is_some() {
            let _ = self.stop();
        }
    }
}

/// Body of the acquisition thread
fn acquire<L, F>(
    link: L,
    run: RunFlag,
    factory: &F,
    sinks: &SinkDirectory<F::Sink>,
    state: &SharedState,
) -> SessionEnd
where
    L: Transport,
    F: SinkFactory,
{
    let span = tracing::info_span!("acquisition");
    let _entered = span.enter();

    let mut reader = LinkReader::new(link, run);
    let end = match ConfigProtocol::new().negotiate(&mut reader) {
        Ok(config) => {
            let targets = sinks.rebind(&config, factory);
            state.set(SessionState::Streaming);
            AcquisitionSession::new(config).run(&mut reader, |sample| {
                targets[sample.channel]
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(sample.value);
            })
        }
        Err(e) => {
            if !e.is_cancellation() {
                log::error!("Bailing from serial loop because we couldn't read a config");
            }
            SessionEnd::from(e)
        }
    };

    let mut link = reader.into_inner();
    if let Err(e) = link.restore() {
        log::warn!("Failed to restore line settings: {}", e);
    }
    drop(link);

    state.set(if end.is_failure() {
        SessionState::Faulted
    } else {
        SessionState::Stopped
    });
    end
}
