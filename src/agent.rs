//! Component wiring and lifecycle.
//!
//! Startup order follows the dependency chain: durable sink, then serial
//! transport, then the poll engine thread, then the command ingress. The
//! ingress reaches the engine only through the bounded command mailbox; the
//! engine and orchestrator reach the sink only through the bounded event
//! channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::ingress;
use crate::journal::Journal;
use crate::poll::{EngineCommand, PollEngine, PollTuning, COMMAND_MAILBOX_CAPACITY};
use crate::sink::{self, Event, RemoteStore};
use crate::transport::SerialTransport;

/// Hard stop this long after a graceful shutdown request.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Agent {
    shutdown: Arc<AtomicBool>,
    commands: SyncSender<EngineCommand>,
    poll_thread: Option<JoinHandle<()>>,
    sink_thread: Option<JoinHandle<()>>,
    ingress_thread: Option<JoinHandle<()>>,
}

impl Agent {
    /// Brings every component up, or fails fast.
    ///
    /// Journal and configuration trouble is fatal with
    /// [`Error::is_fatal`] true; a serial device that cannot be opened is
    /// an unrecoverable hardware error.
    pub fn start(config: Config, store: Box<dyn RemoteStore>) -> Result<Self> {
        config.validate()?;

        let shutdown = Arc::new(AtomicBool::new(false));

        let journal = Journal::open(&config.journal_path, config.max_journal_bytes)?;
        let (events, sink_thread) = sink::spawn(store, journal, Arc::clone(&shutdown))?;

        // Announce this agent so the backend can register unknown machines.
        events
            .send(Event::AgentOnline {
                asset_number: config.asset_number,
                host_name: host_name(),
            })
            .map_err(|_| Error::ChannelClosed("event channel"))?;

        let transport = SerialTransport::open(
            &config.com_port,
            config.baudrate,
            Duration::from_millis(config.inter_byte_timeout_ms),
            Duration::from_millis(config.response_timeout_ms),
        )?;

        let (commands, mailbox) = mpsc::sync_channel(COMMAND_MAILBOX_CAPACITY);

        let tuning = PollTuning::from_config(&config);
        let mut engine = PollEngine::new(
            transport,
            &config,
            tuning,
            mailbox,
            events.clone(),
            Arc::clone(&shutdown),
        );
        let poll_thread = thread::Builder::new()
            .name("poll".into())
            .spawn(move || engine.run())?;

        let ingress_thread = ingress::spawn(
            config.ws_server_url.clone(),
            config.api_key.clone(),
            config.freshness_window_s,
            commands.clone(),
            Arc::clone(&shutdown),
        )?;

        log::info!(
            "agent up: EGM address {:#04x} on {}, asset {}",
            config.address,
            config.com_port,
            config.asset_number
        );

        Ok(Self {
            shutdown,
            commands,
            poll_thread: Some(poll_thread),
            sink_thread: Some(sink_thread),
            ingress_thread: Some(ingress_thread),
        })
    }

    /// Handle for enqueueing engine commands from in-process callers.
    pub fn commands(&self) -> SyncSender<EngineCommand> {
        self.commands.clone()
    }

    /// Flags every component to stop.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Blocks until the poll thread exits or a shutdown is requested.
    ///
    /// The poll thread only exits via the shutdown flag; it surviving is the
    /// agent's liveness signal.
    pub fn wait(&self) {
        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                return;
            }
            if let Some(poll) = self.poll_thread.as_ref() {
                if poll.is_finished() {
                    return;
                }
            }
            thread::sleep(Duration::from_millis(200));
        }
    }

    /// Stops all components: the poll engine finishes its in-flight frame,
    /// the sink flushes buffered events to the journal, then the threads are
    /// joined under a hard deadline.
    pub fn shutdown(mut self) -> Result<()> {
        self.request_shutdown();

        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        let mut clean = true;

        for (name, handle) in [
            ("poll", self.poll_thread.take()),
            ("ingress", self.ingress_thread.take()),
            ("sink", self.sink_thread.take()),
        ] {
            if let Some(handle) = handle {
                clean &= join_by(handle, deadline, name);
            }
        }

        if clean {
            log::info!("clean shutdown");
            Ok(())
        } else {
            Err(Error::Timeout("graceful shutdown".into()))
        }
    }
}

// Joins a thread, giving up at the deadline. Threads left behind are
// abandoned; process exit closes their descriptors.
fn join_by(handle: JoinHandle<()>, deadline: Instant, name: &str) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            log::error!("{name} thread ignored shutdown, abandoning it");
            return false;
        }
        thread::sleep(Duration::from_millis(25));
    }

    match handle.join() {
        Ok(()) => true,
        Err(_) => {
            log::error!("{name} thread panicked");
            false
        }
    }
}

fn host_name() -> String {
    if let Ok(name) = std::env::var("HOSTNAME") {
        if !name.is_empty() {
            return name;
        }
    }

    std::fs::read_to_string("/etc/hostname")
        .map(|s| s.trim().to_owned())
        .unwrap_or_else(|_| "unknown".into())
}
