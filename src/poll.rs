//! The link state machine.
//!
//! One dedicated thread owns the serial link and runs a deterministic loop:
//! general poll, then at most one higher-level command, so exactly one frame
//! is ever in flight. Commands arrive over a bounded mailbox from the
//! ingress; meter and AFT state live inside the engine and other components
//! only see the events it emits.
//!
//! Priority between general polls: AFT status interrogations, then jackpot
//! control, then credit sends, then meter polls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::aft::{epoch_ms, AftEngine, AftRequest, AFT_COMMAND};
use crate::continue_on_err;
use crate::bcd;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::frame::{self, Decoded, Frame, ResponseShape};
use crate::meters::{MeterReading, MeterTracker};
use crate::sink::Event;
use crate::transport::Link;

/// Capacity of the ingress-to-engine command mailbox.
pub const COMMAND_MAILBOX_CAPACITY: usize = 64;

/// Send-meters long poll command.
pub const METER_POLL_COMMAND: u8 = 0x2f;
/// Jackpot notification long poll.
pub const JACKPOT_COMMAND: u8 = 0x8a;

/// Operations other components may enqueue on the engine.
#[derive(Clone, Debug, PartialEq)]
pub enum EngineCommand {
    Jackpot { amount_cents: u64 },
    AftSend(AftRequest),
    AftCancel { transaction_id: String },
}

/// Link lifecycle. `Recovering` is entered once per fault, however many
/// reopen attempts follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkState {
    Closed,
    Opening,
    Polling,
    Recovering,
    Stopped,
}

// How a decoded payload is routed.
#[derive(Clone, Copy, Debug)]
enum Handler {
    AckNack,
    Meters,
    Aft,
}

// Dispatch table entry: what shape the reply has and who consumes it.
struct CommandSpec {
    shape: ResponseShape,
    handler: Handler,
}

/// Timing knobs, separated from [`Config`] so tests can shrink them.
#[derive(Clone, Debug)]
pub struct PollTuning {
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
    pub aft_poll_interval: Duration,
    pub reopen_backoff: Vec<Duration>,
}

impl PollTuning {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(20),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            aft_poll_interval: Duration::from_millis(config.aft_poll_interval_ms),
            reopen_backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(400),
                Duration::from_millis(1_600),
                Duration::from_millis(5_000),
            ],
        }
    }
}

/// Observable counters, mostly for tests and health logging.
#[derive(Clone, Copy, Debug, Default)]
pub struct EngineStats {
    pub general_polls: u64,
    pub exceptions: u64,
    pub link_faults: u64,
    pub recoveries: u64,
    pub reopen_attempts: u64,
}

pub struct PollEngine<L: Link> {
    link: L,
    address: u8,
    wakeup_bit: u8,
    dispatch: HashMap<u8, CommandSpec>,
    meters: MeterTracker,
    aft: AftEngine,
    tuning: PollTuning,
    denomination_cents: u64,
    asset_number: u32,
    startup_polls: Vec<crate::config::StartupPoll>,
    meter_codes: Vec<(u8, usize)>,
    mailbox: Receiver<EngineCommand>,
    events: SyncSender<Event>,
    shutdown: Arc<AtomicBool>,
    state: LinkState,
    jackpots: VecDeque<u64>,
    last_meter_poll: Option<Instant>,
    stats: EngineStats,
}

impl<L: Link> PollEngine<L> {
    pub fn new(
        link: L,
        config: &Config,
        tuning: PollTuning,
        mailbox: Receiver<EngineCommand>,
        events: SyncSender<Event>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let mut dispatch = HashMap::new();
        dispatch.insert(
            METER_POLL_COMMAND,
            CommandSpec {
                shape: ResponseShape::LengthPrefixed,
                handler: Handler::Meters,
            },
        );
        dispatch.insert(
            JACKPOT_COMMAND,
            CommandSpec {
                shape: ResponseShape::AckNack,
                handler: Handler::AckNack,
            },
        );
        dispatch.insert(
            AFT_COMMAND,
            CommandSpec {
                shape: ResponseShape::LengthPrefixed,
                handler: Handler::Aft,
            },
        );
        for poll in &config.startup_polls {
            dispatch.entry(poll.command).or_insert(CommandSpec {
                shape: ResponseShape::AckNack,
                handler: Handler::AckNack,
            });
        }

        Self {
            link,
            address: config.address,
            wakeup_bit: config.wakeup_bit,
            dispatch,
            meters: MeterTracker::new(&config.listeners),
            aft: AftEngine::new(config.address, tuning.aft_poll_interval),
            denomination_cents: config.denomination_cents,
            asset_number: config.asset_number,
            startup_polls: config.startup_polls.clone(),
            meter_codes: config
                .listeners
                .iter()
                .map(|m| (m.code, m.length_bytes))
                .collect(),
            tuning,
            mailbox,
            events,
            shutdown,
            state: LinkState::Closed,
            jackpots: VecDeque::new(),
            last_meter_poll: None,
            stats: EngineStats::default(),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Runs the loop until shutdown. Consumes the thread.
    pub fn run(&mut self) {
        while !self.stopping() {
            match self.state {
                LinkState::Closed => self.state = LinkState::Opening,
                LinkState::Opening => match self.general_poll() {
                    Ok(()) => self.enter_polling(),
                    Err(err) => {
                        log::warn!("link not answering during open: {err}");
                        self.stats.link_faults += 1;
                        self.recover(LinkState::Opening);
                    }
                },
                LinkState::Polling => {
                    if let Err(err) = self.cycle() {
                        log::warn!("link fault, entering recovery: {err}");
                        self.stats.link_faults += 1;
                        self.stats.recoveries += 1;
                        self.state = LinkState::Recovering;
                    } else {
                        self.sleep_checked(self.tuning.poll_interval);
                    }
                }
                LinkState::Recovering => self.recover(LinkState::Polling),
                LinkState::Stopped => break,
            }
        }
        self.state = LinkState::Stopped;
        log::info!("poll engine stopped");
    }

    /// One polling iteration: a general poll, then at most one command.
    /// Public so tests can drive the engine synchronously.
    pub fn cycle(&mut self) -> Result<()> {
        self.general_poll()?;
        self.drain_one_command();
        self.dispatch_one_action()?;
        Ok(())
    }

    /// Issues a general poll and routes any reported exception.
    fn general_poll(&mut self) -> Result<()> {
        let poll_byte = [self.address | self.wakeup_bit];
        let decoded = self.exchange(&poll_byte, ResponseShape::ExceptionByte)?;

        self.stats.general_polls += 1;

        let exception = decoded.payload[0];
        if exception != 0x00 {
            self.stats.exceptions += 1;
            log::debug!("EGM exception {exception:#04x}");
            // The machine reported activity; pull the next meter poll forward.
            self.last_meter_poll = None;
        }

        Ok(())
    }

    // Startup transitions into Polling: one-shot polls, then steady state.
    fn enter_polling(&mut self) {
        log::info!("link up, EGM at address {:#04x} answering", self.address);
        self.state = LinkState::Polling;

        for poll in self.startup_polls.clone() {
            let command = poll.command;
            let frame = Frame::with_payload(self.address, command, poll.data);
            continue_on_err!(self.send_long_poll(&frame), "startup poll failed");
            log::debug!("startup poll {command:#04x} done");
        }
    }

    // Pulls at most one command off the mailbox into engine state.
    fn drain_one_command(&mut self) {
        match self.mailbox.try_recv() {
            Ok(EngineCommand::Jackpot { amount_cents }) => {
                self.jackpots.push_back(amount_cents);
            }
            Ok(EngineCommand::AftSend(request)) => {
                if let Err(err) = self.aft.submit(request) {
                    log::warn!("rejecting AFT request: {err}");
                }
            }
            Ok(EngineCommand::AftCancel { transaction_id }) => {
                if let Some(result) = self.aft.cancel(&transaction_id, Instant::now()) {
                    self.emit(Event::AftResult(result));
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
    }

    // Executes the single highest-priority action that is due.
    fn dispatch_one_action(&mut self) -> Result<()> {
        let now = Instant::now();

        if let Some(frame) = self.aft.due_interrogation(now) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    log::error!("failed to build AFT interrogation: {err}");
                    return Ok(());
                }
            };
            return self.send_aft(&frame);
        }

        if let Some(&amount_cents) = self.jackpots.front() {
            let sent = self.send_jackpot(amount_cents);
            match sent {
                Ok(()) => {
                    self.jackpots.pop_front();
                    return Ok(());
                }
                Err(err) if err.is_link_retryable() || matches!(err, Error::LinkFault(_)) => {
                    return Err(err)
                }
                Err(err) => {
                    // Protocol refusal: report and drop rather than wedge the queue.
                    log::error!("jackpot rejected by EGM: {err}");
                    self.jackpots.pop_front();
                    return Ok(());
                }
            }
        }

        if let Some(frame) = self.aft.due_send(now) {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    log::error!("failed to build AFT request: {err}");
                    return Ok(());
                }
            };
            return self.send_aft(&frame);
        }

        if self.meter_poll_due(now) {
            self.last_meter_poll = Some(now);
            return self.meter_poll();
        }

        Ok(())
    }

    fn meter_poll_due(&self, now: Instant) -> bool {
        match self.last_meter_poll {
            None => true,
            Some(last) => now.duration_since(last) >= self.tuning.poll_interval,
        }
    }

    /// Sends the 2F meter poll and emits change events.
    fn meter_poll(&mut self) -> Result<()> {
        let codes: Vec<u8> = self.meter_codes.iter().map(|(code, _)| *code).collect();
        let frame = Frame::with_length_prefixed_payload(self.address, METER_POLL_COMMAND, codes);

        let decoded = self.send_long_poll(&frame)?;
        let observed_at = epoch_ms();

        let readings = match self.parse_meter_records(&decoded.payload, observed_at) {
            Ok(readings) => readings,
            Err(err) => {
                log::warn!("discarding unparseable meter response: {err}");
                return Ok(());
            }
        };

        for reading in readings {
            if let Some(change) = self.meters.observe(reading) {
                if change.suspect {
                    log::warn!(
                        "meter {:#04x} went backwards: {} -> {}",
                        change.meter_code,
                        change.old_value,
                        change.new_value
                    );
                }
                self.emit(Event::MeterChanged {
                    asset_number: self.asset_number,
                    change,
                });
            }
        }

        Ok(())
    }

    // Splits a 2F payload into readings using the configured per-meter widths.
    fn parse_meter_records(&self, payload: &[u8], observed_at: u64) -> Result<Vec<MeterReading>> {
        let widths: HashMap<u8, usize> = self.meter_codes.iter().copied().collect();

        let mut readings = Vec::new();
        let mut idx = 0;

        while idx < payload.len() {
            let code = payload[idx];
            idx += 1;

            let width = *widths.get(&code).ok_or_else(|| {
                Error::UnexpectedResponse(format!("unconfigured meter {code:#04x}"))
            })?;

            let raw = payload.get(idx..idx + width).ok_or(Error::ShortRead {
                wanted: idx + width,
                got: payload.len(),
            })?;
            idx += width;

            readings.push(MeterReading {
                meter_code: code,
                raw_bcd: raw.to_vec(),
                value: bcd::decode(raw)?,
                observed_at,
            });
        }

        Ok(readings)
    }

    /// Sends a jackpot notification: amount in credits as 8-digit BCD plus a
    /// terminator, acknowledged with an ACK/NACK byte.
    fn send_jackpot(&mut self, amount_cents: u64) -> Result<()> {
        let credits = amount_cents / self.denomination_cents;

        let mut payload = bcd::encode(credits, 4)?;
        payload.push(0x00);

        let frame = Frame::with_payload(self.address, JACKPOT_COMMAND, payload);
        self.send_long_poll(&frame)?;

        log::info!("jackpot of {credits} credits acknowledged");
        Ok(())
    }

    fn send_aft(&mut self, frame: &Frame) -> Result<()> {
        let decoded = match self.send_long_poll(frame) {
            Ok(decoded) => decoded,
            Err(err) if err.is_link_retryable() || matches!(err, Error::LinkFault(_)) => {
                // The transfer re-sends after recovery; its transaction id is
                // preserved, so the EGM deduplicates.
                self.aft
                    .on_link_fault(Instant::now() + self.tuning.aft_poll_interval);
                return Err(err);
            }
            Err(err) => {
                log::warn!("AFT exchange failed: {err}");
                self.aft
                    .on_link_fault(Instant::now() + self.tuning.aft_poll_interval);
                return Ok(());
            }
        };

        match self.aft.on_response(&decoded.payload, Instant::now()) {
            Ok(Some(result)) => self.emit(Event::AftResult(result)),
            Ok(None) => {}
            Err(err) => log::warn!("discarding AFT reply: {err}"),
        }

        Ok(())
    }

    /// Sends a long poll and decodes its reply per the dispatch table.
    fn send_long_poll(&mut self, frame: &Frame) -> Result<Decoded> {
        let spec = self
            .dispatch
            .get(&frame.command)
            .ok_or(Error::UnknownCommand(frame.command))?;
        let shape = spec.shape;
        let handler = spec.handler;

        let bytes = frame.encode()?;
        let decoded = self.exchange(&bytes, shape)?;

        match handler {
            Handler::AckNack => {
                let byte = decoded.payload[0];
                if byte == self.address {
                    Ok(decoded)
                } else if byte == self.address | self.wakeup_bit {
                    Err(Error::UnexpectedResponse(format!(
                        "EGM NACK for command {:#04x}",
                        frame.command
                    )))
                } else {
                    Err(Error::UnexpectedResponse(format!(
                        "unrecognized ACK byte {byte:#04x}"
                    )))
                }
            }
            Handler::Meters | Handler::Aft => {
                if decoded.address != self.address || decoded.command != frame.command {
                    return Err(Error::UnexpectedResponse(format!(
                        "reply addressed {:#04x}/{:#04x}, expected {:#04x}/{:#04x}",
                        decoded.address, decoded.command, self.address, frame.command
                    )));
                }
                Ok(decoded)
            }
        }
    }

    // One frame on the wire with the link-level retry policy.
    fn exchange(&mut self, bytes: &[u8], shape: ResponseShape) -> Result<Decoded> {
        let mut attempt = 0;

        loop {
            self.link.send(bytes)?;

            match frame::decode(&mut self.link, shape) {
                Ok(decoded) => return Ok(decoded),
                Err(err) if err.is_link_retryable() => {
                    attempt += 1;
                    if attempt > self.tuning.max_retries {
                        return Err(Error::LinkFault(format!(
                            "{} retries exhausted: {err}",
                            self.tuning.max_retries
                        )));
                    }
                    log::debug!("retrying frame (attempt {attempt}): {err}");
                    thread::sleep(self.tuning.retry_backoff);
                }
                Err(err) => return Err(err),
            }
        }
    }

    // Reopen-with-backoff until a general poll answers. `from` distinguishes
    // initial opening from in-service recovery for the log line.
    fn recover(&mut self, from: LinkState) {
        let mut step = 0usize;

        while !self.stopping() {
            let delay = self
                .tuning
                .reopen_backoff
                .get(step)
                .or_else(|| self.tuning.reopen_backoff.last())
                .copied()
                .unwrap_or(Duration::from_millis(100));

            // One heartbeat per backoff interval, not per retry.
            log::warn!("link down, reopen attempt in {delay:?}");
            self.sleep_checked(delay);

            if self.stopping() {
                break;
            }

            self.stats.reopen_attempts += 1;

            if let Err(err) = self.link.reopen() {
                log::debug!("reopen failed: {err}");
                step += 1;
                continue;
            }

            match self.general_poll() {
                Ok(()) => {
                    if from == LinkState::Opening {
                        self.enter_polling();
                    } else {
                        log::info!("link recovered");
                        self.state = LinkState::Polling;
                    }
                    return;
                }
                Err(err) => {
                    log::debug!("EGM still silent after reopen: {err}");
                    step += 1;
                }
            }
        }
    }

    fn emit(&self, event: Event) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                // Keep polling; meters re-emit on the next change.
                log::warn!("event channel full, dropping {event:?}");
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("event channel closed");
            }
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn sleep_checked(&self, total: Duration) {
        let slice = Duration::from_millis(50);
        let started = Instant::now();

        while started.elapsed() < total && !self.stopping() {
            thread::sleep(slice.min(total - started.elapsed()));
        }
    }
}
