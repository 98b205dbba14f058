//! AFT credit transfers (long poll 72).
//!
//! Wire layout and code points are pinned to the SAS 6.02 AFT tables. The
//! request body travels length-prefixed:
//!
//! ```text
//! transfer_code || transaction_index || transfer_type ||
//! cashable(5 BCD) || restricted(5 BCD) || non_restricted(5 BCD) ||
//! flags || asset_number(4 LE) || txid_len || txid ||
//! expiration(4 BCD MMDDYYYY) || pool_id(2 BE) || receipt_len || receipt
//! ```
//!
//! A transfer runs Pending -> Sent -> terminal. Non-terminal status replies
//! switch the engine to periodic interrogation polls; `MachineNotReady` is
//! retried a bounded number of times with the transaction id preserved, so
//! the EGM can deduplicate.

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::bcd;
use crate::error::{Error, Result};
use crate::frame::Frame;

/// AFT long poll command code.
pub const AFT_COMMAND: u8 = 0x72;

/// Longest transaction id the protocol carries.
pub const MAX_TRANSACTION_ID: usize = 20;

/// Protocol-level retries on a not-ready machine.
const MAX_NOT_READY_RETRIES: u32 = 5;
const NOT_READY_RETRY_SPACING: Duration = Duration::from_secs(1);

// Transfer code field values.
const CODE_FULL: u8 = 0x00;
const CODE_CANCEL: u8 = 0x80;
const CODE_INTERROGATE: u8 = 0xff;

// Flag byte bits.
const FLAG_RECEIPT_REQUEST: u8 = 0x80;
const FLAG_LOCK_AFTER_TRANSFER: u8 = 0x10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    InHouseToMachineCashable,
    InHouseToMachineRestricted,
    InHouseToMachineNonRestricted,
    MachineToInHouse,
    BonusCoinOut,
    BonusJackpot,
    CancelPending,
    InterrogateStatus,
}

impl TransferType {
    /// The transfer-type byte on the wire. Cancel and interrogate requests
    /// are distinguished by the transfer-code field instead.
    pub fn wire_type(self) -> u8 {
        match self {
            TransferType::InHouseToMachineCashable
            | TransferType::InHouseToMachineRestricted
            | TransferType::InHouseToMachineNonRestricted => 0x00,
            TransferType::BonusCoinOut => 0x10,
            TransferType::BonusJackpot => 0x11,
            TransferType::MachineToInHouse => 0x80,
            TransferType::CancelPending | TransferType::InterrogateStatus => 0x00,
        }
    }

    fn transfer_code(self) -> u8 {
        match self {
            TransferType::CancelPending => CODE_CANCEL,
            TransferType::InterrogateStatus => CODE_INTERROGATE,
            _ => CODE_FULL,
        }
    }
}

/// A credit transfer request, as accepted from the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AftRequest {
    pub transfer_type: TransferType,
    #[serde(default)]
    pub cashable_cents: u64,
    #[serde(default)]
    pub restricted_cents: u64,
    #[serde(default)]
    pub non_restricted_cents: u64,
    pub asset_number: u32,
    #[serde(default)]
    pub transaction_id: String,
    /// `MMDDYYYY` as a decimal number, or 0 for no expiration.
    #[serde(default)]
    pub expiration: u32,
    #[serde(default)]
    pub pool_id: u16,
    #[serde(default)]
    pub receipt_data: Vec<u8>,
    #[serde(default)]
    pub receipt_request: bool,
    #[serde(default)]
    pub lock_after_transfer: bool,
}

impl AftRequest {
    /// Validates the fields the wire format cannot carry.
    pub fn validate(&self) -> Result<()> {
        if self.transaction_id.len() > MAX_TRANSACTION_ID {
            return Err(Error::MalformedCommand(format!(
                "transaction_id exceeds {MAX_TRANSACTION_ID} bytes"
            )));
        }
        if !self.transaction_id.is_ascii() {
            return Err(Error::MalformedCommand("transaction_id is not ASCII".into()));
        }

        let is_transfer = !matches!(
            self.transfer_type,
            TransferType::CancelPending | TransferType::InterrogateStatus
        );
        if is_transfer
            && self.cashable_cents + self.restricted_cents + self.non_restricted_cents == 0
        {
            return Err(Error::MalformedCommand(
                "at least one amount must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// Builds the length-prefixed request body for long poll 72.
    pub fn encode_body(&self) -> Result<Vec<u8>> {
        let mut body = Vec::with_capacity(64);

        body.push(self.transfer_type.transfer_code());
        body.push(0x00); // transaction index: new transaction
        body.push(self.transfer_type.wire_type());

        body.extend_from_slice(&bcd::encode(self.cashable_cents, 5)?);
        body.extend_from_slice(&bcd::encode(self.restricted_cents, 5)?);
        body.extend_from_slice(&bcd::encode(self.non_restricted_cents, 5)?);

        let mut flags = 0u8;
        if self.receipt_request {
            flags |= FLAG_RECEIPT_REQUEST;
        }
        if self.lock_after_transfer {
            flags |= FLAG_LOCK_AFTER_TRANSFER;
        }
        body.push(flags);

        body.extend_from_slice(&self.asset_number.to_le_bytes());

        body.push(self.transaction_id.len() as u8);
        body.extend_from_slice(self.transaction_id.as_bytes());

        body.extend_from_slice(&bcd::encode(u64::from(self.expiration), 4)?);
        body.extend_from_slice(&self.pool_id.to_be_bytes());

        body.push(self.receipt_data.len() as u8);
        body.extend_from_slice(&self.receipt_data);

        Ok(body)
    }

    /// Parses a request body back into its fields (loopback fixture and
    /// diagnostics; the agent itself only encodes).
    pub fn decode_body(body: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(body);

        let transfer_code = cursor.byte()?;
        let _transaction_index = cursor.byte()?;
        let wire_type = cursor.byte()?;

        let cashable_cents = bcd::decode(cursor.take(5)?)?;
        let restricted_cents = bcd::decode(cursor.take(5)?)?;
        let non_restricted_cents = bcd::decode(cursor.take(5)?)?;

        let flags = cursor.byte()?;

        let mut asset = [0u8; 4];
        asset.copy_from_slice(cursor.take(4)?);
        let asset_number = u32::from_le_bytes(asset);

        let txid_len = cursor.byte()? as usize;
        let transaction_id = String::from_utf8(cursor.take(txid_len)?.to_vec())
            .map_err(|_| Error::UnexpectedResponse("transaction id is not UTF-8".into()))?;

        let expiration = bcd::decode(cursor.take(4)?)? as u32;

        let mut pool = [0u8; 2];
        pool.copy_from_slice(cursor.take(2)?);
        let pool_id = u16::from_be_bytes(pool);

        let receipt_len = cursor.byte()? as usize;
        let receipt_data = cursor.take(receipt_len)?.to_vec();

        let transfer_type = match transfer_code {
            CODE_CANCEL => TransferType::CancelPending,
            CODE_INTERROGATE => TransferType::InterrogateStatus,
            _ => match wire_type {
                0x10 => TransferType::BonusCoinOut,
                0x11 => TransferType::BonusJackpot,
                0x80 => TransferType::MachineToInHouse,
                _ if restricted_cents > 0 => TransferType::InHouseToMachineRestricted,
                _ if non_restricted_cents > 0 => TransferType::InHouseToMachineNonRestricted,
                _ => TransferType::InHouseToMachineCashable,
            },
        };

        Ok(Self {
            transfer_type,
            cashable_cents,
            restricted_cents,
            non_restricted_cents,
            asset_number,
            transaction_id,
            expiration,
            pool_id,
            receipt_data,
            receipt_request: flags & FLAG_RECEIPT_REQUEST != 0,
            lock_after_transfer: flags & FLAG_LOCK_AFTER_TRANSFER != 0,
        })
    }
}

/// Transfer status byte reported by the EGM.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AftStatus {
    FullTransferComplete,
    PartialTransferComplete,
    Pending,
    Cancelled,
    MachineNotReady,
    Expired,
    Rejected(u8),
}

impl AftStatus {
    pub fn from_wire(byte: u8) -> Self {
        match byte {
            0x00 => AftStatus::FullTransferComplete,
            0x01 => AftStatus::PartialTransferComplete,
            0x40 => AftStatus::Pending,
            0x80 => AftStatus::Cancelled,
            0x87 => AftStatus::MachineNotReady,
            0x94 => AftStatus::Expired,
            other => AftStatus::Rejected(other),
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, AftStatus::Pending | AftStatus::MachineNotReady)
    }
}

/// The outcome recorded on the result event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AftOutcome {
    Complete,
    PartialComplete,
    Rejected(u8),
    Expired,
    Cancelled,
}

/// A parsed status reply from the EGM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AftResponse {
    pub status: AftStatus,
    pub cashable_cents: u64,
    pub restricted_cents: u64,
    pub non_restricted_cents: u64,
    pub transaction_id: String,
}

impl AftResponse {
    /// Parses a status reply: `status || index || type || amounts || txid`.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);

        let status = AftStatus::from_wire(cursor.byte()?);
        let _transaction_index = cursor.byte()?;
        let _transfer_type = cursor.byte()?;

        let cashable_cents = bcd::decode(cursor.take(5)?)?;
        let restricted_cents = bcd::decode(cursor.take(5)?)?;
        let non_restricted_cents = bcd::decode(cursor.take(5)?)?;

        let txid_len = cursor.byte()? as usize;
        let transaction_id = String::from_utf8(cursor.take(txid_len)?.to_vec())
            .map_err(|_| Error::UnexpectedResponse("transaction id is not UTF-8".into()))?;

        Ok(Self {
            status,
            cashable_cents,
            restricted_cents,
            non_restricted_cents,
            transaction_id,
        })
    }

    /// Builds reply bytes (test fixtures standing in for the EGM).
    pub fn encode(&self, wire_status: u8, transfer_type: TransferType) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32);
        out.push(wire_status);
        out.push(0x00);
        out.push(transfer_type.wire_type());
        out.extend_from_slice(&bcd::encode(self.cashable_cents, 5)?);
        out.extend_from_slice(&bcd::encode(self.restricted_cents, 5)?);
        out.extend_from_slice(&bcd::encode(self.non_restricted_cents, 5)?);
        out.push(self.transaction_id.len() as u8);
        out.extend_from_slice(self.transaction_id.as_bytes());
        Ok(out)
    }
}

/// Terminal result delivered to the durable sink.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AftResult {
    pub request: AftRequest,
    pub outcome: AftOutcome,
    pub observed_at: u64,
}

// What the active transfer is waiting on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    /// Initial request (or not-ready resend) is due at the stored instant.
    SendDue,
    /// Awaiting the reply to a frame currently in flight.
    AwaitingReply,
    /// Periodic interrogation due at the stored instant.
    InterrogateDue,
}

struct ActiveTransfer {
    request: AftRequest,
    phase: Phase,
    due_at: Instant,
    not_ready_attempts: u32,
    cancel_requested: bool,
}

/// Drives one transfer at a time; later submissions queue behind it.
pub struct AftEngine {
    address: u8,
    interrogate_interval: Duration,
    queue: VecDeque<AftRequest>,
    active: Option<ActiveTransfer>,
    txid_counter: u64,
}

impl AftEngine {
    pub fn new(address: u8, interrogate_interval: Duration) -> Self {
        Self {
            address,
            interrogate_interval,
            queue: VecDeque::new(),
            active: None,
            txid_counter: 0,
        }
    }

    /// Queues a transfer, generating a transaction id when absent.
    pub fn submit(&mut self, mut request: AftRequest) -> Result<()> {
        if request.transaction_id.is_empty() {
            self.txid_counter += 1;
            request.transaction_id = format!("{}-{}", epoch_ms(), self.txid_counter);
            request.transaction_id.truncate(MAX_TRANSACTION_ID);
        }
        request.validate()?;

        log::info!(
            "AFT submit: txid={} type={:?} cashable={}",
            request.transaction_id,
            request.transfer_type,
            request.cashable_cents
        );

        self.queue.push_back(request);
        Ok(())
    }

    /// Requests cancellation of a pending transfer by transaction id.
    ///
    /// A queued transfer is dropped immediately with a `Cancelled` result;
    /// an in-flight one is cancelled on the wire and stays active until the
    /// EGM confirms.
    pub fn cancel(&mut self, transaction_id: &str, now: Instant) -> Option<AftResult> {
        if let Some(active) = self.active.as_mut() {
            if active.request.transaction_id == transaction_id {
                active.cancel_requested = true;
                active.phase = Phase::SendDue;
                active.due_at = now;
                return None;
            }
        }

        let position = self
            .queue
            .iter()
            .position(|r| r.transaction_id == transaction_id)?;
        let request = self.queue.remove(position)?;

        Some(AftResult {
            request,
            outcome: AftOutcome::Cancelled,
            observed_at: epoch_ms(),
        })
    }

    /// An interrogation frame, if its poll interval has elapsed.
    /// Interrogations outrank every other queued command.
    pub fn due_interrogation(&mut self, now: Instant) -> Option<Result<Frame>> {
        let active = self.active.as_mut()?;
        if active.phase != Phase::InterrogateDue || now < active.due_at {
            return None;
        }

        active.phase = Phase::AwaitingReply;
        Some(build_interrogate(self.address, &active.request))
    }

    /// The next transfer or cancel frame, if one is due.
    pub fn due_send(&mut self, now: Instant) -> Option<Result<Frame>> {
        if self.active.is_none() {
            let request = self.queue.pop_front()?;
            self.active = Some(ActiveTransfer {
                request,
                phase: Phase::SendDue,
                due_at: now,
                not_ready_attempts: 0,
                cancel_requested: false,
            });
        }

        let active = self.active.as_mut()?;
        if active.phase != Phase::SendDue || now < active.due_at {
            return None;
        }

        active.phase = Phase::AwaitingReply;

        if active.cancel_requested {
            Some(build_cancel(self.address, &active.request))
        } else {
            Some(build_transfer(self.address, &active.request))
        }
    }

    /// Feeds the decoded 72 reply for the frame most recently sent.
    ///
    /// Returns the terminal result once the transfer finishes.
    pub fn on_response(&mut self, payload: &[u8], now: Instant) -> Result<Option<AftResult>> {
        let Some(active) = self.active.as_mut() else {
            return Err(Error::UnexpectedResponse(
                "AFT reply with no transfer in flight".into(),
            ));
        };

        let response = AftResponse::decode(payload)?;

        if !response.transaction_id.is_empty()
            && response.transaction_id != active.request.transaction_id
        {
            return Err(Error::UnexpectedResponse(format!(
                "AFT reply for transaction {:?}, expected {:?}",
                response.transaction_id, active.request.transaction_id
            )));
        }

        let outcome = match response.status {
            AftStatus::Pending => {
                active.phase = Phase::InterrogateDue;
                active.due_at = now + self.interrogate_interval;
                return Ok(None);
            }
            AftStatus::MachineNotReady => {
                active.not_ready_attempts += 1;
                if active.not_ready_attempts <= MAX_NOT_READY_RETRIES {
                    log::warn!(
                        "machine not ready for txid={}, retry {}/{MAX_NOT_READY_RETRIES}",
                        active.request.transaction_id,
                        active.not_ready_attempts
                    );
                    // Same transaction id goes out again after the spacing.
                    active.phase = Phase::SendDue;
                    active.due_at = now + NOT_READY_RETRY_SPACING;
                    return Ok(None);
                }
                AftOutcome::Rejected(0x87)
            }
            AftStatus::FullTransferComplete => AftOutcome::Complete,
            AftStatus::PartialTransferComplete => AftOutcome::PartialComplete,
            AftStatus::Cancelled => AftOutcome::Cancelled,
            AftStatus::Expired => AftOutcome::Expired,
            AftStatus::Rejected(code) => AftOutcome::Rejected(code),
        };

        let finished = self.active.take().ok_or_else(|| {
            Error::UnexpectedResponse("AFT transfer vanished mid-reply".into())
        })?;

        log::info!(
            "AFT terminal: txid={} outcome={:?}",
            finished.request.transaction_id,
            outcome
        );

        Ok(Some(AftResult {
            request: finished.request,
            outcome,
            observed_at: epoch_ms(),
        }))
    }

    /// Whether a transfer is active or queued.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Tells the engine the in-flight frame never got an answer. The active
    /// transfer goes back to the send queue for `due_at`, transaction id
    /// unchanged.
    pub fn on_link_fault(&mut self, due_at: Instant) {
        if let Some(active) = self.active.as_mut() {
            if active.phase == Phase::AwaitingReply {
                active.phase = Phase::SendDue;
                active.due_at = due_at;
            }
        }
    }
}

// Bounds-checked reader over a response body.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8> {
        let slice = self.take(1)?;
        Ok(slice[0])
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::ShortRead {
                wanted: self.pos + n,
                got: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

fn build_transfer(address: u8, request: &AftRequest) -> Result<Frame> {
    Ok(Frame::with_length_prefixed_payload(
        address,
        AFT_COMMAND,
        request.encode_body()?,
    ))
}

fn build_cancel(address: u8, request: &AftRequest) -> Result<Frame> {
    let mut cancel = request.clone();
    cancel.transfer_type = TransferType::CancelPending;
    Ok(Frame::with_length_prefixed_payload(
        address,
        AFT_COMMAND,
        cancel.encode_body()?,
    ))
}

fn build_interrogate(address: u8, request: &AftRequest) -> Result<Frame> {
    let mut interrogate = request.clone();
    interrogate.transfer_type = TransferType::InterrogateStatus;
    Ok(Frame::with_length_prefixed_payload(
        address,
        AFT_COMMAND,
        interrogate.encode_body()?,
    ))
}

pub(crate) fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AftRequest {
        AftRequest {
            transfer_type: TransferType::InHouseToMachineCashable,
            cashable_cents: 500,
            restricted_cents: 0,
            non_restricted_cents: 0,
            asset_number: 0x0000_000a,
            transaction_id: "TX1".into(),
            expiration: 0,
            pool_id: 0,
            receipt_data: Vec::new(),
            receipt_request: false,
            lock_after_transfer: false,
        }
    }

    fn reply(status: u8, req: &AftRequest) -> Vec<u8> {
        AftResponse {
            status: AftStatus::from_wire(status),
            cashable_cents: req.cashable_cents,
            restricted_cents: req.restricted_cents,
            non_restricted_cents: req.non_restricted_cents,
            transaction_id: req.transaction_id.clone(),
        }
        .encode(status, req.transfer_type)
        .unwrap()
    }

    #[test]
    fn request_body_round_trips() {
        let mut req = request();
        req.restricted_cents = 0;
        req.expiration = 12_31_2025;
        req.pool_id = 7;
        req.receipt_request = true;
        req.receipt_data = vec![0x01, 0x02];

        let body = req.encode_body().unwrap();
        let parsed = AftRequest::decode_body(&body).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn amounts_cap_at_five_bcd_bytes() {
        let mut req = request();
        req.cashable_cents = 10_000_000_000;
        assert!(req.encode_body().is_err());
    }

    #[test]
    fn oversized_transaction_id_rejected() {
        let mut req = request();
        req.transaction_id = "X".repeat(MAX_TRANSACTION_ID + 1);
        assert!(req.validate().is_err());
    }

    #[test]
    fn happy_path_emits_single_result() {
        let now = Instant::now();
        let mut engine = AftEngine::new(0x01, Duration::from_millis(500));

        engine.submit(request()).unwrap();

        // Exactly one request frame goes out.
        let frame = engine.due_send(now).unwrap().unwrap();
        assert_eq!(frame.command, AFT_COMMAND);
        assert!(engine.due_send(now).is_none());

        let result = engine
            .on_response(&reply(0x00, &request()), now)
            .unwrap()
            .unwrap();
        assert_eq!(result.outcome, AftOutcome::Complete);
        assert_eq!(result.request.transaction_id, "TX1");
        assert_eq!(result.request.cashable_cents, 500);
        assert!(engine.is_idle());
    }

    #[test]
    fn pending_switches_to_interrogation() {
        let now = Instant::now();
        let interval = Duration::from_millis(500);
        let mut engine = AftEngine::new(0x01, interval);

        engine.submit(request()).unwrap();
        engine.due_send(now).unwrap().unwrap();

        assert!(engine.on_response(&reply(0x40, &request()), now).unwrap().is_none());

        // Not due until the interval elapses.
        assert!(engine.due_interrogation(now).is_none());
        let later = now + interval;
        let frame = engine.due_interrogation(later).unwrap().unwrap();

        // Interrogation body carries the interrogate transfer code.
        assert_eq!(frame.payload[0], CODE_INTERROGATE);

        let result = engine
            .on_response(&reply(0x00, &request()), later)
            .unwrap()
            .unwrap();
        assert_eq!(result.outcome, AftOutcome::Complete);
    }

    #[test]
    fn not_ready_preserves_transaction_id_and_bounds_retries() {
        let mut now = Instant::now();
        let mut engine = AftEngine::new(0x01, Duration::from_millis(500));

        engine.submit(request()).unwrap();

        let mut result = None;
        for _ in 0..=MAX_NOT_READY_RETRIES {
            let frame = engine.due_send(now).unwrap().unwrap();
            let body = AftRequest::decode_body(&frame.payload).unwrap();
            assert_eq!(body.transaction_id, "TX1");

            result = engine.on_response(&reply(0x87, &request()), now).unwrap();
            if result.is_some() {
                break;
            }
            now += NOT_READY_RETRY_SPACING;
        }

        let result = result.expect("retries must exhaust");
        assert_eq!(result.outcome, AftOutcome::Rejected(0x87));
    }

    #[test]
    fn cancel_of_queued_transfer_is_immediate() {
        let now = Instant::now();
        let mut engine = AftEngine::new(0x01, Duration::from_millis(500));

        let mut first = request();
        first.transaction_id = "TX1".into();
        let mut second = request();
        second.transaction_id = "TX2".into();

        engine.submit(first).unwrap();
        engine.submit(second).unwrap();

        // TX1 becomes active; TX2 still queued and cancellable offline.
        engine.due_send(now).unwrap().unwrap();
        let result = engine.cancel("TX2", now).unwrap();
        assert_eq!(result.outcome, AftOutcome::Cancelled);
    }

    #[test]
    fn cancel_of_active_transfer_goes_to_the_wire() {
        let now = Instant::now();
        let mut engine = AftEngine::new(0x01, Duration::from_millis(500));

        engine.submit(request()).unwrap();
        engine.due_send(now).unwrap().unwrap();
        assert!(engine.on_response(&reply(0x40, &request()), now).unwrap().is_none());

        assert!(engine.cancel("TX1", now).is_none());

        let frame = engine.due_send(now).unwrap().unwrap();
        assert_eq!(frame.payload[0], CODE_CANCEL);

        let result = engine
            .on_response(&reply(0x80, &request()), now)
            .unwrap()
            .unwrap();
        assert_eq!(result.outcome, AftOutcome::Cancelled);
    }

    #[test]
    fn generated_transaction_ids_are_unique() {
        let now = Instant::now();
        let mut engine = AftEngine::new(0x01, Duration::from_millis(500));

        let mut blank = request();
        blank.transaction_id = String::new();
        engine.submit(blank.clone()).unwrap();
        engine.submit(blank).unwrap();

        let a = engine.queue[0].transaction_id.clone();
        let b = engine.queue[1].transaction_id.clone();
        assert!(!a.is_empty() && a.len() <= MAX_TRANSACTION_ID);
        assert_ne!(a, b);
    }
}
