//! Authenticated command channel from the backend.
//!
//! The agent keeps a persistent outbound WebSocket to the backend and treats
//! every inbound message as untrusted until it passes three gates: an
//! HMAC-SHA256 signature over `timestamp || canonical_json(payload)`, a
//! freshness window on the timestamp, and a replay cache keyed by
//! `timestamp || sha256(payload)`. Canonical JSON sorts object keys and uses
//! compact separators.
//!
//! Verified commands are translated into poll-engine operations and pushed
//! onto the bounded command mailbox; a full mailbox answers `busy` so the
//! backend can retry. Verification failures drop the message with a logged
//! reply and never crash the channel.

use std::collections::HashMap;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::aft::AftRequest;
use crate::break_on_err;
use crate::error::{Error, Result};
use crate::poll::EngineCommand;

type HmacSha256 = Hmac<Sha256>;

const RECONNECT_BACKOFF_START: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// The wire envelope around every backend message.
#[derive(Clone, Debug, Deserialize)]
pub struct Envelope {
    pub payload: Value,
    /// Hex-encoded HMAC-SHA256.
    pub signature: String,
    /// Unix seconds, as a string.
    pub timestamp: String,
}

/// What a verified payload asks the agent to do.
#[derive(Clone, Debug, PartialEq)]
pub enum IngressAction {
    Command(EngineCommand),
    /// Liveness probe; answered locally, never reaches the poll engine.
    Ping,
}

/// Replay cache over `timestamp || sha256(payload)` nonces.
pub struct NonceCache {
    seen: HashMap<String, u64>,
    window_s: u64,
}

impl NonceCache {
    pub fn new(window_s: u64) -> Self {
        Self {
            seen: HashMap::new(),
            window_s,
        }
    }

    // True if the nonce was fresh; false on replay. Entries older than the
    // freshness window can never verify again, so they are pruned here.
    fn check_and_insert(&mut self, nonce: String, now_s: u64) -> bool {
        let horizon = now_s.saturating_sub(self.window_s);
        self.seen.retain(|_, seen_at| *seen_at >= horizon);

        match self.seen.entry(nonce) {
            std::collections::hash_map::Entry::Occupied(_) => false,
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(now_s);
                true
            }
        }
    }
}

/// Serializes a payload the way the backend signs it: object keys sorted,
/// `,`/`:` separators, no whitespace.
pub fn canonical_json(payload: &Value) -> Result<String> {
    // serde_json maps are ordered by key, so plain serialization is already
    // canonical as long as the `preserve_order` feature stays off.
    Ok(serde_json::to_string(payload)?)
}

/// Computes the hex signature for `timestamp || canonical_json(payload)`.
///
/// The backend's signing half; the agent uses it for test fixtures.
pub fn sign(api_key: &str, timestamp: &str, payload: &Value) -> Result<String> {
    let canonical = canonical_json(payload)?;
    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .map_err(|_| Error::Config("empty api_key".into()))?;
    mac.update(timestamp.as_bytes());
    mac.update(canonical.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Runs an envelope through the freshness, signature, and replay gates.
pub fn verify(
    api_key: &str,
    envelope: &Envelope,
    now_s: u64,
    window_s: u64,
    nonces: &mut NonceCache,
) -> Result<()> {
    let ts: i64 = envelope
        .timestamp
        .parse()
        .map_err(|_| Error::MalformedCommand("non-numeric timestamp".into()))?;

    let skew = (now_s as i64 - ts).abs();
    if skew > window_s as i64 {
        return Err(Error::StaleMessage(skew));
    }

    let canonical = canonical_json(&envelope.payload)?;

    let mut mac = HmacSha256::new_from_slice(api_key.as_bytes())
        .map_err(|_| Error::Config("empty api_key".into()))?;
    mac.update(envelope.timestamp.as_bytes());
    mac.update(canonical.as_bytes());

    let sig_bytes = hex::decode(&envelope.signature).map_err(|_| Error::SignatureInvalid)?;
    mac.verify_slice(&sig_bytes)
        .map_err(|_| Error::SignatureInvalid)?;

    let nonce = format!(
        "{}{}",
        envelope.timestamp,
        hex::encode(Sha256::digest(canonical.as_bytes()))
    );
    if !nonces.check_and_insert(nonce, now_s) {
        return Err(Error::ReplayedNonce);
    }

    Ok(())
}

/// Maps a verified payload onto an action.
pub fn parse_action(payload: &Value) -> Result<IngressAction> {
    let action = payload
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedCommand("missing action".into()))?;
    let data = payload.get("data").cloned().unwrap_or_else(|| json!({}));

    match action {
        "ping" => Ok(IngressAction::Ping),
        "jackpot" => {
            let amount_cents = data
                .get("amount_cents")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::MalformedCommand("jackpot needs amount_cents".into()))?;
            Ok(IngressAction::Command(EngineCommand::Jackpot {
                amount_cents,
            }))
        }
        "aft_send" => {
            let request: AftRequest = serde_json::from_value(data)
                .map_err(|err| Error::MalformedCommand(format!("aft_send: {err}")))?;
            request.validate()?;
            Ok(IngressAction::Command(EngineCommand::AftSend(request)))
        }
        "aft_cancel" => {
            let transaction_id = data
                .get("transaction_id")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::MalformedCommand("aft_cancel needs transaction_id".into()))?
                .to_owned();
            Ok(IngressAction::Command(EngineCommand::AftCancel {
                transaction_id,
            }))
        }
        other => Err(Error::MalformedCommand(format!("unknown action {other:?}"))),
    }
}

/// Handles one raw inbound message end to end, producing the reply to send.
pub fn handle_message(
    raw: &str,
    api_key: &str,
    window_s: u64,
    nonces: &mut NonceCache,
    mailbox: &SyncSender<EngineCommand>,
) -> Value {
    let envelope: Envelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("dropping unparseable backend message: {err}");
            return json!({ "status": 400, "result": { "message": "malformed envelope" } });
        }
    };

    let timestamp = envelope.timestamp.clone();

    if let Err(err) = verify(api_key, &envelope, unix_now_s(), window_s, nonces) {
        log::warn!("rejecting backend message: {err}");
        let status = match err {
            Error::StaleMessage(_) | Error::ReplayedNonce | Error::SignatureInvalid => 403,
            _ => 400,
        };
        return json!({
            "status": status,
            "result": { "message": err.to_string() },
            "timestamp": timestamp,
        });
    }

    let action = match parse_action(&envelope.payload) {
        Ok(action) => action,
        Err(err) => {
            log::warn!("rejecting backend command: {err}");
            return json!({
                "status": 400,
                "result": { "message": err.to_string() },
                "timestamp": timestamp,
            });
        }
    };

    match action {
        IngressAction::Ping => json!({
            "status": 200,
            "result": { "message": "pong" },
            "timestamp": timestamp,
        }),
        IngressAction::Command(command) => match mailbox.try_send(command) {
            Ok(()) => json!({
                "status": 200,
                "result": { "message": "accepted" },
                "timestamp": timestamp,
            }),
            Err(TrySendError::Full(_)) => {
                log::warn!("command mailbox full, answering busy");
                json!({
                    "status": 429,
                    "result": { "message": "busy" },
                    "timestamp": timestamp,
                })
            }
            Err(TrySendError::Disconnected(_)) => json!({
                "status": 503,
                "result": { "message": "agent shutting down" },
                "timestamp": timestamp,
            }),
        },
    }
}

/// Spawns the ingress thread: connect, serve, reconnect with backoff.
pub fn spawn(
    url: String,
    api_key: String,
    window_s: u64,
    mailbox: SyncSender<EngineCommand>,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("ingress".into())
        .spawn(move || run(&url, &api_key, window_s, &mailbox, &shutdown))?;

    Ok(handle)
}

fn run(
    url: &str,
    api_key: &str,
    window_s: u64,
    mailbox: &SyncSender<EngineCommand>,
    shutdown: &AtomicBool,
) {
    let mut nonces = NonceCache::new(window_s);
    let mut backoff = RECONNECT_BACKOFF_START;

    while !shutdown.load(Ordering::Relaxed) {
        match tungstenite::connect(url) {
            Ok((mut socket, _)) => {
                log::info!("connected to backend at {url}");
                backoff = RECONNECT_BACKOFF_START;

                if let Err(err) = serve(&mut socket, api_key, window_s, &mut nonces, mailbox, shutdown)
                {
                    log::warn!("backend connection lost: {err}");
                }
            }
            Err(err) => {
                log::warn!("backend connect failed, retrying in {backoff:?}: {err}");
            }
        }

        sleep_checked(backoff, shutdown);
        backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
    }

    log::debug!("ingress stopped");
}

fn serve(
    socket: &mut WebSocket<MaybeTlsStream<TcpStream>>,
    api_key: &str,
    window_s: u64,
    nonces: &mut NonceCache,
    mailbox: &SyncSender<EngineCommand>,
    shutdown: &AtomicBool,
) -> Result<()> {
    // A short read timeout keeps the shutdown flag observable while blocked
    // on the socket.
    if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
    }

    loop {
        if shutdown.load(Ordering::Relaxed) {
            let _ = socket.close(None);
            return Ok(());
        }

        let message = match socket.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => return Err(err.into()),
        };

        match message {
            Message::Text(text) => {
                let reply = handle_message(&text, api_key, window_s, nonces, mailbox);
                let reply_text = serde_json::to_string(&reply)?;
                break_on_err!(socket.send(Message::text(reply_text)), "reply send failed");
            }
            Message::Close(_) => return Ok(()),
            // Ping/pong and binary frames carry nothing for us.
            _ => {}
        }
    }

    Ok(())
}

fn sleep_checked(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(250);
    let mut slept = Duration::ZERO;

    while slept < total && !shutdown.load(Ordering::Relaxed) {
        thread::sleep(slice.min(total - slept));
        slept += slice;
    }
}

pub(crate) fn unix_now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::mpsc;

    const KEY: &str = "test-api-key";
    const WINDOW: u64 = 30;

    fn envelope(payload: Value, timestamp: u64) -> Envelope {
        let ts = timestamp.to_string();
        Envelope {
            signature: sign(KEY, &ts, &payload).unwrap(),
            payload,
            timestamp: ts,
        }
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let value: Value =
            serde_json::from_str(r#"{"b":1,"a":{"z":true,"m":[1,2]}}"#).unwrap();
        assert_eq!(
            canonical_json(&value).unwrap(),
            r#"{"a":{"m":[1,2],"z":true},"b":1}"#
        );
    }

    #[test]
    fn valid_message_accepted_once() {
        let mut nonces = NonceCache::new(WINDOW);
        let now = 1_700_000_000;
        let env = envelope(json!({"action": "ping"}), now);

        assert!(verify(KEY, &env, now, WINDOW, &mut nonces).is_ok());

        // Same message again inside the window: replay.
        let err = verify(KEY, &env, now + 1, WINDOW, &mut nonces).unwrap_err();
        assert!(matches!(err, Error::ReplayedNonce));
    }

    #[test]
    fn stale_message_rejected_even_with_valid_signature() {
        let mut nonces = NonceCache::new(WINDOW);
        let now = 1_700_000_000;
        let env = envelope(json!({"action": "ping"}), now - 120);

        let err = verify(KEY, &env, now, WINDOW, &mut nonces).unwrap_err();
        assert!(matches!(err, Error::StaleMessage(120)));
    }

    #[test]
    fn tampered_payload_rejected() {
        let mut nonces = NonceCache::new(WINDOW);
        let now = 1_700_000_000;
        let mut env = envelope(json!({"action": "jackpot", "data": {"amount_cents": 100}}), now);
        env.payload["data"]["amount_cents"] = json!(1_000_000);

        let err = verify(KEY, &env, now, WINDOW, &mut nonces).unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid));
    }

    #[test]
    fn wrong_key_rejected() {
        let mut nonces = NonceCache::new(WINDOW);
        let now = 1_700_000_000;
        let env = envelope(json!({"action": "ping"}), now);

        let err = verify("other-key", &env, now, WINDOW, &mut nonces).unwrap_err();
        assert!(matches!(err, Error::SignatureInvalid));
    }

    #[test]
    fn actions_translate_to_engine_commands() {
        let jackpot = parse_action(&json!({
            "action": "jackpot",
            "data": { "amount_cents": 12_500 }
        }))
        .unwrap();
        assert_eq!(
            jackpot,
            IngressAction::Command(EngineCommand::Jackpot {
                amount_cents: 12_500
            })
        );

        let cancel = parse_action(&json!({
            "action": "aft_cancel",
            "data": { "transaction_id": "TX9" }
        }))
        .unwrap();
        assert_eq!(
            cancel,
            IngressAction::Command(EngineCommand::AftCancel {
                transaction_id: "TX9".into()
            })
        );

        assert_eq!(
            parse_action(&json!({ "action": "ping" })).unwrap(),
            IngressAction::Ping
        );

        assert!(parse_action(&json!({ "action": "reboot" })).is_err());
        assert!(parse_action(&json!({ "data": {} })).is_err());
    }

    #[test]
    fn aft_send_parses_full_request() {
        let action = parse_action(&json!({
            "action": "aft_send",
            "data": {
                "transfer_type": "in_house_to_machine_cashable",
                "cashable_cents": 500,
                "asset_number": 10,
                "transaction_id": "TX1"
            }
        }))
        .unwrap();

        match action {
            IngressAction::Command(EngineCommand::AftSend(request)) => {
                assert_eq!(request.cashable_cents, 500);
                assert_eq!(request.transaction_id, "TX1");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn full_mailbox_answers_busy() {
        let (tx, _rx) = mpsc::sync_channel::<EngineCommand>(1);
        tx.try_send(EngineCommand::Jackpot { amount_cents: 1 }).unwrap();

        let mut nonces = NonceCache::new(WINDOW);
        let now = unix_now_s();
        let payload = json!({"action": "jackpot", "data": {"amount_cents": 2}});
        let env = envelope(payload, now);
        let raw = serde_json::to_string(&json!({
            "payload": env.payload,
            "signature": env.signature,
            "timestamp": env.timestamp,
        }))
        .unwrap();

        let reply = handle_message(&raw, KEY, WINDOW, &mut nonces, &tx);
        assert_eq!(reply["status"], 429);
    }
}
