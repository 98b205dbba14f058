#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{self, Duration};

use parking_lot::{Mutex, MutexGuard};

use sas_agent::error::{Error, Result};
use sas_agent::journal::QueuedEvent;
use sas_agent::sink::RemoteStore;
use sas_agent::transport::Link;
use sas_agent::Config;

static INIT: AtomicBool = AtomicBool::new(false);
static LOCK: Mutex<()> = Mutex::new(());

fn is_init() -> bool {
    INIT.load(Ordering::Relaxed)
}

fn set_init(val: bool) {
    INIT.store(val, Ordering::SeqCst);
}

pub fn init() -> Result<MutexGuard<'static, ()>> {
    if !is_init() {
        set_init(true);
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
            .format_timestamp(Some(env_logger::fmt::TimestampPrecision::Millis))
            .try_init()
            .ok();
    }

    LOCK.try_lock_for(time::Duration::from_secs(5))
        .ok_or(Error::Timeout("test mutex".into()))
}

/// A configuration pointing at nothing real; serial and websocket endpoints
/// are never dialed by the tests that use it.
pub fn test_config(journal_path: &std::path::Path) -> Config {
    serde_json::from_str(&format!(
        r#"{{
            "com_port": "/dev/null",
            "address": 1,
            "ws_server_url": "ws://127.0.0.1:1/agent",
            "api_key": "test-api-key",
            "listeners": [
                {{ "code": 17, "length_bytes": 5, "monotonic": true }},
                {{ "code": 18, "length_bytes": 5 }}
            ],
            "journal_path": "{}",
            "asset_number": 10
        }}"#,
        journal_path.display()
    ))
    .expect("test config parses")
}

/// In-memory stand-in for the EGM side of the link.
///
/// Every frame the engine sends is recorded and handed to the responder
/// closure; the bytes it returns become the next read. `None` leaves the
/// read buffer empty, which the engine sees as a response timeout.
pub struct MockEgm {
    responder: Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>,
    rx: VecDeque<u8>,
    pub sent: Arc<StdMutex<Vec<Vec<u8>>>>,
    pub reopens: Arc<AtomicU32>,
}

impl MockEgm {
    pub fn new(responder: impl FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            rx: VecDeque::new(),
            sent: Arc::new(StdMutex::new(Vec::new())),
            reopens: Arc::new(AtomicU32::new(0)),
        }
    }
}

impl Read for MockEgm {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.rx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no response"));
        }

        let mut n = 0;
        while n < buf.len() {
            match self.rx.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl Link for MockEgm {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.sent.lock().unwrap().push(bytes.to_vec());
        self.rx.clear();
        if let Some(reply) = (self.responder)(bytes) {
            self.rx.extend(reply);
        }
        Ok(())
    }

    fn reopen(&mut self) -> Result<()> {
        self.reopens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

/// Remote store double whose availability the test flips at will.
#[derive(Clone, Default)]
pub struct TestStore {
    pub rows: Arc<StdMutex<Vec<QueuedEvent>>>,
    pub online: Arc<AtomicBool>,
}

impl TestStore {
    pub fn new(online: bool) -> Self {
        let store = Self::default();
        store.online.store(online, Ordering::SeqCst);
        store
    }
}

impl RemoteStore for TestStore {
    fn commit(&mut self, event: &QueuedEvent) -> Result<()> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("test store offline".into()));
        }
        self.rows.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Waits for `predicate` to turn true, panicking after `timeout`.
pub fn wait_until(timeout: Duration, what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = time::Instant::now() + timeout;
    while time::Instant::now() < deadline {
        if predicate() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}
