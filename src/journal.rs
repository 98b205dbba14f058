//! On-disk write-behind journal.
//!
//! One record per line: `sequence \t kind \t first_attempt \t attempts \t
//! hex(body) \t crc32`, the checksum covering everything before it. Records
//! are appended on enqueue and only removed after the remote store
//! acknowledges them. A torn final line (crash mid-append) is truncated on
//! load; a bad checksum anywhere earlier means real corruption and is fatal.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

// Rewrite the file once this many acked bytes accumulate at the head.
const COMPACT_SLACK_BYTES: u64 = 64 * 1024;

/// What a queued event describes; ordering is only guaranteed within a kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MeterChanged,
    AftResult,
    AgentOnline,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::MeterChanged => "meter_changed",
            EventKind::AftResult => "aft_result",
            EventKind::AgentOnline => "agent_online",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "meter_changed" => Some(EventKind::MeterChanged),
            "aft_result" => Some(EventKind::AftResult),
            "agent_online" => Some(EventKind::AgentOnline),
            _ => None,
        }
    }
}

/// An event awaiting acknowledgement by the remote store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedEvent {
    pub sequence: u64,
    pub kind: EventKind,
    pub body: Vec<u8>,
    /// Unix epoch milliseconds of the first delivery attempt.
    pub first_attempt: u64,
    pub attempts: u32,
}

pub struct Journal {
    path: PathBuf,
    max_bytes: u64,
    records: VecDeque<QueuedEvent>,
    file_bytes: u64,
    // Bytes on disk belonging to records already acked but not yet compacted.
    drained_bytes: u64,
    next_sequence: u64,
}

impl Journal {
    /// Loads (or creates) the journal at `path`.
    pub fn open(path: &Path, max_bytes: u64) -> Result<Self> {
        let mut journal = Self {
            path: path.to_owned(),
            max_bytes,
            records: VecDeque::new(),
            file_bytes: 0,
            drained_bytes: 0,
            next_sequence: 1,
        };

        if path.exists() {
            journal.load()?;
        } else if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        Ok(journal)
    }

    fn load(&mut self) -> Result<()> {
        let raw = fs::read_to_string(&self.path)?;
        let lines: Vec<&str> = raw.lines().collect();

        let mut good_bytes = 0u64;

        for (idx, line) in lines.iter().enumerate() {
            match parse_line(line) {
                Ok(event) => {
                    self.next_sequence = self.next_sequence.max(event.sequence + 1);
                    good_bytes += line.len() as u64 + 1;
                    self.records.push_back(event);
                }
                Err(err) if idx == lines.len() - 1 => {
                    // Torn tail from a crash mid-append: drop it.
                    log::warn!("truncating torn journal tail: {err}");
                    fs::write(&self.path, &raw.as_bytes()[..good_bytes as usize])?;
                    break;
                }
                Err(err) => {
                    return Err(Error::JournalCorrupt(format!(
                        "{} line {}: {err}",
                        self.path.display(),
                        idx + 1
                    )));
                }
            }
        }

        self.file_bytes = good_bytes;

        if !self.records.is_empty() {
            log::info!(
                "journal resumes with {} unacknowledged record(s)",
                self.records.len()
            );
        }

        Ok(())
    }

    /// Appends a record, enforcing the size cap.
    pub fn append(&mut self, event: QueuedEvent) -> Result<()> {
        let line = format_line(&event);
        let line_bytes = line.len() as u64;

        if self.file_bytes + line_bytes > self.max_bytes {
            return Err(Error::JournalFull(self.file_bytes));
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;

        self.file_bytes += line_bytes;
        self.next_sequence = self.next_sequence.max(event.sequence + 1);
        self.records.push_back(event);

        Ok(())
    }

    /// Oldest unacknowledged record.
    pub fn head(&self) -> Option<&QueuedEvent> {
        self.records.front()
    }

    /// Records a delivery attempt against the head.
    pub fn note_attempt(&mut self) {
        if let Some(head) = self.records.front_mut() {
            head.attempts += 1;
        }
    }

    /// Drops the head after the remote store acknowledged it.
    pub fn ack_head(&mut self) -> Result<()> {
        if let Some(head) = self.records.pop_front() {
            self.drained_bytes += format_line(&head).len() as u64;
        }

        if self.records.is_empty() || self.drained_bytes >= COMPACT_SLACK_BYTES {
            self.compact()?;
        }

        Ok(())
    }

    // Rewrites the file from the live records, atomically.
    fn compact(&mut self) -> Result<()> {
        let tmp = self.path.with_extension("tmp");

        let mut out = String::new();
        for record in &self.records {
            out.push_str(&format_line(record));
        }

        fs::write(&tmp, out.as_bytes())?;
        fs::rename(&tmp, &self.path)?;

        self.file_bytes = out_len(&self.records);
        self.drained_bytes = 0;

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Current on-disk footprint against the cap.
    pub fn usage(&self) -> (u64, u64) {
        (self.file_bytes, self.max_bytes)
    }

    /// The sequence the next enqueued event should carry; survives restart.
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }
}

fn out_len(records: &VecDeque<QueuedEvent>) -> u64 {
    records.iter().map(|r| format_line(r).len() as u64).sum()
}

fn format_line(event: &QueuedEvent) -> String {
    let prefix = format!(
        "{}\t{}\t{}\t{}\t{}",
        event.sequence,
        event.kind.as_str(),
        event.first_attempt,
        event.attempts,
        hex::encode(&event.body)
    );
    let checksum = CRC32.checksum(prefix.as_bytes());
    format!("{prefix}\t{checksum:08x}\n")
}

fn parse_line(line: &str) -> Result<QueuedEvent> {
    let (prefix, checksum_text) = line
        .rsplit_once('\t')
        .ok_or_else(|| Error::JournalCorrupt("missing checksum field".into()))?;

    let stored = u32::from_str_radix(checksum_text, 16)
        .map_err(|_| Error::JournalCorrupt("unparseable checksum".into()))?;
    let computed = CRC32.checksum(prefix.as_bytes());
    if stored != computed {
        return Err(Error::JournalCorrupt(format!(
            "checksum mismatch: stored {stored:08x}, computed {computed:08x}"
        )));
    }

    let mut fields = prefix.split('\t');
    let sequence = next_field(&mut fields, "sequence")?
        .parse::<u64>()
        .map_err(|_| Error::JournalCorrupt("bad sequence".into()))?;
    let kind_text = next_field(&mut fields, "kind")?;
    let kind = EventKind::parse(kind_text)
        .ok_or_else(|| Error::JournalCorrupt(format!("unknown kind {kind_text:?}")))?;
    let first_attempt = next_field(&mut fields, "first_attempt")?
        .parse::<u64>()
        .map_err(|_| Error::JournalCorrupt("bad first_attempt".into()))?;
    let attempts = next_field(&mut fields, "attempts")?
        .parse::<u32>()
        .map_err(|_| Error::JournalCorrupt("bad attempts".into()))?;
    let body = hex::decode(next_field(&mut fields, "body")?)
        .map_err(|_| Error::JournalCorrupt("bad body hex".into()))?;

    Ok(QueuedEvent {
        sequence,
        kind,
        body,
        first_attempt,
        attempts,
    })
}

fn next_field<'a>(fields: &mut std::str::Split<'a, char>, name: &str) -> Result<&'a str> {
    fields
        .next()
        .ok_or_else(|| Error::JournalCorrupt(format!("missing {name} field")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(sequence: u64, kind: EventKind, body: &[u8]) -> QueuedEvent {
        QueuedEvent {
            sequence,
            kind,
            body: body.to_vec(),
            first_attempt: 1_700_000_000_000,
            attempts: 0,
        }
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        {
            let mut journal = Journal::open(&path, 1024 * 1024).unwrap();
            journal.append(event(1, EventKind::MeterChanged, b"one")).unwrap();
            journal.append(event(2, EventKind::AftResult, b"two")).unwrap();
        }

        let journal = Journal::open(&path, 1024 * 1024).unwrap();
        assert_eq!(journal.len(), 2);
        assert_eq!(journal.head().unwrap().sequence, 1);
        assert_eq!(journal.next_sequence(), 3);
    }

    #[test]
    fn ack_head_removes_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        let mut journal = Journal::open(&path, 1024 * 1024).unwrap();
        for i in 1..=3 {
            journal.append(event(i, EventKind::MeterChanged, b"x")).unwrap();
        }

        journal.ack_head().unwrap();
        assert_eq!(journal.head().unwrap().sequence, 2);

        journal.ack_head().unwrap();
        journal.ack_head().unwrap();
        assert!(journal.is_empty());

        // Draining to empty compacts the file away.
        assert_eq!(fs::read_to_string(&path).unwrap(), "");
    }

    #[test]
    fn torn_tail_is_truncated_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        {
            let mut journal = Journal::open(&path, 1024 * 1024).unwrap();
            journal.append(event(1, EventKind::MeterChanged, b"ok")).unwrap();
        }

        // Simulate a crash mid-append.
        let mut raw = fs::read_to_string(&path).unwrap();
        raw.push_str("5\tmeter_changed\t17");
        fs::write(&path, raw).unwrap();

        let journal = Journal::open(&path, 1024 * 1024).unwrap();
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn interior_corruption_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        {
            let mut journal = Journal::open(&path, 1024 * 1024).unwrap();
            journal.append(event(1, EventKind::MeterChanged, b"aa")).unwrap();
            journal.append(event(2, EventKind::MeterChanged, b"bb")).unwrap();
        }

        // Flip one body nibble of the first record; its checksum no longer
        // matches and the record is not the tail.
        let raw = fs::read_to_string(&path).unwrap();
        let corrupted = raw.replacen(&hex::encode(b"aa"), &hex::encode(b"ab"), 1);
        fs::write(&path, corrupted).unwrap();

        let err = Journal::open(&path, 1024 * 1024).err().expect("load must fail");
        assert!(matches!(err, Error::JournalCorrupt(_)));
    }

    #[test]
    fn size_cap_rejects_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.journal");

        let mut journal = Journal::open(&path, 64).unwrap();
        journal.append(event(1, EventKind::MeterChanged, b"x")).unwrap();

        match journal.append(event(2, EventKind::MeterChanged, &[0u8; 64])) {
            Err(Error::JournalFull(_)) => {}
            other => panic!("expected JournalFull, got {other:?}"),
        }
    }
}
