//! Last-seen meter state and change detection.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::MeterDescriptor;

/// One decoded meter record from a 2F response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeterReading {
    pub meter_code: u8,
    pub raw_bcd: Vec<u8>,
    pub value: u64,
    /// Unix epoch milliseconds.
    pub observed_at: u64,
}

/// Emitted whenever a watched meter moves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterChange {
    pub meter_code: u8,
    pub old_value: u64,
    pub new_value: u64,
    pub observed_at: u64,
    /// Set when a whitelisted-monotonic meter went backwards. The change is
    /// still reported, never suppressed.
    pub suspect: bool,
}

/// Tracks the last accepted value per meter code.
pub struct MeterTracker {
    last: HashMap<u8, MeterReading>,
    monotonic: HashSet<u8>,
}

impl MeterTracker {
    pub fn new(descriptors: &[MeterDescriptor]) -> Self {
        Self {
            last: HashMap::new(),
            monotonic: descriptors
                .iter()
                .filter(|d| d.monotonic)
                .map(|d| d.code)
                .collect(),
        }
    }

    /// Compares a fresh reading against the stored one.
    ///
    /// Returns `None` when the value is unchanged or first-seen; otherwise
    /// the change to persist. The stored value always advances to the new
    /// reading, suspect or not.
    pub fn observe(&mut self, reading: MeterReading) -> Option<MeterChange> {
        let code = reading.meter_code;

        let change = match self.last.get(&code) {
            None => None,
            Some(prev) if prev.value == reading.value => None,
            Some(prev) => Some(MeterChange {
                meter_code: code,
                old_value: prev.value,
                new_value: reading.value,
                observed_at: reading.observed_at,
                suspect: reading.value < prev.value && self.monotonic.contains(&code),
            }),
        };

        if change.is_some() || !self.last.contains_key(&code) {
            self.last.insert(code, reading);
        }

        change
    }

    /// Seeds the tracker with a baseline reading without emitting a change.
    pub fn seed(&mut self, reading: MeterReading) {
        self.last.insert(reading.meter_code, reading);
    }

    pub fn last_value(&self, meter_code: u8) -> Option<u64> {
        self.last.get(&meter_code).map(|r| r.value)
    }
}
