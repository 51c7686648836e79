/*!
Thread-safe table of named values.

The table is the only state shared between the poll loop, the acquisition
worker and the detector's callback thread. Every read and write goes
through a single mutex, so a reader never observes a partially written
value. Writers mark entries dirty; [`ValueTable::flush`] turns dirty entries
into [`Update`]s for subscribers.
*/

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::{debug, error};

use crate::error::{Result, SharedError};
use crate::value::{PvDef, Severity, Value};

/// Default queue depth for each subscriber
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 1024;

/// A value change published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub name: &'static str,
    pub value: Value,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

/// Value, severity and timestamp of a single entry, read atomically
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub value: Value,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Entry {
    def: PvDef,
    value: Value,
    severity: Severity,
    timestamp: DateTime<Utc>,
    /// Sequence number of the last write not yet published
    pending: Option<u64>,
}

impl Entry {
    fn update(&self) -> Update {
        Update {
            name: self.def.name,
            value: self.value.clone(),
            severity: self.severity,
            timestamp: self.timestamp,
        }
    }
}

#[derive(Debug)]
struct Entries {
    map: HashMap<&'static str, Entry>,
    next_seq: u64,
}

/// Interior-synchronized mapping from name to current value
pub struct ValueTable {
    entries: Mutex<Entries>,
    subscribers: Mutex<Vec<Sender<Update>>>,
    subscriber_capacity: usize,
}

impl ValueTable {
    /// Create a table holding the initial value of every declaration
    pub fn new(defs: Vec<PvDef>) -> Self {
        Self::with_subscriber_capacity(defs, DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_subscriber_capacity(defs: Vec<PvDef>, subscriber_capacity: usize) -> Self {
        let now = Utc::now();
        let map = defs
            .into_iter()
            .map(|def| {
                let value = def.initial.clone();
                let severity = def.state_severity(&value).unwrap_or_default();
                let entry = Entry {
                    def,
                    value,
                    severity,
                    timestamp: now,
                    pending: None,
                };
                (entry.def.name, entry)
            })
            .collect();

        Self {
            entries: Mutex::new(Entries { map, next_seq: 0 }),
            subscribers: Mutex::new(Vec::new()),
            subscriber_capacity: subscriber_capacity.max(1),
        }
    }

    /// Declaration of a name
    pub fn definition(&self, name: &str) -> Option<PvDef> {
        self.entries.lock().map.get(name).map(|e| e.def.clone())
    }

    /// All declared names, sorted
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.lock().map.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Last committed value; never blocks on anything but the table lock
    pub fn get(&self, name: &str) -> Option<Value> {
        self.entries.lock().map.get(name).map(|e| e.value.clone())
    }

    pub fn read(&self, name: &str) -> Option<Reading> {
        self.entries.lock().map.get(name).map(|e| Reading {
            value: e.value.clone(),
            severity: e.severity,
            timestamp: e.timestamp,
        })
    }

    pub fn severity(&self, name: &str) -> Option<Severity> {
        self.entries.lock().map.get(name).map(|e| e.severity)
    }

    /// Read several values under one lock, giving a consistent snapshot
    pub fn snapshot<const N: usize>(&self, names: [&str; N]) -> [Option<Value>; N] {
        let entries = self.entries.lock();
        names.map(|name| entries.map.get(name).map(|e| e.value.clone()))
    }

    /// Commit a value, converting it to the declared kind.
    ///
    /// An explicit severity wins over one derived from enum states; with
    /// neither the severity resets to no-alarm.
    pub fn try_set(&self, name: &str, value: Value, severity: Option<Severity>) -> Result<()> {
        let mut entries = self.entries.lock();
        let seq = entries.next_seq;
        let entry = entries
            .map
            .get_mut(name)
            .ok_or_else(|| SharedError::Undeclared(name.to_string()))?;

        let value = entry.def.conform(value)?;
        entry.severity = severity
            .or_else(|| entry.def.state_severity(&value))
            .unwrap_or_default();
        entry.value = value;
        entry.timestamp = Utc::now();
        entry.pending = Some(seq);
        entries.next_seq += 1;
        Ok(())
    }

    /// Commit a value from an internal component.
    ///
    /// Setting an undeclared name or a value of the wrong kind is a
    /// programming error: it panics in debug builds and is logged and
    /// ignored in release builds.
    pub fn set(&self, name: &str, value: impl Into<Value>) {
        self.commit(name, value.into(), None);
    }

    pub fn set_with_severity(&self, name: &str, value: impl Into<Value>, severity: Severity) {
        self.commit(name, value.into(), Some(severity));
    }

    fn commit(&self, name: &str, value: Value, severity: Option<Severity>) {
        if let Err(e) = self.try_set(name, value, severity) {
            if cfg!(debug_assertions) {
                panic!("internal write to {} failed: {}", name, e);
            }
            error!("Ignoring internal write to {}: {}", name, e);
        }
    }

    /// Register a subscriber that receives every published update.
    ///
    /// The queue is bounded; when a subscriber falls behind, newer updates
    /// are dropped for it rather than blocking writers.
    pub fn subscribe(&self) -> Receiver<Update> {
        let (tx, rx) = bounded(self.subscriber_capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    /// Publish every value written since the previous flush, in the order
    /// the writes were committed. Returns the number of updates published.
    pub fn flush(&self) -> usize {
        let mut entries = self.entries.lock();
        let mut pending: Vec<(u64, Update)> = entries
            .map
            .values_mut()
            .filter_map(|e| e.pending.take().map(|seq| (seq, e.update())))
            .collect();
        // Take the subscriber lock before releasing the entries so that
        // concurrent flushes publish in collection order
        let mut subscribers = self.subscribers.lock();
        drop(entries);
        pending.sort_unstable_by_key(|(seq, _)| *seq);

        let count = pending.len();
        for (_, update) in pending {
            subscribers.retain(|tx| match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("Subscriber queue full, dropping update for {}", update.name);
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pvdb::{declarations, names, DatabaseDefaults};
    use crate::value::ValueKind;
    use std::sync::Arc;
    use std::thread;

    fn table() -> ValueTable {
        ValueTable::new(declarations(&DatabaseDefaults::default()))
    }

    #[test]
    fn test_get_returns_initial_value() {
        let table = table();
        assert_eq!(table.get(names::NUM_IMAGES), Some(Value::Int(1)));
        assert_eq!(table.get("NoSuchName"), None);
    }

    #[test]
    fn test_set_then_get() {
        let table = table();
        table.set(names::ACQUIRE_TIME, Value::Float(0.5));
        assert_eq!(table.get(names::ACQUIRE_TIME), Some(Value::Float(0.5)));
    }

    #[test]
    fn test_enum_states_drive_severity() {
        let table = table();
        assert_eq!(table.severity(names::FILE_PATH_EXISTS), Some(Severity::Major));

        table.set(names::FILE_PATH_EXISTS, Value::Enum(1));
        assert_eq!(table.severity(names::FILE_PATH_EXISTS), Some(Severity::NoAlarm));

        table.set_with_severity(names::STATUS_MESSAGE, Value::Str("bad".into()), Severity::Major);
        assert_eq!(table.severity(names::STATUS_MESSAGE), Some(Severity::Major));
    }

    #[test]
    fn test_try_set_undeclared_is_error() {
        let table = table();
        let err = table.try_set("Bogus", Value::Int(1), None).unwrap_err();
        assert!(matches!(err, SharedError::Undeclared(_)));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "internal write to Bogus")]
    fn test_set_undeclared_panics_in_debug() {
        table().set("Bogus", Value::Int(1));
    }

    #[test]
    fn test_flush_publishes_dirty_entries_once() {
        let table = table();
        let rx = table.subscribe();

        table.set(names::FILE_NUMBER, Value::Int(7));
        assert_eq!(table.flush(), 1);
        assert_eq!(table.flush(), 0);

        let update = rx.try_recv().unwrap();
        assert_eq!(update.name, names::FILE_NUMBER);
        assert_eq!(update.value, Value::Int(7));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_flush_preserves_commit_order() {
        let table = table();
        let rx = table.subscribe();

        table.set(names::FILE_NUMBER, Value::Int(6));
        table.set(names::ACQUIRE, Value::Enum(1));
        table.set(names::AUTO_SAVE, Value::Enum(0));
        table.set(names::ACQUIRE, Value::Enum(0));
        table.flush();

        let order: Vec<_> = rx.try_iter().map(|u| (u.name, u.value)).collect();
        assert_eq!(
            order,
            vec![
                (names::FILE_NUMBER, Value::Int(6)),
                (names::AUTO_SAVE, Value::Enum(0)),
                (names::ACQUIRE, Value::Enum(0)),
            ]
        );
    }

    #[test]
    fn test_full_subscriber_drops_and_disconnected_is_pruned() {
        let table = ValueTable::with_subscriber_capacity(declarations(&DatabaseDefaults::default()), 1);
        let slow = table.subscribe();
        let gone = table.subscribe();
        drop(gone);

        table.set(names::FILE_NUMBER, Value::Int(1));
        table.set(names::NUM_IMAGES, Value::Int(2));
        table.flush();

        assert_eq!(slow.len(), 1);
        assert_eq!(table.subscribers.lock().len(), 1);
    }

    #[test]
    fn test_snapshot_reads_several_names() {
        let table = table();
        let [time, frames, missing] =
            table.snapshot([names::ACQUIRE_TIME, names::NUM_IMAGES, "Missing"]);

        assert_eq!(time, Some(Value::Float(0.1)));
        assert_eq!(frames, Some(Value::Int(1)));
        assert_eq!(missing, None);
    }

    #[test]
    fn test_concurrent_get_never_sees_partial_array() {
        let defs = vec![PvDef::new("Data", ValueKind::IntArray, Value::int_array(vec![0i64; 1024]))
            .with_count(1024)];
        let table = Arc::new(ValueTable::new(defs));

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for i in 1..200i64 {
                    table.set("Data", Value::int_array(vec![i; 1024]));
                }
            })
        };

        for _ in 0..500 {
            let value = table.get("Data").unwrap();
            let data = value.as_array().unwrap();
            assert!(data.iter().all(|v| *v == data[0]));
        }
        writer.join().unwrap();
    }
}
