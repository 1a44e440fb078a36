//! Record an append-only, timestamped trace of simulation events.
//!
//! A [Trace] is constructed once at the start of a run and handed (by clone) to every
//! component that produces events. Each [Trace::append] stores a [Record] in memory and,
//! when a sink is configured, writes a CSV row (`Timestamp,NodeID,Event,Details`) that
//! is flushed before the call returns.
//!
//! If the sink cannot be opened or a write to it fails, a single warning is emitted and
//! all further sink writes are skipped. The in-memory record is unaffected, so a run
//! with a broken sink can still be analyzed.
//!
//! # Example
//!
//! ```rust
//! use meshsim_trace::{EventKind, Trace};
//! use std::time::Duration;
//!
//! let trace = Trace::memory();
//! trace.append(Duration::from_secs(2), 1, EventKind::ReceivedPacket, "from=[::1]:5000 size=3");
//! trace.append(Duration::from_secs(1), 0, EventKind::SentPacket, "seq=1 size=3");
//!
//! let snapshot = trace.snapshot();
//! let kinds: Vec<_> = snapshot.iter().map(|record| record.kind).collect();
//! assert_eq!(kinds, vec![EventKind::SentPacket, EventKind::ReceivedPacket]);
//! ```

use meshsim_runtime::NodeId;
use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tracing::warn;

/// Header row of the CSV sink.
pub const HEADER: &str = "Timestamp,NodeID,Event,Details";

/// Prefix of the details of an [EventKind::Error] recorded for a transmission that was
/// attempted but rejected by the endpoint.
pub const FAILED_SEND: &str = "send failed";

/// Errors that can occur when interacting with a [Trace].
#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

/// Kind of a traced event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    SentPacket,
    ReceivedPacket,
    GatewayResponse,
    ReachedMaxMessages,
    Error,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SentPacket => "SentPacket",
            Self::ReceivedPacket => "ReceivedPacket",
            Self::GatewayResponse => "GatewayResponse",
            Self::ReachedMaxMessages => "ReachedMaxMessages",
            Self::Error => "Error",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SentPacket" => Ok(Self::SentPacket),
            "ReceivedPacket" => Ok(Self::ReceivedPacket),
            "GatewayResponse" => Ok(Self::GatewayResponse),
            "ReachedMaxMessages" => Ok(Self::ReachedMaxMessages),
            "Error" => Ok(Self::Error),
            other => Err(Error::UnknownEvent(other.to_string())),
        }
    }
}

/// A single traced event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub timestamp: Duration,
    pub node: NodeId,
    pub kind: EventKind,
    pub details: String,
}

impl Record {
    /// Whether the record is a transmission attempt, successful or not.
    pub fn is_transmission(&self) -> bool {
        match self.kind {
            EventKind::SentPacket | EventKind::GatewayResponse => true,
            EventKind::Error => self.details.starts_with(FAILED_SEND),
            EventKind::ReceivedPacket | EventKind::ReachedMaxMessages => false,
        }
    }

    /// Render the record as a CSV row (without a trailing newline).
    pub fn to_csv(&self) -> String {
        format!(
            "{:.6},{},{},\"{}\"",
            self.timestamp.as_secs_f64(),
            self.node,
            self.kind,
            self.details.replace('"', "\"\"")
        )
    }
}

/// Immutable, re-iterable view of a [Trace] ordered by timestamp (then insertion).
#[derive(Clone, Debug, Default)]
pub struct Snapshot(Arc<Vec<Record>>);

impl Snapshot {
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of events of `kind` recorded for `node`.
    pub fn count(&self, node: NodeId, kind: EventKind) -> usize {
        self.iter()
            .filter(|record| record.node == node && record.kind == kind)
            .count()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

struct Inner {
    records: Vec<Record>,
    sink: Option<Box<dyn Write + Send>>,
}

impl Inner {
    fn write(&mut self, row: &str) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        let line = format!("{row}\n");
        let result = sink.write_all(line.as_bytes()).and_then(|_| sink.flush());
        if let Err(err) = result {
            warn!(?err, "trace sink unavailable, continuing in memory");
            self.sink = None;
        }
    }
}

/// Append-only event trace shared by every component of a run.
#[derive(Clone)]
pub struct Trace {
    inner: Arc<Mutex<Inner>>,
}

impl Trace {
    /// Create a trace that only records in memory.
    pub fn memory() -> Self {
        Self::new(None)
    }

    /// Create a trace that also writes every record to `sink`.
    pub fn with_sink(sink: impl Write + Send + 'static) -> Self {
        let trace = Self::new(Some(Box::new(sink)));
        trace.lock().write(HEADER);
        trace
    }

    /// Create a trace that writes to the file at `path`.
    ///
    /// Fails if the file cannot be created.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = File::create(path)?;
        Ok(Self::with_sink(BufWriter::new(file)))
    }

    /// Create a trace that writes to the file at `path`, falling back to recording
    /// in memory (with a warning) if the file cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::create(path) {
            Ok(trace) => trace,
            Err(err) => {
                warn!(?err, path = %path.display(), "trace sink unavailable, continuing in memory");
                Self::memory()
            }
        }
    }

    fn new(sink: Option<Box<dyn Write + Send>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                records: Vec::new(),
                sink,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an event.
    pub fn append(
        &self,
        timestamp: Duration,
        node: NodeId,
        kind: EventKind,
        details: impl Into<String>,
    ) {
        let record = Record {
            timestamp,
            node,
            kind,
            details: details.into(),
        };
        let row = record.to_csv();
        let mut inner = self.lock();
        inner.write(&row);
        inner.records.push(record);
    }

    /// Returns every record appended so far, ordered by timestamp then insertion.
    pub fn snapshot(&self) -> Snapshot {
        let mut records = self.lock().records.clone();
        records.sort_by_key(|record| record.timestamp);
        Snapshot(Arc::new(records))
    }

    /// Flush and release the sink. Records appended afterwards are kept in memory only.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        if let Some(mut sink) = inner.sink.take() {
            sink.flush()?;
        }
        Ok(())
    }
}
