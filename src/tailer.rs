//! Incremental, offset-tracked reading of session logs.
//!
//! The tailer remembers how far into each file it has read. A read picks up from
//! there, consumes complete lines only (a trailing line without `\n` is left for the
//! next pass), and hands each line to the record parser. Delivery and the offset
//! commit are done by the caller so an abandoned delivery never advances the file.

use crate::error::WatchError;
use crate::event::StreamEvent;
use crate::parser;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{debug, trace};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// Result of one read pass over a file.
#[derive(Debug, Default)]
pub struct TailBatch {
    pub events: Vec<StreamEvent>,
    pub errors: Vec<WatchError>,
    /// Offset just past the last consumed line
    pub end: u64,
}

#[derive(Debug)]
pub struct Tailer {
    positions: RwLock<HashMap<PathBuf, u64>>,
    /// Serializes tail passes per file so deliveries never interleave.
    gates: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
    max_line_bytes: usize,
}

impl Tailer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            max_line_bytes: max_line_bytes.max(1),
        }
    }

    pub fn position(&self, path: &Path) -> Option<u64> {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .copied()
    }

    pub fn set_position(&self, path: &Path, offset: u64) {
        self.positions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_path_buf(), offset);
    }

    pub fn tracked_files(&self) -> usize {
        self.positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn gate(&self, path: &Path) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(path.to_path_buf()).or_default())
    }

    /// Read complete lines appended since the recorded offset.
    ///
    /// Returns `None` when the file can't be opened or inspected; such files are
    /// simply skipped until a later pass. Nothing is recorded here.
    pub fn read_new(
        &self,
        path: &Path,
        session_id: &str,
        agent_id: Option<&str>,
    ) -> Option<TailBatch> {
        let mut file = match File::open(path) {
            Ok(f) => f,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping unreadable log");
                return None;
            }
        };
        let len = match file.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "failed to stat log");
                return None;
            }
        };

        let mut start = self.position(path).unwrap_or(0);
        if start > len {
            debug!(path = %path.display(), "log truncated; resetting offset");
            start = 0;
        }

        let mut batch = TailBatch {
            end: start,
            ..TailBatch::default()
        };
        if start == len {
            return Some(batch);
        }

        if let Err(e) = file.seek(SeekFrom::Start(start)) {
            debug!(path = %path.display(), error = %e, "failed to seek log");
            return None;
        }

        let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
        scan_lines(
            &mut reader,
            self.max_line_bytes,
            path,
            session_id,
            agent_id,
            &mut batch,
        );

        trace!(
            path = %path.display(),
            from = start,
            to = batch.end,
            events = batch.events.len(),
            "read log"
        );
        Some(batch)
    }

    /// Record how far a file has been consumed.
    pub fn commit(&self, path: &Path, end: u64) {
        self.set_position(path, end);
    }

    /// Start each file so that only its last `keep` lines remain unread.
    pub fn skip_to_recent(&self, files: &[PathBuf], keep: usize) {
        for path in files {
            match position_for_last_n_lines(path, keep) {
                Ok(offset) => self.set_position(path, offset),
                Err(e) => debug!(path = %path.display(), error = %e, "failed to scan log for history skip"),
            }
        }
    }

    /// Forget offsets of files that no longer exist.
    pub fn prune_missing(&self) -> usize {
        // Gates exist for files that were read but never committed too.
        let mut tracked: HashSet<PathBuf> = self
            .positions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        tracked.extend(
            self.gates
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .keys()
                .cloned(),
        );
        let gone: Vec<PathBuf> = tracked.into_iter().filter(|p| !p.exists()).collect();
        if gone.is_empty() {
            return 0;
        }

        {
            let mut positions = self.positions.write().unwrap_or_else(PoisonError::into_inner);
            for path in &gone {
                positions.remove(path);
            }
        }
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        for path in &gone {
            gates.remove(path);
        }
        debug!(count = gone.len(), "pruned state of deleted logs");
        gone.len()
    }
}

/// Parse complete lines from `reader` into `batch`, advancing `batch.end`.
///
/// A scan error stops the pass but still moves `batch.end` past whatever was
/// consumed before it, so one bad spot can't pin the file forever.
fn scan_lines(
    reader: &mut impl BufRead,
    limit: usize,
    path: &Path,
    session_id: &str,
    agent_id: Option<&str>,
    batch: &mut TailBatch,
) {
    let mut line = Vec::new();
    loop {
        line.clear();
        let n = match reader.by_ref().take(limit as u64 + 1).read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(n) => n as u64,
            Err(source) => {
                batch.end += line.len() as u64;
                batch.errors.push(WatchError::Scan {
                    path: path.to_path_buf(),
                    source,
                });
                break;
            }
        };

        if line.last() != Some(&b'\n') {
            if line.len() <= limit {
                // Partial line; the writer hasn't finished it yet.
                break;
            }
            let skipped = match skip_line(reader) {
                Ok(skipped) => skipped,
                Err(source) => {
                    batch.errors.push(WatchError::Scan {
                        path: path.to_path_buf(),
                        source,
                    });
                    0
                }
            };
            batch.end += n + skipped;
            batch.errors.push(WatchError::LineTooLong {
                path: path.to_path_buf(),
                limit,
            });
            continue;
        }

        batch.end += n;
        let text = String::from_utf8_lossy(&line);
        match parser::parse_line(text.trim_end_matches(['\n', '\r'])) {
            Ok(events) => batch.events.extend(
                events
                    .into_iter()
                    .map(|ev| ev.attributed(session_id, agent_id)),
            ),
            Err(source) => batch.errors.push(WatchError::Parse {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

/// Consume bytes through the next newline. Returns how many were consumed.
fn skip_line(reader: &mut impl BufRead) -> io::Result<u64> {
    let mut skipped = 0u64;
    loop {
        let available = reader.fill_buf()?;
        if available.is_empty() {
            return Ok(skipped);
        }
        if let Some(idx) = available.iter().position(|b| *b == b'\n') {
            reader.consume(idx + 1);
            return Ok(skipped + idx as u64 + 1);
        }
        let len = available.len();
        reader.consume(len);
        skipped += len as u64;
    }
}

/// Number of `\n` bytes in a file.
pub fn count_lines(path: &Path) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut count = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(count);
        }
        count += buf[..n].iter().filter(|b| **b == b'\n').count() as u64;
    }
}

/// Offset at which exactly the last `n` lines of the file remain; 0 if it has no more.
pub fn position_for_last_n_lines(path: &Path, n: usize) -> io::Result<u64> {
    let mut file = File::open(path)?;
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    // Ends of the most recent n + 1 lines.
    let mut ends: VecDeque<u64> = VecDeque::with_capacity(n + 2);
    let mut pos = 0u64;
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        for (i, b) in buf[..read].iter().enumerate() {
            if *b == b'\n' {
                if ends.len() == n + 1 {
                    ends.pop_front();
                }
                ends.push_back(pos + i as u64 + 1);
            }
        }
        pos += read as u64;
    }

    if ends.len() <= n {
        return Ok(0);
    }
    Ok(ends.front().copied().unwrap_or(0))
}
