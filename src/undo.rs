//! Bounded log of inverse commands keyed by correlation ID.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::command::{Command, CorrelationId};

/// One undoable command.
#[derive(Debug, Clone, PartialEq)]
pub struct UndoEntry {
    /// Correlation ID of the command that can be undone.
    pub correlation_id: CorrelationId,
    /// Type of that command.
    pub command_type: String,
    /// Command that reverses it.
    pub inverse: Command,
}

/// Most-recent-last log of inverse commands.
///
/// Holds at most `depth` entries; recording past the limit evicts the
/// oldest entry. A depth of zero disables recording.
#[derive(Debug, Clone)]
pub struct UndoLog {
    entries: Arc<Mutex<VecDeque<UndoEntry>>>,
    depth: usize,
}

impl UndoLog {
    /// Create a log holding at most `depth` entries.
    pub fn new(depth: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(depth.min(64)))),
            depth,
        }
    }

    /// Record the inverse of a successfully applied command.
    pub fn record(&self, correlation_id: CorrelationId, command_type: &str, inverse: Command) {
        if self.depth == 0 {
            return;
        }
        let mut entries = self.entries.lock();
        if entries.len() == self.depth {
            entries.pop_front();
        }
        entries.push_back(UndoEntry {
            correlation_id,
            command_type: command_type.to_string(),
            inverse,
        });
    }

    /// Remove and return the most recent entry.
    pub fn pop(&self) -> Option<UndoEntry> {
        self.entries.lock().pop_back()
    }

    /// Put an entry back on top, e.g. after its inverse could not be queued.
    pub(crate) fn push_back(&self, entry: UndoEntry) {
        let mut entries = self.entries.lock();
        if self.depth > 0 && entries.len() < self.depth {
            entries.push_back(entry);
        }
    }

    /// Remove every entry recorded at or after `correlation_id`.
    ///
    /// # Returns
    ///
    /// The removed entries, newest first, or `None` (log untouched) when
    /// no entry has that correlation ID.
    pub fn take_through(&self, correlation_id: &str) -> Option<Vec<UndoEntry>> {
        let mut entries = self.entries.lock();
        let pos = entries
            .iter()
            .rposition(|e| e.correlation_id == correlation_id)?;
        let mut taken: Vec<UndoEntry> = entries.drain(pos..).collect();
        taken.reverse();
        Some(taken)
    }

    /// Snapshot of the entries, oldest first.
    pub fn entries(&self) -> Vec<UndoEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing can be undone.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
