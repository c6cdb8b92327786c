//! Forward-only cursors over a [`Log`](super::Log).

use crate::error::{CoreError, CoreResult};
use crate::log::{LogInner, LogRecord, PositionStrategy};
use std::fmt;
use std::sync::Arc;

enum Position<K> {
    /// Not yet placed on a record; resolved against the log on each read.
    Seek {
        key: Option<K>,
        strategy: PositionStrategy,
    },
    /// Next record to return is entry `index` of segment `segment`.
    At { segment: u64, index: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Closed,
    Failed,
}

/// Reads the records of a log in key order.
///
/// A cursor that reaches the end of the log is exhausted, not finished:
/// [`LogCursor::next`] returns `Ok(None)` and resumes once more records are
/// appended. The cursor fails with [`CoreError::CursorInvalidated`] if the
/// segment it stands in is purged.
pub struct LogCursor<R: LogRecord> {
    log: Arc<LogInner<R>>,
    position: Position<R::Key>,
    last_key: Option<R::Key>,
    status: Status,
}

impl<R: LogRecord> fmt::Debug for LogCursor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogCursor")
            .field("log", &self.log.name)
            .field("last_key", &self.last_key)
            .field("status", &self.status)
            .finish()
    }
}

impl<R: LogRecord> LogCursor<R> {
    pub(crate) fn new(log: Arc<LogInner<R>>, key: Option<R::Key>, strategy: PositionStrategy) -> Self {
        Self {
            log,
            position: Position::Seek { key, strategy },
            last_key: None,
            status: Status::Open,
        }
    }

    /// Returns the next record, or `Ok(None)` if none is available yet.
    ///
    /// # Errors
    ///
    /// - [`CoreError::CursorClosed`] after [`LogCursor::close`]
    /// - [`CoreError::CursorInvalidated`] if the records under the cursor
    ///   were purged; the cursor is failed from then on
    /// - read and decode errors, which also fail the cursor
    pub fn next(&mut self) -> CoreResult<Option<R>> {
        match self.status {
            Status::Open => {}
            Status::Closed => return Err(CoreError::CursorClosed),
            Status::Failed => {
                return Err(CoreError::cursor_invalidated(format!(
                    "cursor on {} failed earlier",
                    self.log.name
                )))
            }
        }

        let log = Arc::clone(&self.log);
        let state = log.state.read();
        if state.closed {
            return Ok(None);
        }

        let (mut pos, mut idx) = match self.position {
            Position::Seek { key, strategy } => match state.locate(key, strategy) {
                Some(found) => found,
                None => return Ok(None),
            },
            Position::At { segment, index } => match state.segment_position(segment) {
                Some(pos) => (pos, index),
                None => {
                    // The segment is gone. Only records this cursor already
                    // returned may have gone with it.
                    let caught_up = match (self.last_key, state.purged_through) {
                        (Some(last), Some(purged)) => last >= purged,
                        _ => false,
                    };
                    if !caught_up {
                        self.status = Status::Failed;
                        return Err(CoreError::cursor_invalidated(format!(
                            "segment {segment} of {} was removed",
                            self.log.name
                        )));
                    }
                    let found = state.locate(self.last_key, PositionStrategy::StrictlyAfter);
                    match found {
                        Some(found) => found,
                        None => {
                            self.position = Position::Seek {
                                key: self.last_key,
                                strategy: PositionStrategy::StrictlyAfter,
                            };
                            return Ok(None);
                        }
                    }
                }
            },
        };

        while idx >= state.segments[pos].len() {
            if pos + 1 == state.segments.len() {
                // Stay parked at the head's end so later appends are seen.
                self.position = Position::At {
                    segment: state.segments[pos].id(),
                    index: idx,
                };
                return Ok(None);
            }
            pos += 1;
            idx = 0;
        }

        let record: R = match state.record_at(pos, idx) {
            Ok(record) => record,
            Err(e) => {
                self.status = Status::Failed;
                return Err(e);
            }
        };
        self.position = Position::At {
            segment: state.segments[pos].id(),
            index: idx + 1,
        };
        self.last_key = Some(record.key());
        Ok(Some(record))
    }

    /// Key of the last record returned.
    #[must_use]
    pub fn last_key(&self) -> Option<R::Key> {
        self.last_key
    }

    /// Releases the cursor. Later reads fail with [`CoreError::CursorClosed`].
    pub fn close(&mut self) {
        self.status = Status::Closed;
    }

    /// Returns true after [`LogCursor::close`].
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.status == Status::Closed
    }
}
