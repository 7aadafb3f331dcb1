//! Per-replica write-ahead log.
//!
//! Records carry strictly increasing, gapless sequence numbers. The log keeps
//! a bounded tail; older records are compacted away and reads that start
//! before the retained range fail with [`StorageError::Truncated`].

use crate::error::StorageError;
use crate::types::{Mutation, MutationRecord, SeqNo};
use std::collections::VecDeque;

/// In-memory append-only log for one shard replica.
#[derive(Debug, Clone)]
pub struct Wal {
    /// Retained records, oldest first.
    records: VecDeque<MutationRecord>,
    /// Sequence of the last record ever appended (0 if none).
    last_seq: SeqNo,
    /// Maximum number of records to retain (0 = unbounded).
    retention: usize,
}

impl Wal {
    /// Create an empty log.
    pub fn new(retention: usize) -> Self {
        Self::starting_after(0, retention)
    }

    /// Create an empty log whose next record will be `seq + 1`.
    ///
    /// Used after a snapshot load: everything up to `seq` lives in the
    /// snapshot and is not replayable from this log.
    pub fn starting_after(seq: SeqNo, retention: usize) -> Self {
        Self {
            records: VecDeque::new(),
            last_seq: seq,
            retention,
        }
    }

    /// Sequence of the last appended record.
    pub fn last_seq(&self) -> SeqNo {
        self.last_seq
    }

    /// Oldest sequence still readable. Equals `last_seq + 1` when empty.
    pub fn first_seq(&self) -> SeqNo {
        self.records
            .front()
            .map(|r| r.seq)
            .unwrap_or(self.last_seq + 1)
    }

    /// Number of retained records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no records are retained.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a fresh mutation, assigning the next sequence number.
    pub fn append(&mut self, mutation: Mutation) -> SeqNo {
        let seq = self.last_seq + 1;
        self.push(MutationRecord::new(seq, mutation));
        seq
    }

    /// Append a record replicated from another log.
    ///
    /// The record must be exactly the next sequence number.
    pub fn append_record(&mut self, record: MutationRecord) -> Result<(), StorageError> {
        let expected = self.last_seq + 1;
        if record.seq != expected {
            return Err(StorageError::SequenceGap {
                expected,
                got: record.seq,
            });
        }
        self.push(record);
        Ok(())
    }

    fn push(&mut self, record: MutationRecord) {
        self.last_seq = record.seq;
        self.records.push_back(record);
        if self.retention > 0 {
            while self.records.len() > self.retention {
                self.records.pop_front();
            }
        }
    }

    /// Read records with `from <= seq <= to`, at most `limit` of them.
    pub fn read(
        &self,
        from: SeqNo,
        to: SeqNo,
        limit: usize,
    ) -> Result<Vec<MutationRecord>, StorageError> {
        let first = self.first_seq();
        if from < first {
            return Err(StorageError::Truncated {
                requested: from,
                first_retained: first,
            });
        }
        if from > to || from > self.last_seq {
            return Ok(Vec::new());
        }

        // Gapless: the record with sequence `s` sits at index `s - first`.
        let start = (from - first) as usize;
        let end = to.min(self.last_seq);
        let count = ((end - from + 1) as usize).min(limit);
        Ok(self
            .records
            .iter()
            .skip(start)
            .take(count)
            .cloned()
            .collect())
    }

    /// Drop every record with `seq <= up_to`. Returns how many were removed.
    pub fn compact(&mut self, up_to: SeqNo) -> usize {
        let mut removed = 0;
        while let Some(front) = self.records.front() {
            if front.seq > up_to {
                break;
            }
            self.records.pop_front();
            removed += 1;
        }
        removed
    }

    /// Whether the range `from ..= last_seq` is still fully retained.
    pub fn covers_from(&self, from: SeqNo) -> bool {
        from >= self.first_seq()
    }
}
