//! Record sources
//!
//! Anything that yields an ordered, finite record sequence: trace readers,
//! the merger, or an in-memory list.

use super::record::Record;
use crate::error::Result;
use std::collections::VecDeque;

/// A lazy, forward-only sequence of records
///
/// `Ok(None)` means the sequence ended cleanly; `Err` means it ended on
/// damage. Implementations repeat their terminal outcome on later calls.
pub trait RecordSource: Send {
    /// Produce the next record
    fn next_record(&mut self) -> Result<Option<Record>>;
}

impl RecordSource for Box<dyn RecordSource> {
    fn next_record(&mut self) -> Result<Option<Record>> {
        (**self).next_record()
    }
}

/// In-memory record source
#[derive(Debug, Clone, Default)]
pub struct VecSource {
    records: VecDeque<Record>,
}

impl VecSource {
    /// Wrap a list of records
    pub fn new(records: impl IntoIterator<Item = Record>) -> Self {
        Self {
            records: records.into_iter().collect(),
        }
    }

    /// Records not yet yielded
    pub fn remaining(&self) -> usize {
        self.records.len()
    }
}

impl RecordSource for VecSource {
    fn next_record(&mut self) -> Result<Option<Record>> {
        Ok(self.records.pop_front())
    }
}

impl FromIterator<Record> for VecSource {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self::new(iter)
    }
}
