//! Append-only conversation log with a single in-progress response slot.

use crate::state::{EntryKind, TranscriptEntry};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranscriptError {
    #[error("transcript is empty")]
    Empty,
    #[error("no response is currently streaming")]
    NotStreaming,
}

/// Ordered list of request/response entries.
///
/// Entries are never removed or reordered. The only entry that may change
/// after being appended is the one tagged as the streaming slot, and only
/// until [`Transcript::finish_streaming`] closes it.
#[derive(Debug, Default, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    streaming: Option<usize>,
    revision: u64,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry at the end and return its index
    pub fn append(&mut self, kind: EntryKind, text: impl Into<String>) -> usize {
        self.entries.push(TranscriptEntry::new(kind, text));
        self.revision += 1;
        self.entries.len() - 1
    }

    /// Replace the text of the last entry
    pub fn replace_last(&mut self, text: impl Into<String>) -> Result<(), TranscriptError> {
        let last = self.entries.last_mut().ok_or(TranscriptError::Empty)?;
        last.text = text.into();
        self.revision += 1;
        Ok(())
    }

    /// Append a response entry and tag it as the one being streamed into.
    /// Any slot still open is closed first.
    pub fn begin_streaming(&mut self, text: impl Into<String>) -> usize {
        self.finish_streaming();
        let index = self.append(EntryKind::Response, text);
        self.streaming = Some(index);
        index
    }

    /// Replace the streaming entry's text with a new running total
    pub fn update_streaming(&mut self, text: impl Into<String>) -> Result<(), TranscriptError> {
        let index = self.streaming.ok_or(TranscriptError::NotStreaming)?;
        // The slot always points at an existing entry since nothing is ever removed.
        self.entries[index].text = text.into();
        self.revision += 1;
        Ok(())
    }

    /// Close the streaming slot, returning the index it pointed at
    pub fn finish_streaming(&mut self) -> Option<usize> {
        self.streaming.take()
    }

    pub fn streaming_index(&self) -> Option<usize> {
        self.streaming
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&TranscriptEntry> {
        self.entries.get(index)
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    /// Incremented on every mutation
    pub fn revision(&self) -> u64 {
        self.revision
    }
}
