use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::multisink::{MultiSink, PopEntryError};
use crate::ring_buffer::ReaderToken;

/// Pull-mode reader attached to a [`MultiSink`].
///
/// A drain owns one ring-buffer cursor plus the last sequence ID it handled,
/// which is how it computes drop counts without coordinating with other
/// drains. Drains start detached; every pull before
/// [`MultiSink::attach_drain`] fails with [`PopEntryError::Detached`].
/// Dropping an attached drain detaches it.
///
/// `'sink` is the borrow of the owning sink, `'a` the sink's own lifetime
/// parameter.
pub struct Drain<'sink, 'a, M: RawMutex, const DRAINS: usize, const LISTENERS: usize> {
    pub(super) sink: Option<&'sink MultiSink<'a, M, DRAINS, LISTENERS>>,
    pub(super) reader: Option<ReaderToken>,
    pub(super) last_handled_id: u32,
}

impl<'sink, 'a, M: RawMutex, const DRAINS: usize, const LISTENERS: usize>
    Drain<'sink, 'a, M, DRAINS, LISTENERS>
{
    /// Creates a detached drain.
    pub const fn new() -> Self {
        Self {
            sink: None,
            reader: None,
            last_handled_id: 0,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.sink.is_some()
    }

    /// Pulls the next entry into `buffer` and reports the drop count in
    /// parallel.
    ///
    /// The second element of the return value is the number of entries this
    /// drain missed since its previous pull, combined from ring-buffer
    /// overwrites, writer-recorded drops, sink clears, and oversized
    /// submissions. It is meaningful on every return, including
    /// [`PopEntryError::Empty`], so it must always be processed.
    ///
    /// Drop counts are maintained in wrapping 32-bit arithmetic: if more
    /// than `u32::MAX` sequence IDs are assigned between two pulls, the
    /// count wraps and under-reports. Pull at least once every `u32::MAX`
    /// entries.
    ///
    /// On success the returned slice borrows from `buffer` and holds the
    /// entry payload with the sequence-ID preamble already stripped.
    pub fn pop_entry<'out>(
        &mut self,
        buffer: &'out mut [u8],
    ) -> (Result<&'out [u8], PopEntryError>, u32) {
        let sink = match self.sink {
            Some(sink) => sink,
            None => return (Err(PopEntryError::Detached), 0),
        };
        let reader = unwrap!(self.reader.as_ref());
        sink.pop_entry(reader, &mut self.last_handled_id, buffer)
    }

    /// Detaches from the owning sink, releasing the reader slot.
    pub(super) fn release(&mut self) {
        if let Some(sink) = self.sink.take() {
            let token = unwrap!(self.reader.take());
            sink.release_reader(token);
        }
    }
}

impl<'sink, 'a, M: RawMutex, const DRAINS: usize, const LISTENERS: usize> Default
    for Drain<'sink, 'a, M, DRAINS, LISTENERS>
{
    fn default() -> Self {
        Self::new()
    }
}

impl<'sink, 'a, M: RawMutex, const DRAINS: usize, const LISTENERS: usize> Drop
    for Drain<'sink, 'a, M, DRAINS, LISTENERS>
{
    fn drop(&mut self) {
        self.release();
    }
}
