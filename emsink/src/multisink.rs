//! Asynchronous single-writer multi-reader log queue
//!
//! A [`MultiSink`] wraps one [`EntryRingBuffer`], stamps every entry with a
//! monotonically increasing 32-bit sequence ID, and fans the stream out to a
//! bounded set of pull-mode readers ([`Drain`]) and push-mode observers
//! ([`Listener`]). Because the ring buffer overwrites oldest entries when
//! full, readers can fall arbitrarily far behind; the sequence IDs let each
//! drain report exactly how many entries it missed, independently of every
//! other drain.
//!
//! All state is guarded by one `embassy_sync` blocking mutex. The mutex
//! flavor is the `M` type parameter:
//! * `CriticalSectionRawMutex` masks interrupts, so entries may be submitted
//!   and drained from ISR context.
//! * `ThreadModeRawMutex` (or `NoopRawMutex` on single-threaded targets) has
//!   no system-wide effects but restricts all access to thread mode.
//!
//! ## Examples
//!
//! Stack-allocated usage:
//! ```
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use emsink::{Drain, MultiSink};
//!
//! let mut storage = [0u8; 256];
//! let sink: MultiSink<CriticalSectionRawMutex, 2, 2> = MultiSink::new(&mut storage);
//!
//! let mut drain = Drain::new();
//! sink.attach_drain(&mut drain).unwrap();
//!
//! sink.handle_entry(b"boot").unwrap();
//!
//! let mut buffer = [0u8; 64];
//! let (entry, drop_count) = drain.pop_entry(&mut buffer);
//! assert_eq!(entry.unwrap(), b"boot");
//! assert_eq!(drop_count, 0);
//! ```
//!
//! Static allocation is typically used to obtain `'static` handles that can
//! be shared with spawned tasks and interrupt handlers:
//! ```
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex as Mutex;
//! use emsink::MultiSink;
//! use static_cell::StaticCell;
//!
//! static STORAGE: StaticCell<[u8; 1024]> = StaticCell::new();
//! static SINK: StaticCell<MultiSink<'static, Mutex, 4, 4>> = StaticCell::new();
//!
//! let sink = &*SINK.init(MultiSink::new(STORAGE.init([0; 1024])));
//! sink.handle_entry(b"up").unwrap();
//! ```

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;
use emsink_encoding as varint;
use heapless::Vec;

use crate::ring_buffer::{self, EntryRingBuffer, PopError, ReaderToken};

mod drain;

pub use crate::ring_buffer::PushError;
pub use drain::Drain;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationError {
    /// The drain or listener is already attached to a sink.
    AlreadyAttached,
    NoDrainSlotLeft,
    NoListenerSlotLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DetachError {
    /// The drain or listener is not attached to this sink.
    NotAttached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PopEntryError {
    /// The drain must be attached to a sink first.
    Detached,
    /// No entries were available. The drop count is still meaningful.
    Empty,
    /// The provided buffer cannot hold the next entry. The entry stays in
    /// place; retry with a larger buffer.
    BufferTooSmall,
    /// The next frame carried no decodable sequence ID. The frame is
    /// discarded; its ID surfaces in the drop count of a later pull.
    CorruptFrame,
}

/// Push-mode observer of a [`MultiSink`].
///
/// Invoked synchronously, under the sink lock, every time the sequence ID
/// advances. The callback must only schedule work elsewhere (set a flag,
/// wake a task); calling back into the sink or one of its drains from the
/// callback is a contract violation and panics or deadlocks.
pub trait Listener: Sync {
    fn on_new_entry_available(&self);
}

/// A lossy FIFO of byte entries with per-reader drop accounting.
///
/// One writer submits entries with [`handle_entry`](Self::handle_entry);
/// each attached [`Drain`] pulls them back at its own pace, learning on
/// every pull how many entries it missed. Writers that discard entries
/// before submission record them with
/// [`handle_dropped`](Self::handle_dropped) so readers see those gaps too.
///
/// `'a` bounds the borrowed storage arena and attached listeners. `DRAINS`
/// and `LISTENERS` size the attachment tables.
pub struct MultiSink<'a, M: RawMutex, const DRAINS: usize, const LISTENERS: usize> {
    inner: Mutex<M, RefCell<Inner<'a, DRAINS, LISTENERS>>>,
}

struct Inner<'a, const DRAINS: usize, const LISTENERS: usize> {
    ring: EntryRingBuffer<'a, DRAINS>,
    sequence_id: u32,
    listeners: Vec<&'a dyn Listener, LISTENERS>,
}

impl<'a, M: RawMutex, const DRAINS: usize, const LISTENERS: usize>
    MultiSink<'a, M, DRAINS, LISTENERS>
{
    /// Creates a sink over a caller-owned storage arena.
    pub fn new(storage: &'a mut [u8]) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                ring: EntryRingBuffer::new(storage),
                sequence_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Submits one entry.
    ///
    /// Takes the lock once: the entry receives the next sequence ID, is
    /// framed into the ring buffer (evicting oldest entries as needed), and
    /// every listener is notified before the lock is released.
    ///
    /// The sequence ID advances even when the entry is rejected with
    /// [`PushError::EntryTooLarge`], so the failed entry is observable
    /// downstream as a dropped ID. Empty entries are rejected without
    /// consuming an ID.
    ///
    /// Single-writer precondition: entries must not be submitted
    /// concurrently from multiple contexts. Calling from an interrupt
    /// requires an interrupt-masking `M` such as `CriticalSectionRawMutex`.
    pub fn handle_entry(&self, entry: &[u8]) -> Result<(), PushError> {
        if entry.is_empty() {
            return Err(PushError::EmptyPayload);
        }
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let id = inner.sequence_id;
            inner.sequence_id = id.wrapping_add(1);
            let result = inner.ring.push_back_with_preamble(id, entry);
            if result.is_err() {
                warn!("entry of {} bytes exceeds the sink arena, dropped", entry.len());
            }
            inner.notify_listeners();
            result
        })
    }

    /// Records `drop_count` entries that never reached the sink (e.g. the
    /// writer failed to encode them). Advances the sequence ID without
    /// writing anything, so drains observe the jump as a drop. Listeners are
    /// notified.
    pub fn handle_dropped(&self, drop_count: u32) {
        if drop_count == 0 {
            return;
        }
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            inner.sequence_id = inner.sequence_id.wrapping_add(drop_count);
            inner.notify_listeners();
        })
    }

    /// Attaches a drain. Entries submitted before the attach are neither
    /// delivered to the drain nor counted in its drop counts.
    pub fn attach_drain<'sink>(
        &'sink self,
        drain: &mut Drain<'sink, 'a, M, DRAINS, LISTENERS>,
    ) -> Result<(), RegistrationError> {
        if drain.sink.is_some() {
            return Err(RegistrationError::AlreadyAttached);
        }
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let token = match inner.ring.attach_reader() {
                Ok(token) => token,
                Err(ring_buffer::RegistrationError::NoReaderSlotLeft) => {
                    return Err(RegistrationError::NoDrainSlotLeft);
                }
            };
            drain.reader = Some(token);
            drain.last_handled_id = inner.sequence_id.wrapping_sub(1);
            Ok(())
        })?;
        drain.sink = Some(self);
        debug!("drain attached");
        Ok(())
    }

    /// Detaches a drain previously attached to this sink. The drain becomes
    /// unusable until re-attached.
    pub fn detach_drain(
        &self,
        drain: &mut Drain<'_, 'a, M, DRAINS, LISTENERS>,
    ) -> Result<(), DetachError> {
        match drain.sink {
            Some(sink) if core::ptr::eq(sink, self) => {
                drain.release();
                debug!("drain detached");
                Ok(())
            }
            _ => Err(DetachError::NotAttached),
        }
    }

    /// Attaches a listener. Listener identity is reference identity.
    pub fn attach_listener(&self, listener: &'a dyn Listener) -> Result<(), RegistrationError> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if inner.listeners.iter().any(|l| same_listener(*l, listener)) {
                return Err(RegistrationError::AlreadyAttached);
            }
            inner
                .listeners
                .push(listener)
                .map_err(|_| RegistrationError::NoListenerSlotLeft)
        })
    }

    /// Detaches a listener previously attached to this sink.
    pub fn detach_listener(&self, listener: &'a dyn Listener) -> Result<(), DetachError> {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let index = inner
                .listeners
                .iter()
                .position(|l| same_listener(*l, listener))
                .ok_or(DetachError::NotAttached)?;
            inner.listeners.remove(index);
            Ok(())
        })
    }

    /// Removes all buffered entries. The sequence ID is left unchanged, so
    /// attached drains report the wiped entries as drops on their next pull.
    /// Listeners are not notified (the sequence ID did not advance).
    pub fn clear(&self) {
        self.inner.lock(|cell| cell.borrow_mut().ring.clear())
    }

    /// The read path shared by all drains: pops one frame, strips the
    /// sequence-ID preamble, and converts ID gaps into a drop count.
    fn pop_entry<'out>(
        &self,
        reader: &ReaderToken,
        last_handled_id: &mut u32,
        buffer: &'out mut [u8],
    ) -> (Result<&'out [u8], PopEntryError>, u32) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match inner.ring.peek_front(reader, buffer) {
                Ok(body) => {
                    let (id, preamble_len) = match varint::decode_u32(body) {
                        Ok(decoded) => decoded,
                        Err(_) => {
                            // Discard the frame so the drain cannot wedge;
                            // the lost ID is absorbed by the gap accounting
                            // of the next pull.
                            unwrap!(inner.ring.skip_front(reader).ok());
                            return (Err(PopEntryError::CorruptFrame), 0);
                        }
                    };
                    let drop_count = id.wrapping_sub(*last_handled_id).wrapping_sub(1);
                    *last_handled_id = id;
                    unwrap!(inner.ring.skip_front(reader).ok());
                    (Ok(&body[preamble_len..]), drop_count)
                }
                Err(PopError::Empty) => {
                    // Every assigned ID is now unreachable for this drain:
                    // read, evicted, cleared, or recorded as dropped before
                    // ingress. Reporting up to the latest ID is the only way
                    // overwrites surface while the drain is idle.
                    let latest = inner.sequence_id.wrapping_sub(1);
                    let drop_count = latest.wrapping_sub(*last_handled_id);
                    *last_handled_id = latest;
                    (Err(PopEntryError::Empty), drop_count)
                }
                Err(PopError::BufferTooSmall) => {
                    let drop_count = match inner.ring.peek_front_preamble(reader) {
                        Ok(id) => {
                            let count = id.wrapping_sub(*last_handled_id).wrapping_sub(1);
                            // The front entry itself is not handled yet; the
                            // retry must report it with a zero drop count.
                            *last_handled_id = id.wrapping_sub(1);
                            count
                        }
                        Err(_) => 0,
                    };
                    (Err(PopEntryError::BufferTooSmall), drop_count)
                }
                Err(PopError::CorruptFrame) => (Err(PopEntryError::CorruptFrame), 0),
            }
        })
    }

    fn release_reader(&self, token: ReaderToken) {
        self.inner.lock(|cell| cell.borrow_mut().ring.detach_reader(token))
    }
}

impl<'a, const DRAINS: usize, const LISTENERS: usize> Inner<'a, DRAINS, LISTENERS> {
    fn notify_listeners(&self) {
        for listener in self.listeners.iter() {
            listener.on_new_entry_available();
        }
    }
}

fn same_listener(a: &dyn Listener, b: &dyn Listener) -> bool {
    core::ptr::addr_eq(a as *const dyn Listener, b as *const dyn Listener)
}
