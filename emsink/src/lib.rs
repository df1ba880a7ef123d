//! # Emsink
//!
//! A lossy single-writer / multi-reader log queue for `no_std` environments.
//! It buffers opaque byte entries in a user-provided arena, requiring no
//! dynamic memory allocation, and lets any number of independently paced
//! readers drain the stream while learning exactly how many entries each of
//! them missed.
//!
//! The library is designed for systems with tight interrupt latency
//! requirements, keeping all critical section durations bounded.
//!
//! ## Architecture
//!
//! ```text
//! Writer ──handle_entry────► ┌────────────────┐ ──notify──► Listener 1..=L
//!        ──handle_dropped──► │    MultiSink   │
//!                            │ seq. ID + lock │
//!                            └────────┬───────┘
//!                                     ▼
//!                          ┌────────────────────┐
//!                          │  EntryRingBuffer   │  overwrite-on-full
//!                          │ len │ id │ payload │  framed byte arena
//!                          └────┬──────────┬────┘
//!                           cursor 1  …  cursor D
//!                               │            │
//!                            Drain 1  …  Drain D   (pull + drop count)
//! ```
//!
//! Components:
//! * [`ring_buffer::EntryRingBuffer`] is a fixed-capacity circular arena of
//!   length-prefixed frames with per-cursor eviction accounting.
//! * [`MultiSink`] imposes a total order on entries via a wrapping 32-bit
//!   sequence ID, so each [`Drain`] can compute its own losses even after
//!   the buffer overwrote entries it never saw.
//! * [`Listener`]s are notified under the sink lock whenever the sequence ID
//!   advances, allowing them to schedule draining work elsewhere.
//!
//! ## Concurrency model
//!
//! One exclusive blocking mutex per sink guards the buffer, the sequence
//! counter, and the attachment tables. There are two common mutex
//! implementation options:
//! * `CriticalSectionRawMutex` allows submitting and draining entries from
//!   interrupt context, but adds bounded priority inversion (interrupt
//!   latency) to the rest of the system.
//! * `ThreadModeRawMutex` has no system-wide effects but requires all queue
//!   access to run in thread mode.
//!
//! No operation performs I/O, allocation, or sleeps; the only blocking point
//! is the lock itself. A submission's critical section is proportional to
//! the entries it evicts plus the attached listeners; a drain pull is O(1)
//! plus the copy out.
#![no_std]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod multisink;
pub mod ring_buffer;

pub use multisink::{Drain, Listener, MultiSink};
