//! Prefixed-entry ring buffer
//!
//! A fixed-capacity circular byte arena storing variable-length framed
//! entries, with overwrite-on-full semantics and a bounded set of independent
//! reader cursors. Each frame starts with a varint giving the length of the
//! rest of the frame, optionally followed by a varint preamble, followed by
//! the caller's payload. Frames wrap byte-wise around the end of the arena.
//!
//! The buffer never allocates: the arena is borrowed from the caller and the
//! reader cursors live in a const-generic slot array. Entries pushed before a
//! reader attached are invisible to that reader. When a push does not fit,
//! whole oldest frames are evicted until it does; every cursor that still had
//! an evicted frame in view is advanced past it and the loss is recorded in
//! that cursor's dropped-entry counter.

use emsink_encoding as varint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PushError {
    /// The framed entry can never fit in the arena.
    EntryTooLarge,
    /// Zero-length entries are not representable to readers.
    EmptyPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PopError {
    /// The cursor has consumed every visible entry.
    Empty,
    /// The output buffer cannot hold the front entry. The cursor is not
    /// advanced; retry with a larger buffer.
    BufferTooSmall,
    /// The front frame does not decode. This buffer never produces such
    /// frames itself; the variant exists so corrupted or foreign storage is
    /// distinguishable from [`PopError::Empty`].
    CorruptFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegistrationError {
    NoReaderSlotLeft,
}

/// Handle to one reader cursor, minted by [`EntryRingBuffer::attach_reader`].
///
/// Tokens are move-only and consumed by `detach_reader`, so a detached slot
/// cannot be addressed again. A token must only be used with the buffer that
/// minted it.
#[derive(Debug)]
pub struct ReaderToken {
    slot: u8,
}

#[derive(Debug, Clone, Copy)]
struct Reader {
    offset: usize,
    entry_count: u32,
    dropped: u32,
}

struct FrameInfo {
    header_len: usize,
    body_len: usize,
}

/// Circular byte arena of length-prefixed entries with `READERS` independent
/// cursors and overwrite-on-full eviction.
pub struct EntryRingBuffer<'buf, const READERS: usize> {
    storage: &'buf mut [u8],
    write_offset: usize,
    used: usize,
    readers: [Option<Reader>; READERS],
}

impl<'buf, const READERS: usize> EntryRingBuffer<'buf, READERS> {
    const _ASSERT_MAX_READERS: usize = u8::MAX as usize - READERS;

    /// Creates a buffer over a caller-owned arena. The arena length is the
    /// capacity; it never grows.
    pub fn new(storage: &'buf mut [u8]) -> Self {
        Self {
            storage,
            write_offset: 0,
            used: 0,
            readers: [None; READERS],
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes currently occupied by live frames.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Registers a cursor at the current write offset. Entries already in
    /// the buffer are invisible to it.
    pub fn attach_reader(&mut self) -> Result<ReaderToken, RegistrationError> {
        for (slot, reader) in self.readers.iter_mut().enumerate() {
            if reader.is_none() {
                *reader = Some(Reader {
                    offset: self.write_offset,
                    entry_count: 0,
                    dropped: 0,
                });
                return Ok(ReaderToken {
                    slot: unwrap!(u8::try_from(slot).ok()),
                });
            }
        }
        Err(RegistrationError::NoReaderSlotLeft)
    }

    /// Unregisters a cursor, freeing its slot for a later `attach_reader`.
    pub fn detach_reader(&mut self, token: ReaderToken) {
        self.readers[usize::from(token.slot)] = None;
    }

    /// Appends one entry holding `payload`.
    ///
    /// Oldest frames are evicted until the new frame fits; eviction is atomic
    /// with the push. After return the entry is visible to every attached
    /// cursor.
    pub fn push_back(&mut self, payload: &[u8]) -> Result<(), PushError> {
        self.push_frame(None, payload)
    }

    /// Like [`push_back`](Self::push_back), with a varint `preamble` encoded
    /// between the length and the payload. Readers receive the preamble
    /// bytes at the front of the popped slice;
    /// [`peek_front_preamble`](Self::peek_front_preamble) decodes it in
    /// place.
    pub fn push_back_with_preamble(
        &mut self,
        preamble: u32,
        payload: &[u8],
    ) -> Result<(), PushError> {
        self.push_frame(Some(preamble), payload)
    }

    /// Copies the front frame's body (preamble plus payload) into `out`
    /// without advancing the cursor.
    pub fn peek_front<'out>(
        &self,
        token: &ReaderToken,
        out: &'out mut [u8],
    ) -> Result<&'out [u8], PopError> {
        let reader = self.reader(token);
        if reader.entry_count == 0 {
            return Err(PopError::Empty);
        }
        let frame = self.frame_at(reader.offset, self.bytes_ahead(reader))?;
        if out.len() < frame.body_len {
            return Err(PopError::BufferTooSmall);
        }
        let start = self.wrap(reader.offset + frame.header_len);
        self.copy_out(start, &mut out[..frame.body_len]);
        Ok(&out[..frame.body_len])
    }

    /// Decodes the preamble varint of the front frame without copying the
    /// frame out.
    pub fn peek_front_preamble(&self, token: &ReaderToken) -> Result<u32, PopError> {
        let reader = self.reader(token);
        if reader.entry_count == 0 {
            return Err(PopError::Empty);
        }
        let frame = self.frame_at(reader.offset, self.bytes_ahead(reader))?;
        let start = self.wrap(reader.offset + frame.header_len);
        let (preamble, _) = self.decode_varint_at(start, frame.body_len)?;
        Ok(preamble)
    }

    /// Pops the front frame into `out`.
    ///
    /// The second element of the return value is the number of entries this
    /// cursor lost to eviction since its previous `pop_front`; it is reported
    /// and reset on every call, including `Empty` and `BufferTooSmall`
    /// returns. On `BufferTooSmall` the cursor is not advanced.
    pub fn pop_front<'out>(
        &mut self,
        token: &ReaderToken,
        out: &'out mut [u8],
    ) -> (Result<&'out [u8], PopError>, u32) {
        let dropped = core::mem::take(&mut self.reader_mut(token).dropped);
        let result = self.peek_front(token, out);
        if result.is_ok() {
            unwrap!(self.skip_front(token).ok());
        }
        (result, dropped)
    }

    /// Advances the cursor past the front frame without copying it.
    pub fn skip_front(&mut self, token: &ReaderToken) -> Result<(), PopError> {
        let reader = self.reader(token);
        if reader.entry_count == 0 {
            return Err(PopError::Empty);
        }
        let offset = reader.offset;
        let frame = self.frame_at(offset, self.bytes_ahead(reader))?;
        let next = self.wrap(offset + frame.header_len + frame.body_len);

        let reader = self.reader_mut(token);
        reader.offset = next;
        reader.entry_count -= 1;
        Ok(())
    }

    /// Entries currently visible to the cursor.
    pub fn entry_count(&self, token: &ReaderToken) -> u32 {
        self.reader(token).entry_count
    }

    /// Removes every frame. Each cursor's remaining entries are folded into
    /// its dropped-entry counter and the write offset is reset.
    pub fn clear(&mut self) {
        self.write_offset = 0;
        self.used = 0;
        for reader in self.readers.iter_mut().flatten() {
            reader.dropped = reader.dropped.wrapping_add(reader.entry_count);
            reader.entry_count = 0;
            reader.offset = 0;
        }
    }

    fn push_frame(&mut self, preamble: Option<u32>, payload: &[u8]) -> Result<(), PushError> {
        if payload.is_empty() {
            return Err(PushError::EmptyPayload);
        }

        let mut preamble_buf = [0u8; varint::MAX_U32_ENCODED_LEN];
        let preamble_len = match preamble {
            Some(value) => unwrap!(varint::encode_u32(value, &mut preamble_buf).ok()),
            None => 0,
        };

        let body_len = preamble_len + payload.len();
        let body_len_u32 = u32::try_from(body_len).map_err(|_| PushError::EntryTooLarge)?;
        let mut len_buf = [0u8; varint::MAX_U32_ENCODED_LEN];
        let len_len = unwrap!(varint::encode_u32(body_len_u32, &mut len_buf).ok());

        let frame_len = len_len + body_len;
        if frame_len > self.storage.len() {
            return Err(PushError::EntryTooLarge);
        }

        while self.storage.len() - self.used < frame_len {
            self.evict_oldest();
        }

        let mut at = self.write_offset;
        self.copy_in(at, &len_buf[..len_len]);
        at = self.wrap(at + len_len);
        if preamble_len > 0 {
            self.copy_in(at, &preamble_buf[..preamble_len]);
            at = self.wrap(at + preamble_len);
        }
        self.copy_in(at, payload);
        self.write_offset = self.wrap(at + payload.len());
        self.used += frame_len;

        for reader in self.readers.iter_mut().flatten() {
            reader.entry_count += 1;
        }
        Ok(())
    }

    fn evict_oldest(&mut self) {
        debug_assert!(self.used > 0);
        let n = self.storage.len();
        let oldest = self.wrap(self.write_offset + n - self.used);
        let frame = unwrap!(self.frame_at(oldest, self.used).ok());
        let frame_len = frame.header_len + frame.body_len;
        let next = self.wrap(oldest + frame_len);
        trace!("evicting {} byte frame to make room", frame_len);

        for reader in self.readers.iter_mut().flatten() {
            if reader.entry_count > 0 && reader.offset == oldest {
                reader.offset = next;
                reader.entry_count -= 1;
                reader.dropped = reader.dropped.wrapping_add(1);
            }
        }
        self.used -= frame_len;
    }

    fn reader(&self, token: &ReaderToken) -> &Reader {
        unwrap!(self.readers[usize::from(token.slot)].as_ref())
    }

    fn reader_mut(&mut self, token: &ReaderToken) -> &mut Reader {
        unwrap!(self.readers[usize::from(token.slot)].as_mut())
    }

    /// Readable bytes between the cursor and the write offset. A cursor at
    /// the write offset with entries in view means the arena is exactly full.
    fn bytes_ahead(&self, reader: &Reader) -> usize {
        if reader.entry_count == 0 {
            return 0;
        }
        let n = self.storage.len();
        let distance = (self.write_offset + n - reader.offset) % n;
        if distance == 0 { n } else { distance }
    }

    fn frame_at(&self, offset: usize, available: usize) -> Result<FrameInfo, PopError> {
        let (body_len, header_len) = self.decode_varint_at(offset, available)?;
        let body_len = body_len as usize;
        if header_len + body_len > available {
            return Err(PopError::CorruptFrame);
        }
        Ok(FrameInfo {
            header_len,
            body_len,
        })
    }

    fn decode_varint_at(&self, offset: usize, available: usize) -> Result<(u32, usize), PopError> {
        let mut bytes = [0u8; varint::MAX_U32_ENCODED_LEN];
        let take = bytes.len().min(available);
        self.copy_out(offset, &mut bytes[..take]);
        varint::decode_u32(&bytes[..take]).map_err(|_| PopError::CorruptFrame)
    }

    fn wrap(&self, offset: usize) -> usize {
        offset % self.storage.len()
    }

    fn copy_out(&self, offset: usize, out: &mut [u8]) {
        let n = self.storage.len();
        let end = offset + out.len();
        if end <= n {
            out.copy_from_slice(&self.storage[offset..end]);
        } else {
            let first = n - offset;
            out[..first].copy_from_slice(&self.storage[offset..]);
            out[first..].copy_from_slice(&self.storage[..end - n]);
        }
    }

    fn copy_in(&mut self, offset: usize, data: &[u8]) {
        let n = self.storage.len();
        let end = offset + data.len();
        if end <= n {
            self.storage[offset..end].copy_from_slice(data);
        } else {
            let first = n - offset;
            self.storage[offset..].copy_from_slice(&data[..first]);
            self.storage[..end - n].copy_from_slice(&data[first..]);
        }
    }
}
