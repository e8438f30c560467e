use crate::{
    view::{ScatterGather, ScatterGatherMut},
    Error,
};
use bytes::{Buf, Bytes, BytesMut};
use rand::{rngs::OsRng, CryptoRng, RngCore};
use std::{collections::VecDeque, io::IoSlice, iter, mem};
use tracing::trace;

/// Capacity of each extent allocated by a [ByteBuffer].
pub const EXTENT_SIZE: usize = 4096;

/// Outcome of [ByteBuffer::readline].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadLine {
    /// A line (including its `\n` or `\r\n` terminator) was removed from the buffer.
    Line(Bytes),
    /// No terminator yet and the buffer is within bounds: wait for more data.
    Pending,
    /// No terminator and the buffer already holds more than `maxline` bytes.
    Overflow,
    /// A terminator was found but the line is longer than `maxline` bytes.
    TooLong,
}

/// Ordered, move-only byte queue.
///
/// Bytes live in a chain of sealed [Bytes] extents followed by one open
/// extent that absorbs small writes. Sealed extents are never empty.
#[derive(Debug, Default)]
pub struct ByteBuffer {
    sealed: VecDeque<Bytes>,
    tail: Vec<u8>,
    length: usize,
}

/// Allocate an empty extent able to hold `size` bytes without reallocating.
fn allocate(size: usize) -> Result<Vec<u8>, Error> {
    let mut extent = Vec::new();
    extent
        .try_reserve_exact(size)
        .map_err(|_| Error::AllocationFailed(size))?;
    Ok(extent)
}

impl ByteBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes in the buffer.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Number of extents currently holding bytes.
    pub fn extents(&self) -> usize {
        self.sealed.len() + usize::from(!self.tail.is_empty())
    }

    /// Move the open extent (if it holds anything) to the back of the chain.
    fn seal(&mut self) {
        if self.tail.is_empty() {
            return;
        }
        let tail = mem::take(&mut self.tail);
        self.sealed.push_back(Bytes::from(tail));
    }

    fn iter_extents(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let tail = Some(self.tail.as_slice()).filter(|tail| !tail.is_empty());
        self.sealed
            .iter()
            .map(|extent| extent.as_ref())
            .chain(iter::once(tail).flatten())
    }

    /// Append a copy of `data`.
    ///
    /// All extents needed to hold `data` are allocated before any byte is
    /// appended, so a failed allocation leaves the buffer unchanged.
    pub fn write(&mut self, data: impl AsRef<[u8]>) -> Result<(), Error> {
        let mut data = data.as_ref();
        if data.is_empty() {
            return Ok(());
        }

        // Reserve every extent up front
        let room = if self.tail.capacity() == 0 {
            0
        } else {
            EXTENT_SIZE - self.tail.len()
        };
        let overflow = data.len().saturating_sub(room);
        let needed = overflow.div_ceil(EXTENT_SIZE);
        let mut fresh = Vec::new();
        fresh
            .try_reserve_exact(needed)
            .map_err(|_| Error::AllocationFailed(overflow))?;
        for _ in 0..needed {
            fresh.push(allocate(EXTENT_SIZE)?);
        }

        // Fill the open extent, then each fresh one
        let n = room.min(data.len());
        self.tail.extend_from_slice(&data[..n]);
        self.length += n;
        data = &data[n..];
        for extent in fresh {
            self.seal();
            self.tail = extent;
            let n = EXTENT_SIZE.min(data.len());
            self.tail.extend_from_slice(&data[..n]);
            self.length += n;
            data = &data[n..];
        }
        Ok(())
    }

    /// Append `data` without copying it.
    pub fn write_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.seal();
        self.length += data.len();
        self.sealed.push_back(data);
    }

    /// Move every byte of `other` to the back of this buffer without copying.
    pub fn append(&mut self, other: &mut ByteBuffer) {
        self.seal();
        other.seal();
        self.length += other.length;
        self.sealed.append(&mut other.sealed);
        other.length = 0;
    }

    /// Remove every extent from the buffer, in order, without copying.
    pub fn take_extents(&mut self) -> Vec<Bytes> {
        self.seal();
        self.length = 0;
        self.sealed.drain(..).collect()
    }

    /// Reserve `count` bytes at the back of the buffer.
    ///
    /// The reserved space is exposed as a [ScatterGatherMut] through
    /// [Reservation::view_mut] and becomes part of the buffer only once
    /// [Reservation::commit] is called.
    pub fn reserve(&mut self, count: usize) -> Result<Reservation<'_>, Error> {
        let mut extents = Vec::new();
        extents
            .try_reserve_exact(count.div_ceil(EXTENT_SIZE))
            .map_err(|_| Error::AllocationFailed(count))?;
        let mut remaining = count;
        while remaining > 0 {
            let size = remaining.min(EXTENT_SIZE);
            let mut extent = allocate(size)?;
            extent.resize(size, 0);
            extents.push(extent);
            remaining -= size;
        }
        Ok(Reservation {
            buffer: self,
            extents,
        })
    }

    /// Append `count` bytes drawn from the operating system's secure RNG.
    pub fn write_random(&mut self, count: usize) -> Result<(), Error> {
        self.write_random_with(&mut OsRng, count)
    }

    /// Append `count` bytes drawn from `rng`, filling reserved extents in place.
    ///
    /// Either exactly `count` bytes are committed or none are.
    pub fn write_random_with<R: RngCore + CryptoRng>(
        &mut self,
        rng: &mut R,
        count: usize,
    ) -> Result<(), Error> {
        if count == 0 {
            return Ok(());
        }
        let mut reservation = self.reserve(count)?;
        let mut remaining = count;
        {
            let mut view = reservation.view_mut();
            for index in 0..view.len() {
                if remaining == 0 {
                    break;
                }
                let extent = view.get_mut(index)?;
                let n = extent.len().min(remaining);
                rng.try_fill_bytes(&mut extent[..n])
                    .map_err(Error::RandomFailed)?;
                remaining -= n;
            }
        }
        if remaining != 0 {
            return Err(Error::ReservationShort {
                requested: count,
                filled: count - remaining,
            });
        }
        reservation.commit(count)
    }

    /// Read-only view of every extent in the buffer.
    pub fn view(&self) -> ScatterGather<'_> {
        ScatterGather::new(self.iter_extents().collect())
    }

    /// Visit each extent, in order, until `visitor` returns false.
    ///
    /// The buffer cannot be modified while the traversal is in progress.
    pub fn foreach(&self, mut visitor: impl FnMut(&[u8]) -> bool) {
        for extent in self.iter_extents() {
            if !visitor(extent) {
                break;
            }
        }
    }

    /// Copy up to `upto` bytes from the front of the buffer without removing them.
    ///
    /// No copy is made when the bytes sit in a single sealed extent.
    pub fn peek(&self, upto: usize) -> Bytes {
        let upto = upto.min(self.length);
        if upto == 0 {
            return Bytes::new();
        }
        if let Some(front) = self.sealed.front() {
            if front.len() >= upto {
                return front.slice(..upto);
            }
        }

        let mut out = BytesMut::with_capacity(upto);
        let mut remaining = upto;
        self.foreach(|extent| {
            let n = extent.len().min(remaining);
            out.extend_from_slice(&extent[..n]);
            remaining -= n;
            remaining > 0
        });
        out.freeze()
    }

    /// Remove and return up to `upto` bytes from the front of the buffer.
    pub fn read(&mut self, upto: usize) -> Bytes {
        // Bytes are only drained once the copy is complete
        let out = self.peek(upto);
        self.drain(out.len());
        out
    }

    /// Remove and return every byte in the buffer.
    pub fn read_all(&mut self) -> Bytes {
        self.read(self.length)
    }

    /// Remove and return exactly `n` bytes, or nothing if fewer are available.
    pub fn readn(&mut self, n: usize) -> Option<Bytes> {
        if n > self.length {
            return None;
        }
        Some(self.read(n))
    }

    /// Remove and return up to `upto` bytes as text.
    ///
    /// If the bytes are not valid UTF-8 the buffer is left unchanged.
    pub fn read_utf8(&mut self, upto: usize) -> Result<String, Error> {
        let out = self.peek(upto);
        let text = std::str::from_utf8(&out).map_err(|_| Error::InvalidUtf8)?;
        let text = text.to_owned();
        self.drain(out.len());
        Ok(text)
    }

    /// Remove a `\n` or `\r\n` terminated line of at most `maxline` bytes
    /// (terminator included).
    pub fn readline(&mut self, maxline: usize) -> ReadLine {
        let mut offset = 0;
        let mut eol = None;
        self.foreach(|extent| match extent.iter().position(|b| *b == b'\n') {
            Some(position) => {
                eol = Some(offset + position);
                false
            }
            None => {
                offset += extent.len();
                true
            }
        });

        let Some(eol) = eol else {
            if self.length > maxline {
                return ReadLine::Overflow;
            }
            return ReadLine::Pending;
        };
        let len = eol + 1;
        if len > maxline {
            trace!(len, maxline, "line exceeds limit");
            return ReadLine::TooLong;
        }
        ReadLine::Line(self.read(len))
    }

    /// Drop `count` bytes from the front of the buffer.
    pub fn discard(&mut self, count: usize) -> Result<(), Error> {
        if count > self.length {
            return Err(Error::DrainFailed {
                requested: count,
                available: self.length,
            });
        }
        self.drain(count);
        Ok(())
    }

    /// Drop every byte in the buffer.
    pub fn clear(&mut self) {
        self.sealed.clear();
        self.tail.clear();
        self.length = 0;
    }

    /// Drop `count` bytes from the front. `count` must not exceed the length.
    fn drain(&mut self, count: usize) {
        let mut remaining = count;
        while remaining > 0 {
            match self.sealed.front_mut() {
                Some(front) if front.len() <= remaining => {
                    remaining -= front.len();
                    self.sealed.pop_front();
                }
                Some(front) => {
                    front.advance(remaining);
                    remaining = 0;
                }
                None => {
                    self.tail.drain(..remaining);
                    remaining = 0;
                }
            }
        }
        self.length -= count;
    }
}

impl Buf for ByteBuffer {
    fn remaining(&self) -> usize {
        self.length
    }

    fn chunk(&self) -> &[u8] {
        match self.sealed.front() {
            Some(front) => front.as_ref(),
            None => self.tail.as_slice(),
        }
    }

    fn advance(&mut self, cnt: usize) {
        assert!(
            cnt <= self.length,
            "cannot advance past end of buffer: {cnt} > {}",
            self.length
        );
        self.drain(cnt);
    }

    fn chunks_vectored<'a>(&'a self, dst: &mut [IoSlice<'a>]) -> usize {
        let mut filled = 0;
        for (slot, extent) in dst.iter_mut().zip(self.iter_extents()) {
            *slot = IoSlice::new(extent);
            filled += 1;
        }
        filled
    }

    fn copy_to_bytes(&mut self, len: usize) -> Bytes {
        assert!(
            len <= self.length,
            "cannot copy past end of buffer: {len} > {}",
            self.length
        );
        self.read(len)
    }
}

/// Space reserved at the back of a [ByteBuffer] by [ByteBuffer::reserve].
///
/// Dropping a reservation without committing it leaves the buffer unchanged.
pub struct Reservation<'a> {
    buffer: &'a mut ByteBuffer,
    extents: Vec<Vec<u8>>,
}

impl Reservation<'_> {
    /// Number of bytes reserved.
    pub fn len(&self) -> usize {
        self.extents.iter().map(Vec::len).sum()
    }

    /// Returns true if nothing was reserved.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// Writable view of the reserved extents.
    pub fn view_mut(&mut self) -> ScatterGatherMut<'_> {
        ScatterGatherMut::new(
            self.extents
                .iter_mut()
                .map(|extent| extent.as_mut_slice())
                .collect(),
        )
    }

    /// Append the first `count` reserved bytes to the buffer.
    pub fn commit(self, count: usize) -> Result<(), Error> {
        let reserved = self.len();
        if count > reserved {
            return Err(Error::CommitTooLarge {
                requested: count,
                reserved,
            });
        }
        let mut remaining = count;
        for mut extent in self.extents {
            if remaining == 0 {
                break;
            }
            extent.truncate(remaining);
            remaining -= extent.len();
            self.buffer.write_bytes(Bytes::from(extent));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use rand::{rngs::StdRng, SeedableRng};
    use test_case::test_case;

    fn filled(data: &[u8]) -> ByteBuffer {
        let mut buffer = ByteBuffer::new();
        buffer.write(data).unwrap();
        buffer
    }

    #[test_traced]
    fn test_read_returns_prefix() {
        let data: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut buffer = filled(&data);
        assert_eq!(buffer.len(), 10_000);
        assert_eq!(buffer.extents(), 3);

        let first = buffer.read(5000);
        assert_eq!(first.as_ref(), &data[..5000]);
        assert_eq!(buffer.len(), 5000);

        let second = buffer.read(1);
        assert_eq!(second.as_ref(), &data[5000..5001]);
        assert_eq!(buffer.len(), 4999);

        let rest = buffer.read_all();
        assert_eq!(rest.as_ref(), &data[5001..]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.extents(), 0);
    }

    #[test_traced]
    fn test_read_never_exceeds_upto() {
        let mut buffer = filled(b"abcdef");
        assert_eq!(buffer.read(4).as_ref(), b"abcd");
        assert_eq!(buffer.read(100).as_ref(), b"ef");
        assert!(buffer.read(1).is_empty());
    }

    #[test_traced]
    fn test_readn_waits_for_enough() {
        let mut buffer = filled(b"05");
        assert_eq!(buffer.readn(3), None);
        assert_eq!(buffer.len(), 2);

        buffer.write(b"00").unwrap();
        assert_eq!(buffer.readn(3).unwrap().as_ref(), b"050");
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.readn(0).unwrap().len(), 0);
    }

    #[test_case(b"GET / HTTP/1.0\r\n".to_vec(), 64, ReadLine::Line(Bytes::from_static(b"GET / HTTP/1.0\r\n")), 0; "crlf line")]
    #[test_case(b"GET / HTTP/1.0\n".to_vec(), 64, ReadLine::Line(Bytes::from_static(b"GET / HTTP/1.0\n")), 0; "lf line")]
    #[test_case(b"GET / HTTP/1.0".to_vec(), 64, ReadLine::Pending, 14; "no terminator")]
    #[test_case(vec![b'A'; 100], 64, ReadLine::Overflow, 100; "unterminated overflow")]
    #[test_case([vec![b'A'; 68], b"\r\n".to_vec()].concat(), 64, ReadLine::TooLong, 70; "terminated too long")]
    #[test_case(b"a\r\nb\r\n".to_vec(), 3, ReadLine::Line(Bytes::from_static(b"a\r\n")), 3; "first of two lines")]
    fn test_readline(input: Vec<u8>, maxline: usize, expected: ReadLine, left: usize) {
        let mut buffer = filled(&input);
        assert_eq!(buffer.readline(maxline), expected);
        assert_eq!(buffer.len(), left);
    }

    #[test_traced]
    fn test_readline_across_extents() {
        let mut buffer = ByteBuffer::new();
        buffer.write_bytes(Bytes::from_static(b"HTTP/1.1 200"));
        buffer.write(b" OK\r").unwrap();
        buffer.write_bytes(Bytes::from_static(b"\nServer: x\r\n"));
        assert_eq!(buffer.extents(), 3);
        assert_eq!(
            buffer.readline(1024),
            ReadLine::Line(Bytes::from_static(b"HTTP/1.1 200 OK\r\n"))
        );
        assert_eq!(
            buffer.readline(1024),
            ReadLine::Line(Bytes::from_static(b"Server: x\r\n"))
        );
        assert_eq!(buffer.readline(1024), ReadLine::Pending);
    }

    #[test_traced]
    fn test_write_random() {
        let mut buffer = ByteBuffer::new();
        buffer.write_random(0).unwrap();
        assert!(buffer.is_empty());

        buffer.write_random(64).unwrap();
        assert_eq!(buffer.len(), 64);
        buffer.write_random(64).unwrap();
        assert_eq!(buffer.len(), 128);

        let first = buffer.read(64);
        let second = buffer.read(64);
        assert_ne!(first, second);
    }

    #[test_traced]
    fn test_write_random_spans_extents() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut buffer = filled(b"head");
        buffer
            .write_random_with(&mut rng, 2 * EXTENT_SIZE + 1)
            .unwrap();
        assert_eq!(buffer.len(), 2 * EXTENT_SIZE + 5);
        assert_eq!(buffer.extents(), 4);
        assert_eq!(buffer.read(4).as_ref(), b"head");
    }

    #[test_traced]
    fn test_reservation_commit() {
        let mut buffer = filled(b"xy");
        {
            let mut reservation = buffer.reserve(8).unwrap();
            assert_eq!(reservation.len(), 8);
            reservation
                .view_mut()
                .get_mut(0)
                .unwrap()
                .copy_from_slice(b"abcdefgh");
            reservation.commit(3).unwrap();
        }
        assert_eq!(buffer.read_all().as_ref(), b"xyabc");

        // Uncommitted reservations leave the buffer untouched
        let reservation = buffer.reserve(16).unwrap();
        drop(reservation);
        assert!(buffer.is_empty());

        let reservation = buffer.reserve(4).unwrap();
        assert!(matches!(
            reservation.commit(5),
            Err(Error::CommitTooLarge {
                requested: 5,
                reserved: 4
            })
        ));
        assert!(buffer.is_empty());
    }

    #[test_traced]
    fn test_discard() {
        let mut buffer = filled(b"hello world");
        buffer.discard(6).unwrap();
        assert_eq!(buffer.len(), 5);
        assert!(matches!(
            buffer.discard(6),
            Err(Error::DrainFailed {
                requested: 6,
                available: 5
            })
        ));
        assert_eq!(buffer.len(), 5);
        buffer.clear();
        assert!(buffer.is_empty());
    }

    #[test_traced]
    fn test_foreach_stops_early() {
        let mut buffer = ByteBuffer::new();
        buffer.write_bytes(Bytes::from_static(b"one"));
        buffer.write_bytes(Bytes::from_static(b"two"));
        buffer.write(b"three").unwrap();

        let mut seen = Vec::new();
        buffer.foreach(|extent| {
            seen.push(extent.to_vec());
            seen.len() < 2
        });
        assert_eq!(seen, vec![b"one".to_vec(), b"two".to_vec()]);

        let view = buffer.view();
        assert_eq!(view.len(), 3);
        assert_eq!(view.get(2).unwrap(), b"three");
        assert!(view.get(3).is_err());
    }

    #[test_traced]
    fn test_peek_does_not_consume() {
        let mut buffer = ByteBuffer::new();
        buffer.write_bytes(Bytes::from_static(b"\x05\x00"));
        buffer.write(b"\x05\x00\x00\x01").unwrap();
        assert_eq!(buffer.peek(1).as_ref(), b"\x05");
        assert_eq!(buffer.peek(4).as_ref(), b"\x05\x00\x05\x00");
        assert_eq!(buffer.len(), 6);
    }

    #[test_traced]
    fn test_write_bytes_keeps_order() {
        let mut buffer = filled(b"a");
        buffer.write_bytes(Bytes::from_static(b"b"));
        buffer.write(b"c").unwrap();
        buffer.write_bytes(Bytes::new());
        assert_eq!(buffer.extents(), 3);
        assert_eq!(buffer.read_all().as_ref(), b"abc");
    }

    #[test_traced]
    fn test_append_and_take_extents() {
        let mut buffer = filled(b"left");
        let mut other = filled(b"right");
        buffer.append(&mut other);
        assert!(other.is_empty());
        assert_eq!(buffer.len(), 9);

        let extents = buffer.take_extents();
        assert!(buffer.is_empty());
        assert_eq!(extents.concat(), b"leftright");
    }

    #[test_traced]
    fn test_read_utf8() {
        let mut buffer = filled(b"ok");
        assert_eq!(buffer.read_utf8(16).unwrap(), "ok");

        buffer.write([0xff, 0xfe]).unwrap();
        assert!(matches!(buffer.read_utf8(2), Err(Error::InvalidUtf8)));
        assert_eq!(buffer.len(), 2);
    }

    #[test_traced]
    fn test_buf_impl() {
        let mut buffer = ByteBuffer::new();
        buffer.write_bytes(Bytes::from_static(b"abc"));
        buffer.write(b"def").unwrap();

        let mut slices = [IoSlice::new(&[]); 4];
        assert_eq!(buffer.chunks_vectored(&mut slices), 2);
        assert_eq!(&*slices[1], b"def");

        assert_eq!(buffer.chunk(), b"abc");
        buffer.advance(2);
        assert_eq!(buffer.get_u8(), b'c');
        assert_eq!(buffer.copy_to_bytes(3).as_ref(), b"def");
        assert!(!buffer.has_remaining());
    }
}
