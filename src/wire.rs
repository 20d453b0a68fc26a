//! Cursor helpers for fixed-layout, big-endian records.
//!
//! Callers check the buffer length up front (see [`FrameError::check`]), so the
//! reader never has to report short reads.
//!
//! [`FrameError::check`]: crate::error::FrameError::check

use crate::time::Timestamp;

pub(crate) struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    pub(crate) fn array<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    pub(crate) fn u8(&mut self) -> u8 {
        let [b] = self.array::<1>();
        b
    }

    pub(crate) fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.array())
    }

    pub(crate) fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.array())
    }

    pub(crate) fn timestamp(&mut self) -> Timestamp {
        Timestamp::from_bytes(self.array())
    }
}

pub(crate) struct WireWriter<const N: usize> {
    buf: [u8; N],
    pos: usize,
}

impl<const N: usize> WireWriter<N> {
    pub(crate) fn new() -> Self {
        WireWriter {
            buf: [0u8; N],
            pos: 0,
        }
    }

    pub(crate) fn bytes(mut self, data: &[u8]) -> Self {
        self.buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        self.pos += data.len();
        self
    }

    pub(crate) fn u8(self, v: u8) -> Self {
        self.bytes(&[v])
    }

    pub(crate) fn u16(self, v: u16) -> Self {
        self.bytes(&v.to_be_bytes())
    }

    pub(crate) fn u32(self, v: u32) -> Self {
        self.bytes(&v.to_be_bytes())
    }

    pub(crate) fn timestamp(self, ts: Timestamp) -> Self {
        self.bytes(&ts.to_bytes())
    }

    /// Returns the record; every byte must have been written.
    pub(crate) fn finish(self) -> [u8; N] {
        debug_assert_eq!(self.pos, N, "record layout does not fill {} bytes", N);
        self.buf
    }
}
