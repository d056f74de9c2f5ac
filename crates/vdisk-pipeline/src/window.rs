//! Window - a sub-range view over a byte store

use vdisk_core::{ByteStore, Error, Result};

/// A [`ByteStore`] exposing only `[start, start+length)` of an underlying
/// store.
///
/// Used to hand a metadata region (a BAT, a metadata table, a log) to a
/// parser as an independent zero-based store without copying.
pub struct Window<S> {
    inner: S,
    start: u64,
    length: u64,
}

impl<S: ByteStore> Window<S> {
    pub fn new(inner: S, start: u64, length: u64) -> Self {
        Self {
            inner,
            start,
            length,
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    fn check(&self, offset: u64, len: usize) -> Result<u64> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::out_of_range("window range overflows u64"))?;
        if end > self.length {
            return Err(Error::out_of_range(format!(
                "access of {} bytes at {} outside window of {} bytes",
                len, offset, self.length
            )));
        }
        Ok(self.start + offset)
    }
}

impl<S: ByteStore> ByteStore for Window<S> {
    fn len(&mut self) -> Result<u64> {
        Ok(self.length)
    }

    fn set_len(&mut self, _len: u64) -> Result<()> {
        Err(Error::out_of_range("window cannot be resized"))
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let abs = self.check(offset, buf.len())?;
        self.inner.read_at(abs, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let abs = self.check(offset, buf.len())?;
        self.inner.write_at(abs, buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()
    }
}
