//! In-memory byte store

use vdisk_core::{ByteStore, Error, Result};

/// A growable in-memory [`ByteStore`].
///
/// Used as the host store for freshly built images in tests and as the page
/// source for snapshot overlays.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    data: Vec<u8>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![0u8; len],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl ByteStore for MemStore {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.data.resize(len as usize, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start
            .checked_add(buf.len())
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::truncated(format!(
                    "read of {} bytes at {} past store length {}",
                    buf.len(),
                    offset,
                    self.data.len()
                ))
            })?;
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_store_roundtrip() {
        let mut store = MemStore::with_len(32);
        store.write_at(8, b"payload").unwrap();
        let mut buf = [0u8; 7];
        store.read_at(8, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn test_mem_store_grows_on_write() {
        let mut store = MemStore::new();
        store.write_at(100, &[1, 2, 3]).unwrap();
        assert_eq!(store.len().unwrap(), 103);
        let mut buf = [0u8; 3];
        store.read_at(100, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_mem_store_read_past_end() {
        let mut store = MemStore::with_len(4);
        let mut buf = [0u8; 8];
        assert!(store.read_at(0, &mut buf).is_err());
    }
}
