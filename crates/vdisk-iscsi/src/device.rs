//! Block-device adapter over an iSCSI session
//!
//! Wraps a logged-in connection and a LUN as a byte-addressable device:
//! READ CAPACITY on open, READ(10)/WRITE(10) underneath, with
//! read-modify-write for partial blocks. The suspending API is primary;
//! [`BlockingDevice`] drives it to completion on a current-thread runtime.

use std::ops::Range;

use tokio::io::{AsyncRead, AsyncWrite};
use vdisk_core::{check_read, check_write, BlockDevice, Error, Extent, Result};

use crate::connection::{Connection, SessionConfig};
use crate::scsi;

/// A remote LUN exposed as a sparse block device (fully populated)
pub struct IscsiDevice<T> {
    conn: Connection<T>,
    lun: u64,
    block_size: u32,
    capacity_blocks: u64,
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> IscsiDevice<T> {
    /// Probe `lun` on a logged-in connection
    pub async fn open(mut conn: Connection<T>, lun: u64) -> Result<Self> {
        let mut capacity = [0u8; 8];
        let n = conn
            .execute(lun, &scsi::read_capacity10(), &[], &mut capacity)
            .await?;
        if n < capacity.len() {
            return Err(Error::protocol(format!(
                "READ CAPACITY returned {} of 8 bytes",
                n
            )));
        }
        let (capacity_blocks, block_size) = scsi::parse_read_capacity10(&capacity)?;
        Ok(Self {
            conn,
            lun,
            block_size,
            capacity_blocks,
        })
    }

    /// Enumerate the LUNs the target exposes
    pub async fn report_luns(conn: &mut Connection<T>) -> Result<Vec<u64>> {
        let mut buf = vec![0u8; 4096];
        let n = conn
            .execute(0, &scsi::report_luns(buf.len() as u32), &[], &mut buf)
            .await?;
        scsi::parse_report_luns(&buf[..n])
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn length(&self) -> u64 {
        self.capacity_blocks * self.block_size as u64
    }

    pub fn connection(&mut self) -> &mut Connection<T> {
        &mut self.conn
    }

    /// Largest byte count to move per SCSI command
    fn transfer_limit(&self) -> usize {
        let burst = self.conn.params().max_burst_length as usize;
        let by_cdb = 0xFFFF * self.block_size as usize;
        burst.min(by_cdb).max(self.block_size as usize)
    }

    async fn read_blocks(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.block_size as usize, 0);
        let blocks = (buf.len() / self.block_size as usize) as u16;
        let lba: u32 = lba
            .try_into()
            .map_err(|_| Error::out_of_range("LBA exceeds READ(10) addressing"))?;
        let n = self
            .conn
            .execute(self.lun, &scsi::read10(lba, blocks), &[], buf)
            .await?;
        if n != buf.len() {
            return Err(Error::protocol(format!(
                "READ(10) returned {} of {} bytes",
                n,
                buf.len()
            )));
        }
        Ok(())
    }

    async fn write_blocks(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        debug_assert_eq!(buf.len() % self.block_size as usize, 0);
        let blocks = (buf.len() / self.block_size as usize) as u16;
        let lba: u32 = lba
            .try_into()
            .map_err(|_| Error::out_of_range("LBA exceeds WRITE(10) addressing"))?;
        self.conn
            .execute(self.lun, &scsi::write10(lba, blocks), buf, &mut [])
            .await?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes at `pos`, clamped at the device end
    pub async fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        let n = check_read(pos, buf.len(), self.length())?;
        if n == 0 {
            return Ok(0);
        }
        let block_size = self.block_size as u64;
        let limit = self.transfer_limit();

        let mut done = 0usize;
        while done < n {
            let abs = pos + done as u64;
            let lba = abs / block_size;
            let within = (abs % block_size) as usize;
            let span_end = n.min(done + limit - within);

            // Cover the requested range with whole blocks.
            let aligned_len =
                (within + (span_end - done)).div_ceil(block_size as usize) * block_size as usize;
            let mut scratch = vec![0u8; aligned_len];
            self.read_blocks(lba, &mut scratch).await?;
            buf[done..span_end].copy_from_slice(&scratch[within..within + (span_end - done)]);
            done = span_end;
        }
        Ok(n)
    }

    /// Write `buf` at `pos`; partial blocks are read-modify-written
    pub async fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        check_write(pos, buf.len(), self.length())?;
        let block_size = self.block_size as u64;
        let limit = self.transfer_limit();

        let mut done = 0usize;
        while done < buf.len() {
            let abs = pos + done as u64;
            let lba = abs / block_size;
            let within = (abs % block_size) as usize;
            let span_end = buf.len().min(done + limit - within);

            let aligned_len =
                (within + (span_end - done)).div_ceil(block_size as usize) * block_size as usize;
            let mut scratch = vec![0u8; aligned_len];
            if within != 0 || (span_end - done) % block_size as usize != 0 {
                self.read_blocks(lba, &mut scratch).await?;
            }
            scratch[within..within + (span_end - done)].copy_from_slice(&buf[done..span_end]);
            self.write_blocks(lba, &scratch).await?;
            done = span_end;
        }
        Ok(())
    }

    /// A remote LUN has no sparseness information; it is one full extent
    pub fn extents(&self, range: Range<u64>) -> Vec<Extent> {
        let all = [Extent::new(0, self.length())];
        vdisk_core::device::clip_extents(&all, &range)
    }

    /// Log out and drop the session
    pub async fn close(&mut self) -> Result<()> {
        self.conn.logout().await
    }
}

/// Blocking facade: a current-thread runtime driving the suspending device
pub struct BlockingDevice<T> {
    runtime: tokio::runtime::Runtime,
    device: IscsiDevice<T>,
}

impl BlockingDevice<tokio::net::TcpStream> {
    /// Connect to `addr`, log in and open `lun`
    pub fn connect(addr: &str, config: &SessionConfig, lun: u64) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let device = runtime.block_on(async {
            let stream = tokio::net::TcpStream::connect(addr).await?;
            let mut conn = Connection::new(stream);
            conn.login(config).await?;
            IscsiDevice::open(conn, lun).await
        })?;
        Ok(Self { runtime, device })
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BlockingDevice<T> {
    /// Wrap an already-opened suspending device
    pub fn from_parts(runtime: tokio::runtime::Runtime, device: IscsiDevice<T>) -> Self {
        Self { runtime, device }
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BlockDevice for BlockingDevice<T> {
    fn length(&self) -> u64 {
        self.device.length()
    }

    fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        self.runtime.block_on(self.device.read_at(pos, buf))
    }

    fn write_at(&mut self, pos: u64, buf: &[u8]) -> Result<()> {
        self.runtime.block_on(self.device.write_at(pos, buf))
    }

    fn extents(&mut self, range: Range<u64>) -> Result<Vec<Extent>> {
        Ok(self.device.extents(range))
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.runtime.block_on(self.device.close())
    }
}
