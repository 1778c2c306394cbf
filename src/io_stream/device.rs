//! Device boundary: sequential byte-range access with an explicit cursor.
//!
//! The engine only ever asks a device to seek, read one block, write one
//! block, and close.  Device size is never queried; the end of a device shows
//! up as a zero-length read or a short (out-of-space) write.
//!
//! # Direct I/O
//! [`FileDevice`] opens read paths with `O_DIRECT` unless asked not to.
//! Whether that works depends on the filesystem and device, so the open is
//! followed by one aligned probe read; `EINVAL` at open, probe, or write time
//! reopens the device buffered and carries on.  Write paths use `O_SYNC` so
//! that errors surface on the write that caused them.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Buffer alignment that satisfies `O_DIRECT` on every common device.
pub const DIRECT_IO_ALIGNMENT: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    ReadWrite,
    Write,
}

impl Access {
    pub fn reads(self) -> bool {
        matches!(self, Access::Read | Access::ReadWrite)
    }

    pub fn writes(self) -> bool {
        matches!(self, Access::Write | Access::ReadWrite)
    }
}

pub trait BlockDevice {
    /// Move the cursor to `offset`; returns the new position.
    fn seek_to(&mut self, offset: u64) -> io::Result<u64>;

    /// Fill `buf` from the cursor.  Returns fewer bytes only at the end of
    /// the device and `0` once the end has been reached.
    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write `buf` at the cursor.  A count below `buf.len()` means the
    /// device ran out of space after that many bytes.
    fn write_block(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Flush and release the device.
    fn close(&mut self) -> io::Result<()>;

    fn is_direct(&self) -> bool {
        false
    }
}

// ── Aligned buffer ───────────────────────────────────────────────────────────

/// Heap buffer whose start is aligned to [`DIRECT_IO_ALIGNMENT`].
pub struct AlignedBuffer {
    storage: Vec<u8>,
    offset:  usize,
    len:     usize,
}

impl AlignedBuffer {
    pub fn new(len: usize) -> Self {
        let storage = vec![0u8; len + DIRECT_IO_ALIGNMENT];
        let offset  = storage.as_ptr().align_offset(DIRECT_IO_ALIGNMENT);
        // align_offset may decline; an unaligned buffer only costs direct I/O.
        let offset  = if offset <= DIRECT_IO_ALIGNMENT { offset } else { 0 };
        Self { storage, offset, len }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[self.offset..self.offset + self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset..self.offset + self.len]
    }
}

// ── File device ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags {
    /// Try `O_DIRECT` (read paths only).
    pub direct: bool,
    /// Open with `O_SYNC` (write paths only).
    pub sync:   bool,
}

pub struct FileDevice {
    file:     Option<File>,
    path:     PathBuf,
    access:   Access,
    direct:   bool,
    sync:     bool,
    position: u64,
}

impl FileDevice {
    /// Open `path` for `access`, probing direct I/O with one aligned read of
    /// `probe_len` bytes.
    pub fn open(path: &Path, access: Access, flags: OpenFlags, probe_len: usize) -> io::Result<Self> {
        let direct = flags.direct && access.reads();
        let sync   = flags.sync && access.writes();

        let (file, direct) = match open_file(path, access, direct, sync) {
            Ok(f) => (f, direct),
            Err(e) if direct && is_einval(&e) => {
                warn!(path = %path.display(), "direct I/O not supported at open, using buffered I/O");
                (open_file(path, access, false, sync)?, false)
            }
            Err(e) => return Err(e),
        };

        let mut dev = Self { file: Some(file), path: path.to_owned(), access, direct, sync, position: 0 };
        if dev.direct {
            dev.probe_direct(probe_len)?;
        }
        debug!(path = %path.display(), ?access, direct = dev.direct, sync, "device opened");
        Ok(dev)
    }

    fn probe_direct(&mut self, probe_len: usize) -> io::Result<()> {
        let mut buf = AlignedBuffer::new(probe_len.max(DIRECT_IO_ALIGNMENT));
        let res = self.file_mut()?.read(buf.as_mut_slice());
        match res {
            Err(e) if is_einval(&e) => {
                warn!(path = %self.path.display(), "aligned probe read rejected, using buffered I/O");
                self.reopen_buffered()?;
            }
            // Other failures belong to the data pass and are retried there.
            _ => {}
        }
        self.seek_to(0)?;
        Ok(())
    }

    fn reopen_buffered(&mut self) -> io::Result<()> {
        self.file   = Some(open_file(&self.path, self.access, false, self.sync)?);
        self.direct = false;
        let pos = self.position;
        self.seek_to(pos)?;
        Ok(())
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "device already closed"))
    }
}

impl BlockDevice for FileDevice {
    fn seek_to(&mut self, offset: u64) -> io::Result<u64> {
        let pos = self.file_mut()?.seek(SeekFrom::Start(offset))?;
        if pos != offset {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("seek landed at {pos} instead of {offset}"),
            ));
        }
        self.position = pos;
        Ok(pos)
    }

    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut got = 0;
        while got < buf.len() {
            let res = self.file_mut()?.read(&mut buf[got..]);
            match res {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if self.direct && is_einval(&e) => {
                    warn!(path = %self.path.display(), "direct read rejected, using buffered I/O");
                    self.position += got as u64;
                    self.reopen_buffered()?;
                    self.position -= got as u64;
                }
                Err(e) => return Err(e),
            }
        }
        self.position += got as u64;
        Ok(got)
    }

    fn write_block(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut put = 0;
        let mut fell_back = false;
        while put < buf.len() {
            let res = self.file_mut()?.write(&buf[put..]);
            match res {
                Ok(0) => break,
                Ok(n) => put += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::ENOSPC) => break,
                Err(e) if self.direct && !fell_back && is_einval(&e) => {
                    warn!(path = %self.path.display(), "direct write rejected, using buffered I/O");
                    fell_back = true;
                    self.position += put as u64;
                    self.reopen_buffered()?;
                    self.position -= put as u64;
                }
                Err(e) => return Err(e),
            }
        }
        self.position += put as u64;
        Ok(put)
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(f) if self.access.writes() => f.sync_all(),
            _ => Ok(()),
        }
    }

    fn is_direct(&self) -> bool {
        self.direct
    }
}

fn is_einval(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINVAL)
}

fn open_file(path: &Path, access: Access, direct: bool, sync: bool) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.read(access.reads()).write(access.writes());

    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut custom = 0;
        if direct {
            custom |= libc::O_DIRECT;
        }
        if sync {
            custom |= libc::O_SYNC;
        }
        opts.custom_flags(custom);
    }
    #[cfg(all(unix, not(target_os = "linux")))]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let _ = direct;
        if sync {
            opts.custom_flags(libc::O_SYNC);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (direct, sync);
    }

    opts.open(path)
}

// ── In-memory device ─────────────────────────────────────────────────────────

/// Fixed-size device backed by a `Vec<u8>`, with injectable faults.
///
/// Writes past the end are cut short, exactly like a full disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    data:          Vec<u8>,
    position:      u64,
    bad_reads:     Vec<Range<u64>>,
    bad_writes:    Vec<Range<u64>>,
    bytes_written: u64,
    closed:        bool,
}

impl MemoryDevice {
    /// Zero-filled device of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::from_bytes(vec![0u8; len])
    }

    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self { data, ..Self::default() }
    }

    /// Reads overlapping `range` fail with `EIO`.
    pub fn fail_reads(mut self, range: Range<u64>) -> Self {
        self.bad_reads.push(range);
        self
    }

    /// Writes overlapping `range` fail with `EIO`.
    pub fn fail_writes(mut self, range: Range<u64>) -> Self {
        self.bad_writes.push(range);
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Total bytes accepted by `write_block`.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check(ranges: &[Range<u64>], start: u64, len: usize) -> io::Result<()> {
        let end = start + len as u64;
        if ranges.iter().any(|r| r.start < end && start < r.end) {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        Ok(())
    }
}

impl BlockDevice for MemoryDevice {
    fn seek_to(&mut self, offset: u64) -> io::Result<u64> {
        self.position = offset;
        Ok(offset)
    }

    fn read_block(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size  = self.data.len() as u64;
        let start = self.position.min(size) as usize;
        let n     = buf.len().min(self.data.len() - start);
        Self::check(&self.bad_reads, self.position, n)?;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }

    fn write_block(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size  = self.data.len() as u64;
        let start = self.position.min(size) as usize;
        let n     = buf.len().min(self.data.len() - start);
        Self::check(&self.bad_writes, self.position, n)?;
        self.data[start..start + n].copy_from_slice(&buf[..n]);
        self.position      += n as u64;
        self.bytes_written += n as u64;
        Ok(n)
    }

    fn close(&mut self) -> io::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_buffer_is_aligned() {
        let mut buf = AlignedBuffer::new(8192);
        assert_eq!(buf.as_slice().len(), 8192);
        assert_eq!(buf.as_slice().as_ptr() as usize % DIRECT_IO_ALIGNMENT, 0);
        buf.as_mut_slice()[8191] = 1;
        assert_eq!(buf.as_slice()[8191], 1);
    }

    #[test]
    fn memory_device_reports_end_and_full() {
        let mut dev = MemoryDevice::new(1000);
        let mut buf = [0u8; 512];
        assert_eq!(dev.read_block(&mut buf).unwrap(), 512);
        assert_eq!(dev.read_block(&mut buf).unwrap(), 488);
        assert_eq!(dev.read_block(&mut buf).unwrap(), 0);

        dev.seek_to(900).unwrap();
        assert_eq!(dev.write_block(&[1u8; 512]).unwrap(), 100);
        assert_eq!(dev.bytes_written(), 100);
        assert_eq!(dev.data()[999], 1);
    }

    #[test]
    fn memory_device_fault_injection() {
        let mut dev = MemoryDevice::new(4096).fail_reads(1000..1001).fail_writes(0..1);
        let mut buf = [0u8; 512];
        assert_eq!(dev.read_block(&mut buf).unwrap(), 512);
        let err = dev.read_block(&mut buf).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EIO));
        dev.seek_to(0).unwrap();
        assert!(dev.write_block(&buf).is_err());
    }

    #[test]
    fn file_device_round_trip() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![0u8; 4096]).unwrap();

        let mut dev = FileDevice::open(tmp.path(), Access::ReadWrite, OpenFlags::default(), 4096).unwrap();
        dev.seek_to(512).unwrap();
        assert_eq!(dev.write_block(&[0xabu8; 512]).unwrap(), 512);
        dev.seek_to(0).unwrap();
        let mut buf = vec![0u8; 8192];
        assert_eq!(dev.read_block(&mut buf).unwrap(), 4096);
        assert!(buf[512..1024].iter().all(|&b| b == 0xab));
        dev.close().unwrap();
        assert!(dev.seek_to(0).is_err());
    }

    #[test]
    fn direct_request_falls_back_when_unsupported() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), vec![7u8; 8192]).unwrap();

        let flags = OpenFlags { direct: true, sync: false };
        let mut dev = FileDevice::open(tmp.path(), Access::Read, flags, 4096).unwrap();
        let mut buf = AlignedBuffer::new(4096);
        assert_eq!(dev.read_block(buf.as_mut_slice()).unwrap(), 4096);
        assert!(buf.as_slice().iter().all(|&b| b == 7));
    }
}
