//! The data store, the file that records are appended to.
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use memmap2::{MmapOptions, MmapRaw};

pub(crate) struct DataStore {
    file: File,
}

impl DataStore {
    pub(crate) fn new(file: File) -> Self {
        DataStore { file }
    }

    /// Extend the store from `from` to `to` bytes, reserving the blocks.
    ///
    /// Blocks are allocated up-front where the file system supports it. A sparse extension would
    /// only fail on first touch of a mapped page, as a `SIGBUS` instead of an error.
    pub(crate) fn extend(&self, from: u64, to: u64) -> io::Result<()> {
        debug_assert!(from <= to);

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;

            let offset = libc::off_t::try_from(from)
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
            let len = libc::off_t::try_from(to - from)
                .map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

            if len == 0 {
                return Ok(());
            }

            // Safety: plain syscall on a file descriptor we own.
            match unsafe { libc::posix_fallocate(self.file.as_raw_fd(), offset, len) } {
                0 => return Ok(()),
                libc::EOPNOTSUPP | libc::EINVAL => {}
                errno => return Err(io::Error::from_raw_os_error(errno)),
            }
        }

        if self.len()? < to {
            self.file.set_len(to)?;
        }

        Ok(())
    }

    pub(crate) fn shrink(&self, to: u64) -> io::Result<()> {
        self.file.set_len(to)
    }

    pub(crate) fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Write the whole buffer at `offset`, bypassing any mapping.
    pub(crate) fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        self.file.write_all_at(buf, offset)
    }

    /// Map a shared, writable window of `len` bytes at `offset`.
    pub(crate) fn map_window(&self, offset: u64, len: usize) -> io::Result<MmapRaw> {
        MmapOptions::new().offset(offset).len(len).map_raw(&self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_shrink() {
        let file = tempfile::tempfile().unwrap();
        let store = DataStore::new(file);

        store.extend(0, 8192).unwrap();
        assert_eq!(store.len().unwrap(), 8192);

        store.extend(8192, 8192).unwrap();
        assert_eq!(store.len().unwrap(), 8192);

        store.shrink(4096).unwrap();
        assert_eq!(store.len().unwrap(), 4096);
    }

    #[test]
    fn window_sees_positional_writes() {
        let file = tempfile::tempfile().unwrap();
        let store = DataStore::new(file);
        store.extend(0, 8192).unwrap();

        store.write_at(b"window", 4096 + 10).unwrap();
        let window = store.map_window(4096, 4096).unwrap();

        // Safety: the window is 4096 bytes long and nobody else writes.
        let seen = unsafe { core::slice::from_raw_parts(window.as_ptr().add(10), 6) };
        assert_eq!(seen, b"window");
    }
}
