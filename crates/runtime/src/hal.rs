//! HAL vtables
//!
//! Hardware-facing syscall modules (UART, CAN, filesystem) dispatch through
//! trait objects installed on the executive. Host builds get std-backed
//! defaults; embedded integrations supply their own implementations. A
//! missing vtable answers `ENOSYS`.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

/// Shared errno-style codes for HAL syscalls.
pub const HAL_OK: i32 = 0;
pub const HAL_EIO: i32 = -5;
pub const HAL_EBADF: i32 = -9;
pub const HAL_ENOENT: i32 = -2;

/// Raw UART byte sink.
pub trait UartPort: Send {
    fn write(&mut self, bytes: &[u8]) -> i32;
}

/// CAN frame transport.
pub trait CanBus: Send {
    fn send(&mut self, id: u32, data: &[u8]) -> i32;
    fn recv(&mut self) -> Option<(u32, Vec<u8>)>;
}

/// Minimal file service backing the `fs` and `fd` syscall modules.
pub trait FileStore: Send {
    fn open(&mut self, path: &str) -> i32;
    fn read(&mut self, fd: i32, buf: &mut [u8]) -> i32;
    fn write(&mut self, fd: i32, data: &[u8]) -> i32;
    fn close(&mut self, fd: i32) -> i32;
    fn size(&mut self, path: &str) -> i64;
    fn remove(&mut self, path: &str) -> i32;
}

/// UART that swallows output (default on hosts; stdout goes via mailboxes).
pub struct NullUart;

impl UartPort for NullUart {
    fn write(&mut self, bytes: &[u8]) -> i32 {
        bytes.len() as i32
    }
}

/// Host file store sandboxed under a root directory.
pub struct HostFileStore {
    root: PathBuf,
    files: HashMap<i32, std::fs::File>,
    next_fd: i32,
}

impl HostFileStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root, files: HashMap::new(), next_fd: 3 }
    }

    /// Reject traversal outside the sandbox root.
    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let rel = path.trim_start_matches('/');
        if rel.split('/').any(|c| c == "..") {
            return None;
        }
        Some(self.root.join(rel))
    }
}

impl FileStore for HostFileStore {
    fn open(&mut self, path: &str) -> i32 {
        let Some(full) = self.resolve(path) else { return HAL_ENOENT };
        match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(full)
        {
            Ok(f) => {
                let fd = self.next_fd;
                self.next_fd += 1;
                self.files.insert(fd, f);
                fd
            }
            Err(_) => HAL_ENOENT,
        }
    }

    fn read(&mut self, fd: i32, buf: &mut [u8]) -> i32 {
        match self.files.get_mut(&fd) {
            Some(f) => f.read(buf).map(|n| n as i32).unwrap_or(HAL_EIO),
            None => HAL_EBADF,
        }
    }

    fn write(&mut self, fd: i32, data: &[u8]) -> i32 {
        match self.files.get_mut(&fd) {
            Some(f) => f.write(data).map(|n| n as i32).unwrap_or(HAL_EIO),
            None => HAL_EBADF,
        }
    }

    fn close(&mut self, fd: i32) -> i32 {
        match self.files.remove(&fd) {
            Some(_) => HAL_OK,
            None => HAL_EBADF,
        }
    }

    fn size(&mut self, path: &str) -> i64 {
        // Consult open fds first so unsynced writes are visible.
        let Some(full) = self.resolve(path) else { return HAL_ENOENT as i64 };
        if let Ok(meta) = std::fs::metadata(&full) {
            return meta.len() as i64;
        }
        for f in self.files.values_mut() {
            if let Ok(pos) = f.seek(SeekFrom::End(0)) {
                let _ = f.seek(SeekFrom::Start(0));
                return pos as i64;
            }
        }
        HAL_ENOENT as i64
    }

    fn remove(&mut self, path: &str) -> i32 {
        let Some(full) = self.resolve(path) else { return HAL_ENOENT };
        match std::fs::remove_file(full) {
            Ok(()) => HAL_OK,
            Err(_) => HAL_ENOENT,
        }
    }
}

/// The executive's hardware surface.
pub struct HalVtables {
    pub uart: Box<dyn UartPort>,
    pub can: Option<Box<dyn CanBus>>,
    pub fs: Option<Box<dyn FileStore>>,
}

impl HalVtables {
    /// Host defaults: null UART, no CAN, file store rooted at `fs_root`.
    pub fn host(fs_root: Option<PathBuf>) -> Self {
        Self {
            uart: Box::new(NullUart),
            can: None,
            fs: fs_root.map(|r| Box::new(HostFileStore::new(r)) as Box<dyn FileStore>),
        }
    }
}

impl Default for HalVtables {
    fn default() -> Self {
        Self::host(None)
    }
}
