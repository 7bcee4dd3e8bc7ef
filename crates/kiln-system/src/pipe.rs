//! Overlapped pipes for capturing a child's standard streams.
//!
//! Each pipe is a uniquely named local pipe: the read end stays in the
//! parent, opened for overlapped I/O and never inherited; the write end is
//! created inheritable and handed to the child as one of its standard
//! handles.

use crate::{handle::ScopedHandle, wide};
use anyhow::{Context as _, Result};
use std::{
    io, mem, process, ptr,
    sync::atomic::{AtomicU64, Ordering},
};
use windows_sys::Win32::{
    Foundation::{
        GetLastError, GENERIC_WRITE, HANDLE, ERROR_IO_PENDING, ERROR_PIPE_CONNECTED, TRUE,
    },
    Security::SECURITY_ATTRIBUTES,
    Storage::FileSystem::{
        CreateFileW, ReadFile, FILE_ATTRIBUTE_NORMAL, FILE_FLAG_FIRST_PIPE_INSTANCE,
        FILE_FLAG_OVERLAPPED, OPEN_EXISTING, PIPE_ACCESS_INBOUND,
    },
    System::Pipes::{ConnectNamedPipe, CreateNamedPipeW, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE},
    System::IO::OVERLAPPED,
};

static PIPE_SERIAL: AtomicU64 = AtomicU64::new(0);

// Process id plus a counter keeps concurrently created pipes from colliding.
fn unique_pipe_name() -> String {
    let serial = PIPE_SERIAL.fetch_add(1, Ordering::Relaxed);
    format!(r"\\.\pipe\kiln-{}-{}", process::id(), serial)
}

/// A (read end, write end) pair. Construction either yields a fully
/// connected pipe or an error; no half-open pair escapes.
pub struct Pipe {
    read: ScopedHandle,
    write: ScopedHandle,
    // Boxed so the kernel's pointer to it survives moves of the Pipe.
    overlapped: Box<OVERLAPPED>,
}

unsafe impl Send for Pipe {}

impl Pipe {
    pub fn new() -> Result<Pipe> {
        let name = unique_pipe_name();
        let wide_name = wide::nul_terminated(&name);

        let read = ScopedHandle::new(unsafe {
            CreateNamedPipeW(
                wide_name.as_ptr(),
                PIPE_ACCESS_INBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_BYTE | PIPE_REJECT_REMOTE_CLIENTS,
                1,
                0,
                0,
                0,
                ptr::null(),
            )
        });
        if !read.is_valid() {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("creating named pipe `{name}`"));
        }

        let security_attributes = SECURITY_ATTRIBUTES {
            nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: ptr::null_mut(),
            bInheritHandle: TRUE,
        };
        let write = ScopedHandle::new(unsafe {
            CreateFileW(
                wide_name.as_ptr(),
                GENERIC_WRITE,
                0,
                &security_attributes,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                ptr::null_mut(),
            )
        });
        if !write.is_valid() {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("opening write end of pipe `{name}`"));
        }

        // Connect in overlapped mode now so that the first read finds the
        // pipe ready instead of failing. The write end already exists, so
        // the usual outcome is ERROR_PIPE_CONNECTED.
        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
        let connected = unsafe { ConnectNamedPipe(read.get(), overlapped.as_mut()) };
        if connected == 0 {
            let error = unsafe { GetLastError() };
            if error != ERROR_PIPE_CONNECTED && error != ERROR_IO_PENDING {
                return Err(io::Error::from_raw_os_error(error as i32))
                    .with_context(|| format!("connecting named pipe `{name}`"));
            }
        }

        Ok(Pipe {
            read,
            write,
            overlapped,
        })
    }

    pub fn read_handle(&self) -> HANDLE {
        self.read.get()
    }

    /// The inheritable end to plug into the child's startup descriptor.
    pub fn write_handle(&self) -> HANDLE {
        self.write.get()
    }

    /// Drops the write end. Once the child's inherited copy is the only
    /// writer left, its exit turns into EOF on the read end.
    pub fn close_write(&mut self) {
        self.write.clear();
    }

    /// Issues one overlapped read into `buffer`. Both synchronous completion
    /// and `ERROR_IO_PENDING` queue a completion packet on the associated
    /// port; anything else (typically a broken pipe at end of stream) is the
    /// returned error.
    ///
    /// # Safety
    ///
    /// `buffer` and this pipe must stay alive and unmoved until the
    /// completion for this read has been dequeued from the associated port.
    pub unsafe fn begin_read(&mut self, buffer: &mut [u8]) -> io::Result<()> {
        let started = unsafe {
            ReadFile(
                self.read.get(),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u32,
                ptr::null_mut(),
                self.overlapped.as_mut(),
            )
        };
        if started == 0 {
            let error = unsafe { GetLastError() };
            if error != ERROR_IO_PENDING {
                return Err(io::Error::from_raw_os_error(error as i32));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iocp::{CompletionPort, WaitResult};
    use assert_matches::assert_matches;
    use std::time::Duration;
    use windows_sys::Win32::Storage::FileSystem::WriteFile;

    fn write_all(pipe: &Pipe, bytes: &[u8]) {
        let mut written = 0u32;
        let ok = unsafe {
            WriteFile(
                pipe.write_handle(),
                bytes.as_ptr().cast(),
                bytes.len() as u32,
                &mut written,
                ptr::null_mut(),
            )
        };
        assert_ne!(ok, 0);
        assert_eq!(written as usize, bytes.len());
    }

    #[test]
    fn names_are_unique() {
        assert_ne!(unique_pipe_name(), unique_pipe_name());
    }

    #[test]
    fn read_completion_arrives_on_the_port() {
        let mut pipe = Pipe::new().unwrap();
        let port = CompletionPort::new().unwrap();
        port.register(pipe.read_handle(), 1).unwrap();

        write_all(&pipe, b"hello");
        let mut buffer = [0u8; 64];
        unsafe { pipe.begin_read(&mut buffer) }.unwrap();

        assert_matches!(
            port.wait(Some(Duration::from_secs(5))),
            WaitResult::Success { key: 1, bytes: 5, .. }
        );
        assert_eq!(&buffer[..5], b"hello");
    }

    #[test]
    fn closed_write_end_reads_as_end_of_stream() {
        let mut pipe = Pipe::new().unwrap();
        let port = CompletionPort::new().unwrap();
        port.register(pipe.read_handle(), 1).unwrap();

        pipe.close_write();
        let mut buffer = [0u8; 64];
        match unsafe { pipe.begin_read(&mut buffer) } {
            // The read failed synchronously: broken pipe is the EOF signal.
            Err(error) => assert_eq!(error.kind(), io::ErrorKind::BrokenPipe),
            // Or it was queued and completes with zero bytes.
            Ok(()) => assert_matches!(
                port.wait(Some(Duration::from_secs(5))),
                WaitResult::Success { key: 1, bytes: 0, .. }
            ),
        }
    }
}
