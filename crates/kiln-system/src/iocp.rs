//! I/O completion port: readiness multiplexing for pipes and job objects.

use crate::handle::ScopedHandle;
use anyhow::{Context as _, Result};
use std::{io, ptr, time::Duration};
use windows_sys::Win32::{
    Foundation::{GetLastError, HANDLE, INVALID_HANDLE_VALUE, WAIT_TIMEOUT},
    System::Threading::INFINITE,
    System::IO::{
        CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus, OVERLAPPED,
    },
};

/// Completion key reserved for [`CompletionPort::stop`]. Real keys are
/// pointer-valued or small tags; this sentinel must collide with neither.
const STOP_COMPLETION_KEY: usize = 0xdead_beef;

/// One dequeue from the port.
///
/// A dequeued completion for a *failed* operation (broken pipe, EOF) is
/// reported as `Success` with the dequeued byte count, which is zero at end
/// of stream. Stream drainers rely on this: a closed pipe reads as
/// `bytes == 0` rather than as a port failure, so draining the other pipe
/// can continue.
#[derive(Debug)]
pub enum WaitResult {
    Success {
        key: usize,
        overlapped: *mut OVERLAPPED,
        bytes: u32,
    },
    Timeout,
    Stopped,
    Failure(io::Error),
}

pub struct CompletionPort {
    handle: ScopedHandle,
}

unsafe impl Send for CompletionPort {}
unsafe impl Sync for CompletionPort {}

impl CompletionPort {
    pub fn new() -> Result<Self> {
        let raw =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) };
        if raw.is_null() {
            return Err(io::Error::last_os_error()).context("creating completion port");
        }
        Ok(CompletionPort {
            handle: ScopedHandle::new(raw),
        })
    }

    pub fn handle(&self) -> HANDLE {
        self.handle.get()
    }

    /// Associates `source` with this port. Completions for async operations
    /// on `source` are dequeued by [`wait`](Self::wait) tagged with `key`.
    pub fn register(&self, source: HANDLE, key: usize) -> Result<()> {
        debug_assert_ne!(key, STOP_COMPLETION_KEY, "key collides with the stop sentinel");
        let port = unsafe { CreateIoCompletionPort(source, self.handle.get(), key, 0) };
        if port.is_null() {
            return Err(io::Error::last_os_error())
                .context("associating handle with completion port");
        }
        Ok(())
    }

    /// Blocks for up to `timeout` (`None` means forever) for the next
    /// completion.
    pub fn wait(&self, timeout: Option<Duration>) -> WaitResult {
        let mut bytes = 0u32;
        let mut key = 0usize;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();
        let milliseconds = timeout.map(duration_to_millis).unwrap_or(INFINITE);
        let dequeued = unsafe {
            GetQueuedCompletionStatus(
                self.handle.get(),
                &mut bytes,
                &mut key,
                &mut overlapped,
                milliseconds,
            )
        };
        if dequeued == 0 && overlapped.is_null() {
            // Nothing was dequeued: the wait itself timed out or failed.
            return if unsafe { GetLastError() } == WAIT_TIMEOUT {
                WaitResult::Timeout
            } else {
                WaitResult::Failure(io::Error::last_os_error())
            };
        }
        if key == STOP_COMPLETION_KEY {
            return WaitResult::Stopped;
        }
        WaitResult::Success {
            key,
            overlapped,
            bytes,
        }
    }

    /// Posts a synthetic completion bearing the reserved stop key. Each call
    /// unblocks one pending or future [`wait`](Self::wait) with
    /// [`WaitResult::Stopped`].
    pub fn stop(&self) -> Result<()> {
        let posted = unsafe {
            PostQueuedCompletionStatus(self.handle.get(), 0, STOP_COMPLETION_KEY, ptr::null_mut())
        };
        if posted == 0 {
            return Err(io::Error::last_os_error()).context("posting stop completion");
        }
        Ok(())
    }
}

pub(crate) fn duration_to_millis(duration: Duration) -> u32 {
    // INFINITE is u32::MAX; a finite timeout must stay below it.
    u32::try_from(duration.as_millis()).unwrap_or(INFINITE - 1)
}
