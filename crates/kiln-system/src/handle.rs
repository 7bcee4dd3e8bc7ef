//! Scoped ownership of a single raw Win32 handle.

use std::{mem, ptr};
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};

/// Owner of one kernel handle. The handle is closed on drop unless it is
/// null or the invalid sentinel, so any failure path that unwinds through a
/// `ScopedHandle` releases the resource. Move-only: every kernel object in
/// this crate passes through this wrapper exactly once.
#[derive(Debug)]
pub struct ScopedHandle(HANDLE);

// Win32 handles are process-global tokens, not thread-affine pointers.
unsafe impl Send for ScopedHandle {}
unsafe impl Sync for ScopedHandle {}

impl ScopedHandle {
    pub fn new(open_handle: HANDLE) -> Self {
        ScopedHandle(open_handle)
    }

    pub fn null() -> Self {
        ScopedHandle(ptr::null_mut())
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE
    }

    pub fn get(&self) -> HANDLE {
        self.0
    }

    /// Closes the currently held handle, then adopts `new_handle`.
    pub fn reset(&mut self, new_handle: HANDLE) {
        self.close();
        self.0 = new_handle;
    }

    /// Closes the currently held handle.
    pub fn clear(&mut self) {
        self.reset(ptr::null_mut());
    }

    /// Moves the handle out, leaving this wrapper empty.
    pub fn take(&mut self) -> ScopedHandle {
        ScopedHandle(mem::replace(&mut self.0, ptr::null_mut()))
    }

    fn close(&mut self) {
        if self.is_valid() {
            let closed = unsafe { CloseHandle(self.0) };
            debug_assert!(closed != 0, "CloseHandle failed");
        }
    }
}

impl Default for ScopedHandle {
    fn default() -> Self {
        ScopedHandle::null()
    }
}

impl Drop for ScopedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windows_sys::Win32::System::IO::CreateIoCompletionPort;

    fn new_port_handle() -> HANDLE {
        unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, ptr::null_mut(), 0, 0) }
    }

    #[test]
    fn null_and_sentinel_are_invalid() {
        assert!(!ScopedHandle::null().is_valid());
        assert!(!ScopedHandle::new(INVALID_HANDLE_VALUE).is_valid());
    }

    #[test]
    fn owns_a_real_handle() {
        let handle = ScopedHandle::new(new_port_handle());
        assert!(handle.is_valid());
    }

    #[test]
    fn take_moves_ownership() {
        let mut first = ScopedHandle::new(new_port_handle());
        let raw = first.get();
        let second = first.take();
        assert!(!first.is_valid());
        assert!(second.is_valid());
        assert_eq!(second.get(), raw);
    }

    #[test]
    fn reset_replaces_the_handle() {
        let mut handle = ScopedHandle::new(new_port_handle());
        let replacement = new_port_handle();
        handle.reset(replacement);
        assert_eq!(handle.get(), replacement);
        handle.clear();
        assert!(!handle.is_valid());
    }
}
