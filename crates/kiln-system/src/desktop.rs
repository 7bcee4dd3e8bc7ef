//! Desktop workspaces: the UI isolation surface the child is confined to.

use crate::wide;
use anyhow::{Context as _, Result};
use slog::{warn, Logger};
use std::{io, ptr};
use windows_sys::Win32::{
    Foundation::{FALSE, GENERIC_ALL},
    System::StationsAndDesktops::{
        CloseDesktop, CreateDesktopExW, GetUserObjectInformationW, OpenInputDesktop,
        SetThreadDesktop, SwitchDesktop, HDESK, UOI_HEAPSIZE, UOI_NAME,
    },
};

/// A desktop within the current window station. Creating one does not switch
/// to it; activation is explicit and reversible via [`ScopedActivation`].
pub struct Desktop {
    handle: HDESK,
}

unsafe impl Send for Desktop {}

impl Desktop {
    /// Creates (or opens, if the name already exists) a desktop with the
    /// given heap quota in kilobytes.
    pub fn create(desktop_name: &str, heap_size_kb: u32) -> Result<Desktop> {
        let wide_name = wide::nul_terminated(desktop_name);
        let handle = unsafe {
            CreateDesktopExW(
                wide_name.as_ptr(),
                ptr::null(),
                ptr::null_mut(),
                0,
                GENERIC_ALL,
                ptr::null(),
                heap_size_kb,
                ptr::null_mut(),
            )
        };
        if handle.is_null() {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("creating desktop `{desktop_name}`"));
        }
        Ok(Desktop { handle })
    }

    /// The desktop currently receiving user input, if it can be opened.
    pub fn open_interactive() -> Option<Desktop> {
        let handle = unsafe { OpenInputDesktop(0, FALSE, GENERIC_ALL) };
        if handle.is_null() {
            return None;
        }
        Some(Desktop { handle })
    }

    /// Reads the desktop's name back from the OS. Diagnostics only.
    pub fn name(&self) -> Option<String> {
        let mut bytes_needed = 0u32;
        let probed = unsafe {
            GetUserObjectInformationW(
                self.handle,
                UOI_NAME,
                ptr::null_mut(),
                0,
                &mut bytes_needed,
            )
        };
        if probed == 0 && bytes_needed == 0 {
            return None;
        }
        let mut buffer = vec![0u16; (bytes_needed as usize).div_ceil(2)];
        let fetched = unsafe {
            GetUserObjectInformationW(
                self.handle,
                UOI_NAME,
                buffer.as_mut_ptr().cast(),
                (buffer.len() * 2) as u32,
                &mut bytes_needed,
            )
        };
        if fetched == 0 {
            return None;
        }
        let length = buffer.iter().position(|&unit| unit == 0).unwrap_or(buffer.len());
        Some(String::from_utf16_lossy(&buffer[..length]))
    }

    /// Reads the desktop's heap quota back, in kilobytes. Diagnostics only.
    pub fn heap_size(&self) -> Option<u32> {
        let mut heap_size_kb = 0u32;
        let mut bytes_needed = 0u32;
        let fetched = unsafe {
            GetUserObjectInformationW(
                self.handle,
                UOI_HEAPSIZE,
                (&mut heap_size_kb as *mut u32).cast(),
                std::mem::size_of::<u32>() as u32,
                &mut bytes_needed,
            )
        };
        if fetched == 0 {
            return None;
        }
        Some(heap_size_kb)
    }

    /// Rebinds the calling thread's desktop association.
    pub fn set_for_current_thread(&self) -> bool {
        unsafe { SetThreadDesktop(self.handle) != 0 }
    }

    fn activate(&self) -> bool {
        unsafe { SwitchDesktop(self.handle) != 0 }
    }
}

impl Drop for Desktop {
    fn drop(&mut self) {
        if !self.handle.is_null() {
            // Closing a desktop that still has assigned threads is tolerated;
            // the kernel keeps it alive until the last thread detaches.
            let closed = unsafe { CloseDesktop(self.handle) };
            debug_assert!(closed != 0, "CloseDesktop failed");
        }
    }
}

/// Makes `target` the foreground desktop for its lifetime and re-activates
/// whichever desktop was foreground at construction when dropped.
pub struct ScopedActivation {
    previous: Option<Desktop>,
    success: bool,
    log: Logger,
}

impl ScopedActivation {
    pub fn new(target: &Desktop, log: &Logger) -> Self {
        let previous = Desktop::open_interactive();
        let success = previous.is_some() && target.activate();
        ScopedActivation {
            previous,
            success,
            log: log.clone(),
        }
    }

    /// Whether both capturing the previous desktop and activating the target
    /// succeeded.
    pub fn success(&self) -> bool {
        self.success
    }
}

impl Drop for ScopedActivation {
    fn drop(&mut self) {
        if let Some(previous) = &self.previous {
            if !previous.activate() {
                warn!(self.log, "unable to restore the interactive desktop");
            }
        }
    }
}
