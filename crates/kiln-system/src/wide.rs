use std::{ffi::OsStr, iter, os::windows::ffi::OsStrExt as _};

/// Encode for a Win32 wide-string parameter, appending the terminating nul.
pub(crate) fn nul_terminated(s: impl AsRef<OsStr>) -> Vec<u16> {
    s.as_ref().encode_wide().chain(iter::once(0)).collect()
}
