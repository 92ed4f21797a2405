// Directory junctions via FSCTL_*_REPARSE_POINT.

use super::buffer::{self, MountPointData, MAXIMUM_REPARSE_DATA_BUFFER_SIZE};
use crate::error::{CacheError, Result};
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::iter::once;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::ptr;
use tracing::warn;
use windows_sys::Win32::Foundation::{CloseHandle, HANDLE, INVALID_HANDLE_VALUE};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, GetFileAttributesW, SetFileAttributesW, FILE_ATTRIBUTE_HIDDEN,
    FILE_ATTRIBUTE_REPARSE_POINT, FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OPEN_REPARSE_POINT,
    FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, INVALID_FILE_ATTRIBUTES,
    OPEN_EXISTING,
};
use windows_sys::Win32::System::Ioctl::{
    FSCTL_DELETE_REPARSE_POINT, FSCTL_GET_REPARSE_POINT, FSCTL_SET_REPARSE_POINT,
};
use windows_sys::Win32::System::IO::DeviceIoControl;

const GENERIC_READ: u32 = 0x8000_0000;
const GENERIC_WRITE: u32 = 0x4000_0000;

/// Closes the wrapped handle on drop.
struct Handle(HANDLE);

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

fn wide(path: &Path) -> Vec<u16> {
    OsStr::new(path).encode_wide().chain(once(0)).collect()
}

fn open_reparse_point(path: &Path, access: u32) -> io::Result<Handle> {
    let path_w = wide(path);
    let handle = unsafe {
        CreateFileW(
            path_w.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
            ptr::null(),
            OPEN_EXISTING,
            FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OPEN_REPARSE_POINT,
            0 as HANDLE,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(Handle(handle))
}

fn control(handle: &Handle, code: u32, input: &[u8], output: &mut [u8]) -> io::Result<usize> {
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            handle.0,
            code,
            if input.is_empty() {
                ptr::null()
            } else {
                input.as_ptr().cast()
            },
            input.len() as u32,
            if output.is_empty() {
                ptr::null_mut()
            } else {
                output.as_mut_ptr().cast()
            },
            output.len() as u32,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(returned as usize)
}

pub(super) fn create_redirection(mount: &Path, target: &Path) -> Result<()> {
    let target_text = target.to_str().ok_or_else(|| CacheError::InvalidReparseData {
        reason: format!("target is not valid unicode: {}", target.display()),
    })?;
    let data = MountPointData::for_target(target_text).encode()?;

    fs::create_dir(mount).map_err(|e| CacheError::io(e, "creating mount directory", mount))?;

    let result = open_reparse_point(mount, GENERIC_WRITE)
        .and_then(|handle| control(&handle, FSCTL_SET_REPARSE_POINT, &data, &mut []));

    if let Err(e) = result {
        // leave no empty directory behind
        if let Err(cleanup) = fs::remove_dir(mount) {
            warn!("Failed to remove {} after junction failure: {}", mount.display(), cleanup);
        }
        return Err(CacheError::io(e, "setting reparse point", mount));
    }
    Ok(())
}

pub(super) fn remove_redirection(mount: &Path) -> Result<()> {
    let handle = open_reparse_point(mount, GENERIC_WRITE)
        .map_err(|e| CacheError::io(e, "opening reparse point", mount))?;
    control(&handle, FSCTL_DELETE_REPARSE_POINT, &buffer::delete_header(), &mut [])
        .map_err(|e| CacheError::io(e, "deleting reparse point", mount))?;
    drop(handle);

    fs::remove_dir(mount).map_err(|e| CacheError::io(e, "removing mount directory", mount))
}

pub(super) fn is_redirection(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_attributes() & FILE_ATTRIBUTE_REPARSE_POINT != 0)
        .unwrap_or(false)
}

pub(super) fn read_target(mount: &Path) -> Result<PathBuf> {
    let handle = open_reparse_point(mount, GENERIC_READ)
        .map_err(|e| CacheError::io(e, "opening reparse point", mount))?;
    let mut out = vec![0u8; MAXIMUM_REPARSE_DATA_BUFFER_SIZE];
    let len = control(&handle, FSCTL_GET_REPARSE_POINT, &[], &mut out)
        .map_err(|e| CacheError::io(e, "reading reparse point", mount))?;
    let data = MountPointData::decode(&out[..len])?;
    Ok(PathBuf::from(data.target()))
}

pub(super) fn set_hidden(path: &Path, hidden: bool) -> Result<()> {
    let path_w = wide(path);
    let attributes = unsafe { GetFileAttributesW(path_w.as_ptr()) };
    if attributes == INVALID_FILE_ATTRIBUTES {
        return Err(CacheError::io(io::Error::last_os_error(), "reading attributes", path));
    }
    let updated = if hidden {
        attributes | FILE_ATTRIBUTE_HIDDEN
    } else {
        attributes & !FILE_ATTRIBUTE_HIDDEN
    };
    if updated != attributes && unsafe { SetFileAttributesW(path_w.as_ptr(), updated) } == 0 {
        return Err(CacheError::io(io::Error::last_os_error(), "setting attributes", path));
    }
    Ok(())
}
