//! Attaching an image file to a loop device.
//!
//! The erofs driver mounts block devices, so the image is exposed through a read-only loop device
//! configured with `LOOP_CONFIGURE`.  The device is set up with `LO_FLAGS_AUTOCLEAR`, so the
//! kernel releases it once the last user (our descriptor, then the erofs mount) goes away.

#![allow(unsafe_code)]

use std::{
    fmt,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
        unix::ffi::OsStrExt,
    },
    path::{Path, PathBuf},
};

use log::debug;
use rustix::{
    fs::{open, Mode, OFlags},
    io::{Errno, Result},
    ioctl::{ioctl, opcode, Opcode, Setter},
};

/// Flags for loop device configuration.
pub mod flags {
    /// Read-only loop device.
    pub const LO_FLAGS_READ_ONLY: u32 = 1;
    /// Automatically detach on last close.
    pub const LO_FLAGS_AUTOCLEAR: u32 = 4;
    /// Use direct I/O.
    pub const LO_FLAGS_DIRECT_IO: u32 = 16;
}

/// The erofs block size; the loop device uses the same.
pub const BLOCK_SIZE: u32 = 4096;

const LO_NAME_SIZE: usize = 64;
const LO_KEY_SIZE: usize = 32;

#[repr(C)]
#[derive(Default)]
struct LoopConfig {
    fd: u32,
    block_size: u32,
    info: LoopInfo64,
    reserved: [u64; 8],
}

#[repr(C)]
struct LoopInfo64 {
    lo_device: u64,
    lo_inode: u64,
    lo_rdevice: u64,
    lo_offset: u64,
    lo_sizelimit: u64,
    lo_number: u32,
    lo_encrypt_type: u32,
    lo_encrypt_key_size: u32,
    lo_flags: u32,
    lo_file_name: [u8; LO_NAME_SIZE],
    lo_crypt_name: [u8; LO_NAME_SIZE],
    lo_encrypt_key: [u8; LO_KEY_SIZE],
    lo_init: [u64; 2],
}

impl Default for LoopInfo64 {
    fn default() -> Self {
        Self {
            lo_device: 0,
            lo_inode: 0,
            lo_rdevice: 0,
            lo_offset: 0,
            lo_sizelimit: 0,
            lo_number: 0,
            lo_encrypt_type: 0,
            lo_encrypt_key_size: 0,
            lo_flags: 0,
            lo_file_name: [0; LO_NAME_SIZE],
            lo_crypt_name: [0; LO_NAME_SIZE],
            lo_encrypt_key: [0; LO_KEY_SIZE],
            lo_init: [0; 2],
        }
    }
}

// Custom ioctl for LOOP_CTL_GET_FREE which returns data in the return value
struct LoopCtlGetFree;

// Rustix seems to lack a built-in pattern for an ioctl that returns data by the syscall return
// value instead of the usual return-by-reference on the args parameter.  Bake our own.
unsafe impl rustix::ioctl::Ioctl for LoopCtlGetFree {
    type Output = std::ffi::c_int;

    const IS_MUTATING: bool = false;

    fn opcode(&self) -> Opcode {
        LOOP_CTL_GET_FREE
    }

    fn as_ptr(&mut self) -> *mut std::ffi::c_void {
        std::ptr::null_mut()
    }

    unsafe fn output_from_ptr(
        out: rustix::ioctl::IoctlOutput,
        _ptr: *mut std::ffi::c_void,
    ) -> Result<std::ffi::c_int> {
        Ok(out)
    }
}

const LOOP_CTL_GET_FREE: Opcode = opcode::none(0x4C, 0x82);
// #define LOOP_CONFIGURE         0x4C0A
const LOOP_CONFIGURE: Opcode = opcode::write::<LoopConfig>(0x4C, 0x0A);

/// An attached loop device.
///
/// Holds an open descriptor to the device node.  Dropping it closes the descriptor; because of
/// autoclear, the kernel detaches the device as soon as nothing else (such as a mount) uses it.
pub struct LoopDevice {
    path: PathBuf,
    fd: OwnedFd,
}

impl LoopDevice {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AsRef<Path> for LoopDevice {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

impl AsFd for LoopDevice {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl fmt::Debug for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LoopDevice")
            .field("path", &self.path)
            .field("fd", &self.fd.as_raw_fd())
            .finish()
    }
}

impl Drop for LoopDevice {
    fn drop(&mut self) {
        debug!("closing {}", self.path.display());
    }
}

/// Copies `label` into a `lo_file_name` field, truncating it so the result stays NUL-terminated.
fn file_name_field(label: &Path) -> [u8; LO_NAME_SIZE] {
    let mut field = [0u8; LO_NAME_SIZE];
    let bytes = label.as_os_str().as_bytes();
    let len = bytes.len().min(LO_NAME_SIZE - 1);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Attaches `backing` to a free loop device: read-only, direct I/O, autoclear, 4096 byte blocks.
///
/// `label` (usually the image path) shows up as the device's backing file name.
pub fn attach(backing: impl AsFd, label: Option<&Path>) -> Result<LoopDevice> {
    let control = open(
        "/dev/loop-control",
        OFlags::RDWR | OFlags::CLOEXEC,
        Mode::empty(),
    )?;
    let free = unsafe { ioctl(&control, LoopCtlGetFree) };
    drop(control);

    let free = free?;
    if free < 0 {
        return Err(Errno::NODEV);
    }

    let path = PathBuf::from(format!("/dev/loop{free}"));
    let fd = open(&path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty())?;

    let config = LoopConfig {
        fd: backing.as_fd().as_raw_fd() as u32,
        block_size: BLOCK_SIZE,
        info: LoopInfo64 {
            lo_flags: flags::LO_FLAGS_READ_ONLY
                | flags::LO_FLAGS_DIRECT_IO
                | flags::LO_FLAGS_AUTOCLEAR,
            lo_file_name: label.map(file_name_field).unwrap_or([0; LO_NAME_SIZE]),
            ..Default::default()
        },
        reserved: [0; 8],
    };

    // fd is closed on the error path by OwnedFd
    unsafe {
        ioctl(&fd, Setter::<{ LOOP_CONFIGURE }, LoopConfig>::new(config))?;
    }

    debug!("attached image to {}", path.display());
    Ok(LoopDevice { path, fd })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_name_is_truncated_and_terminated() {
        let long = PathBuf::from(format!("/{}", "x".repeat(100)));
        let field = file_name_field(&long);
        assert_eq!(field[0], b'/');
        assert_eq!(field[LO_NAME_SIZE - 2], b'x');
        assert_eq!(field[LO_NAME_SIZE - 1], 0);

        let field = file_name_field(Path::new("/img.cfs"));
        assert_eq!(&field[..9], b"/img.cfs\0");
    }

    #[test]
    fn loop_config_layout() {
        // struct loop_config from <linux/loop.h>
        assert_eq!(size_of::<LoopInfo64>(), 232);
        assert_eq!(size_of::<LoopConfig>(), 304);
    }

    #[test]
    fn attach_not_root() {
        // Without root this has to fail cleanly rather than panic
        let mut tf = tempfile::NamedTempFile::new().unwrap();
        tf.write_all(&[0u8; 4096]).unwrap();
        tf.flush().unwrap();

        let file = std::fs::File::open(tf.path()).unwrap();
        let result = attach(&file, Some(tf.path()));

        if !rustix::process::getuid().is_root() {
            assert!(result.is_err());
        }
    }
}
