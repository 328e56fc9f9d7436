//! The kernel interface used by the mount builders.
//!
//! Every privileged operation goes through the [`MountApi`] trait.  [`Linux`] is the real
//! implementation on top of rustix; tests substitute a recording mock.  All operations report
//! failure as a [`SysError`], where a missing syscall (`ENOSYS`) is always turned into
//! [`SysError::Unsupported`] so that callers deal with "this kernel can't do that" as a branch of
//! its own rather than by comparing errno values.

#![allow(unsafe_code)]

use std::{
    ffi::{CString, OsStr},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
        unix::ffi::OsStrExt,
    },
    path::Path,
};

use log::debug;
use rustix::{
    fs::CWD,
    io::Errno,
    mount::{
        fsconfig_create, fsconfig_set_flag, fsconfig_set_string, fsmount, fsopen, move_mount,
        unmount, FsMountFlags, FsOpenFlags, MountAttrFlags, MountFlags, MoveMountFlags,
        UnmountFlags,
    },
};
use thiserror::Error;

use crate::{
    error::MountError,
    fsverity::{Digest, MeasureVerityError},
    loopback::LoopDevice,
};

/// A failed kernel operation.
#[derive(Error, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SysError {
    /// The running kernel doesn't implement the operation at all.
    #[error("not supported by the running kernel")]
    Unsupported,
    /// The operation exists but failed.
    #[error("{0}")]
    Os(Errno),
}

impl From<Errno> for SysError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::NOSYS => SysError::Unsupported,
            other => SysError::Os(other),
        }
    }
}

impl SysError {
    /// True if this is the given errno.
    pub fn is(&self, errno: Errno) -> bool {
        *self == SysError::Os(errno)
    }
}

pub type SysResult<T> = Result<T, SysError>;

pub(crate) trait SysResultExt<T> {
    /// Turns a kernel failure into a [`MountError`] naming the operation.
    fn during(self, op: &'static str) -> Result<T, MountError>;
}

impl<T> SysResultExt<T> for SysResult<T> {
    fn during(self, op: &'static str) -> Result<T, MountError> {
        self.map_err(|err| match err {
            SysError::Unsupported => MountError::NotSupported { op },
            SysError::Os(source) => MountError::Os { op, source },
        })
    }
}

/// The privileged operations needed to assemble a composefs mount.
///
/// The associated types own kernel resources: dropping them closes the underlying descriptors.
pub trait MountApi {
    /// An open filesystem context (from `fsopen()`).
    type Context;
    /// A detached mount (from `fsmount()`).
    type Mount;
    /// An attached loop device.  Its path is used as the erofs mount source.
    type Loop: AsRef<Path>;

    fn fsopen(&self, fstype: &str) -> SysResult<Self::Context>;
    fn fsconfig_set_flag(&self, fs: &Self::Context, key: &str) -> SysResult<()>;
    fn fsconfig_set_string(&self, fs: &Self::Context, key: &str, value: &OsStr) -> SysResult<()>;
    fn fsconfig_create(&self, fs: &Self::Context) -> SysResult<()>;
    fn fsmount(&self, fs: &Self::Context, attrs: MountAttrFlags) -> SysResult<Self::Mount>;
    /// Makes a detached mount ID-mapped according to the given user namespace.
    fn mount_setattr_idmap(&self, mnt: &Self::Mount, userns: BorrowedFd<'_>) -> SysResult<()>;
    /// Attaches a detached mount at `target`.
    fn move_mount(&self, mnt: &Self::Mount, target: &Path) -> SysResult<()>;

    /// The legacy `mount()` call.
    fn mount(
        &self,
        source: &OsStr,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: Option<&OsStr>,
    ) -> SysResult<()>;
    /// Lazily detaches whatever is mounted at `target`.
    fn unmount(&self, target: &Path) -> SysResult<()>;

    fn attach_loop(&self, backing: BorrowedFd<'_>, label: Option<&Path>) -> SysResult<Self::Loop>;
    fn measure_verity(&self, fd: BorrowedFd<'_>) -> Result<Digest, MeasureVerityError>;
}

/// A handle to a filesystem context created via the modern mount API.
///
/// When dropped, any messages the kernel queued on the context (usually explaining why an
/// `fsconfig()` call was rejected) are forwarded to the log.
#[derive(Debug)]
pub struct FsHandle {
    pub fd: OwnedFd,
}

impl FsHandle {
    pub fn open(name: &str) -> rustix::io::Result<FsHandle> {
        Ok(FsHandle {
            fd: fsopen(name, FsOpenFlags::FSOPEN_CLOEXEC)?,
        })
    }
}

impl AsFd for FsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Drop for FsHandle {
    fn drop(&mut self) {
        let mut buffer = [0u8; 1024];
        loop {
            match rustix::io::read(&self.fd, &mut buffer) {
                Err(_) => return, // ENODATA, among others?
                Ok(0) => return,
                Ok(size) => debug!("kernel: {}", String::from_utf8_lossy(&buffer[0..size])),
            }
        }
    }
}

// See /usr/include/linux/mount.h
#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

const MOUNT_ATTR_IDMAP: u64 = 0x0010_0000;

/// The running Linux kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct Linux;

impl MountApi for Linux {
    type Context = FsHandle;
    type Mount = OwnedFd;
    type Loop = LoopDevice;

    fn fsopen(&self, fstype: &str) -> SysResult<FsHandle> {
        Ok(FsHandle::open(fstype)?)
    }

    fn fsconfig_set_flag(&self, fs: &FsHandle, key: &str) -> SysResult<()> {
        Ok(fsconfig_set_flag(fs.as_fd(), key)?)
    }

    fn fsconfig_set_string(&self, fs: &FsHandle, key: &str, value: &OsStr) -> SysResult<()> {
        Ok(fsconfig_set_string(fs.as_fd(), key, value)?)
    }

    fn fsconfig_create(&self, fs: &FsHandle) -> SysResult<()> {
        Ok(fsconfig_create(fs.as_fd())?)
    }

    fn fsmount(&self, fs: &FsHandle, attrs: MountAttrFlags) -> SysResult<OwnedFd> {
        Ok(fsmount(fs.as_fd(), FsMountFlags::FSMOUNT_CLOEXEC, attrs)?)
    }

    fn mount_setattr_idmap(&self, mnt: &OwnedFd, userns: BorrowedFd<'_>) -> SysResult<()> {
        // rustix has no wrapper for mount_setattr(2)
        let attr = MountAttr {
            attr_set: MOUNT_ATTR_IDMAP,
            attr_clr: 0,
            propagation: 0,
            userns_fd: userns.as_raw_fd() as u64,
        };
        let res = unsafe {
            libc::syscall(
                libc::SYS_mount_setattr,
                mnt.as_raw_fd(),
                c"".as_ptr(),
                libc::AT_EMPTY_PATH,
                &attr as *const MountAttr,
                size_of::<MountAttr>(),
            )
        };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            return Err(Errno::from_raw_os_error(err.raw_os_error().unwrap_or(libc::EIO)).into());
        }
        Ok(())
    }

    fn move_mount(&self, mnt: &OwnedFd, target: &Path) -> SysResult<()> {
        Ok(move_mount(
            mnt.as_fd(),
            "",
            CWD,
            target,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )?)
    }

    fn mount(
        &self,
        source: &OsStr,
        target: &Path,
        fstype: &str,
        flags: MountFlags,
        data: Option<&OsStr>,
    ) -> SysResult<()> {
        let data = data
            .map(|data| CString::new(data.as_bytes()))
            .transpose()
            .map_err(|_| SysError::Os(Errno::INVAL))?;
        Ok(rustix::mount::mount(source, target, fstype, flags, data.as_deref())?)
    }

    fn unmount(&self, target: &Path) -> SysResult<()> {
        Ok(unmount(target, UnmountFlags::DETACH)?)
    }

    fn attach_loop(&self, backing: BorrowedFd<'_>, label: Option<&Path>) -> SysResult<LoopDevice> {
        Ok(crate::loopback::attach(backing, label)?)
    }

    fn measure_verity(&self, fd: BorrowedFd<'_>) -> Result<Digest, MeasureVerityError> {
        crate::fsverity::measure_verity(fd)
    }
}
