//! Mounting a composefs image, start to finish.
//!
//! The sequence is: validate the options, check the image's fs-verity digest, read the header,
//! attach the image to a loop device, mount the erofs filesystem on a private directory, mount
//! the overlayfs on the final mountpoint, and detach the erofs mount again (the overlay keeps it
//! alive).  Every intermediate resource is owned by a value whose `Drop` releases it, so any
//! early return unwinds whatever was set up so far.

use std::{
    fs::File,
    os::fd::{AsFd, BorrowedFd},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use tempfile::TempDir;

use crate::{
    erofs::mount_erofs,
    error::MountError,
    fsverity::{self, Digest},
    header::ImageHeader,
    options::MountOptions,
    overlay::mount_overlay,
    sys::{Linux, MountApi, SysResultExt},
};

/// Everything known about one mount attempt.
struct MountState<'a> {
    fd: BorrowedFd<'a>,
    /// Where the image came from, if it was opened by path.  Only used as a label.
    image_path: Option<&'a Path>,
    mountpoint: &'a Path,
    options: &'a MountOptions,
    expected_digest: Option<Digest>,
}

/// The directory the erofs image gets mounted on.
enum ImageDir {
    /// Created by us; removed when dropped.
    Temporary(TempDir),
    /// Given by the caller; left alone.
    Caller(PathBuf),
}

impl ImageDir {
    fn new(options: &MountOptions) -> Result<Self, MountError> {
        Ok(match &options.image_mountdir {
            Some(dir) => ImageDir::Caller(dir.clone()),
            None => ImageDir::Temporary(tempfile::Builder::new().prefix(".composefs.").tempdir()?),
        })
    }

    fn path(&self) -> &Path {
        match self {
            ImageDir::Temporary(tmp) => tmp.path(),
            ImageDir::Caller(dir) => dir,
        }
    }
}

/// The erofs image, mounted on an [`ImageDir`].
///
/// Dropping this detaches the mount, then removes the directory if it was ours.
struct ImageMount<'a, A: MountApi> {
    api: &'a A,
    dir: ImageDir,
}

impl<A: MountApi> ImageMount<'_, A> {
    fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl<A: MountApi> Drop for ImageMount<'_, A> {
    fn drop(&mut self) {
        let path = self.dir.path().to_path_buf();
        if let Err(err) = self.api.unmount(&path) {
            warn!("failed to detach image mount at {}: {err}", path.display());
            // never recursively delete a directory that may still have the image mounted on it
            if let ImageDir::Temporary(tmp) =
                std::mem::replace(&mut self.dir, ImageDir::Caller(path))
            {
                std::mem::forget(tmp);
            }
            return;
        }
        debug!("detached image mount at {}", path.display());
    }
}

/// Mounts composefs images through a [`MountApi`].
#[derive(Debug, Default)]
pub struct Mounter<A: MountApi = Linux> {
    api: A,
}

impl<A: MountApi> Mounter<A> {
    pub fn new(api: A) -> Self {
        Mounter { api }
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    /// Mounts the image open on `fd` at `mountpoint`.
    pub fn mount_fd(
        &self,
        fd: impl AsFd,
        mountpoint: impl AsRef<Path>,
        options: &MountOptions,
    ) -> Result<(), MountError> {
        let expected_digest = options.validate()?;
        self.mount(MountState {
            fd: fd.as_fd(),
            image_path: None,
            mountpoint: mountpoint.as_ref(),
            options,
            expected_digest,
        })
    }

    /// Opens the image at `path` read-only and mounts it at `mountpoint`.
    ///
    /// The options are validated before the image is opened.
    pub fn mount_path(
        &self,
        path: impl AsRef<Path>,
        mountpoint: impl AsRef<Path>,
        options: &MountOptions,
    ) -> Result<(), MountError> {
        let path = path.as_ref();
        let expected_digest = options.validate()?;
        let image = File::open(path)?;
        self.mount(MountState {
            fd: image.as_fd(),
            image_path: Some(path),
            mountpoint: mountpoint.as_ref(),
            options,
            expected_digest,
        })
    }

    fn mount(&self, state: MountState<'_>) -> Result<(), MountError> {
        // The header lives inside the region covered by the digest, so check that first.
        fsverity::verify(&self.api, state.fd, state.expected_digest.as_ref())?;
        let header = ImageHeader::read(state.fd)?;
        debug!("composefs image flags {:#x}", header.flags);

        self.mount_erofs_overlay(&state, header)
    }

    fn mount_erofs_overlay(
        &self,
        state: &MountState<'_>,
        header: ImageHeader,
    ) -> Result<(), MountError> {
        let options = state.options;

        let loopdev = self
            .api
            .attach_loop(state.fd, state.image_path)
            .during("attach loop device")?;

        let dir = ImageDir::new(options)?;

        let erofs = mount_erofs(
            &self.api,
            loopdev.as_ref(),
            dir.path(),
            header,
            options.idmap(),
        );
        // The erofs mount, if any, holds its own reference to the loop device.
        drop(loopdev);
        erofs?;

        let image = ImageMount { api: &self.api, dir };
        debug!("image mounted at {}", image.path().display());

        mount_overlay(&self.api, image.path(), options, state.mountpoint)
        // image dropped here: the overlay pins the erofs mount, so detaching it is safe
    }
}

/// Mounts the composefs image open on `fd` at `mountpoint`.
pub fn mount_from_fd(
    fd: impl AsFd,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), MountError> {
    Mounter::new(Linux).mount_fd(fd, mountpoint, options)
}

/// Mounts the composefs image at `path` on `mountpoint`.
pub fn mount_from_path(
    path: impl AsRef<Path>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), MountError> {
    Mounter::new(Linux).mount_path(path, mountpoint, options)
}
