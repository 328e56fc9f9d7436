//! Mounting composefs images.
//!
//! A composefs image is an erofs filesystem containing only metadata: every regular file in it
//! refers, by an overlayfs "redirect" xattr, to a content-addressed object in one or more object
//! directories.  Mounting one means attaching the image to a loop device, mounting the erofs
//! filesystem somewhere private, and composing an overlayfs on the final mountpoint that uses the
//! erofs mount as its lower layer and the object directories as data-only layers.
//!
//! The entry points are [`mount::mount_from_fd()`] and [`mount::mount_from_path()`].  Either the
//! final mountpoint ends up with the composed overlay, or the call fails and every intermediate
//! kernel object (loop device, filesystem context, detached mount, temporary directory) has been
//! released.

#![deny(unsafe_code)]

pub mod error;
pub mod erofs;
mod fallback;
pub mod fsverity;
pub mod header;
pub mod loopback;
pub mod mount;
pub mod options;
pub mod overlay;
pub mod sys;


pub use error::MountError;
pub use mount::{mount_from_fd, mount_from_path};
pub use options::{MountFlags, MountOptions};

/// The "source" of the overlayfs mount.  It isn't meaningful to the kernel, but it identifies the
/// software that created the mount in `/proc/self/mountinfo`.
pub const MOUNT_SOURCE: &str = "composefs";
