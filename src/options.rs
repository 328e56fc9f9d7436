//! Mount options and their validation.

use std::{
    fmt,
    ops::BitOr,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    path::PathBuf,
};

use hex::FromHexError;
use thiserror::Error;

use crate::fsverity::Digest;

/// Flags controlling how an image is mounted.
///
/// This is a plain bit set rather than an enum so that values coming from outside (for example a
/// C caller or a config file) can carry bits we don't know, which validation then rejects.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MountFlags(u32);

impl MountFlags {
    pub const NONE: MountFlags = MountFlags(0);
    /// Require that every file in the image has a matching fs-verity digest in the object store.
    pub const REQUIRE_VERITY: MountFlags = MountFlags(1 << 0);
    /// Make the final mount read-only.
    pub const READONLY: MountFlags = MountFlags(1 << 1);
    /// Make the erofs mount ID-mapped (needs [`MountOptions::idmap_fd`]).
    pub const IDMAP: MountFlags = MountFlags(1 << 3);
    /// Like `REQUIRE_VERITY`, but only if the kernel supports it.
    pub const TRY_VERITY: MountFlags = MountFlags(1 << 4);
    /// Mount the overlay with `volatile`, if the kernel supports it.
    pub const VOLATILE: MountFlags = MountFlags(1 << 5);

    /// Every flag we know about.
    pub const MASK: u32 = Self::REQUIRE_VERITY.0
        | Self::READONLY.0
        | Self::IDMAP.0
        | Self::TRY_VERITY.0
        | Self::VOLATILE.0;

    /// Wraps raw bits without checking them; see [`MountOptions::validate()`].
    pub const fn from_bits_retain(bits: u32) -> Self {
        MountFlags(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: MountFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: MountFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: MountFlags) {
        self.0 &= !other.0;
    }

    /// Bits that don't correspond to any known flag.
    pub const fn unknown_bits(self) -> u32 {
        self.0 & !Self::MASK
    }
}

impl BitOr for MountFlags {
    type Output = MountFlags;

    fn bitor(self, rhs: MountFlags) -> MountFlags {
        MountFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for MountFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const NAMES: [(MountFlags, &str); 5] = [
            (MountFlags::REQUIRE_VERITY, "REQUIRE_VERITY"),
            (MountFlags::READONLY, "READONLY"),
            (MountFlags::IDMAP, "IDMAP"),
            (MountFlags::TRY_VERITY, "TRY_VERITY"),
            (MountFlags::VOLATILE, "VOLATILE"),
        ];
        let mut set = f.debug_set();
        for (flag, name) in NAMES {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        if self.unknown_bits() != 0 {
            set.entry(&format_args!("{:#x}", self.unknown_bits()));
        }
        set.finish()
    }
}

/// The options were rejected before anything was touched.
#[derive(Error, Debug, PartialEq)]
pub enum OptionsError {
    #[error("unknown mount flags {0:#x}")]
    UnknownFlags(u32),
    #[error("at least one object directory is required")]
    NoObjectDirs,
    #[error("upperdir and workdir must be given together")]
    UnpairedUpperWork,
    #[error("invalid fs-verity digest: {0}")]
    InvalidDigest(#[from] FromHexError),
    #[error("ID-mapping requested without a user namespace")]
    MissingIdmapFd,
}

/// How to mount a composefs image.
#[derive(Debug, Default)]
pub struct MountOptions {
    pub flags: MountFlags,
    /// Object directories, added as data-only overlay layers in this order.
    pub objdirs: Vec<PathBuf>,
    pub upperdir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
    /// The fs-verity digest the image must have, in hex.
    pub expected_digest: Option<String>,
    /// A user namespace (e.g. `/proc/PID/ns/user`) used for ID-mapping with [`MountFlags::IDMAP`].
    pub idmap_fd: Option<OwnedFd>,
    /// Where to mount the erofs image while the overlay is assembled.  If unset, a private
    /// temporary directory is used and removed afterwards.  A directory given here is left in
    /// place.
    pub image_mountdir: Option<PathBuf>,
}

impl MountOptions {
    /// Options for an image backed by a single object directory.
    pub fn new(objdir: impl Into<PathBuf>) -> Self {
        MountOptions {
            objdirs: vec![objdir.into()],
            ..Default::default()
        }
    }

    pub fn has(&self, flag: MountFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn idmap(&self) -> Option<BorrowedFd<'_>> {
        match self.has(MountFlags::IDMAP) {
            true => self.idmap_fd.as_ref().map(|fd| fd.as_fd()),
            false => None,
        }
    }

    /// Checks the options for consistency and decodes the expected digest, if any.
    ///
    /// This does no I/O.
    pub fn validate(&self) -> Result<Option<Digest>, OptionsError> {
        if self.flags.unknown_bits() != 0 {
            return Err(OptionsError::UnknownFlags(self.flags.unknown_bits()));
        }

        if self.objdirs.is_empty() {
            return Err(OptionsError::NoObjectDirs);
        }

        if self.upperdir.is_some() != self.workdir.is_some() {
            return Err(OptionsError::UnpairedUpperWork);
        }

        let digest = self
            .expected_digest
            .as_deref()
            .map(Digest::from_hex)
            .transpose()?;

        if self.has(MountFlags::IDMAP) && self.idmap_fd.is_none() {
            return Err(OptionsError::MissingIdmapFd);
        }

        Ok(digest)
    }
}
