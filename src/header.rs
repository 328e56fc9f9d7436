//! The composefs header at the start of every image.
//!
//! This is the only part of the image that is interpreted in userspace: the rest is handed to the
//! kernel erofs driver.

use std::os::fd::AsFd;

use zerocopy::{little_endian::U32, FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::MountError;

pub const COMPOSEFS_MAGIC: u32 = 0xd078629a;

/// Set if the image contains POSIX ACLs.
pub const COMPOSEFS_FLAGS_HAS_ACL: u32 = 1 << 0;

/// The on-disk header, little-endian.
#[derive(Debug, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ComposefsHeader {
    pub magic: U32,
    pub version: U32,
    pub flags: U32,
    pub composefs_version: U32,
    pub unused: [U32; 4],
}

pub const HEADER_SIZE: usize = size_of::<ComposefsHeader>();

/// The parts of the header that influence how the image gets mounted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageHeader {
    pub flags: u32,
}

impl ImageHeader {
    /// Reads and checks the header of the image open on `fd`, with a single `pread()` at offset 0.
    ///
    /// The image's fs-verity digest must have been checked before calling this if the caller
    /// wants the flags to be trustworthy.
    pub fn read(fd: impl AsFd) -> Result<Self, MountError> {
        let mut buf = [0u8; HEADER_SIZE];
        let n = rustix::io::pread(fd, &mut buf, 0).map_err(|source| MountError::Os {
            op: "read image header",
            source,
        })?;
        if n != HEADER_SIZE {
            return Err(MountError::ShortHeader);
        }
        Self::parse(&buf)
    }

    pub fn parse(buf: &[u8; HEADER_SIZE]) -> Result<Self, MountError> {
        let header = ComposefsHeader::ref_from_bytes(buf).map_err(|_| MountError::ShortHeader)?;
        match header.magic.get() {
            COMPOSEFS_MAGIC => Ok(ImageHeader {
                flags: header.flags.get(),
            }),
            other => Err(MountError::BadMagic(other)),
        }
    }

    pub fn has_acl(&self) -> bool {
        self.flags & COMPOSEFS_FLAGS_HAS_ACL != 0
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn header_bytes(magic: u32, flags: u32) -> Vec<u8> {
        ComposefsHeader {
            magic: magic.into(),
            version: 1.into(),
            flags: flags.into(),
            composefs_version: 2.into(),
            ..Default::default()
        }
        .as_bytes()
        .to_vec()
    }

    #[test]
    fn header_is_32_bytes() {
        assert_eq!(HEADER_SIZE, 32);
    }

    #[test]
    fn reads_flags() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&header_bytes(COMPOSEFS_MAGIC, COMPOSEFS_FLAGS_HAS_ACL))
            .unwrap();
        file.write_all(&[0u8; 4096]).unwrap();

        let header = ImageHeader::read(&file).unwrap();
        assert!(header.has_acl());

        let header = ImageHeader::parse(
            header_bytes(COMPOSEFS_MAGIC, 0)
                .first_chunk::<HEADER_SIZE>()
                .unwrap(),
        )
        .unwrap();
        assert!(!header.has_acl());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut file = tempfile::tempfile().unwrap();
        // an erofs superblock magic at offset 0 is still not a composefs image
        file.write_all(&header_bytes(0xE0F5E1E2, 0)).unwrap();
        assert!(matches!(
            ImageHeader::read(&file),
            Err(MountError::BadMagic(0xE0F5E1E2))
        ));
    }

    #[test]
    fn rejects_short_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&header_bytes(COMPOSEFS_MAGIC, 0)[..20]).unwrap();
        assert!(matches!(
            ImageHeader::read(&file),
            Err(MountError::ShortHeader)
        ));

        let empty = tempfile::tempfile().unwrap();
        assert!(matches!(
            ImageHeader::read(&empty),
            Err(MountError::ShortHeader)
        ));
    }
}
