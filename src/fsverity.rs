//! fs-verity digests and the check that an image is the one the caller expects.

#![allow(unsafe_code)]

use std::{
    fmt,
    io::Error,
    os::fd::{AsFd, BorrowedFd},
    str::FromStr,
};

use hex::FromHexError;
use log::debug;
use rustix::{
    io::Errno,
    ioctl::{ioctl, opcode, Opcode, Updater},
};
use thiserror::Error;

use crate::{error::MountError, sys::MountApi};

/// The fs-verity algorithm identifier for SHA-256.
pub const FS_VERITY_HASH_ALG_SHA256: u8 = 1;

/// Size of a SHA-256 fs-verity digest, in bytes.
pub const DIGEST_SIZE: usize = 32;

/// A SHA-256 fs-verity digest in binary.
///
/// Digests compare by exact byte equality.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Digest([u8; DIGEST_SIZE]);

impl Digest {
    /// Parse a digest from its hexadecimal form (case insensitive).  The string must contain
    /// exactly 64 hex digits.
    pub fn from_hex(hex: impl AsRef<[u8]>) -> Result<Self, FromHexError> {
        let mut value = [0u8; DIGEST_SIZE];
        hex::decode_to_slice(hex.as_ref(), &mut value)?;
        Ok(Digest(value))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; DIGEST_SIZE]> for Digest {
    fn from(value: [u8; DIGEST_SIZE]) -> Self {
        Digest(value)
    }
}

impl FromStr for Digest {
    type Err = FromHexError;

    fn from_str(s: &str) -> Result<Self, FromHexError> {
        Digest::from_hex(s)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "sha256:{}", self.to_hex())
    }
}

/// Measuring fsverity failed.
#[derive(Error, Debug)] // can't derive PartialEq because of std::io::Error
pub enum MeasureVerityError {
    #[error("{0}")]
    Io(#[from] Error),
    #[error("fs-verity is not enabled on file")]
    VerityMissing,
    #[error("fs-verity is not supported by filesystem")]
    FilesystemNotSupported,
    #[error("Expected algorithm {expected}, found {found}")]
    InvalidDigestAlgorithm { expected: u16, found: u16 },
    #[error("Expected digest size {expected}")]
    InvalidDigestSize { expected: u16 },
}

// See /usr/include/linux/fsverity.h
#[repr(C)]
#[derive(Debug)]
struct FsVerityDigest<const N: usize> {
    digest_algorithm: u16,
    digest_size: u16,
    digest: [u8; N],
}

// #define FS_IOC_MEASURE_VERITY   _IORW('f', 134, struct fsverity_digest)
const FS_IOC_MEASURE_VERITY: Opcode = opcode::read_write::<FsVerityDigest<0>>(b'f', 134);

/// Measures the SHA-256 fs-verity digest of the given file.
///
/// This essentially boils down to the FS_IOC_MEASURE_VERITY ioctl.  If the file has fs-verity
/// enabled then the kernel guarantees that its content cannot change for as long as the file
/// descriptor exists, so the digest can be trusted for everything read through `fd` afterwards.
pub fn measure_verity(fd: impl AsFd) -> Result<Digest, MeasureVerityError> {
    let digest_size = DIGEST_SIZE as u16;
    let digest_algorithm = FS_VERITY_HASH_ALG_SHA256 as u16;

    let mut digest = FsVerityDigest::<DIGEST_SIZE> {
        digest_algorithm,
        digest_size,
        digest: [0u8; DIGEST_SIZE],
    };

    let r = unsafe {
        ioctl(
            fd,
            Updater::<{ FS_IOC_MEASURE_VERITY }, FsVerityDigest<DIGEST_SIZE>>::new(&mut digest),
        )
    };

    match r {
        Ok(()) => {
            if digest.digest_algorithm != digest_algorithm {
                return Err(MeasureVerityError::InvalidDigestAlgorithm {
                    expected: digest_algorithm,
                    found: digest.digest_algorithm,
                });
            }
            if digest.digest_size != digest_size {
                return Err(MeasureVerityError::InvalidDigestSize {
                    expected: digest_size,
                });
            }
            Ok(Digest(digest.digest))
        }
        Err(Errno::NODATA) => Err(MeasureVerityError::VerityMissing),
        Err(Errno::NOTTY | Errno::OPNOTSUPP) => Err(MeasureVerityError::FilesystemNotSupported),
        Err(Errno::OVERFLOW) => Err(MeasureVerityError::InvalidDigestSize {
            expected: digest.digest_size,
        }),
        Err(e) => Err(Error::from(e).into()),
    }
}

/// Checks that the fs-verity digest of `fd` is `expected`.
///
/// With no expected digest this does nothing at all: the file isn't even measured.  Otherwise a
/// failure to measure is reported as [`MountError::Measure`] and a different digest as
/// [`MountError::VerityMismatch`].
pub fn verify<A: MountApi>(
    api: &A,
    fd: BorrowedFd<'_>,
    expected: Option<&Digest>,
) -> Result<(), MountError> {
    let Some(expected) = expected else {
        return Ok(());
    };

    let found = api.measure_verity(fd)?;
    if found != *expected {
        return Err(MountError::VerityMismatch {
            expected: *expected,
            found,
        });
    }

    debug!("image fs-verity digest {found} matches");
    Ok(())
}
