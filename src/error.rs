//! Errors returned by the mount entry points.

use log::debug;
use rustix::io::Errno;
use thiserror::Error;

use crate::{
    fsverity::{Digest, MeasureVerityError},
    options::OptionsError,
};

/// The errno used to report that an image's fs-verity digest didn't match the expected one.
pub const EWRONGVERITY: Errno = Errno::ILSEQ;

/// The errno used to report that fs-verity isn't enabled on (or supported for) an image.
pub const ENOVERITY: Errno = Errno::NOTTY;

/// Mounting a composefs image failed.
///
/// Every error maps onto an errno via [`MountError::raw_os_error()`], for callers that speak the
/// C convention.
#[derive(Error, Debug)]
pub enum MountError {
    #[error("invalid mount options: {0}")]
    InvalidOptions(#[from] OptionsError),
    #[error("failed to measure fs-verity digest of image: {0}")]
    Measure(#[from] MeasureVerityError),
    #[error("fs-verity digest mismatch: expected {expected}, found {found}")]
    VerityMismatch { expected: Digest, found: Digest },
    #[error("image header is truncated")]
    ShortHeader,
    #[error("not a composefs image (magic {0:#010x})")]
    BadMagic(u32),
    #[error("{op} is not supported by the running kernel")]
    NotSupported { op: &'static str },
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: Errno,
    },
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl MountError {
    /// The errno corresponding to this error (positive, as in `errno`).
    pub fn raw_os_error(&self) -> i32 {
        match self {
            MountError::InvalidOptions(_) | MountError::ShortHeader | MountError::BadMagic(_) => {
                Errno::INVAL.raw_os_error()
            }
            MountError::Measure(MeasureVerityError::Io(err)) => {
                err.raw_os_error().unwrap_or(Errno::IO.raw_os_error())
            }
            MountError::Measure(
                MeasureVerityError::VerityMissing | MeasureVerityError::FilesystemNotSupported,
            ) => ENOVERITY.raw_os_error(),
            MountError::Measure(_) | MountError::VerityMismatch { .. } => {
                EWRONGVERITY.raw_os_error()
            }
            MountError::NotSupported { .. } => Errno::OPNOTSUPP.raw_os_error(),
            MountError::Os { source, .. } => source.raw_os_error(),
            MountError::Io(err) => err.raw_os_error().unwrap_or(Errno::IO.raw_os_error()),
        }
    }
}

/// Keeps only the errno, so `raw_os_error()` on the result is the code a C caller would see.
impl From<MountError> for std::io::Error {
    fn from(err: MountError) -> Self {
        debug!("{err}");
        std::io::Error::from_raw_os_error(err.raw_os_error())
    }
}
