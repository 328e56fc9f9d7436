//! Trying alternative ways to perform a mount, in order.
//!
//! Both the erofs and the overlayfs mounts can be done in more than one way, depending on what the
//! running kernel supports.  Each way is a strategy which either mounts, reports that the kernel
//! lacks something it needs (so the next strategy gets a go), or fails for good.

use log::debug;

use crate::error::MountError;

/// What a strategy that didn't fail outright achieved.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Outcome {
    Mounted,
    /// The kernel lacks the named capability; try the next strategy.
    Unsupported(&'static str),
}

pub(crate) type Attempt = Result<Outcome, MountError>;

/// Runs `strategies` in order until one of them mounts or fails.
///
/// If every strategy reports a missing capability, the last one is returned as
/// [`MountError::NotSupported`].
pub(crate) fn first_supported(
    what: &str,
    strategies: &[(&str, &dyn Fn() -> Attempt)],
) -> Result<(), MountError> {
    let mut missing = "mount";
    for (name, strategy) in strategies {
        match strategy()? {
            Outcome::Mounted => {
                debug!("{what}: mounted using {name}");
                return Ok(());
            }
            Outcome::Unsupported(capability) => {
                debug!("{what}: {name} unavailable ({capability} not supported)");
                missing = capability;
            }
        }
    }
    Err(MountError::NotSupported { op: missing })
}
