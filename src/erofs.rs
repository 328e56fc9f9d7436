//! Mounting the erofs image.
//!
//! The image is mounted read-only from its loop device.  The modern mount API is preferred: it is
//! the only way to get an ID-mapped mount.  Kernels without it get a plain `mount()` call.

use std::{ffi::OsStr, os::fd::BorrowedFd, path::Path};

use rustix::mount::{MountAttrFlags, MountFlags};

use crate::{
    error::MountError,
    fallback::{first_supported, Attempt, Outcome},
    header::ImageHeader,
    sys::{MountApi, SysError, SysResultExt},
};

/// Mounts the erofs filesystem on `source` (a block device) at `target`.
///
/// Unless the image records that it contains ACLs, the mount is made with `noacl`: the driver
/// would otherwise interpret ACL xattrs the image never meant to carry.  If `idmap` is given the
/// mount is ID-mapped through that user namespace; kernels that can't do that fail with
/// [`MountError::NotSupported`] rather than silently mounting without the mapping.
pub fn mount_erofs<A: MountApi>(
    api: &A,
    source: &Path,
    target: &Path,
    header: ImageHeader,
    idmap: Option<BorrowedFd<'_>>,
) -> Result<(), MountError> {
    let fsmount: &dyn Fn() -> Attempt = &|| erofs_fsmount(api, source, target, header, idmap);
    let legacy: &dyn Fn() -> Attempt = &|| erofs_legacy(api, source, target, header, idmap);
    first_supported("erofs", &[("fsmount", fsmount), ("mount", legacy)])
}

fn erofs_fsmount<A: MountApi>(
    api: &A,
    source: &Path,
    target: &Path,
    header: ImageHeader,
    idmap: Option<BorrowedFd<'_>>,
) -> Attempt {
    let erofs = match api.fsopen("erofs") {
        Ok(fs) => fs,
        Err(SysError::Unsupported) if idmap.is_none() => {
            return Ok(Outcome::Unsupported("fsopen"));
        }
        Err(SysError::Unsupported) => {
            return Err(MountError::NotSupported {
                op: "id-mapped mount",
            })
        }
        Err(err) => return Err(err).during("fsopen erofs"),
    };

    api.fsconfig_set_string(&erofs, "source", source.as_os_str())
        .during("fsconfig erofs source")?;
    api.fsconfig_set_flag(&erofs, "ro").during("fsconfig erofs ro")?;
    if !header.has_acl() {
        api.fsconfig_set_flag(&erofs, "noacl")
            .during("fsconfig erofs noacl")?;
    }
    api.fsconfig_create(&erofs).during("create erofs")?;

    let mnt = api
        .fsmount(&erofs, MountAttrFlags::MOUNT_ATTR_RDONLY)
        .during("fsmount erofs")?;

    if let Some(userns) = idmap {
        api.mount_setattr_idmap(&mnt, userns).during("id-mapped mount")?;
    }

    api.move_mount(&mnt, target).during("move_mount erofs")?;
    Ok(Outcome::Mounted)
}

fn erofs_legacy<A: MountApi>(
    api: &A,
    source: &Path,
    target: &Path,
    header: ImageHeader,
    idmap: Option<BorrowedFd<'_>>,
) -> Attempt {
    // there's no way to express an ID-mapping through mount(2)
    if idmap.is_some() {
        return Err(MountError::NotSupported {
            op: "id-mapped mount",
        });
    }

    let data = match header.has_acl() {
        true => None,
        false => Some(OsStr::new("noacl")),
    };
    api.mount(
        source.as_os_str(),
        target,
        "erofs",
        MountFlags::RDONLY,
        data,
    )
    .during("mount erofs")?;
    Ok(Outcome::Mounted)
}

#[cfg(test)]
mod tests {
    use std::{ffi::OsString, os::fd::AsFd, path::PathBuf};

    use rustix::io::Errno;
    use similar_asserts::assert_eq;

    use crate::{
        header::COMPOSEFS_FLAGS_HAS_ACL,
        test::{Call, MockKernel},
    };

    use super::*;

    const NO_ACL: ImageHeader = ImageHeader { flags: 0 };
    const WITH_ACL: ImageHeader = ImageHeader {
        flags: COMPOSEFS_FLAGS_HAS_ACL,
    };

    fn mount(
        kernel: &MockKernel,
        header: ImageHeader,
        idmap: Option<BorrowedFd>,
    ) -> Result<(), MountError> {
        mount_erofs(
            kernel,
            Path::new("/dev/loop7"),
            Path::new("/tmp/.composefs.abc"),
            header,
            idmap,
        )
    }

    #[test]
    fn modern_without_acl() {
        let kernel = MockKernel::new();
        mount(&kernel, NO_ACL, None).unwrap();
        assert_eq!(
            kernel.calls(),
            vec![
                Call::FsOpen("erofs".into()),
                Call::SetString("source".into(), "/dev/loop7".into()),
                Call::SetFlag("ro".into()),
                Call::SetFlag("noacl".into()),
                Call::Create,
                Call::FsMount(MountAttrFlags::MOUNT_ATTR_RDONLY),
                Call::MoveMount("/tmp/.composefs.abc".into()),
            ]
        );
        assert_eq!(kernel.mounted(), vec![PathBuf::from("/tmp/.composefs.abc")]);
        assert_eq!(kernel.live_handles(), 0);
    }

    #[test]
    fn modern_with_acl() {
        let kernel = MockKernel::new();
        mount(&kernel, WITH_ACL, None).unwrap();
        assert!(!kernel.calls().contains(&Call::SetFlag("noacl".into())));
    }

    #[test]
    fn legacy_when_fsopen_missing() {
        let kernel = MockKernel::new();
        kernel.fail_when(|call| matches!(call, Call::FsOpen(_)), SysError::Unsupported);

        mount(&kernel, NO_ACL, None).unwrap();
        assert_eq!(
            kernel.calls().last(),
            Some(&Call::Mount {
                source: "/dev/loop7".into(),
                target: "/tmp/.composefs.abc".into(),
                fstype: "erofs".into(),
                flags: MountFlags::RDONLY,
                data: Some(OsString::from("noacl")),
            })
        );

        let kernel = MockKernel::new();
        kernel.fail_when(|call| matches!(call, Call::FsOpen(_)), SysError::Unsupported);
        mount(&kernel, WITH_ACL, None).unwrap();
        assert!(matches!(
            kernel.calls().last(),
            Some(Call::Mount { data: None, .. })
        ));
    }

    #[test]
    fn other_fsopen_errors_are_fatal() {
        let kernel = MockKernel::new();
        kernel.fail_when(|call| matches!(call, Call::FsOpen(_)), SysError::Os(Errno::NODEV));
        let err = mount(&kernel, NO_ACL, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Errno::NODEV.raw_os_error());
        assert!(!kernel.calls().iter().any(|c| matches!(c, Call::Mount { .. })));
    }

    #[test]
    fn idmap_applied_before_move() {
        let userns = std::fs::File::open("/dev/null").unwrap();
        let kernel = MockKernel::new();
        mount(&kernel, NO_ACL, Some(userns.as_fd())).unwrap();
        let calls = kernel.calls();
        let n = calls.len();
        assert_eq!(calls[n - 2], Call::SetIdmap);
        assert!(matches!(calls[n - 1], Call::MoveMount(_)));
    }

    #[test]
    fn idmap_never_falls_back() {
        let userns = std::fs::File::open("/dev/null").unwrap();

        // no modern API at all
        let kernel = MockKernel::new();
        kernel.fail_when(|call| matches!(call, Call::FsOpen(_)), SysError::Unsupported);
        let err = mount(&kernel, NO_ACL, Some(userns.as_fd())).unwrap_err();
        assert!(matches!(err, MountError::NotSupported { .. }));
        assert!(kernel.mounted().is_empty());

        // modern API but no mount_setattr
        let kernel = MockKernel::new();
        kernel.fail_when(|call| *call == Call::SetIdmap, SysError::Unsupported);
        let err = mount(&kernel, NO_ACL, Some(userns.as_fd())).unwrap_err();
        assert!(matches!(err, MountError::NotSupported { .. }));
        assert!(kernel.mounted().is_empty());
        assert_eq!(kernel.live_handles(), 0);
    }
}
