use std::{
    fs::{self, File},
    io::{self, Write},
    path::Path,
    process::Command,
};

use rustix::mount::{unmount, UnmountFlags};
use tempfile::{NamedTempFile, TempDir};

use composefs_mount::{
    mount_from_fd, mount_from_path, options::OptionsError, MountError, MountFlags, MountOptions,
};

fn scratch_file(contents: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents).unwrap();
    file
}

fn can_mount() -> bool {
    rustix::process::getuid().is_root() && Path::new("/dev/loop-control").exists()
}

#[test]
fn rejected_options_are_einval() {
    let mountpoint = TempDir::new().unwrap();
    let err = mount_from_path(
        "/nonexistent/image.cfs",
        mountpoint.path(),
        &MountOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        MountError::InvalidOptions(OptionsError::NoObjectDirs)
    ));

    let err = io::Error::from(err);
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

#[test]
fn unknown_flags_are_einval() {
    let image = scratch_file(&[0; 64]);
    let mut options = MountOptions::new("/objects");
    options.flags = MountFlags::from_bits_retain(1 << 2);

    let err = mount_from_fd(image.as_file(), "/nonexistent", &options).unwrap_err();
    assert!(matches!(
        err,
        MountError::InvalidOptions(OptionsError::UnknownFlags(4))
    ));
}

#[test]
fn missing_image() {
    let err = mount_from_path(
        "/nonexistent/image.cfs",
        "/nonexistent",
        &MountOptions::new("/objects"),
    )
    .unwrap_err();
    assert_eq!(
        io::Error::from(err).kind(),
        io::ErrorKind::NotFound,
    );
}

#[test]
fn not_a_composefs_image() {
    let image = scratch_file(&[0xff; 4096]);
    let err = mount_from_path(image.path(), "/nonexistent", &MountOptions::new("/objects"))
        .unwrap_err();
    assert!(matches!(err, MountError::BadMagic(0xffffffff)));
    assert_eq!(err.raw_os_error(), libc::EINVAL);

    let image = scratch_file(&[0x9a, 0x62, 0x78, 0xd0]);
    let err = mount_from_fd(image.reopen().unwrap(), "/nonexistent", &MountOptions::new("/o"))
        .unwrap_err();
    assert!(matches!(err, MountError::ShortHeader));
    assert_eq!(err.raw_os_error(), libc::EINVAL);
}

#[test_with::executable(mkcomposefs)]
#[test]
fn mount_real_image() {
    if !can_mount() {
        return;
    }

    let work = TempDir::new().unwrap();
    let source = work.path().join("source");
    let objects = work.path().join("objects");
    let image = work.path().join("image.cfs");
    let mountpoint = work.path().join("mnt");
    for dir in [&source, &objects, &mountpoint] {
        fs::create_dir(dir).unwrap();
    }
    fs::write(source.join("hello"), "hello, composefs\n".repeat(100)).unwrap();

    let status = Command::new("mkcomposefs")
        .arg(format!("--digest-store={}", objects.display()))
        .arg(&source)
        .arg(&image)
        .status()
        .unwrap();
    assert!(status.success());

    let mut options = MountOptions::new(&objects);
    options.flags = MountFlags::READONLY;
    mount_from_path(&image, &mountpoint, &options).unwrap();

    let contents = fs::read_to_string(mountpoint.join("hello"));
    let readonly = File::create(mountpoint.join("new")).unwrap_err();
    unmount(&mountpoint, UnmountFlags::DETACH).unwrap();

    assert_eq!(contents.unwrap(), "hello, composefs\n".repeat(100));
    assert_eq!(readonly.raw_os_error(), Some(libc::EROFS));
}
