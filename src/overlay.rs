//! Composing the overlayfs on top of the mounted image.
//!
//! The overlay uses the erofs mount as its (only) regular lower layer and every object directory
//! as a data-only lower layer, with metacopy and redirect_dir enabled so that the metadata-only
//! files in the image resolve to objects by their redirect xattrs.
//!
//! The modern mount API is used when the kernel's overlayfs fully supports it (6.7 and later have
//! `lowerdir+` and `datadir+`, which take paths verbatim).  Otherwise the whole configuration is
//! passed as one option string to `mount()`, which needs commas in paths escaped.

use std::{
    ffi::{OsStr, OsString},
    os::unix::ffi::{OsStrExt, OsStringExt},
    path::Path,
};

use log::debug;
use rustix::{
    io::Errno,
    mount::{MountAttrFlags, MountFlags},
};

use crate::{
    error::MountError,
    fallback::{first_supported, Attempt, Outcome},
    options::{MountFlags as Flags, MountOptions},
    sys::{MountApi, SysError, SysResultExt},
    MOUNT_SOURCE,
};

/// Escapes a value for use in a legacy mount option string, where a comma separates options.
pub fn escape_option(value: &OsStr) -> OsString {
    let mut escaped = Vec::with_capacity(value.len());
    for &byte in value.as_bytes() {
        if byte == b',' {
            escaped.push(b'\\');
        }
        escaped.push(byte);
    }
    OsString::from_vec(escaped)
}

/// Builds the option string for a legacy `mount()` call: `key=value` pairs separated by commas.
#[derive(Debug, Default)]
pub struct LegacyOptions {
    data: OsString,
}

impl LegacyOptions {
    fn key(&mut self, key: &str) -> &mut Self {
        if !self.data.is_empty() {
            self.data.push(",");
        }
        self.data.push(key);
        self.data.push("=");
        self
    }

    /// Adds an option whose value is used literally.
    pub fn set(&mut self, key: &str, value: &str) -> &mut Self {
        self.key(key).data.push(value);
        self
    }

    /// Adds an option whose value is a path, escaped.
    pub fn path(&mut self, key: &str, value: &Path) -> &mut Self {
        let escaped = escape_option(value.as_os_str());
        self.key(key).data.push(escaped);
        self
    }

    /// Adds an option whose value is a list of paths, each escaped, joined by `separator`.
    pub fn paths<'a>(
        &mut self,
        key: &str,
        values: impl IntoIterator<Item = &'a Path>,
        separator: &str,
    ) -> &mut Self {
        self.key(key);
        for (idx, value) in values.into_iter().enumerate() {
            if idx > 0 {
                self.data.push(separator);
            }
            self.data.push(escape_option(value.as_os_str()));
        }
        self
    }

    pub fn finish(self) -> OsString {
        self.data
    }
}

/// How the object directories are appended to `lowerdir=` in a legacy option string.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LowerSyntax {
    /// `image::objdir1::objdir2`: object directories are data-only layers (6.5 and later).
    DataOnly,
    /// `image:objdir1:objdir2`: every directory is an ordinary lower layer.
    Plain,
}

/// The option string for a legacy overlayfs mount.
///
/// try-verity and volatile are deliberately not passed: there is no reliable way to find out if
/// the kernel supports them with this API.
pub fn legacy_options(image_dir: &Path, options: &MountOptions, syntax: LowerSyntax) -> OsString {
    let separator = match syntax {
        LowerSyntax::DataOnly => "::",
        LowerSyntax::Plain => ":",
    };

    let mut data = LegacyOptions::default();
    data.set("metacopy", "on")
        .set("redirect_dir", "on")
        .paths(
            "lowerdir",
            std::iter::once(image_dir).chain(options.objdirs.iter().map(|p| p.as_path())),
            separator,
        );
    if let (Some(upperdir), Some(workdir)) = (&options.upperdir, &options.workdir) {
        data.path("upperdir", upperdir).path("workdir", workdir);
    }
    if options.has(Flags::REQUIRE_VERITY) {
        data.set("verity", "require");
    }
    data.finish()
}

/// Mounts the overlayfs for `options` on `target`, using the erofs image mounted at `image_dir`.
pub fn mount_overlay<A: MountApi>(
    api: &A,
    image_dir: &Path,
    options: &MountOptions,
    target: &Path,
) -> Result<(), MountError> {
    let fsmount: &dyn Fn() -> Attempt = &|| overlay_fsmount(api, image_dir, options, target);
    let data_only: &dyn Fn() -> Attempt =
        &|| overlay_legacy(api, image_dir, options, target, LowerSyntax::DataOnly);
    let plain: &dyn Fn() -> Attempt =
        &|| overlay_legacy(api, image_dir, options, target, LowerSyntax::Plain);

    first_supported(
        "overlay",
        &[
            ("fsmount", fsmount),
            ("mount with data-only layers", data_only),
            ("mount", plain),
        ],
    )
}

/// Maps failures which mean "this overlayfs doesn't support that" to a fallback.
fn capability<T>(result: Result<T, SysError>, op: &'static str) -> Result<Option<T>, MountError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(SysError::Unsupported) => Ok(None),
        Err(err) if err.is(Errno::INVAL) => Ok(None),
        Err(err) => Err(err).during(op),
    }
}

fn overlay_fsmount<A: MountApi>(
    api: &A,
    image_dir: &Path,
    options: &MountOptions,
    target: &Path,
) -> Attempt {
    let require_verity = options.has(Flags::REQUIRE_VERITY);
    let try_verity = options.has(Flags::TRY_VERITY);

    let overlayfs = match api.fsopen("overlay") {
        Ok(fs) => fs,
        Err(SysError::Unsupported) => return Ok(Outcome::Unsupported("fsopen")),
        Err(err) => return Err(err).during("fsopen overlay"),
    };

    // Old overlayfs implements the mount API only through the legacy shim, which accepts
    // anything: make sure options are really being validated.
    let probe = OsStr::new("unsupported");
    if api.fsconfig_set_string(&overlayfs, "unsupported", probe).is_ok() {
        return Ok(Outcome::Unsupported("overlayfs option validation"));
    }

    api.fsconfig_set_string(&overlayfs, "source", OsStr::new(MOUNT_SOURCE))
        .during("fsconfig overlay source")?;
    api.fsconfig_set_string(&overlayfs, "metacopy", OsStr::new("on"))
        .during("fsconfig overlay metacopy")?;
    api.fsconfig_set_string(&overlayfs, "redirect_dir", OsStr::new("on"))
        .during("fsconfig overlay redirect_dir")?;

    if require_verity || try_verity {
        match api.fsconfig_set_string(&overlayfs, "verity", OsStr::new("require")) {
            Ok(()) => {}
            Err(err) if require_verity => return Err(err).during("fsconfig overlay verity"),
            Err(err) => debug!("overlayfs verity not supported, continuing without: {err}"),
        }
    }

    if options.has(Flags::VOLATILE) {
        if let Err(err) = api.fsconfig_set_flag(&overlayfs, "volatile") {
            debug!("overlayfs volatile not supported, ignoring: {err}");
        }
    }

    let lower = api.fsconfig_set_string(&overlayfs, "lowerdir+", image_dir.as_os_str());
    if capability(lower, "fsconfig overlay lowerdir+")?.is_none() {
        return Ok(Outcome::Unsupported("lowerdir+"));
    }

    for objdir in &options.objdirs {
        let data = api.fsconfig_set_string(&overlayfs, "datadir+", objdir.as_os_str());
        if capability(data, "fsconfig overlay datadir+")?.is_none() {
            return Ok(Outcome::Unsupported("datadir+"));
        }
    }

    if let (Some(upperdir), Some(workdir)) = (&options.upperdir, &options.workdir) {
        api.fsconfig_set_string(&overlayfs, "upperdir", upperdir.as_os_str())
            .during("fsconfig overlay upperdir")?;
        api.fsconfig_set_string(&overlayfs, "workdir", workdir.as_os_str())
            .during("fsconfig overlay workdir")?;
    }

    if capability(api.fsconfig_create(&overlayfs), "create overlay")?.is_none() {
        return Ok(Outcome::Unsupported("data-only lower layers"));
    }

    let attrs = match options.has(Flags::READONLY) {
        true => MountAttrFlags::MOUNT_ATTR_RDONLY,
        false => MountAttrFlags::empty(),
    };
    let mnt = api.fsmount(&overlayfs, attrs).during("fsmount overlay")?;
    api.move_mount(&mnt, target).during("move_mount overlay")?;

    Ok(Outcome::Mounted)
}

fn overlay_legacy<A: MountApi>(
    api: &A,
    image_dir: &Path,
    options: &MountOptions,
    target: &Path,
    syntax: LowerSyntax,
) -> Attempt {
    let data = legacy_options(image_dir, options, syntax);

    let mut flags = MountFlags::empty();
    if options.has(Flags::READONLY) {
        flags |= MountFlags::RDONLY;
    }
    // EINVAL is expected on kernels without data-only layers: keep it out of the kernel log
    if syntax == LowerSyntax::DataOnly {
        flags |= MountFlags::SILENT;
    }

    match api.mount(
        OsStr::new(MOUNT_SOURCE),
        target,
        "overlay",
        flags,
        Some(data.as_os_str()),
    ) {
        Ok(()) => Ok(Outcome::Mounted),
        Err(err) if syntax == LowerSyntax::DataOnly && err.is(Errno::INVAL) => {
            Ok(Outcome::Unsupported("data-only lower layers"))
        }
        Err(err) => Err(err).during("mount overlay"),
    }
}
