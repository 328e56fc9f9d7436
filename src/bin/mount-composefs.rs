use std::{fs::File, path::PathBuf};

use anyhow::{bail, Context, Result};
use clap::Parser;

use composefs_mount::{mount_from_path, MountFlags, MountOptions};

/// Mount a composefs image
#[derive(Debug, Parser)]
#[clap(name = "mount.composefs", version)]
struct Args {
    /// The composefs image file
    image: PathBuf,
    /// Where to mount it
    mountpoint: PathBuf,
    /// Comma-separated mount options: basedir=DIR[:DIR...], digest=HEX, verity, tryverity,
    /// upperdir=DIR, workdir=DIR, idmap=PATH, imagemountdir=DIR, ro, rw, volatile
    #[clap(short = 'o', value_name = "OPTIONS")]
    options: Option<String>,
}

fn parse_options(optstring: &str) -> Result<MountOptions> {
    let mut options = MountOptions::default();

    for item in optstring.split(',').filter(|item| !item.is_empty()) {
        let (key, value) = match item.split_once('=') {
            Some((key, value)) => (key, Some(value)),
            None => (item, None),
        };

        match (key, value) {
            ("basedir", Some(dirs)) => options
                .objdirs
                .extend(dirs.split(':').filter(|d| !d.is_empty()).map(PathBuf::from)),
            ("digest", Some(digest)) => options.expected_digest = Some(digest.to_string()),
            ("upperdir", Some(dir)) => options.upperdir = Some(dir.into()),
            ("workdir", Some(dir)) => options.workdir = Some(dir.into()),
            ("imagemountdir", Some(dir)) => options.image_mountdir = Some(dir.into()),
            ("idmap", Some(path)) => {
                let userns = File::open(path)
                    .with_context(|| format!("Opening user namespace {path}"))?;
                options.idmap_fd = Some(userns.into());
                options.flags.insert(MountFlags::IDMAP);
            }
            ("verity", None) => options.flags.insert(MountFlags::REQUIRE_VERITY),
            ("tryverity", None) => options.flags.insert(MountFlags::TRY_VERITY),
            ("volatile", None) => options.flags.insert(MountFlags::VOLATILE),
            ("ro", None) => options.flags.insert(MountFlags::READONLY),
            ("rw", None) => options.flags.remove(MountFlags::READONLY),
            (
                "basedir" | "digest" | "upperdir" | "workdir" | "imagemountdir" | "idmap",
                None,
            ) => bail!("Mount option {key} needs a value"),
            ("verity" | "tryverity" | "volatile" | "ro" | "rw", Some(_)) => {
                bail!("Mount option {key} takes no value")
            }
            _ => bail!("Unsupported mount option {item}"),
        }
    }

    Ok(options)
}

fn main() -> Result<()> {
    env_logger::init();

    let args = Args::parse();
    let options = parse_options(args.options.as_deref().unwrap_or_default())?;

    mount_from_path(&args.image, &args.mountpoint, &options).with_context(|| {
        format!(
            "Mounting {} on {}",
            args.image.display(),
            args.mountpoint.display()
        )
    })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn basedirs_in_order() {
        let options = parse_options("basedir=/a:/b,,basedir=/c").unwrap();
        assert_eq!(
            options.objdirs,
            vec![
                PathBuf::from("/a"),
                PathBuf::from("/b"),
                PathBuf::from("/c")
            ]
        );
    }

    #[test]
    fn flags_and_values() {
        let options = parse_options(
            "basedir=/objects,digest=abcd,verity,volatile,upperdir=/u,workdir=/w,ro,imagemountdir=/i",
        )
        .unwrap();
        assert_eq!(
            options.flags,
            MountFlags::REQUIRE_VERITY | MountFlags::VOLATILE | MountFlags::READONLY
        );
        assert_eq!(options.expected_digest.as_deref(), Some("abcd"));
        assert_eq!(options.upperdir, Some(PathBuf::from("/u")));
        assert_eq!(options.workdir, Some(PathBuf::from("/w")));
        assert_eq!(options.image_mountdir, Some(PathBuf::from("/i")));
    }

    #[test]
    fn last_of_ro_rw_wins() {
        let options = parse_options("ro,rw").unwrap();
        assert!(!options.has(MountFlags::READONLY));
        let options = parse_options("rw,ro,tryverity").unwrap();
        assert_eq!(options.flags, MountFlags::READONLY | MountFlags::TRY_VERITY);
    }

    #[test]
    fn idmap_opens_namespace() {
        let options = parse_options("basedir=/o,idmap=/dev/null").unwrap();
        assert!(options.has(MountFlags::IDMAP));
        assert!(options.idmap().is_some());

        assert!(parse_options("idmap=/nonexistent/ns/user").is_err());
    }

    #[test]
    fn malformed_options() {
        assert!(parse_options("bogus").is_err());
        assert!(parse_options("basedir").is_err());
        assert!(parse_options("ro=1").is_err());
        assert!(parse_options("").unwrap().objdirs.is_empty());
    }
}
