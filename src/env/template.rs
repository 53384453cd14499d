//! The Template directory under the build base: the minimum files a
//! chrooted build needs, copied into every worker root at setup, plus the
//! pkg manager once it has been bootstrapped.

use crate::config::Config;
use crate::error::{Error, ExecutionError};
use crate::logger::Logger;
use std::fs;
use std::path::Path;
use std::process::Command;

/// Host files seeded into the Template.
pub const TEMPLATE_FILES: &[&str] = &[
    "etc/resolv.conf",
    "etc/passwd",
    "etc/group",
    "etc/master.passwd",
    "etc/pwd.db",
    "etc/spwd.db",
    "var/run/ld-elf.so.hints",
];

const PKG_BINARY: &str = "usr/local/sbin/pkg";

/// Create the Template and copy the host seed files into it. Files the
/// host does not have are logged and skipped.
pub fn populate(cfg: &Config, logger: &dyn Logger) -> Result<(), Error> {
    let template = cfg.template_path();
    for rel in TEMPLATE_FILES {
        let source = Path::new("/").join(rel);
        let target = template.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| Error::io(format!("creating {}", parent.display()), err))?;
        }
        if !source.is_file() {
            logger.warn(&format!(
                "phase=template status=missing-host-file file=/{rel}"
            ));
            continue;
        }
        fs::copy(&source, &target).map_err(|err| {
            Error::io(format!("copying /{rel} into {}", template.display()), err)
        })?;
    }
    logger.info(&format!(
        "phase=template status=populated path={}",
        template.display()
    ));
    Ok(())
}

/// Tar-extract the built pkg package into the Template so later workers
/// receive `/usr/local/sbin/pkg` and its libraries. Metadata entries and
/// man pages are excluded. Failure here is fatal to the run.
pub fn install_pkg(cfg: &Config, pkg_file: &str, logger: &dyn Logger) -> Result<(), Error> {
    let archive = cfg.packages_all().join(pkg_file);
    let template = cfg.template_path();
    let status = Command::new("tar")
        .arg("-xf")
        .arg(&archive)
        .arg("-C")
        .arg(&template)
        .arg("--exclude")
        .arg("+*")
        .arg("--exclude")
        .arg("*/man/*")
        .status()
        .map_err(|err| Error::io(format!("extracting {}", archive.display()), err))?;
    if !status.success() {
        return Err(Error::Execution(ExecutionError {
            command: format!("tar -xf {}", archive.display()),
            exit_code: status.code().unwrap_or(-1),
            op: "template-install",
            source: None,
        }));
    }
    if !has_pkg(cfg) {
        return Err(Error::Validation(format!(
            "pkg package {} did not provide {PKG_BINARY}",
            archive.display()
        )));
    }
    logger.info(&format!(
        "phase=template status=pkg-installed archive={}",
        archive.display()
    ));
    Ok(())
}

/// True when the Template already carries the pkg binary.
pub fn has_pkg(cfg: &Config) -> bool {
    cfg.template_path().join(PKG_BINARY).is_file()
}

/// Recursive copy of the Template into a worker base, preserving file
/// modes. Symlinks are recreated, not followed.
pub fn copy_into(template: &Path, base: &Path) -> Result<(), Error> {
    if !template.is_dir() {
        return Ok(());
    }
    copy_tree(template, base)
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), Error> {
    fs::create_dir_all(dst).map_err(|err| Error::io(format!("creating {}", dst.display()), err))?;
    let entries =
        fs::read_dir(src).map_err(|err| Error::io(format!("reading {}", src.display()), err))?;
    for entry in entries {
        let entry = entry.map_err(|err| Error::io(format!("reading {}", src.display()), err))?;
        let target = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|err| Error::io(format!("stat {}", entry.path().display()), err))?;
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .map_err(|err| Error::io(format!("readlink {}", entry.path().display()), err))?;
            let _ = fs::remove_file(&target);
            std::os::unix::fs::symlink(&link, &target)
                .map_err(|err| Error::io(format!("symlink {}", target.display()), err))?;
        } else {
            fs::copy(entry.path(), &target)
                .map_err(|err| Error::io(format!("copying {}", entry.path().display()), err))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::MemoryLogger;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn copy_into_preserves_tree_and_modes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let template = dir.path().join("Template");
        fs::create_dir_all(template.join("usr/local/sbin")).expect("dirs");
        fs::write(template.join("usr/local/sbin/pkg"), b"#!/bin/sh\n").expect("pkg");
        let mut perms = fs::metadata(template.join("usr/local/sbin/pkg"))
            .expect("meta")
            .permissions();
        perms.set_mode(0o755);
        fs::set_permissions(template.join("usr/local/sbin/pkg"), perms).expect("chmod");
        std::os::unix::fs::symlink("pkg", template.join("usr/local/sbin/pkg-static"))
            .expect("symlink");

        let base = dir.path().join("SL00");
        copy_into(&template, &base).expect("copy");
        let copied = base.join("usr/local/sbin/pkg");
        assert!(copied.is_file());
        assert_eq!(
            fs::metadata(&copied).expect("meta").permissions().mode() & 0o777,
            0o755
        );
        let link = base.join("usr/local/sbin/pkg-static");
        assert_eq!(
            fs::read_link(&link).expect("link").to_string_lossy(),
            "pkg"
        );
    }

    #[test]
    fn copy_into_with_absent_template_is_a_no_op() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path().join("SL00");
        copy_into(&dir.path().join("Template"), &base).expect("no-op");
        assert!(!base.exists());
    }

    #[test]
    fn populate_skips_files_the_host_lacks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = crate::config::tests::test_config(dir.path());
        let logger = MemoryLogger::new();
        populate(&cfg, &logger).expect("populate");
        // /etc/passwd exists on any unix host; BSD-only files may not.
        assert!(cfg.template_path().join("etc/passwd").is_file());
    }

    #[test]
    fn has_pkg_checks_the_template_binary() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = crate::config::tests::test_config(dir.path());
        assert!(!has_pkg(&cfg));
        let sbin = cfg.template_path().join("usr/local/sbin");
        fs::create_dir_all(&sbin).expect("dirs");
        fs::write(sbin.join("pkg"), b"").expect("pkg");
        assert!(has_pkg(&cfg));
    }
}
