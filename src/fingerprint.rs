use crate::cancel::CancelToken;
use crate::error::{CrcError, Error};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

/// 32-bit content fingerprint of a port directory tree.
///
/// Traversal is depth-first with entries sorted lexicographically by file
/// name at each level, so the visit order is stable across runs and hosts.
/// Regular files contribute their relative path, a NUL separator, and their
/// bytes; symlinks contribute their target string instead of file bytes.
/// Directories contribute only through their children's paths.
pub fn tree_fingerprint(root: &Path, cancel: &CancelToken) -> Result<u32, Error> {
    let portdir = root.to_string_lossy().to_string();
    let mut hasher = crc32fast::Hasher::new();
    for entry in WalkDir::new(root).sort_by_file_name().follow_links(false) {
        cancel.check("fingerprint walk")?;
        let entry = entry.map_err(|err| CrcError::new(&portdir, "walk", err))?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| CrcError::new(&portdir, "walk", err))?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update(&[0]);
        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())
                .map_err(|err| CrcError::new(&portdir, "readlink", err))?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_file() {
            let bytes =
                fs::read(entry.path()).map_err(|err| CrcError::new(&portdir, "read", err))?;
            hasher.update(&bytes);
        }
    }
    Ok(hasher.finalize())
}
