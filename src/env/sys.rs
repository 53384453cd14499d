//! Thin shims over the BSD mount and reaper syscalls. On FreeBSD and
//! DragonFly these are real; elsewhere mounts report `Unsupported` (the
//! mock backend covers tests) and the reaper falls back to the closest
//! host equivalent.

use std::io;
use std::path::Path;

pub fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, what.to_string())
}

#[cfg(target_os = "freebsd")]
mod imp {
    use super::*;
    use std::ffi::CString;

    fn cstr(value: &str) -> io::Result<CString> {
        CString::new(value).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
    }

    /// nmount(2) takes name/value iovec pairs.
    fn nmount(pairs: &[(&str, &str)], flags: libc::c_int) -> io::Result<()> {
        let mut storage = Vec::with_capacity(pairs.len() * 2);
        for (name, value) in pairs {
            storage.push(cstr(name)?);
            storage.push(cstr(value)?);
        }
        let mut iovecs: Vec<libc::iovec> = storage
            .iter()
            .map(|s| libc::iovec {
                iov_base: s.as_ptr() as *mut libc::c_void,
                iov_len: s.as_bytes_with_nul().len(),
            })
            .collect();
        let rc = unsafe { libc::nmount(iovecs.as_mut_ptr(), iovecs.len() as libc::c_uint, flags) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn mount_nullfs(source: &Path, target: &Path, read_only: bool) -> io::Result<()> {
        let flags = if read_only { libc::MNT_RDONLY } else { 0 };
        nmount(
            &[
                ("fstype", "nullfs"),
                ("fspath", &target.to_string_lossy()),
                ("target", &source.to_string_lossy()),
            ],
            flags,
        )
    }

    pub fn mount_tmpfs(target: &Path, size: Option<&str>) -> io::Result<()> {
        let fspath = target.to_string_lossy();
        let mut pairs = vec![("fstype", "tmpfs"), ("fspath", fspath.as_ref()), ("from", "tmpfs")];
        if let Some(size) = size {
            pairs.push(("size", size));
        }
        nmount(&pairs, 0)
    }

    pub fn mount_devfs(target: &Path) -> io::Result<()> {
        nmount(
            &[("fstype", "devfs"), ("fspath", &target.to_string_lossy())],
            0,
        )
    }

    pub fn mount_procfs(target: &Path) -> io::Result<()> {
        nmount(
            &[("fstype", "procfs"), ("fspath", &target.to_string_lossy())],
            libc::MNT_RDONLY,
        )
    }

    pub fn unmount(target: &Path) -> io::Result<()> {
        let path = cstr(&target.to_string_lossy())?;
        let rc = unsafe { libc::unmount(path.as_ptr(), 0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Become the reaper for every descendant in this subtree.
    pub fn become_subtree_reaper() -> io::Result<()> {
        let rc = unsafe {
            libc::procctl(
                libc::P_PID,
                0,
                libc::PROC_REAP_ACQUIRE,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Signal every descendant in the reaper subtree with SIGKILL.
    pub fn kill_descendants() -> io::Result<()> {
        let mut kill: libc::procctl_reaper_kill = unsafe { std::mem::zeroed() };
        kill.rk_sig = libc::SIGKILL;
        let rc = unsafe {
            libc::procctl(
                libc::P_PID,
                0,
                libc::PROC_REAP_KILL,
                &mut kill as *mut _ as *mut libc::c_void,
            )
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // ESRCH: nothing left to kill.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;

    pub fn mount_nullfs(_source: &Path, _target: &Path, _read_only: bool) -> io::Result<()> {
        Err(unsupported("nullfs mount"))
    }

    pub fn mount_tmpfs(_target: &Path, _size: Option<&str>) -> io::Result<()> {
        Err(unsupported("tmpfs mount"))
    }

    pub fn mount_devfs(_target: &Path) -> io::Result<()> {
        Err(unsupported("devfs mount"))
    }

    pub fn mount_procfs(_target: &Path) -> io::Result<()> {
        Err(unsupported("procfs mount"))
    }

    pub fn unmount(_target: &Path) -> io::Result<()> {
        Err(unsupported("unmount"))
    }

    /// Closest host equivalent: orphaned descendants reparent to us
    /// instead of init, so the helper can still reap them.
    pub fn become_subtree_reaper() -> io::Result<()> {
        let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// No group kill primitive for the subtree here; the helper's waitpid
    /// loop still reaps whatever reparents to it.
    pub fn kill_descendants() -> io::Result<()> {
        Ok(())
    }
}

#[cfg(not(any(target_os = "freebsd", target_os = "linux")))]
mod imp {
    use super::*;

    pub fn mount_nullfs(_source: &Path, _target: &Path, _read_only: bool) -> io::Result<()> {
        Err(unsupported("nullfs mount"))
    }

    pub fn mount_tmpfs(_target: &Path, _size: Option<&str>) -> io::Result<()> {
        Err(unsupported("tmpfs mount"))
    }

    pub fn mount_devfs(_target: &Path) -> io::Result<()> {
        Err(unsupported("devfs mount"))
    }

    pub fn mount_procfs(_target: &Path) -> io::Result<()> {
        Err(unsupported("procfs mount"))
    }

    pub fn unmount(_target: &Path) -> io::Result<()> {
        Err(unsupported("unmount"))
    }

    pub fn become_subtree_reaper() -> io::Result<()> {
        Err(unsupported("subtree reaper"))
    }

    pub fn kill_descendants() -> io::Result<()> {
        Ok(())
    }
}

pub use imp::{
    become_subtree_reaper, kill_descendants, mount_devfs, mount_nullfs, mount_procfs, mount_tmpfs,
    unmount,
};
