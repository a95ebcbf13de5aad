use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::signals;
use crate::{Error, Result};

/// The symbolization helper: a ptrace-stopped copy of the sym binary whose
/// pid anchors BCC's per-process symbol resolution, plus a mirror of the
/// tracee under `/tmp` for `BCC_SYMFS`.
///
/// The child `PTRACE_TRACEME`s itself before exec, so it stops on the exec
/// trap and lingers without ever running its first instruction. Teardown
/// kills and reaps it and removes the mirror.
pub struct SymProcess {
    path: PathBuf,
    pid: Option<libc::pid_t>,
    symfs_copy: Option<PathBuf>,
}

impl SymProcess {
    pub fn from_pathname(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            pid: None,
            symfs_copy: None,
        }
    }

    pub fn spawn(&mut self) -> Result<()> {
        let path = CString::new(self.path.as_os_str().as_bytes())
            .map_err(|_| Error::Subprocess("embedded NUL in sym path".to_string()))?;
        let argv = [path.as_ptr(), std::ptr::null()];

        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error().into()),
            0 => unsafe {
                signals::unblock_all();
                libc::ptrace(
                    libc::PTRACE_TRACEME,
                    0,
                    std::ptr::null_mut::<libc::c_void>(),
                    std::ptr::null_mut::<libc::c_void>(),
                );
                libc::execv(path.as_ptr(), argv.as_ptr());
                libc::_exit(127)
            },
            pid => {
                tracing::debug!("sym helper spawned as pid {}", pid);
                self.pid = Some(pid);
                Ok(())
            }
        }
    }

    pub fn pid(&self) -> Result<libc::pid_t> {
        self.pid.ok_or(Error::ProcessNotRunning)
    }

    /// Mirror the tracee binary to `/tmp/<tracee-path>` so the host
    /// program's `BCC_SYMFS=/tmp` lookups find it.
    pub fn setup_symfs(&mut self, tracee: &Path) -> Result<()> {
        let relative = tracee.strip_prefix("/").unwrap_or(tracee);
        let dest = Path::new("/tmp").join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&self.path, &dest)?;
        tracing::debug!("symfs mirror at {}", dest.display());
        self.symfs_copy = Some(dest);
        Ok(())
    }

    pub fn kill(&self, signo: libc::c_int) -> Result<()> {
        let pid = self.pid.ok_or(Error::ProcessNotRunning)?;
        if unsafe { libc::kill(pid, signo) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    pub fn wait(&mut self) -> Result<()> {
        let pid = self.pid.ok_or(Error::ProcessNotRunning)?;
        if unsafe { libc::waitpid(pid, std::ptr::null_mut(), 0) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        self.pid = None;
        Ok(())
    }

    /// Remove the symfs mirror; failures here never mask the run's result.
    pub fn wipeout(&mut self) {
        if let Some(copy) = self.symfs_copy.take() {
            let _ = fs::remove_file(copy);
        }
    }
}
