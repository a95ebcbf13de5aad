use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use super::signals;
use crate::{Error, Result};

/// The generated host program running under a Python interpreter.
///
/// The program text is fed to the child over a pipe wired to its stdin
/// (`python -`), with `BCC_SYMFS=/tmp` in its environment so kernel stack
/// symbolization finds the mirrored tracee binary.
pub struct BccProcess {
    python: PathBuf,
    program: String,
    pid: Option<libc::pid_t>,
}

impl BccProcess {
    pub fn new(python: &Path, program: String) -> Self {
        Self {
            python: python.to_path_buf(),
            program,
            pid: None,
        }
    }

    pub fn spawn(&mut self) -> Result<()> {
        let path = cstring(self.python.as_os_str().as_bytes())?;
        let stdin_arg = cstring(b"-")?;
        let argv = [path.as_ptr(), stdin_arg.as_ptr(), std::ptr::null()];
        let env = child_env()?;
        let envp: Vec<*const libc::c_char> = env
            .iter()
            .map(|e| e.as_ptr())
            .chain(std::iter::once(std::ptr::null()))
            .collect();

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        match unsafe { libc::fork() } {
            -1 => Err(io::Error::last_os_error().into()),
            0 => {
                // Child: program text arrives on stdin.
                signals::unblock_all();
                unsafe {
                    libc::dup2(read_fd, 0);
                    libc::close(read_fd);
                    libc::close(write_fd);
                    libc::execvpe(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
                    libc::_exit(127)
                }
            }
            pid => {
                unsafe { libc::close(read_fd) };
                self.pid = Some(pid);
                let written = write_all(write_fd, self.program.as_bytes());
                unsafe { libc::close(write_fd) };
                written
            }
        }
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

    /// Forward every incoming signal to the child; return once the child
    /// itself exits. This makes Ctrl-C at the CLI reach the host program
    /// transparently.
    pub fn proxy_signals(&mut self) -> Result<()> {
        let pid = self.pid.ok_or(Error::ProcessNotRunning)?;
        loop {
            let caught = signals::wait_next()?;
            if caught.signo == libc::SIGCHLD && caught.pid == pid {
                return self.wait();
            }
            // The child may already be gone; the SIGCHLD will follow.
            unsafe { libc::kill(pid, caught.signo) };
        }
    }
}

fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes)
        .map_err(|_| Error::Subprocess("embedded NUL in command line".to_string()))
}

/// Current environment plus `BCC_SYMFS=/tmp`.
fn child_env() -> Result<Vec<CString>> {
    let mut env = Vec::new();
    for (key, value) in std::env::vars_os() {
        if key.as_os_str().as_bytes() == b"BCC_SYMFS" {
            continue;
        }
        let mut entry = key.as_os_str().as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_os_str().as_bytes());
        env.push(cstring(&entry)?);
    }
    env.push(cstring(b"BCC_SYMFS=/tmp")?);
    Ok(env)
}

fn write_all(fd: libc::c_int, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }
        bytes = &bytes[n as usize..];
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kill_before_spawn_fails() {
        let process = BccProcess::new(Path::new("python3"), String::new());
        assert!(matches!(
            process.kill(libc::SIGTERM),
            Err(Error::ProcessNotRunning)
        ));
    }

    #[test]
    fn test_child_env_carries_symfs() {
        let env = child_env().unwrap();
        let symfs = env
            .iter()
            .filter(|e| e.as_bytes().starts_with(b"BCC_SYMFS="))
            .count();
        assert_eq!(symfs, 1);
        assert!(env.iter().any(|e| e.as_bytes() == b"BCC_SYMFS=/tmp"));
    }
}
