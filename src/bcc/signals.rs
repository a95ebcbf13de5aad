use std::io;
use std::mem::MaybeUninit;

use crate::Result;

fn full_set() -> libc::sigset_t {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        libc::sigfillset(set.as_mut_ptr());
        set.assume_init()
    }
}

/// Block every signal in the calling thread. The parent stays blocked for
/// the whole trace run; signals are consumed via `wait_next` instead.
pub fn block_all() {
    let set = full_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
    }
}

/// Undo `block_all` in forked children before exec.
pub fn unblock_all() {
    let set = full_set();
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, std::ptr::null_mut());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaughtSignal {
    pub signo: i32,
    /// Sending pid; for SIGCHLD the child that changed state.
    pub pid: libc::pid_t,
}

/// Synchronously wait for the next pending signal.
pub fn wait_next() -> Result<CaughtSignal> {
    let set = full_set();
    let mut info = MaybeUninit::<libc::siginfo_t>::uninit();
    let signo = unsafe { libc::sigwaitinfo(&set, info.as_mut_ptr()) };
    if signo < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let info = unsafe { info.assume_init() };
    let pid = unsafe { info.si_pid() };
    Ok(CaughtSignal { signo, pid })
}
