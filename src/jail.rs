//! Child processes under the jail wrapper: spawning and signal delivery.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// A spawned child's identity, shared independently of the [`Child`] value
/// so timers and the output limiter can signal it.
///
/// `kill` is a no-op once the child has been reaped; a late firing can
/// never signal a recycled pid.
#[derive(Debug)]
pub(crate) struct ProcessHandle {
    pid: libc::pid_t,
    finished: AtomicBool,
}

impl ProcessHandle {
    pub(crate) fn kill(&self, signo: libc::c_int) {
        if self.pid > 0 && !self.finished.load(Ordering::Acquire) {
            unsafe { libc::kill(self.pid, signo) };
        }
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    #[allow(dead_code)]
    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct JailedChild {
    pub(crate) child: Child,
    pub(crate) stdin: ChildStdin,
    pub(crate) stdout: ChildStdout,
    pub(crate) stderr: ChildStderr,
    pub(crate) handle: Arc<ProcessHandle>,
}

/// Spawn `argv` with three pipes, working directory `workdir`. The caller
/// has already prefixed the jail wrapper command; argv[0] is what execs.
pub(crate) fn spawn_in_dir(workdir: &Path, argv: &[String]) -> io::Result<JailedChild> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty argv"))?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .current_dir(workdir)
        .spawn()?;

    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let stderr = child.stderr.take().unwrap();
    let pid = child.id().map(|id| id as libc::pid_t).unwrap_or(0);

    Ok(JailedChild {
        child,
        stdin,
        stdout,
        stderr,
        handle: Arc::new(ProcessHandle {
            pid,
            finished: AtomicBool::new(false),
        }),
    })
}

/// Wire-facing name of a termination signal.
pub(crate) fn signal_name(signo: i32) -> String {
    let name = match signo {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGSYS => "SIGSYS",
        _ => return format!("SIG{signo}"),
    };
    name.to_string()
}
