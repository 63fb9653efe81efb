//! Child process spawning, liveness polling, signalling, and output pumping.
//!
//! Children run with stderr merged into stdout through a single pipe; a
//! dedicated pump thread turns the read end into prefixed records on the
//! shared output sink and exits when the pipe closes. The supervisor's
//! environment is inherited unchanged.

use anyhow::{Context, Result, bail};
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::JoinHandle;

use crate::config::{ExecTask, PeriodicSpec, ServiceSpec};
use crate::output::OutputSink;

/// Longest line the pump will emit; anything longer is split at the
/// boundary without losing bytes.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Everything needed to launch one child.
#[derive(Debug)]
pub struct ChildSpec<'a> {
    pub path: &'a str,
    pub args: &'a [String],
    pub workdir: Option<&'a str>,
    pub user: Option<&'a str>,
    pub group: Option<&'a str>,
    pub capture_output: bool,
}

impl<'a> From<&'a ServiceSpec> for ChildSpec<'a> {
    fn from(spec: &'a ServiceSpec) -> Self {
        ChildSpec {
            path: &spec.path,
            args: &spec.args,
            workdir: spec.workdir.as_deref(),
            user: spec.user.as_deref(),
            group: spec.group.as_deref(),
            capture_output: spec.output,
        }
    }
}

impl<'a> From<&'a PeriodicSpec> for ChildSpec<'a> {
    fn from(spec: &'a PeriodicSpec) -> Self {
        ChildSpec {
            path: &spec.path,
            args: &spec.args,
            workdir: spec.workdir.as_deref(),
            user: spec.user.as_deref(),
            group: spec.group.as_deref(),
            capture_output: spec.output,
        }
    }
}

impl<'a> From<&'a ExecTask> for ChildSpec<'a> {
    fn from(task: &'a ExecTask) -> Self {
        ChildSpec {
            path: &task.path,
            args: &task.args,
            workdir: task.workdir.as_deref(),
            user: task.user.as_deref(),
            group: task.group.as_deref(),
            capture_output: task.output,
        }
    }
}

/// A spawned child. Owned by exactly one record (service or periodic
/// instance); dropped after `wait` has reaped it.
pub struct ChildHandle {
    child: Child,
    pid: u32,
    /// Exit status observed by the process-wide zombie reaper before this
    /// handle's own poll/wait got to it.
    stashed: Option<ExitStatus>,
}

impl ChildHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Non-blocking liveness check.
    pub fn poll(&mut self) -> Result<Option<ExitStatus>> {
        if let Some(status) = self.stashed {
            return Ok(Some(status));
        }
        self.child.try_wait().context("poll child")
    }

    /// Block until the child terminates.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.stashed {
            return Ok(status);
        }
        self.child.wait().context("wait for child")
    }

    /// Record an exit status reaped on this child's behalf by `waitpid(-1)`.
    pub fn note_reaped(&mut self, status: ExitStatus) {
        self.stashed = Some(status);
    }

    pub fn signal(&self, signum: libc::c_int) -> Result<()> {
        send_signal(self.pid, signum)
    }
}

/// Launch a child per `spec`. Returns the handle and, when output is
/// captured, the line reader for its merged stdout+stderr stream.
pub fn spawn(spec: &ChildSpec) -> Result<(ChildHandle, Option<LineReader<File>>)> {
    let mut cmd = Command::new(spec.path);
    cmd.args(spec.args);
    cmd.stdin(Stdio::null());

    if let Some(dir) = spec.workdir {
        cmd.current_dir(dir);
    }
    if let Some(user) = spec.user {
        cmd.uid(resolve_uid(user)?);
    }
    if let Some(group) = spec.group {
        cmd.gid(resolve_gid(group)?);
    }

    let reader = if spec.capture_output {
        let (read, write) = os_pipe()?;
        let write_stderr = write.try_clone().context("dup pipe write end")?;
        cmd.stdout(Stdio::from(write));
        cmd.stderr(Stdio::from(write_stderr));
        Some(LineReader::new(File::from(read)))
    } else {
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        None
    };

    let child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", spec.path))?;
    let pid = child.id();

    Ok((
        ChildHandle {
            child,
            pid,
            stashed: None,
        },
        reader,
    ))
}

/// Spawn the output pump for a captured child: one thread that drains the
/// line reader into the sink and exits when the child's pipe closes.
pub fn spawn_pump(
    reader: LineReader<File>,
    sink: OutputSink,
    prefix: String,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        reader.pump(|line| sink.write_line(&prefix, line));
    })
}

/// Send a signal, treating ESRCH (already gone) as success.
pub fn send_signal(pid: u32, signum: libc::c_int) -> Result<()> {
    // SAFETY: kill(2) is safe to call with any pid and valid signal number.
    let ret = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err).with_context(|| format!("signal pid {pid}"));
        }
    }
    Ok(())
}

/// Resolve a user name (or numeric string) to a uid.
pub fn resolve_uid(user: &str) -> Result<u32> {
    if let Ok(uid) = user.parse::<u32>() {
        return Ok(uid);
    }
    let name = CString::new(user).context("user name contains NUL")?;
    // SAFETY: getpwnam returns null or a pointer into static storage; the
    // supervisor only calls it from the main thread.
    let entry = unsafe { libc::getpwnam(name.as_ptr()) };
    if entry.is_null() {
        bail!("unknown user '{user}'");
    }
    // SAFETY: non-null entry is valid for read.
    Ok(unsafe { (*entry).pw_uid })
}

/// Resolve a group name (or numeric string) to a gid.
pub fn resolve_gid(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    let name = CString::new(group).context("group name contains NUL")?;
    // SAFETY: getgrnam returns null or a pointer into static storage; the
    // supervisor only calls it from the main thread.
    let entry = unsafe { libc::getgrnam(name.as_ptr()) };
    if entry.is_null() {
        bail!("unknown group '{group}'");
    }
    // SAFETY: non-null entry is valid for read.
    Ok(unsafe { (*entry).gr_gid })
}

fn os_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: pipe(2) fills the two-element array on success.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error()).context("create output pipe");
    }
    // SAFETY: both descriptors were just returned by pipe(2) and are owned
    // by nothing else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Accumulates raw bytes into whole UTF-8 lines.
///
/// Trailing `\n` (and `\r\n`) are stripped; invalid UTF-8 is replaced
/// lossily; lines longer than [`MAX_LINE_BYTES`] are split at the boundary
/// so no output is lost.
pub struct LineReader<R: Read> {
    inner: R,
}

impl<R: Read> LineReader<R> {
    pub fn new(inner: R) -> Self {
        LineReader { inner }
    }

    /// Drive the reader to EOF or error, handing each line to `emit`.
    pub fn pump(mut self, mut emit: impl FnMut(&str)) {
        let mut buf = [0u8; 8192];
        let mut line_buf: Vec<u8> = Vec::new();
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    for &byte in &buf[..n] {
                        if byte == b'\n' {
                            flush_line(&mut line_buf, true, &mut emit);
                        } else {
                            line_buf.push(byte);
                            if line_buf.len() >= MAX_LINE_BYTES {
                                flush_line(&mut line_buf, false, &mut emit);
                            }
                        }
                    }
                }
                Err(_) => break,
            }
        }
        if !line_buf.is_empty() {
            flush_line(&mut line_buf, false, &mut emit);
        }
    }
}

/// A trailing `\r` is only a CRLF terminator when an actual `\n` triggered
/// the flush; a size-triggered split must stay byte-exact, since the `\r`
/// may sit mid-line.
fn flush_line(line_buf: &mut Vec<u8>, newline_terminated: bool, emit: &mut impl FnMut(&str)) {
    if newline_terminated && line_buf.last() == Some(&b'\r') {
        line_buf.pop();
    }
    let text = String::from_utf8_lossy(line_buf);
    emit(&text);
    line_buf.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn collect(input: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        LineReader::new(Cursor::new(input.to_vec())).pump(|line| lines.push(line.to_string()));
        lines
    }

    #[test]
    fn strips_trailing_newlines() {
        assert_eq!(collect(b"one\ntwo\n"), ["one", "two"]);
    }

    #[test]
    fn strips_crlf() {
        assert_eq!(collect(b"one\r\ntwo\r\n"), ["one", "two"]);
    }

    #[test]
    fn emits_final_unterminated_line() {
        assert_eq!(collect(b"one\npartial"), ["one", "partial"]);
    }

    #[test]
    fn splits_oversized_lines_without_loss() {
        let mut input = vec![b'a'; MAX_LINE_BYTES + 10];
        input.push(b'\n');
        let lines = collect(&input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert_eq!(lines[1].len(), 10);
        assert_eq!(lines.iter().map(String::len).sum::<usize>(), MAX_LINE_BYTES + 10);
    }

    #[test]
    fn split_boundary_carriage_return_is_preserved() {
        // A literal \r that happens to land exactly on the split boundary
        // of a still-unterminated line must not be mistaken for a CRLF
        // terminator.
        let mut input = vec![b'a'; MAX_LINE_BYTES - 1];
        input.push(b'\r');
        input.extend_from_slice(b"tail\n");
        let lines = collect(&input);
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_LINE_BYTES);
        assert!(lines[0].ends_with('\r'), "split byte must survive");
        assert_eq!(lines[1], "tail");
    }

    #[test]
    fn unterminated_trailing_carriage_return_is_preserved() {
        let lines = collect(b"partial\r");
        assert_eq!(lines, ["partial\r"]);
    }

    #[test]
    fn lossy_decodes_invalid_utf8() {
        let lines = collect(b"ok\xff\n");
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("ok"));
    }

    #[test]
    fn numeric_user_and_group_resolve_without_lookup() {
        assert_eq!(resolve_uid("1000").unwrap(), 1000);
        assert_eq!(resolve_gid("0").unwrap(), 0);
    }

    #[test]
    fn unknown_user_is_an_error() {
        let err = resolve_uid("no-such-user-regilo").unwrap_err();
        assert!(err.to_string().contains("no-such-user-regilo"));
    }

    #[test]
    fn spawn_and_wait_reports_exit_code() {
        let args = vec!["-c".to_string(), "exit 7".to_string()];
        let spec = ChildSpec {
            path: "/bin/sh",
            args: &args,
            workdir: None,
            user: None,
            group: None,
            capture_output: false,
        };
        let (mut child, reader) = spawn(&spec).unwrap();
        assert!(reader.is_none());
        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[test]
    fn spawn_merges_stdout_and_stderr() {
        let args = vec![
            "-c".to_string(),
            "echo out; echo err 1>&2".to_string(),
        ];
        let spec = ChildSpec {
            path: "/bin/sh",
            args: &args,
            workdir: None,
            user: None,
            group: None,
            capture_output: true,
        };
        let (mut child, reader) = spawn(&spec).unwrap();
        let mut lines = Vec::new();
        reader
            .expect("captured child has a reader")
            .pump(|line| lines.push(line.to_string()));
        child.wait().unwrap();
        lines.sort();
        assert_eq!(lines, ["err", "out"]);
    }

    #[test]
    fn spawn_missing_binary_is_an_error() {
        let spec = ChildSpec {
            path: "/no/such/binary",
            args: &[],
            workdir: None,
            user: None,
            group: None,
            capture_output: false,
        };
        assert!(spawn(&spec).is_err());
    }

    #[test]
    fn poll_returns_none_while_running_then_status() {
        let args = vec!["-c".to_string(), "sleep 0.3".to_string()];
        let spec = ChildSpec {
            path: "/bin/sh",
            args: &args,
            workdir: None,
            user: None,
            group: None,
            capture_output: false,
        };
        let (mut child, _) = spawn(&spec).unwrap();
        assert!(child.poll().unwrap().is_none());
        let status = child.wait().unwrap();
        assert!(status.success());
        assert!(child.poll().unwrap().is_some());
    }

    #[test]
    fn signal_to_reaped_child_is_tolerated() {
        let args = vec!["-c".to_string(), "exit 0".to_string()];
        let spec = ChildSpec {
            path: "/bin/sh",
            args: &args,
            workdir: None,
            user: None,
            group: None,
            capture_output: false,
        };
        let (mut child, _) = spawn(&spec).unwrap();
        child.wait().unwrap();
        // Pid is reaped; ESRCH must be swallowed. Signal 0 probes existence
        // without delivering anything in case the pid was reused.
        child.signal(0).unwrap();
    }
}
