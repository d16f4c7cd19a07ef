use std::io;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::output::OutputStreamer;
use crate::types::OutputBlob;

/// How long a cancelled job gets to shut down before its process group is
/// sent SIGKILL.
pub const WAIT_DELAY: Duration = Duration::from_secs(10);

/// The four end states are deliberately finer-grained than an exit code.
/// `Stopped` means the process observed the server's own SIGTERM and went
/// down cooperatively; `Killed` means the grace period elapsed and SIGKILL
/// was needed, so the software may have been left in an inconsistent state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Running = 0,
    Completed = 1,
    Stopped = 2,
    Killed = 3,
    Failed = 4,
}

struct StatusCell(AtomicU8);

impl StatusCell {
    fn new(status: Status) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    fn store(&self, status: Status) {
        self.0.store(status as u8, Ordering::Release);
    }

    fn load(&self) -> Status {
        match self.0.load(Ordering::Acquire) {
            0 => Status::Running,
            1 => Status::Completed,
            2 => Status::Stopped,
            3 => Status::Killed,
            _ => Status::Failed,
        }
    }
}

/// A single child process together with its output streamer, cancellation
/// handle, and status cell.
///
/// The process is placed into its cgroup leaf between fork and exec, so it
/// never runs outside the leaf. Stopping is asynchronous: `stop` trips the
/// cancellation token and returns; the terminator task translates that into
/// SIGTERM (and SIGKILL after [`WAIT_DELAY`]) while the reaper records the
/// terminal status once the process is gone.
pub struct Job {
    streamer: Arc<OutputStreamer>,
    cancel: CancellationToken,
    status: Arc<StatusCell>,
    done: Arc<watch::Sender<bool>>,
}

impl Job {
    /// Spawn a process into the cgroup leaf behind `cgroup_fd` and start
    /// its background tasks. On spawn failure no job exists: the caller
    /// must throw the cgroup leaf away.
    pub fn start(
        shutdown: &CancellationToken,
        cgroup_fd: RawFd,
        cmd: &str,
        args: &[String],
    ) -> Result<Self> {
        Self::start_with_grace(shutdown, cgroup_fd, cmd, args, WAIT_DELAY)
    }

    pub(crate) fn start_with_grace(
        shutdown: &CancellationToken,
        cgroup_fd: RawFd,
        cmd: &str,
        args: &[String],
        grace: Duration,
    ) -> Result<Self> {
        let streamer = Arc::new(OutputStreamer::new());
        let cancel = shutdown.child_token();
        let status = Arc::new(StatusCell::new(Status::Running));
        let (done, _) = watch::channel(false);
        let done = Arc::new(done);

        let mut command = Command::new(cmd);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // the job gets its own process group so signals reach the
            // whole tree and miss the server
            .process_group(0);
        unsafe {
            command.pre_exec(move || enter_cgroup(cgroup_fd));
        }

        let mut child = command.spawn().map_err(Error::SpawnFailed)?;
        debug!(cmd, pid = child.id(), "spawned job process");

        let stdout_pump = child.stdout.take().map(|out| pump(out, Arc::clone(&streamer)));
        let stderr_pump = child.stderr.take().map(|err| pump(err, Arc::clone(&streamer)));

        if let Some(pid) = child.id() {
            let pgid = Pid::from_raw(pid as i32);
            let cancel = cancel.clone();
            let mut done_rx = done.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = done_rx.wait_for(|done| *done) => return,
                }
                let _ = killpg(pgid, Signal::SIGTERM);
                tokio::select! {
                    _ = done_rx.wait_for(|done| *done) => {}
                    _ = tokio::time::sleep(grace) => {
                        warn!(pid, "grace period elapsed, force killing job process group");
                        let _ = killpg(pgid, Signal::SIGKILL);
                    }
                }
            });
        }

        {
            let streamer = Arc::clone(&streamer);
            let status = Arc::clone(&status);
            let cancel = cancel.clone();
            let done = Arc::clone(&done);
            tokio::spawn(async move {
                let wait = child.wait().await;

                // The pipes can outlive the child when descendants inherit
                // them; give them the same grace the process tree got.
                let drain = async {
                    if let Some(pump) = stdout_pump {
                        let _ = pump.await;
                    }
                    if let Some(pump) = stderr_pump {
                        let _ = pump.await;
                    }
                };
                if tokio::time::timeout(grace, drain).await.is_err() {
                    warn!("output pipes still held after job exit, abandoning them");
                }

                let terminal = terminal_status(wait, cancel.is_cancelled());
                debug!(status = ?terminal, "job reached terminal status");
                status.store(terminal);
                streamer.close_writer();
                done.send_replace(true);
            });
        }

        Ok(Self {
            streamer,
            cancel,
            status,
            done,
        })
    }

    /// Request termination. Returns immediately; the process is signalled
    /// asynchronously and reaches a terminal status within the grace period
    /// plus kill latency. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    /// Stream the combined stdout/stderr from the beginning. The stream
    /// ends when `cancel` fires or when the job is done and the reader has
    /// drained the buffer.
    pub fn output_stream(&self, cancel: CancellationToken) -> mpsc::Receiver<OutputBlob> {
        self.streamer.new_reader(cancel)
    }

    /// Wait until the terminal status has been recorded.
    pub async fn wait(&self) {
        let mut done = self.done.subscribe();
        let _ = done.wait_for(|done| *done).await;
    }
}

fn pump(
    mut reader: impl AsyncRead + Unpin + Send + 'static,
    streamer: Arc<OutputStreamer>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = BytesMut::with_capacity(4096);
        loop {
            match reader.read_buf(&mut buf).await {
                Ok(n) if n > 0 => {
                    let blob = buf.split().freeze();
                    if streamer.write(&blob).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    })
}

// Translate what wait(2) reported into the public taxonomy. The reaper
// never fails: anything unexpected is a plain `Failed`.
fn terminal_status(wait: io::Result<ExitStatus>, cancelled: bool) -> Status {
    let Ok(exit) = wait else {
        return Status::Failed;
    };
    if let Some(signal) = exit.signal() {
        if signal == Signal::SIGTERM as i32 {
            Status::Stopped
        } else if signal == Signal::SIGKILL as i32 {
            Status::Killed
        } else {
            Status::Failed
        }
    } else if exit.success() {
        // a clean exit after cancellation means the process honored our
        // SIGTERM, which is still a stop from the user's point of view
        if cancelled {
            Status::Stopped
        } else {
            Status::Completed
        }
    } else {
        Status::Failed
    }
}

// Runs between fork and exec: move the process into the cgroup leaf by
// writing `0` (the calling process) through the open directory fd.
fn enter_cgroup(dir_fd: RawFd) -> io::Result<()> {
    let fd = unsafe {
        libc::openat(
            dir_fd,
            c"cgroup.procs".as_ptr(),
            libc::O_WRONLY | libc::O_CLOEXEC | libc::O_CREAT,
            0o644 as libc::c_uint,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = unsafe { libc::write(fd, b"0".as_ptr().cast(), 1) };
    let err = io::Error::last_os_error();
    unsafe { libc::close(fd) };
    if written != 1 {
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use tempfile::TempDir;
    use tokio::time::timeout;

    // An open directory standing in for a cgroup leaf; `cgroup.procs`
    // becomes a plain file on first write.
    fn scratch_cgroup() -> (TempDir, File) {
        let dir = tempfile::tempdir().expect("tempdir");
        let handle = File::open(dir.path()).expect("open dir");
        (dir, handle)
    }

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_done(job: &Job) {
        timeout(Duration::from_secs(30), job.wait())
            .await
            .expect("job never reached a terminal status");
    }

    async fn collect(mut rx: mpsc::Receiver<OutputBlob>) -> Vec<u8> {
        let mut bytes = vec![];
        while let Some(chunk) = rx.recv().await {
            bytes.extend_from_slice(&chunk);
        }
        bytes
    }

    #[tokio::test]
    async fn echo_job_completes_with_its_output() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let job = Job::start(&shutdown, cg.as_raw_fd(), "echo", &args(&["hello"]))
            .expect("job start err");

        wait_done(&job).await;
        assert_eq!(job.status(), Status::Completed);

        let output = collect(job.output_stream(CancellationToken::new())).await;
        assert_eq!(output, b"hello\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_failed() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let job = Job::start(&shutdown, cg.as_raw_fd(), "sh", &args(&["-c", "exit 7"]))
            .expect("job start err");

        wait_done(&job).await;
        assert_eq!(job.status(), Status::Failed);
    }

    #[tokio::test]
    async fn stop_terminates_a_sleeping_job() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let job = Job::start(&shutdown, cg.as_raw_fd(), "sleep", &args(&["30"]))
            .expect("job start err");

        assert_eq!(job.status(), Status::Running);
        job.stop();
        job.stop(); // idempotent
        wait_done(&job).await;
        assert_eq!(job.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn stop_honored_by_a_trap_is_still_stopped() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let script = "trap 'exit 0' TERM; while true; do sleep 1; done";
        let job = Job::start(&shutdown, cg.as_raw_fd(), "sh", &args(&["-c", script]))
            .expect("job start err");

        tokio::time::sleep(Duration::from_millis(200)).await;
        job.stop();
        wait_done(&job).await;
        assert_eq!(job.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn job_ignoring_sigterm_is_killed() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let script = "trap '' TERM; while true; do sleep 1; done";
        let job = Job::start_with_grace(
            &shutdown,
            cg.as_raw_fd(),
            "sh",
            &args(&["-c", script]),
            Duration::from_millis(500),
        )
        .expect("job start err");

        tokio::time::sleep(Duration::from_millis(200)).await;
        job.stop();
        wait_done(&job).await;
        assert_eq!(job.status(), Status::Killed);
    }

    #[tokio::test]
    async fn server_shutdown_cancels_the_job() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let job = Job::start(&shutdown, cg.as_raw_fd(), "sleep", &args(&["30"]))
            .expect("job start err");

        shutdown.cancel();
        wait_done(&job).await;
        assert_eq!(job.status(), Status::Stopped);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_and_leaves_no_job() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let result = Job::start(&shutdown, cg.as_raw_fd(), "no-such-binary-anywhere", &[]);
        assert!(matches!(result, Err(Error::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn live_reader_sees_output_as_it_happens() {
        let (_dir, cg) = scratch_cgroup();
        let shutdown = CancellationToken::new();
        let script = "printf A; sleep 1; printf B";
        let job = Job::start(&shutdown, cg.as_raw_fd(), "sh", &args(&["-c", script]))
            .expect("job start err");

        // subscribe while the job is still running
        let reader = job.output_stream(CancellationToken::new());
        let output = timeout(Duration::from_secs(30), collect(reader))
            .await
            .expect("stream never ended");
        assert_eq!(output, b"AB");
        assert_eq!(job.status(), Status::Completed);
    }

    #[test]
    fn terminal_status_taxonomy() {
        let exit = |code: i32| Ok(ExitStatus::from_raw(code << 8));
        let signalled = |sig: i32| Ok(ExitStatus::from_raw(sig));

        assert_eq!(terminal_status(exit(0), false), Status::Completed);
        assert_eq!(terminal_status(exit(0), true), Status::Stopped);
        assert_eq!(terminal_status(exit(7), false), Status::Failed);
        assert_eq!(
            terminal_status(signalled(Signal::SIGTERM as i32), true),
            Status::Stopped
        );
        assert_eq!(
            terminal_status(signalled(Signal::SIGKILL as i32), true),
            Status::Killed
        );
        assert_eq!(
            terminal_status(signalled(Signal::SIGHUP as i32), false),
            Status::Failed
        );
        assert_eq!(
            terminal_status(Err(io::Error::other("wait anomaly")), false),
            Status::Failed
        );
    }
}
