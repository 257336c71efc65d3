//! Child processes with a deadline and capped output capture.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

const READ_CHUNK: usize = 8192;

/// Bytes kept from one pipe plus how many were drained and thrown away.
#[derive(Debug, Default)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Captured {
    pub fn lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(u8::is_ascii_whitespace)
    }
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    /// The deadline passed and the child was killed.
    pub timed_out: bool,
}

/// Spawn `cmd`, feed it `input`, and wait at most `deadline` for it to exit.
///
/// Both pipes are drained on their own tasks so a chatty child cannot block
/// on a full pipe; at most `cap` bytes of each are kept. The child is killed
/// when the deadline passes and when the returned future is dropped.
#[instrument(skip_all, fields(deadline_ms = deadline.as_millis() as u64, cap))]
pub async fn run_process(
    mut cmd: Command,
    input: Option<Vec<u8>>,
    deadline: Duration,
    cap: usize,
) -> Result<ProcessOutput> {
    cmd.stdin(if input.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|err| {
        error!(%err, "worker process failed to start");
        anyhow!(err).context("spawn command")
    })?;

    if let Some(input) = input {
        let mut pipe = child.stdin.take().context("child stdin missing")?;
        tokio::spawn(async move {
            // EPIPE here just means the child stopped reading early.
            if let Err(err) = pipe.write_all(&input).await {
                debug!(%err, "child closed stdin early");
            }
        });
    }

    let stdout = drain(child.stdout.take().context("child stdout missing")?, cap);
    let stderr = drain(child.stderr.take().context("child stderr missing")?, cap);

    let (status, timed_out) = match tokio::time::timeout(deadline, child.wait()).await {
        Ok(waited) => (waited.context("wait for command")?, false),
        Err(_) => {
            warn!(deadline_ms = deadline.as_millis() as u64, "deadline passed, killing child");
            child.kill().await.context("kill command")?;
            (child.wait().await.context("reap killed command")?, true)
        }
    };

    let stdout = collect(stdout).await.context("capture stdout")?;
    let stderr = collect(stderr).await.context("capture stderr")?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(stdout_dropped = stdout.dropped, stderr_dropped = stderr.dropped, "capture cap reached");
    }

    debug!(code = ?status.code(), timed_out, "child exited");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        timed_out,
    })
}

fn drain<R>(reader: R, cap: usize) -> JoinHandle<Result<Captured>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(capture(reader, cap))
}

async fn collect(handle: JoinHandle<Result<Captured>>) -> Result<Captured> {
    handle.await.map_err(|err| anyhow!("pipe reader task failed: {err}"))?
}

async fn capture<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> Result<Captured> {
    let mut captured = Captured::default();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).await.context("read pipe")?;
        if read == 0 {
            return Ok(captured);
        }
        let room = cap.saturating_sub(captured.bytes.len()).min(read);
        captured.bytes.extend_from_slice(&chunk[..room]);
        captured.dropped += read - room;
    }
}
