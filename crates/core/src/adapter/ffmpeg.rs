use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio_util::sync::CancellationToken;

use super::{AdapterHandle, EventSink, OpenRequest, SourceAdapter};
use crate::error::{MuxError, Result};
use crate::relay::Framing;
use crate::stream::StreamId;

const READ_CHUNK: usize = 64 * 1024;

/// Stderr fragments ffmpeg prints when the source cannot be reached.
const FAILURE_MARKERS: &[&str] = &[
    "Connection refused",
    "Connection timed out",
    "401 Unauthorized",
    "404 Not Found",
    "Invalid data found",
    "No route to host",
];

/// Pulls the source with an ffmpeg subprocess and relays MPEG-TS from its stdout.
///
/// Health comes from the process diagnostics: `-progress pipe:2` makes
/// ffmpeg print `frame=` / `progress=` lines once encoding runs, and known
/// connection failures are matched on the same stream.
pub struct FfmpegAdapter {
    binary: String,
    grace: Duration,
}

impl FfmpegAdapter {
    pub fn new(binary: &str, grace: Duration) -> Self {
        Self {
            binary: binary.to_string(),
            grace,
        }
    }

    /// Command line for one attempt.
    pub fn build_args(request: &OpenRequest) -> Vec<String> {
        let profile = request.profile;
        let mut args: Vec<String> = [
            "-hide_banner",
            "-nostats",
            "-loglevel",
            "error",
            "-progress",
            "pipe:2",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        if request.locator.starts_with("rtsp://") || request.locator.starts_with("rtsps://") {
            args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
        }
        args.extend([
            "-i".to_string(),
            request.locator.clone(),
            "-vf".to_string(),
            format!("scale={}:{}", profile.width, profile.height),
            "-r".to_string(),
            profile.fps.to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "veryfast".to_string(),
            "-tune".to_string(),
            "zerolatency".to_string(),
            "-b:v".to_string(),
            format!("{}k", profile.bitrate_kbps),
        ]);
        if request.audio {
            args.extend(["-c:a".to_string(), "aac".to_string()]);
        } else {
            args.push("-an".to_string());
        }
        args.extend(["-f".to_string(), "mpegts".to_string(), "pipe:1".to_string()]);
        args
    }
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum StderrLine {
    /// Output is flowing.
    Progress,
    /// The source could not be reached.
    Failure(String),
    Other,
}

pub(crate) fn classify_stderr(line: &str) -> StderrLine {
    let line = line.trim();
    if line.starts_with("frame=") || line.starts_with("progress=") || line.contains("Press [q]") {
        return StderrLine::Progress;
    }
    if FAILURE_MARKERS.iter().any(|marker| line.contains(marker)) {
        return StderrLine::Failure(line.to_string());
    }
    StderrLine::Other
}

#[async_trait]
impl SourceAdapter for FfmpegAdapter {
    fn name(&self) -> &'static str {
        "ffmpeg"
    }

    fn framing(&self) -> Framing {
        Framing::raw("video/mp2t")
    }

    async fn open(&self, request: OpenRequest) -> Result<AdapterHandle> {
        let args = Self::build_args(&request);
        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MuxError::Connect(format!("failed to spawn {}: {e}", self.binary)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MuxError::Connect("ffmpeg stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MuxError::Connect("ffmpeg stderr not captured".to_string()))?;

        tracing::debug!(
            stream = %request.id,
            pid = child.id(),
            audio = request.audio,
            "ffmpeg started"
        );

        let grace = self.grace;
        let id = request.id;
        Ok(AdapterHandle::spawn(grace, move |sink, cancel| {
            run(child, stdout, stderr, sink, cancel, grace, id)
        }))
    }
}

async fn run(
    mut child: Child,
    mut stdout: ChildStdout,
    stderr: ChildStderr,
    sink: EventSink,
    cancel: CancellationToken,
    grace: Duration,
    id: StreamId,
) {
    let mut stderr = BufReader::new(stderr).lines();
    let mut stderr_open = true;
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    let exit_reason = loop {
        buf.reserve(READ_CHUNK);
        tokio::select! {
            _ = cancel.cancelled() => break None,
            read = stdout.read_buf(&mut buf) => match read {
                Ok(0) => break Some("ffmpeg closed its output".to_string()),
                Ok(_) => {
                    if !sink.data(buf.split().freeze()).await {
                        break None;
                    }
                }
                Err(e) => break Some(format!("ffmpeg output read failed: {e}")),
            },
            line = stderr.next_line(), if stderr_open => match line {
                Ok(Some(line)) => match classify_stderr(&line) {
                    StderrLine::Progress => {
                        if !sink.connected().await {
                            break None;
                        }
                    }
                    StderrLine::Failure(message) => {
                        if !sink.error(message).await {
                            break None;
                        }
                    }
                    StderrLine::Other => {
                        tracing::trace!(stream = %id, line = %line, "ffmpeg");
                    }
                },
                Ok(None) | Err(_) => stderr_open = false,
            },
        }
    };

    let status = stop_child(&mut child, grace, &id).await;
    if let Some(reason) = exit_reason {
        let message = match status {
            Some(status) => format!("{reason} ({status})"),
            None => reason,
        };
        sink.error(message).await;
    }
}

/// Ask ffmpeg to quit with `q` on stdin, killing it after `grace`.
async fn stop_child(child: &mut Child, grace: Duration, id: &StreamId) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    let stdin = child.stdin.take();
    let graceful = tokio::time::timeout(grace, async {
        if let Some(mut stdin) = stdin {
            let _ = stdin.write_all(b"q").await;
            let _ = stdin.flush().await;
        }
        child.wait().await
    })
    .await;

    match graceful {
        Ok(Ok(status)) => {
            tracing::debug!(stream = %id, %status, "ffmpeg exited");
            Some(status)
        }
        Ok(Err(e)) => {
            tracing::warn!(stream = %id, error = %e, "failed to wait for ffmpeg");
            None
        }
        Err(_) => {
            tracing::warn!(
                stream = %id,
                grace_ms = grace.as_millis() as u64,
                "ffmpeg ignored quit, killing"
            );
            if let Err(e) = child.kill().await {
                tracing::warn!(stream = %id, error = %e, "failed to kill ffmpeg");
            }
            child.try_wait().ok().flatten()
        }
    }
}
