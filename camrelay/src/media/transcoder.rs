use std::ffi::{OsStr, OsString};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::RelayError;

use super::workdir::WorkDir;

/// How long a terminated transcoder gets to exit before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/**
    Segment retention policy passed to `-hls_flags`.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum HlsFlags {
    /// Delete segments that fall out of the sliding window.
    #[default]
    DeleteSegments,
    /// Keep every segment and append to the playlist.
    AppendList,
}

impl HlsFlags {
    pub fn as_str(&self) -> &'static str {
        match self {
            HlsFlags::DeleteSegments => "delete_segments+omit_endlist+independent_segments",
            HlsFlags::AppendList => "append_list+omit_endlist+independent_segments",
        }
    }
}

/**
    Everything needed to launch one transcoder run.
*/
#[derive(Debug, Clone)]
pub struct TranscodeJob {
    pub ffmpeg: PathBuf,
    pub input_url: String,
    pub rtsp_transport: String,
    pub workdir: WorkDir,
    pub hls_flags: HlsFlags,
    pub search_path: Option<OsString>,
}

impl TranscodeJob {
    /// Low-latency RTSP to H.264 HLS with 1 s segments and a 12-entry window.
    pub fn args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "-hide_banner",
            "-loglevel",
            "info",
            "-rtsp_transport",
            self.rtsp_transport.as_str(),
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-i",
            self.input_url.as_str(),
            "-an",
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-pix_fmt",
            "yuv420p",
            "-g",
            "25",
            "-keyint_min",
            "25",
            "-sc_threshold",
            "0",
            "-f",
            "hls",
            "-hls_time",
            "1",
            "-hls_list_size",
            "12",
            "-hls_flags",
            self.hls_flags.as_str(),
            "-hls_segment_filename",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        args.push(self.workdir.segment_template().into_os_string());
        args.push(self.workdir.manifest_path().into_os_string());
        args
    }
}

/**
    How a transcoder run ended.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    /// Killed by a signal; treated as an intentional termination.
    Signaled,
    WaitFailed,
}

impl ExitOutcome {
    fn from_status(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ExitOutcome::Exited(code),
            None => ExitOutcome::Signaled,
        }
    }

    /// A non-zero exit code that nobody asked for.
    pub fn failure_code(&self) -> Option<i32> {
        match self {
            ExitOutcome::Exited(code) if *code != 0 => Some(*code),
            _ => None,
        }
    }
}

/// Sent when a transcoder exits on its own.
#[derive(Debug, Clone, Copy)]
pub struct ExitNotice {
    pub session: u64,
    pub outcome: ExitOutcome,
}

/**
    Handle to a running transcoder.

    A monitor task owns the child. Natural exits are reported as an
    `ExitNotice`; exits caused by `terminate` are not.
*/
pub struct TranscoderProcess {
    pid: Option<u32>,
    stop_tx: Option<oneshot::Sender<()>>,
    monitor: JoinHandle<Option<ExitOutcome>>,
}

impl TranscoderProcess {
    pub fn spawn<E>(
        job: &TranscodeJob,
        session: u64,
        events: mpsc::UnboundedSender<E>,
    ) -> Result<Self, RelayError>
    where
        E: From<ExitNotice> + Send + 'static,
    {
        let log_path = job.workdir.transcoder_log_path();
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| RelayError::io(&log_path, e))?;
        let stderr = log.try_clone().map_err(|e| RelayError::io(&log_path, e))?;

        let mut command = Command::new(&job.ffmpeg);
        command
            .args(job.args())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true);
        if let Some(path) = &job.search_path {
            command.env("PATH", path);
        }

        let child = command.spawn().map_err(|e| {
            let message = format!("Failed to start ffmpeg: {e}");
            let _ = std::fs::write(&log_path, format!("{message}\n"));
            RelayError::Configuration(message)
        })?;

        let pid = child.id();
        tracing::info!(session, pid, ffmpeg = %job.ffmpeg.display(), "transcoder spawned");

        let (stop_tx, stop_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(child, session, stop_rx, events));

        Ok(Self {
            pid,
            stop_tx: Some(stop_tx),
            monitor,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the transcoder to exit and wait until it has.
    pub async fn terminate(mut self) -> Option<ExitOutcome> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.monitor.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(error = %e, "transcoder monitor task failed");
                None
            }
        }
    }
}

async fn monitor<E>(
    mut child: Child,
    session: u64,
    stop_rx: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<E>,
) -> Option<ExitOutcome>
where
    E: From<ExitNotice> + Send + 'static,
{
    tokio::select! {
        status = child.wait() => {
            let outcome = match status {
                Ok(status) => ExitOutcome::from_status(status),
                Err(e) => {
                    tracing::warn!(session, error = %e, "failed to wait on transcoder");
                    ExitOutcome::WaitFailed
                }
            };
            let _ = events.send(E::from(ExitNotice { session, outcome }));
            Some(outcome)
        }
        _ = stop_rx => {
            let outcome = terminate_child(&mut child).await;
            tracing::info!(session, ?outcome, "transcoder terminated");
            outcome
        }
    }
}

async fn terminate_child(child: &mut Child) -> Option<ExitOutcome> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = child.id()
            && kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok()
            && let Ok(Ok(status)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await
        {
            return Some(ExitOutcome::from_status(status));
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "failed to kill transcoder");
    }
    child.wait().await.ok().map(ExitOutcome::from_status)
}

/**
    Kill transcoders left over from an earlier run that still write to
    `manifest`. Best effort: a missing `pkill` is not an error.
*/
pub async fn kill_stray(manifest: &Path) {
    #[cfg(unix)]
    {
        let result = Command::new("pkill")
            .arg("-f")
            .arg(OsStr::new(manifest))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match result {
            // pkill exits 1 when nothing matched.
            Ok(status) if status.success() => {
                tracing::warn!(manifest = %manifest.display(), "killed stray transcoder");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "pkill unavailable"),
        }
    }
    #[cfg(not(unix))]
    let _ = manifest;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(dir: &Path) -> TranscodeJob {
        TranscodeJob {
            ffmpeg: PathBuf::from("/usr/bin/ffmpeg"),
            input_url: "rtsp://cam:554/live".to_string(),
            rtsp_transport: "tcp".to_string(),
            workdir: WorkDir::new(dir),
            hls_flags: HlsFlags::default(),
            search_path: None,
        }
    }

    fn value_after<'a>(args: &'a [OsString], flag: &str) -> &'a OsStr {
        let pos = args.iter().position(|a| a == flag).unwrap();
        &args[pos + 1]
    }

    #[test]
    fn test_args_template() {
        let dir = Path::new("/tmp/hls");
        let args = job(dir).args();

        assert_eq!(value_after(&args, "-rtsp_transport"), "tcp");
        assert_eq!(value_after(&args, "-i"), "rtsp://cam:554/live");
        assert_eq!(value_after(&args, "-c:v"), "libx264");
        assert_eq!(value_after(&args, "-hls_time"), "1");
        assert_eq!(value_after(&args, "-hls_list_size"), "12");
        assert_eq!(
            value_after(&args, "-hls_flags"),
            "delete_segments+omit_endlist+independent_segments"
        );
        assert_eq!(
            value_after(&args, "-hls_segment_filename"),
            dir.join("segment-%03d.ts").as_os_str()
        );
        assert_eq!(args.last().unwrap(), dir.join("master.m3u8").as_os_str());
        assert!(args.iter().any(|a| a == "-an"));
    }

    #[test]
    fn test_append_list_policy() {
        let mut job = job(Path::new("/tmp/hls"));
        job.hls_flags = HlsFlags::AppendList;
        let args = job.args();
        assert_eq!(
            value_after(&args, "-hls_flags"),
            "append_list+omit_endlist+independent_segments"
        );
    }

    #[test]
    fn test_failure_code() {
        assert_eq!(ExitOutcome::Exited(1).failure_code(), Some(1));
        assert_eq!(ExitOutcome::Exited(0).failure_code(), None);
        assert_eq!(ExitOutcome::Signaled.failure_code(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_natural_exit_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path());
        job.ffmpeg = PathBuf::from("/bin/sh");
        // `sh` rejects the ffmpeg flags and exits non-zero.
        let (tx, mut rx) = mpsc::unbounded_channel::<ExitNotice>();

        let process = TranscoderProcess::spawn(&job, 7, tx).unwrap();
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.session, 7);
        assert!(notice.outcome.failure_code().is_some());
        assert!(process.terminate().await.is_some());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_configuration_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path());
        job.ffmpeg = tmp.path().join("missing-ffmpeg");
        let (tx, _rx) = mpsc::unbounded_channel::<ExitNotice>();

        let err = TranscoderProcess::spawn(&job, 1, tx).err().unwrap();
        assert!(matches!(err, RelayError::Configuration(_)));
        let log = std::fs::read_to_string(tmp.path().join("ffmpeg.log")).unwrap();
        assert!(log.starts_with("Failed to start ffmpeg"));
    }
}
