use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::RelayError;

use super::workdir::WorkDir;

pub const SERVER_NOT_READY: &str = "Local HLS server not ready.";
pub const STREAM_NOT_STARTED: &str =
    "Stream did not start. Check RTSP credentials or camera reachability.";

#[derive(Debug, Clone, Copy)]
pub struct ReadinessConfig {
    pub interval: Duration,
    pub max_ticks: u32,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            max_ticks: 50,
        }
    }
}

/// Terminal result of one readiness poll.
#[derive(Debug)]
pub struct ReadinessNotice {
    pub session: u64,
    /// The playable stream URL, or why the stream never became playable.
    pub outcome: Result<String, RelayError>,
}

/**
    Per-tick readiness state machine.

    Each tick either resolves the poll or asks for another tick. Once it
    has resolved it never resolves again.
*/
#[derive(Debug)]
pub struct ReadinessPoll {
    ticks: u32,
    max_ticks: u32,
    done: bool,
}

impl ReadinessPoll {
    pub fn new(max_ticks: u32) -> Self {
        Self {
            ticks: 0,
            max_ticks,
            done: false,
        }
    }

    pub fn tick(
        &mut self,
        base_url: Option<&str>,
        manifest_name: &str,
        manifest_ready: impl FnOnce() -> bool,
    ) -> Option<Result<String, RelayError>> {
        if self.done {
            return None;
        }
        self.ticks += 1;
        let exhausted = self.ticks >= self.max_ticks;

        let outcome = match base_url {
            None if exhausted => Some(Err(RelayError::StartupTimeout(SERVER_NOT_READY.into()))),
            None => None,
            Some(base) if manifest_ready() => Some(Ok(format!(
                "{}/{}",
                base.trim_end_matches('/'),
                manifest_name
            ))),
            Some(_) if exhausted => {
                Some(Err(RelayError::StartupTimeout(STREAM_NOT_STARTED.into())))
            }
            Some(_) => None,
        };

        self.done = outcome.is_some();
        outcome
    }
}

/**
    Poll until the delivery server is bound and the manifest is non-empty,
    then report once. Aborting the returned task cancels the poll.
*/
pub fn spawn<E>(
    workdir: WorkDir,
    base_url: watch::Receiver<Option<String>>,
    config: ReadinessConfig,
    session: u64,
    events: mpsc::UnboundedSender<E>,
) -> JoinHandle<()>
where
    E: From<ReadinessNotice> + Send + 'static,
{
    tokio::spawn(async move {
        let mut poll = ReadinessPoll::new(config.max_ticks);
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + config.interval,
            config.interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            let base = base_url.borrow().clone();
            let resolved = poll.tick(base.as_deref(), workdir.manifest_name(), || {
                workdir.manifest_ready()
            });

            if let Some(outcome) = resolved {
                match &outcome {
                    Ok(url) => tracing::info!(
                        session,
                        %url,
                        segments = workdir.segment_count(),
                        "stream ready"
                    ),
                    Err(e) => tracing::warn!(session, error = %e, "stream not ready"),
                }
                let _ = events.send(E::from(ReadinessNotice { session, outcome }));
                return;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ready_once_bound_and_manifest_present() {
        let mut poll = ReadinessPoll::new(50);
        assert!(poll.tick(None, "master.m3u8", || true).is_none());
        assert!(poll.tick(Some("http://127.0.0.1:9000"), "master.m3u8", || false).is_none());

        let url = poll
            .tick(Some("http://127.0.0.1:9000"), "master.m3u8", || true)
            .unwrap()
            .unwrap();
        assert_eq!(url, "http://127.0.0.1:9000/master.m3u8");

        // Terminal: never resolves again.
        assert!(poll.tick(Some("http://127.0.0.1:9000"), "master.m3u8", || true).is_none());
    }

    #[test]
    fn test_server_never_bound() {
        let mut poll = ReadinessPoll::new(50);
        for _ in 0..49 {
            assert!(poll.tick(None, "master.m3u8", || true).is_none());
        }
        let err = poll.tick(None, "master.m3u8", || true).unwrap().unwrap_err();
        assert_eq!(err.to_string(), SERVER_NOT_READY);
    }

    #[test]
    fn test_manifest_never_written() {
        let mut poll = ReadinessPoll::new(50);
        let mut resolved = None;
        for _ in 0..50 {
            resolved = poll.tick(Some("http://127.0.0.1:1"), "master.m3u8", || false);
            if resolved.is_some() {
                break;
            }
        }
        let err = resolved.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::StartupTimeout(ref m) if m == STREAM_NOT_STARTED));
    }

    #[test]
    fn test_manifest_not_checked_before_bind() {
        let mut poll = ReadinessPoll::new(50);
        let outcome = poll.tick(None, "master.m3u8", || panic!("checked too early"));
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn test_spawned_poll_reports_url() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(tmp.path());
        std::fs::write(workdir.manifest_path(), "#EXTM3U\n").unwrap();

        let (_url_tx, url_rx) = watch::channel(Some("http://127.0.0.1:4321".to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel::<ReadinessNotice>();
        let config = ReadinessConfig {
            interval: Duration::from_millis(10),
            max_ticks: 5,
        };

        spawn(workdir, url_rx, config, 3, tx);
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.session, 3);
        assert_eq!(notice.outcome.unwrap(), "http://127.0.0.1:4321/master.m3u8");
    }
}
