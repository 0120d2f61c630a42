use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::camera::InputProvider;
use crate::error::RelayError;
use crate::server::{DeliveryServer, ServerNotice};
use crate::util::time::now;

use super::readiness::{self, ReadinessConfig, ReadinessNotice};
use super::status::{Phase, PublishedStatus};
use super::transcoder::{self, ExitNotice, ExitOutcome, HlsFlags, TranscodeJob, TranscoderProcess};
use super::watchdog::{self, PlaybackSurface, WatchdogConfig, WatchdogNotice};
use super::workdir::WorkDir;

pub const FFMPEG_NOT_FOUND: &str = "ffmpeg not found. Use local nix build or set FFMPEG_PATH.";
pub const TRANSCODER_EXITED: &str = "transcoder exited";

const MAX_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub work_dir: PathBuf,
    pub hls_flags: HlsFlags,
    pub readiness: ReadinessConfig,
    pub watchdog: WatchdogConfig,
    /// Pause between the stop and start halves of a reload.
    pub reload_settle: Duration,
}

impl SupervisorConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            hls_flags: HlsFlags::default(),
            readiness: ReadinessConfig::default(),
            watchdog: WatchdogConfig::default(),
            reload_settle: Duration::from_millis(300),
        }
    }
}

/**
    Restart delay policy: `min(2^attempt, 10)` seconds, where the attempt
    counts unexpected failures since the last manual start.
*/
#[derive(Debug, Default)]
pub struct Backoff {
    attempt: u32,
}

impl Backoff {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Count one more failure and return how long to wait before restarting.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let secs = 1u64.checked_shl(self.attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(MAX_BACKOFF)
    }
}

#[derive(Debug, Error)]
#[error("{0} task is already armed")]
pub struct SlotOccupied(&'static str);

/**
    Holder for one cancellable background task.

    A slot must be cancelled (or released once its task has finished)
    before it can be armed again.
*/
#[derive(Debug)]
pub struct TaskSlot {
    name: &'static str,
    handle: Option<JoinHandle<()>>,
}

impl TaskSlot {
    pub fn new(name: &'static str) -> Self {
        Self { name, handle: None }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn arm(&mut self, handle: JoinHandle<()>) -> Result<(), SlotOccupied> {
        if self.is_armed() {
            handle.abort();
            return Err(SlotOccupied(self.name));
        }
        self.handle = Some(handle);
        Ok(())
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget a task that has completed on its own.
    pub fn release(&mut self) {
        self.handle = None;
    }
}

/// Everything the worker reacts to, in submission order.
#[derive(Debug)]
enum Event {
    Start(oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    Reload(oneshot::Sender<()>),
    Server(ServerNotice),
    Readiness(ReadinessNotice),
    Exited(ExitNotice),
    RestartDue { session: u64 },
    Watchdog(WatchdogNotice),
    Shutdown,
}

impl From<ServerNotice> for Event {
    fn from(notice: ServerNotice) -> Self {
        Event::Server(notice)
    }
}

impl From<ReadinessNotice> for Event {
    fn from(notice: ReadinessNotice) -> Self {
        Event::Readiness(notice)
    }
}

impl From<ExitNotice> for Event {
    fn from(notice: ExitNotice) -> Self {
        Event::Exited(notice)
    }
}

impl From<WatchdogNotice> for Event {
    fn from(notice: WatchdogNotice) -> Self {
        Event::Watchdog(notice)
    }
}

struct HandleInner {
    events: mpsc::UnboundedSender<Event>,
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let _ = self.events.send(Event::Shutdown);
    }
}

/**
    Control surface of a running relay.

    `start`, `reload` and `stop` are queued onto the supervisor worker and
    resolve once the worker has carried them out. Dropping the last handle
    stops the session and ends the worker.
*/
#[derive(Clone)]
pub struct RelayHandle {
    inner: Arc<HandleInner>,
    status: watch::Receiver<PublishedStatus>,
}

impl RelayHandle {
    pub fn spawn(
        inputs: Arc<dyn InputProvider>,
        config: SupervisorConfig,
        surface: Option<Arc<dyn PlaybackSurface>>,
    ) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(PublishedStatus::new(inputs.camera_label()));

        let supervisor = Supervisor {
            workdir: WorkDir::new(&config.work_dir),
            inputs,
            config,
            surface,
            events: events.clone(),
            status: status_tx,
            session: 0,
            stop_requested: true,
            backoff: Backoff::default(),
            process: None,
            server: None,
            readiness: TaskSlot::new("readiness"),
            watchdog: TaskSlot::new("watchdog"),
            restart: TaskSlot::new("restart"),
        };
        tokio::spawn(supervisor.run(rx));

        Self {
            inner: Arc::new(HandleInner { events }),
            status,
        }
    }

    pub async fn start(&self) {
        self.request(Event::Start).await;
    }

    pub async fn reload(&self) {
        self.request(Event::Reload).await;
    }

    pub async fn stop(&self) {
        self.request(Event::Stop).await;
    }

    pub fn subscribe(&self) -> watch::Receiver<PublishedStatus> {
        self.status.clone()
    }

    pub fn status(&self) -> PublishedStatus {
        self.status.borrow().clone()
    }

    async fn request(&self, event: impl FnOnce(oneshot::Sender<()>) -> Event) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.events.send(event(ack_tx)).is_err() {
            tracing::warn!("relay worker is gone");
            return;
        }
        let _ = ack_rx.await;
    }
}

/**
    The serialized worker. Sole owner of the session state and sole
    writer of the published status.
*/
struct Supervisor {
    inputs: Arc<dyn InputProvider>,
    config: SupervisorConfig,
    workdir: WorkDir,
    surface: Option<Arc<dyn PlaybackSurface>>,
    events: mpsc::UnboundedSender<Event>,
    status: watch::Sender<PublishedStatus>,
    /// Incremented on every launch; notices from older sessions are dropped.
    session: u64,
    stop_requested: bool,
    backoff: Backoff,
    process: Option<TranscoderProcess>,
    server: Option<DeliveryServer>,
    readiness: TaskSlot,
    watchdog: TaskSlot,
    restart: TaskSlot,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = rx.recv().await {
            match event {
                Event::Start(ack) => {
                    self.start().await;
                    let _ = ack.send(());
                }
                Event::Stop(ack) => {
                    self.stop().await;
                    let _ = ack.send(());
                }
                Event::Reload(ack) => {
                    self.reload().await;
                    let _ = ack.send(());
                }
                Event::Server(notice) => self.on_server(notice),
                Event::Readiness(notice) => self.on_readiness(notice).await,
                Event::Exited(notice) => self.on_exit(notice).await,
                Event::RestartDue { session } => self.on_restart_due(session).await,
                Event::Watchdog(notice) => self.on_watchdog(notice).await,
                Event::Shutdown => {
                    self.stop().await;
                    break;
                }
            }
        }
        tracing::debug!("relay worker finished");
    }

    fn phase(&self) -> Phase {
        self.status.borrow().phase
    }

    fn publish(&self, update: impl FnOnce(&mut PublishedStatus)) {
        self.status.send_if_modified(|status| {
            let before = status.clone();
            update(status);
            *status != before
        });
    }

    fn publish_error(&self, phase: Phase, message: String) {
        self.publish(|s| {
            s.phase = phase;
            s.error_message = Some(message);
            s.last_updated = Some(now());
        });
    }

    async fn start(&mut self) {
        let phase = self.phase();
        if phase.is_active() {
            tracing::debug!(session = self.session, %phase, "start ignored, session already active");
            return;
        }
        self.restart.cancel();
        self.backoff.reset();
        self.launch().await;
    }

    async fn stop(&mut self) {
        self.teardown().await;
        self.publish(|s| s.phase = Phase::Idle);
    }

    async fn reload(&mut self) {
        tracing::info!(session = self.session, "reloading relay");
        self.stop().await;
        tokio::time::sleep(self.config.reload_settle).await;
        self.start().await;
    }

    /// Start a session; any failure before the transcoder is up rests in `Failed`.
    async fn launch(&mut self) {
        if let Err(e) = self.try_launch().await {
            tracing::warn!(session = self.session, error = %e, "relay start failed");
            self.teardown().await;
            self.publish_error(Phase::Failed, e.to_string());
        }
    }

    async fn try_launch(&mut self) -> Result<(), RelayError> {
        let inputs = self.inputs.load()?;
        let ffmpeg = inputs
            .executables
            .ffmpeg
            .clone()
            .ok_or_else(|| RelayError::Configuration(FFMPEG_NOT_FOUND.to_string()))?;
        let url = inputs.source.transport_url()?;

        self.session += 1;
        self.stop_requested = false;
        let session = self.session;
        let label = inputs.camera_label.clone();
        self.publish(|s| {
            s.phase = Phase::Starting;
            s.camera_label = label;
            s.stream_url = None;
            s.lag_seconds = None;
        });
        tracing::info!(session, camera = %inputs.camera_label, "starting relay");

        // Clear, then serve, then spawn: nothing stale is ever served.
        self.workdir.clear()?;
        let server = DeliveryServer::start(&self.workdir, session, self.events.clone());
        let base_url = server.base_url();
        self.server = Some(server);

        self.workdir.write_debug(&inputs.camera_label, &ffmpeg, &url);
        transcoder::kill_stray(&self.workdir.manifest_path()).await;

        let job = TranscodeJob {
            ffmpeg,
            input_url: url,
            rtsp_transport: inputs.source.rtsp_transport().to_string(),
            workdir: self.workdir.clone(),
            hls_flags: self.config.hls_flags,
            search_path: inputs.search_path.clone(),
        };
        self.process = Some(TranscoderProcess::spawn(&job, session, self.events.clone())?);

        let poll = readiness::spawn(
            self.workdir.clone(),
            base_url,
            self.config.readiness,
            session,
            self.events.clone(),
        );
        if let Err(e) = self.readiness.arm(poll) {
            tracing::error!(session, error = %e, "readiness poll not started");
        }
        Ok(())
    }

    /// Cancel timers, stop the transcoder and server, clear stream state.
    async fn teardown(&mut self) {
        self.stop_requested = true;
        self.readiness.cancel();
        self.restart.cancel();

        if let Some(process) = self.process.take() {
            self.publish(|s| s.phase = Phase::Stopping);
            let pid = process.pid();
            let outcome = process.terminate().await;
            tracing::info!(session = self.session, pid, ?outcome, "transcoder stopped");
        }
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        self.watchdog.cancel();

        self.publish(|s| {
            s.stream_url = None;
            s.lag_seconds = None;
        });
    }

    fn on_server(&self, notice: ServerNotice) {
        match notice {
            ServerNotice::Bound { session, base_url } if session == self.session => {
                self.workdir.write_server_url(&base_url);
            }
            ServerNotice::Failed { session, error } if session == self.session => {
                tracing::warn!(session, %error, "delivery server unavailable");
            }
            _ => {}
        }
    }

    async fn on_readiness(&mut self, notice: ReadinessNotice) {
        if notice.session != self.session || self.stop_requested {
            return;
        }
        self.readiness.release();

        match notice.outcome {
            Ok(url) => {
                self.publish(|s| {
                    s.phase = Phase::Live;
                    s.stream_url = Some(url.clone());
                    s.error_message = None;
                    s.last_updated = Some(now());
                });

                if let Some(surface) = &self.surface {
                    let task = watchdog::spawn(
                        Arc::clone(surface),
                        url,
                        self.config.watchdog,
                        self.session,
                        self.events.clone(),
                    );
                    if let Err(e) = self.watchdog.arm(task) {
                        tracing::error!(session = self.session, error = %e, "watchdog not started");
                    }
                }
            }
            Err(e) => {
                self.teardown().await;
                self.publish_error(Phase::Idle, e.to_string());
            }
        }
    }

    async fn on_exit(&mut self, notice: ExitNotice) {
        if notice.session != self.session || self.stop_requested {
            return;
        }
        // The monitor has already reaped the child.
        if self.process.take().is_none() {
            return;
        }
        let session = self.session;

        if let Some(code) = notice.outcome.failure_code() {
            self.teardown().await;
            self.schedule_restart(RelayError::ProcessFailure { code });
            return;
        }

        tracing::info!(session, outcome = ?notice.outcome, "transcoder ended the session");
        self.teardown().await;
        match notice.outcome {
            ExitOutcome::Signaled => self.publish(|s| s.phase = Phase::Idle),
            _ => self.publish_error(Phase::Idle, TRANSCODER_EXITED.to_string()),
        }
    }

    fn schedule_restart(&mut self, error: RelayError) {
        debug_assert!(error.is_retryable());
        let delay = self.backoff.next_delay();
        let attempt = self.backoff.attempt();
        let session = self.session;
        tracing::warn!(
            session,
            error = %error,
            attempt,
            delay_secs = delay.as_secs(),
            "transcoder failed, scheduling restart"
        );
        self.publish_error(Phase::Restarting { attempt, delay }, error.to_string());

        let events = self.events.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RestartDue { session });
        });
        if let Err(e) = self.restart.arm(timer) {
            tracing::error!(session, error = %e, "restart not scheduled");
        }
    }

    async fn on_restart_due(&mut self, session: u64) {
        if session != self.session || !matches!(self.phase(), Phase::Restarting { .. }) {
            return;
        }
        self.restart.release();
        self.launch().await;
    }

    async fn on_watchdog(&mut self, notice: WatchdogNotice) {
        match notice {
            WatchdogNotice::Lag { session, seconds }
                if session == self.session && !self.stop_requested =>
            {
                self.publish(|s| s.lag_seconds = seconds);
            }
            WatchdogNotice::PlaybackFailed { session, detail }
                if session == self.session && !self.stop_requested =>
            {
                // The watchdog has already reloaded the surface.
                self.publish_error(self.phase(), format!("Playback failed: {detail}"));
            }
            _ => {}
        }
    }
}
