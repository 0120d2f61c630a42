use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/**
    Snapshot of the external playback surface, in seconds.
*/
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackTelemetry {
    pub position: Option<f64>,
    /// End of the seekable range.
    pub live_edge: Option<f64>,
    pub playing: bool,
}

/**
    The playback surface owned by the presentation layer.

    The relay never renders video; it reads telemetry from the surface
    and tells it where to seek and what to load. Implementations forward
    these calls to whatever context owns the player.
*/
pub trait PlaybackSurface: Send + Sync + 'static {
    fn telemetry(&self) -> PlaybackTelemetry;

    /// A playback error reported by the surface, if any.
    fn failure(&self) -> Option<String> {
        None
    }

    /// Replace the current item with a fresh one for `url`.
    fn load(&self, url: &str);

    fn seek_to(&self, position: f64);

    fn resume(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    pub interval: Duration,
    pub max_lag: f64,
    pub stall_tolerance: f64,
    pub stall_ticks: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            max_lag: 1.5,
            stall_tolerance: 0.05,
            stall_ticks: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WatchdogAction {
    SeekToLive { edge: f64 },
    Reload,
    Resume,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Verdict {
    pub action: WatchdogAction,
    pub lag: Option<f64>,
}

/**
    Decides, tick by tick, how to keep playback near the live edge.

    Falling behind by more than `max_lag` seeks to live. Otherwise
    `stall_ticks` consecutive samples within `stall_tolerance` of each
    other count as a stall and force a reload. Otherwise a paused surface
    is resumed.
*/
#[derive(Debug)]
pub struct PlaybackWatchdog {
    config: WatchdogConfig,
    last_position: Option<f64>,
    unchanged: u32,
}

impl PlaybackWatchdog {
    pub fn new(config: WatchdogConfig) -> Self {
        Self {
            config,
            last_position: None,
            unchanged: 0,
        }
    }

    pub fn evaluate(&mut self, telemetry: &PlaybackTelemetry) -> Verdict {
        let position = telemetry.position.filter(|p| p.is_finite());
        let edge = telemetry.live_edge.filter(|e| e.is_finite());
        let lag = position.zip(edge).map(|(p, e)| e - p);

        if let (Some(edge), Some(lag)) = (edge, lag)
            && lag > self.config.max_lag
        {
            return Verdict {
                action: WatchdogAction::SeekToLive { edge },
                lag: Some(lag),
            };
        }

        match (position, self.last_position) {
            (Some(p), Some(last)) if (p - last).abs() < self.config.stall_tolerance => {
                self.unchanged += 1;
            }
            (Some(_), _) => self.unchanged = 1,
            (None, _) => self.unchanged = 0,
        }
        self.last_position = position;

        if self.unchanged >= self.config.stall_ticks {
            self.unchanged = 0;
            self.last_position = None;
            return Verdict {
                action: WatchdogAction::Reload,
                lag,
            };
        }

        let action = if telemetry.playing {
            WatchdogAction::Nothing
        } else {
            WatchdogAction::Resume
        };
        Verdict { action, lag }
    }
}

/// Reports from the watchdog task to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchdogNotice {
    Lag { session: u64, seconds: Option<f64> },
    PlaybackFailed { session: u64, detail: String },
}

/**
    Load `url` into the surface and keep it near live until aborted.

    A failure reported by the surface is remediated like a stall: the item
    is reloaded and playback resumed. The transcoder is left alone.
*/
pub fn spawn<E>(
    surface: Arc<dyn PlaybackSurface>,
    url: String,
    config: WatchdogConfig,
    session: u64,
    events: mpsc::UnboundedSender<E>,
) -> JoinHandle<()>
where
    E: From<WatchdogNotice> + Send + 'static,
{
    tokio::spawn(async move {
        surface.load(&url);
        surface.resume();

        let mut watchdog = PlaybackWatchdog::new(config);
        let mut interval = tokio::time::interval_at(
            tokio::time::Instant::now() + config.interval,
            config.interval,
        );
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            if let Some(detail) = surface.failure() {
                tracing::warn!(session, %detail, "playback failed, reloading surface");
                watchdog = PlaybackWatchdog::new(config);
                surface.load(&url);
                surface.resume();
                let notice = WatchdogNotice::PlaybackFailed { session, detail };
                if events.send(E::from(notice)).is_err() {
                    return;
                }
                continue;
            }

            let verdict = watchdog.evaluate(&surface.telemetry());
            match verdict.action {
                WatchdogAction::SeekToLive { edge } => {
                    tracing::debug!(session, lag = verdict.lag, "behind live, seeking");
                    surface.seek_to(edge);
                    surface.resume();
                }
                WatchdogAction::Reload => {
                    tracing::info!(session, "playback stalled, reloading surface");
                    surface.load(&url);
                    surface.resume();
                }
                WatchdogAction::Resume => surface.resume(),
                WatchdogAction::Nothing => {}
            }

            let notice = WatchdogNotice::Lag {
                session,
                seconds: verdict.lag,
            };
            if events.send(E::from(notice)).is_err() {
                return;
            }
        }
    })
}
