use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

/**
    Where the supervisor is in a session's lifecycle.
*/
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Idle,
    Starting,
    Live,
    Stopping,
    /// Waiting out a backoff delay before the next start.
    Restarting { attempt: u32, delay: Duration },
    /// Inputs could not be used; waits for a manual start.
    Failed,
}

impl Phase {
    /// A session is in flight and another start would be a duplicate.
    pub fn is_active(&self) -> bool {
        matches!(self, Phase::Starting | Phase::Live)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "idle"),
            Phase::Starting => write!(f, "starting"),
            Phase::Live => write!(f, "live"),
            Phase::Stopping => write!(f, "stopping"),
            Phase::Restarting { attempt, delay } => {
                write!(f, "restarting (attempt {attempt}, in {}s)", delay.as_secs())
            }
            Phase::Failed => write!(f, "failed"),
        }
    }
}

/**
    Everything observers may read about the relay.

    Written only by the supervisor worker and broadcast through a
    `watch` channel.
*/
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishedStatus {
    pub stream_url: Option<String>,
    pub error_message: Option<String>,
    pub last_updated: Option<DateTime<Utc>>,
    pub camera_label: String,
    pub lag_seconds: Option<f64>,
    pub phase: Phase,
}

impl PublishedStatus {
    pub fn new(camera_label: impl Into<String>) -> Self {
        Self {
            camera_label: camera_label.into(),
            ..Self::default()
        }
    }
}
