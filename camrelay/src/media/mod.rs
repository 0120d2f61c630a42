pub mod readiness;
pub mod status;
pub mod supervisor;
pub mod transcoder;
pub mod watchdog;
pub mod workdir;

pub use status::{Phase, PublishedStatus};
pub use supervisor::{RelayHandle, SupervisorConfig};
pub use transcoder::HlsFlags;
