pub mod config;
pub mod executables;
pub mod params;

use std::ffi::OsString;

use crate::error::RelayError;

pub use config::ConfigLoader;
pub use executables::{ExecutablePaths, SearchEnvironment};
pub use params::StreamSource;

/// Inputs for one relay session.
#[derive(Debug, Clone)]
pub struct SessionInputs {
    pub camera_label: String,
    pub source: StreamSource,
    pub executables: ExecutablePaths,
    /// `PATH` exported to the transcoder, if it should differ from ours.
    pub search_path: Option<OsString>,
}

/**
    Source of session inputs, consulted on every start.
*/
pub trait InputProvider: Send + Sync + 'static {
    fn camera_label(&self) -> String;

    fn load(&self) -> Result<SessionInputs, RelayError>;
}

impl InputProvider for SessionInputs {
    fn camera_label(&self) -> String {
        self.camera_label.clone()
    }

    fn load(&self) -> Result<SessionInputs, RelayError> {
        Ok(self.clone())
    }
}
