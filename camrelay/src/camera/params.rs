use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::error::RelayError;

pub const DEFAULT_SCHEME: &str = "rtsp";
pub const DEFAULT_PORT: u16 = 554;
pub const DEFAULT_STREAM_PATH: &str = "/Streaming/Channels/101";
pub const DEFAULT_RTSP_TRANSPORT: &str = "tcp";

/// Everything but RFC 3986 unreserved characters is escaped in user-info.
const USERINFO: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/**
    Connection parameters for one camera, as discovered from configuration.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConnectionParams {
    pub host: String,
    pub port: u16,
    pub scheme: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub transport: Option<String>,
    pub stream_path: Option<String>,
}

impl CameraConnectionParams {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            scheme: DEFAULT_SCHEME.to_string(),
            username: None,
            password: None,
            transport: None,
            stream_path: None,
        }
    }

    /// Build `scheme://[user[:pass]@]host:port/path`. IPv6 hosts are bracketed.
    pub fn transport_url(&self) -> Result<String, RelayError> {
        let host = self.host.trim();
        if host.is_empty() {
            return Err(RelayError::Configuration(
                "Unable to build RTSP URL from camsnap config.".to_string(),
            ));
        }

        let scheme = match self.scheme.trim() {
            "" => DEFAULT_SCHEME,
            s => s,
        };

        let userinfo = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!(
                "{}:{}@",
                utf8_percent_encode(user, USERINFO),
                utf8_percent_encode(pass, USERINFO)
            ),
            (Some(user), None) => format!("{}@", utf8_percent_encode(user, USERINFO)),
            // A password without a user has nowhere to go.
            (None, _) => String::new(),
        };

        let path = match self.stream_path.as_deref().map(str::trim) {
            None | Some("") => DEFAULT_STREAM_PATH.to_string(),
            Some(p) if p.starts_with('/') => p.to_string(),
            Some(p) => format!("/{p}"),
        };

        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };

        Ok(format!("{scheme}://{userinfo}{host}:{}{path}", self.port))
    }
}

/**
    Where the transport URL for a session comes from.

    Exactly one variant is used per session: a raw URL always wins over
    host-derived parameters.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamSource {
    Url {
        url: String,
        transport: Option<String>,
    },
    Camera(CameraConnectionParams),
}

impl StreamSource {
    pub fn transport_url(&self) -> Result<String, RelayError> {
        match self {
            StreamSource::Url { url, .. } => {
                let url = url.trim();
                if url.is_empty() {
                    return Err(RelayError::Configuration(
                        "RTSP URL override is empty.".to_string(),
                    ));
                }
                Ok(url.to_string())
            }
            StreamSource::Camera(params) => params.transport_url(),
        }
    }

    /// Value for `-rtsp_transport`.
    pub fn rtsp_transport(&self) -> &str {
        let transport = match self {
            StreamSource::Url { transport, .. } => transport.as_deref(),
            StreamSource::Camera(params) => params.transport.as_deref(),
        };
        transport
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(DEFAULT_RTSP_TRANSPORT)
    }
}
