use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer};

use crate::error::RelayError;

use super::executables::SearchEnvironment;
use super::params::{CameraConnectionParams, StreamSource};
use super::{InputProvider, SessionInputs};

pub const DEFAULT_CAMERA_LABEL: &str = "hikvision";

/// camsnap descriptor, e.g. `~/.config/camsnap/config.yaml`.
#[derive(Debug, Default, Deserialize)]
pub struct CamsnapConfig {
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,
}

/// One camera in the camsnap descriptor. Only the first one is relayed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraEntry {
    pub name: Option<String>,
    pub host: Option<String>,
    #[serde(default, deserialize_with = "port_from_number_or_string")]
    pub port: Option<u16>,
    #[serde(rename = "protocol")]
    pub protocol_name: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub rtsp_transport: Option<String>,
    pub stream: Option<String>,
}

fn port_from_number_or_string<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Number(u16),
        Text(String),
    }

    Ok(match Option::<Port>::deserialize(deserializer)? {
        Some(Port::Number(n)) => Some(n),
        Some(Port::Text(s)) => s.trim().parse().ok(),
        None => None,
    })
}

impl CameraEntry {
    /**
        Turn the descriptor entry into a stream source.

        A `stream` value that already looks like a URL is used verbatim;
        otherwise the URL is derived from host, port and credentials.
    */
    pub fn to_source(&self) -> Result<StreamSource, RelayError> {
        if let Some(stream) = self.stream.as_deref()
            && stream.contains("://")
        {
            return Ok(StreamSource::Url {
                url: stream.to_string(),
                transport: self.rtsp_transport.clone(),
            });
        }

        let host = self
            .host
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| {
                RelayError::Configuration("Unable to build RTSP URL from camsnap config.".into())
            })?;

        let mut params = CameraConnectionParams::new(host.trim());
        if let Some(port) = self.port {
            params.port = port;
        }
        if let Some(scheme) = &self.protocol_name {
            params.scheme = scheme.clone();
        }
        params.username = self.username.clone();
        params.password = self.password.clone();
        params.transport = self.rtsp_transport.clone();
        params.stream_path = self.stream.clone();
        Ok(StreamSource::Camera(params))
    }
}

/// Application settings, `<config dir>/CamBar/config.json`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppSettings {
    pub camsnap_path: Option<String>,
    pub ffmpeg_path: Option<String>,
}

impl AppSettings {
    /// Missing or unreadable settings fall back to defaults.
    pub fn load(path: &Path) -> Self {
        let Ok(data) = std::fs::read(path) else {
            return Self::default();
        };
        serde_json::from_slice(&data).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "ignoring malformed settings");
            Self::default()
        })
    }
}

pub fn default_camsnap_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_default()
        .join(".config/camsnap/config.yaml")
}

pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("CamBar/config.json")
}

pub fn default_work_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("CamBar/hls")
}

/// Read the descriptor and return its first camera, if any.
pub fn load_first_camera(path: &Path) -> Result<Option<CameraEntry>, RelayError> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            RelayError::Configuration(format!("Missing camsnap config at {}.", path.display()))
        } else {
            RelayError::io(path, e)
        }
    })?;

    let config: CamsnapConfig = serde_yaml::from_str(&text).map_err(|e| {
        RelayError::Configuration(format!("Invalid camsnap config at {}: {e}", path.display()))
    })?;

    Ok(config.cameras.into_iter().next())
}

/**
    Loads relay inputs from the camsnap descriptor, the app settings file,
    and explicit overrides. Files are re-read on every load so a corrected
    configuration is picked up by the next start.
*/
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    pub camsnap_config: PathBuf,
    pub settings: PathBuf,
    pub rtsp_url_override: Option<String>,
    pub ffmpeg_override: Option<String>,
    pub environment: SearchEnvironment,
}

impl ConfigLoader {
    fn camera(&self) -> Result<Option<CameraEntry>, RelayError> {
        load_first_camera(&self.camsnap_config)
    }
}

impl InputProvider for ConfigLoader {
    fn camera_label(&self) -> String {
        self.camera()
            .ok()
            .flatten()
            .and_then(|c| c.name)
            .unwrap_or_else(|| DEFAULT_CAMERA_LABEL.to_string())
    }

    fn load(&self) -> Result<SessionInputs, RelayError> {
        let settings = AppSettings::load(&self.settings);
        let override_url = self
            .rtsp_url_override
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty());

        // The override wins outright; the descriptor may still supply
        // a label and the RTSP transport.
        let (camera, source) = match override_url {
            Some(url) => {
                let camera = self.camera().ok().flatten();
                let source = StreamSource::Url {
                    url: url.to_string(),
                    transport: camera.as_ref().and_then(|c| c.rtsp_transport.clone()),
                };
                (camera, source)
            }
            None => {
                let camera = self.camera()?.ok_or_else(|| {
                    RelayError::Configuration("No cameras found in camsnap config.".into())
                })?;
                let source = camera.to_source()?;
                (Some(camera), source)
            }
        };

        let ffmpeg_override = self
            .ffmpeg_override
            .as_deref()
            .or(settings.ffmpeg_path.as_deref());
        let executables = self
            .environment
            .resolve_all(ffmpeg_override, settings.camsnap_path.as_deref());

        Ok(SessionInputs {
            camera_label: camera
                .and_then(|c| c.name)
                .unwrap_or_else(|| DEFAULT_CAMERA_LABEL.to_string()),
            source,
            executables,
            search_path: Some(self.environment.path_var()),
        })
    }
}
