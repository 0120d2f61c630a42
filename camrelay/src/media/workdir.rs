use std::fs;
use std::path::{Path, PathBuf};

use crate::error::RelayError;

pub const MANIFEST_NAME: &str = "master.m3u8";
pub const SEGMENT_PATTERN: &str = "segment-%03d.ts";
pub const REQUEST_LOG: &str = "requests.log";
pub const TRANSCODER_LOG: &str = "ffmpeg.log";
const RTSP_URL_FILE: &str = "rtsp.txt";
const DEBUG_FILE: &str = "debug.txt";
const SERVER_URL_FILE: &str = "server.txt";

/**
    The directory a session writes its manifest, segments and logs into.
    Owned by one session at a time and cleared before each session starts.
*/
#[derive(Debug, Clone)]
pub struct WorkDir {
    root: PathBuf,
    manifest_name: String,
}

impl WorkDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            manifest_name: MANIFEST_NAME.to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_name(&self) -> &str {
        &self.manifest_name
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(&self.manifest_name)
    }

    pub fn segment_template(&self) -> PathBuf {
        self.root.join(SEGMENT_PATTERN)
    }

    pub fn request_log_path(&self) -> PathBuf {
        self.root.join(REQUEST_LOG)
    }

    pub fn transcoder_log_path(&self) -> PathBuf {
        self.root.join(TRANSCODER_LOG)
    }

    pub fn create(&self) -> Result<(), RelayError> {
        fs::create_dir_all(&self.root).map_err(|e| RelayError::io(&self.root, e))
    }

    /**
        Remove everything in the directory, so stale segments from a previous
        session can never be served to the next one.
    */
    pub fn clear(&self) -> Result<(), RelayError> {
        self.create()?;
        let entries = fs::read_dir(&self.root).map_err(|e| RelayError::io(&self.root, e))?;

        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let result = match entry.file_type() {
                Ok(t) if t.is_dir() => fs::remove_dir_all(&path),
                _ => fs::remove_file(&path),
            };
            if let Err(e) = result
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(RelayError::io(path, e));
            }
        }
        Ok(())
    }

    /// True once the transcoder has written a non-empty manifest.
    pub fn manifest_ready(&self) -> bool {
        fs::metadata(self.manifest_path())
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    pub fn segment_count(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".ts"))
            .count()
    }

    /// Debug artifacts: resolved URL and the chosen transcoder.
    pub fn write_debug(&self, camera: &str, ffmpeg: &Path, rtsp_url: &str) {
        let debug = format!("camera={camera}\nffmpeg={}\nrtsp={rtsp_url}", ffmpeg.display());
        write_best_effort(&self.root.join(DEBUG_FILE), &debug);
        write_best_effort(&self.root.join(RTSP_URL_FILE), rtsp_url);
    }

    pub fn write_server_url(&self, url: &str) {
        write_best_effort(&self.root.join(SERVER_URL_FILE), url);
    }
}

fn write_best_effort(path: &Path, contents: &str) {
    if let Err(e) = fs::write(path, contents) {
        tracing::debug!(path = %path.display(), error = %e, "failed to write debug artifact");
    }
}
