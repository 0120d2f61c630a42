use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::range::ByteRange;

/**
    Append-only `requests.log`, one line per request.

    Lines are written whole under a single lock so concurrent connections
    never interleave partial writes.
*/
pub struct RequestLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RequestLog {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn format_line(timestamp: &str, method: &str, path: &str, range: Option<&ByteRange>) -> String {
        let range = range.map_or_else(|| "none".to_string(), ToString::to_string);
        format!("{timestamp} {method} {path} range={range}\n")
    }

    pub async fn append(&self, method: &str, path: &str, range: Option<&ByteRange>) {
        let timestamp = crate::util::time::iso8601(crate::util::time::now());
        let line = Self::format_line(&timestamp, method, path, range);

        let _guard = self.lock.lock().await;
        let result: std::io::Result<()> = async {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(e) = result {
            tracing::debug!(path = %self.path.display(), error = %e, "request log write failed");
        }
    }
}
