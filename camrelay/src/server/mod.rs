pub mod range;
pub mod request_log;
pub mod routes;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::media::workdir::WorkDir;

use request_log::RequestLog;
use routes::ServerState;

/// How long in-flight responses get to finish once shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Sent once per server start, after the listener is bound or has failed to bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerNotice {
    Bound { session: u64, base_url: String },
    Failed { session: u64, error: String },
}

/**
    Loopback HTTP server for one session's working directory.

    Binds `127.0.0.1:0` in the background; the base URL appears on the
    `base_url` watch once the OS has assigned a port.
*/
pub struct DeliveryServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    base_url: watch::Receiver<Option<String>>,
}

impl DeliveryServer {
    pub fn start<E>(workdir: &WorkDir, session: u64, events: mpsc::UnboundedSender<E>) -> Self
    where
        E: From<ServerNotice> + Send + 'static,
    {
        let (url_tx, base_url) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(ServerState {
            root: workdir.root().to_path_buf(),
            manifest_name: workdir.manifest_name().to_string(),
            log: RequestLog::new(workdir.request_log_path()),
        });

        let task = tokio::spawn(async move {
            let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
            let bound = match tokio::net::TcpListener::bind(addr).await {
                Ok(listener) => listener.local_addr().map(|addr| (listener, addr)),
                Err(e) => Err(e),
            };
            let (listener, addr) = match bound {
                Ok(bound) => bound,
                Err(e) => {
                    tracing::warn!(session, error = %e, "delivery server failed to bind");
                    let error = e.to_string();
                    let _ = events.send(E::from(ServerNotice::Failed { session, error }));
                    return;
                }
            };

            let url = format!("http://{addr}");
            tracing::info!(session, %url, "delivery server listening");
            url_tx.send_replace(Some(url.clone()));
            let _ = events.send(E::from(ServerNotice::Bound {
                session,
                base_url: url,
            }));
            drop(events);

            let app = Router::new().fallback(routes::serve).with_state(state);
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::warn!(session, error = %e, "delivery server error");
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
            base_url,
        }
    }

    pub fn base_url(&self) -> watch::Receiver<Option<String>> {
        self.base_url.clone()
    }

    /// Stop accepting connections and wait briefly for open ones to drain.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.task).await.is_err() {
            tracing::debug!("delivery server did not drain in time, aborting");
            self.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serves_ranges_over_loopback() {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = WorkDir::new(tmp.path());
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(workdir.manifest_path(), "#EXTM3U\n").unwrap();
        std::fs::write(tmp.path().join("segment-000.ts"), &data).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<ServerNotice>();
        let server = DeliveryServer::start(&workdir, 5, tx);

        let base = match rx.recv().await.unwrap() {
            ServerNotice::Bound { session, base_url } => {
                assert_eq!(session, 5);
                base_url
            }
            other => panic!("unexpected notice: {other:?}"),
        };
        assert!(base.starts_with("http://127.0.0.1:"));
        assert_eq!(server.base_url().borrow().as_deref(), Some(base.as_str()));

        let client = reqwest::Client::new();
        let manifest = client.get(format!("{base}/")).send().await.unwrap();
        assert_eq!(manifest.status(), 200);
        assert_eq!(
            manifest.headers()["content-type"],
            "application/vnd.apple.mpegurl"
        );
        assert_eq!(manifest.text().await.unwrap(), "#EXTM3U\n");

        let partial = client
            .get(format!("{base}/segment-000.ts"))
            .header("Range", "bytes=0-99")
            .send()
            .await
            .unwrap();
        assert_eq!(partial.status(), 206);
        assert_eq!(partial.headers()["content-range"], "bytes 0-99/1000");
        assert_eq!(partial.bytes().await.unwrap().len(), 100);

        let missing = client
            .get(format!("{base}/../../etc/passwd"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        server.stop().await;

        let log = std::fs::read_to_string(workdir.request_log_path()).unwrap();
        assert!(log.contains(" GET / range=none"));
        assert!(log.contains(" GET /segment-000.ts range=bytes 0-99"));
    }
}
