use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio::{signal, sync::watch};

use crate::camera::config::default_work_dir;
use crate::media::{HlsFlags, Phase, PublishedStatus, RelayHandle, SupervisorConfig};

use super::InputArgs;

#[derive(Parser, Debug)]
pub struct ServeCommand {
    #[command(flatten)]
    pub inputs: InputArgs,

    /// Working directory for the manifest, segments and logs
    /// [default: <cache dir>/CamBar/hls]
    #[arg(long)]
    pub work_dir: Option<PathBuf>,

    /// Segment retention policy
    #[arg(long, value_enum, default_value_t = HlsFlags::DeleteSegments)]
    pub hls_flags: HlsFlags,
}

impl ServeCommand {
    pub async fn run(self) -> Result<()> {
        let work_dir = self.work_dir.clone().unwrap_or_else(default_work_dir);
        let config = SupervisorConfig {
            hls_flags: self.hls_flags,
            ..SupervisorConfig::new(&work_dir)
        };

        let relay = RelayHandle::spawn(Arc::new(self.inputs.loader()), config, None);
        let printer = tokio::spawn(print_status(relay.subscribe()));

        println!("Working directory: {}", work_dir.display());
        relay.start().await;

        let result = serve_until_shutdown(&relay, &mut Signals::new()?).await;
        printer.abort();
        result?;
        println!("Done.");
        Ok(())
    }
}

/**
    Apply operator controls until a shutdown arrives, then stop the relay.

    A relay that is resting in `Failed` at shutdown turns into an error so the
    process exits non-zero.
*/
async fn serve_until_shutdown(relay: &RelayHandle, controls: &mut impl ControlSource) -> Result<()> {
    while let Control::Reload = controls.next().await? {
        println!("Reloading...");
        relay.reload().await;
    }

    println!("\nShutting down...");
    let last = relay.status();
    relay.stop().await;

    if last.phase == Phase::Failed {
        let reason = last.error_message.unwrap_or_else(|| "relay failed".to_string());
        anyhow::bail!(reason);
    }
    Ok(())
}

/// Print the parts of the status a person watching the terminal cares about.
async fn print_status(mut rx: watch::Receiver<PublishedStatus>) {
    let mut last = rx.borrow_and_update().clone();
    println!("Camera: {}", last.camera_label);

    while rx.changed().await.is_ok() {
        let current = rx.borrow_and_update().clone();
        if current.phase != last.phase {
            println!("[relay] {}", current.phase);
        }
        if current.stream_url != last.stream_url
            && let Some(url) = &current.stream_url
        {
            println!("[relay] Stream ready: {url}");
        }
        if current.error_message != last.error_message
            && let Some(error) = &current.error_message
        {
            eprintln!("[relay] {error}");
        }
        last = current;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Reload,
    Shutdown,
}

trait ControlSource {
    async fn next(&mut self) -> Result<Control>;
}

/// Ctrl+C and SIGTERM shut down; SIGHUP reloads.
struct Signals {
    #[cfg(unix)]
    terminate: signal::unix::Signal,
    #[cfg(unix)]
    hangup: signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use signal::unix::SignalKind;
        Ok(Self {
            terminate: signal::unix::signal(SignalKind::terminate())?,
            hangup: signal::unix::signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }
}

impl ControlSource for Signals {
    #[cfg(unix)]
    async fn next(&mut self) -> Result<Control> {
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                Ok(Control::Shutdown)
            }
            _ = self.terminate.recv() => Ok(Control::Shutdown),
            _ = self.hangup.recv() => Ok(Control::Reload),
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> Result<Control> {
        signal::ctrl_c().await?;
        Ok(Control::Shutdown)
    }
}
