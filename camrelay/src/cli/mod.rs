use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::camera::config::{default_camsnap_config_path, default_settings_path};
use crate::camera::{ConfigLoader, SearchEnvironment};

mod resolve;
mod serve;

pub use resolve::ResolveCommand;
pub use serve::ServeCommand;

#[derive(Parser, Debug)]
#[command(name = "camrelay")]
#[command(about = "Relay an RTSP camera to a local low-latency HLS stream")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeCommand,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay until interrupted (default)
    Serve(ServeCommand),
    /// Print the resolved camera URL and tool paths, then exit
    Resolve(ResolveCommand),
}

impl Args {
    pub async fn run(self) -> Result<()> {
        let command = self.command.unwrap_or(Command::Serve(self.serve));

        match command {
            Command::Serve(cmd) => cmd.run().await,
            Command::Resolve(cmd) => cmd.run().await,
        }
    }
}

/// Where the camera and tool configuration comes from.
#[derive(clap::Args, Debug, Clone)]
pub struct InputArgs {
    /// camsnap camera descriptor [default: ~/.config/camsnap/config.yaml]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// App settings JSON with `camsnapPath` / `ffmpegPath` overrides
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// Use this RTSP URL instead of the camsnap descriptor
    #[arg(long, env = "CAMBAR_RTSP_URL")]
    pub rtsp_url: Option<String>,

    /// Path to the ffmpeg executable
    #[arg(long)]
    pub ffmpeg: Option<String>,
}

impl InputArgs {
    pub fn loader(&self) -> ConfigLoader {
        ConfigLoader {
            camsnap_config: self.config.clone().unwrap_or_else(default_camsnap_config_path),
            settings: self.settings.clone().unwrap_or_else(default_settings_path),
            rtsp_url_override: self.rtsp_url.clone(),
            ffmpeg_override: self.ffmpeg.clone(),
            environment: SearchEnvironment::from_process(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::HlsFlags;

    #[test]
    fn test_no_subcommand_means_serve() {
        let args = Args::try_parse_from(["camrelay", "--hls-flags", "append-list"]).unwrap();
        assert!(args.command.is_none());
        assert_eq!(args.serve.hls_flags, HlsFlags::AppendList);
    }

    #[test]
    fn test_resolve_subcommand() {
        let args =
            Args::try_parse_from(["camrelay", "resolve", "--rtsp-url", "rtsp://10.0.0.2/live"])
                .unwrap();
        match args.command {
            Some(Command::Resolve(cmd)) => {
                assert_eq!(cmd.inputs.rtsp_url.as_deref(), Some("rtsp://10.0.0.2/live"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_loader_uses_explicit_paths() {
        let inputs = InputArgs {
            config: Some(PathBuf::from("/tmp/cams.yaml")),
            settings: None,
            rtsp_url: None,
            ffmpeg: Some("/opt/ffmpeg".to_string()),
        };
        let loader = inputs.loader();
        assert_eq!(loader.camsnap_config, PathBuf::from("/tmp/cams.yaml"));
        assert!(loader.settings.ends_with("CamBar/config.json"));
        assert_eq!(loader.ffmpeg_override.as_deref(), Some("/opt/ffmpeg"));
    }
}
