use std::path::Path;

use anyhow::Result;
use clap::Parser;

use crate::camera::InputProvider;

use super::InputArgs;

#[derive(Parser, Debug)]
pub struct ResolveCommand {
    #[command(flatten)]
    pub inputs: InputArgs,
}

impl ResolveCommand {
    pub async fn run(self) -> Result<()> {
        let inputs = self.inputs.loader().load()?;
        let url = inputs.source.transport_url()?;

        println!("camera:    {}", inputs.camera_label);
        println!("rtsp:      {url}");
        println!("transport: {}", inputs.source.rtsp_transport());
        println!("ffmpeg:    {}", display(inputs.executables.ffmpeg.as_deref()));
        println!("camsnap:   {}", display(inputs.executables.camsnap.as_deref()));
        if let Some(path) = &inputs.search_path {
            println!("PATH:      {}", path.to_string_lossy());
        }
        Ok(())
    }
}

fn display(path: Option<&Path>) -> String {
    path.map_or_else(|| "not found".to_string(), |p| p.display().to_string())
}
