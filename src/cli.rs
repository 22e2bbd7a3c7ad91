use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::core::Capability;

#[derive(Parser, Debug)]
#[command(
    name = "studio-relay",
    version,
    about = "Multi-provider text, image, video and speech generation with fallback"
)]
pub struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct RequestArgs {
    /// Aspect ratio such as 9:16, 16:9 or 1:1
    #[arg(long)]
    pub aspect: Option<String>,
    /// Reference image sent to providers that accept one
    #[arg(long)]
    pub reference: Option<PathBuf>,
    /// Provider ids to try first, in order
    #[arg(long = "prefer", value_delimiter = ',')]
    pub prefer: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one request through its fallback chain
    Generate {
        /// text, image, video or speech
        capability: Capability,
        prompt: String,
        #[command(flatten)]
        request: RequestArgs,
        #[arg(long)]
        duration: Option<u32>,
        #[arg(long)]
        voice: Option<String>,
        #[arg(long)]
        system: Option<String>,
        #[arg(long)]
        temperature: Option<f64>,
        /// Parse the text completion as JSON
        #[arg(long, default_value_t = false)]
        structured: bool,
        /// Fetch URI results (videos) to disk
        #[arg(long, default_value_t = false)]
        download: bool,
        #[arg(short = 'o', long)]
        output_dir: Option<PathBuf>,
    },
    /// One image per platform target on a bounded worker pool
    Campaign {
        prompt: String,
        #[command(flatten)]
        request: RequestArgs,
        /// Platform keys; all known platforms when empty
        #[arg(long, value_delimiter = ',')]
        platforms: Vec<String>,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(short = 'o', long)]
        output_dir: Option<PathBuf>,
    },
    /// List providers and whether their credentials are present
    Providers {
        #[arg(long)]
        capability: Option<Capability>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Resume polling a job submitted earlier
    Track {
        provider: String,
        job_id: String,
        #[arg(long, default_value = "video")]
        capability: Capability,
        #[arg(long, default_value_t = false)]
        download: bool,
        #[arg(short = 'o', long)]
        output_dir: Option<PathBuf>,
    },
    /// Show persisted generations, newest first
    History {
        #[arg(long)]
        capability: Option<Capability>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_flags() {
        let cli = Cli::try_parse_from([
            "studio-relay",
            "generate",
            "video",
            "bottle on sand",
            "--aspect",
            "9:16",
            "--prefer",
            "runway,luma",
            "--duration",
            "5",
        ])
        .unwrap();
        let Command::Generate {
            capability,
            request,
            duration,
            ..
        } = cli.cmd
        else {
            panic!("expected generate");
        };
        assert_eq!(capability, Capability::Video);
        assert_eq!(request.prefer, vec!["runway", "luma"]);
        assert_eq!(request.aspect.as_deref(), Some("9:16"));
        assert_eq!(duration, Some(5));
    }

    #[test]
    fn track_defaults_to_video() {
        let cli = Cli::try_parse_from(["studio-relay", "track", "luma", "gen-1"]).unwrap();
        assert!(matches!(
            cli.cmd,
            Command::Track {
                capability: Capability::Video,
                ..
            }
        ));
    }
}
