use anyhow::Context;
use lumen_protocol::config::AgentConfig;
use std::path::PathBuf;

pub(crate) const TOKEN_ENV: &str = "LUMEN_AGENT_TOKEN";

/// Command-line overrides. Anything left `None` keeps the config file value.
#[derive(Debug, Default)]
pub(crate) struct Args {
    pub config: Option<PathBuf>,
    pub display: Option<String>,
    pub monitor: Option<u32>,
    pub fps: Option<u32>,
    pub max_width: Option<u32>,
    pub quality: Option<u32>,
    pub encoder: Option<String>,
    pub no_audio: bool,
    pub server_url: Option<String>,
    pub agent_id: Option<String>,
    pub agent_token: Option<String>,
    pub tls_cert_path: Option<String>,
}

impl Args {
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(display) = &self.display {
            config.capture.display = display.clone();
        }
        if let Some(monitor) = self.monitor {
            config.capture.monitor = monitor;
        }
        if let Some(fps) = self.fps {
            config.video.fps = fps;
        }
        if let Some(max_width) = self.max_width {
            config.video.max_width = max_width;
        }
        if let Some(quality) = self.quality {
            config.video.quality = quality;
        }
        if let Some(encoder) = &self.encoder {
            config.video.encoder = Some(encoder.clone());
        }
        if self.no_audio {
            config.audio.enabled = false;
        }
        if let Some(url) = &self.server_url {
            config.signaling.server_url = url.clone();
        }
        if let Some(id) = &self.agent_id {
            config.signaling.agent_id = Some(id.clone());
        }
        if let Some(cert) = &self.tls_cert_path {
            config.signaling.tls_cert = Some(cert.clone());
        }
    }
}

fn print_help() {
    println!("lumen-agent - Lumen remote desktop streaming agent");
    println!();
    println!("USAGE:");
    println!("    lumen-agent [OPTIONS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <PATH>          TOML configuration file");
    println!("    --display <DISPLAY>          X11 display [default: :0]");
    println!("    --monitor <INDEX>            Initial monitor, 0 = all [default: 0]");
    println!("    --fps <FPS>                  Initial framerate, 5-60 [default: 15]");
    println!("    --max-width <PIXELS>         Resize width cap, 640-3840 [default: 1280]");
    println!("    --quality <N>                Encoder quality, 10-100 [default: 70]");
    println!("    --encoder <NAME>             Force encoder (nvh264enc, vah264enc, x264enc)");
    println!("    --no-audio                   Disable audio streaming");
    println!("    --server-url <URL>           Signaling relay WebSocket URL");
    println!("    --agent-id <ID>              Identifier in the relay path");
    println!(
        "    --agent-token <TOKEN>        Relay authentication token (prefer {TOKEN_ENV} env)"
    );
    println!("    --tls-cert <PATH>            TLS certificate to pin for the relay");
    println!("    -V, --version                Print version and exit");
    println!("    -h, --help                   Print this help and exit");
}

pub(crate) fn parse_args() -> anyhow::Result<Args> {
    let mut args = parse_from(std::env::args().skip(1))?;
    // Prefer the env var for the token (CLI args are visible in /proc)
    if args.agent_token.is_none() {
        args.agent_token = std::env::var(TOKEN_ENV).ok();
    }
    Ok(args)
}

fn value(args: &[String], i: usize, flag: &str) -> anyhow::Result<String> {
    args.get(i)
        .cloned()
        .with_context(|| format!("Missing {flag} value"))
}

fn number(args: &[String], i: usize, flag: &str) -> anyhow::Result<u32> {
    value(args, i, flag)?
        .parse()
        .with_context(|| format!("Invalid {flag} value"))
}

pub(crate) fn parse_from(args: impl IntoIterator<Item = String>) -> anyhow::Result<Args> {
    let args: Vec<String> = args.into_iter().collect();
    let mut out = Args::default();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        match flag {
            "-V" | "--version" => {
                println!("lumen-agent {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                out.config = Some(PathBuf::from(value(&args, i, flag)?));
            }
            "--display" => {
                i += 1;
                out.display = Some(value(&args, i, flag)?);
            }
            "--monitor" => {
                i += 1;
                out.monitor = Some(number(&args, i, flag)?);
            }
            "--fps" => {
                i += 1;
                out.fps = Some(number(&args, i, flag)?);
            }
            "--max-width" => {
                i += 1;
                out.max_width = Some(number(&args, i, flag)?);
            }
            "--quality" => {
                i += 1;
                out.quality = Some(number(&args, i, flag)?);
            }
            "--encoder" => {
                i += 1;
                out.encoder = Some(value(&args, i, flag)?);
            }
            "--no-audio" => out.no_audio = true,
            "--server-url" => {
                i += 1;
                out.server_url = Some(value(&args, i, flag)?);
            }
            "--agent-id" => {
                i += 1;
                out.agent_id = Some(value(&args, i, flag)?);
            }
            "--agent-token" => {
                i += 1;
                out.agent_token = Some(value(&args, i, flag)?);
            }
            "--tls-cert" => {
                i += 1;
                out.tls_cert_path = Some(value(&args, i, flag)?);
            }
            other => anyhow::bail!("Unknown argument: {other}"),
        }
        i += 1;
    }
    Ok(out)
}
