use clap::{Args, Parser, Subcommand};

use crate::config::{
    self, ConfigError, GenerationParams, RtspCamera, SessionConfig, ViewerConfig, DEFAULT_CADENCE,
    DEFAULT_FINAL_PROMPT, DEFAULT_FRAME_LOG_INTERVAL, DEFAULT_JPEG_QUALITY, DEFAULT_LIVE_MODEL,
    DEFAULT_MAX_OUTPUT_TOKENS, DEFAULT_MAX_WIDTH, DEFAULT_PROMPT, DEFAULT_RTSP_PORT,
    DEFAULT_SYSTEM_INSTRUCTION, DEFAULT_TEMPERATURE, DEFAULT_TEXT_MODEL, DEFAULT_TOP_P,
};

/// Checked in order when `--api-key` is not given
pub const API_KEY_VARS: [&str; 2] = ["GEMINI_API_KEY", "GOOGLE_API_KEY"];

#[derive(Parser)]
#[command(name = "cradlecam")]
#[command(about = "📹 Stream a camera to Gemini and read its commentary live", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log filter (e.g. info, debug, cradlecam=trace). RUST_LOG wins if set.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Stream video frames to the live model and print what it says
    Stream(StreamArgs),

    /// Stream a text answer for a single prompt
    Text {
        /// Prompt to send
        prompt: Option<String>,

        /// Model ID
        #[arg(long, env = "GEMINI_MODEL", default_value = DEFAULT_TEXT_MODEL)]
        model: String,

        /// API key (falls back to GEMINI_API_KEY, then GOOGLE_API_KEY)
        #[arg(long)]
        api_key: Option<String>,
    },

    /// Keep an RTSP camera (or any source) open and report frame counts
    Watch {
        #[command(flatten)]
        camera: CameraArgs,

        /// Print a status line every N frames
        #[arg(long, env = "TAPO_FRAME_LOG_INTERVAL", default_value_t = DEFAULT_FRAME_LOG_INTERVAL)]
        frame_log_interval: u64,
    },

    /// Check that a source opens and delivers a frame
    Probe {
        #[command(flatten)]
        camera: CameraArgs,

        /// Open attempts before giving up
        #[arg(long, default_value_t = 3)]
        attempts: u32,
    },
}

#[derive(Args)]
pub struct StreamArgs {
    /// Video source: webcam index, screen[:N], RTSP/HTTP URL, video file, image or image folder
    #[arg(short, long, default_value = "0")]
    pub source: String,

    /// Live model ID
    #[arg(long, default_value = DEFAULT_LIVE_MODEL)]
    pub model: String,

    /// Frames sent per second (0 = as fast as the source allows)
    #[arg(long, default_value_t = DEFAULT_CADENCE)]
    pub fps: f64,

    /// Stop after this many frames
    #[arg(long)]
    pub max_frames: Option<u64>,

    /// Downscale frames wider than this (0 = never)
    #[arg(long, default_value_t = DEFAULT_MAX_WIDTH)]
    pub max_width: u32,

    /// JPEG quality (0-100)
    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, value_parser = clap::value_parser!(u8).range(0..=100))]
    pub jpeg_quality: u8,

    /// Text sent before the first frame
    #[arg(long, default_value = DEFAULT_PROMPT)]
    pub prompt: String,

    /// Text sent after the last frame
    #[arg(long, default_value = DEFAULT_FINAL_PROMPT)]
    pub final_prompt: String,

    /// Seconds to keep listening after the last frame
    #[arg(long, default_value_t = 5.0)]
    pub response_grace: f64,

    #[arg(long, default_value = DEFAULT_SYSTEM_INSTRUCTION)]
    pub system_instruction: String,

    #[arg(long, default_value_t = DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    #[arg(long, default_value_t = DEFAULT_TOP_P)]
    pub top_p: f32,

    #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_TOKENS)]
    pub max_output_tokens: u32,

    /// Reconnect when a live source drops instead of ending the stream
    #[arg(long)]
    pub reconnect: bool,

    /// Seconds between attempts to (re)open the source
    #[arg(long, env = "TAPO_RECONNECT_DELAY", default_value_t = 5.0)]
    pub reconnect_delay: f64,

    /// API key (falls back to GEMINI_API_KEY, then GOOGLE_API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,
}

/// Where the viewer/probe reads from: an explicit source, or a camera by host
#[derive(Args)]
pub struct CameraArgs {
    /// Explicit source (overrides the camera settings below)
    #[arg(long)]
    pub source: Option<String>,

    /// Camera IPv4 address or hostname
    #[arg(long, env = "TAPO_HOST")]
    pub host: Option<String>,

    #[arg(long, env = "TAPO_USERNAME")]
    pub username: Option<String>,

    #[arg(long, env = "TAPO_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, env = "TAPO_PORT", default_value_t = DEFAULT_RTSP_PORT)]
    pub port: u16,

    /// 1 = main HD, 2 = sub, 6/7 = dual-lens models
    #[arg(long, env = "TAPO_STREAM", default_value_t = 1)]
    pub stream: u8,

    /// Seconds between attempts to (re)open the source
    #[arg(long, env = "TAPO_RECONNECT_DELAY", default_value_t = 5.0)]
    pub reconnect_delay: f64,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl StreamArgs {
    pub fn session_config(&self) -> Result<SessionConfig, ConfigError> {
        let config = SessionConfig {
            model: self.model.clone(),
            cadence: self.fps,
            max_width: (self.max_width > 0).then_some(self.max_width),
            quality: self.jpeg_quality,
            max_frames: self.max_frames,
            prompt: self.prompt.clone(),
            final_prompt: self.final_prompt.clone(),
            system_instruction: self.system_instruction.clone(),
            generation: GenerationParams {
                temperature: self.temperature,
                top_p: self.top_p,
                max_output_tokens: self.max_output_tokens,
            },
            response_grace: config::seconds("response grace", self.response_grace)?,
        };
        config.validate()?;
        Ok(config)
    }
}

impl CameraArgs {
    /// Resolve the source string: `--source` as given, otherwise the RTSP URL
    /// built from host and credentials
    pub fn source(&self) -> Result<String, ConfigError> {
        if let Some(source) = &self.source {
            return Ok(source.clone());
        }
        let camera = RtspCamera {
            host: self.host.clone().ok_or(ConfigError::MissingCredential("--host or TAPO_HOST"))?,
            username: self
                .username
                .clone()
                .ok_or(ConfigError::MissingCredential("--username or TAPO_USERNAME"))?,
            password: self
                .password
                .clone()
                .ok_or(ConfigError::MissingCredential("--password or TAPO_PASSWORD"))?,
            port: self.port,
            stream: self.stream,
        };
        camera.url()
    }

    pub fn viewer_config(&self, frame_log_interval: u64) -> Result<ViewerConfig, ConfigError> {
        let config = ViewerConfig {
            source: self.source()?,
            reconnect_delay: config::seconds("reconnect delay", self.reconnect_delay)?,
            frame_log_interval,
        };
        config.validate()?;
        Ok(config)
    }
}

/// `--api-key` if given, else the first non-blank variable in `API_KEY_VARS`
pub fn resolve_api_key<F>(explicit: Option<&str>, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    explicit
        .map(str::to_string)
        .into_iter()
        .chain(API_KEY_VARS.iter().copied().filter_map(&lookup))
        .map(|key| key.trim().to_string())
        .find(|key| !key.is_empty())
        .ok_or(ConfigError::MissingCredential("GEMINI_API_KEY or GOOGLE_API_KEY"))
}
