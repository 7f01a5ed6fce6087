use std::time::Duration;

use aero_gpu_notify::{Endpoint, Limits, DEFAULT_HANDSHAKE_TIMEOUT};
use aero_gpu_shm::Features;
use clap::Parser;

use crate::error::{BackendError, Result};

#[cfg(unix)]
const DEFAULT_LISTEN: &str = "unix:/tmp/aero-gpu.sock";
#[cfg(not(unix))]
const DEFAULT_LISTEN: &str = "tcp:127.0.0.1:7490";

pub const DEFAULT_IDLE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Parser)]
#[command(name = "aero-gpu-backendd", version, about)]
struct Args {
    /// Endpoint the relay connects to: `unix:<path>` or `tcp:<host>:<port>`.
    ///
    /// Environment variable: `AERO_GPU_BACKEND_LISTEN`.
    #[arg(long, env = "AERO_GPU_BACKEND_LISTEN")]
    listen: Option<String>,

    /// Feature bits offered in the handshake, decimal or `0x`-prefixed hex. Must include the
    /// baseline bit.
    ///
    /// Environment variable: `AERO_GPU_BACKEND_FEATURES`.
    #[arg(long, env = "AERO_GPU_BACKEND_FEATURES")]
    features: Option<String>,

    /// How often the ring is drained when no doorbell arrives. `0` relies on doorbells alone.
    ///
    /// Environment variable: `AERO_GPU_BACKEND_IDLE_POLL_MS`.
    #[arg(long, env = "AERO_GPU_BACKEND_IDLE_POLL_MS")]
    idle_poll_ms: Option<u64>,

    /// How long a new connection may take to send its handshake. `0` waits forever.
    ///
    /// Environment variable: `AERO_GPU_BACKEND_HANDSHAKE_TIMEOUT_MS`.
    #[arg(long, env = "AERO_GPU_BACKEND_HANDSHAKE_TIMEOUT_MS")]
    handshake_timeout_ms: Option<u64>,

    /// Largest notification payload accepted, in bytes.
    ///
    /// Environment variable: `AERO_GPU_BACKEND_MAX_PAYLOAD`.
    #[arg(long, env = "AERO_GPU_BACKEND_MAX_PAYLOAD")]
    max_payload: Option<usize>,

    /// Log filter (tracing-subscriber EnvFilter syntax). `RUST_LOG` takes precedence.
    ///
    /// Environment variable: `AERO_GPU_BACKEND_LOG_LEVEL`.
    #[arg(long, env = "AERO_GPU_BACKEND_LOG_LEVEL")]
    log_level: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub listen: Endpoint,
    pub features: Features,
    /// `None` drains only on doorbells.
    pub idle_poll: Option<Duration>,
    /// `None` waits for the handshake forever.
    pub handshake_timeout: Option<Duration>,
    pub limits: Limits,
    pub log_level: String,
}

impl BackendConfig {
    pub fn new(listen: Endpoint) -> Self {
        Self {
            listen,
            features: Features::SUPPORTED,
            idle_poll: Some(DEFAULT_IDLE_POLL),
            handshake_timeout: Some(DEFAULT_HANDSHAKE_TIMEOUT),
            limits: Limits::default(),
            log_level: "info".to_string(),
        }
    }

    /// Parses the process arguments and environment.
    pub fn from_args() -> Result<Self> {
        Self::from_parsed(Args::parse())
    }

    pub fn try_parse_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let args = Args::try_parse_from(args).map_err(|err| BackendError::Config(err.to_string()))?;
        Self::from_parsed(args)
    }

    fn from_parsed(args: Args) -> Result<Self> {
        let listen = args.listen.as_deref().unwrap_or(DEFAULT_LISTEN);
        let listen: Endpoint = listen
            .parse()
            .map_err(|err: aero_gpu_notify::NotifyError| BackendError::Config(err.to_string()))?;

        let mut config = Self::new(listen);
        if let Some(features) = args.features {
            config.features = parse_features(&features)?;
        }
        if let Some(ms) = args.idle_poll_ms {
            config.idle_poll = (ms != 0).then_some(Duration::from_millis(ms));
        }
        if let Some(ms) = args.handshake_timeout_ms {
            config.handshake_timeout = (ms != 0).then_some(Duration::from_millis(ms));
        }
        if let Some(max_payload_len) = args.max_payload {
            // A handshake carrying a short identifier must still fit.
            if max_payload_len < 64 {
                return Err(BackendError::Config(format!(
                    "max payload of {max_payload_len} bytes is too small"
                )));
            }
            config.limits = Limits { max_payload_len };
        }
        if let Some(level) = args.log_level {
            let level = level.trim();
            if !level.is_empty() {
                config.log_level = level.to_string();
            }
        }
        Ok(config)
    }
}

fn parse_features(raw: &str) -> Result<Features> {
    let raw = raw.trim();
    let bits = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    }
    .map_err(|err| BackendError::Config(format!("invalid feature bits {raw:?}: {err}")))?;

    let features = Features::from_bits_retain(bits);
    if !features.has_required() {
        return Err(BackendError::Config(format!(
            "feature bits {raw} lack the required {:?}",
            Features::REQUIRED
        )));
    }
    Ok(features)
}
