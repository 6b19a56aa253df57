use std::collections::HashMap;

use clap::Args;

/// Server configuration for `challenge-relay serve`.
#[derive(Debug, Args, Clone)]
pub struct ServeConfig {
    /// Port for the HTTP/WebSocket gateway.
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Lifetime of a provisioned environment, in seconds.
    #[arg(long, default_value_t = 1800)]
    pub ttl_secs: u64,

    /// Interval between expiry sweep passes, in seconds.
    #[arg(long, default_value_t = 30)]
    pub sweep_interval_secs: u64,

    /// Maximum number of concurrently running instances (0 = unlimited).
    /// Requests over the limit are rejected, not queued.
    #[arg(long, default_value_t = 0)]
    pub max_instances: usize,

    /// Docker network the challenge containers are attached to.
    #[arg(long, default_value = "ctf-isolated")]
    pub network: String,

    /// Shell executed inside the container for terminal sessions.
    #[arg(long, default_value = "/bin/bash")]
    pub shell: String,

    /// Challenge catalog entries as `<challengeId>=<image>` pairs.
    #[arg(long = "challenge", value_name = "ID=IMAGE")]
    pub challenges: Vec<String>,
}

impl ServeConfig {
    /// Parse `--challenge id=image` pairs into a catalog map.
    /// Malformed entries are skipped rather than aborting startup.
    pub fn catalog(&self) -> HashMap<String, String> {
        self.challenges
            .iter()
            .filter_map(|entry| {
                let (id, image) = entry.split_once('=')?;
                let id = id.trim();
                let image = image.trim();
                if id.is_empty() || image.is_empty() {
                    tracing::warn!(
                        target = "challenge_relay::config",
                        entry = %entry,
                        "ignoring malformed challenge entry"
                    );
                    return None;
                }
                Some((id.to_string(), image.to_string()))
            })
            .collect()
    }
}
