//! Command-line front door: a `clap`-derived struct for
//! overriding individual `BucketConfig` fields and pointing at the config
//! path, mirroring the config-struct-plus-clap-front-door split the
//! reference workspace uses for its node binaries.

use std::path::PathBuf;

use clap::Parser;
use ep_core::BucketConfig;

#[derive(Parser, Debug)]
#[command(name = "ep-server", about = "Durable write pipeline for a single EP bucket")]
pub struct Cli {
    /// Path to a `BucketConfig` YAML file. Missing file falls back to
    /// built-in defaults with a warning, so a bare `ep-server` run still
    /// starts up for local experimentation.
    #[arg(long, default_value = "ep-bucket.yaml")]
    pub config: PathBuf,

    /// Overrides `BucketConfig::data_dir`.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Number of vBuckets to open, numbered `0..num_vbuckets`. Cluster
    /// membership and vbucket-map distribution are out of scope;
    /// this binary just owns a fixed, locally-numbered set.
    #[arg(long, default_value_t = 1)]
    pub num_vbuckets: u16,

    /// Emit JSON-formatted log lines instead of the human-readable default.
    #[arg(long)]
    pub json_logs: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    pub fn load_config(&self) -> anyhow::Result<BucketConfig> {
        if self.config.exists() {
            BucketConfig::from_yaml_file(&self.config)
        } else {
            tracing::warn!(path = %self.config.display(), "config file not found, using defaults");
            Ok(BucketConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_open_a_single_vbucket() {
        let cli = Cli::parse_from(["ep-server"]);
        assert_eq!(cli.num_vbuckets, 1);
        assert!(!cli.json_logs);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let cli = Cli::parse_from(["ep-server", "--config", "/nonexistent/ep-bucket.yaml"]);
        let config = cli.load_config().unwrap();
        assert_eq!(config.flusher_batch_size, BucketConfig::default().flusher_batch_size);
    }
}
