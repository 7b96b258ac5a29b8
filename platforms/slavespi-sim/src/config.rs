//! Simulation configuration.

use std::{fs, path::Path, time::Duration};

use miette::{Context, IntoDiagnostic, Result};
use serde::{Deserialize, Serialize};
use slavespi::{ChannelSettings, HostId, PinRoles};

/// The config used when none is given on the command line.
pub const DEFAULT_CONFIG: &str = include_str!("../sim.toml");

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimConfig {
    /// Exchanges each master clocks before the simulation ends.
    #[serde(default = "SimConfig::default_exchanges")]
    pub exchanges: usize,
    /// Delay between two exchanges on the same channel.
    #[serde(default = "SimConfig::default_period_ms")]
    pub period_ms: u64,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub host: HostId,
    pub pins: PinRoles,
    /// Bytes per exchange.
    pub capacity: usize,
    #[serde(default)]
    pub settings: ChannelSettings,
    /// What the master sends, `capacity` bytes at a time. Exchanges past the
    /// end of the script send zeros.
    #[serde(default)]
    pub script: String,
    /// Written by the application before the channel is configured, so it
    /// is the first thing the master reads.
    #[serde(default)]
    pub greeting: Option<String>,
}

impl SimConfig {
    pub const DEFAULT_EXCHANGES: usize = 8;
    pub const DEFAULT_PERIOD_MS: u64 = 10;

    const fn default_exchanges() -> usize {
        Self::DEFAULT_EXCHANGES
    }

    const fn default_period_ms() -> u64 {
        Self::DEFAULT_PERIOD_MS
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

pub fn parse_config(s: &str) -> Result<SimConfig> {
    let config: SimConfig = toml::from_str(s).into_diagnostic()?;
    if let Some(chan) = config.channels.iter().find(|c| c.capacity == 0) {
        miette::bail!("channel on {} has a capacity of zero", chan.host);
    }
    Ok(config)
}

/// Load the config at `path`, or the built-in one.
pub fn load_config(path: Option<&Path>) -> Result<SimConfig> {
    let Some(path) = path else {
        return parse_config(DEFAULT_CONFIG).wrap_err("failed to parse built-in config");
    };
    let text = fs::read_to_string(path)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", path.display()))?;
    parse_config(&text).wrap_err_with(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slavespi::{DrainMode, SpiMode};

    #[test]
    fn builtin_config_parses() {
        let config = load_config(None).unwrap();
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].host, HostId(2));
        assert_eq!(config.channels[0].greeting.as_deref(), Some("HELLO"));
        assert_eq!(config.channels[0].settings, ChannelSettings::default());

        let settings = config.channels[1].settings;
        assert_eq!(settings.mode, SpiMode::Mode1);
        assert_eq!(settings.max_incoming, Some(256));
        assert_eq!(settings.queue_depth, ChannelSettings::DEFAULT_QUEUE_DEPTH);
        assert_eq!(settings.drain, DrainMode::ReportedLength);
    }

    #[test]
    fn defaults_fill_in() {
        let config = parse_config(
            r#"
            [[channels]]
            host = 1
            capacity = 8
            pins = { miso = 1, mosi = 2, sclk = 3, cs = 4 }
            settings = { drain = "full-capacity" }
            "#,
        )
        .unwrap();
        assert_eq!(config.exchanges, SimConfig::DEFAULT_EXCHANGES);
        assert_eq!(config.period(), Duration::from_millis(SimConfig::DEFAULT_PERIOD_MS));
        assert_eq!(config.channels[0].settings.drain, DrainMode::FullCapacity);
        assert!(config.channels[0].script.is_empty());
    }

    #[test]
    fn bad_configs_are_rejected() {
        let zero = r#"
            [[channels]]
            host = 1
            capacity = 0
            pins = { miso = 1, mosi = 2, sclk = 3, cs = 4 }
        "#;
        assert!(parse_config(zero).is_err());

        let unknown = r#"
            exchanges = 1
            bogus = true
            channels = []
        "#;
        assert!(parse_config(unknown).is_err());
    }
}
