//! TOML file configuration.
//!
//! These structs map directly to the `beanwatch.toml` file format. Stream
//! sections share the polling/retry knobs through `StreamCommon`; channel
//! entries are tagged by platform kind.

use beanwatch_core::stream::EventKind;
use compact_str::CompactString;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    pub sources: SourcesConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    pub streams: StreamsConfig,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Upstream endpoints the data source adapters talk to.
#[derive(Debug, Clone, Deserialize)]
pub struct SourcesConfig {
    pub bean_subgraph: Url,
    pub beanstalk_subgraph: Url,
    pub basin_subgraph: Url,
    pub etherscan: Option<EtherscanConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtherscanConfig {
    #[serde(default = "default_chain_id")]
    pub chain_id: u32,
    pub api_key: String,
    pub contract_address: String,
}

fn default_chain_id() -> u32 {
    1
}

/// Channel retry knobs, shared by all channels.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    1
}

fn default_max_delay_secs() -> u64 {
    64
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

/// Polling/retry knobs every stream section carries.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamCommon {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub interval_secs: u64,
    #[serde(default = "default_retry_budget")]
    pub fetch_retry_budget: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub fetch_backoff_base_secs: u64,
    #[serde(default = "default_seen_retention")]
    pub seen_retention: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_retry_budget() -> u32 {
    3
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_seen_retention() -> u64 {
    1000
}

impl StreamCommon {
    pub fn to_stream_config(&self, name: &str) -> beanwatch_core::stream::StreamConfig {
        beanwatch_core::stream::StreamConfig {
            name: CompactString::from(name),
            poll_interval: Duration::from_secs(self.interval_secs),
            fetch_retry_budget: self.fetch_retry_budget,
            fetch_backoff_base: Duration::from_secs(self.fetch_backoff_base_secs),
            seen_retention: self.seen_retention,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamsConfig {
    pub peg_cross: Option<PegCrossStreamConfig>,
    pub season: Option<SeasonStreamConfig>,
    pub well_swap: Option<WellSwapStreamConfig>,
    pub contract_activity: Option<ContractActivityStreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PegCrossStreamConfig {
    #[serde(flatten)]
    pub common: StreamCommon,
    /// Peg price the cross detector compares against.
    pub peg: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SeasonStreamConfig {
    #[serde(flatten)]
    pub common: StreamCommon,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WellSwapStreamConfig {
    #[serde(flatten)]
    pub common: StreamCommon,
    /// Minimum trade value worth announcing.
    pub min_swap_usd: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractActivityStreamConfig {
    #[serde(flatten)]
    pub common: StreamCommon,
    /// Method selectors (`0x` + 8 hex digits) worth announcing.
    pub methods: Vec<CompactString>,
}

/// One notification output target, tagged by platform.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    Discord {
        id: CompactString,
        webhook_url: Url,
        /// Event kinds this channel can express.
        events: Vec<EventKind>,
    },
    Telegram {
        id: CompactString,
        bot_token: String,
        chat_id: String,
        events: Vec<EventKind>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn full_config_parses() {
        let toml_str = r#"
[sources]
bean_subgraph = "https://graph.example.com/bean"
beanstalk_subgraph = "https://graph.example.com/beanstalk"
basin_subgraph = "https://graph.example.com/basin"

[sources.etherscan]
api_key = "KEY"
contract_address = "0xC1E088fC1323b20BCBee9bd1B9fC9546db5624C5"

[dispatch]
max_attempts = 4
base_delay_secs = 2

[streams.peg_cross]
interval_secs = 12
peg = "1.00"

[streams.season]
interval_secs = 300
fetch_retry_budget = 5

[streams.well_swap]
interval_secs = 30
min_swap_usd = "10000"

[streams.contract_activity]
enabled = false
interval_secs = 30
methods = ["0x64249157"]

[[channels]]
kind = "discord"
id = "discord-events"
webhook_url = "https://discord.com/api/webhooks/1/abc"
events = ["peg-cross", "season"]

[[channels]]
kind = "telegram"
id = "telegram-main"
bot_token = "123:abc"
chat_id = "-1000"
events = ["well-swap"]
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.dispatch.max_attempts, 4);
        assert_eq!(config.dispatch.max_delay_secs, 64);

        let peg = config.streams.peg_cross.unwrap();
        assert!(peg.common.enabled);
        assert_eq!(peg.common.interval_secs, 12);
        assert_eq!(peg.common.fetch_retry_budget, 3);
        assert_eq!(peg.peg, Decimal::ONE);

        let season = config.streams.season.unwrap();
        assert_eq!(season.common.fetch_retry_budget, 5);

        let activity = config.streams.contract_activity.unwrap();
        assert!(!activity.common.enabled);

        assert_eq!(config.channels.len(), 2);
        match &config.channels[0] {
            ChannelConfig::Discord { id, events, .. } => {
                assert_eq!(id, "discord-events");
                assert_eq!(events, &[EventKind::PegCross, EventKind::Season]);
            }
            other => panic!("expected discord channel, got {other:?}"),
        }
    }

    #[test]
    fn stream_common_maps_to_core_config() {
        let common = StreamCommon {
            enabled: true,
            interval_secs: 12,
            fetch_retry_budget: 3,
            fetch_backoff_base_secs: 2,
            seen_retention: 500,
        };
        let config = common.to_stream_config("peg-cross");
        assert_eq!(config.name, "peg-cross");
        assert_eq!(config.poll_interval, Duration::from_secs(12));
        assert_eq!(config.seen_retention, 500);
    }
}
