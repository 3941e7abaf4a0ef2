//! Configuration for the Kafka-backed synchronized consumer

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::{ConsumerError, ConsumerResult};
use crate::types::Topic;

/// Environment variable prefix, e.g. `SYNC_CONSUMER_GROUP_ID`
pub const ENV_PREFIX: &str = "SYNC_CONSUMER";

/// Where a consumer starts when its group has no committed offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
    /// Fail instead of picking a position
    Error,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::Error => "error",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OffsetReset {
    type Err = ConsumerError;

    /// Accepts librdkafka's aliases as well
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "earliest" | "smallest" | "beginning" => Ok(OffsetReset::Earliest),
            "latest" | "largest" | "end" => Ok(OffsetReset::Latest),
            "error" => Ok(OffsetReset::Error),
            other => Err(ConsumerError::Configuration(format!(
                "unknown auto.offset.reset value: {}",
                other
            ))),
        }
    }
}

/// Settings for a synchronized consumer and its commit log consumer
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SynchronizedConsumerConfig {
    /// Bootstrap servers
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,

    /// Consumer group of the wrapped consumer
    #[validate(length(min = 1, max = 255))]
    pub group_id: String,

    #[validate(length(min = 1))]
    #[serde(default = "default_commit_log_topic")]
    pub commit_log_topic: String,

    /// Defaults to `{group_id}-commit-log`
    #[serde(default)]
    pub commit_log_group_id: Option<String>,

    /// Groups whose progress gates this consumer
    #[validate(length(min = 1))]
    pub tracked_groups: Vec<String>,

    #[serde(default)]
    pub auto_offset_reset: OffsetReset,

    #[validate(range(min = 1))]
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// `0` waits for the commit log assignment forever
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: Option<u64>,

    #[serde(default)]
    pub enable_partition_eof: bool,
}

fn default_commit_log_topic() -> String {
    "snuba-commit-log".to_string()
}

fn default_session_timeout_ms() -> u64 {
    6000
}

fn default_startup_timeout_secs() -> Option<u64> {
    Some(30)
}

impl SynchronizedConsumerConfig {
    /// Load configuration from an optional TOML file, then environment
    /// variables prefixed with [`ENV_PREFIX`].
    ///
    /// Nested keys use `__`; `brokers` and `tracked_groups` accept
    /// comma-separated lists.
    pub fn load(config_path: Option<&Path>) -> ConsumerResult<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = config_path {
            if !path.exists() {
                return Err(ConsumerError::Configuration(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("brokers")
                .with_list_parse_key("tracked_groups")
                .try_parsing(true),
        );

        let settings = builder.build().map_err(|e| {
            ConsumerError::Configuration(format!("failed to load configuration: {}", e))
        })?;

        let config: SynchronizedConsumerConfig = settings.try_deserialize().map_err(|e| {
            ConsumerError::Configuration(format!("failed to deserialize configuration: {}", e))
        })?;

        config.check()?;
        Ok(config)
    }

    /// Run field validation plus the cross-field rules
    pub fn check(&self) -> ConsumerResult<()> {
        self.validate()
            .map_err(|e| ConsumerError::Configuration(format!("validation failed: {}", e)))?;

        if self.tracked_groups.iter().any(|group| group.is_empty()) {
            return Err(ConsumerError::Configuration(
                "tracked_groups must not contain empty names".to_string(),
            ));
        }
        if self.commit_log_group_id() == self.group_id {
            return Err(ConsumerError::Configuration(
                "commit_log_group_id must differ from group_id".to_string(),
            ));
        }
        Ok(())
    }

    /// Get bootstrap servers as comma-separated string
    pub fn bootstrap_servers(&self) -> String {
        self.brokers.join(",")
    }

    pub fn commit_log_topic(&self) -> Topic {
        Topic::new(self.commit_log_topic.as_str())
    }

    pub fn commit_log_group_id(&self) -> String {
        self.commit_log_group_id
            .clone()
            .unwrap_or_else(|| format!("{}-commit-log", self.group_id))
    }

    pub fn startup_timeout(&self) -> Option<Duration> {
        self.startup_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Client settings for the wrapped consumer
    pub fn consumer_client_config(&self) -> ClientConfig {
        self.client_config(&self.group_id, self.auto_offset_reset)
    }

    /// Client settings for the commit log consumer. It never commits, so it
    /// replays the log from the beginning on every start.
    pub fn commit_log_client_config(&self) -> ClientConfig {
        self.client_config(&self.commit_log_group_id(), OffsetReset::Earliest)
    }

    fn client_config(&self, group_id: &str, offset_reset: OffsetReset) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.bootstrap_servers())
            .set("group.id", group_id)
            .set("client.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", offset_reset.as_str())
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set(
                "enable.partition.eof",
                if self.enable_partition_eof { "true" } else { "false" },
            );
        config
    }
}
