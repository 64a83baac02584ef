//! Node configuration.
//!
//! Supports both programmatic and TOML file-based configuration. Every knob the node reads at
//! startup lives here: flow count, minimum packet size, store capacity, default discipline,
//! initial weights and channel bounds.

use crate::discipline::Discipline;
use crate::scheduler::OverflowPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Largest flow table addressable by a 16-bit `flow_id`.
pub const MAX_FLOWS: usize = 1 << 16;

/// Initial weight/quantum of one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowWeight {
    pub flow_id: u16,
    pub weight: u32,
}

/// Coordinates of the node's parent in the fabric (4 bits each).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentCoord {
    pub x: u8,
    pub y: u8,
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Number of flows (N).
    #[serde(default = "default_flows")]
    pub flows: usize,

    /// Minimum packet size floor in bytes.
    #[serde(default = "default_min_packet_size")]
    pub min_packet_size: u32,

    /// Reject packets shorter than `min_packet_size` at ingestion.
    #[serde(default)]
    pub enforce_min_length: bool,

    /// Priority store capacity.
    #[serde(default = "default_store_capacity")]
    pub store_capacity: usize,

    /// Discipline used when an inbound packet does not carry its own tag.
    #[serde(default)]
    pub discipline: Discipline,

    /// Weight given to every flow not listed in `weights`. Zero leaves those flows inactive.
    #[serde(default = "default_flow_weight")]
    pub default_weight: u32,

    /// Per-flow weight overrides.
    #[serde(default)]
    pub weights: Vec<FlowWeight>,

    /// Parent node coordinates.
    #[serde(default)]
    pub parent: Option<ParentCoord>,

    /// Ticks between admission and rank completion.
    #[serde(default)]
    pub rank_latency_ticks: u32,

    /// Inbound port capacity.
    #[serde(default = "default_port_capacity")]
    pub ingress_capacity: usize,

    /// Outbound port capacity.
    #[serde(default = "default_port_capacity")]
    pub egress_capacity: usize,

    /// Program memory size in words.
    #[serde(default = "default_program_words")]
    pub program_words: usize,

    /// Counter overflow behaviour.
    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// Log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_flows() -> usize {
    8
}

fn default_min_packet_size() -> u32 {
    64
}

fn default_store_capacity() -> usize {
    256
}

fn default_flow_weight() -> u32 {
    128
}

fn default_port_capacity() -> usize {
    64
}

fn default_program_words() -> usize {
    256
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            flows: default_flows(),
            min_packet_size: default_min_packet_size(),
            enforce_min_length: false,
            store_capacity: default_store_capacity(),
            discipline: Discipline::default(),
            default_weight: default_flow_weight(),
            weights: Vec::new(),
            parent: None,
            rank_latency_ticks: 0,
            ingress_capacity: default_port_capacity(),
            egress_capacity: default_port_capacity(),
            program_words: default_program_words(),
            overflow: OverflowPolicy::default(),
            log_level: default_log_level(),
        }
    }
}

impl NodeConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flows == 0 {
            return Err(ConfigError::Invalid("flows must be at least 1".into()));
        }
        if self.flows > MAX_FLOWS {
            return Err(ConfigError::Invalid(format!(
                "flows {} exceeds 16-bit flow_id range ({MAX_FLOWS})",
                self.flows
            )));
        }
        if self.min_packet_size == 0 {
            return Err(ConfigError::Invalid("min_packet_size must be positive".into()));
        }
        if self.store_capacity == 0 {
            return Err(ConfigError::Invalid("store_capacity must be positive".into()));
        }
        if self.ingress_capacity == 0 || self.egress_capacity == 0 {
            return Err(ConfigError::Invalid("port capacities must be positive".into()));
        }
        for entry in &self.weights {
            if usize::from(entry.flow_id) >= self.flows {
                return Err(ConfigError::Invalid(format!(
                    "weight for flow {} outside configured range 0..{}",
                    entry.flow_id, self.flows
                )));
            }
        }
        if let Some(parent) = self.parent {
            if parent.x > 0xF || parent.y > 0xF {
                return Err(ConfigError::Invalid(format!(
                    "parent coordinates ({}, {}) exceed 4 bits",
                    parent.x, parent.y
                )));
            }
        }
        Ok(())
    }

    /// Initial weight of every configured flow, in flow order.
    ///
    /// Flows listed in `weights` take the listed value (the last entry wins on duplicates);
    /// every other flow in `0..flows` takes `default_weight`.
    pub fn flow_weights(&self) -> impl Iterator<Item = FlowWeight> + '_ {
        (0..self.flows).map(move |index| {
            let flow_id = index as u16;
            let weight = self
                .weights
                .iter()
                .rev()
                .find(|entry| entry.flow_id == flow_id)
                .map_or(self.default_weight, |entry| entry.weight);
            FlowWeight { flow_id, weight }
        })
    }

    /// Builder-style weight override.
    pub fn with_weight(mut self, flow_id: u16, weight: u32) -> Self {
        self.weights.retain(|entry| entry.flow_id != flow_id);
        self.weights.push(FlowWeight { flow_id, weight });
        self
    }
}
