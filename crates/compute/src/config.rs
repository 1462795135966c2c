use serde::{Deserialize, Serialize};

/// When the dispatcher consumes a dispatch's readback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadbackPolicy {
    /// Stall the device after every submission and consume the result immediately.
    Blocking,
    /// Poll outstanding readbacks on every worker tick.
    #[default]
    Deferred,
}

/// Settings for the scale dispatch and its submission thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub multiplier: f32,
    pub element_count: u32,
    /// Initial value of every element of the data buffer.
    pub fill_value: f32,
    /// Copy the data buffer back after each dispatch.
    pub readback: bool,
    pub readback_policy: ReadbackPolicy,
    /// Worker tick while readbacks are outstanding.
    pub poll_interval_ms: u64,
    /// Number of values logged from each completed readback.
    pub preview_count: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            multiplier: 2.0,
            element_count: 256,
            fill_value: crate::DEFAULT_FILL_VALUE,
            readback: true,
            readback_policy: ReadbackPolicy::Deferred,
            poll_interval_ms: 4,
            preview_count: 4,
        }
    }
}
