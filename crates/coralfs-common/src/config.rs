//! Configuration for the metadata journal
//!
//! Knobs default to values suitable for a single-node development cluster;
//! production deployments override them from the server's config file.

use serde::{Deserialize, Serialize};

/// On-disk layout of a journal stream
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct JournalLayout {
    /// Size of each backing object; also the segment rotation period
    pub object_size: u64,
}

impl JournalLayout {
    /// The rotation period: one new segment per object boundary crossed
    pub fn period(&self) -> u64 {
        self.object_size
    }
}

impl Default for JournalLayout {
    fn default() -> Self {
        Self {
            object_size: 4 * 1024 * 1024, // 4 MB
        }
    }
}

/// Metadata journal configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Master switch; when false, submits complete immediately and no
    /// stream is maintained
    pub journaling_enabled: bool,
    /// Stream format version this server writes and upgrades to
    pub stream_format: u32,
    /// Soft cap on resident (non-expiring, non-expired) segments
    pub max_segments: usize,
    /// Soft cap on resident events; negative disables the event bound
    pub max_events: i64,
    /// Cap on concurrently expiring segments (expiry backpressure)
    pub max_expiring: usize,
    /// Wall-clock budget for one trim pass, in milliseconds
    pub trim_time_budget_ms: u64,
    /// Skip events that fail to decode during replay instead of aborting
    pub skip_corrupt_events: bool,
    /// Journal a synthetic subtree map test event after every submit
    pub debug_subtree_map: bool,
    /// Bound on head re-reads when replay chases an advancing writer
    pub max_resync_attempts: u32,
    /// Object layout for newly created journals
    pub layout: JournalLayout,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            journaling_enabled: true,
            stream_format: 1,
            max_segments: 128,
            max_events: -1,
            max_expiring: 20,
            trim_time_budget_ms: 2000,
            skip_corrupt_events: false,
            debug_subtree_map: false,
            max_resync_attempts: 3,
            layout: JournalLayout::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = JournalConfig::default();
        assert!(cfg.journaling_enabled);
        assert_eq!(cfg.stream_format, 1);
        assert_eq!(cfg.max_events, -1);
        assert_eq!(cfg.layout.period(), 4 * 1024 * 1024);
    }

    #[test]
    fn test_config_roundtrip_json() {
        let cfg = JournalConfig {
            max_segments: 4,
            ..Default::default()
        };
        let text = serde_json::to_string(&cfg).unwrap();
        let back: JournalConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(back.max_segments, 4);
    }
}
