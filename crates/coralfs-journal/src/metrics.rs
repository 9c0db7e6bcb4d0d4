//! Journal metrics
//!
//! Counter and gauge names are stable and match the server's perf counter
//! schema; dashboards key on them. `export` renders the set in Prometheus
//! text format under the `coralfs_mdlog` prefix.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters and gauges for one metadata log instance
#[derive(Debug, Default)]
pub struct JournalMetrics {
    /// Events submitted (counter)
    pub evadd: AtomicU64,
    /// Events expired (counter)
    pub evex: AtomicU64,
    /// Events trimmed (counter)
    pub evtrm: AtomicU64,
    /// Resident events (gauge)
    pub ev: AtomicU64,
    /// Events in expiring segments (gauge)
    pub evexg: AtomicU64,
    /// Events in expired segments (gauge)
    pub evexd: AtomicU64,

    /// Segments opened (counter)
    pub segadd: AtomicU64,
    /// Segments expired (counter)
    pub segex: AtomicU64,
    /// Segments trimmed (counter)
    pub segtrm: AtomicU64,
    /// Resident segments (gauge)
    pub seg: AtomicU64,
    /// Expiring segments (gauge)
    pub segexg: AtomicU64,
    /// Expired segments (gauge)
    pub segexd: AtomicU64,

    /// Journal expire position (gauge)
    pub expos: AtomicU64,
    /// Journal write position (gauge)
    pub wrpos: AtomicU64,
    /// Journal read position (gauge)
    pub rdpos: AtomicU64,
    /// Last head/flush write latency, microseconds (gauge)
    pub jlat: AtomicU64,
}

impl JournalMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self) -> [(&'static str, &'static str, &'static str, &AtomicU64); 16] {
        [
            ("evadd", "counter", "Events submitted", &self.evadd),
            ("evex", "counter", "Events expired", &self.evex),
            ("evtrm", "counter", "Events trimmed", &self.evtrm),
            ("ev", "gauge", "Resident events", &self.ev),
            ("evexg", "gauge", "Events in expiring segments", &self.evexg),
            ("evexd", "gauge", "Events in expired segments", &self.evexd),
            ("segadd", "counter", "Segments opened", &self.segadd),
            ("segex", "counter", "Segments expired", &self.segex),
            ("segtrm", "counter", "Segments trimmed", &self.segtrm),
            ("seg", "gauge", "Resident segments", &self.seg),
            ("segexg", "gauge", "Expiring segments", &self.segexg),
            ("segexd", "gauge", "Expired segments", &self.segexd),
            ("expos", "gauge", "Journal expire position", &self.expos),
            ("wrpos", "gauge", "Journal write position", &self.wrpos),
            ("rdpos", "gauge", "Journal read position", &self.rdpos),
            ("jlat", "gauge", "Journal write latency in microseconds", &self.jlat),
        ]
    }

    /// Read one metric by its stable name
    pub fn get(&self, name: &str) -> Option<u64> {
        self.table()
            .iter()
            .find(|(n, _, _, _)| *n == name)
            .map(|(_, _, _, v)| v.load(Ordering::Relaxed))
    }

    /// Export all metrics in Prometheus text format
    pub fn export(&self, prefix: &str) -> String {
        let mut output = String::with_capacity(2048);
        for (name, kind, help, value) in self.table() {
            let _ = writeln!(output, "# HELP {}_{} {}", prefix, name, help);
            let _ = writeln!(output, "# TYPE {}_{} {}", prefix, name, kind);
            let _ = writeln!(
                output,
                "{}_{} {}",
                prefix,
                name,
                value.load(Ordering::Relaxed)
            );
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_contains_all_names() {
        let m = JournalMetrics::new();
        m.evadd.fetch_add(7, Ordering::Relaxed);
        m.wrpos.store(4096, Ordering::Relaxed);

        let out = m.export("coralfs_mdlog");
        for name in [
            "evadd", "evex", "evtrm", "ev", "evexg", "evexd", "segadd", "segex", "segtrm", "seg",
            "segexg", "segexd", "expos", "wrpos", "rdpos", "jlat",
        ] {
            assert!(out.contains(&format!("coralfs_mdlog_{} ", name)), "{name}");
        }
        assert!(out.contains("coralfs_mdlog_evadd 7"));
        assert!(out.contains("coralfs_mdlog_wrpos 4096"));
    }

    #[test]
    fn test_get_by_name() {
        let m = JournalMetrics::new();
        m.seg.store(3, Ordering::Relaxed);
        assert_eq!(m.get("seg"), Some(3));
        assert_eq!(m.get("nope"), None);
    }
}
