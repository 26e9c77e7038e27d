//! Elapsed-time context persisted across sessions in a one-field state file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Local};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Default, Serialize, Deserialize)]
struct TimestampFile {
    /// Absent until the first committed turn.
    #[serde(default)]
    last_interaction: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemporalContext {
    pub now: DateTime<Local>,
    pub last_interaction: Option<DateTime<Local>>,
    pub delta: String,
}

impl TemporalContext {
    pub fn new(now: DateTime<Local>, last_interaction: Option<DateTime<Local>>) -> Self {
        let delta = describe_delta(now, last_interaction);
        Self {
            now,
            last_interaction,
            delta,
        }
    }

    /// Text for the `<temporal_data>` packet section.
    pub fn block(&self) -> String {
        let last = self
            .last_interaction
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "N/A".to_string());
        format!(
            "CURRENT_TIME: {} (Day {})\nLAST_INTERACTION: {last}\nDELTA: {}",
            self.now.format("%Y-%m-%d %H:%M"),
            self.now.weekday().number_from_monday(),
            self.delta
        )
    }
}

fn describe_delta(now: DateTime<Local>, last: Option<DateTime<Local>>) -> String {
    let Some(last) = last else {
        return "No prior record".to_string();
    };
    let elapsed = now.signed_duration_since(last);
    let hours = elapsed.num_seconds() as f64 / 3600.0;
    if hours < 1.0 {
        format!("{} minutes", elapsed.num_minutes().max(0))
    } else if hours < 24.0 {
        format!("{hours:.1} hours")
    } else {
        format!("{} days", elapsed.num_days())
    }
}

/// Reads and refreshes the last-interaction timestamp.
#[derive(Debug, Clone)]
pub struct TimeKeeper {
    path: PathBuf,
}

impl TimeKeeper {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Previous timestamp, if the state file exists and parses.
    pub fn last_interaction(&self) -> Option<DateTime<Local>> {
        let raw = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<TimestampFile>(&raw) {
            Ok(file) => file.last_interaction,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "timestamp file unreadable, starting fresh");
                None
            }
        }
    }

    pub fn record(&self, now: DateTime<Local>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_string(&TimestampFile {
            last_interaction: Some(now),
        })?;
        fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(())
    }

    /// Create a state file with no recorded interaction when none exists.
    /// Returns whether one was written.
    pub fn seed(&self) -> Result<bool> {
        if self.path.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string(&TimestampFile::default())?;
        fs::write(&self.path, json)
            .with_context(|| format!("writing {}", self.path.display()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(y, m, d, h, min, 0).single().unwrap()
    }

    #[test]
    fn delta_wording_by_magnitude() {
        let now = at(2026, 3, 10, 12, 0);
        assert_eq!(describe_delta(now, None), "No prior record");
        assert_eq!(describe_delta(now, Some(now - Duration::minutes(42))), "42 minutes");
        assert_eq!(describe_delta(now, Some(now - Duration::minutes(150))), "2.5 hours");
        assert_eq!(describe_delta(now, Some(now - Duration::hours(75))), "3 days");
    }

    #[test]
    fn block_lists_weekday_and_placeholder() {
        // 2026-03-09 is a Monday.
        let ctx = TemporalContext::new(at(2026, 3, 9, 8, 5), None);
        assert_eq!(
            ctx.block(),
            "CURRENT_TIME: 2026-03-09 08:05 (Day 1)\nLAST_INTERACTION: N/A\nDELTA: No prior record"
        );
    }

    #[test]
    fn recorded_interaction_feeds_the_next_context() {
        let dir = TempDir::new().unwrap();
        let keeper = TimeKeeper::new(dir.path().join("state/timestamps.json"));
        let first = at(2026, 3, 9, 8, 0);
        assert!(keeper.last_interaction().is_none());

        keeper.record(first).unwrap();
        let ctx = TemporalContext::new(first + Duration::minutes(5), keeper.last_interaction());
        assert_eq!(ctx.last_interaction, Some(first));
        assert_eq!(ctx.delta, "5 minutes");
    }

    #[test]
    fn corrupt_state_file_is_treated_as_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timestamps.json");
        fs::write(&path, "not json").unwrap();
        let keeper = TimeKeeper::new(&path);

        assert!(keeper.last_interaction().is_none());
        keeper.record(at(2026, 1, 1, 0, 0)).unwrap();
        assert!(keeper.last_interaction().is_some());
    }

    #[test]
    fn seeded_state_file_reads_as_no_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("timestamps.json");
        let keeper = TimeKeeper::new(&path);
        assert!(keeper.seed().unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"last_interaction":null}"#);
        assert!(keeper.last_interaction().is_none());

        // Files written before the field became optional still parse.
        fs::write(&path, "{}").unwrap();
        assert!(keeper.last_interaction().is_none());
    }

    #[test]
    fn seed_never_overwrites() {
        let dir = TempDir::new().unwrap();
        let keeper = TimeKeeper::new(dir.path().join("timestamps.json"));
        assert!(keeper.seed().unwrap());
        keeper.record(at(2026, 1, 1, 0, 0)).unwrap();
        assert!(!keeper.seed().unwrap());
        assert!(keeper.last_interaction().is_some());
    }
}
