// src/health.rs
//
// Liveness file writer for the edge daemon.
//
// Maintains {last_poll_ts, last_upload_ts, spool_count} and rewrites the
// health file on every state change. The write goes through a temp file
// and rename so readers (Docker HEALTHCHECK, monitoring scrapes) never
// observe a partial file.

use chrono::{SecondsFormat, Utc};
use std::path::{Path, PathBuf};

pub struct HealthWriter {
    path: PathBuf,
    last_poll_ts: Option<String>,
    last_upload_ts: Option<String>,
    spool_count: u64,
}

impl HealthWriter {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            last_poll_ts: None,
            last_upload_ts: None,
            spool_count: 0,
        }
    }

    /// Record a poll event and rewrite the health file.
    pub fn record_poll(&mut self) {
        self.last_poll_ts = Some(now_iso());
        self.write();
    }

    /// Record a successful upload and rewrite the health file.
    pub fn record_upload(&mut self) {
        self.last_upload_ts = Some(now_iso());
        self.write();
    }

    /// Update the pending spool count and rewrite the health file.
    pub fn set_spool_count(&mut self, count: u64) {
        self.spool_count = count;
        self.write();
    }

    fn write(&self) {
        let data = serde_json::json!({
            "last_poll_ts": self.last_poll_ts,
            "last_upload_ts": self.last_upload_ts,
            "spool_count": self.spool_count,
        });

        // Liveness is best-effort: a failed write must never take the
        // daemon down
        if let Err(e) = write_atomic(&self.path, &data.to_string()) {
            tlog!("[health] Failed to write health file: {}", e);
        }
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Write via temp file + rename so the file is replaced atomically.
fn write_atomic(path: &Path, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create health dir: {}", e))?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content).map_err(|e| format!("Failed to write temp file: {}", e))?;
    std::fs::rename(&tmp, path).map_err(|e| format!("Failed to replace health file: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_health_path() -> PathBuf {
        std::env::temp_dir().join(format!("sunlink-health-test-{}.json", uuid::Uuid::new_v4()))
    }

    fn read_json(path: &Path) -> serde_json::Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[test]
    fn test_initial_write_has_null_timestamps() {
        let path = temp_health_path();
        let mut writer = HealthWriter::new(&path);
        writer.set_spool_count(0);

        let data = read_json(&path);
        assert!(data["last_poll_ts"].is_null());
        assert!(data["last_upload_ts"].is_null());
        assert_eq!(data["spool_count"], 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_record_poll_and_upload() {
        let path = temp_health_path();
        let mut writer = HealthWriter::new(&path);

        writer.record_poll();
        let data = read_json(&path);
        assert!(data["last_poll_ts"].is_string());
        assert!(data["last_upload_ts"].is_null());

        writer.record_upload();
        writer.set_spool_count(7);
        let data = read_json(&path);
        assert!(data["last_upload_ts"].is_string());
        assert_eq!(data["spool_count"], 7);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_overwrite_keeps_file_valid() {
        let path = temp_health_path();
        let mut writer = HealthWriter::new(&path);
        for i in 0..20 {
            writer.set_spool_count(i);
            let data = read_json(&path);
            assert_eq!(data["spool_count"], i);
        }
        let _ = std::fs::remove_file(&path);
    }
}
