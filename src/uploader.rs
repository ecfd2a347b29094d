// src/uploader.rs
//
// HTTPS batch uploader: drains the spool toward the VPS ingest endpoint.
//
// Peeks a batch from the spool, POSTs it as JSON to {base}/v1/ingest with
// bearer auth, and acks exactly the peeked rows on a 2xx response. On any
// failure nothing is acked and the backoff doubles (capped). The uploader
// itself never sleeps; the supervisor paces calls and may consult
// current_backoff().
//
// The base URL must be https and certificate verification is always on.

use std::time::Duration;

use crate::spool::Spool;

pub const INITIAL_BACKOFF_S: f64 = 1.0;
pub const DEFAULT_MAX_BACKOFF_S: f64 = 300.0;

#[derive(Debug)]
pub struct Uploader {
    ingest_url: String,
    token: String,
    batch_size: usize,
    max_backoff_s: f64,
    current_backoff: f64,
    client: reqwest::Client,
}

impl Uploader {
    /// Build an uploader. Rejects non-HTTPS base URLs at construction so a
    /// plaintext misconfiguration can never reach the network.
    pub fn new(
        base_url: &str,
        token: &str,
        batch_size: usize,
        max_backoff_s: f64,
        timeout_s: u64,
    ) -> Result<Self, String> {
        if !base_url.to_ascii_lowercase().starts_with("https://") {
            return Err(format!("VPS base URL must use HTTPS (got: '{}')", base_url));
        }

        // TLS certificate verification stays at the reqwest default (on);
        // there is deliberately no switch to disable it.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| format!("Failed to create HTTPS client: {}", e))?;

        Ok(Self {
            ingest_url: format!("{}/v1/ingest", base_url.trim_end_matches('/')),
            token: token.to_string(),
            batch_size,
            max_backoff_s,
            current_backoff: INITIAL_BACKOFF_S,
            client,
        })
    }

    /// Current backoff delay in seconds. Starts at 1 s, doubles on each
    /// consecutive failure (capped), resets to 1 s on success.
    pub fn current_backoff(&self) -> f64 {
        self.current_backoff
    }

    /// Peek a batch from the spool, POST it, ack on success.
    ///
    /// Returns true only when the batch was uploaded and acknowledged.
    /// An empty spool returns false with no side effects.
    pub async fn upload_batch(&mut self, spool: &Spool) -> bool {
        let rows = match spool.peek(self.batch_size) {
            Ok(rows) => rows,
            Err(e) => {
                tlog!("[uploader] Failed to peek spool: {}", e);
                return false;
            }
        };
        if rows.is_empty() {
            return false;
        }

        let mut samples: Vec<serde_json::Value> = Vec::with_capacity(rows.len());
        for (seq, payload) in &rows {
            match serde_json::from_str(payload) {
                Ok(value) => samples.push(value),
                Err(e) => {
                    // Payloads are written by our own normalizer; an
                    // undecodable row should stay visible, not be dropped
                    tlog!("[uploader] Undecodable spool payload at seq {}: {}", seq, e);
                    return false;
                }
            }
        }

        let body = serde_json::json!({ "samples": samples });

        let response = match self
            .client
            .post(&self.ingest_url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tlog!("[uploader] Upload failed (network error): {}", e);
                self.increase_backoff();
                return false;
            }
        };

        if response.status().is_success() {
            let seqs: Vec<i64> = rows.iter().map(|(seq, _)| *seq).collect();
            if let Err(e) = spool.ack(&seqs) {
                // Not acked: the rows will be re-sent and the server's
                // idempotent insert will absorb the duplicates
                tlog!("[uploader] Failed to ack {} uploaded row(s): {}", seqs.len(), e);
                return false;
            }
            tlog!("[uploader] Uploaded {} sample(s), acked seqs {:?}", rows.len(), seqs);
            self.reset_backoff();
            true
        } else {
            tlog!(
                "[uploader] Upload failed (HTTP {}), will retry after {:.1}s backoff",
                response.status(),
                self.current_backoff
            );
            self.increase_backoff();
            false
        }
    }

    fn increase_backoff(&mut self) {
        self.current_backoff = (self.current_backoff * 2.0).min(self.max_backoff_s);
    }

    fn reset_backoff(&mut self) {
        self.current_backoff = INITIAL_BACKOFF_S;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploader() -> Uploader {
        Uploader::new(
            "https://solar.example.com",
            "tok-123",
            30,
            DEFAULT_MAX_BACKOFF_S,
            30,
        )
        .unwrap()
    }

    #[test]
    fn test_new_rejects_http_url() {
        let err = Uploader::new("http://solar.example.com", "tok", 30, 300.0, 30).unwrap_err();
        assert!(err.contains("HTTPS"));
        // Case-insensitive scheme check
        assert!(Uploader::new("HTTPS://solar.example.com", "tok", 30, 300.0, 30).is_ok());
    }

    #[test]
    fn test_ingest_url_construction() {
        let up = Uploader::new("https://solar.example.com/", "tok", 30, 300.0, 30).unwrap();
        assert_eq!(up.ingest_url, "https://solar.example.com/v1/ingest");
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut up = Uploader::new("https://x.example", "tok", 30, 300.0, 30).unwrap();
        assert_eq!(up.current_backoff(), 1.0);
        for expected in [2.0, 4.0, 8.0, 16.0, 32.0, 64.0, 128.0, 256.0, 300.0, 300.0] {
            up.increase_backoff();
            assert_eq!(up.current_backoff(), expected);
        }
    }

    #[test]
    fn test_backoff_resets_after_success() {
        // Three consecutive failures take the backoff to 8 s; a success
        // brings the next delay back to 1 s
        let mut up = uploader();
        up.increase_backoff();
        up.increase_backoff();
        up.increase_backoff();
        assert_eq!(up.current_backoff(), 8.0);
        up.reset_backoff();
        assert_eq!(up.current_backoff(), 1.0);
    }

    #[tokio::test]
    async fn test_upload_batch_empty_spool_is_a_noop() {
        let path =
            std::env::temp_dir().join(format!("sunlink-uploader-test-{}.db", uuid::Uuid::new_v4()));
        let spool = Spool::open(&path).unwrap();

        let mut up = uploader();
        let result = up.upload_batch(&spool).await;
        assert!(!result);
        // No network attempt was made, so the backoff is untouched
        assert_eq!(up.current_backoff(), 1.0);

        let _ = std::fs::remove_file(&path);
    }
}
