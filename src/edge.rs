// src/edge.rs
//
// Edge daemon supervisor: runs the poll and upload loops concurrently.
//
// 1. Poll loop: read Modbus registers via the Poller, normalize into a
//    Sample, enqueue the JSON payload into the local spool.
// 2. Upload loop: flush buffered samples to the VPS over HTTPS.
//
// Both loops are resilient: an error in one iteration is logged and does
// not stop the loop or affect the other loop. SIGTERM/SIGINT flip a shared
// watch flag; both loops finish their current iteration, then one final
// upload flush runs before exit.

use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use crate::config::{masked_token, EdgeConfig};
use crate::health::HealthWriter;
use crate::normalizer::normalize;
use crate::poller::{Poller, RawMap};
use crate::registers;
use crate::spool::Spool;
use crate::uploader::Uploader;

/// Run the edge daemon until a termination signal arrives.
pub async fn run(config: EdgeConfig) -> Result<(), String> {
    if let Some(dir) = &config.log_dir {
        crate::logging::init_file_logging(Path::new(dir))?;
    }

    // A broken catalog is a deployment-stopping defect
    registers::validate()?;

    log_config_summary(&config);

    let spool = Spool::open(Path::new(&config.spool_path))?;
    let poller = Poller::new(
        config.sungrow_host.clone(),
        config.sungrow_port,
        config.sungrow_slave_id,
        config.inter_register_delay_ms,
    );
    let uploader = Uploader::new(
        &config.vps_base_url,
        &config.vps_device_token,
        config.batch_size,
        config.max_backoff_s,
        config.upload_timeout_s,
    )?;
    let health = Arc::new(Mutex::new(HealthWriter::new(Path::new(&config.health_path))));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handler(shutdown_tx);

    tlog!("[edge] Starting concurrent poll and upload loops");

    let poll_task = tokio::spawn(poll_loop(
        poller,
        spool.clone(),
        config.clone(),
        health.clone(),
        shutdown_rx.clone(),
    ));
    let upload_task = tokio::spawn(upload_loop(
        uploader,
        spool.clone(),
        config.upload_interval_s,
        health.clone(),
        shutdown_rx,
    ));

    poll_task
        .await
        .map_err(|e| format!("Poll loop panicked: {}", e))?;
    let mut uploader = upload_task
        .await
        .map_err(|e| format!("Upload loop panicked: {}", e))?;

    // Final upload flush after shutdown
    tlog!("[edge] Attempting final upload flush before exit");
    if uploader.upload_batch(&spool).await {
        health.lock().unwrap().record_upload();
    }
    tlog!("[edge] Shutdown complete");

    Ok(())
}

// ============================================================================
// Loops
// ============================================================================

async fn poll_loop(
    mut poller: Poller,
    spool: Spool,
    config: EdgeConfig,
    health: Arc<Mutex<HealthWriter>>,
    mut shutdown: watch::Receiver<bool>,
) {
    tlog!("[edge] Poll loop started (interval={}s)", config.poll_interval_s);
    let mut polls_seen: u64 = 0;

    while !*shutdown.borrow() {
        poll_once(&mut poller, &spool, &config, &health, &mut polls_seen).await;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(config.poll_interval_s)) => {}
            _ = shutdown.changed() => {}
        }
    }
    tlog!("[edge] Poll loop stopped");
}

/// One poll-normalize-enqueue cycle. Never propagates errors: a failing
/// spool drops the sample with a warning, a failing poll just skips the
/// cycle. Health is updated after every attempt, success or not.
async fn poll_once(
    poller: &mut Poller,
    spool: &Spool,
    config: &EdgeConfig,
    health: &Arc<Mutex<HealthWriter>>,
    polls_seen: &mut u64,
) {
    match poller.poll().await {
        Some(raw) => {
            if config.raw_debug_enabled && config.raw_debug_every_n_polls > 0 {
                *polls_seen += 1;
                if *polls_seen % config.raw_debug_every_n_polls == 0 {
                    log_raw_snapshot(&raw);
                }
            }

            match normalize(&raw, &config.device_id, Utc::now()) {
                Some(sample) => match serde_json::to_string(&sample) {
                    Ok(payload) => match spool.enqueue(&payload) {
                        Ok(()) => {
                            tlog!("[edge] Poll success: enqueued sample for device={}", config.device_id)
                        }
                        Err(e) => tlog!("[edge] Spool enqueue failed, sample dropped: {}", e),
                    },
                    Err(e) => tlog!("[edge] Failed to encode sample: {}", e),
                },
                None => tlog!("[edge] Normalizer rejected raw values, skipping enqueue"),
            }
        }
        None => tlog!("[edge] Poller returned no data, skipping normalize and enqueue"),
    }

    let mut health = health.lock().unwrap();
    match spool.count() {
        Ok(count) => health.set_spool_count(count),
        Err(e) => tlog!("[edge] Failed to read spool count: {}", e),
    }
    health.record_poll();
}

async fn upload_loop(
    mut uploader: Uploader,
    spool: Spool,
    upload_interval_s: u64,
    health: Arc<Mutex<HealthWriter>>,
    mut shutdown: watch::Receiver<bool>,
) -> Uploader {
    tlog!("[edge] Upload loop started (interval={}s)", upload_interval_s);

    while !*shutdown.borrow() {
        if uploader.upload_batch(&spool).await {
            health.lock().unwrap().record_upload();
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(upload_interval_s)) => {}
            _ = shutdown.changed() => {}
        }
    }
    tlog!("[edge] Upload loop stopped");

    // Returned to the supervisor for the final flush
    uploader
}

// ============================================================================
// Signals & Diagnostics
// ============================================================================

fn spawn_signal_handler(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut sigterm =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(signal) => signal,
                    Err(e) => {
                        tlog!("[edge] Failed to install SIGTERM handler: {}", e);
                        let _ = tokio::signal::ctrl_c().await;
                        tlog!("[edge] Received shutdown signal, initiating graceful shutdown");
                        let _ = shutdown_tx.send(true);
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }

        tlog!("[edge] Received shutdown signal, initiating graceful shutdown");
        let _ = shutdown_tx.send(true);
    });
}

/// Startup config summary. Deliberately omits the device token; only a
/// non-reversible fingerprint is logged.
fn log_config_summary(config: &EdgeConfig) {
    tlog!(
        "[edge] Starting with config: sungrow_host={}, sungrow_port={}, sungrow_slave_id={}, \
         poll_interval_s={}, upload_interval_s={}, inter_register_delay_ms={}, batch_size={}, \
         spool_path={}, device_id={}, vps_base_url={}, raw_debug_enabled={}, \
         raw_debug_every_n_polls={}, vps_token_masked={}",
        config.sungrow_host,
        config.sungrow_port,
        config.sungrow_slave_id,
        config.poll_interval_s,
        config.upload_interval_s,
        config.inter_register_delay_ms,
        config.batch_size,
        config.spool_path,
        config.device_id,
        config.vps_base_url,
        config.raw_debug_enabled,
        config.raw_debug_every_n_polls,
        masked_token(&config.vps_device_token)
    );
}

/// Compact raw register snapshot for debugging field decoding.
fn log_raw_snapshot(raw: &RawMap) {
    const KEYS: [&str; 8] = [
        "total_dc_power",
        "daily_pv_generation",
        "battery_power",
        "battery_soc",
        "battery_temperature",
        "load_power",
        "grid_power",
        "export_power",
    ];
    let snapshot: Vec<String> = KEYS
        .iter()
        .filter_map(|k| raw.get(*k).map(|words| format!("{}={:04X?}", k, words)))
        .collect();
    tlog!("[edge] Raw register snapshot: {}", snapshot.join(" "));
}
