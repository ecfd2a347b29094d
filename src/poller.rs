// src/poller.rs
//
// Modbus TCP poll orchestrator for the Sungrow SH4.0RS via WiNet-S.
//
// Each poll cycle opens a fresh TCP session, reads every register group in
// catalog order with inter-group pacing, slices the group responses into
// per-register word lists, and closes the session. Errors never propagate
// to the caller: any failure logs and yields None. The stateful Poller
// wrapper adds exponential backoff across consecutive failed cycles.
//
// tokio-modbus read methods return Result<Result<Vec<u16>, Exception>>:
// outer = IO error, inner = Modbus exception from the device.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tokio_modbus::client::tcp;
use tokio_modbus::prelude::*;

use crate::registers::{self, RegisterGroup, EXPORT_GROUP};

/// Raw poll result: register name -> raw 16-bit words (word_count entries).
pub type RawMap = HashMap<String, Vec<u16>>;

/// Initial backoff delay in seconds after the first failed cycle.
pub const BASE_BACKOFF_S: f64 = 1.0;

/// Maximum backoff delay in seconds (cap for exponential growth).
pub const MAX_BACKOFF_S: f64 = 60.0;

/// Timeout per Modbus TCP connect / request in seconds (WiNet-S guideline).
pub const MODBUS_TIMEOUT_S: u64 = 10;

// ============================================================================
// Stateful Poller with Exponential Backoff
// ============================================================================

/// Stateful Modbus poller. Consecutive failures grow the pre-attempt sleep
/// exponentially; any successful poll resets it.
pub struct Poller {
    host: String,
    port: u16,
    slave_id: u8,
    inter_register_delay_ms: u64,
    consecutive_failures: u32,
}

impl Poller {
    pub fn new(host: String, port: u16, slave_id: u8, inter_register_delay_ms: u64) -> Self {
        Self {
            host,
            port,
            slave_id,
            inter_register_delay_ms,
            consecutive_failures: 0,
        }
    }

    /// Number of consecutive failed cycles (observability).
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Execute one poll cycle, sleeping the backoff delay first when the
    /// previous cycle(s) failed.
    pub async fn poll(&mut self) -> Option<RawMap> {
        if self.consecutive_failures > 0 {
            let delay = backoff_delay(self.consecutive_failures);
            tlog!(
                "[poller] Backoff: sleeping {:.1}s before retry (consecutive failures: {})",
                delay,
                self.consecutive_failures
            );
            tokio::time::sleep(Duration::from_secs_f64(delay)).await;
        }

        let result = poll_registers(
            &self.host,
            self.port,
            self.slave_id,
            self.inter_register_delay_ms,
        )
        .await;

        if result.is_some() {
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        result
    }
}

/// Backoff delay before attempt n+1 after n consecutive failures:
/// min(BASE * 2^(n-1), MAX), 0 when n == 0.
pub fn backoff_delay(consecutive_failures: u32) -> f64 {
    if consecutive_failures == 0 {
        return 0.0;
    }
    let exp = (consecutive_failures - 1).min(30);
    (BASE_BACKOFF_S * f64::powi(2.0, exp as i32)).min(MAX_BACKOFF_S)
}

// ============================================================================
// Single Poll Cycle
// ============================================================================

/// Execute a single Modbus poll cycle and return raw register words.
/// Opens a new TCP session, reads every catalog group, closes the session
/// on every exit path. Returns None on any error.
pub async fn poll_registers(
    host: &str,
    port: u16,
    slave_id: u8,
    inter_register_delay_ms: u64,
) -> Option<RawMap> {
    // Resolve host:port (the WiNet-S is usually addressed by IP, but
    // hostnames are accepted)
    let target = format!("{}:{}", host, port);
    let addr = match tokio::net::lookup_host(&target).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr,
            None => {
                tlog!("[poller] No address found for {}", target);
                return None;
            }
        },
        Err(e) => {
            tlog!("[poller] Failed to resolve {}: {}", target, e);
            return None;
        }
    };

    let slave = Slave(slave_id);
    let mut ctx = match timeout(
        Duration::from_secs(MODBUS_TIMEOUT_S),
        tcp::connect_slave(addr, slave),
    )
    .await
    {
        Ok(Ok(ctx)) => ctx,
        Ok(Err(e)) => {
            tlog!("[poller] Failed to connect to Modbus device at {}: {}", addr, e);
            return None;
        }
        Err(_) => {
            tlog!("[poller] Connect to {} timed out after {}s", addr, MODBUS_TIMEOUT_S);
            return None;
        }
    };

    let result = read_all_groups(&mut ctx, inter_register_delay_ms).await;

    // Close the session whether the cycle succeeded or not
    let _ = ctx.disconnect().await;

    result
}

async fn read_all_groups(
    ctx: &mut tokio_modbus::client::Context,
    inter_register_delay_ms: u64,
) -> Option<RawMap> {
    let mut out = RawMap::new();

    for (idx, group) in registers::groups().iter().enumerate() {
        // Inter-register delay between groups, not before the first read.
        // The WiNet-S drops the session when reads arrive back to back.
        if idx > 0 && inter_register_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(inter_register_delay_ms)).await;
        }

        let words = match timeout(
            Duration::from_secs(MODBUS_TIMEOUT_S),
            ctx.read_input_registers(group.start_address, group.count),
        )
        .await
        {
            Ok(Ok(Ok(words))) => words,
            Ok(Ok(Err(exc))) => {
                // Some WiNet-S firmwares answer "illegal data address" for
                // the export estimate; the group is optional
                if group.name == EXPORT_GROUP {
                    tlog!(
                        "[poller] Modbus exception reading optional group '{}' (address={}, count={}): {}, continuing without export register",
                        group.name,
                        group.start_address,
                        group.count,
                        exc
                    );
                    continue;
                }
                tlog!(
                    "[poller] Modbus exception reading group '{}' (address={}, count={}): {}",
                    group.name,
                    group.start_address,
                    group.count,
                    exc
                );
                return None;
            }
            Ok(Err(e)) => {
                tlog!(
                    "[poller] IO error reading group '{}' (address={}, count={}): {}",
                    group.name,
                    group.start_address,
                    group.count,
                    e
                );
                return None;
            }
            Err(_) => {
                tlog!(
                    "[poller] Request timed out reading group '{}' (address={}, count={})",
                    group.name,
                    group.start_address,
                    group.count
                );
                return None;
            }
        };

        if words.len() < group.count as usize {
            tlog!(
                "[poller] Short response for group '{}': got {} of {} words",
                group.name,
                words.len(),
                group.count
            );
            return None;
        }

        extract_register_values(group, &words, &mut out);
    }

    Some(out)
}

/// Slice group-level raw words into per-register word lists. Each
/// register's slice is determined by its address offset within the group
/// and its word_count.
fn extract_register_values(group: &RegisterGroup, raw_words: &[u16], out: &mut RawMap) {
    for reg in &group.registers {
        let offset = (reg.address - group.start_address) as usize;
        let end = offset + reg.word_count as usize;
        if end <= raw_words.len() {
            out.insert(reg.name.to_string(), raw_words[offset..end].to_vec());
        }
    }
}
