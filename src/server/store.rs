// src/server/store.rs
//
// Time-series store: TimescaleDB hypertable plus continuous aggregates.
//
// The base table sungrow_samples carries one row per (device_id, ts).
// Three continuous aggregate views (sungrow_hourly / _daily / _monthly)
// roll it up into fixed time buckets and are refreshed by the database on
// a schedule. The schema is applied idempotently at startup; everything
// Timescale-specific is best-effort so the service also runs on plain
// PostgreSQL, where the series query falls back to live bucketing.

use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use serde::Serialize;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, Row};

use crate::sample::Sample;

// ============================================================================
// Schema
// ============================================================================

const CREATE_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS sungrow_samples (
    device_id       TEXT NOT NULL,
    ts              TIMESTAMPTZ NOT NULL,
    pv_power_w      DOUBLE PRECISION NOT NULL,
    pv_daily_kwh    DOUBLE PRECISION,
    battery_power_w DOUBLE PRECISION NOT NULL,
    battery_soc_pct DOUBLE PRECISION NOT NULL,
    battery_temp_c  DOUBLE PRECISION,
    load_power_w    DOUBLE PRECISION NOT NULL,
    export_power_w  DOUBLE PRECISION NOT NULL,
    sample_count    INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (device_id, ts)
);
";

const CREATE_HYPERTABLE_SQL: &str = "
SELECT create_hypertable('sungrow_samples', 'ts',
    chunk_time_interval => INTERVAL '7 days',
    if_not_exists => TRUE
);
";

// Shared aggregate columns for all three views. sample_count sums so the
// weights survive a future re-aggregation; max only matters for PV peaks.
const AGG_COLUMNS: &str = "
    AVG(pv_power_w)       AS avg_pv_power_w,
    MAX(pv_power_w)       AS max_pv_power_w,
    AVG(battery_power_w)  AS avg_battery_power_w,
    AVG(battery_soc_pct)  AS avg_battery_soc_pct,
    AVG(load_power_w)     AS avg_load_power_w,
    AVG(export_power_w)   AS avg_export_power_w,
    SUM(sample_count)     AS sample_count";

fn create_view_sql(view_name: &str, bucket_interval: &str) -> String {
    format!(
        "CREATE MATERIALIZED VIEW IF NOT EXISTS {view}\n\
         WITH (timescaledb.continuous) AS\n\
         SELECT\n\
             device_id,\n\
             time_bucket('{interval}', ts) AS bucket,\n\
         {columns}\n\
         FROM sungrow_samples\n\
         GROUP BY device_id, bucket\n\
         WITH NO DATA",
        view = view_name,
        interval = bucket_interval,
        columns = AGG_COLUMNS,
    )
}

fn add_refresh_policy_sql(
    view_name: &str,
    start_offset: &str,
    end_offset: &str,
    schedule_interval: &str,
) -> String {
    format!(
        "SELECT add_continuous_aggregate_policy('{view}',\n\
             start_offset      => INTERVAL '{start}',\n\
             end_offset        => INTERVAL '{end}',\n\
             schedule_interval => INTERVAL '{schedule}',\n\
             if_not_exists     => TRUE\n\
         )",
        view = view_name,
        start = start_offset,
        end = end_offset,
        schedule = schedule_interval,
    )
}

// ============================================================================
// Frame Configuration
// ============================================================================

/// Maps a query frame to its source view and time window.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameConfig {
    /// Continuous aggregate view to query.
    pub view: &'static str,
    /// date_trunc unit for the live-bucketing fallback.
    pub bucket_trunc: &'static str,
    /// date_trunc unit of the window start (None = all time).
    pub window_trunc: Option<&'static str>,
}

pub fn frame_config(frame: &str) -> Option<FrameConfig> {
    match frame {
        "day" => Some(FrameConfig {
            view: "sungrow_hourly",
            bucket_trunc: "hour",
            window_trunc: Some("day"),
        }),
        "month" => Some(FrameConfig {
            view: "sungrow_daily",
            bucket_trunc: "day",
            window_trunc: Some("month"),
        }),
        "year" => Some(FrameConfig {
            view: "sungrow_monthly",
            bucket_trunc: "month",
            window_trunc: Some("year"),
        }),
        "all" => Some(FrameConfig {
            view: "sungrow_monthly",
            bucket_trunc: "month",
            window_trunc: None,
        }),
        _ => None,
    }
}

/// One aggregated time bucket for a device.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BucketRow {
    pub bucket: DateTime<Utc>,
    pub avg_pv_power_w: f64,
    pub max_pv_power_w: f64,
    pub avg_battery_power_w: f64,
    pub avg_battery_soc_pct: f64,
    pub avg_load_power_w: f64,
    pub avg_export_power_w: f64,
    pub sample_count: i64,
}

// ============================================================================
// Store
// ============================================================================

pub struct Store {
    pool: Pool,
}

impl Store {
    /// Build a connection pool from DATABASE_URL. No connection is opened
    /// until first use.
    pub fn connect(database_url: &str) -> Result<Self, String> {
        let pg_config: tokio_postgres::Config = database_url
            .parse()
            .map_err(|e| format!("Invalid DATABASE_URL: {}", e))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(16)
            .build()
            .map_err(|e| format!("Failed to build connection pool: {}", e))?;
        Ok(Self { pool })
    }

    /// Request-scoped connection: returned to the pool on drop, success
    /// or failure.
    async fn client(&self) -> Result<Object, String> {
        self.pool
            .get()
            .await
            .map_err(|e| format!("Failed to get database connection: {}", e))
    }

    /// Apply the schema idempotently. The base table is mandatory; the
    /// Timescale extension, hypertable conversion, aggregate views, and
    /// refresh policies are best-effort so a plain-PostgreSQL deployment
    /// still serves (via the live-bucketing fallback).
    pub async fn init_schema(&self) -> Result<(), String> {
        let client = self.client().await?;

        let mut timescale = true;
        if let Err(e) = client
            .batch_execute("CREATE EXTENSION IF NOT EXISTS timescaledb")
            .await
        {
            timescale = false;
            tlog!("[store] TimescaleDB extension unavailable, continuing on plain PostgreSQL: {}", e);
        }

        client
            .batch_execute(CREATE_TABLE_SQL)
            .await
            .map_err(|e| format!("Failed to create sungrow_samples: {}", e))?;

        if timescale {
            if let Err(e) = client.batch_execute(CREATE_HYPERTABLE_SQL).await {
                tlog!("[store] Hypertable conversion failed: {}", e);
            }

            for (view, interval) in [
                ("sungrow_hourly", "1 hour"),
                ("sungrow_daily", "1 day"),
                ("sungrow_monthly", "1 month"),
            ] {
                if let Err(e) = client.batch_execute(&create_view_sql(view, interval)).await {
                    tlog!("[store] Failed to create continuous aggregate {}: {}", view, e);
                }
            }

            // Refresh windows end one bucket before now so readers only
            // ever see stable, fully-closed buckets
            for (view, start, end, schedule) in [
                ("sungrow_hourly", "3 hours", "1 hour", "1 hour"),
                ("sungrow_daily", "3 days", "1 day", "1 day"),
                ("sungrow_monthly", "3 months", "1 month", "1 day"),
            ] {
                if let Err(e) = client
                    .batch_execute(&add_refresh_policy_sql(view, start, end, schedule))
                    .await
                {
                    tlog!("[store] Failed to add refresh policy for {}: {}", view, e);
                }
            }
        }

        tlog!("[store] Schema initialised (timescale={})", timescale);
        Ok(())
    }

    /// Idempotent bulk insert keyed on (device_id, ts). Returns the number
    /// of rows actually inserted; duplicates are silently skipped.
    pub async fn insert_samples(&self, samples: &[Sample]) -> Result<u64, String> {
        if samples.is_empty() {
            return Ok(0);
        }
        let client = self.client().await?;
        let sql = build_insert_sql(samples.len());

        let mut params: Vec<&(dyn ToSql + Sync)> = Vec::with_capacity(samples.len() * 10);
        for s in samples {
            params.push(&s.device_id);
            params.push(&s.ts);
            params.push(&s.pv_power_w);
            params.push(&s.pv_daily_kwh);
            params.push(&s.battery_power_w);
            params.push(&s.battery_soc_pct);
            params.push(&s.battery_temp_c);
            params.push(&s.load_power_w);
            params.push(&s.export_power_w);
            params.push(&s.sample_count);
        }

        client
            .execute(&sql, &params)
            .await
            .map_err(|e| format!("Failed to insert samples: {}", e))
    }

    /// Greatest-ts stored sample for a device, if any.
    pub async fn latest_sample(&self, device_id: &str) -> Result<Option<Sample>, String> {
        let client = self.client().await?;
        let row = client
            .query_opt(
                "SELECT device_id, ts, pv_power_w, pv_daily_kwh, battery_power_w, \
                 battery_soc_pct, battery_temp_c, load_power_w, export_power_w, sample_count \
                 FROM sungrow_samples WHERE device_id = $1 ORDER BY ts DESC LIMIT 1",
                &[&device_id],
            )
            .await
            .map_err(|e| format!("Failed to query latest sample: {}", e))?;

        row.map(|r| row_to_sample(&r)).transpose()
    }

    /// Bucketed series for a device and frame, ascending by bucket. Falls
    /// back to live bucketing over the base table when the aggregate view
    /// does not exist (fresh environment, plain PostgreSQL).
    pub async fn series(&self, device_id: &str, frame: &str) -> Result<Vec<BucketRow>, String> {
        let config = frame_config(frame).ok_or_else(|| format!("Unknown frame '{}'", frame))?;
        let client = self.client().await?;

        match client.query(&view_series_sql(&config), &[&device_id]).await {
            Ok(rows) => rows.iter().map(row_to_bucket).collect(),
            Err(e) if is_undefined_table(&e) => {
                tlog!(
                    "[store] View {} unavailable, falling back to live bucketing",
                    config.view
                );
                let rows = client
                    .query(&fallback_series_sql(&config), &[&device_id])
                    .await
                    .map_err(|e| format!("Failed to query series fallback: {}", e))?;
                rows.iter().map(row_to_bucket).collect()
            }
            Err(e) => Err(format!("Failed to query series: {}", e)),
        }
    }
}

fn is_undefined_table(e: &tokio_postgres::Error) -> bool {
    e.code() == Some(&SqlState::UNDEFINED_TABLE)
}

// ============================================================================
// SQL Construction
// ============================================================================

/// Multi-row INSERT with ON CONFLICT DO NOTHING. 10 columns per row.
fn build_insert_sql(rows: usize) -> String {
    let mut values = Vec::with_capacity(rows);
    for row in 0..rows {
        let base = row * 10;
        values.push(format!(
            "(${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${}, ${})",
            base + 1,
            base + 2,
            base + 3,
            base + 4,
            base + 5,
            base + 6,
            base + 7,
            base + 8,
            base + 9,
            base + 10,
        ));
    }
    format!(
        "INSERT INTO sungrow_samples \
         (device_id, ts, pv_power_w, pv_daily_kwh, battery_power_w, battery_soc_pct, \
         battery_temp_c, load_power_w, export_power_w, sample_count) \
         VALUES {} ON CONFLICT (device_id, ts) DO NOTHING",
        values.join(", ")
    )
}

fn view_series_sql(config: &FrameConfig) -> String {
    let mut sql = format!(
        "SELECT bucket, avg_pv_power_w, max_pv_power_w, avg_battery_power_w, \
         avg_battery_soc_pct, avg_load_power_w, avg_export_power_w, sample_count \
         FROM {} WHERE device_id = $1",
        config.view
    );
    if let Some(window) = config.window_trunc {
        sql.push_str(&format!(" AND bucket >= date_trunc('{}', now())", window));
    }
    sql.push_str(" ORDER BY bucket ASC");
    sql
}

/// Equivalent aggregates computed live from the base table. The window
/// predicate moves from bucket to ts, which selects the same rows because
/// every window boundary is also a bucket boundary.
fn fallback_series_sql(config: &FrameConfig) -> String {
    let mut sql = format!(
        "SELECT date_trunc('{}', ts) AS bucket,{} \
         FROM sungrow_samples WHERE device_id = $1",
        config.bucket_trunc, AGG_COLUMNS
    );
    if let Some(window) = config.window_trunc {
        sql.push_str(&format!(" AND ts >= date_trunc('{}', now())", window));
    }
    sql.push_str(" GROUP BY bucket ORDER BY bucket ASC");
    sql
}

// ============================================================================
// Row Parsing
// ============================================================================

fn row_to_sample(row: &Row) -> Result<Sample, String> {
    Ok(Sample {
        device_id: row
            .try_get("device_id")
            .map_err(|e| format!("Failed to get device_id: {}", e))?,
        ts: row.try_get("ts").map_err(|e| format!("Failed to get ts: {}", e))?,
        pv_power_w: row
            .try_get("pv_power_w")
            .map_err(|e| format!("Failed to get pv_power_w: {}", e))?,
        pv_daily_kwh: row
            .try_get("pv_daily_kwh")
            .map_err(|e| format!("Failed to get pv_daily_kwh: {}", e))?,
        battery_power_w: row
            .try_get("battery_power_w")
            .map_err(|e| format!("Failed to get battery_power_w: {}", e))?,
        battery_soc_pct: row
            .try_get("battery_soc_pct")
            .map_err(|e| format!("Failed to get battery_soc_pct: {}", e))?,
        battery_temp_c: row
            .try_get("battery_temp_c")
            .map_err(|e| format!("Failed to get battery_temp_c: {}", e))?,
        load_power_w: row
            .try_get("load_power_w")
            .map_err(|e| format!("Failed to get load_power_w: {}", e))?,
        export_power_w: row
            .try_get("export_power_w")
            .map_err(|e| format!("Failed to get export_power_w: {}", e))?,
        sample_count: row
            .try_get("sample_count")
            .map_err(|e| format!("Failed to get sample_count: {}", e))?,
    })
}

fn row_to_bucket(row: &Row) -> Result<BucketRow, String> {
    Ok(BucketRow {
        bucket: row
            .try_get("bucket")
            .map_err(|e| format!("Failed to get bucket: {}", e))?,
        avg_pv_power_w: row
            .try_get("avg_pv_power_w")
            .map_err(|e| format!("Failed to get avg_pv_power_w: {}", e))?,
        max_pv_power_w: row
            .try_get("max_pv_power_w")
            .map_err(|e| format!("Failed to get max_pv_power_w: {}", e))?,
        avg_battery_power_w: row
            .try_get("avg_battery_power_w")
            .map_err(|e| format!("Failed to get avg_battery_power_w: {}", e))?,
        avg_battery_soc_pct: row
            .try_get("avg_battery_soc_pct")
            .map_err(|e| format!("Failed to get avg_battery_soc_pct: {}", e))?,
        avg_load_power_w: row
            .try_get("avg_load_power_w")
            .map_err(|e| format!("Failed to get avg_load_power_w: {}", e))?,
        avg_export_power_w: row
            .try_get("avg_export_power_w")
            .map_err(|e| format!("Failed to get avg_export_power_w: {}", e))?,
        sample_count: row
            .try_get("sample_count")
            .map_err(|e| format!("Failed to get sample_count: {}", e))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Frame Mapping Tests
    // ========================================================================

    #[test]
    fn test_frame_config_mapping() {
        assert_eq!(frame_config("day").unwrap().view, "sungrow_hourly");
        assert_eq!(frame_config("month").unwrap().view, "sungrow_daily");
        assert_eq!(frame_config("year").unwrap().view, "sungrow_monthly");
        let all = frame_config("all").unwrap();
        assert_eq!(all.view, "sungrow_monthly");
        assert_eq!(all.window_trunc, None);
        assert!(frame_config("week").is_none());
        assert!(frame_config("").is_none());
    }

    #[test]
    fn test_view_series_sql_day() {
        let sql = view_series_sql(&frame_config("day").unwrap());
        assert!(sql.contains("FROM sungrow_hourly"));
        assert!(sql.contains("bucket >= date_trunc('day', now())"));
        assert!(sql.ends_with("ORDER BY bucket ASC"));
    }

    #[test]
    fn test_view_series_sql_all_has_no_window() {
        let sql = view_series_sql(&frame_config("all").unwrap());
        assert!(sql.contains("FROM sungrow_monthly"));
        assert!(!sql.contains("date_trunc"));
        assert!(sql.ends_with("ORDER BY bucket ASC"));
    }

    #[test]
    fn test_fallback_series_sql_equivalent_buckets() {
        let sql = fallback_series_sql(&frame_config("day").unwrap());
        assert!(sql.contains("date_trunc('hour', ts) AS bucket"));
        assert!(sql.contains("ts >= date_trunc('day', now())"));
        assert!(sql.contains("FROM sungrow_samples"));
        assert!(sql.contains("GROUP BY bucket"));
        assert!(sql.ends_with("ORDER BY bucket ASC"));
        assert!(sql.contains("SUM(sample_count)"));
        assert!(sql.contains("MAX(pv_power_w)"));
    }

    // ========================================================================
    // Insert SQL Tests
    // ========================================================================

    #[test]
    fn test_build_insert_sql_single_row() {
        let sql = build_insert_sql(1);
        assert!(sql.contains("VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"));
        assert!(sql.ends_with("ON CONFLICT (device_id, ts) DO NOTHING"));
    }

    #[test]
    fn test_build_insert_sql_multi_row_placeholders() {
        let sql = build_insert_sql(3);
        assert!(sql.contains("($11, $12, $13, $14, $15, $16, $17, $18, $19, $20)"));
        assert!(sql.contains("($21, $22, $23, $24, $25, $26, $27, $28, $29, $30)"));
        // No placeholder beyond the last row
        assert!(!sql.contains("$31"));
    }

    #[test]
    fn test_create_view_sql_shape() {
        let sql = create_view_sql("sungrow_hourly", "1 hour");
        assert!(sql.contains("CREATE MATERIALIZED VIEW IF NOT EXISTS sungrow_hourly"));
        assert!(sql.contains("timescaledb.continuous"));
        assert!(sql.contains("time_bucket('1 hour', ts) AS bucket"));
        assert!(sql.contains("WITH NO DATA"));
    }
}
