//! Thin persistence adapters. Every insert is fire-and-forget from the
//! caller's point of view: a failed row is logged and dropped, never
//! retried, and never stalls the pipeline.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::fusion::SonarRow;
use crate::gps::GpsSnapshot;

fn ts(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// One row per accepted fix.
pub async fn insert_gps_point(pool: &PgPool, snap: &GpsSnapshot) -> Result<()> {
    sqlx::query(
        "INSERT INTO gps_points (timestamp, lat, lon, speed, track, accuracy, fix_mode) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(ts(snap.received_ms))
    .bind(snap.lat)
    .bind(snap.lon)
    .bind(snap.speed)
    .bind(snap.track)
    .bind(snap.accuracy)
    .bind(snap.mode as i32)
    .execute(pool)
    .await?;
    Ok(())
}

/// One row per raw GPS message (jsonb archive).
pub async fn insert_gps_raw(pool: &PgPool, message: &serde_json::Value) -> Result<()> {
    sqlx::query("INSERT INTO gps_raw (timestamp, message) VALUES ($1, $2)")
        .bind(Utc::now())
        .bind(sqlx::types::Json(message))
        .execute(pool)
        .await?;
    Ok(())
}

/// One throttled row per write interval.
pub async fn insert_sonar_reading(pool: &PgPool, row: &SonarRow) -> Result<()> {
    sqlx::query(
        "INSERT INTO sonar_readings \
         (timestamp, latitude, longitude, max_value, max_sample_index, max_distance_cm) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(ts(row.timestamp_ms))
    .bind(row.latitude)
    .bind(row.longitude)
    .bind(row.max_value)
    .bind(row.max_sample_index)
    .bind(row.max_distance_cm)
    .execute(pool)
    .await?;
    Ok(())
}
