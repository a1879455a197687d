//! Database schema management for `envwatch`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the append-only `readings` and `alert_transitions` tables, the
/// keyed `buckets`, `series_stats` and `alerts` tables, and the versioned
/// `threshold_configs` table. Safe to call on every startup; no-op if
/// objects already exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    // Accepted readings; identity is (device, metric, observed_at)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS readings (
            id           BIGSERIAL PRIMARY KEY,
            device_id    TEXT             NOT NULL,
            metric       TEXT             NOT NULL,
            value        DOUBLE PRECISION NOT NULL,
            observed_at  TIMESTAMPTZ      NOT NULL,
            received_at  TIMESTAMPTZ      NOT NULL,
            UNIQUE (device_id, metric, observed_at)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Fleet-wide bucket aggregates per metric and granularity
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS buckets (
            metric          TEXT             NOT NULL,
            granularity     TEXT             NOT NULL,
            bucket_start    TIMESTAMPTZ      NOT NULL,
            count           BIGINT           NOT NULL,
            sum             DOUBLE PRECISION NOT NULL,
            mean            DOUBLE PRECISION NOT NULL,
            min             DOUBLE PRECISION NOT NULL,
            max             DOUBLE PRECISION NOT NULL,
            finalized       BOOLEAN          NOT NULL DEFAULT FALSE,
            late_revisions  INTEGER          NOT NULL DEFAULT 0,
            PRIMARY KEY (metric, granularity, bucket_start)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Rolling statistics; fleet series use an empty device_id
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS series_stats (
            device_id   TEXT        NOT NULL,
            metric      TEXT        NOT NULL,
            stats       JSONB       NOT NULL,
            revision    BIGINT      NOT NULL DEFAULT 0,
            updated_at  TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (device_id, metric)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id                UUID PRIMARY KEY,
            device_id         TEXT        NOT NULL,
            metric            TEXT        NOT NULL,
            origins           TEXT[]      NOT NULL,
            severity          TEXT        NOT NULL,
            state             TEXT        NOT NULL,
            triggered_at      TIMESTAMPTZ NOT NULL,
            last_seen_at      TIMESTAMPTZ NOT NULL,
            state_changed_at  TIMESTAMPTZ NOT NULL,
            acknowledged_at   TIMESTAMPTZ,
            closed_at         TIMESTAMPTZ,
            last_notified_at  TIMESTAMPTZ,
            archived_at       TIMESTAMPTZ,
            trigger_count     INTEGER     NOT NULL,
            message           TEXT        NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Audit trail, append-only
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alert_transitions (
            id             BIGSERIAL PRIMARY KEY,
            alert_id       UUID        NOT NULL REFERENCES alerts (id),
            from_state     TEXT,
            to_state       TEXT        NOT NULL,
            severity       TEXT        NOT NULL,
            trigger_count  INTEGER     NOT NULL,
            at             TIMESTAMPTZ NOT NULL,
            note           TEXT        NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Every version is kept
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS threshold_configs (
            metric      TEXT        NOT NULL,
            version     BIGINT      NOT NULL,
            bands       JSONB       NOT NULL,
            updated_at  TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (metric, version)
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Indexes for common queries
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_observed_at
            ON readings (observed_at);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_readings_series_latest
            ON readings (device_id, metric, observed_at DESC);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alerts_live
            ON alerts (device_id, metric)
            WHERE archived_at IS NULL;
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_alert_transitions_alert_id
            ON alert_transitions (alert_id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
