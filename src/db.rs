use anyhow::Context;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::RunRecord;
use crate::pipeline::PipelineOutput;
use crate::report;

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Stores one run's summary and ranked report entries in a single
/// transaction.
pub async fn publish_run(
    pool: &PgPool,
    input: &str,
    output: &PipelineOutput,
) -> anyhow::Result<Uuid> {
    let run_id = Uuid::new_v4();
    let summary = &output.summary;
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO outbreak_detector.runs
        (id, input, source_last_updated, period_first, period_last, parsed, skipped_malformed,
         skipped_duplicate, skipped_no_reactions, skipped_undated, skipped_out_of_range,
         skipped_below_severity, labels_included, labels_dropped, dedup_probabilistic)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(run_id)
    .bind(input)
    .bind(report::source_last_updated(output))
    .bind(output.range.map(|(first, _)| first.start()))
    .bind(output.range.map(|(_, last)| last.start()))
    .bind(summary.parsed as i64)
    .bind(summary.skipped_malformed as i64)
    .bind(summary.skipped_duplicate as i64)
    .bind(summary.skipped_no_reactions as i64)
    .bind(summary.skipped_undated as i64)
    .bind(summary.skipped_out_of_range as i64)
    .bind(summary.skipped_below_severity as i64)
    .bind(summary.labels_included as i64)
    .bind(summary.labels_dropped_below_threshold as i64)
    .bind(summary.dedup_probabilistic)
    .execute(&mut *tx)
    .await
    .context("failed to insert run")?;

    for (rank, entry) in output.report.entries.iter().enumerate() {
        let detectors = entry
            .contributing_detectors
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        sqlx::query(
            r#"
            INSERT INTO outbreak_detector.anomalies
            (id, run_id, rank, label, period_start, period_end, max_score, detectors,
             observed_count, expected_count, low_confidence)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(run_id)
        .bind(rank as i32 + 1)
        .bind(&entry.label)
        .bind(entry.period_start)
        .bind(entry.period_end)
        .bind(entry.max_score)
        .bind(detectors)
        .bind(entry.count)
        .bind(entry.expected_count)
        .bind(entry.low_confidence)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(run_id)
}

pub async fn fetch_recent_runs(pool: &PgPool, limit: i64) -> anyhow::Result<Vec<RunRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT r.id, r.input, r.created_at, r.parsed, r.labels_included,
               (SELECT COUNT(*) FROM outbreak_detector.anomalies a WHERE a.run_id = r.id)
                   AS anomaly_count,
               (SELECT a.label FROM outbreak_detector.anomalies a
                 WHERE a.run_id = r.id AND a.rank = 1) AS top_label
        FROM outbreak_detector.runs r
        ORDER BY r.created_at DESC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut runs = Vec::new();
    for row in rows {
        runs.push(RunRecord {
            id: row.get("id"),
            input: row.get("input"),
            created_at: row.get("created_at"),
            parsed: row.get("parsed"),
            labels_included: row.get("labels_included"),
            anomaly_count: row.get("anomaly_count"),
            top_label: row.get("top_label"),
        });
    }

    Ok(runs)
}
