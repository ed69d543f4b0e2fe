//! Statistics overview, retention cleanup, and JSONL archiving.

use std::path::{Path as FsPath, PathBuf};

use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{ApiError, ApiResult, AppState};
use crate::adapters::sqlite::stats;

const ARCHIVE_DIR: &str = "./archives";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats/overview", get(overview))
        .route("/stats/cleanup", post(cleanup))
        .route("/stats/archive", post(archive))
        .route("/stats/archive/:name", get(download_archive))
}

#[derive(Deserialize)]
struct OverviewQuery {
    #[serde(default = "default_days")]
    days: u32,
}

fn default_days() -> u32 {
    30
}

#[derive(Serialize)]
struct WeeklyCount {
    week_start: String,
    count: i64,
}

#[derive(Serialize)]
struct OverviewOut {
    totals: stats::OverviewTotals,
    trend: TrendOut,
    by_account: Vec<stats::AccountBreakdown>,
    db: DbInfoOut,
}

#[derive(Serialize)]
struct TrendOut {
    daily: Vec<stats::DailyCount>,
    weekly: Vec<WeeklyCount>,
}

#[derive(Serialize)]
struct DbInfoOut {
    path: Option<String>,
    size_bytes: Option<u64>,
}

fn monday_of(day: NaiveDate) -> NaiveDate {
    day - ChronoDuration::days(day.weekday().num_days_from_monday() as i64)
}

async fn overview(
    State(state): State<AppState>,
    Query(query): Query<OverviewQuery>,
) -> ApiResult<Json<OverviewOut>> {
    if !(7..=365).contains(&query.days) {
        return Err(ApiError::bad_request("days must be 7..=365"));
    }

    let today = Utc::now().date_naive();
    let start_day = today - ChronoDuration::days(query.days as i64 - 1);
    let start_ts = start_day
        .and_hms_opt(0, 0, 0)
        .expect("valid time")
        .and_utc()
        .timestamp();

    let totals = stats::overview_totals(state.pool())?;
    let sparse = stats::daily_counts(state.pool(), start_ts)?;
    let sparse_map: std::collections::HashMap<&str, i64> =
        sparse.iter().map(|d| (d.date.as_str(), d.count)).collect();

    // Dense daily series, zero-filled.
    let mut daily = Vec::with_capacity(query.days as usize);
    let mut cursor = start_day;
    while cursor <= today {
        let key = cursor.format("%Y-%m-%d").to_string();
        daily.push(stats::DailyCount {
            count: sparse_map.get(key.as_str()).copied().unwrap_or(0),
            date: key,
        });
        cursor = cursor + ChronoDuration::days(1);
    }

    // Weekly trend derived from the dense dailies.
    let mut weekly_map: std::collections::BTreeMap<String, i64> = Default::default();
    for entry in &daily {
        let day = NaiveDate::parse_from_str(&entry.date, "%Y-%m-%d").expect("derived above");
        let week = monday_of(day).format("%Y-%m-%d").to_string();
        *weekly_map.entry(week).or_insert(0) += entry.count;
    }
    let weekly = weekly_map
        .into_iter()
        .map(|(week_start, count)| WeeklyCount { week_start, count })
        .collect();

    let db_path = state.database_path.as_ref();
    let size_bytes = std::fs::metadata(db_path).ok().map(|m| m.len());

    Ok(Json(OverviewOut {
        totals,
        trend: TrendOut { daily, weekly },
        by_account: stats::by_account(state.pool())?,
        db: DbInfoOut {
            path: Some(db_path.display().to_string()),
            size_bytes,
        },
    }))
}

#[derive(Deserialize)]
struct CleanupIn {
    keep_days: Option<u32>,
    keep_per_account: Option<u32>,
    #[serde(default = "default_true")]
    use_settings_defaults: bool,
    #[serde(default = "default_true")]
    dry_run: bool,
    #[serde(default)]
    vacuum: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize)]
struct CleanupOut {
    dry_run: bool,
    keep_days: Option<u32>,
    keep_per_account: Option<u32>,
    cutoff: Option<String>,
    affected: i64,
    details: CleanupDetails,
    vacuumed: bool,
}

#[derive(Serialize)]
struct CleanupDetails {
    by_days: i64,
    by_overflow: i64,
}

async fn cleanup(
    State(state): State<AppState>,
    Json(body): Json<CleanupIn>,
) -> ApiResult<Json<CleanupOut>> {
    let settings = state.pipeline.settings.current().await;
    let keep_days = body.keep_days.or(if body.use_settings_defaults {
        settings.retention_keep_days
    } else {
        None
    });
    let keep_per_account = body.keep_per_account.or(if body.use_settings_defaults {
        settings.retention_keep_per_account
    } else {
        None
    });

    if keep_days.is_none() && keep_per_account.is_none() {
        return Err(ApiError::bad_request(
            "provide keep_days or keep_per_account, or set retention defaults in settings",
        ));
    }
    if keep_days == Some(0) || keep_per_account == Some(0) {
        return Err(ApiError::bad_request("retention values must be >= 1"));
    }

    let cutoff = keep_days.map(|days| Utc::now().timestamp() - i64::from(days) * 86_400);

    let by_days = match cutoff {
        Some(cutoff) => stats::count_older_than(state.pool(), cutoff)?,
        None => 0,
    };
    let by_overflow = match keep_per_account {
        Some(keep) => stats::count_overflow(state.pool(), i64::from(keep))?,
        None => 0,
    };

    let mut affected = by_days + by_overflow;
    let mut vacuumed = false;

    if !body.dry_run {
        let mut deleted = 0i64;
        if let Some(cutoff) = cutoff {
            deleted += stats::delete_older_than(state.pool(), cutoff)? as i64;
        }
        if let Some(keep) = keep_per_account {
            deleted += stats::delete_overflow(state.pool(), i64::from(keep))? as i64;
        }
        affected = deleted;
        if body.vacuum {
            match stats::vacuum(state.pool()) {
                Ok(()) => vacuumed = true,
                Err(e) => warn!(error = %e, "VACUUM failed"),
            }
        }
        info!(deleted, "Retention cleanup executed");
    }

    Ok(Json(CleanupOut {
        dry_run: body.dry_run,
        keep_days,
        keep_per_account,
        cutoff: cutoff
            .and_then(|c| chrono::DateTime::from_timestamp(c, 0))
            .map(|t| t.to_rfc3339()),
        affected,
        details: CleanupDetails {
            by_days,
            by_overflow,
        },
        vacuumed,
    }))
}

#[derive(Deserialize)]
struct ArchiveIn {
    older_than_days: u32,
    #[serde(default)]
    delete_after: bool,
    /// 0 = no limit.
    #[serde(default)]
    limit: u32,
}

#[derive(Serialize)]
struct ArchiveOut {
    count: usize,
    deleted: usize,
    file_name: Option<String>,
    download_url: Option<String>,
    cutoff: String,
}

/// Write messages older than the cutoff to a JSONL file under
/// `./archives`, optionally deleting them afterwards.
async fn archive(
    State(state): State<AppState>,
    Json(body): Json<ArchiveIn>,
) -> ApiResult<Json<ArchiveOut>> {
    if body.older_than_days == 0 {
        return Err(ApiError::bad_request("older_than_days must be >= 1"));
    }

    let cutoff = Utc::now().timestamp() - i64::from(body.older_than_days) * 86_400;
    let cutoff_rfc3339 = chrono::DateTime::from_timestamp(cutoff, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();

    let limit = Some(body.limit).filter(|l| *l > 0);
    let rows = stats::list_older_than(state.pool(), cutoff, limit)?;
    if rows.is_empty() {
        return Ok(Json(ArchiveOut {
            count: 0,
            deleted: 0,
            file_name: None,
            download_url: None,
            cutoff: cutoff_rfc3339,
        }));
    }

    std::fs::create_dir_all(ARCHIVE_DIR)
        .map_err(|e| ApiError::bad_request(format!("cannot create archive dir: {}", e)))?;
    let file_name = format!("emails_archive_{}.jsonl", Utc::now().format("%Y%m%d_%H%M%S"));
    let file_path = PathBuf::from(ARCHIVE_DIR).join(&file_name);

    let mut lines = String::new();
    for row in &rows {
        let mut value = serde_json::to_value(row)
            .map_err(|e| ApiError::bad_request(format!("serialize failed: {}", e)))?;
        value["received_at"] = serde_json::Value::String(
            chrono::DateTime::from_timestamp(row.received_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        );
        lines.push_str(&value.to_string());
        lines.push('\n');
    }
    std::fs::write(&file_path, lines)
        .map_err(|e| ApiError::bad_request(format!("cannot write archive: {}", e)))?;

    let mut deleted = 0;
    if body.delete_after {
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        deleted = stats::delete_by_ids(state.pool(), &ids)?;
    }

    info!(count = rows.len(), deleted, file = %file_name, "Archive written");
    Ok(Json(ArchiveOut {
        count: rows.len(),
        deleted,
        download_url: Some(format!("/api/stats/archive/{}", file_name)),
        file_name: Some(file_name),
        cutoff: cutoff_rfc3339,
    }))
}

async fn download_archive(Path(name): Path<String>) -> ApiResult<impl IntoResponse> {
    // Plain file names only; no traversal.
    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(ApiError::bad_request("invalid file name"));
    }
    let path = FsPath::new(ARCHIVE_DIR).join(&name);
    let contents = std::fs::read(&path).map_err(|_| ApiError::not_found("archive not found"))?;

    Ok((
        [
            (header::CONTENT_TYPE, "application/jsonl".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", name),
            ),
        ],
        contents,
    ))
}
