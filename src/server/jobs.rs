//! Job facade: upload, provision, status and the sample CSV.
//!
//! There is no job engine behind these endpoints yet. Uploads are drained and counted,
//! provisioning always reports `started`, and status lookups return a fixed completed
//! report for any id. The response shapes are what the client renders.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::relay::ServerEvent;
use super::{json_body, AppState};
use crate::error::{AppError, AppResult};
use crate::identity::Claims;

pub const MAX_UPLOAD_BYTES: usize = 5 * 1024 * 1024;

pub const SAMPLE_CSV: &str = "AP_NAME,AP_IP,AP_LOCATION,AP_TYPE\n\
AP001,192.168.1.10,Floor1-Office1,Indoor\n\
AP002,192.168.1.11,Floor1-Office2,Indoor\n\
AP003,192.168.1.12,Floor1-Lobby,Indoor\n\
AP004,192.168.1.13,Floor2-Office1,Indoor\n\
AP005,192.168.1.14,Floor2-Office2,Indoor\n";

pub const SAMPLE_FILENAME: &str = "sample-provisioning.csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub id: u32,
    pub record: String,
    pub status: String,
    pub message: String,
}

/// Status report for a provisioning job. `success` is the count of provisioned records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub job_id: String,
    pub status: String,
    pub total: u32,
    pub success: u32,
    pub failed: u32,
    pub results: Vec<RecordOutcome>,
}

impl JobStatus {
    /// The canned report every lookup returns.
    pub fn completed(job_id: &str) -> Self {
        let ok = |id: u32, record: &str| RecordOutcome {
            id,
            record: record.to_string(),
            status: "success".to_string(),
            message: "Provisioned successfully".to_string(),
        };
        Self {
            job_id: job_id.to_string(),
            status: "completed".to_string(),
            total: 100,
            success: 95,
            failed: 5,
            results: vec![ok(1, "AP001"), ok(2, "AP002")],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionPayload {
    #[serde(default)]
    pub job_id: Option<String>,
}

/// Remembers which jobs already announced completion so repeated status polls do not
/// repeat the event. Holds at most `CAPACITY` ids, forgetting the oldest first.
#[derive(Clone, Default)]
pub struct CompletionLog {
    inner: Arc<parking_lot::Mutex<(HashSet<String>, VecDeque<String>)>>,
}

impl CompletionLog {
    pub const CAPACITY: usize = 4096;

    /// True only the first time `job_id` is recorded.
    pub fn first_completion(&self, job_id: &str) -> bool {
        let mut g = self.inner.lock();
        let (seen, order) = &mut *g;
        if !seen.insert(job_id.to_string()) {
            return false;
        }
        order.push_back(job_id.to_string());
        if order.len() > Self::CAPACITY {
            if let Some(oldest) = order.pop_front() {
                seen.remove(&oldest);
            }
        }
        true
    }
}

fn upload_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        warn!("upload rejected: {}", e);
        return AppError::too_large("upload_too_large", "File too large");
    }
    warn!("upload read failed: {}", e);
    AppError::user("upload_failed", "Upload failed")
}

pub fn new_job_id() -> String {
    format!("job_{}", chrono::Utc::now().timestamp_millis())
}

pub async fn upload(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<Value>> {
    let (mut files, mut bytes) = (0usize, 0usize);
    match multipart {
        Ok(mut mp) => {
            while let Some(field) = mp.next_field().await.map_err(upload_error)? {
                let is_file = field.file_name().is_some();
                let data = field.bytes().await.map_err(upload_error)?;
                if is_file { files += 1; }
                bytes += data.len();
            }
        }
        Err(e) => debug!("upload without multipart body: {}", e),
    }

    let job_id = new_job_id();
    info!(job_id = %job_id, user = %claims.email, files, bytes, "upload received");
    if state.settings.emit_job_events {
        state.relay.notify_all(ServerEvent::FileUpload { job_id: job_id.clone(), user: claims.email.clone() });
    }
    Ok(Json(json!({"success": true, "jobId": job_id, "message": "File uploaded successfully"})))
}

pub async fn provision(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    payload: Result<Json<ProvisionPayload>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let ProvisionPayload { job_id } = json_body(payload)?;
    info!(job_id = ?job_id, user = %claims.email, "provisioning requested");
    if state.settings.emit_job_events {
        if let Some(id) = &job_id {
            state.relay.notify_all(ServerEvent::ProvisioningStart { job_id: id.clone(), user: claims.email.clone() });
        }
    }
    Ok(Json(json!({"success": true, "jobId": job_id, "status": "started", "message": "Provisioning started"})))
}

pub async fn job_status(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(job_id): Path<String>,
) -> Json<JobStatus> {
    let report = JobStatus::completed(&job_id);
    if state.settings.emit_job_events && state.completed_jobs.first_completion(&report.job_id) {
        state.relay.notify_all(ServerEvent::ProvisioningComplete {
            job_id: report.job_id.clone(),
            total: report.total,
            success: report.success,
            failed: report.failed,
            user: claims.email.clone(),
        });
    }
    Json(report)
}

pub async fn download_sample() -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/csv".to_string()),
            (header::CONTENT_DISPOSITION, format!("attachment; filename={}", SAMPLE_FILENAME)),
        ],
        SAMPLE_CSV,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_report_shape() {
        let v = serde_json::to_value(JobStatus::completed("job_42")).unwrap();
        assert_eq!(v["jobId"], "job_42");
        assert_eq!(v["status"], "completed");
        assert_eq!(v["total"], 100);
        assert_eq!(v["success"], 95);
        assert_eq!(v["failed"], 5);
        assert_eq!(v["results"][0], json!({"id": 1, "record": "AP001", "status": "success", "message": "Provisioned successfully"}));
        assert_eq!(v["results"][1]["record"], "AP002");
        assert_eq!(v["results"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn sample_csv_has_header_and_five_rows() {
        let lines: Vec<_> = SAMPLE_CSV.lines().collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0], "AP_NAME,AP_IP,AP_LOCATION,AP_TYPE");
        assert_eq!(lines[3], "AP003,192.168.1.12,Floor1-Lobby,Indoor");
        assert!(lines[1..].iter().all(|l| l.split(',').count() == 4));
    }

    #[test]
    fn completion_is_recorded_once_and_bounded() {
        let log = CompletionLog::default();
        assert!(log.first_completion("job_1"));
        assert!(!log.first_completion("job_1"));
        assert!(log.first_completion("job_2"));

        for i in 0..CompletionLog::CAPACITY {
            log.first_completion(&format!("bulk_{}", i));
        }
        // job_1 was the oldest and has been forgotten; the newest is still remembered
        assert!(log.first_completion("job_1"));
        assert!(!log.first_completion(&format!("bulk_{}", CompletionLog::CAPACITY - 1)));
    }

    #[test]
    fn job_ids_are_prefixed_epoch_millis() {
        let id = new_job_id();
        let ms: i64 = id.strip_prefix("job_").unwrap().parse().unwrap();
        assert!(ms > 1_600_000_000_000);
    }
}
