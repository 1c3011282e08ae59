//! Conversion endpoints
//!
//! - POST /convert       - any enabled format, routed by extension
//! - POST /convert_hwpx  - XML word-processor documents only
//!
//! Both take a multipart body with a single `file` (or `files`) field and
//! answer with the rendered PDF.

use axum::{
    body::{Body, Bytes},
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use uuid::Uuid;

use crate::convert::{BackendClass, ConversionJob, JobPhase, WorkArea};
use crate::error::{ConvertError, Result};
use crate::state::AppState;

/// Slack on top of the upload ceiling for multipart framing
const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Read size when streaming the artifact back
const STREAM_CHUNK: usize = 64 * 1024;

const HWPX_ONLY: &[BackendClass] = &[BackendClass::XmlFormat];

/// Create the conversion router
pub fn router(max_upload_bytes: u64) -> Router<AppState> {
    let body_limit = usize::try_from(max_upload_bytes.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    Router::new()
        .route("/convert", post(convert))
        .route("/convert_hwpx", post(convert_hwpx))
        .layer(DefaultBodyLimit::max(body_limit))
}

/// POST /convert
async fn convert(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    orchestrate(state, multipart, None).await
}

/// POST /convert_hwpx
async fn convert_hwpx(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Response {
    orchestrate(state, multipart, Some(HWPX_ONLY)).await
}

/// Drive one job to a terminal state and emit exactly one outcome
async fn orchestrate(
    state: AppState,
    multipart: std::result::Result<Multipart, MultipartRejection>,
    accept: Option<&'static [BackendClass]>,
) -> Response {
    let mut job = ConversionJob::new();

    match run(&state, &mut job, multipart, accept).await {
        Ok(response) => {
            job.advance(JobPhase::Succeeded);
            tracing::info!(
                job_id = %job.id,
                received_at = %job.received_at_rfc3339(),
                file_name = job.file_name.as_deref().unwrap_or(""),
                backend = job.backend.map(|b| b.name()).unwrap_or(""),
                input_bytes = job.input_size,
                elapsed_ms = job.elapsed_ms() as u64,
                "Conversion succeeded"
            );
            response
        }
        Err(err) => {
            let failed_in = job.phase();
            job.advance(JobPhase::Failed);
            if err.status_code().is_server_error() {
                tracing::error!(
                    job_id = %job.id,
                    received_at = %job.received_at_rfc3339(),
                    file_name = job.file_name.as_deref().unwrap_or(""),
                    backend = job.backend.map(|b| b.name()).unwrap_or(""),
                    phase = %failed_in,
                    kind = err.kind(),
                    elapsed_ms = job.elapsed_ms() as u64,
                    error = %err,
                    "Conversion failed"
                );
            } else {
                tracing::warn!(
                    job_id = %job.id,
                    received_at = %job.received_at_rfc3339(),
                    file_name = job.file_name.as_deref().unwrap_or(""),
                    phase = %failed_in,
                    kind = err.kind(),
                    error = %err,
                    "Conversion rejected"
                );
            }
            err.into_response()
        }
    }
}

async fn run(
    state: &AppState,
    job: &mut ConversionJob,
    multipart: std::result::Result<Multipart, MultipartRejection>,
    accept: Option<&'static [BackendClass]>,
) -> Result<Response> {
    // Receiving: nothing on disk yet
    let multipart = multipart.map_err(|e| {
        ConvertError::BadRequest(format!("Expected a multipart upload: {}", e.body_text()))
    })?;
    let upload = receive_upload(multipart, state.config().limits.max_upload_bytes).await?;
    job.file_name = Some(upload.file_name.clone());
    job.input_size = upload.data.len() as u64;

    // Validating: still nothing on disk
    job.advance(JobPhase::Validating);
    let descriptor = state.backends().route(&upload.file_name, accept)?;
    job.backend = Some(descriptor.class);

    // Converting
    job.advance(JobPhase::Converting);
    let permit = state
        .conversion_permits()
        .acquire()
        .await
        .map_err(|_| ConvertError::Internal("Conversion limiter closed".to_string()))?;

    let area = state.work_areas().acquire().await?;
    let deadline = Instant::now() + descriptor.timeout;
    job.deadline = Some(deadline);

    tracing::info!(
        job_id = %job.id,
        work_area = %area.id(),
        file_name = %upload.file_name,
        backend = %descriptor.class,
        input_bytes = job.input_size,
        timeout_secs = descriptor.timeout.as_secs_f64(),
        "Converting document"
    );

    let result = state
        .invoker()
        .convert(&area, &upload.file_name, &upload.data, descriptor, deadline)
        .await;
    drop(permit);

    let artifact = match result {
        Ok(artifact) => artifact,
        Err(e) => {
            area.release().await;
            return Err(e);
        }
    };

    // Streaming: the body stream owns the work area from here on
    job.advance(JobPhase::StreamingResult);
    job.artifact = Some(artifact.path.clone());

    let file = match File::open(&artifact.path).await {
        Ok(file) => file,
        Err(e) => {
            area.release().await;
            return Err(ConvertError::Internal(format!(
                "Failed to open artifact {}: {}",
                artifact.path.display(),
                e
            )));
        }
    };

    let body = Body::from_stream(artifact_stream(file, area, job.id));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/pdf")
        .header(header::CONTENT_LENGTH, artifact.size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&job.download_name()))
        .body(body)
        .map_err(|e| ConvertError::Internal(e.to_string()))
}

/// The single file received from the client
struct Upload {
    file_name: String,
    data: Vec<u8>,
}

/// Pull the first `file`/`files` field, enforcing the size ceiling while reading
async fn receive_upload(mut multipart: Multipart, max_bytes: u64) -> Result<Upload> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, max_bytes))?
    {
        let name = field.name().unwrap_or("");
        if name != "file" && name != "files" {
            continue;
        }

        let file_name = field.file_name().unwrap_or("").trim().to_string();
        if file_name.is_empty() {
            return Err(ConvertError::BadRequest("No file selected".to_string()));
        }

        let mut data = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| multipart_error(e, max_bytes))?
        {
            if (data.len() + chunk.len()) as u64 > max_bytes {
                return Err(ConvertError::PayloadTooLarge { max: max_bytes });
            }
            data.extend_from_slice(&chunk);
        }

        if data.is_empty() {
            return Err(ConvertError::BadRequest("Uploaded file is empty".to_string()));
        }

        tracing::debug!(file_name = %file_name, bytes = data.len(), "Upload received");
        return Ok(Upload { file_name, data });
    }

    Err(ConvertError::BadRequest("No file provided".to_string()))
}

fn multipart_error(e: MultipartError, max_bytes: u64) -> ConvertError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        ConvertError::PayloadTooLarge { max: max_bytes }
    } else {
        ConvertError::BadRequest(format!("Failed to read upload: {}", e.body_text()))
    }
}

/// Stream the artifact, releasing the work area once the last byte is read.
///
/// If the client goes away first, dropping the stream drops the guard, which
/// removes the directory.
fn artifact_stream(
    file: File,
    area: WorkArea,
    job_id: Uuid,
) -> impl Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    futures::stream::unfold(Some((file, area)), move |state| async move {
        let (mut file, area) = state?;
        let mut buf = vec![0u8; STREAM_CHUNK];

        match file.read(&mut buf).await {
            Ok(0) => {
                drop(file);
                area.release().await;
                tracing::debug!(job_id = %job_id, "Artifact streamed");
                None
            }
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some((file, area))))
            }
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to read artifact");
                drop(file);
                area.release().await;
                Some((Err(e), None))
            }
        }
    })
}

/// `attachment` disposition with an ASCII fallback and an RFC 5987 UTF-8 name
fn content_disposition(download_name: &str) -> String {
    let fallback: String = download_name
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(download_name)
    )
}
