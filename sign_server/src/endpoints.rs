//! HTTP endpoints of both servers.
use std::{
    convert::Infallible,
    sync::{atomic::AtomicBool, Arc},
};

use axum::{
    body::StreamBody,
    extract::Path,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use common::{
    letters::NUM_CLASSES,
    protocol::{
        CameraList, ControlResponse, DetectRequest, DetectionResult, ErrorDetail, HealthReport,
        StatusReport,
    },
};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    control::{CameraControl, MAX_PROBED_CAMERAS},
    detector::ModelSlot,
    single_shot::{DetectError, SingleShotDetectionService},
    stream::{spawn_stream, StreamGenerator, StreamResources, CONTENT_TYPE},
};

/// State of the single-shot detection server.
pub struct DetectContext {
    pub service: SingleShotDetectionService,
    pub model: Arc<ModelSlot>,
    pub model_path: String,
}

impl DetectContext {
    pub fn new(model: Arc<ModelSlot>, model_path: impl Into<String>) -> Self {
        Self {
            service: SingleShotDetectionService::new(model.clone()),
            model,
            model_path: model_path.into(),
        }
    }
}

/// State of the stream server.
pub struct StreamContext {
    pub resources: StreamResources,
    pub control: CameraControl,
    pub max_read_failures: u32,
    /// Set on process shutdown to end all streams.
    pub shutdown: Arc<AtomicBool>,
}

impl StreamContext {
    pub fn new(resources: StreamResources, max_read_failures: u32) -> Self {
        let control = CameraControl::new(resources.session.clone(), resources.stats.clone());
        Self {
            resources,
            control,
            max_read_failures,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl IntoResponse for DetectError {
    fn into_response(self) -> Response {
        let status = match self {
            DetectError::InvalidEncoding(_) | DetectError::InvalidImage(_) => {
                StatusCode::BAD_REQUEST
            }
            DetectError::ModelUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            DetectError::InferenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let detail = ErrorDetail {
            detail: self.to_string(),
        };

        (status, Json(detail)).into_response()
    }
}

pub fn detect_router(ctx: Arc<DetectContext>) -> Router {
    Router::new()
        .route("/", get(detect_root))
        .route("/health", get(health))
        .route("/detect", post(detect))
        .layer(Extension(ctx))
}

pub fn stream_router(ctx: Arc<StreamContext>) -> Router {
    Router::new()
        .route("/", get(stream_root))
        .route("/video_feed", get(video_feed))
        .route("/status", get(status))
        .route("/cameras", get(cameras))
        .route("/start_camera", post(start_camera))
        .route("/stop_camera", post(stop_camera))
        .route("/switch_camera/:camera_id", post(switch_camera))
        .layer(Extension(ctx))
}

pub async fn detect_root(Extension(ctx): Extension<Arc<DetectContext>>) -> Json<Value> {
    Json(json!({
        "message": "Sign Detection API",
        "status": "running",
        "model_loaded": ctx.model.is_loaded(),
        "endpoints": ["/health", "/detect"],
    }))
}

pub async fn health(Extension(ctx): Extension<Arc<DetectContext>>) -> Json<HealthReport> {
    let model_loaded = ctx.model.is_loaded();

    Json(HealthReport {
        status: match model_loaded {
            true => "healthy",
            false => "unhealthy",
        }
        .into(),
        model_loaded,
        model_path: ctx.model_path.clone(),
        classes: if model_loaded { NUM_CLASSES } else { 0 },
    })
}

pub async fn detect(
    Extension(ctx): Extension<Arc<DetectContext>>,
    Json(request): Json<DetectRequest>,
) -> Result<Json<DetectionResult>, DetectError> {
    // Decoding and inference are CPU bound
    let result = tokio::task::spawn_blocking(move || ctx.service.detect(&request.image))
        .await
        .map_err(|err| DetectError::InferenceFailure(err.to_string()))??;

    Ok(Json(result))
}

pub async fn stream_root() -> Json<Value> {
    Json(json!({
        "name": "Sign Detection Streaming API",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "/video_feed": "MJPEG video stream with detection overlay",
            "/status": "Detection statistics and camera status",
            "/cameras": "Available cameras",
        },
    }))
}

pub async fn video_feed(Extension(ctx): Extension<Arc<StreamContext>>) -> Response {
    log::info!("Video stream requested");

    let generator = StreamGenerator::new(ctx.resources.clone(), ctx.max_read_failures);
    let rx = match spawn_stream(generator, ctx.shutdown.clone()) {
        Ok((rx, _thread)) => rx,
        Err(err) => {
            log::error!("Failed to start stream thread: {}", err);
            let detail = ErrorDetail {
                detail: "Failed to start stream".into(),
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(detail)).into_response();
        }
    };

    // Set body and headers for multipart streaming
    let body = StreamBody::new(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    let headers = [(header::CONTENT_TYPE, CONTENT_TYPE)];

    (headers, body).into_response()
}

pub async fn status(Extension(ctx): Extension<Arc<StreamContext>>) -> Json<StatusReport> {
    Json(ctx.resources.stats.snapshot())
}

pub async fn cameras(
    Extension(ctx): Extension<Arc<StreamContext>>,
) -> Result<Json<CameraList>, StatusCode> {
    let control = ctx.control.clone();
    tokio::task::spawn_blocking(move || control.list(MAX_PROBED_CAMERAS))
        .await
        .map(Json)
        .map_err(|err| {
            log::error!("Camera probing failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

pub async fn start_camera(Extension(ctx): Extension<Arc<StreamContext>>) -> Json<ControlResponse> {
    let control = ctx.control.clone();
    run_control(move || control.start()).await
}

pub async fn stop_camera(Extension(ctx): Extension<Arc<StreamContext>>) -> Json<ControlResponse> {
    let control = ctx.control.clone();
    run_control(move || control.stop()).await
}

pub async fn switch_camera(
    Extension(ctx): Extension<Arc<StreamContext>>,
    Path(camera_id): Path<u32>,
) -> Json<ControlResponse> {
    let control = ctx.control.clone();
    run_control(move || control.switch(camera_id)).await
}

/// Run a camera control call on a blocking thread, waiting for in-flight reads.
async fn run_control<F>(call: F) -> Json<ControlResponse>
where
    F: FnOnce() -> ControlResponse + Send + 'static,
{
    match tokio::task::spawn_blocking(call).await {
        Ok(response) => Json(response),
        Err(err) => Json(ControlResponse::failed(err.to_string())),
    }
}

/// Resolves on Ctrl-C.
pub async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    log::info!("Shutting down");
}
