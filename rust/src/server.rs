use anyhow::{anyhow, Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::backend::ImageBackend;
use crate::config_store::ConfigStore;
use crate::dimensions::AspectRatio;
use crate::error::ImageLookupError;
use crate::gallery::{image_content_type, Gallery, GallerySnapshot};
use crate::main_ui_html::{build_main_ui_html, UiOptions};
use crate::orchestrator::{dispatch_batch, Batch, DispatchPlan};

pub struct AppState {
    pub config: Mutex<ConfigStore>,
    pub gallery: Mutex<Gallery>,
    pub backend: Arc<dyn ImageBackend>,
    pub server_port: AtomicU16,
}

type ApiResponse = (StatusCode, Json<Value>);

impl AppState {
    pub fn new(config: ConfigStore, backend: Arc<dyn ImageBackend>) -> Self {
        Self {
            config: Mutex::new(config),
            gallery: Mutex::new(Gallery::new()),
            backend,
            server_port: AtomicU16::new(0),
        }
    }

    /// Batch callbacks must always reach the gallery, so a poisoned lock is recovered.
    fn gallery_for_callback(&self) -> MutexGuard<'_, Gallery> {
        self.gallery.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct AppServer {
    port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl AppServer {
    pub fn start(state: Arc<AppState>, preferred_port: u16) -> Result<Self> {
        let listener = bind_listener(preferred_port)?;
        let port = listener
            .local_addr()
            .context("failed to inspect server local address")?
            .port();
        listener
            .set_nonblocking(true)
            .context("failed to set listener non-blocking")?;

        state.server_port.store(port, Ordering::Relaxed);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let thread_handle = thread::Builder::new()
            .name("image-batch-server".to_string())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build();
                let runtime = match runtime {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        warn!(error = %err, "failed to build server runtime");
                        return;
                    }
                };

                runtime.block_on(async move {
                    let listener = match tokio::net::TcpListener::from_std(listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            warn!(error = %err, "failed to adopt server listener");
                            return;
                        }
                    };

                    let app = build_router(state);
                    let server = axum::serve(listener, app).with_graceful_shutdown(async {
                        let _ = shutdown_rx.await;
                    });
                    if let Err(err) = server.await {
                        warn!(error = %err, "server stopped with error");
                    }
                });
            })
            .context("failed to spawn server thread")?;

        info!(port, "server listening on 127.0.0.1");
        Ok(Self {
            port,
            shutdown_tx: Some(shutdown_tx),
            thread_handle: Some(thread_handle),
        })
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.port)
    }
}

impl Drop for AppServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Deserialize)]
struct GenerateReq {
    prompt: String,
    count: usize,
    aspect_ratio: String,
}

#[derive(Debug, Deserialize)]
struct ImageReq {
    batch_id: u64,
    index: usize,
    #[serde(default)]
    download: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let port = state.server_port.load(Ordering::Relaxed);
    let mut origins = vec![HeaderValue::from_static("null")];
    for host in ["127.0.0.1", "localhost"] {
        if let Ok(origin) = HeaderValue::from_str(&format!("http://{host}:{port}")) {
            origins.push(origin);
        }
    }

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/", get(get_main_page))
        .route("/ping", get(get_ping))
        .route("/image", get(get_image))
        .route("/app/init", get(get_app_init))
        .route("/app/gallery", get(get_app_gallery))
        .route("/app/generate", post(post_app_generate))
        .layer(cors)
        .with_state(state)
}

async fn get_main_page(State(state): State<Arc<AppState>>) -> Response {
    let options = {
        let config = match state.config.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return err_json(StatusCode::INTERNAL_SERVER_ERROR, "config lock error")
                    .into_response()
            }
        };
        UiOptions::from_config(&config)
    };

    Html(build_main_ui_html(&options)).into_response()
}

async fn get_ping() -> ApiResponse {
    ok_json(json!({}))
}

async fn get_app_init(State(state): State<Arc<AppState>>) -> ApiResponse {
    let options = {
        let config = match state.config.lock() {
            Ok(guard) => guard,
            Err(_) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, "config lock error"),
        };
        UiOptions::from_config(&config)
    };

    let snapshot = {
        let gallery = match state.gallery.lock() {
            Ok(guard) => guard,
            Err(_) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, "gallery lock error"),
        };
        gallery.snapshot()
    };

    ok_json(json!({ "options": options, "gallery": snapshot }))
}

async fn get_app_gallery(State(state): State<Arc<AppState>>) -> ApiResponse {
    let snapshot = {
        let gallery = match state.gallery.lock() {
            Ok(guard) => guard,
            Err(_) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, "gallery lock error"),
        };
        gallery.snapshot()
    };

    ok_gallery(snapshot)
}

async fn post_app_generate(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenerateReq>, JsonRejection>,
) -> ApiResponse {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            return err_json(
                StatusCode::BAD_REQUEST,
                &format!("invalid request body: {}", rejection.body_text()),
            )
        }
    };
    let prompt = payload.prompt.trim().to_string();
    if prompt.is_empty() {
        return err_json(StatusCode::BAD_REQUEST, "prompt is required");
    }

    let (max_images, plan) = {
        let config = match state.config.lock() {
            Ok(guard) => guard,
            Err(_) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, "config lock error"),
        };
        (config.max_images(), config.dispatch_plan())
    };

    if payload.count == 0 || payload.count > max_images {
        return err_json(
            StatusCode::BAD_REQUEST,
            &format!("count must be between 1 and {max_images}"),
        );
    }

    let aspect_ratio = match payload.aspect_ratio.parse::<AspectRatio>() {
        Ok(ratio) => ratio,
        Err(err) => return err_json(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let ratio_text = aspect_ratio.to_string();

    let batch = match Batch::new(payload.count, &prompt, aspect_ratio) {
        Ok(batch) => batch,
        Err(err) => return err_json(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    let (batch_id, snapshot) = {
        let mut gallery = match state.gallery.lock() {
            Ok(guard) => guard,
            Err(_) => return err_json(StatusCode::INTERNAL_SERVER_ERROR, "gallery lock error"),
        };
        if gallery.is_busy() {
            return err_json(StatusCode::CONFLICT, "a batch is already generating");
        }
        let batch_id = match gallery.begin_batch(batch.len(), &prompt, &ratio_text) {
            Ok(batch_id) => batch_id,
            Err(err) => return err_json(StatusCode::CONFLICT, &err.to_string()),
        };
        (batch_id, gallery.snapshot())
    };

    info!(batch_id, count = batch.len(), aspect_ratio = %ratio_text, "batch submitted");
    tokio::spawn(run_batch(state.clone(), batch_id, batch, plan));

    ok_gallery(snapshot)
}

async fn run_batch(state: Arc<AppState>, batch_id: u64, batch: Batch, plan: DispatchPlan) {
    let backend = state.backend.clone();
    let outcome_state = state.clone();

    dispatch_batch(
        backend.as_ref(),
        batch,
        &plan,
        move |index, outcome| {
            outcome_state
                .gallery_for_callback()
                .apply_outcome(batch_id, index, outcome);
        },
        move || {
            state.gallery_for_callback().finish(batch_id);
        },
    )
    .await;
}

async fn get_image(
    State(state): State<Arc<AppState>>,
    Query(payload): Query<ImageReq>,
) -> Response {
    let image = {
        let gallery = match state.gallery.lock() {
            Ok(guard) => guard,
            Err(_) => {
                return err_json(StatusCode::INTERNAL_SERVER_ERROR, "gallery lock error")
                    .into_response()
            }
        };
        gallery.image(payload.batch_id, payload.index)
    };

    let (bytes, file_name) = match image {
        Ok(found) => found,
        Err(err) => {
            let status = match err {
                ImageLookupError::InvalidData { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                ImageLookupError::StaleBatch(_)
                | ImageLookupError::MissingSlot(_)
                | ImageLookupError::NotReady(_) => StatusCode::NOT_FOUND,
            };
            return err_json(status, &err.to_string()).into_response();
        }
    };

    let content_type = image_content_type(&bytes);
    let wants_download = payload
        .download
        .as_deref()
        .is_some_and(|v| !matches!(v.trim(), "" | "0" | "false"));
    if wants_download {
        let disposition = format!("attachment; filename=\"{file_name}\"");
        return (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, content_type.to_string()),
                (header::CONTENT_DISPOSITION, disposition),
            ],
            bytes,
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type.to_string())],
        bytes,
    )
        .into_response()
}

fn ok_json(payload: Value) -> ApiResponse {
    let mut body = serde_json::Map::new();
    body.insert("ok".to_string(), Value::Bool(true));

    if let Some(obj) = payload.as_object() {
        for (key, value) in obj {
            body.insert(key.clone(), value.clone());
        }
    } else if !payload.is_null() {
        body.insert("data".to_string(), payload);
    }

    (StatusCode::OK, Json(Value::Object(body)))
}

fn ok_gallery(snapshot: GallerySnapshot) -> ApiResponse {
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "gallery": snapshot,
        })),
    )
}

fn err_json(status: StatusCode, message: &str) -> ApiResponse {
    (
        status,
        Json(json!({
            "ok": false,
            "error": message,
        })),
    )
}

fn bind_listener(preferred_port: u16) -> Result<TcpListener> {
    for offset in 0..200u16 {
        let port = preferred_port.saturating_add(offset);
        if port == 0 {
            continue;
        }

        if let Ok(listener) = TcpListener::bind(("127.0.0.1", port)) {
            return Ok(listener);
        }
    }

    Err(anyhow!("failed to bind server port"))
}
