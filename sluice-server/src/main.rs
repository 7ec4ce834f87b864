use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use hf_hub::api::tokio::ApiBuilder;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use sluice_core::{load_pipeline, DeviceMap, GenerationRequest, Orchestrator, StagingPlan};
use std::{io::Cursor, path::PathBuf, sync::Arc};
use tokio::{self, net::TcpListener};

mod storage;

use storage::{BlobStore, FsBlobStore};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Sluice image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Model variant to use
    #[arg(long, default_value = "stabilityai/stable-diffusion-3-medium")]
    model: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Directory generated images are stored under
    #[arg(long, default_value = "generated")]
    storage_root: PathBuf,

    /// Public base URL returned in image links; defaults to the bind address
    #[arg(long)]
    public_base: Option<String>,
}

/// Wire shape of `/invocations` bodies; `prompt` stays optional here so a
/// missing prompt maps to a 400 instead of a deserialization failure.
#[derive(Deserialize, Debug, Default)]
struct InvocationRequest {
    prompt: Option<String>,
    negative_prompt: Option<String>,
    num_inference_steps: Option<usize>,
    guidance_scale: Option<f64>,
    num_images_per_prompt: Option<usize>,
    seed: Option<u64>,
}

#[derive(Serialize)]
struct InvocationResponse {
    image_urls: Vec<String>,
}

// Application state containing the preloaded pipeline and the blob store.
struct AppState {
    pipeline: Arc<Orchestrator>,
    store: Arc<dyn BlobStore>,
    images_root: PathBuf,
}

/// Parses a JSON or form body into a validated generation request. A missing
/// or empty prompt is rejected before any model work happens.
fn parse_invocation(content_type: Option<&str>, body: &[u8]) -> Result<GenerationRequest, String> {
    let request: InvocationRequest = if content_type
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
    {
        serde_urlencoded::from_bytes(body).map_err(|e| format!("invalid form body: {e}"))?
    } else {
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON body: {e}"))?
    };

    let prompt = request.prompt.unwrap_or_default();
    if prompt.trim().is_empty() {
        return Err("Prompt is required".to_string());
    }

    Ok(GenerationRequest {
        prompt,
        negative_prompt: request.negative_prompt.unwrap_or_default(),
        num_inference_steps: request.num_inference_steps.unwrap_or(28),
        guidance_scale: request.guidance_scale.unwrap_or(7.0),
        num_images_per_prompt: request.num_images_per_prompt.unwrap_or(1),
        seed: request.seed,
    })
}

fn image_to_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode image as PNG")?;
    Ok(bytes)
}

fn prompt_slug(prompt: &str) -> String {
    prompt
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .take(64)
        .collect()
}

/// Uploads every generated image and returns their URLs in generation order.
/// All-or-nothing: the first failed upload fails the whole request.
fn upload_images(
    store: &dyn BlobStore,
    prompt: &str,
    images: &[DynamicImage],
) -> Result<Vec<String>> {
    let slug = prompt_slug(prompt);
    let mut image_urls = Vec::with_capacity(images.len());
    for (idx, image) in images.iter().enumerate() {
        let bytes = image_to_png(image)?;
        let key = format!("generated_images/{slug}_{idx}.png");
        let url = store
            .put(&key, &bytes)
            .with_context(|| format!("failed to upload {key}"))?;
        image_urls.push(url);
    }
    Ok(image_urls)
}

async fn ping_handler() -> &'static str {
    "The server is running OK!"
}

async fn invocations_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());
    let request = match parse_invocation(content_type, &body) {
        Ok(request) => request,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };

    match generate_and_upload(state, request).await {
        Ok(image_urls) => Json(InvocationResponse { image_urls }).into_response(),
        Err(e) => {
            tracing::error!("error generating image: {e:?}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {e:?}")).into_response()
        }
    }
}

/// Runs the blocking generation pipeline off the async runtime, then uploads
/// the results.
async fn generate_and_upload(
    state: Arc<AppState>,
    request: GenerationRequest,
) -> Result<Vec<String>> {
    let pipeline = state.pipeline.clone();
    let prompt = request.prompt.clone();
    let images = tokio::task::spawn_blocking(move || pipeline.generate(&request))
        .await
        .context("generation task panicked")??;
    upload_images(state.store.as_ref(), &prompt, &images)
}

async fn serve_image_handler(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> impl IntoResponse {
    if key.split('/').any(|part| part == "..") {
        return (StatusCode::BAD_REQUEST, "invalid key").into_response();
    }
    match tokio::fs::read(state.images_root.join(&key)).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "image/png")], bytes).into_response(),
        Err(_) => (StatusCode::NOT_FOUND, "no such image").into_response(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // The SD3 repos are gated; a missing token is a startup error, not a
    // per-request one.
    let token = std::env::var("HF_TOKEN")
        .context("Hugging Face token not found in environment variables")?;
    let api = ApiBuilder::new().with_token(Some(token)).build()?;

    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };

    // Loading establishes the resting placement and runs the warmup cycle, so
    // the listener only opens once the pipeline can actually serve.
    let pipeline = load_pipeline(&args.model, api, device_map, StagingPlan::default()).await?;

    let public_base = args
        .public_base
        .unwrap_or_else(|| format!("http://{}:{}", args.host, args.port));
    let store = Arc::new(FsBlobStore::new(&args.storage_root, public_base)?);
    let app_state = Arc::new(AppState {
        pipeline,
        images_root: store.root().to_path_buf(),
        store,
    });

    // --- Build axum router with shared state ---
    let app = Router::new()
        .route("/ping", get(ping_handler))
        .route("/invocations", post(invocations_handler))
        .route("/images/{*key}", get(serve_image_handler))
        .with_state(app_state);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_prompt_is_rejected() {
        let err = parse_invocation(Some("application/json"), b"{}").unwrap_err();
        assert_eq!(err, "Prompt is required");
    }

    #[test]
    fn empty_prompt_is_rejected() {
        let err =
            parse_invocation(Some("application/json"), br#"{"prompt": "  "}"#).unwrap_err();
        assert_eq!(err, "Prompt is required");
    }

    #[test]
    fn json_body_fills_defaults() {
        let request =
            parse_invocation(Some("application/json"), br#"{"prompt": "a red bicycle"}"#)
                .unwrap();
        assert_eq!(request.prompt, "a red bicycle");
        assert_eq!(request.negative_prompt, "");
        assert_eq!(request.num_inference_steps, 28);
        assert_eq!(request.guidance_scale, 7.0);
        assert_eq!(request.num_images_per_prompt, 1);
    }

    #[test]
    fn form_body_is_accepted() {
        let request = parse_invocation(
            Some("application/x-www-form-urlencoded"),
            b"prompt=a+red+bicycle&num_inference_steps=10&num_images_per_prompt=2",
        )
        .unwrap();
        assert_eq!(request.prompt, "a red bicycle");
        assert_eq!(request.num_inference_steps, 10);
        assert_eq!(request.num_images_per_prompt, 2);
    }

    #[test]
    fn uploads_return_one_url_per_image_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path(), "http://localhost:8080").unwrap();
        let images = vec![DynamicImage::new_rgb8(2, 2), DynamicImage::new_rgb8(4, 4)];

        let urls = upload_images(&store, "a red bicycle", &images).unwrap();

        assert_eq!(
            urls,
            vec![
                "http://localhost:8080/images/generated_images/a_red_bicycle_0.png",
                "http://localhost:8080/images/generated_images/a_red_bicycle_1.png",
            ]
        );
        // Both keys resolve to distinct PNG payloads.
        let first = std::fs::read(dir.path().join("generated_images/a_red_bicycle_0.png")).unwrap();
        let second =
            std::fs::read(dir.path().join("generated_images/a_red_bicycle_1.png")).unwrap();
        assert_eq!(&first[1..4], b"PNG");
        assert_ne!(first, second);
    }

    #[test]
    fn slug_strips_path_separators() {
        assert_eq!(prompt_slug("../etc/passwd"), "___etc_passwd");
    }
}
