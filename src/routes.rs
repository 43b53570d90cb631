//! HTTP surface: four routes over one shared, read-only model.
//!
//! `/predict` and `/debug/predict` take a multipart upload in the `file`
//! field; `/health` and `/classes` are static metadata. Error bodies follow
//! the shapes the frontend expects: 400 with an `error` message for bad
//! uploads, 500 with `error`/`details` for processing failures.

use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;

use crate::classes::{self, CLASS_NAMES};
use crate::model::{self, Classifier, ModelError, Prediction, NUM_CLASSES, TOP_K};
use crate::preprocess::{self, PreprocessError, INPUT_CHANNELS, INPUT_HEIGHT, INPUT_WIDTH};

pub struct AppState {
    pub model: Box<dyn Classifier>,
}

pub fn router(state: Arc<AppState>, body_limit_bytes: usize) -> Router {
    Router::new()
        .route("/predict", post(predict))
        .route("/debug/predict", post(debug_predict))
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .route("/health", get(health))
        .route("/classes", get(get_classes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Decode or inference failure while serving a prediction.
#[derive(Error, Debug)]
pub enum PredictError {
    #[error("{0}")]
    Preprocess(#[from] PreprocessError),
    #[error("{0}")]
    Inference(#[from] ModelError),
}

enum ApiError {
    MissingFile,
    EmptyFilename,
    Upload(String),
    Predict(PredictError),
    Debug(PredictError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::MissingFile => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "No image provided" })),
            )
                .into_response(),
            ApiError::EmptyFilename => (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "No file selected" })),
            )
                .into_response(),
            ApiError::Upload(detail) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "error": detail }))).into_response()
            }
            ApiError::Predict(err) => {
                error!("prediction failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "error": "Prediction failed",
                        "details": err.to_string(),
                    })),
                )
                    .into_response()
            }
            ApiError::Debug(err) => {
                error!("debug prediction failed: {err}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model: &'static str,
    classes: usize,
    input_shape: [u32; 3],
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        model: "loaded",
        classes: NUM_CLASSES,
        input_shape: [INPUT_HEIGHT, INPUT_WIDTH, INPUT_CHANNELS],
    })
}

#[derive(Serialize)]
struct ClassesResponse {
    classes: Vec<&'static str>,
    total: usize,
}

async fn get_classes() -> Json<ClassesResponse> {
    Json(ClassesResponse {
        classes: CLASS_NAMES.to_vec(),
        total: CLASS_NAMES.len(),
    })
}

#[derive(Serialize)]
struct PredictResponse {
    predictions: Vec<Prediction>,
    total_classes: usize,
    image_processed: bool,
}

async fn predict(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<PredictResponse>, ApiError> {
    let upload = read_upload(&mut multipart).await?;
    if upload.filename.as_deref().map_or(false, str::is_empty) {
        return Err(ApiError::EmptyFilename);
    }
    let predictions = run_prediction(&state, &upload.bytes).map_err(ApiError::Predict)?;

    if let Some(top) = predictions.first() {
        info!("top prediction: {} ({})", top.class, top.confidence);
    }

    Ok(Json(PredictResponse {
        predictions,
        total_classes: NUM_CLASSES,
        image_processed: true,
    }))
}

#[derive(Serialize)]
struct DebugResponse {
    input_shape: [u64; 4],
    input_range: [f32; 2],
    prediction_shape: [usize; 2],
    sum_probabilities: f32,
    max_probability: f32,
    min_probability: f32,
    top_prediction: &'static str,
    top_confidence: f32,
}

async fn debug_predict(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<DebugResponse>, ApiError> {
    let upload = read_upload(&mut multipart).await?;

    let tensor = preprocess::preprocess_image(&upload.bytes)
        .map_err(|err| ApiError::Debug(err.into()))?;
    let probabilities = state
        .model
        .infer(&tensor)
        .map_err(|err| ApiError::Debug(err.into()))?;
    let top = model::argmax(&probabilities);

    Ok(Json(DebugResponse {
        input_shape: tensor.shape(),
        input_range: [tensor.min(), tensor.max()],
        prediction_shape: [1, probabilities.len()],
        sum_probabilities: probabilities.iter().sum(),
        max_probability: probabilities.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        min_probability: probabilities.iter().copied().fold(f32::INFINITY, f32::min),
        top_prediction: classes::class_at(top),
        top_confidence: probabilities[top],
    }))
}

fn run_prediction(state: &AppState, image_data: &[u8]) -> Result<Vec<Prediction>, PredictError> {
    let tensor = preprocess::preprocess_image(image_data)?;
    let probabilities = state.model.infer(&tensor)?;
    Ok(model::top_k(&probabilities, TOP_K))
}

struct Upload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

/// Pulls the `file` field out of the multipart form. Filename policy is left
/// to the callers: only `/predict` rejects an empty selection.
async fn read_upload(multipart: &mut Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::Upload(err.to_string()))?
    {
        if field.name() == Some("file") {
            let filename = field.file_name().map(str::to_owned);
            let bytes = field
                .bytes()
                .await
                .map_err(|err| ApiError::Upload(err.to_string()))?;
            return Ok(Upload {
                filename,
                bytes: bytes.to_vec(),
            });
        }
    }
    Err(ApiError::MissingFile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preprocess::ImageTensor;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use image::{DynamicImage, ImageBuffer, ImageOutputFormat, Rgb};
    use serde_json::Value;
    use std::io::Cursor;
    use tower::ServiceExt;

    struct FixedClassifier(Vec<f32>);

    impl Classifier for FixedClassifier {
        fn infer(&self, _input: &ImageTensor) -> Result<Vec<f32>, ModelError> {
            Ok(self.0.clone())
        }
    }

    struct FailingClassifier;

    impl Classifier for FailingClassifier {
        fn infer(&self, _input: &ImageTensor) -> Result<Vec<f32>, ModelError> {
            Err(ModelError::UnexpectedOutput {
                got: 0,
                expected: NUM_CLASSES,
            })
        }
    }

    fn tomato_heavy_probs() -> Vec<f32> {
        let mut probs = vec![0.01; NUM_CLASSES];
        probs[33] = 0.40; // tomato
        probs[0] = 0.15; // apple
        probs[21] = 0.10; // orange
        probs
    }

    fn test_app(model: Box<dyn Classifier>) -> Router {
        let state = Arc::new(AppState { model });
        router(state, 5 * 1024 * 1024)
    }

    fn png_bytes() -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(ImageBuffer::from_fn(20, 20, |x, y| {
            Rgb([(x * 10) as u8, (y * 10) as u8, 60])
        }));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    const BOUNDARY: &str = "test-boundary";

    fn multipart_request(uri: &str, field: &str, filename: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                 name=\"{field}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_fixed_metadata() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["model"], "loaded");
        assert_eq!(body["classes"], 36);
        assert_eq!(body["input_shape"], serde_json::json!([224, 224, 3]));
    }

    #[tokio::test]
    async fn classes_lists_the_full_registry_in_order() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(Request::get("/classes").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["total"], 36);
        assert_eq!(body["classes"].as_array().unwrap().len(), 36);
        assert_eq!(body["classes"][0], "apple");
        assert_eq!(body["classes"][35], "watermelon");
    }

    #[tokio::test]
    async fn predict_returns_top5_sorted_descending() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(multipart_request("/predict", "file", "tomato.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["total_classes"], 36);
        assert_eq!(body["image_processed"], true);

        let predictions = body["predictions"].as_array().unwrap();
        assert_eq!(predictions.len(), 5);
        assert_eq!(predictions[0]["class"], "tomato");
        assert!((predictions[0]["probability"].as_f64().unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(predictions[0]["confidence"], "40.00%");
        assert_eq!(predictions[1]["class"], "apple");

        let probs: Vec<f64> = predictions
            .iter()
            .map(|p| p["probability"].as_f64().unwrap())
            .collect();
        assert!(probs.windows(2).all(|pair| pair[0] >= pair[1]));
        assert!(probs.iter().all(|p| (0.0..=1.0).contains(p)));
        assert!(probs.iter().sum::<f64>() <= 1.0);
    }

    #[tokio::test]
    async fn predict_without_file_field_is_400() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(multipart_request("/predict", "picture", "a.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "No image provided");
    }

    #[tokio::test]
    async fn predict_with_empty_filename_is_400() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(multipart_request("/predict", "file", "", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "No file selected");
    }

    #[tokio::test]
    async fn predict_with_corrupt_image_is_500_with_details() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(multipart_request("/predict", "file", "junk.png", b"not an image"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Prediction failed");
        assert!(body["details"]
            .as_str()
            .unwrap()
            .contains("failed to decode image"));
    }

    #[tokio::test]
    async fn predict_surfaces_inference_failures_as_500() {
        let app = test_app(Box::new(FailingClassifier));
        let response = app
            .oneshot(multipart_request("/predict", "file", "a.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = json_body(response).await;
        assert_eq!(body["error"], "Prediction failed");
    }

    #[tokio::test]
    async fn predict_is_deterministic_for_identical_bytes() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let image = png_bytes();

        let first = app
            .clone()
            .oneshot(multipart_request("/predict", "file", "a.png", &image))
            .await
            .unwrap();
        let second = app
            .oneshot(multipart_request("/predict", "file", "a.png", &image))
            .await
            .unwrap();

        let first_bytes = hyper::body::to_bytes(first.into_body()).await.unwrap();
        let second_bytes = hyper::body::to_bytes(second.into_body()).await.unwrap();
        assert_eq!(first_bytes, second_bytes);
    }

    #[tokio::test]
    async fn debug_predict_reports_tensor_statistics() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(multipart_request("/debug/predict", "file", "a.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["input_shape"], serde_json::json!([1, 224, 224, 3]));
        assert_eq!(body["prediction_shape"], serde_json::json!([1, 36]));
        assert_eq!(body["top_prediction"], "tomato");

        let min = body["input_range"][0].as_f64().unwrap();
        let max = body["input_range"][1].as_f64().unwrap();
        assert!(min >= -1.0 && max <= 1.0 && min <= max);

        let sum = body["sum_probabilities"].as_f64().unwrap();
        assert!((sum - 0.98).abs() < 1e-3);
        assert_eq!(body["max_probability"].as_f64().unwrap() as f32, 0.40);
    }

    #[tokio::test]
    async fn debug_predict_ignores_empty_filename() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(multipart_request("/debug/predict", "file", "", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["top_prediction"], "tomato");
    }

    #[tokio::test]
    async fn debug_predict_without_file_is_400() {
        let app = test_app(Box::new(FixedClassifier(tomato_heavy_probs())));
        let response = app
            .oneshot(multipart_request("/debug/predict", "other", "a.png", &png_bytes()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["error"], "No image provided");
    }
}
