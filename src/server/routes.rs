//! HTTP routes. Prediction runs inline; uploads are stored and handed to a
//! background `ScanWorker`, then polled by scan id. Files arrive either as a
//! `multipart/form-data` post or as base64 in a JSON body.

use super::protocol::{
    self, Health, Message, ProcessingStatus, ScanResponse, ScanResults, UploadForm,
};
use super::WebError;
use crate::analyzer::{Analyzer, Diagnosis};
use crate::error::Error;
use crate::manager::ScanManager;
use crate::uploads::{FileKind, UploadStore};
use crate::worker::ScanWorker;
use actix_multipart::form::MultipartForm;
use actix_web::guard::GuardContext;
use actix_web::http::header;
use actix_web::{get, post, web, Responder};
use base64::{engine::general_purpose, Engine as _};
use std::sync::{PoisonError, RwLock};
use tracing::*;

type Result<T> = std::result::Result<T, WebError>;

fn is_multipart(ctx: &GuardContext) -> bool {
    ctx.head()
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v.starts_with("multipart/form-data"))
}

#[get("/")]
pub async fn index() -> impl Responder {
    web::Json(Message {
        message: "Welcome to NeuroNav API".into(),
    })
}

#[get("/health")]
pub async fn health() -> impl Responder {
    web::Json(Health { status: "healthy" })
}

/// Classify an image and, for tumor classes, attach a Grad-CAM overlay
#[post("/api/predict")]
pub async fn predict(
    req: web::Json<protocol::UploadRequest>,
    analyzer: web::Data<Analyzer>,
    uploads: web::Data<UploadStore>,
) -> Result<web::Json<Diagnosis>> {
    let req = req.into_inner();
    info!("prediction request: {req:?}");
    FileKind::from_file_name(&req.file_name)?;
    let bytes = general_purpose::STANDARD.decode(&req.image)?;
    diagnose(&req.file_name, bytes, analyzer, uploads).await
}

#[post("/api/predict", guard = "is_multipart")]
pub async fn predict_form(
    form: MultipartForm<UploadForm>,
    analyzer: web::Data<Analyzer>,
    uploads: web::Data<UploadStore>,
) -> Result<web::Json<Diagnosis>> {
    let (file_name, _, bytes) = form.into_inner().into_parts();
    info!("prediction request for {file_name} ({} bytes)", bytes.len());
    diagnose(&file_name, bytes, analyzer, uploads).await
}

async fn diagnose(
    file_name: &str,
    bytes: Vec<u8>,
    analyzer: web::Data<Analyzer>,
    uploads: web::Data<UploadStore>,
) -> Result<web::Json<Diagnosis>> {
    let kind = FileKind::from_file_name(file_name)?;
    uploads.check_size(bytes.len())?;

    if kind.is_volumetric() {
        return Err(Error::NotImplemented(format!(
            "prediction for {kind:?} volumes is not implemented"
        ))
        .into());
    }

    let diagnosis = web::block(move || analyzer.analyze(&bytes)).await??;

    info!("finished serving prediction request");
    Ok(web::Json(diagnosis))
}

/// Store a scan and start analyzing it in the background
#[post("/api/v1/upload")]
pub async fn upload(
    req: web::Json<protocol::UploadRequest>,
    analyzer: web::Data<Analyzer>,
    uploads: web::Data<UploadStore>,
    scans: web::Data<RwLock<ScanManager>>,
) -> Result<web::Json<ScanResponse>> {
    let req = req.into_inner();
    info!("upload request: {req:?}");

    FileKind::from_file_name(&req.file_name)?;
    let bytes = general_purpose::STANDARD.decode(&req.image)?;
    store_scan(req.file_name, req.content_type, bytes, analyzer, uploads, scans).await
}

#[post("/api/v1/upload", guard = "is_multipart")]
pub async fn upload_form(
    form: MultipartForm<UploadForm>,
    analyzer: web::Data<Analyzer>,
    uploads: web::Data<UploadStore>,
    scans: web::Data<RwLock<ScanManager>>,
) -> Result<web::Json<ScanResponse>> {
    let (file_name, content_type, bytes) = form.into_inner().into_parts();
    info!("upload request for {file_name} ({} bytes)", bytes.len());
    store_scan(file_name, content_type, bytes, analyzer, uploads, scans).await
}

async fn store_scan(
    file_name: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
    analyzer: web::Data<Analyzer>,
    uploads: web::Data<UploadStore>,
    scans: web::Data<RwLock<ScanManager>>,
) -> Result<web::Json<ScanResponse>> {
    FileKind::from_file_name(&file_name)?;
    let stored = web::block(move || uploads.save(&file_name, &bytes)).await??;

    let record = scans
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .register(&stored, content_type);

    ScanWorker::new(analyzer.into_inner(), scans.into_inner())
        .dispatch(record.id.clone(), stored);

    Ok(web::Json(ScanResponse::from(&record)))
}

#[get("/api/v1/process/{scan_id}")]
pub async fn processing_status(
    scan_id: web::Path<String>,
    scans: web::Data<RwLock<ScanManager>>,
) -> Result<web::Json<ProcessingStatus>> {
    let manager = scans.read().unwrap_or_else(PoisonError::into_inner);
    let scan = manager.get(&scan_id)?;
    Ok(web::Json(ProcessingStatus::from(scan)))
}

#[get("/api/v1/results/{scan_id}")]
pub async fn results(
    scan_id: web::Path<String>,
    scans: web::Data<RwLock<ScanManager>>,
) -> Result<web::Json<ScanResults>> {
    let manager = scans.read().unwrap_or_else(PoisonError::into_inner);
    let scan = manager.get(&scan_id)?;
    Ok(web::Json(ScanResults::from(scan)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::mock::MockClassifier;
    use crate::config::Settings;
    use crate::error::INVALID_FILE_TYPE;
    use crate::explain::Explainer;
    use crate::server::configure;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
    use serde_json::{json, Value};
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    struct State {
        analyzer: web::Data<Analyzer>,
        uploads: web::Data<UploadStore>,
        scans: web::Data<RwLock<ScanManager>>,
        max_upload_size: usize,
        _dir: tempfile::TempDir,
    }

    fn state(probabilities: Vec<f32>) -> State {
        let mut settings = Settings::from_env().unwrap();
        let dir = tempfile::tempdir().unwrap();
        settings.uploads.dir = dir.path().join("uploads");
        settings.uploads.max_upload_size = 1024 * 1024;

        let analyzer = Analyzer::new(
            Arc::new(MockClassifier::new(probabilities)),
            Explainer::new("conv", &settings.explain),
            Some("notumor".into()),
        );
        State {
            analyzer: web::Data::new(analyzer),
            uploads: web::Data::new(UploadStore::new(&settings.uploads)),
            scans: web::Data::new(RwLock::new(ScanManager::new())),
            max_upload_size: settings.uploads.max_upload_size,
            _dir: dir,
        }
    }

    macro_rules! app {
        ($state:expr) => {
            test::init_service(
                App::new()
                    .app_data($state.analyzer.clone())
                    .app_data($state.uploads.clone())
                    .app_data($state.scans.clone())
                    .configure(configure($state.max_upload_size)),
            )
            .await
        };
    }

    fn png() -> Vec<u8> {
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(20, 20, Rgb([120, 60, 30])))
            .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
            .unwrap();
        bytes
    }

    fn png_b64() -> String {
        general_purpose::STANDARD.encode(png())
    }

    /// A browser-style form post with one `file` part
    fn form_request(uri: &str, file_name: &str, bytes: &[u8]) -> test::TestRequest {
        let boundary = "----neuronav-form-boundary";
        let mut body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\
             Content-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        test::TestRequest::post()
            .uri(uri)
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            ))
            .set_payload(body)
    }

    #[actix_web::test]
    async fn test_health() {
        let state = state(vec![0.25; 4]);
        let app = app!(state);

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({"status": "healthy"}));

        let req = test::TestRequest::get().uri("/").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["message"], "Welcome to NeuroNav API");
    }

    #[actix_web::test]
    async fn test_predict_tumor() {
        let state = state(vec![0.05, 0.05, 0.1, 0.8]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(json!({"file_name": "scan.png", "image": png_b64()}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["predicted_class"], "pituitary");
        assert!(body["heatmap"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
        assert_eq!(body["all_probabilities"].as_object().unwrap().len(), 4);
        assert!(body.get("message").is_none());
    }

    #[actix_web::test]
    async fn test_predict_no_finding() {
        let state = state(vec![0.05, 0.05, 0.8, 0.1]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(json!({"file_name": "scan.jpg", "image": png_b64()}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["predicted_class"], "notumor");
        assert!(body["heatmap"].is_null());
        assert_eq!(body["message"], "No suspicious regions detected.");
    }

    #[actix_web::test]
    async fn test_invalid_file_type() {
        let state = state(vec![0.25; 4]);
        let app = app!(state);

        for uri in ["/api/predict", "/api/v1/upload"] {
            let req = test::TestRequest::post()
                .uri(uri)
                .set_json(json!({"file_name": "notes.txt", "image": png_b64()}))
                .to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["code"], 400);
            assert_eq!(body["message"], INVALID_FILE_TYPE);
        }
    }

    #[actix_web::test]
    async fn test_bad_payloads() {
        let state = state(vec![0.25; 4]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(json!({"file_name": "scan.png", "image": "***"}))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST
        );

        let req = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(json!({
                "file_name": "scan.png",
                "image": general_purpose::STANDARD.encode("text"),
            }))
            .to_request();
        assert_eq!(
            test::call_service(&app, req).await.status(),
            StatusCode::BAD_REQUEST
        );

        let req = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(json!({"image": png_b64()}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["code"], 400);
    }

    #[actix_web::test]
    async fn test_predict_volume_is_not_implemented() {
        let state = state(vec![0.25; 4]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/predict")
            .set_json(json!({"file_name": "brain.dcm", "image": png_b64()}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    }

    #[actix_web::test]
    async fn test_upload_then_poll() {
        let state = state(vec![0.7, 0.1, 0.1, 0.1]);
        let app = app!(state);

        let req = test::TestRequest::post()
            .uri("/api/v1/upload")
            .set_json(json!({
                "file_name": "scan.png",
                "content_type": "image/png",
                "image": png_b64(),
            }))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["message"], "File uploaded successfully");
        assert_eq!(body["status"], "processing");
        assert_eq!(body["file_type"], "image/png");
        let id = body["id"].as_str().unwrap().to_string();

        let mut status = Value::Null;
        for _ in 0..100 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/v1/process/{id}"))
                .to_request();
            status = test::call_and_read_body_json(&app, req).await;
            if status["status"] != "processing" {
                break;
            }
            actix_web::rt::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(status["status"], "completed");
        assert_eq!(status["progress"], 1.0);

        let req = test::TestRequest::get()
            .uri(&format!("/api/v1/results/{id}"))
            .to_request();
        let results: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(results["scan_id"], id.as_str());
        assert_eq!(results["results"]["prediction"]["predicted_class"], "glioma");
        assert_eq!(results["results"]["file_type_processed"], "standard_image");
    }

    #[actix_web::test]
    async fn test_predict_form_upload() {
        let state = state(vec![0.05, 0.8, 0.1, 0.05]);
        let app = app!(state);

        let req = form_request("/api/predict", "scan.png", &png()).to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["predicted_class"], "meningioma");
        assert!(body["heatmap"]
            .as_str()
            .unwrap()
            .starts_with("data:image/png;base64,"));
    }

    #[actix_web::test]
    async fn test_form_upload_rejects_file_type() {
        let state = state(vec![0.25; 4]);
        let app = app!(state);

        for uri in ["/api/predict", "/api/v1/upload"] {
            let req = form_request(uri, "notes.txt", b"hello").to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["message"], INVALID_FILE_TYPE);
        }
    }

    #[actix_web::test]
    async fn test_form_upload_then_poll() {
        let state = state(vec![0.1, 0.1, 0.1, 0.7]);
        let app = app!(state);

        let req = form_request("/api/v1/upload", "scan.png", &png()).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["file_name"], "scan.png");
        assert_eq!(body["file_type"], "image/png");
        assert_eq!(body["file_size"], png().len());
        let id = body["id"].as_str().unwrap().to_string();

        let mut results = Value::Null;
        for _ in 0..100 {
            let req = test::TestRequest::get()
                .uri(&format!("/api/v1/results/{id}"))
                .to_request();
            results = test::call_and_read_body_json(&app, req).await;
            if results["status"] != "processing" {
                break;
            }
            actix_web::rt::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(results["status"], "completed");
        assert_eq!(results["results"]["prediction"]["predicted_class"], "pituitary");
    }

    #[actix_web::test]
    async fn test_unknown_scan() {
        let state = state(vec![0.25; 4]);
        let app = app!(state);

        for uri in ["/api/v1/process/deadbeef", "/api/v1/results/deadbeef"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body["code"], 404);
        }
    }
}
