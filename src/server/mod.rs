//! The user-facing JSON web server

use crate::config::CorsSettings;
use crate::error::Error;
use actix_cors::Cors;
use actix_multipart::form::MultipartFormConfig;
use actix_web::error::BlockingError;
use actix_web::http::header::ContentType;
use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::{error, warn};

pub mod protocol;
pub mod routes;

/// Headroom for the JSON or multipart envelope around the file
const JSON_OVERHEAD: usize = 64 * 1024;

/// An `Error` on its way to becoming an HTTP response
#[derive(Debug)]
pub struct WebError {
    err: Error,
}

/// Body of every failed response
#[derive(Serialize)]
struct ErrorBody {
    code: u16,
    message: String,
}

impl std::fmt::Display for WebError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.err)
    }
}

impl actix_web::error::ResponseError for WebError {
    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("request failed: {}", self.err);
        } else {
            warn!("request rejected: {}", self.err);
        }

        HttpResponse::build(status)
            .insert_header(ContentType::json())
            .json(ErrorBody {
                code: status.as_u16(),
                message: self.to_string(),
            })
    }

    fn status_code(&self) -> StatusCode {
        match self.err {
            Error::Validation(_) | Error::Format(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Io(_)
            | Error::Inference(_)
            | Error::Explanation(_)
            | Error::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for WebError {
    fn from(err: Error) -> WebError {
        WebError { err }
    }
}

impl From<base64::DecodeError> for WebError {
    fn from(err: base64::DecodeError) -> Self {
        WebError {
            err: Error::Validation(format!("invalid base64 image: {err}")),
        }
    }
}

impl From<BlockingError> for WebError {
    fn from(err: BlockingError) -> Self {
        WebError {
            err: Error::Inference(err.to_string()),
        }
    }
}

/// Cross-origin policy for browser clients. `*` allows any origin
pub fn cors(settings: &CorsSettings) -> Cors {
    let cors = Cors::default()
        .allow_any_method()
        .allow_any_header()
        .supports_credentials()
        .max_age(3600);

    if settings.allowed_origins.iter().any(|origin| origin == "*") {
        return cors.allow_any_origin();
    }
    settings
        .allowed_origins
        .iter()
        .fold(cors, |cors, origin| cors.allowed_origin(origin))
}

/// Register the routes and the JSON and multipart payload limits for uploads
/// of up to `max_upload_size` bytes
pub fn configure(max_upload_size: usize) -> impl FnOnce(&mut web::ServiceConfig) {
    let json_limit = max_upload_size / 3 * 4 + 4 + JSON_OVERHEAD;
    let form_limit = max_upload_size + JSON_OVERHEAD;
    move |cfg: &mut web::ServiceConfig| {
        cfg.app_data(
            web::JsonConfig::default()
                .limit(json_limit)
                .error_handler(|err, _req| {
                    WebError::from(Error::Validation(format!("invalid request: {err}"))).into()
                }),
        )
        .app_data(
            MultipartFormConfig::default()
                .total_limit(form_limit)
                .memory_limit(form_limit)
                .error_handler(|err, _req| {
                    WebError::from(Error::Validation(format!("invalid upload: {err}"))).into()
                }),
        )
        .service(routes::index)
        .service(routes::health)
        // form routes carry a content type guard and must come first
        .service(routes::predict_form)
        .service(routes::predict)
        .service(routes::upload_form)
        .service(routes::upload)
        .service(routes::processing_status)
        .service(routes::results);
    }
}
