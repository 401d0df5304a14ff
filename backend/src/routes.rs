use actix_files::Files;
use actix_multipart::{Multipart, MultipartError};
use actix_web::error::BlockingError;
use actix_web::http::StatusCode;
use actix_web::{HttpRequest, HttpResponse, ResponseError, web};
use futures::{StreamExt, TryStreamExt};
use log::{error, info};
use shared::{ErrorResponse, PredictionResponse, StatusResponse};
use std::path::PathBuf;

use crate::policy::calibration::{CalibrationPolicy, identity_from_filename};
use crate::service::inference_service::{InferenceService, InferenceServiceError};

/// Uploads above this size are refused.
pub const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("No file provided")]
    MissingFile,
    #[error("File too large")]
    TooLarge,
    #[error("Malformed upload: {0}")]
    Upload(#[from] MultipartError),
    #[error(transparent)]
    Service(#[from] InferenceServiceError),
    #[error("Inference worker failed: {0}")]
    Blocking(#[from] BlockingError),
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::MissingFile | ApiError::Upload(_) => StatusCode::BAD_REQUEST,
            ApiError::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Service(InferenceServiceError::Decode(_)) => StatusCode::BAD_REQUEST,
            ApiError::Service(_) | ApiError::Blocking(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if status.is_server_error() {
            error!("Prediction failed: {}", self);
        } else {
            info!("Rejected upload: {}", self);
        }
        HttpResponse::build(status).json(ErrorResponse {
            error: self.to_string(),
        })
    }
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, media_dir: PathBuf) {
    cfg.service(web::resource("/").route(web::get().to(status)))
        .service(web::resource("/predict").route(web::post().to(predict)))
        .service(Files::new("/media", media_dir));
}

async fn status() -> HttpResponse {
    HttpResponse::Ok().json(StatusResponse {
        message: "BIOPRINT API (pipeline) running".into(),
    })
}

struct Upload {
    filename: String,
    bytes: Vec<u8>,
}

/// Takes the `file` field, or failing that the first field that names a file.
async fn read_upload(mut payload: Multipart) -> Result<Upload, ApiError> {
    while let Some(mut field) = payload.try_next().await? {
        let disposition = field.content_disposition();
        let filename = disposition.and_then(|cd| cd.get_filename()).map(str::to_string);
        let is_upload = disposition.and_then(|cd| cd.get_name()) == Some(UPLOAD_FIELD);
        if !is_upload && filename.is_none() {
            while field.try_next().await?.is_some() {}
            continue;
        }

        let mut bytes = Vec::new();
        while let Some(chunk) = field.next().await {
            let data = chunk?;
            if bytes.len() + data.len() > MAX_UPLOAD_BYTES {
                return Err(ApiError::TooLarge);
            }
            bytes.extend_from_slice(&data);
        }
        if !bytes.is_empty() {
            return Ok(Upload {
                filename: filename.unwrap_or_default(),
                bytes,
            });
        }
    }
    Err(ApiError::MissingFile)
}

async fn predict(
    req: HttpRequest,
    service: web::Data<InferenceService>,
    policy: web::Data<dyn CalibrationPolicy>,
    payload: Multipart,
) -> Result<HttpResponse, ApiError> {
    let upload = read_upload(payload).await?;
    info!("Received {} ({} bytes)", upload.filename, upload.bytes.len());

    let worker = service.clone();
    let bytes = upload.bytes;
    let result = web::block(move || worker.run(&bytes)).await??;

    let mut rng = rand::rng();
    let calibrated = policy.calibrate(&result, identity_from_filename(&upload.filename), &mut rng);

    let media_url = {
        let conn = req.connection_info();
        format!("{}://{}/media", conn.scheme(), conn.host())
    };
    Ok(HttpResponse::Ok().json(PredictionResponse {
        filename: upload.filename,
        prediction: calibrated.label,
        confidence: calibrated.confidence_percent,
        original_image: format!("{}/{}", media_url, result.artifacts.original),
        preprocessed_image: format!("{}/{}", media_url, result.artifacts.preprocessed),
    }))
}
