use actix_cors::Cors;
use actix_web::{App, HttpServer, web};
use backend::config::AppConfig;
use backend::pipeline::model::{Classifier, Model, ModelCache};
use backend::policy::calibration::{CalibrationPolicy, policy_from_config};
use backend::routes::configure_routes;
use backend::service::inference_service::InferenceService;
use backend::storage::media_store::MediaStore;
use std::env;
use std::io::{Error, ErrorKind};
use std::sync::Arc;

static MODEL: ModelCache<Model> = ModelCache::new();

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = AppConfig::from_env().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        Error::new(ErrorKind::InvalidInput, e.to_string())
    })?;

    if !config.model_path.is_file() {
        log::error!(
            "Model file not found at {}. Place the trained weights there or set MODEL_PATH.",
            config.model_path.display()
        );
        return Err(Error::new(
            ErrorKind::NotFound,
            format!("Model file not found at {}", config.model_path.display()),
        ));
    }

    let model = MODEL
        .load(&config.model_path, config.classification.num_classes(), config.device)
        .map_err(|e| {
            log::error!("Failed to preload model at startup: {}", e);
            Error::other(format!("Model loading failed: {}", e))
        })?;
    log::info!("Model loaded.");

    let media = MediaStore::new(&config.media_dir).map_err(|e| Error::other(e.to_string()))?;
    let classifier: Arc<dyn Classifier> = model;
    let service = InferenceService::new(classifier, media, config.classification.labels.clone());
    let policy: Arc<dyn CalibrationPolicy> = policy_from_config(&config.classification);

    let media_dir = config.media_dir.clone();
    let bind_address = (config.host.clone(), config.port);
    log::info!("Starting server on {}:{}", bind_address.0, bind_address.1);

    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allow_any_header()
                    .max_age(3600),
            )
            .app_data(web::Data::new(service.clone()))
            .app_data(web::Data::from(policy.clone()))
            .configure(|cfg| configure_routes(cfg, media_dir.clone()))
    })
    .bind(bind_address)?
    .run()
    .await
}
