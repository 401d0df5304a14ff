pub mod inference_service;
