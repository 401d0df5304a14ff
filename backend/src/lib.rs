pub mod config;
pub mod pipeline;
pub mod policy;
pub mod routes;
pub mod service;
pub mod storage;
