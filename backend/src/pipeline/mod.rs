pub mod augmentations;
pub mod checkpoint;
pub mod clahe;
pub mod config;
pub mod efficientnet;
pub mod filter;
pub mod model;
pub mod resize;
