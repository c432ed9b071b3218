pub mod cache;
pub mod cli;
pub mod cluster;
pub mod config;
pub mod engine;
pub mod error;
pub mod loader;
pub mod model;
pub mod rater;
pub mod upstream;
