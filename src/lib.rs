pub mod config;
pub mod damage;
pub mod db;
pub mod engine;
pub mod error;
pub mod fusion;
pub mod geometry;
pub mod history;
pub mod loader;
pub mod models;
pub mod parser;
pub mod portfolio;
pub mod scheduler;
pub mod scoring;
pub mod sources;
pub mod spatial;

pub use engine::Engine;
pub use error::{AppError, Result};
