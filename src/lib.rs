//! Incremental archiver for posts and media pulled from remote sources.

pub mod adapter;
pub mod config;
pub mod db;
pub mod download;
pub mod error;
pub mod models;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod sync;

pub use error::{AppError, Result};
