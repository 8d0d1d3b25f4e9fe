//! # casewatch core
//!
//! I/O-free logic shared by the casewatch pipeline: case models and
//! content hashing, duplicate scoring, the geospatial clustering engine,
//! and the [`store::RecordStore`] abstraction with an in-memory backend.
//!
//! This crate contains no tokio runtime, sqlx, or HTTP dependencies.

pub mod cluster;
pub mod models;
pub mod similarity;
pub mod store;
