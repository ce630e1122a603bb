//! geoingest - manifest-driven geospatial ingestion
//!
//! This crate provides:
//! - A manifest ingester that fetches, caches and verifies source files
//! - Conversion of shapefiles, GeoJSON, rasters, archives and chart CSVs into
//!   normalized artifacts stored in a SQLite catalog
//! - A job lifecycle tracker shared by conversions and analyses

pub mod analytics;
pub mod app;
pub mod catalog;
pub mod commands;
pub mod config;
pub mod convert;
pub mod error;
pub mod extension;
pub mod fetch;
pub mod jobs;
pub mod manifest;
pub mod materialize;
pub mod progress;

pub use config::Config;
pub use error::{Error, Result};
