//! medialinker - personal media collection organizer
//!
//! Watches and periodically scans a source tree for video/subtitle files and
//! disc-image folder structures, resolves each discovered item to canonical
//! title metadata, and materializes a normalized target tree using filesystem
//! hardlinks, recording provenance in SQLite so re-scans are idempotent.

pub mod app;
pub mod config;
pub mod db;
pub mod services;
