//! Background song downloads with resumable transfers, a shared queue and an
//! aggregated progress notification.

pub mod backend;
pub mod config;
pub mod downloader;
pub mod library;
pub mod postprocess;
pub mod router;
pub mod source;
