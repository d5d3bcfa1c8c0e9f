//! Floodgate - Adaptive Admission Control
//!
//! This crate implements an in-process rate limiting engine that protects
//! named API endpoints. Each endpoint admits requests per identifier over a
//! sliding window, and a background controller loosens or tightens every
//! endpoint's limit from its observed error rate, latency and load.

pub mod config;
pub mod error;
pub mod ratelimit;
