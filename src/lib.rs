//! Cloud OCR pipeline
//!
//! Uploaded images travel through two queue-connected stages: recognition
//! (image to text blob) and delivery (text blob to email). Each job has a
//! durable status record that the stages reconcile after every attempt.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
pub mod telemetry;
pub mod workers;
