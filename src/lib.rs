//! camfleet - network camera fleet core
//!
//! ## Architecture
//!
//! 1. CameraDiscovery - candidate IP discovery (WS-Discovery + subnet scan)
//! 2. EndpointSelector - per-camera stream URL selection from templates
//! 3. StreamWorker - one capture loop per live camera
//! 4. CameraManager - discovery-driven worker reconciliation
//! 5. CaptureSessionStore - persisted labeled-capture windows
//!
//! Vision consumers attach through the `FrameSink` callback; the media
//! layer sits behind the `StreamOpener` seam.

pub mod capture;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod manager;
pub mod session_store;
pub mod worker;

pub use error::{Error, Result};
