//! Application configuration
//!
//! Environment-driven, with `.env` support at the binary edge.
//! List-valued settings are comma-separated.

use std::path::PathBuf;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// CIDR blocks swept for cameras on the RTSP port
    pub scan_subnets: Vec<String>,
    /// Whether the WS-Discovery multicast probe runs each pass
    pub ws_discovery_enabled: bool,
    /// Reply-collection window for one discovery pass
    pub discovery_timeout: Duration,
    /// Cadence of the reconciliation loop
    pub discovery_interval: Duration,
    /// Stream URL templates with {user}/{pass}/{ip} placeholders
    pub rtsp_paths: Vec<String>,
    /// Static camera credentials substituted into the templates
    pub camera_username: String,
    pub camera_password: String,
    /// Capture-session document shared with the labeling workflow
    pub sessions_file: PathBuf,
    /// Root of the labeled dataset tree
    pub data_dir: PathBuf,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scan_subnets: std::env::var("SCAN_SUBNETS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            ws_discovery_enabled: std::env::var("WS_DISCOVERY_ENABLED")
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            discovery_timeout: Duration::from_secs(env_u64("DISCOVERY_TIMEOUT_SEC", 2)),
            discovery_interval: Duration::from_secs(env_u64("DISCOVERY_INTERVAL_SEC", 20)),
            rtsp_paths: std::env::var("RTSP_PATHS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            camera_username: std::env::var("CAMERA_USERNAME").unwrap_or_default(),
            camera_password: std::env::var("CAMERA_PASSWORD").unwrap_or_default(),
            sessions_file: std::env::var("SESSIONS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("config/capture_sessions.json")),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data")),
        }
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(raw: &str) -> bool {
    !matches!(raw.trim().to_ascii_lowercase().as_str(), "false" | "0" | "no" | "off")
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_trims_and_drops_empty() {
        let items = parse_list("192.168.1.0/24, 10.0.0.0/24,,  ");
        assert_eq!(items, vec!["192.168.1.0/24", "10.0.0.0/24"]);
    }

    #[test]
    fn test_parse_list_empty_input() {
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("OFF"));
    }
}
