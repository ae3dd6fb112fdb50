use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::trace_record::UNKNOWN_LAYER;

pub const DEFAULT_TOP_K: usize = 2;
pub const DEFAULT_MODEL_ID: &str = "Qwen/Qwen1.5-MoE-A2.7B-Chat";

/// Environment variable naming the trace file. Unset or empty disables capture.
pub const ENV_TRACE_PATH: &str = "ROUTEMAP_TRACE";
/// Variable read by the original python hook, honoured as a fallback.
pub const ENV_LEGACY_TRACE_PATH: &str = "VLLM_LOG_MOE";
pub const ENV_TOP_K: &str = "ROUTEMAP_TOP_K";
pub const ENV_MODEL_ID: &str = "ROUTEMAP_MODEL_ID";
pub const ENV_LAYER_ID: &str = "ROUTEMAP_LAYER_ID";
pub const ENV_REQUEST_ID: &str = "ROUTEMAP_REQUEST_ID";

/// Configuration threaded through every capture call
///
/// Capture reads nothing from process-wide state; whatever the host knows about the
/// run is passed in here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Trace file to append to. `None` turns capture into a no-op.
    #[serde(default)]
    pub trace_path: Option<PathBuf>,

    /// Experts recorded per token
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Written into the meta header of a new trace
    #[serde(default = "default_model_id")]
    pub model_id: String,

    /// Layer recorded on each route record when the host does not supply one
    #[serde(default = "default_layer_id")]
    pub layer_id: i64,

    #[serde(default)]
    pub request_id: Option<String>,

    /// Additional header entries
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn default_model_id() -> String {
    DEFAULT_MODEL_ID.to_string()
}

fn default_layer_id() -> i64 {
    UNKNOWN_LAYER
}

impl Default for CaptureConfig {
    fn default() -> Self {
        CaptureConfig {
            trace_path: None,
            top_k: default_top_k(),
            model_id: default_model_id(),
            layer_id: default_layer_id(),
            request_id: None,
            extra: BTreeMap::new(),
        }
    }
}

impl CaptureConfig {
    /// Enabled configuration writing to `path`
    pub fn tracing_to(path: impl AsRef<Path>) -> Self {
        CaptureConfig::default().with_trace_path(path)
    }

    /// Build a configuration from `ROUTEMAP_*` environment variables
    ///
    /// Values are not validated: anything missing or unparseable keeps its default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`CaptureConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = CaptureConfig::default();

        CaptureConfig {
            trace_path: non_empty(ENV_TRACE_PATH)
                .or_else(|| non_empty(ENV_LEGACY_TRACE_PATH))
                .map(PathBuf::from),
            top_k: non_empty(ENV_TOP_K)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.top_k),
            model_id: non_empty(ENV_MODEL_ID).unwrap_or(defaults.model_id),
            layer_id: non_empty(ENV_LAYER_ID)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.layer_id),
            request_id: non_empty(ENV_REQUEST_ID),
            extra: defaults.extra,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.trace_path.is_some()
    }

    /// Layer to record for a capture: the host's id, or the configured default
    /// when the host passes [`UNKNOWN_LAYER`]
    pub fn resolve_layer(&self, layer_id: i64) -> i64 {
        if layer_id == UNKNOWN_LAYER {
            self.layer_id
        } else {
            layer_id
        }
    }

    pub fn with_trace_path(mut self, path: impl AsRef<Path>) -> Self {
        self.trace_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_layer_id(mut self, layer_id: i64) -> Self {
        self.layer_id = layer_id;
        self
    }

    pub fn with_model_id(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_disable_capture() {
        let config = CaptureConfig::from_lookup(lookup(&[]));
        assert!(!config.is_enabled());
        assert_eq!(config, CaptureConfig::default());
        assert_eq!(config.top_k, 2);
        assert_eq!(config.layer_id, -1);
    }

    #[test]
    fn test_reads_all_variables() {
        let config = CaptureConfig::from_lookup(lookup(&[
            (ENV_TRACE_PATH, "/tmp/routes.jsonl"),
            (ENV_TOP_K, "4"),
            (ENV_MODEL_ID, "mixtral"),
            (ENV_LAYER_ID, "11"),
            (ENV_REQUEST_ID, "req-9"),
        ]));

        assert_eq!(config.trace_path, Some(PathBuf::from("/tmp/routes.jsonl")));
        assert_eq!(config.top_k, 4);
        assert_eq!(config.model_id, "mixtral");
        assert_eq!(config.layer_id, 11);
        assert_eq!(config.request_id.as_deref(), Some("req-9"));
    }

    #[test]
    fn test_legacy_variable_and_bad_numbers() {
        let config = CaptureConfig::from_lookup(lookup(&[
            (ENV_LEGACY_TRACE_PATH, "moe_routes.jsonl"),
            (ENV_TOP_K, "two"),
            (ENV_LAYER_ID, ""),
        ]));

        assert!(config.is_enabled());
        assert_eq!(config.top_k, DEFAULT_TOP_K);
        assert_eq!(config.layer_id, UNKNOWN_LAYER);
    }

    #[test]
    fn test_resolve_layer_prefers_host_id() {
        let config = CaptureConfig::default().with_layer_id(9);
        assert_eq!(config.resolve_layer(UNKNOWN_LAYER), 9);
        assert_eq!(config.resolve_layer(3), 3);
        assert_eq!(CaptureConfig::default().resolve_layer(UNKNOWN_LAYER), UNKNOWN_LAYER);
    }

    #[test]
    fn test_empty_trace_path_is_disabled() {
        let config = CaptureConfig::from_lookup(lookup(&[(ENV_TRACE_PATH, "  ")]));
        assert!(!config.is_enabled());
    }
}
