//! Shadow Router Capture
//!
//! Recomputes the routing decision from intercepted router logits and appends it to
//! the trace. The recomputation is a side channel: it works on its own f64 copy of the
//! scores and never touches what the host goes on to do with its logits.
//!
//! # Flow per forward pass
//!
//! ```text
//! router_logits ─► softmax (f64) ─► top-k per token ─► [meta header if new file]
//!                                                    ─► one route record per token
//! ```
//!
//! [`try_capture`] reports failures as errors. [`capture`] is the call-site wrapper:
//! it swallows every error so a broken trace can never abort the host forward pass.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use ndarray::Array2;

use crate::config::CaptureConfig;
use crate::errors::{Result, RouteMapError};
use crate::hooks::RouterHook;
use crate::routing::{softmax, top_k};
use crate::trace_record::{MetaRecord, RouteRecord, TraceRecord};

/// Routing decision for one token, as recomputed by the shadow path
#[derive(Debug, Clone, PartialEq)]
pub struct ShadowRoute {
    pub topk_ids: Vec<usize>,
    pub topk_weights: Vec<f64>,
}

/// Recompute top-k routing for every row of `logits`
///
/// # Arguments
///
/// * `logits` - Router scores of shape (num_tokens, num_experts)
/// * `top_k_experts` - Experts to select per token
///
/// # Errors
///
/// Returns `RouteMapError::InvalidInput` when `top_k_experts` is 0 or larger than the expert
/// count, or when a row contains NaN or has no finite maximum.
pub fn shadow_route(logits: &Array2<f32>, top_k_experts: usize) -> Result<Vec<ShadowRoute>> {
    let (num_tokens, num_experts) = logits.dim();
    if num_tokens == 0 {
        return Ok(Vec::new());
    }
    if top_k_experts == 0 || top_k_experts > num_experts {
        return Err(RouteMapError::InvalidInput {
            message: format!(
                "top_k {} out of range for {} experts",
                top_k_experts, num_experts
            ),
        });
    }

    for (token_idx, row) in logits.rows().into_iter().enumerate() {
        let max_val = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        if row.iter().any(|v| v.is_nan()) || !max_val.is_finite() {
            return Err(RouteMapError::InvalidInput {
                message: format!("router logits for token {} are not finite", token_idx),
            });
        }
    }

    let probs = softmax(logits);
    Ok(probs
        .rows()
        .into_iter()
        .map(|row| {
            let (topk_ids, topk_weights) = top_k(row, top_k_experts);
            ShadowRoute {
                topk_ids,
                topk_weights,
            }
        })
        .collect())
}

/// Capture one forward pass of a routing layer
///
/// Returns the number of route records appended. A disabled configuration returns
/// `Ok(0)` without looking at the logits or the filesystem. Passing
/// [`UNKNOWN_LAYER`](crate::trace_record::UNKNOWN_LAYER) records the configuration's
/// `layer_id` instead.
///
/// # Errors
///
/// Returns `RouteMapError::InvalidInput` for unusable logits (nothing is written in
/// that case) and `RouteMapError::Io` when the trace cannot be opened or appended.
pub fn try_capture(logits: &Array2<f32>, layer_id: i64, config: &CaptureConfig) -> Result<usize> {
    let Some(trace_path) = config.trace_path.as_deref() else {
        return Ok(0);
    };

    let routes = shadow_route(logits, config.top_k)?;
    let layer = config.resolve_layer(layer_id);

    let mut batch = String::new();
    for (token_idx, route) in routes.into_iter().enumerate() {
        let record = TraceRecord::Route(RouteRecord {
            token_idx,
            layer,
            topk_ids: route.topk_ids,
            topk_weights: route.topk_weights,
        });
        batch.push_str(&record.to_json_line()?);
    }

    let mut file = open_trace(trace_path, config)?;
    // One write per batch keeps lines from interleaving with other appenders
    file.write_all(batch.as_bytes())?;

    Ok(logits.nrows())
}

/// Best-effort capture for use at the host call site
///
/// Never fails and never panics on bad input. Dropped batches are only visible at
/// `debug` level.
pub fn capture(logits: &Array2<f32>, layer_id: i64, config: &CaptureConfig) {
    if !config.is_enabled() {
        return;
    }
    if let Err(err) = try_capture(logits, layer_id, config) {
        tracing::debug!(layer = layer_id, error = %err, "dropped routing capture");
    }
}

/// Open the trace for appending, writing the meta header if this call created it
fn open_trace(path: &Path, config: &CaptureConfig) -> Result<File> {
    match OpenOptions::new().append(true).create_new(true).open(path) {
        Ok(mut file) => {
            let header = TraceRecord::Meta(meta_record(config));
            file.write_all(header.to_json_line()?.as_bytes())?;
            tracing::debug!(path = %path.display(), "created routing trace");
            Ok(file)
        }
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            Ok(OpenOptions::new().append(true).open(path)?)
        }
        Err(err) => Err(err.into()),
    }
}

fn meta_record(config: &CaptureConfig) -> MetaRecord {
    let mut meta = MetaRecord::new(config.model_id.clone(), config.top_k);
    meta.extra = config.extra.clone();
    if let Some(request_id) = &config.request_id {
        meta.extra.insert("request_id".to_string(), request_id.clone());
    }
    meta.extra
        .insert("created_at".to_string(), chrono::Utc::now().to_rfc3339());
    meta
}

/// [`RouterHook`] that writes every observed batch to a trace
#[derive(Debug, Clone)]
pub struct ShadowRouterHook {
    config: CaptureConfig,
}

impl ShadowRouterHook {
    pub const NAME: &'static str = "routemap.shadow_router";

    pub fn new(config: CaptureConfig) -> Self {
        ShadowRouterHook { config }
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }
}

impl RouterHook for ShadowRouterHook {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn on_router_logits(&self, logits: &Array2<f32>, layer_id: i64) {
        capture(logits, layer_id, &self.config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_shadow_route_selects_largest() {
        let logits = array![[0.1f32, 2.0, -1.0, 1.5], [3.0, 0.0, 0.0, 0.0]];
        let routes = shadow_route(&logits, 2).unwrap();

        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].topk_ids, vec![1, 3]);
        assert_eq!(routes[1].topk_ids, vec![0, 1]);
        assert!(routes[0].topk_weights[0] >= routes[0].topk_weights[1]);
        let mass: f64 = routes[1].topk_weights.iter().sum();
        assert!(mass < 1.0);
    }

    #[test]
    fn test_shadow_route_full_expert_count_sums_to_one() {
        let logits = array![[0.5f32, -0.5, 2.0]];
        let routes = shadow_route(&logits, 3).unwrap();
        let mass: f64 = routes[0].topk_weights.iter().sum();
        assert!((mass - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_shadow_route_rejects_bad_shapes() {
        let logits = array![[0.5f32, 0.1]];
        assert!(shadow_route(&logits, 0).is_err());
        assert!(shadow_route(&logits, 3).is_err());

        let nan = array![[f32::NAN, 0.1]];
        assert!(shadow_route(&nan, 1).is_err());

        let masked = array![[f32::NEG_INFINITY, f32::NEG_INFINITY]];
        assert!(shadow_route(&masked, 1).is_err());
    }

    #[test]
    fn test_shadow_route_empty_batch() {
        let logits = Array2::<f32>::zeros((0, 4));
        assert!(shadow_route(&logits, 2).unwrap().is_empty());
    }

    #[test]
    fn test_disabled_capture_is_noop() {
        let logits = Array2::<f32>::zeros((0, 0));
        let config = CaptureConfig::default();
        // Would be an error if it were validated
        assert_eq!(try_capture(&logits, 0, &config).unwrap(), 0);
        capture(&logits, 0, &config);
    }

    #[test]
    fn test_meta_carries_request_id() {
        let config = CaptureConfig::default().with_request_id("req-1");
        let meta = meta_record(&config);
        assert_eq!(meta.extra.get("request_id").map(String::as_str), Some("req-1"));
        assert!(meta.extra.contains_key("created_at"));
        assert_eq!(meta.top_k, 2);
    }
}
