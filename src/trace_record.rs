//! Trace record schema
//!
//! A trace is a JSON-lines file: one record per line, `\n`-terminated. Two record
//! kinds exist, discriminated by the `type` field:
//!
//! ```text
//! {"type":"meta","model_id":"Qwen/Qwen1.5-MoE-A2.7B-Chat","top_k":2}
//! {"type":"route","token_idx":0,"layer":3,"topk_ids":[7,12],"topk_weights":[0.41,0.22]}
//! ```
//!
//! The meta header is written at most once, as the first line of a freshly created
//! trace. Route records follow, one per token per routing-layer forward pass.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, RouteMapError};

/// Layer id recorded when the host does not know which layer it is.
pub const UNKNOWN_LAYER: i64 = -1;

fn unknown_layer() -> i64 {
    UNKNOWN_LAYER
}

/// Header describing the run that created the trace.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MetaRecord {
    /// Model identifier. Older traces used the `model` key.
    #[serde(alias = "model")]
    pub model_id: String,
    /// Experts selected per token. 0 when the writer did not record it.
    #[serde(default)]
    pub top_k: usize,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl MetaRecord {
    pub fn new(model_id: impl Into<String>, top_k: usize) -> Self {
        MetaRecord {
            model_id: model_id.into(),
            top_k,
            extra: BTreeMap::new(),
        }
    }
}

/// One routing decision for one token.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RouteRecord {
    /// Row within the captured batch; not unique across batches.
    pub token_idx: usize,
    #[serde(default = "unknown_layer")]
    pub layer: i64,
    /// Selected experts in descending weight order.
    pub topk_ids: Vec<usize>,
    /// Softmax probabilities aligned with `topk_ids`.
    pub topk_weights: Vec<f64>,
}

impl RouteRecord {
    /// Sum of the selected experts' probabilities.
    pub fn weight_mass(&self) -> f64 {
        self.topk_weights.iter().sum()
    }

    pub fn is_well_formed(&self) -> bool {
        self.topk_ids.len() == self.topk_weights.len()
            && self
                .topk_weights
                .iter()
                .all(|w| w.is_finite() && *w >= 0.0)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TraceRecord {
    Meta(MetaRecord),
    Route(RouteRecord),
}

impl TraceRecord {
    /// Encode as a single `\n`-terminated JSON line.
    pub fn to_json_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Parse one trace line.
    ///
    /// # Errors
    /// Returns `RouteMapError::Serialization` if the line is not a record and
    /// `RouteMapError::InvalidInput` for a route record whose ids and weights disagree.
    pub fn from_json_line(line: &str) -> Result<Self> {
        let record: TraceRecord = serde_json::from_str(line.trim_end())?;
        if let TraceRecord::Route(route) = &record {
            if !route.is_well_formed() {
                return Err(RouteMapError::InvalidInput {
                    message: format!(
                        "route record for token {} has {} ids, {} weights or a negative weight",
                        route.token_idx,
                        route.topk_ids.len(),
                        route.topk_weights.len()
                    ),
                });
            }
        }
        Ok(record)
    }
}
