pub mod analyzer;
pub mod capture;
pub mod config;
pub mod errors;
pub mod gate;
pub mod hooks;
pub mod patch;
pub mod routing;
pub mod trace_record;
// Re-export key structs for easier access
pub use analyzer::{Summary, TraceAccumulator, analyze, analyze_reader, entropy};
pub use capture::{ShadowRoute, ShadowRouterHook, capture, shadow_route, try_capture};
pub use config::CaptureConfig;
pub use errors::{Result, RouteMapError};
pub use gate::LinearGate;
pub use hooks::{HookRegistry, RouterGate, RouterHook, TracedGate};
pub use patch::{
    AnchorMatch, DEFAULT_ANCHOR, DEFAULT_PAYLOAD, Markers, PatchManager, PatchMode, PatchState,
    write_atomic,
};
pub use trace_record::{MetaRecord, RouteRecord, TraceRecord, UNKNOWN_LAYER};

// Constants
/// Trace file name used by the CLI when none is given
pub const DEFAULT_TRACE_FILE: &str = "moe_routes.jsonl";
/// Expert count of Qwen1.5-MoE-A2.7B
pub const DEFAULT_NUM_EXPERTS: usize = 60;
