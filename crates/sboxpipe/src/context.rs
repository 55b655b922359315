//! Per-invocation pipeline context.

use std::collections::BTreeMap;
use std::sync::Arc;

use sboxpipe_events::trace;
use sboxpipe_types::{FullProfile, PipelineMode, RouteRuleSpec};
use serde_json::Value;

/// Total serialized-byte cap on context metadata.
pub const METADATA_BYTE_CAP: usize = 64 * 1024;

/// Value object carrying one pipeline run's identity and knobs.
///
/// Owned by the invocation; never shared across runs. The metadata map is
/// bounded: additions past [`METADATA_BYTE_CAP`] are truncated (strings) or
/// dropped (everything else) and the context is flagged.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub trace_id: String,
    pub source_url: String,
    pub mode: PipelineMode,
    pub debug_level: u8,
    pub profile: Arc<FullProfile>,
    pub user_routes: Vec<RouteRuleSpec>,
    /// Excluded server identity hashes active for this run.
    pub exclusions: Vec<String>,
    metadata: BTreeMap<String, Value>,
    metadata_bytes: usize,
    metadata_truncated: bool,
}

impl PipelineContext {
    pub fn new(source_url: impl Into<String>, mode: PipelineMode, profile: Arc<FullProfile>) -> Self {
        Self::with_trace_id(trace::generate_trace_id(), source_url, mode, profile)
    }

    pub fn with_trace_id(
        trace_id: impl Into<String>,
        source_url: impl Into<String>,
        mode: PipelineMode,
        profile: Arc<FullProfile>,
    ) -> Self {
        let user_routes = profile.routing.custom_routes.clone();
        Self {
            trace_id: trace_id.into(),
            source_url: source_url.into(),
            mode,
            debug_level: profile.ui.debug_level,
            profile,
            user_routes,
            exclusions: Vec::new(),
            metadata: BTreeMap::new(),
            metadata_bytes: 0,
            metadata_truncated: false,
        }
    }

    /// Insert a metadata value, honouring the byte cap.
    ///
    /// Returns false when the value had to be truncated or dropped.
    pub fn set_metadata(&mut self, key: impl Into<String>, value: Value) -> bool {
        let key = key.into();
        let size = key.len() + value.to_string().len();

        if self.metadata_bytes + size <= METADATA_BYTE_CAP {
            self.metadata_bytes += size;
            self.metadata.insert(key, value);
            return true;
        }

        self.metadata_truncated = true;
        let budget = METADATA_BYTE_CAP.saturating_sub(self.metadata_bytes + key.len());
        if budget > 0 {
            if let Value::String(s) = &value {
                let truncated: String = s.chars().take(budget).collect();
                self.metadata_bytes += key.len() + truncated.len();
                self.metadata.insert(key, Value::String(truncated));
            }
        }
        false
    }

    pub fn metadata(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn metadata_map(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }

    pub fn metadata_truncated(&self) -> bool {
        self.metadata_truncated
    }
}
