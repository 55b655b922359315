//! Exporters: turn the selected server set plus routing into a
//! target-specific configuration document.
//!
//! Exporters are deterministic: identical inputs produce byte-identical
//! serialized output (object keys are sorted by the JSON layer).
//! Version differences in the sing-box syntax are encapsulated behind the
//! [`sboxpipe_types::SingboxVariant`] selector, not scattered conditionals.

use std::process::Command;

use serde_json::Value;
use thiserror::Error;

use sboxpipe_types::{ClientProfile, ExportFormat, ParsedServer, SingboxVariant};

use crate::context::PipelineContext;
use crate::route::RoutingConfig;

pub mod clash;
pub mod singbox;

pub use clash::ClashExporter;
pub use singbox::SingboxExporter;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("nothing to export")]
    Empty,
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// A produced document plus any best-effort warnings (e.g. servers the
/// target format cannot express).
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub document: Value,
    pub warnings: Vec<String>,
}

/// Target-document assembly.
pub trait Exporter: Send + Sync {
    fn format(&self) -> ExportFormat;

    fn export(
        &self,
        servers: &[ParsedServer],
        routing: &RoutingConfig,
        client: &ClientProfile,
        ctx: &PipelineContext,
    ) -> Result<ExportOutcome, ExportError>;
}

/// Resolve the exporter for a format/variant pair.
pub fn exporter_for(format: ExportFormat, variant: SingboxVariant) -> Box<dyn Exporter> {
    match format {
        ExportFormat::Singbox => Box::new(SingboxExporter::new(variant)),
        ExportFormat::Clash => Box::new(ClashExporter),
    }
}

/// Optional collaborator answering "which sing-box is installed?".
pub trait VersionProbe {
    /// `(major, minor)` of the target engine, or `None` when unreachable.
    fn singbox_version(&self) -> Option<(u32, u32)>;
}

/// Probes by running `sing-box version` and parsing its first line.
pub struct CommandProbe {
    binary: String,
}

impl Default for CommandProbe {
    fn default() -> Self {
        Self {
            binary: "sing-box".to_string(),
        }
    }
}

impl CommandProbe {
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl VersionProbe for CommandProbe {
    fn singbox_version(&self) -> Option<(u32, u32)> {
        let output = Command::new(&self.binary).arg("version").output().ok()?;
        if !output.status.success() {
            return None;
        }
        parse_version_line(&String::from_utf8_lossy(&output.stdout))
    }
}

/// A probe that never answers; used when probing is skipped.
pub struct NoProbe;

impl VersionProbe for NoProbe {
    fn singbox_version(&self) -> Option<(u32, u32)> {
        None
    }
}

/// Extract `(major, minor)` from `sing-box version 1.11.3` style output.
pub fn parse_version_line(line: &str) -> Option<(u32, u32)> {
    let token = line
        .split_whitespace()
        .find(|t| t.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let mut parts = token.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

/// Syntax variant decision: explicit override > skip flag > probe result.
/// An unreachable probe defaults to modern.
pub fn choose_variant(
    explicit: Option<SingboxVariant>,
    skip_probe: bool,
    probe: &dyn VersionProbe,
) -> SingboxVariant {
    if let Some(variant) = explicit {
        return variant;
    }
    if skip_probe {
        return SingboxVariant::Modern;
    }
    match probe.singbox_version() {
        Some(version) if version < (1, 11) => SingboxVariant::Legacy,
        _ => SingboxVariant::Modern,
    }
}

/// Meta keys that are pipeline annotations, not wire fields. Exporters
/// drop these; everything else passes through verbatim.
pub(crate) const ANNOTATION_KEYS: [&str; 9] = [
    "name",
    "ps",
    "geo",
    "country",
    "latency_ms",
    "high_latency",
    "tags",
    "source_id",
    "source_priority",
];
