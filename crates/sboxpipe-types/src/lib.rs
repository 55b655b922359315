//! Core domain types for the sboxpipe subscription pipeline.
//!
//! Everything here is plain data: serde-round-trippable structs and enums
//! shared by the fetch/parse/process/export stages, the event bus, and the
//! agent IPC client. No I/O happens in this crate.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Duration fields in profile documents take either a humantime string
/// (`"30s"`, `"500ms"`, `"2m 30s"`) or a bare millisecond count.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Human(String),
        Millis(u64),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Human(text) => humantime::parse_duration(&text).map_err(|err| {
            serde::de::Error::custom(format!("invalid duration {text:?}: {err}"))
        }),
        Raw::Millis(ms) => Ok(Duration::from_millis(ms)),
    }
}

/// Written back as milliseconds so values survive a round trip through
/// [`deserialize_duration`].
pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Proxy protocol of a parsed server.
///
/// Lowercase tokens on the wire. `Direct`, `Block`, `Dns` and `Urltest`
/// are virtual: they never dial a remote endpoint and may carry port 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Tuic,
    Wireguard,
    Http,
    Socks,
    Direct,
    Block,
    Dns,
    Urltest,
}

impl Protocol {
    /// Virtual protocols are engine-internal outbounds, not real servers.
    pub fn is_virtual(self) -> bool {
        matches!(
            self,
            Protocol::Direct | Protocol::Block | Protocol::Dns | Protocol::Urltest
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Hysteria2 => "hysteria2",
            Protocol::Tuic => "tuic",
            Protocol::Wireguard => "wireguard",
            Protocol::Http => "http",
            Protocol::Socks => "socks",
            Protocol::Direct => "direct",
            Protocol::Block => "block",
            Protocol::Dns => "dns",
            Protocol::Urltest => "urltest",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vless" => Ok(Protocol::Vless),
            "vmess" => Ok(Protocol::Vmess),
            "trojan" => Ok(Protocol::Trojan),
            // Clash and URI lists both spell shadowsocks as "ss".
            "shadowsocks" | "ss" => Ok(Protocol::Shadowsocks),
            "hysteria2" | "hy2" => Ok(Protocol::Hysteria2),
            "tuic" => Ok(Protocol::Tuic),
            "wireguard" | "wg" => Ok(Protocol::Wireguard),
            "http" => Ok(Protocol::Http),
            "socks" | "socks5" => Ok(Protocol::Socks),
            "direct" => Ok(Protocol::Direct),
            "block" => Ok(Protocol::Block),
            "dns" => Ok(Protocol::Dns),
            "urltest" => Ok(Protocol::Urltest),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Canonical in-memory server record used throughout the pipeline.
///
/// Created by parsers, mutated only by middleware and postprocessors,
/// discarded at the end of a pipeline run. The `meta` map preserves the
/// parser's original fields verbatim, including falsy values such as
/// WireGuard `mtu = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedServer {
    pub protocol: Protocol,
    pub address: String,
    pub port: u16,
    /// Canonical display tag. Set only by tag normalization.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default)]
    pub meta: BTreeMap<String, Value>,
}

impl ParsedServer {
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            address: address.into(),
            port,
            tag: None,
            meta: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// String-valued metadata lookup.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.meta.get(key).and_then(Value::as_str)
    }

    pub fn meta_f64(&self, key: &str) -> Option<f64> {
        self.meta.get(key).and_then(Value::as_f64)
    }

    /// Stable identity string used for exclusion hashing and deduplication.
    pub fn identity(&self) -> String {
        format!("{}|{}|{}", self.protocol, self.address, self.port)
    }

    /// A server is structurally valid when its address is non-empty (for
    /// non-virtual protocols) and its port is in range. Virtual protocols
    /// may use port 0.
    pub fn is_valid(&self) -> bool {
        if self.protocol.is_virtual() {
            return true;
        }
        !self.address.is_empty() && self.port > 0
    }
}

/// One subscription input. Identity is `id`; `priority` orders merged
/// sources ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSource {
    pub id: String,
    /// URL (`http`, `https`, `file`) or a bare filesystem path.
    pub url: String,
    #[serde(rename = "type", default)]
    pub kind: SourceKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Remote or local URL, format auto-detected.
    #[default]
    Url,
    /// Local file path.
    File,
    /// Remote URL fetched with a bearer token.
    ApiToken,
}

impl SubscriptionSource {
    pub fn from_url(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            kind: SourceKind::Url,
            enabled: true,
            priority: 0,
            tags: Vec::new(),
            description: None,
        }
    }
}

/// Failure semantics for a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineMode {
    /// First fatal error aborts the run.
    Strict,
    /// Errors accumulate; the run continues past recoverable failures.
    #[default]
    Tolerant,
}

/// The only error categories the pipeline recognizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Fetch,
    Parse,
    Plugin,
    Internal,
    Policy,
    Export,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Advisory only.
    Warning,
    /// Pipeline continues in tolerant mode.
    Recoverable,
    /// Aborts in strict mode; forces `success = false` in tolerant mode.
    Fatal,
}

/// One recorded pipeline failure. The `context` map is pre-redacted by the
/// reporter before it lands here; raw subscription bodies never appear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub severity: ErrorSeverity,
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

impl PipelineError {
    pub fn new(
        kind: ErrorKind,
        severity: ErrorSeverity,
        stage: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            stage: stage.into(),
            message: message.into(),
            timestamp: Utc::now(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}

/// Outcome of one pipeline invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// Target-format document, absent on failure.
    pub artifact: Option<Value>,
    pub trace_id: String,
    pub source: String,
    pub mode: PipelineMode,
    pub errors: Vec<PipelineError>,
    pub success: bool,
    pub partial_success: bool,
}

impl PipelineResult {
    /// `success` requires no fatal errors and a non-empty artifact;
    /// `partial_success` is success with at least one recorded error.
    pub fn finish(
        artifact: Option<Value>,
        trace_id: impl Into<String>,
        source: impl Into<String>,
        mode: PipelineMode,
        errors: Vec<PipelineError>,
    ) -> Self {
        let has_fatal = errors.iter().any(PipelineError::is_fatal);
        let artifact_non_empty = artifact
            .as_ref()
            .map(|a| !matches!(a, Value::Null))
            .unwrap_or(false);
        let success = !has_fatal && artifact_non_empty;
        let partial_success = success && !errors.is_empty();
        Self {
            artifact,
            trace_id: trace_id.into(),
            source: source.into(),
            mode,
            errors,
            success,
            partial_success,
        }
    }
}

/// Relative importance of an event; handlers fire for any priority, the
/// value is advisory routing information for sinks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Debug,
    Info,
    #[default]
    Normal,
    High,
    Critical,
}

/// One event on the in-process bus and, optionally, on the agent socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub priority: EventPriority,
    pub trace_id: String,
    #[serde(default)]
    pub data: Value,
}

/// Verdict of a policy evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    Allow,
    Warn,
    Deny,
    /// The policy did not apply to this server.
    Skip,
}

/// Result of evaluating a single policy against a single server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResult {
    pub policy: String,
    pub decision: PolicyDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl PolicyResult {
    pub fn allow(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            decision: PolicyDecision::Allow,
            reason: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn deny(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            decision: PolicyDecision::Deny,
            reason: Some(reason.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn warn(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            decision: PolicyDecision::Warn,
            reason: Some(reason.into()),
            metadata: BTreeMap::new(),
        }
    }

    pub fn skip(policy: impl Into<String>) -> Self {
        Self {
            policy: policy.into(),
            decision: PolicyDecision::Skip,
            reason: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Target document family for export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    #[default]
    Singbox,
    Clash,
}

/// sing-box syntax generation. Modern (>= 1.11) uses rule actions and drops
/// the deprecated `block`/`dns` outbounds; legacy keeps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SingboxVariant {
    #[default]
    Modern,
    Legacy,
}

/// A local listener exposed by the exported document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundSpec {
    #[serde(rename = "type")]
    pub kind: InboundKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundKind {
    Tun,
    Socks,
    Http,
    Tproxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DnsMode {
    #[default]
    System,
    Tunnel,
    Off,
}

/// Target-engine-facing description derived during export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientProfile {
    #[serde(default)]
    pub inbounds: Vec<InboundSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_route: Option<String>,
    /// Protocol tokens excluded from the exported outbounds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_outbounds: Vec<String>,
    #[serde(default)]
    pub dns_mode: DnsMode,
}

/// One hashed exclusion entry. The hash derives from
/// `protocol|address|port`; the name is a human-readable hint only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExclusionEntry {
    pub id_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
}

/// Hash-set-semantics exclusion list. Mutation helpers are pure; the store
/// in the core crate handles persistence and locking.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExclusionList {
    #[serde(default)]
    pub entries: Vec<ExclusionEntry>,
}

impl ExclusionList {
    pub fn contains(&self, id_sha256: &str) -> bool {
        self.entries.iter().any(|e| e.id_sha256 == id_sha256)
    }

    /// Idempotent insert; re-adding an existing hash is a no-op and
    /// returns false.
    pub fn add(&mut self, entry: ExclusionEntry) -> bool {
        if self.contains(&entry.id_sha256) {
            return false;
        }
        self.entries.push(entry);
        true
    }

    /// Returns true when an entry was removed.
    pub fn remove(&mut self, id_sha256: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id_sha256 != id_sha256);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Chain execution mode for postprocessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    #[default]
    Sequential,
    Parallel,
    Conditional,
}

/// What to do when a processor fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    /// Log the failure, keep the pre-processor input, move on.
    #[default]
    Continue,
    /// Propagate; fatal to the chain.
    FailFast,
    /// Retry up to `max_retries`, then fall back to `Continue`.
    Retry,
}

/// One configured plugin (middleware or postprocessor) in a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

impl PluginSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            options: BTreeMap::new(),
        }
    }

    pub fn option_str(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(Value::as_str)
    }

    pub fn option_bool(&self, key: &str) -> Option<bool> {
        self.options.get(key).and_then(Value::as_bool)
    }

    pub fn option_u64(&self, key: &str) -> Option<u64> {
        self.options.get(key).and_then(Value::as_u64)
    }
}

/// Tag/exclusion filter section of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterSection {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub only_tags: Vec<String>,
    /// Server identity strings (`protocol|address|port`) excluded outright.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclusions: Vec<String>,
}

/// Routing section of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingSection {
    /// source id -> outbound tag overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub by_source: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_route: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub custom_routes: Vec<RouteRuleSpec>,
    /// Final outbound override: `auto`, `direct`, `block` or a named tag.
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_route: Option<String>,
}

/// A user-declared routing rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteRuleSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domain_suffix: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_cidr: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    pub outbound: String,
}

/// Export section of a profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSection {
    #[serde(default)]
    pub format: ExportFormat,
    /// Explicit sing-box syntax override; absent means "probe, default modern".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<SingboxVariant>,
    #[serde(default)]
    pub skip_version_probe: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_profile: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbound_profile: Option<String>,
    /// Protocol tokens dropped from the exported outbounds (and from any
    /// urltest group).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_outbounds: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_file: Option<PathBuf>,
}

/// Postprocessor chain section of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostprocessSection {
    #[serde(default)]
    pub mode: ChainMode,
    #[serde(default)]
    pub error_strategy: ErrorStrategy,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_parallel_workers")]
    pub parallel_workers: usize,
    #[serde(default)]
    pub processors: Vec<PluginSpec>,
}

fn default_max_retries() -> u32 {
    2
}

fn default_parallel_workers() -> usize {
    4
}

impl Default for PostprocessSection {
    fn default() -> Self {
        Self {
            mode: ChainMode::Sequential,
            error_strategy: ErrorStrategy::Continue,
            max_retries: default_max_retries(),
            parallel_workers: default_parallel_workers(),
            processors: Vec::new(),
        }
    }
}

/// Agent IPC section of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentSection {
    pub enabled: bool,
    pub socket_path: PathBuf,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub timeout: Duration,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    pub heartbeat_interval: Duration,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            enabled: false,
            socket_path: PathBuf::from("/tmp/sboxagent.sock"),
            timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

/// UI section; the pipeline only reads the debug level.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UiSection {
    pub debug_level: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Profile bookkeeping. Unknown auxiliary hash fields are tolerated and
/// round-tripped via `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// source url -> content SHA-256 from the last run.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub cache_hashes: BTreeMap<String, String>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The declarative configuration for one pipeline run. Single source of
/// truth: every stage reads its settings from here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FullProfile {
    pub name: String,
    pub subscriptions: Vec<SubscriptionSource>,
    pub filters: FilterSection,
    pub routing: RoutingSection,
    pub export: ExportSection,
    pub middleware: Vec<PluginSpec>,
    pub postprocessors: PostprocessSection,
    pub agent: AgentSection,
    pub ui: UiSection,
    pub metadata: ProfileMetadata,
}

impl FullProfile {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Enabled subscriptions ordered by ascending priority, stable within
    /// equal priorities.
    pub fn ordered_sources(&self) -> Vec<&SubscriptionSource> {
        let mut sources: Vec<&SubscriptionSource> =
            self.subscriptions.iter().filter(|s| s.enabled).collect();
        sources.sort_by_key(|s| s.priority);
        sources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_tokens_are_lowercase() {
        let json = serde_json::to_string(&Protocol::Hysteria2).expect("serialize");
        assert_eq!(json, "\"hysteria2\"");
        assert_eq!("vless".parse::<Protocol>().expect("parse"), Protocol::Vless);
        assert_eq!(
            "ss".parse::<Protocol>().expect("parse"),
            Protocol::Shadowsocks
        );
    }

    #[test]
    fn virtual_protocols_accept_port_zero() {
        let direct = ParsedServer::new(Protocol::Direct, "", 0);
        assert!(direct.is_valid());

        let vless = ParsedServer::new(Protocol::Vless, "", 0);
        assert!(!vless.is_valid());
    }

    #[test]
    fn identity_is_protocol_address_port() {
        let s = ParsedServer::new(Protocol::Vless, "host1", 443);
        assert_eq!(s.identity(), "vless|host1|443");
    }

    #[test]
    fn meta_preserves_falsy_values() {
        let s = ParsedServer::new(Protocol::Wireguard, "wg.example", 51820)
            .with_meta("mtu", Value::from(0))
            .with_meta("keepalive", Value::from(false));

        let json = serde_json::to_string(&s).expect("serialize");
        let rt: ParsedServer = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rt.meta.get("mtu"), Some(&Value::from(0)));
        assert_eq!(rt.meta.get("keepalive"), Some(&Value::from(false)));
    }

    #[test]
    fn pipeline_result_success_requires_artifact_and_no_fatal() {
        let ok = PipelineResult::finish(
            Some(serde_json::json!({"outbounds": []})),
            "abcd",
            "https://example.com/sub",
            PipelineMode::Tolerant,
            vec![],
        );
        assert!(ok.success);
        assert!(!ok.partial_success);

        let partial = PipelineResult::finish(
            Some(serde_json::json!({"outbounds": []})),
            "abcd",
            "https://example.com/sub",
            PipelineMode::Tolerant,
            vec![PipelineError::new(
                ErrorKind::Parse,
                ErrorSeverity::Recoverable,
                "parse",
                "bad record",
            )],
        );
        assert!(partial.success);
        assert!(partial.partial_success);

        let fatal = PipelineResult::finish(
            Some(serde_json::json!({})),
            "abcd",
            "https://example.com/sub",
            PipelineMode::Strict,
            vec![PipelineError::new(
                ErrorKind::Fetch,
                ErrorSeverity::Fatal,
                "fetch",
                "boom",
            )],
        );
        assert!(!fatal.success);
        assert!(!fatal.partial_success);

        let empty = PipelineResult::finish(
            None,
            "abcd",
            "https://example.com/sub",
            PipelineMode::Tolerant,
            vec![],
        );
        assert!(!empty.success);
    }

    #[test]
    fn exclusion_add_is_idempotent() {
        let mut list = ExclusionList::default();
        let entry = ExclusionEntry {
            id_sha256: "aa".repeat(32),
            name: Some("Fast".to_string()),
            reason: None,
            added_at: None,
        };
        assert!(list.add(entry.clone()));
        assert!(!list.add(entry));
        assert_eq!(list.len(), 1);
        assert!(list.remove(&"aa".repeat(32)));
        assert!(list.is_empty());
    }

    #[test]
    fn error_severity_orders_warning_below_fatal() {
        assert!(ErrorSeverity::Warning < ErrorSeverity::Recoverable);
        assert!(ErrorSeverity::Recoverable < ErrorSeverity::Fatal);
    }

    #[test]
    fn full_profile_roundtrips_json() {
        let mut profile = FullProfile::named("home");
        profile
            .subscriptions
            .push(SubscriptionSource::from_url("main", "https://example.com/sub"));
        profile.routing.final_route = Some("auto".to_string());
        profile.middleware.push(PluginSpec::named("tag-normalize"));

        let json = serde_json::to_string_pretty(&profile).expect("serialize");
        let rt: FullProfile = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(rt, profile);
        // The `final` rename must hold on the wire.
        assert!(json.contains("\"final\": \"auto\""));
    }

    #[test]
    fn profile_metadata_tolerates_auxiliary_hashes() {
        let json = serde_json::json!({
            "app_version": "0.2.0",
            "cache_hashes": {"https://a": "ff"},
            "ruleset_hash": "beef"
        });
        let meta: ProfileMetadata = serde_json::from_value(json).expect("deserialize");
        assert_eq!(meta.cache_hashes.len(), 1);
        assert_eq!(
            meta.extra.get("ruleset_hash"),
            Some(&Value::from("beef"))
        );
        let back = serde_json::to_value(&meta).expect("serialize");
        assert_eq!(back.get("ruleset_hash"), Some(&Value::from("beef")));
    }

    #[test]
    fn ordered_sources_sorts_by_priority_and_skips_disabled() {
        let mut profile = FullProfile::named("p");
        let mut a = SubscriptionSource::from_url("a", "https://a");
        a.priority = 5;
        let mut b = SubscriptionSource::from_url("b", "https://b");
        b.priority = 1;
        let mut c = SubscriptionSource::from_url("c", "https://c");
        c.enabled = false;
        profile.subscriptions = vec![a, b, c];

        let ordered: Vec<&str> = profile
            .ordered_sources()
            .iter()
            .map(|s| s.id.as_str())
            .collect();
        assert_eq!(ordered, vec!["b", "a"]);
    }

    #[test]
    fn agent_section_defaults() {
        let agent = AgentSection::default();
        assert!(!agent.enabled);
        assert_eq!(agent.socket_path, PathBuf::from("/tmp/sboxagent.sock"));
        assert_eq!(agent.timeout, Duration::from_secs(30));
        assert_eq!(agent.heartbeat_interval, Duration::from_secs(30));
    }

    #[test]
    fn agent_section_accepts_human_readable_durations() {
        let agent: AgentSection = serde_json::from_value(serde_json::json!({
            "enabled": true,
            "timeout": "2m 30s",
            "heartbeat_interval": 1500
        }))
        .expect("deserialize");
        assert_eq!(agent.timeout, Duration::from_secs(150));
        assert_eq!(agent.heartbeat_interval, Duration::from_millis(1500));

        let err = serde_json::from_value::<AgentSection>(serde_json::json!({
            "timeout": "soonish"
        }))
        .expect_err("must reject");
        assert!(err.to_string().contains("invalid duration"));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn arb_protocol() -> impl Strategy<Value = Protocol> {
            prop_oneof![
                Just(Protocol::Vless),
                Just(Protocol::Vmess),
                Just(Protocol::Trojan),
                Just(Protocol::Shadowsocks),
                Just(Protocol::Hysteria2),
                Just(Protocol::Tuic),
                Just(Protocol::Wireguard),
                Just(Protocol::Http),
                Just(Protocol::Socks),
                Just(Protocol::Direct),
                Just(Protocol::Block),
                Just(Protocol::Dns),
                Just(Protocol::Urltest),
            ]
        }

        proptest! {
            #[test]
            fn protocol_display_parses_back(protocol in arb_protocol()) {
                let shown = protocol.to_string();
                let parsed: Protocol = shown.parse().expect("parse");
                prop_assert_eq!(parsed, protocol);
            }

            #[test]
            fn parsed_server_roundtrips(
                protocol in arb_protocol(),
                address in "[a-z0-9.]{1,20}",
                port in 1u16..,
                name in prop::option::of("[a-zA-Z0-9 -]{0,30}"),
            ) {
                let mut server = ParsedServer::new(protocol, address, port);
                if let Some(name) = name {
                    server.meta.insert("name".to_string(), Value::from(name));
                }

                let json = serde_json::to_string(&server).expect("serialize");
                let rt: ParsedServer = serde_json::from_str(&json).expect("deserialize");
                prop_assert_eq!(rt, server);
            }

            #[test]
            fn pipeline_error_roundtrips(
                stage in "[a-z_]{1,12}",
                message in "[ -~]{0,60}",
            ) {
                let err = PipelineError::new(
                    ErrorKind::Plugin,
                    ErrorSeverity::Recoverable,
                    stage,
                    message,
                );
                let json = serde_json::to_string(&err).expect("serialize");
                let rt: PipelineError = serde_json::from_str(&json).expect("deserialize");
                prop_assert_eq!(rt, err);
            }
        }
    }
}
