//! Policy engine: pure per-server verdicts.
//!
//! A policy inspects one server in context and returns allow / warn / deny
//! / skip with an optional reason. Policies fail closed: an evaluation
//! error becomes a deny carrying the error text, so a broken policy can
//! never silently widen access.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use serde_json::Value;

use sboxpipe_types::{FullProfile, ParsedServer, PolicyDecision, PolicyResult, Protocol};

/// Evaluation context for one server.
pub struct PolicyContext<'a> {
    pub server: &'a ParsedServer,
    pub profile: Option<&'a FullProfile>,
    pub user: Option<&'a str>,
    /// Run-scoped metadata (content hashes, server index, totals).
    pub meta: &'a BTreeMap<String, Value>,
    /// Position of this server in the evaluated list.
    pub index: usize,
    pub total: usize,
}

/// One policy. Evaluation must be pure: same context, same verdict.
pub trait Policy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Grouping token for listings (`security`, `geo`, `limits`, …).
    fn group(&self) -> &'static str;

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult>;
}

struct PolicyEntry {
    policy: Box<dyn Policy>,
    enabled: bool,
}

/// Registry of policies with enable/disable switches.
#[derive(Default)]
pub struct PolicyEngine {
    entries: Vec<PolicyEntry>,
}

impl PolicyEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine with every built-in policy at its defaults.
    pub fn with_builtins() -> Self {
        let mut engine = Self::new();
        engine.register(Box::new(ProtocolPolicy::default()));
        engine.register(Box::new(EncryptionPolicy::default()));
        engine.register(Box::new(AuthenticationPolicy::default()));
        engine.register(Box::new(CountryPolicy::default()));
        engine.register(Box::new(GeoWarnPolicy::default()));
        engine.register(Box::new(IntegrityPolicy));
        engine.register(Box::new(PermissionPolicy::default()));
        engine.register(Box::new(LimitPolicy::default()));
        engine
    }

    pub fn register(&mut self, policy: Box<dyn Policy>) {
        self.entries.push(PolicyEntry {
            policy,
            enabled: true,
        });
    }

    pub fn enable(&mut self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    pub fn disable(&mut self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for entry in &mut self.entries {
            if entry.policy.name() == name {
                entry.enabled = enabled;
                found = true;
            }
        }
        found
    }

    /// `(name, group, enabled)` for every registered policy, optionally
    /// restricted to one group.
    pub fn list(&self, group: Option<&str>) -> Vec<(&'static str, &'static str, bool)> {
        self.entries
            .iter()
            .filter(|e| group.is_none_or(|g| e.policy.group() == g))
            .map(|e| (e.policy.name(), e.policy.group(), e.enabled))
            .collect()
    }

    /// Evaluate every enabled policy against one context. Errors fail
    /// closed into deny results.
    pub fn evaluate_all(&self, ctx: &PolicyContext) -> Vec<PolicyResult> {
        self.entries
            .iter()
            .filter(|e| e.enabled)
            .map(|e| match e.policy.evaluate(ctx) {
                Ok(result) => result,
                Err(err) => PolicyResult::deny(
                    e.policy.name(),
                    format!("policy evaluation failed: {err}"),
                ),
            })
            .collect()
    }

    /// Overall verdict: the worst decision wins (deny > warn > allow).
    pub fn verdict(results: &[PolicyResult]) -> PolicyDecision {
        if results.iter().any(|r| r.decision == PolicyDecision::Deny) {
            PolicyDecision::Deny
        } else if results.iter().any(|r| r.decision == PolicyDecision::Warn) {
            PolicyDecision::Warn
        } else {
            PolicyDecision::Allow
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMode {
    #[default]
    Whitelist,
    Blacklist,
}

/// Allowed/blocked protocols.
pub struct ProtocolPolicy {
    mode: ListMode,
    protocols: BTreeSet<Protocol>,
}

impl Default for ProtocolPolicy {
    fn default() -> Self {
        Self {
            mode: ListMode::Whitelist,
            protocols: [
                Protocol::Vless,
                Protocol::Trojan,
                Protocol::Shadowsocks,
                Protocol::Hysteria2,
                Protocol::Tuic,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl ProtocolPolicy {
    pub fn new(mode: ListMode, protocols: impl IntoIterator<Item = Protocol>) -> Self {
        Self {
            mode,
            protocols: protocols.into_iter().collect(),
        }
    }
}

impl Policy for ProtocolPolicy {
    fn name(&self) -> &'static str {
        "protocol"
    }

    fn group(&self) -> &'static str {
        "security"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult> {
        if ctx.server.protocol.is_virtual() {
            return Ok(PolicyResult::skip(self.name()));
        }
        let listed = self.protocols.contains(&ctx.server.protocol);
        let allowed = match self.mode {
            ListMode::Whitelist => listed,
            ListMode::Blacklist => !listed,
        };
        if allowed {
            Ok(PolicyResult::allow(self.name()))
        } else {
            Ok(PolicyResult::deny(
                self.name(),
                format!("protocol {} not permitted", ctx.server.protocol),
            ))
        }
    }
}

/// Weak-encryption rejection. Unknown schemes pass (forward compatibility).
pub struct EncryptionPolicy {
    strong: BTreeSet<String>,
    weak: BTreeSet<String>,
}

impl Default for EncryptionPolicy {
    fn default() -> Self {
        let strong = ["tls", "reality", "xtls", "aes-256-gcm", "chacha20-poly1305"];
        let weak = ["none", "plain", "aes-128", "rc4"];
        Self {
            strong: strong.iter().map(|s| s.to_string()).collect(),
            weak: weak.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl EncryptionPolicy {
    /// Effective encryption token of a server, from the common metadata
    /// spellings across parsers.
    fn encryption_of(server: &ParsedServer) -> Option<String> {
        for key in ["security", "encryption", "method", "cipher", "tls"] {
            match server.meta.get(key) {
                Some(Value::String(s)) if !s.is_empty() => {
                    return Some(s.to_ascii_lowercase());
                }
                Some(Value::Bool(true)) if key == "tls" => return Some("tls".to_string()),
                _ => {}
            }
        }
        None
    }
}

impl Policy for EncryptionPolicy {
    fn name(&self) -> &'static str {
        "encryption"
    }

    fn group(&self) -> &'static str {
        "security"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult> {
        if ctx.server.protocol.is_virtual() {
            return Ok(PolicyResult::skip(self.name()));
        }
        let Some(encryption) = Self::encryption_of(ctx.server) else {
            // http/socks style plaintext protocols carry no encryption at all.
            if matches!(ctx.server.protocol, Protocol::Http | Protocol::Socks) {
                return Ok(PolicyResult::deny(self.name(), "no encryption"));
            }
            return Ok(PolicyResult::allow(self.name()));
        };
        if self.weak.contains(&encryption) {
            return Ok(PolicyResult::deny(
                self.name(),
                format!("weak encryption: {encryption}"),
            ));
        }
        if self.strong.contains(&encryption) {
            return Ok(PolicyResult::allow(self.name()));
        }
        // Unknown schemes stay allowed so newer ciphers do not get
        // rejected by an old binary.
        Ok(PolicyResult::allow(self.name()))
    }
}

/// Credential presence and minimum strength.
pub struct AuthenticationPolicy {
    required: bool,
    min_credential_len: usize,
}

impl Default for AuthenticationPolicy {
    fn default() -> Self {
        Self {
            required: true,
            min_credential_len: 8,
        }
    }
}

impl Policy for AuthenticationPolicy {
    fn name(&self) -> &'static str {
        "authentication"
    }

    fn group(&self) -> &'static str {
        "security"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult> {
        if ctx.server.protocol.is_virtual() || !self.required {
            return Ok(PolicyResult::skip(self.name()));
        }
        let credential = ["password", "uuid", "psk", "private_key", "certificate"]
            .iter()
            .find_map(|key| ctx.server.meta_str(key));
        match credential {
            None => Ok(PolicyResult::deny(self.name(), "no credentials present")),
            Some(cred) if cred.len() < self.min_credential_len => Ok(PolicyResult::warn(
                self.name(),
                format!("credential shorter than {} chars", self.min_credential_len),
            )),
            Some(_) => Ok(PolicyResult::allow(self.name())),
        }
    }
}

/// Country allow/deny lists; empty lists disable the check.
#[derive(Default)]
pub struct CountryPolicy {
    allow: BTreeSet<String>,
    deny: BTreeSet<String>,
}

impl CountryPolicy {
    pub fn new(allow: Vec<String>, deny: Vec<String>) -> Self {
        Self {
            allow: allow.iter().map(|c| c.to_ascii_uppercase()).collect(),
            deny: deny.iter().map(|c| c.to_ascii_uppercase()).collect(),
        }
    }
}

impl Policy for CountryPolicy {
    fn name(&self) -> &'static str {
        "country"
    }

    fn group(&self) -> &'static str {
        "geo"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult> {
        if self.allow.is_empty() && self.deny.is_empty() {
            return Ok(PolicyResult::skip(self.name()));
        }
        let Some(country) = crate::postprocess::country_of(ctx.server) else {
            return Ok(PolicyResult::skip(self.name()));
        };
        if self.deny.contains(&country) {
            return Ok(PolicyResult::deny(
                self.name(),
                format!("country {country} is deny-listed"),
            ));
        }
        if !self.allow.is_empty() && !self.allow.contains(&country) {
            return Ok(PolicyResult::deny(
                self.name(),
                format!("country {country} not in allow list"),
            ));
        }
        Ok(PolicyResult::allow(self.name()))
    }
}

/// Warn-only geo/ASN advisories.
pub struct GeoWarnPolicy {
    warn_countries: BTreeSet<String>,
    warn_asns: BTreeSet<String>,
}

impl Default for GeoWarnPolicy {
    fn default() -> Self {
        Self {
            warn_countries: ["CN".to_string()].into_iter().collect(),
            warn_asns: BTreeSet::new(),
        }
    }
}

impl Policy for GeoWarnPolicy {
    fn name(&self) -> &'static str {
        "geo-warn"
    }

    fn group(&self) -> &'static str {
        "geo"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult> {
        if let Some(country) = crate::postprocess::country_of(ctx.server) {
            if self.warn_countries.contains(&country) {
                return Ok(PolicyResult::warn(
                    self.name(),
                    format!("country {country} is on the warn list"),
                ));
            }
        }
        if let Some(asn) = ctx.server.meta_str("asn") {
            if self.warn_asns.contains(asn) {
                return Ok(PolicyResult::warn(
                    self.name(),
                    format!("asn {asn} is on the warn list"),
                ));
            }
        }
        Ok(PolicyResult::allow(self.name()))
    }
}

/// Declared-vs-computed content hash check. Skips when either side is
/// absent.
pub struct IntegrityPolicy;

impl Policy for IntegrityPolicy {
    fn name(&self) -> &'static str {
        "integrity"
    }

    fn group(&self) -> &'static str {
        "integrity"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult> {
        let computed = ctx.meta.get("content_sha256").and_then(Value::as_str);
        let declared = ctx
            .profile
            .and_then(|p| p.metadata.cache_hashes.get(ctx.meta.get("source_url").and_then(Value::as_str).unwrap_or_default()))
            .map(String::as_str);
        match (declared, computed) {
            (Some(declared), Some(computed)) if declared != computed => Ok(PolicyResult::deny(
                self.name(),
                "subscription content hash mismatch",
            )),
            (Some(_), Some(_)) => Ok(PolicyResult::allow(self.name())),
            _ => Ok(PolicyResult::skip(self.name())),
        }
    }
}

/// User-scoped capability gate. With no requirement configured it skips.
#[derive(Default)]
pub struct PermissionPolicy {
    required_capability: Option<String>,
    granted: BTreeSet<String>,
}

impl PermissionPolicy {
    pub fn new(required: impl Into<String>, granted: impl IntoIterator<Item = String>) -> Self {
        Self {
            required_capability: Some(required.into()),
            granted: granted.into_iter().collect(),
        }
    }
}

impl Policy for PermissionPolicy {
    fn name(&self) -> &'static str {
        "permission"
    }

    fn group(&self) -> &'static str {
        "access"
    }

    fn evaluate(&self, _ctx: &PolicyContext) -> Result<PolicyResult> {
        let Some(required) = &self.required_capability else {
            return Ok(PolicyResult::skip(self.name()));
        };
        if self.granted.contains(required) {
            Ok(PolicyResult::allow(self.name()))
        } else {
            Ok(PolicyResult::deny(
                self.name(),
                format!("missing capability: {required}"),
            ))
        }
    }
}

/// Per-profile server-count cap: servers past the cap are denied, which
/// truncates the list, and the manager surfaces a warning.
pub struct LimitPolicy {
    max_servers: usize,
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self { max_servers: 1024 }
    }
}

impl LimitPolicy {
    pub fn new(max_servers: usize) -> Self {
        Self { max_servers }
    }
}

impl Policy for LimitPolicy {
    fn name(&self) -> &'static str {
        "limit"
    }

    fn group(&self) -> &'static str {
        "limits"
    }

    fn evaluate(&self, ctx: &PolicyContext) -> Result<PolicyResult> {
        if ctx.index < self.max_servers {
            Ok(PolicyResult::allow(self.name()))
        } else {
            let mut result = PolicyResult::deny(
                self.name(),
                format!("server count exceeds cap of {}", self.max_servers),
            );
            result
                .metadata
                .insert("truncated".to_string(), Value::from(true));
            Ok(result)
        }
    }
}
