//! Middleware chain: per-run transforms applied between parsing and
//! postprocessing. Order follows declaration order; each middleware
//! receives the previous output and may annotate context metadata.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

use sboxpipe_events::EventBus;
use sboxpipe_types::{ParsedServer, PluginSpec};

use crate::context::PipelineContext;
use crate::tag;

/// One step in the middleware chain. Implementations hold configuration
/// only, never per-invocation state.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn process(
        &self,
        servers: Vec<ParsedServer>,
        ctx: &mut PipelineContext,
        bus: &EventBus,
    ) -> Result<Vec<ParsedServer>>;
}

/// The default chain, in the order used in practice:
/// logging → enrichment → tag-normalize → outbound-filter → route-config.
pub fn default_chain(exclude_outbounds: Vec<String>) -> Vec<Box<dyn Middleware>> {
    vec![
        Box::new(LoggingMiddleware),
        Box::new(EnrichmentMiddleware::default()),
        Box::new(TagNormalizeMiddleware),
        Box::new(OutboundFilterMiddleware::new(exclude_outbounds)),
        Box::new(RouteConfigMiddleware),
    ]
}

/// Instantiate a middleware by profile spec name.
pub fn from_spec(spec: &PluginSpec) -> Option<Box<dyn Middleware>> {
    match spec.name.as_str() {
        "logging" => Some(Box::new(LoggingMiddleware)),
        "enrichment" => Some(Box::new(EnrichmentMiddleware::default())),
        "tag-normalize" => Some(Box::new(TagNormalizeMiddleware)),
        "outbound-filter" => {
            let exclude = spec
                .options
                .get("exclude_outbounds")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            Some(Box::new(OutboundFilterMiddleware::new(exclude)))
        }
        "route-config" => Some(Box::new(RouteConfigMiddleware)),
        _ => None,
    }
}

/// Emits chain progress events. At debug level 2+ each server contributes
/// a short identity hash, never raw credentials.
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn process(
        &self,
        servers: Vec<ParsedServer>,
        ctx: &mut PipelineContext,
        bus: &EventBus,
    ) -> Result<Vec<ParsedServer>> {
        let mut data = json!({"count": servers.len()});
        if ctx.debug_level >= 2 {
            let hashes: Vec<String> = servers
                .iter()
                .map(|s| {
                    let digest = Sha256::digest(s.identity().as_bytes());
                    hex::encode(&digest[..6])
                })
                .collect();
            data["server_hashes"] = Value::from(hashes);
        }
        bus.emit_typed("middleware.logging", "middleware", data);
        Ok(servers)
    }
}

/// Geo lookup abstraction; enrichment calls are sandboxed behind this trait
/// (no shell, no arbitrary code) and bounded by a deadline.
pub trait GeoProvider: Send + Sync {
    fn lookup(&self, server: &ParsedServer) -> Option<GeoInfo>;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Offline provider inferring the country from name tokens or the address
/// TLD. Good enough for tag-driven subscriptions; an external provider can
/// be swapped in through the same trait.
pub struct StaticGeoProvider;

impl GeoProvider for StaticGeoProvider {
    fn lookup(&self, server: &ParsedServer) -> Option<GeoInfo> {
        if let Some(name) = server.meta_str("name") {
            if let Some(code) = country_token(name) {
                return Some(GeoInfo {
                    country: Some(code),
                    ..GeoInfo::default()
                });
            }
        }
        country_from_tld(&server.address).map(|code| GeoInfo {
            country: Some(code),
            ..GeoInfo::default()
        })
    }
}

/// First standalone two-letter uppercase token, e.g. `NL` in `🇳🇱 NL-1`.
fn country_token(name: &str) -> Option<String> {
    name.split(|c: char| c.is_whitespace() || c == '-' || c == '_' || c == '|')
        .find(|t| t.len() == 2 && t.chars().all(|c| c.is_ascii_uppercase()))
        .map(str::to_string)
}

fn country_from_tld(address: &str) -> Option<String> {
    let tld = address.rsplit('.').next()?;
    if tld.len() == 2 && tld.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(tld.to_ascii_uppercase())
    } else {
        None
    }
}

/// Annotates `meta.geo` and `meta.country`. Stops early when the deadline
/// elapses; partial enrichment plus a flag is better than a stalled run.
pub struct EnrichmentMiddleware {
    provider: Box<dyn GeoProvider>,
    deadline: Duration,
}

impl Default for EnrichmentMiddleware {
    fn default() -> Self {
        Self {
            provider: Box::new(StaticGeoProvider),
            deadline: Duration::from_secs(1),
        }
    }
}

impl EnrichmentMiddleware {
    pub fn new(provider: Box<dyn GeoProvider>, deadline: Duration) -> Self {
        Self { provider, deadline }
    }
}

impl Middleware for EnrichmentMiddleware {
    fn name(&self) -> &'static str {
        "enrichment"
    }

    fn process(
        &self,
        mut servers: Vec<ParsedServer>,
        ctx: &mut PipelineContext,
        _bus: &EventBus,
    ) -> Result<Vec<ParsedServer>> {
        let started = Instant::now();
        let mut enriched = 0usize;

        for server in servers.iter_mut() {
            if started.elapsed() > self.deadline {
                ctx.set_metadata("enrichment_partial", Value::from(true));
                break;
            }
            let Some(info) = self.provider.lookup(server) else {
                continue;
            };
            let mut geo = serde_json::Map::new();
            if let Some(country) = &info.country {
                geo.insert("country".to_string(), Value::from(country.clone()));
                server
                    .meta
                    .entry("country".to_string())
                    .or_insert_with(|| Value::from(country.clone()));
            }
            if let Some(region) = &info.region {
                geo.insert("region".to_string(), Value::from(region.clone()));
            }
            if let Some(city) = &info.city {
                geo.insert("city".to_string(), Value::from(city.clone()));
            }
            server.meta.insert("geo".to_string(), Value::Object(geo));
            enriched += 1;
        }

        ctx.set_metadata("enriched_count", Value::from(enriched));
        Ok(servers)
    }
}

/// Applies the tag-normalization pass.
pub struct TagNormalizeMiddleware;

impl Middleware for TagNormalizeMiddleware {
    fn name(&self) -> &'static str {
        "tag-normalize"
    }

    fn process(
        &self,
        mut servers: Vec<ParsedServer>,
        _ctx: &mut PipelineContext,
        _bus: &EventBus,
    ) -> Result<Vec<ParsedServer>> {
        tag::normalize(&mut servers);
        Ok(servers)
    }
}

/// Drops servers whose protocol is excluded by the profile.
pub struct OutboundFilterMiddleware {
    exclude: BTreeSet<String>,
}

impl OutboundFilterMiddleware {
    pub fn new(exclude: Vec<String>) -> Self {
        Self {
            exclude: exclude.into_iter().map(|s| s.to_ascii_lowercase()).collect(),
        }
    }
}

impl Middleware for OutboundFilterMiddleware {
    fn name(&self) -> &'static str {
        "outbound-filter"
    }

    fn process(
        &self,
        servers: Vec<ParsedServer>,
        _ctx: &mut PipelineContext,
        _bus: &EventBus,
    ) -> Result<Vec<ParsedServer>> {
        if self.exclude.is_empty() {
            return Ok(servers);
        }
        Ok(servers
            .into_iter()
            .filter(|s| !self.exclude.contains(s.protocol.as_str()))
            .collect())
    }
}

/// Publishes the profile's final-route override into context metadata for
/// the routing and export stages.
pub struct RouteConfigMiddleware;

impl Middleware for RouteConfigMiddleware {
    fn name(&self) -> &'static str {
        "route-config"
    }

    fn process(
        &self,
        servers: Vec<ParsedServer>,
        ctx: &mut PipelineContext,
        _bus: &EventBus,
    ) -> Result<Vec<ParsedServer>> {
        if let Some(final_route) = ctx.profile.routing.final_route.clone() {
            ctx.set_metadata("routing_final", Value::from(final_route));
        }
        Ok(servers)
    }
}

/// Run a chain in declaration order.
pub fn run_chain(
    chain: &[Box<dyn Middleware>],
    mut servers: Vec<ParsedServer>,
    ctx: &mut PipelineContext,
    bus: &EventBus,
) -> Result<Vec<ParsedServer>> {
    for middleware in chain {
        servers = middleware.process(servers, ctx, bus)?;
    }
    Ok(servers)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sboxpipe_types::{FullProfile, PipelineMode, Protocol};

    use super::*;

    fn ctx_with_profile(profile: FullProfile) -> PipelineContext {
        PipelineContext::new("https://example.com/sub", PipelineMode::Tolerant, Arc::new(profile))
    }

    fn named_server(protocol: Protocol, address: &str, name: &str) -> ParsedServer {
        ParsedServer::new(protocol, address, 443)
            .with_meta("name", Value::from(name))
    }

    #[test]
    fn logging_emits_counts_without_secrets() {
        let mut profile = FullProfile::named("t");
        profile.ui.debug_level = 2;
        let mut ctx = ctx_with_profile(profile);
        let bus = EventBus::new();

        let servers = vec![
            named_server(Protocol::Vless, "h1", "A").with_meta("password", Value::from("sekrit")),
        ];
        LoggingMiddleware
            .process(servers, &mut ctx, &bus)
            .expect("process");

        let stats = bus.statistics();
        assert_eq!(stats.emitted("middleware.logging"), 1);
        let event = &stats.recent()[0];
        assert_eq!(event.data["count"], 1);
        let rendered = event.data.to_string();
        assert!(!rendered.contains("sekrit"));
        assert!(event.data["server_hashes"].is_array());
    }

    #[test]
    fn enrichment_annotates_country_from_name_token() {
        let mut ctx = ctx_with_profile(FullProfile::named("t"));
        let bus = EventBus::new();
        let servers = vec![named_server(Protocol::Vless, "h1", "🇳🇱 NL-1")];

        let out = EnrichmentMiddleware::default()
            .process(servers, &mut ctx, &bus)
            .expect("process");
        assert_eq!(out[0].meta["geo"]["country"], "NL");
        assert_eq!(out[0].meta_str("country"), Some("NL"));
    }

    #[test]
    fn enrichment_falls_back_to_tld() {
        let mut ctx = ctx_with_profile(FullProfile::named("t"));
        let bus = EventBus::new();
        let servers = vec![ParsedServer::new(Protocol::Trojan, "proxy.example.de", 443)];

        let out = EnrichmentMiddleware::default()
            .process(servers, &mut ctx, &bus)
            .expect("process");
        assert_eq!(out[0].meta["geo"]["country"], "DE");
    }

    #[test]
    fn enrichment_deadline_yields_partial_results() {
        struct Slow;
        impl GeoProvider for Slow {
            fn lookup(&self, _server: &ParsedServer) -> Option<GeoInfo> {
                std::thread::sleep(Duration::from_millis(30));
                Some(GeoInfo {
                    country: Some("SE".to_string()),
                    ..GeoInfo::default()
                })
            }
        }

        let mut ctx = ctx_with_profile(FullProfile::named("t"));
        let bus = EventBus::new();
        let servers: Vec<ParsedServer> = (0..10)
            .map(|i| ParsedServer::new(Protocol::Vless, format!("h{i}"), 443))
            .collect();

        let middleware = EnrichmentMiddleware::new(Box::new(Slow), Duration::from_millis(50));
        let out = middleware.process(servers, &mut ctx, &bus).expect("process");

        assert_eq!(out.len(), 10);
        let enriched = out.iter().filter(|s| s.meta.contains_key("geo")).count();
        assert!(enriched < 10, "deadline must cut enrichment short");
        assert_eq!(ctx.metadata("enrichment_partial"), Some(&Value::from(true)));
    }

    #[test]
    fn outbound_filter_drops_excluded_protocols() {
        let mut ctx = ctx_with_profile(FullProfile::named("t"));
        let bus = EventBus::new();
        let servers = vec![
            named_server(Protocol::Vless, "h1", "A"),
            named_server(Protocol::Http, "h2", "B"),
        ];

        let out = OutboundFilterMiddleware::new(vec!["http".to_string()])
            .process(servers, &mut ctx, &bus)
            .expect("process");
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].protocol, Protocol::Vless);
    }

    #[test]
    fn route_config_publishes_final_route() {
        let mut profile = FullProfile::named("t");
        profile.routing.final_route = Some("direct".to_string());
        let mut ctx = ctx_with_profile(profile);
        let bus = EventBus::new();

        RouteConfigMiddleware
            .process(Vec::new(), &mut ctx, &bus)
            .expect("process");
        assert_eq!(ctx.metadata_str("routing_final"), Some("direct"));
    }

    #[test]
    fn chain_runs_in_declaration_order() {
        let mut ctx = ctx_with_profile(FullProfile::named("t"));
        let bus = EventBus::new();
        let chain = default_chain(vec!["socks".to_string()]);

        let servers = vec![
            named_server(Protocol::Vless, "h1", "NL Fast"),
            named_server(Protocol::Socks, "h2", "drop me"),
        ];
        let out = run_chain(&chain, servers, &mut ctx, &bus).expect("run chain");

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tag.as_deref(), Some("NL Fast"));
        assert!(out[0].meta.contains_key("geo"));
    }

    #[test]
    fn from_spec_resolves_builtins() {
        assert!(from_spec(&PluginSpec::named("logging")).is_some());
        assert!(from_spec(&PluginSpec::named("tag-normalize")).is_some());
        assert!(from_spec(&PluginSpec::named("nope")).is_none());
    }
}
