//! sing-box document assembly, modern and legacy syntax.
//!
//! Modern (>= 1.11) emits rule actions (`action: hijack-dns`) and omits the
//! deprecated `block`/`dns` outbounds; legacy keeps both and routes DNS
//! traffic to a `dns-out` outbound instead.

use serde_json::{Map, Value, json};

use sboxpipe_types::{
    ClientProfile, DnsMode, ExportFormat, InboundKind, ParsedServer, SingboxVariant,
};

use crate::context::PipelineContext;
use crate::route::{RouteTarget, RoutingConfig, URLTEST_TAG};

use super::{ANNOTATION_KEYS, ExportError, ExportOutcome, Exporter};

pub struct SingboxExporter {
    variant: SingboxVariant,
}

impl SingboxExporter {
    pub fn new(variant: SingboxVariant) -> Self {
        Self { variant }
    }
}

impl Exporter for SingboxExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Singbox
    }

    fn export(
        &self,
        servers: &[ParsedServer],
        routing: &RoutingConfig,
        client: &ClientProfile,
        _ctx: &PipelineContext,
    ) -> Result<ExportOutcome, ExportError> {
        let excluded: Vec<String> = client
            .exclude_outbounds
            .iter()
            .map(|t| t.to_ascii_lowercase())
            .collect();

        let mut outbounds: Vec<Value> = Vec::new();
        let mut proxy_tags: Vec<String> = Vec::new();

        for server in servers {
            if server.protocol.is_virtual() {
                continue;
            }
            if excluded.contains(&server.protocol.as_str().to_string()) {
                continue;
            }
            let outbound = outbound_for(server);
            if let Some(tag) = outbound.get("tag").and_then(Value::as_str) {
                proxy_tags.push(tag.to_string());
            }
            outbounds.push(outbound);
        }

        if outbounds.is_empty() {
            return Err(ExportError::Empty);
        }

        // The urltest group holds the surviving proxies; excluded types
        // are already gone from `proxy_tags`.
        if routing.needs_urltest && !proxy_tags.is_empty() {
            outbounds.push(json!({
                "type": "urltest",
                "tag": URLTEST_TAG,
                "outbounds": proxy_tags,
            }));
        }

        outbounds.push(json!({"type": "direct", "tag": "direct"}));
        if self.variant == SingboxVariant::Legacy {
            outbounds.push(json!({"type": "block", "tag": "block"}));
            outbounds.push(json!({"type": "dns", "tag": "dns-out"}));
        }

        let rules: Vec<Value> = routing
            .rules
            .iter()
            .map(|rule| {
                let mut obj = Map::new();
                if !rule.domain_suffix.is_empty() {
                    obj.insert("domain_suffix".to_string(), json!(rule.domain_suffix));
                }
                if !rule.ip_cidr.is_empty() {
                    obj.insert("ip_cidr".to_string(), json!(rule.ip_cidr));
                }
                if let Some(protocol) = &rule.protocol {
                    obj.insert("protocol".to_string(), Value::from(protocol.clone()));
                }
                match (&rule.target, self.variant) {
                    (RouteTarget::HijackDns, SingboxVariant::Modern) => {
                        obj.insert("action".to_string(), Value::from("hijack-dns"));
                    }
                    (RouteTarget::HijackDns, SingboxVariant::Legacy) => {
                        obj.insert("outbound".to_string(), Value::from("dns-out"));
                    }
                    (RouteTarget::Outbound(tag), _) => {
                        obj.insert("outbound".to_string(), Value::from(tag.clone()));
                    }
                }
                Value::Object(obj)
            })
            .collect();

        let mut final_outbound = routing.final_outbound.clone();
        if final_outbound == URLTEST_TAG && (!routing.needs_urltest || proxy_tags.is_empty()) {
            final_outbound = "direct".to_string();
        }

        let mut document = Map::new();
        let inbounds = inbounds_for(client);
        if !inbounds.is_empty() {
            document.insert("inbounds".to_string(), Value::Array(inbounds));
        }
        document.insert("outbounds".to_string(), Value::Array(outbounds));
        document.insert(
            "route".to_string(),
            json!({
                "auto_detect_interface": true,
                "final": final_outbound,
                "rules": rules,
            }),
        );
        if client.dns_mode == DnsMode::Tunnel {
            document.insert(
                "dns".to_string(),
                json!({
                    "servers": [{"address": "https://1.1.1.1/dns-query", "tag": "dns-remote"}],
                }),
            );
        }

        Ok(ExportOutcome {
            document: Value::Object(document),
            warnings: Vec::new(),
        })
    }
}

/// One proxy outbound. Protocol fields from `meta` pass through verbatim,
/// which is what keeps WireGuard `mtu = 0` style falsy values intact.
fn outbound_for(server: &ParsedServer) -> Value {
    let mut obj = Map::new();
    obj.insert(
        "type".to_string(),
        Value::from(server.protocol.as_str()),
    );
    let tag = server
        .tag
        .clone()
        .unwrap_or_else(|| format!("{}-{}", server.protocol, server.address));
    obj.insert("tag".to_string(), Value::from(tag));
    obj.insert("server".to_string(), Value::from(server.address.clone()));
    obj.insert("server_port".to_string(), Value::from(server.port));

    for (key, value) in &server.meta {
        if ANNOTATION_KEYS.contains(&key.as_str()) || key == "tag" {
            continue;
        }
        obj.insert(key.clone(), value.clone());
    }
    Value::Object(obj)
}

fn inbounds_for(client: &ClientProfile) -> Vec<Value> {
    client
        .inbounds
        .iter()
        .map(|inbound| match inbound.kind {
            InboundKind::Tun => json!({
                "auto_route": true,
                "tag": "tun-in",
                "type": "tun",
            }),
            InboundKind::Socks => json!({
                "listen": inbound.listen.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                "listen_port": inbound.port.unwrap_or(1080),
                "tag": "socks-in",
                "type": "socks",
            }),
            InboundKind::Http => json!({
                "listen": inbound.listen.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
                "listen_port": inbound.port.unwrap_or(8080),
                "tag": "http-in",
                "type": "http",
            }),
            InboundKind::Tproxy => json!({
                "listen": inbound.listen.clone().unwrap_or_else(|| "0.0.0.0".to_string()),
                "listen_port": inbound.port.unwrap_or(7895),
                "tag": "tproxy-in",
                "type": "tproxy",
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sboxpipe_types::{FullProfile, InboundSpec, PipelineMode, Protocol};

    use crate::route::{DefaultRouter, RoutingPlugin};

    use super::*;

    fn ctx() -> PipelineContext {
        PipelineContext::new(
            "https://example.com/sub",
            PipelineMode::Tolerant,
            Arc::new(FullProfile::named("t")),
        )
    }

    fn tagged_server(protocol: Protocol, address: &str, tag: &str) -> ParsedServer {
        let mut s = ParsedServer::new(protocol, address, 443);
        s.tag = Some(tag.to_string());
        s
    }

    fn sample_servers() -> Vec<ParsedServer> {
        vec![
            tagged_server(Protocol::Vless, "host1", "Fast")
                .with_meta("uuid", Value::from("u-1"))
                .with_meta("sni", Value::from("x")),
            tagged_server(Protocol::Trojan, "host2", "Slow")
                .with_meta("password", Value::from("pw")),
        ]
    }

    fn routing_for(servers: &[ParsedServer]) -> RoutingConfig {
        DefaultRouter.build(servers, &[], None, PipelineMode::Tolerant)
    }

    #[test]
    fn modern_export_matches_expected_shape() {
        let servers = sample_servers();
        let routing = routing_for(&servers);
        let outcome = SingboxExporter::new(SingboxVariant::Modern)
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect("export");
        let doc = outcome.document;

        let outbounds = doc["outbounds"].as_array().expect("outbounds");
        let types: Vec<&str> = outbounds
            .iter()
            .map(|o| o["type"].as_str().expect("type"))
            .collect();
        assert_eq!(types, vec!["vless", "trojan", "urltest", "direct"]);
        assert!(!types.contains(&"block"));

        let urltest = &outbounds[2];
        assert_eq!(urltest["tag"], URLTEST_TAG);
        assert_eq!(urltest["outbounds"], json!(["Fast", "Slow"]));

        assert_eq!(doc["route"]["final"], "auto");
        let rules = doc["route"]["rules"].as_array().expect("rules");
        assert_eq!(rules[0]["action"], "hijack-dns");
        assert!(rules[0].get("outbound").is_none());
    }

    #[test]
    fn legacy_export_keeps_block_and_dns_out() {
        let servers = sample_servers();
        let routing = routing_for(&servers);
        let outcome = SingboxExporter::new(SingboxVariant::Legacy)
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect("export");
        let doc = outcome.document;

        let types: Vec<&str> = doc["outbounds"]
            .as_array()
            .expect("outbounds")
            .iter()
            .map(|o| o["type"].as_str().expect("type"))
            .collect();
        assert!(types.contains(&"block"));
        assert!(types.contains(&"dns"));

        let rules = doc["route"]["rules"].as_array().expect("rules");
        assert_eq!(rules[0]["outbound"], "dns-out");
        assert!(rules[0].get("action").is_none());
    }

    #[test]
    fn excluded_types_vanish_from_outbounds_and_urltest() {
        let servers = sample_servers();
        let routing = routing_for(&servers);
        let client = ClientProfile {
            exclude_outbounds: vec!["trojan".to_string()],
            ..ClientProfile::default()
        };
        let outcome = SingboxExporter::new(SingboxVariant::Modern)
            .export(&servers, &routing, &client, &ctx())
            .expect("export");
        let doc = outcome.document;

        let rendered = doc.to_string();
        assert!(!rendered.contains("trojan"));
        let urltest = doc["outbounds"]
            .as_array()
            .expect("outbounds")
            .iter()
            .find(|o| o["type"] == "urltest")
            .expect("urltest");
        assert_eq!(urltest["outbounds"], json!(["Fast"]));
    }

    #[test]
    fn final_override_and_empty_urltest_fall_back_to_direct() {
        let servers = sample_servers();
        let mut routing = routing_for(&servers);
        routing.final_outbound = "Slow".to_string();
        let outcome = SingboxExporter::new(SingboxVariant::Modern)
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect("export");
        assert_eq!(outcome.document["route"]["final"], "Slow");

        // All proxies excluded: export fails rather than emitting an
        // empty outbound list.
        let client = ClientProfile {
            exclude_outbounds: vec!["vless".to_string(), "trojan".to_string()],
            ..ClientProfile::default()
        };
        let routing = routing_for(&servers);
        let err = SingboxExporter::new(SingboxVariant::Modern)
            .export(&servers, &routing, &client, &ctx())
            .expect_err("must fail");
        assert!(matches!(err, ExportError::Empty));
    }

    #[test]
    fn wireguard_falsy_meta_round_trips_into_outbound() {
        let server = tagged_server(Protocol::Wireguard, "wg.example", "WG")
            .with_meta("mtu", Value::from(0))
            .with_meta("keepalive", Value::from(false));
        let routing = routing_for(std::slice::from_ref(&server));
        let outcome = SingboxExporter::new(SingboxVariant::Modern)
            .export(&[server], &routing, &ClientProfile::default(), &ctx())
            .expect("export");

        let wg = &outcome.document["outbounds"][0];
        assert_eq!(wg["mtu"], json!(0));
        assert_eq!(wg["keepalive"], json!(false));
    }

    #[test]
    fn export_is_deterministic() {
        let servers = sample_servers();
        let routing = routing_for(&servers);
        let exporter = SingboxExporter::new(SingboxVariant::Modern);
        let a = exporter
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect("export");
        let b = exporter
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect("export");
        assert_eq!(a.document.to_string(), b.document.to_string());
    }

    #[test]
    fn inbounds_render_from_client_profile() {
        let servers = sample_servers();
        let routing = routing_for(&servers);
        let client = ClientProfile {
            inbounds: vec![
                InboundSpec {
                    kind: InboundKind::Tun,
                    listen: None,
                    port: None,
                },
                InboundSpec {
                    kind: InboundKind::Socks,
                    listen: Some("0.0.0.0".to_string()),
                    port: Some(7890),
                },
            ],
            ..ClientProfile::default()
        };
        let outcome = SingboxExporter::new(SingboxVariant::Modern)
            .export(&servers, &routing, &client, &ctx())
            .expect("export");

        let inbounds = outcome.document["inbounds"].as_array().expect("inbounds");
        assert_eq!(inbounds.len(), 2);
        assert_eq!(inbounds[0]["type"], "tun");
        assert_eq!(inbounds[1]["listen_port"], 7890);
    }
}
