//! Clash document assembly: proxy-per-server plus proxy groups.
//!
//! Protocol adaptation is best-effort; servers Clash cannot express are
//! skipped with a warning instead of failing the export.

use serde_json::{Map, Value, json};

use sboxpipe_types::{ClientProfile, ExportFormat, ParsedServer, Protocol};

use crate::context::PipelineContext;
use crate::route::RoutingConfig;

use super::{ExportError, ExportOutcome, Exporter};

pub struct ClashExporter;

impl Exporter for ClashExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Clash
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

        let mut proxies: Vec<Value> = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();

        for server in servers {
            if server.protocol.is_virtual()
                || excluded.contains(&server.protocol.as_str().to_string())
            {
                continue;
            }
            match clash_proxy(server) {
                Some(proxy) => {
                    if let Some(name) = proxy.get("name").and_then(Value::as_str) {
                        names.push(name.to_string());
                    }
                    proxies.push(proxy);
                }
                None => warnings.push(format!(
                    "skipped {}: clash cannot express protocol {}",
                    server.tag.as_deref().unwrap_or(&server.address),
                    server.protocol
                )),
            }
        }

        if proxies.is_empty() {
            return Err(ExportError::Empty);
        }

        let final_target = if routing.final_outbound == "auto" || routing.needs_urltest {
            "auto"
        } else {
            "DIRECT"
        };

        let document = json!({
            "proxies": proxies,
            "proxy-groups": [
                {
                    "interval": 300,
                    "name": "auto",
                    "proxies": names,
                    "type": "url-test",
                    "url": "http://www.gstatic.com/generate_204",
                },
            ],
            "rules": [format!("MATCH,{final_target}")],
        });

        Ok(ExportOutcome {
            document,
            warnings,
        })
    }
}

/// Map one server into Clash proxy syntax; `None` for unsupported types.
fn clash_proxy(server: &ParsedServer) -> Option<Value> {
    let name = server
        .tag
        .clone()
        .unwrap_or_else(|| format!("{}-{}", server.protocol, server.address));

    let mut obj = Map::new();
    obj.insert("name".to_string(), Value::from(name));
    obj.insert("server".to_string(), Value::from(server.address.clone()));
    obj.insert("port".to_string(), Value::from(server.port));

    match server.protocol {
        Protocol::Shadowsocks => {
            obj.insert("type".to_string(), Value::from("ss"));
            let cipher = server
                .meta_str("method")
                .or_else(|| server.meta_str("cipher"))
                .unwrap_or("aes-256-gcm");
            obj.insert("cipher".to_string(), Value::from(cipher));
            copy_meta(server, &mut obj, &["password", "plugin"]);
        }
        Protocol::Vmess => {
            obj.insert("type".to_string(), Value::from("vmess"));
            if let Some(uuid) = server.meta_str("uuid") {
                obj.insert("uuid".to_string(), Value::from(uuid));
            }
            obj.insert(
                "alterId".to_string(),
                server.meta.get("aid").cloned().unwrap_or(Value::from(0)),
            );
            obj.insert("cipher".to_string(), Value::from("auto"));
        }
        Protocol::Vless => {
            obj.insert("type".to_string(), Value::from("vless"));
            copy_meta(server, &mut obj, &["uuid", "flow", "sni"]);
        }
        Protocol::Trojan => {
            obj.insert("type".to_string(), Value::from("trojan"));
            copy_meta(server, &mut obj, &["password", "sni"]);
        }
        Protocol::Http => {
            obj.insert("type".to_string(), Value::from("http"));
            copy_meta(server, &mut obj, &["username", "password"]);
        }
        Protocol::Socks => {
            obj.insert("type".to_string(), Value::from("socks5"));
            copy_meta(server, &mut obj, &["username", "password"]);
        }
        _ => return None,
    }
    Some(Value::Object(obj))
}

fn copy_meta(server: &ParsedServer, obj: &mut Map<String, Value>, keys: &[&str]) {
    for key in keys {
        if let Some(value) = server.meta.get(*key) {
            obj.insert((*key).to_string(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sboxpipe_types::{FullProfile, PipelineMode};

    use crate::route::{DefaultRouter, RoutingPlugin};

    use super::*;

    fn ctx() -> PipelineContext {
        PipelineContext::new(
            "https://example.com/sub",
            PipelineMode::Tolerant,
            Arc::new(FullProfile::named("t")),
        )
    }

    fn tagged(protocol: Protocol, address: &str, tag: &str) -> ParsedServer {
        let mut s = ParsedServer::new(protocol, address, 443);
        s.tag = Some(tag.to_string());
        s
    }

    #[test]
    fn supported_protocols_map_and_unsupported_warn() {
        let servers = vec![
            tagged(Protocol::Shadowsocks, "h1", "SS")
                .with_meta("method", Value::from("aes-256-gcm"))
                .with_meta("password", Value::from("pw")),
            tagged(Protocol::Tuic, "h2", "TU").with_meta("uuid", Value::from("u")),
        ];
        let routing = DefaultRouter.build(&servers, &[], None, PipelineMode::Tolerant);
        let outcome = ClashExporter
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect("export");

        let proxies = outcome.document["proxies"].as_array().expect("proxies");
        assert_eq!(proxies.len(), 1);
        assert_eq!(proxies[0]["type"], "ss");
        assert_eq!(proxies[0]["cipher"], "aes-256-gcm");

        assert_eq!(outcome.warnings.len(), 1);
        assert!(outcome.warnings[0].contains("tuic"));
    }

    #[test]
    fn url_test_group_lists_all_proxies() {
        let servers = vec![
            tagged(Protocol::Trojan, "h1", "A").with_meta("password", Value::from("pw")),
            tagged(Protocol::Vmess, "h2", "B").with_meta("uuid", Value::from("u")),
        ];
        let routing = DefaultRouter.build(&servers, &[], None, PipelineMode::Tolerant);
        let outcome = ClashExporter
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect("export");

        let group = &outcome.document["proxy-groups"][0];
        assert_eq!(group["type"], "url-test");
        assert_eq!(group["proxies"], json!(["A", "B"]));
        assert_eq!(outcome.document["rules"], json!(["MATCH,auto"]));
    }

    #[test]
    fn all_unsupported_is_an_empty_export() {
        let servers = vec![tagged(Protocol::Wireguard, "h", "WG")];
        let routing = DefaultRouter.build(&servers, &[], None, PipelineMode::Tolerant);
        let err = ClashExporter
            .export(&servers, &routing, &ClientProfile::default(), &ctx())
            .expect_err("must fail");
        assert!(matches!(err, ExportError::Empty));
    }
}
