//! Subscription parsers.
//!
//! Each parser is a pure function of bytes. Parsers preserve the upstream
//! `name`/`tag` fields verbatim in `meta` and never assign the canonical
//! `tag`; that is the tag-normalization stage's job. Per-record failures
//! are collected, not propagated: a subscription with one broken entry
//! still yields the rest.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde_json::{Map, Value};
use thiserror::Error;

use sboxpipe_types::{ParsedServer, Protocol};

pub mod uri;

pub use uri::UriListParser;

/// Parsed servers plus the records that failed.
#[derive(Debug, Default)]
pub struct ParseOutcome {
    pub servers: Vec<ParsedServer>,
    pub record_errors: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unrecognized subscription format")]
    Unrecognized,
}

/// A subscription format parser.
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    fn supported_formats(&self) -> &'static [&'static str];

    /// Probability in `[0, 1]` that `prefix` is this parser's format.
    fn detect(&self, prefix: &[u8]) -> f32;

    fn parse(&self, data: &[u8]) -> Result<ParseOutcome, ParseError>;
}

/// All built-in parsers, in detection-ladder order:
/// base64 → singbox/json/yaml(clash) → uri-list.
pub fn builtin_parsers() -> Vec<Box<dyn Parser>> {
    vec![
        Box::new(Base64Parser),
        Box::new(SingboxParser),
        Box::new(JsonParser),
        Box::new(ClashYamlParser),
        Box::new(UriListParser),
    ]
}

/// Resolve a `--format` override.
pub fn parser_by_format(format: &str) -> Option<Box<dyn Parser>> {
    builtin_parsers()
        .into_iter()
        .find(|p| p.supported_formats().contains(&format))
}

/// Pick the most probable parser; ties go to ladder order.
pub fn detect_parser(data: &[u8]) -> Option<Box<dyn Parser>> {
    let prefix = &data[..data.len().min(4096)];
    let mut best: Option<(f32, Box<dyn Parser>)> = None;
    for parser in builtin_parsers() {
        let p = parser.detect(prefix);
        if p <= 0.0 {
            continue;
        }
        match &best {
            Some((best_p, _)) if *best_p >= p => {}
            _ => best = Some((p, parser)),
        }
    }
    best.map(|(_, parser)| parser)
}

/// Detect and parse in one step.
pub fn parse_auto(data: &[u8]) -> Result<ParseOutcome, ParseError> {
    let parser = detect_parser(data).ok_or(ParseError::Unrecognized)?;
    parser.parse(data)
}

// --- base64 ---

/// Decodes the whole body, then delegates to the best parser for the
/// decoded content. Nested base64 is followed a bounded number of times.
pub struct Base64Parser;

const MAX_BASE64_DEPTH: u32 = 3;

impl Parser for Base64Parser {
    fn name(&self) -> &'static str {
        "base64"
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["base64"]
    }

    fn detect(&self, prefix: &[u8]) -> f32 {
        let Ok(text) = std::str::from_utf8(prefix) else {
            return 0.0;
        };
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return 0.0;
        }
        let alphabet_clean = trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+/=_-\r\n".contains(c));
        if alphabet_clean { 0.85 } else { 0.0 }
    }

    fn parse(&self, data: &[u8]) -> Result<ParseOutcome, ParseError> {
        parse_base64(data, 0)
    }
}

fn parse_base64(data: &[u8], depth: u32) -> Result<ParseOutcome, ParseError> {
    if depth >= MAX_BASE64_DEPTH {
        return Err(ParseError::Syntax("base64 nesting too deep".to_string()));
    }
    let text: String = std::str::from_utf8(data)
        .map_err(|e| ParseError::Syntax(format!("invalid utf-8: {e}")))?
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    let decoded = decode_base64(&text)
        .ok_or_else(|| ParseError::Syntax("not valid base64".to_string()))?;

    // Delegate; a decoded body that still looks like base64 recurses.
    let parser = detect_parser(&decoded).ok_or(ParseError::Unrecognized)?;
    if parser.name() == "base64" {
        parse_base64(&decoded, depth + 1)
    } else {
        parser.parse(&decoded)
    }
}

fn decode_base64(text: &str) -> Option<Vec<u8>> {
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(decoded) = engine.decode(text) {
            return Some(decoded);
        }
    }
    None
}

// --- structured formats ---

/// Generic JSON: proxies from a top-level array or a nested array under a
/// conventional key.
pub struct JsonParser;

impl Parser for JsonParser {
    fn name(&self) -> &'static str {
        "json"
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["json"]
    }

    fn detect(&self, prefix: &[u8]) -> f32 {
        let Ok(text) = std::str::from_utf8(prefix) else {
            return 0.0;
        };
        match text.trim_start().as_bytes().first() {
            Some(b'{') | Some(b'[') => 0.6,
            _ => 0.0,
        }
    }

    fn parse(&self, data: &[u8]) -> Result<ParseOutcome, ParseError> {
        let doc: Value = tolerant_json(
            std::str::from_utf8(data)
                .map_err(|e| ParseError::Syntax(format!("invalid utf-8: {e}")))?,
        )
        .map_err(ParseError::Syntax)?;

        let records = extract_records(&doc)
            .ok_or_else(|| ParseError::Syntax("no server array found".to_string()))?;
        Ok(records_to_outcome(records))
    }
}

/// sing-box native configuration: `outbounds[]`.
pub struct SingboxParser;

impl Parser for SingboxParser {
    fn name(&self) -> &'static str {
        "singbox"
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["singbox", "sing-box"]
    }

    fn detect(&self, prefix: &[u8]) -> f32 {
        let Ok(text) = std::str::from_utf8(prefix) else {
            return 0.0;
        };
        let trimmed = text.trim_start();
        if trimmed.starts_with('{') && trimmed.contains("\"outbounds\"") {
            0.95
        } else {
            0.0
        }
    }

    fn parse(&self, data: &[u8]) -> Result<ParseOutcome, ParseError> {
        let doc: Value = tolerant_json(
            std::str::from_utf8(data)
                .map_err(|e| ParseError::Syntax(format!("invalid utf-8: {e}")))?,
        )
        .map_err(ParseError::Syntax)?;

        let outbounds = doc
            .get("outbounds")
            .and_then(Value::as_array)
            .ok_or_else(|| ParseError::Syntax("missing outbounds array".to_string()))?;
        Ok(records_to_outcome(outbounds))
    }
}

/// Clash YAML: `proxies:` list.
pub struct ClashYamlParser;

impl Parser for ClashYamlParser {
    fn name(&self) -> &'static str {
        "clash"
    }

    fn supported_formats(&self) -> &'static [&'static str] {
        &["clash", "yaml"]
    }

    fn detect(&self, prefix: &[u8]) -> f32 {
        let Ok(text) = std::str::from_utf8(prefix) else {
            return 0.0;
        };
        if text.contains("proxies:") { 0.9 } else { 0.0 }
    }

    fn parse(&self, data: &[u8]) -> Result<ParseOutcome, ParseError> {
        let doc: serde_yaml::Value = serde_yaml::from_slice(data)
            .map_err(|e| ParseError::Syntax(format!("invalid yaml: {e}")))?;
        let proxies = doc
            .get("proxies")
            .ok_or_else(|| ParseError::Syntax("missing proxies list".to_string()))?;
        let proxies_json: Value = serde_json::to_value(proxies)
            .map_err(|e| ParseError::Syntax(format!("yaml conversion: {e}")))?;
        let records = proxies_json
            .as_array()
            .ok_or_else(|| ParseError::Syntax("proxies is not a list".to_string()))?;
        Ok(records_to_outcome(records))
    }
}

fn records_to_outcome(records: &[Value]) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    for (index, record) in records.iter().enumerate() {
        match record.as_object().ok_or("record is not an object".to_string()) {
            Ok(map) => match server_from_map(map) {
                Ok(server) => outcome.servers.push(server),
                Err(err) => outcome.record_errors.push(format!("record {index}: {err}")),
            },
            Err(err) => outcome.record_errors.push(format!("record {index}: {err}")),
        }
    }
    outcome
}

fn extract_records(doc: &Value) -> Option<&Vec<Value>> {
    if let Some(array) = doc.as_array() {
        return Some(array);
    }
    let obj = doc.as_object()?;
    for key in ["servers", "proxies", "outbounds"] {
        if let Some(array) = obj.get(key).and_then(Value::as_array) {
            return Some(array);
        }
    }
    // Fall back to the first array-of-objects value.
    obj.values()
        .filter_map(Value::as_array)
        .find(|a| a.iter().all(Value::is_object) && !a.is_empty())
}

/// Build a server from one structured record, preserving every original
/// field in `meta`, including falsy values.
pub fn server_from_map(map: &Map<String, Value>) -> Result<ParsedServer, String> {
    let protocol_token = map
        .get("type")
        .or_else(|| map.get("protocol"))
        .and_then(Value::as_str)
        .ok_or("missing protocol field")?;
    let protocol: Protocol = protocol_token.parse()?;

    let address = map
        .get("server")
        .or_else(|| map.get("address"))
        .or_else(|| map.get("add"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let port = map
        .get("port")
        .or_else(|| map.get("server_port"))
        .map(value_as_port)
        .transpose()?
        .unwrap_or(0);

    if !protocol.is_virtual() {
        if address.is_empty() {
            return Err("missing server address".to_string());
        }
        if port == 0 {
            return Err("missing or zero port".to_string());
        }
    }

    let mut server = ParsedServer::new(protocol, address, port);
    for (key, value) in map {
        if matches!(
            key.as_str(),
            "type" | "protocol" | "server" | "address" | "add" | "port" | "server_port"
        ) {
            continue;
        }
        server.meta.insert(key.clone(), value.clone());
    }
    // vmess spells the display name `ps`; surface it uniformly.
    if !server.meta.contains_key("name") {
        if let Some(ps) = map.get("ps").cloned() {
            server.meta.insert("name".to_string(), ps);
        }
    }
    Ok(server)
}

fn value_as_port(value: &Value) -> Result<u16, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| format!("port out of range: {n}")),
        Value::String(s) => s.parse::<u16>().map_err(|_| format!("invalid port: {s}")),
        other => Err(format!("invalid port value: {other}")),
    }
}

/// Parse JSON that tolerates `//` and `/* */` comments plus trailing
/// commas, and strips `_comment` keys. Common in hand-edited vmess links.
pub fn tolerant_json(text: &str) -> Result<Value, String> {
    let cleaned = strip_json_noise(text);
    let mut value: Value =
        serde_json::from_str(&cleaned).map_err(|e| format!("invalid json: {e}"))?;
    drop_comment_keys(&mut value);
    Ok(value)
}

fn strip_json_noise(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();

    // Pass 1: drop comments, string-aware.
    let mut no_comments: Vec<char> = Vec::with_capacity(chars.len());
    let mut i = 0;
    let mut in_string = false;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            no_comments.push(c);
            if c == '\\' && i + 1 < chars.len() {
                no_comments.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                no_comments.push(c);
                i += 1;
            }
            '/' if chars.get(i + 1) == Some(&'/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if chars.get(i + 1) == Some(&'*') => {
                i += 2;
                while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                    i += 1;
                }
                i = (i + 2).min(chars.len());
            }
            _ => {
                no_comments.push(c);
                i += 1;
            }
        }
    }

    // Pass 2: drop commas whose next significant char closes a scope.
    let mut out = String::with_capacity(no_comments.len());
    let mut i = 0;
    let mut in_string = false;
    while i < no_comments.len() {
        let c = no_comments[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < no_comments.len() {
                out.push(no_comments[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                out.push(c);
            }
            ',' => {
                let mut j = i + 1;
                while j < no_comments.len() && no_comments[j].is_whitespace() {
                    j += 1;
                }
                match no_comments.get(j) {
                    Some('}') | Some(']') => {}
                    _ => out.push(','),
                }
            }
            _ => out.push(c),
        }
        i += 1;
    }
    out
}

fn drop_comment_keys(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|key, _| !key.starts_with("_comment"));
            for v in map.values_mut() {
                drop_comment_keys(v);
            }
        }
        Value::Array(items) => {
            for item in items {
                drop_comment_keys(item);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detection_prefers_singbox_over_generic_json() {
        let body = br#"{"outbounds": [{"type": "direct", "tag": "direct"}]}"#;
        let parser = detect_parser(body).expect("detect");
        assert_eq!(parser.name(), "singbox");
    }

    #[test]
    fn detection_finds_clash_yaml() {
        let body = b"proxies:\n  - name: a\n    type: ss\n    server: h\n    port: 443\n";
        let parser = detect_parser(body).expect("detect");
        assert_eq!(parser.name(), "clash");
    }

    #[test]
    fn detection_finds_uri_list() {
        let body = b"vless://uuid@host:443#Fast\n";
        let parser = detect_parser(body).expect("detect");
        assert_eq!(parser.name(), "uri-list");
    }

    #[test]
    fn detection_finds_base64() {
        let body = base64::engine::general_purpose::STANDARD
            .encode("trojan://pw@host:443#Slow\n");
        let parser = detect_parser(body.as_bytes()).expect("detect");
        assert_eq!(parser.name(), "base64");
    }

    #[test]
    fn format_override_resolves_parsers() {
        assert_eq!(parser_by_format("clash").expect("clash").name(), "clash");
        assert_eq!(
            parser_by_format("sing-box").expect("singbox").name(),
            "singbox"
        );
        assert!(parser_by_format("msgpack").is_none());
    }

    #[test]
    fn base64_delegates_to_inner_format() {
        let inner = "vless://7f9c81c5-0de5-4c66-8a5f-5c5277f1b9e8@host1:443?sni=x#Fast\n";
        let body = base64::engine::general_purpose::STANDARD.encode(inner);

        let outcome = parse_auto(body.as_bytes()).expect("parse");
        assert_eq!(outcome.servers.len(), 1);
        assert_eq!(outcome.servers[0].protocol, Protocol::Vless);
        assert_eq!(outcome.servers[0].address, "host1");
    }

    #[test]
    fn singbox_parser_extracts_outbounds_preserving_tag_in_meta() {
        let body = br#"{
            "outbounds": [
                {"type": "vless", "tag": "Fast", "server": "host1", "server_port": 443,
                 "uuid": "u", "tls": {"enabled": true, "server_name": "x"}},
                {"type": "direct", "tag": "direct"}
            ]
        }"#;
        let outcome = SingboxParser.parse(body).expect("parse");
        assert_eq!(outcome.servers.len(), 2);
        let vless = &outcome.servers[0];
        assert_eq!(vless.port, 443);
        // Parsers never assign the canonical tag field.
        assert_eq!(vless.tag, None);
        assert_eq!(vless.meta_str("tag"), Some("Fast"));
        assert!(vless.meta.contains_key("tls"));
    }

    #[test]
    fn clash_parser_extracts_proxies() {
        let body = b"proxies:\n  - name: NL-1\n    type: ss\n    server: h1\n    port: 8388\n    cipher: aes-256-gcm\n    password: pw\n";
        let outcome = ClashYamlParser.parse(body).expect("parse");
        assert_eq!(outcome.servers.len(), 1);
        let server = &outcome.servers[0];
        assert_eq!(server.protocol, Protocol::Shadowsocks);
        assert_eq!(server.address, "h1");
        assert_eq!(server.meta_str("name"), Some("NL-1"));
        assert_eq!(server.meta_str("cipher"), Some("aes-256-gcm"));
    }

    #[test]
    fn json_parser_handles_nested_arrays_and_collects_record_errors() {
        let body = br#"{"servers": [
            {"type": "trojan", "server": "h1", "port": 443, "password": "pw"},
            {"type": "nonsense", "server": "h2", "port": 443},
            {"type": "vless", "server": "", "port": 443}
        ]}"#;
        let outcome = JsonParser.parse(body).expect("parse");
        assert_eq!(outcome.servers.len(), 1);
        assert_eq!(outcome.record_errors.len(), 2);
        assert!(outcome.record_errors[0].contains("record 1"));
    }

    #[test]
    fn wireguard_falsy_fields_survive_parsing() {
        let body = br#"[{"type": "wireguard", "server": "wg.example", "port": 51820,
                         "mtu": 0, "keepalive": false, "private_key": "k"}]"#;
        let outcome = JsonParser.parse(body).expect("parse");
        let server = &outcome.servers[0];
        assert_eq!(server.meta.get("mtu"), Some(&Value::from(0)));
        assert_eq!(server.meta.get("keepalive"), Some(&Value::from(false)));
    }

    #[test]
    fn tolerant_json_strips_comments_and_trailing_commas() {
        let text = r#"{
            // display name
            "ps": "Fast",
            "_comment": "ignore me",
            "add": "host1", /* endpoint */
            "port": "443",
        }"#;
        let value = tolerant_json(text).expect("parse");
        assert_eq!(value["ps"], "Fast");
        assert_eq!(value["add"], "host1");
        assert!(value.get("_comment").is_none());
    }

    #[test]
    fn tolerant_json_leaves_string_contents_alone() {
        let value = tolerant_json(r#"{"path": "/a//b", "x": "1,"}"#).expect("parse");
        assert_eq!(value["path"], "/a//b");
        assert_eq!(value["x"], "1,");
    }

    #[test]
    fn port_accepts_numbers_and_numeric_strings() {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::from("trojan"));
        map.insert("server".to_string(), Value::from("h"));
        map.insert("port".to_string(), Value::from("8443"));
        map.insert("password".to_string(), Value::from("pw"));
        let server = server_from_map(&map).expect("server");
        assert_eq!(server.port, 8443);

        map.insert("port".to_string(), Value::from(70000));
        assert!(server_from_map(&map).is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn strip_json_noise_preserves_valid_json(
                key in "[a-m]{1,8}",
                value in "[a-zA-Z0-9 ]{0,20}",
                number in 0u32..100000,
            ) {
                let text = format!("{{\"{key}\": \"{value}\", \"n\": {number}}}");
                let parsed = tolerant_json(&text).expect("parse");
                prop_assert_eq!(parsed[&key].as_str().expect("str"), value.as_str());
                prop_assert_eq!(parsed["n"].as_u64().expect("num"), u64::from(number));
            }

            #[test]
            fn base64_detection_never_claims_uri_lists(host in "[a-z0-9.]{1,20}") {
                let line = format!("trojan://pw@{host}:443#x");
                prop_assert_eq!(Base64Parser.detect(line.as_bytes()), 0.0);
            }
        }
    }
}
