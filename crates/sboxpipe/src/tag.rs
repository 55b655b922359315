//! Deterministic display-tag normalization.
//!
//! Every server leaves this stage with exactly one canonical, conflict-free
//! tag. Original names stay untouched in `meta`, so downstream consumers
//! can always recover them.

use std::collections::HashMap;

use sboxpipe_types::ParsedServer;

/// Length cap on normalized tags, in characters.
pub const TAG_MAX_CHARS: usize = 64;

/// Assign a canonical tag to every server in place.
///
/// Candidate order per server: `meta.name`, `meta.tag`, the pre-existing
/// `tag` field, `<protocol>-<address>`, `<protocol>-<ordinal>`. Duplicates
/// within one invocation are disambiguated with `#2`, `#3`, … in stable
/// iteration order. Running the pass twice is a no-op.
pub fn normalize(servers: &mut [ParsedServer]) {
    let mut seen: HashMap<String, u32> = HashMap::new();

    for (ordinal, server) in servers.iter_mut().enumerate() {
        let base = candidate(server, ordinal);
        let count = seen.entry(base.clone()).or_insert(0);
        *count += 1;

        server.tag = Some(if *count == 1 {
            base
        } else {
            format!("{base}#{count}")
        });
    }
}

fn candidate(server: &ParsedServer, ordinal: usize) -> String {
    for key in ["name", "tag"] {
        if let Some(raw) = server.meta_str(key) {
            let clean = sanitize(raw);
            if !clean.is_empty() {
                return clean;
            }
        }
    }
    if let Some(existing) = &server.tag {
        // Strip a collision suffix from a previous pass so re-running
        // stays idempotent.
        let base = existing
            .rsplit_once('#')
            .filter(|(_, n)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .map(|(head, _)| head)
            .unwrap_or(existing);
        let clean = sanitize(base);
        if !clean.is_empty() {
            return clean;
        }
    }
    if !server.address.is_empty() {
        return sanitize(&format!("{}-{}", server.protocol, server.address));
    }
    format!("{}-{}", server.protocol, ordinal + 1)
}

/// Strip control characters, collapse internal whitespace, trim, and cap
/// length. Unicode is preserved.
pub fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_space = false;

    for c in raw.chars() {
        if c.is_control() {
            continue;
        }
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(c);
    }

    if out.chars().count() > TAG_MAX_CHARS {
        out = out.chars().take(TAG_MAX_CHARS).collect();
        // The cut can land on a space; a capped tag must still be clean.
        out.truncate(out.trim_end().len());
    }
    out
}

#[cfg(test)]
mod tests {
    use sboxpipe_types::Protocol;
    use serde_json::Value;

    use super::*;

    fn server(protocol: Protocol, address: &str, name: Option<&str>) -> ParsedServer {
        let mut s = ParsedServer::new(protocol, address, 443);
        if let Some(name) = name {
            s.meta.insert("name".to_string(), Value::from(name));
        }
        s
    }

    #[test]
    fn name_wins_over_other_candidates() {
        let mut servers = vec![server(Protocol::Vless, "host1", Some("Fast"))];
        normalize(&mut servers);
        assert_eq!(servers[0].tag.as_deref(), Some("Fast"));
        // Original survives in meta.
        assert_eq!(servers[0].meta_str("name"), Some("Fast"));
    }

    #[test]
    fn falls_back_to_protocol_address() {
        let mut servers = vec![server(Protocol::Trojan, "host2", None)];
        normalize(&mut servers);
        assert_eq!(servers[0].tag.as_deref(), Some("trojan-host2"));
    }

    #[test]
    fn falls_back_to_ordinal_for_addressless_servers() {
        let mut servers = vec![server(Protocol::Direct, "", None)];
        normalize(&mut servers);
        assert_eq!(servers[0].tag.as_deref(), Some("direct-1"));
    }

    #[test]
    fn collisions_get_stable_numeric_suffixes() {
        let mut servers = vec![
            server(Protocol::Vless, "a", Some("🇳🇱 NL-1")),
            server(Protocol::Trojan, "b", Some("🇳🇱 NL-1")),
            server(Protocol::Tuic, "c", Some("🇳🇱 NL-1")),
        ];
        normalize(&mut servers);
        assert_eq!(servers[0].tag.as_deref(), Some("🇳🇱 NL-1"));
        assert_eq!(servers[1].tag.as_deref(), Some("🇳🇱 NL-1#2"));
        assert_eq!(servers[2].tag.as_deref(), Some("🇳🇱 NL-1#3"));
        assert_eq!(servers[1].meta_str("name"), Some("🇳🇱 NL-1"));
    }

    #[test]
    fn normalization_is_idempotent() {
        let mut servers = vec![
            server(Protocol::Vless, "a", Some("NL")),
            server(Protocol::Trojan, "b", Some("NL")),
            server(Protocol::Shadowsocks, "c", None),
        ];
        normalize(&mut servers);
        let first: Vec<_> = servers.iter().map(|s| s.tag.clone()).collect();
        normalize(&mut servers);
        let second: Vec<_> = servers.iter().map(|s| s.tag.clone()).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn sanitize_strips_control_and_collapses_whitespace() {
        assert_eq!(sanitize("  a\u{0000}b\t \n c  "), "ab c");
        assert_eq!(sanitize("\u{0007}"), "");
    }

    #[test]
    fn sanitize_caps_length_preserving_unicode() {
        let long = "🇩🇪".repeat(100);
        let clean = sanitize(&long);
        assert_eq!(clean.chars().count(), TAG_MAX_CHARS);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn sanitize_is_idempotent(raw in "\\PC{0,100}") {
                let once = sanitize(&raw);
                let twice = sanitize(&once);
                prop_assert_eq!(once, twice);
            }

            #[test]
            fn normalized_tags_are_unique(names in proptest::collection::vec("[a-c]{0,2}", 1..20)) {
                let mut servers: Vec<ParsedServer> = names
                    .iter()
                    .map(|n| {
                        let mut s = ParsedServer::new(Protocol::Vless, "h", 1);
                        if !n.is_empty() {
                            s.meta.insert("name".to_string(), Value::from(n.clone()));
                        }
                        s
                    })
                    .collect();
                normalize(&mut servers);

                let mut tags: Vec<String> =
                    servers.iter().map(|s| s.tag.clone().expect("tag set")).collect();
                let before = tags.len();
                tags.sort();
                tags.dedup();
                prop_assert_eq!(tags.len(), before);
            }
        }
    }
}
