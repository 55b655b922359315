//! Server selection: explicit index, name/tag match, or automatic.

use sboxpipe_types::ParsedServer;

/// How to pick servers from the post-policy list.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Selector {
    /// Keep every surviving server.
    #[default]
    All,
    /// Zero-based position in the list.
    Index(usize),
    /// Exact match on the canonical tag.
    Tag(String),
    /// Exact match on the original name in `meta`.
    Name(String),
    /// Policy-driven automatic pick: lowest latency when known, else all.
    Auto,
}

impl Selector {
    pub fn apply(&self, servers: &[ParsedServer]) -> Vec<ParsedServer> {
        match self {
            Selector::All => servers.to_vec(),
            Selector::Index(index) => servers.get(*index).cloned().into_iter().collect(),
            Selector::Tag(tag) => servers
                .iter()
                .filter(|s| s.tag.as_deref() == Some(tag.as_str()))
                .cloned()
                .collect(),
            Selector::Name(name) => servers
                .iter()
                .filter(|s| s.meta_str("name") == Some(name.as_str()))
                .cloned()
                .collect(),
            Selector::Auto => {
                let best = servers
                    .iter()
                    .filter(|s| s.meta_f64("latency_ms").is_some())
                    .min_by(|a, b| {
                        a.meta_f64("latency_ms")
                            .partial_cmp(&b.meta_f64("latency_ms"))
                            .unwrap_or(std::cmp::Ordering::Equal)
                    });
                match best {
                    Some(best) => vec![best.clone()],
                    None => servers.to_vec(),
                }
            }
        }
    }
}
