//! Process-wide typed plugin registry.
//!
//! Plugins are indexed by `(kind, name)` → factory. The registry is seeded
//! with the built-ins at first use and may be extended at startup by
//! embedders; lookups after that are read-only.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use sboxpipe_types::{PluginSpec, SingboxVariant};

use crate::export::{self, Exporter};
use crate::fetch::{ApiTokenFetcher, Fetcher, FileFetcher, UrlFetcher};
use crate::middleware::{self, Middleware};
use crate::parse::{self, Parser};
use crate::policy::Policy;
use crate::postprocess::{self, PostProcessor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginKind {
    Fetcher,
    Parser,
    Middleware,
    Postprocessor,
    Policy,
    Exporter,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            PluginKind::Fetcher => "fetcher",
            PluginKind::Parser => "parser",
            PluginKind::Middleware => "middleware",
            PluginKind::Postprocessor => "postprocessor",
            PluginKind::Policy => "policy",
            PluginKind::Exporter => "exporter",
        };
        f.write_str(token)
    }
}

type FetcherFactory = Arc<dyn Fn() -> Box<dyn Fetcher> + Send + Sync>;
type ParserFactory = Arc<dyn Fn() -> Box<dyn Parser> + Send + Sync>;
type MiddlewareFactory = Arc<dyn Fn(&PluginSpec) -> Option<Box<dyn Middleware>> + Send + Sync>;
type PostprocessorFactory =
    Arc<dyn Fn(&PluginSpec) -> Option<Box<dyn PostProcessor>> + Send + Sync>;
type PolicyFactory = Arc<dyn Fn() -> Box<dyn Policy> + Send + Sync>;
type ExporterFactory = Arc<dyn Fn() -> Box<dyn Exporter> + Send + Sync>;

/// Typed `(kind, name)` → factory index.
#[derive(Default)]
pub struct PluginRegistry {
    fetchers: RwLock<HashMap<String, FetcherFactory>>,
    parsers: RwLock<HashMap<String, ParserFactory>>,
    middleware: RwLock<HashMap<String, MiddlewareFactory>>,
    postprocessors: RwLock<HashMap<String, PostprocessorFactory>>,
    policies: RwLock<HashMap<String, PolicyFactory>>,
    exporters: RwLock<HashMap<String, ExporterFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, seeded with all built-ins.
    pub fn global() -> &'static PluginRegistry {
        static GLOBAL: OnceLock<PluginRegistry> = OnceLock::new();
        GLOBAL.get_or_init(|| {
            let registry = PluginRegistry::new();
            registry.seed_builtins();
            registry
        })
    }

    /// Register every built-in plugin under its canonical name.
    pub fn seed_builtins(&self) {
        self.register_fetcher("url", || Box::new(UrlFetcher));
        self.register_fetcher("file", || Box::new(FileFetcher::unrestricted()));
        self.register_fetcher("api-token", || Box::new(ApiTokenFetcher::from_env()));

        for parser in parse::builtin_parsers() {
            let name = parser.name();
            match name {
                "base64" => self.register_parser(name, || Box::new(parse::Base64Parser)),
                "singbox" => self.register_parser(name, || Box::new(parse::SingboxParser)),
                "json" => self.register_parser(name, || Box::new(parse::JsonParser)),
                "clash" => self.register_parser(name, || Box::new(parse::ClashYamlParser)),
                "uri-list" => self.register_parser(name, || Box::new(parse::UriListParser)),
                _ => {}
            }
        }

        for name in [
            "logging",
            "enrichment",
            "tag-normalize",
            "outbound-filter",
            "route-config",
        ] {
            self.register_middleware(name, middleware::from_spec);
        }

        for name in ["geo-filter", "tag-filter", "latency-sort", "deduplicate"] {
            self.register_postprocessor(name, postprocess::from_spec);
        }

        self.register_policy("protocol", || {
            Box::new(crate::policy::ProtocolPolicy::default())
        });
        self.register_policy("encryption", || {
            Box::new(crate::policy::EncryptionPolicy::default())
        });
        self.register_policy("authentication", || {
            Box::new(crate::policy::AuthenticationPolicy::default())
        });
        self.register_policy("country", || {
            Box::new(crate::policy::CountryPolicy::default())
        });
        self.register_policy("geo-warn", || {
            Box::new(crate::policy::GeoWarnPolicy::default())
        });
        self.register_policy("integrity", || Box::new(crate::policy::IntegrityPolicy));
        self.register_policy("permission", || {
            Box::new(crate::policy::PermissionPolicy::default())
        });
        self.register_policy("limit", || Box::new(crate::policy::LimitPolicy::default()));

        self.register_exporter("singbox-modern", || {
            Box::new(export::SingboxExporter::new(SingboxVariant::Modern))
        });
        self.register_exporter("singbox-legacy", || {
            Box::new(export::SingboxExporter::new(SingboxVariant::Legacy))
        });
        self.register_exporter("clash", || Box::new(export::ClashExporter));
    }

    pub fn register_fetcher<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Fetcher> + Send + Sync + 'static,
    {
        self.fetchers
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_parser<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Parser> + Send + Sync + 'static,
    {
        self.parsers
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_middleware<F>(&self, name: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Option<Box<dyn Middleware>> + Send + Sync + 'static,
    {
        self.middleware
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_postprocessor<F>(&self, name: &str, factory: F)
    where
        F: Fn(&PluginSpec) -> Option<Box<dyn PostProcessor>> + Send + Sync + 'static,
    {
        self.postprocessors
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_policy<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Policy> + Send + Sync + 'static,
    {
        self.policies
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn register_exporter<F>(&self, name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Exporter> + Send + Sync + 'static,
    {
        self.exporters
            .write()
            .expect("registry lock poisoned")
            .insert(name.to_string(), Arc::new(factory));
    }

    pub fn fetcher(&self, name: &str) -> Option<Box<dyn Fetcher>> {
        let factory = self
            .fetchers
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()?;
        Some(factory())
    }

    pub fn parser(&self, name: &str) -> Option<Box<dyn Parser>> {
        let factory = self
            .parsers
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()?;
        Some(factory())
    }

    pub fn middleware(&self, spec: &PluginSpec) -> Option<Box<dyn Middleware>> {
        let factory = self
            .middleware
            .read()
            .expect("registry lock poisoned")
            .get(&spec.name)
            .cloned()?;
        factory(spec)
    }

    pub fn postprocessor(&self, spec: &PluginSpec) -> Option<Box<dyn PostProcessor>> {
        let factory = self
            .postprocessors
            .read()
            .expect("registry lock poisoned")
            .get(&spec.name)
            .cloned()?;
        factory(spec)
    }

    pub fn policy(&self, name: &str) -> Option<Box<dyn Policy>> {
        let factory = self
            .policies
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()?;
        Some(factory())
    }

    pub fn exporter(&self, name: &str) -> Option<Box<dyn Exporter>> {
        let factory = self
            .exporters
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()?;
        Some(factory())
    }

    /// Registered names for one kind, sorted.
    pub fn list(&self, kind: PluginKind) -> Vec<String> {
        let mut names: Vec<String> = match kind {
            PluginKind::Fetcher => self
                .fetchers
                .read()
                .expect("registry lock poisoned")
                .keys()
                .cloned()
                .collect(),
            PluginKind::Parser => self
                .parsers
                .read()
                .expect("registry lock poisoned")
                .keys()
                .cloned()
                .collect(),
            PluginKind::Middleware => self
                .middleware
                .read()
                .expect("registry lock poisoned")
                .keys()
                .cloned()
                .collect(),
            PluginKind::Postprocessor => self
                .postprocessors
                .read()
                .expect("registry lock poisoned")
                .keys()
                .cloned()
                .collect(),
            PluginKind::Policy => self
                .policies
                .read()
                .expect("registry lock poisoned")
                .keys()
                .cloned()
                .collect(),
            PluginKind::Exporter => self
                .exporters
                .read()
                .expect("registry lock poisoned")
                .keys()
                .cloned()
                .collect(),
        };
        names.sort();
        names
    }
}
