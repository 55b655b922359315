//! Postprocessor chain: list-level transforms applied after middleware.
//!
//! A chain couples processors with an execution mode (sequential, parallel,
//! conditional) and an error strategy (continue, fail-fast, retry). The
//! parallel mode feeds every processor the same input and merges outputs
//! deterministically in declaration order, using each processor's declared
//! merge rule.

use std::collections::BTreeSet;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde_json::{Value, json};

use sboxpipe_types::{ChainMode, ErrorStrategy, ParsedServer, PluginSpec, PostprocessSection};

use crate::context::PipelineContext;

/// How a processor's output folds into the parallel merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeRule {
    /// Filters: survivors are the intersection by server identity.
    Intersection,
    /// Enrichers: outputs are concatenated, de-duplicated by identity,
    /// enriched records replacing originals.
    Union,
}

/// One postprocessor.
pub trait PostProcessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn merge_rule(&self) -> MergeRule {
        MergeRule::Intersection
    }

    /// `Some(reason)` skips this processor in conditional mode.
    fn precondition(&self, _servers: &[ParsedServer], _ctx: &PipelineContext) -> Option<String> {
        None
    }

    fn process(&self, servers: &[ParsedServer], ctx: &PipelineContext)
    -> Result<Vec<ParsedServer>>;
}

/// Instantiate a processor from a profile spec.
pub fn from_spec(spec: &PluginSpec) -> Option<Box<dyn PostProcessor>> {
    match spec.name.as_str() {
        "geo-filter" => Some(Box::new(GeoFilter::from_spec(spec))),
        "tag-filter" => Some(Box::new(TagFilter::from_spec(spec))),
        "latency-sort" => Some(Box::new(LatencySort::from_spec(spec))),
        "deduplicate" => Some(Box::new(Deduplicate)),
        _ => None,
    }
}

/// Execution report for one processor.
#[derive(Debug, Clone)]
struct ProcessorRun {
    name: String,
    input_count: usize,
    output_count: usize,
    duration_ms: u64,
}

/// A configured chain of postprocessors.
pub struct ProcessorChain {
    processors: Vec<Box<dyn PostProcessor>>,
    mode: ChainMode,
    error_strategy: ErrorStrategy,
    max_retries: u32,
    parallel_workers: usize,
}

impl ProcessorChain {
    pub fn new(processors: Vec<Box<dyn PostProcessor>>, mode: ChainMode) -> Self {
        Self {
            processors,
            mode,
            error_strategy: ErrorStrategy::Continue,
            max_retries: 2,
            parallel_workers: 4,
        }
    }

    pub fn with_error_strategy(mut self, strategy: ErrorStrategy, max_retries: u32) -> Self {
        self.error_strategy = strategy;
        self.max_retries = max_retries;
        self
    }

    pub fn with_parallel_workers(mut self, workers: usize) -> Self {
        self.parallel_workers = workers.max(1);
        self
    }

    /// Build from a profile section, dropping unknown or disabled specs.
    pub fn from_section(section: &PostprocessSection) -> Self {
        let processors = section
            .processors
            .iter()
            .filter(|spec| spec.enabled)
            .filter_map(from_spec)
            .collect();
        Self {
            processors,
            mode: section.mode,
            error_strategy: section.error_strategy,
            max_retries: section.max_retries,
            parallel_workers: section.parallel_workers.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    /// Run the chain; collects execution metadata into the context.
    pub fn run(
        &self,
        servers: Vec<ParsedServer>,
        ctx: &mut PipelineContext,
    ) -> Result<Vec<ParsedServer>> {
        let started = Instant::now();
        let mut executed: Vec<String> = Vec::new();
        let mut failed: Vec<String> = Vec::new();
        let mut skipped: Vec<Value> = Vec::new();
        let mut runs: Vec<ProcessorRun> = Vec::new();

        let result = match self.mode {
            ChainMode::Sequential | ChainMode::Conditional => self.run_serial(
                servers,
                ctx,
                &mut executed,
                &mut failed,
                &mut skipped,
                &mut runs,
            ),
            ChainMode::Parallel => self.run_parallel(
                servers,
                ctx,
                &mut executed,
                &mut failed,
                &mut runs,
            ),
        };

        let per_processor: serde_json::Map<String, Value> = runs
            .iter()
            .map(|r| {
                (
                    r.name.clone(),
                    json!({
                        "input_count": r.input_count,
                        "output_count": r.output_count,
                        "duration_ms": r.duration_ms,
                    }),
                )
            })
            .collect();
        ctx.set_metadata(
            "postprocess",
            json!({
                "processors_executed": executed,
                "processors_failed": failed,
                "processors_skipped": skipped,
                "duration_ms": started.elapsed().as_millis() as u64,
                "per_processor": per_processor,
            }),
        );

        result
    }

    fn run_serial(
        &self,
        mut servers: Vec<ParsedServer>,
        ctx: &PipelineContext,
        executed: &mut Vec<String>,
        failed: &mut Vec<String>,
        skipped: &mut Vec<Value>,
        runs: &mut Vec<ProcessorRun>,
    ) -> Result<Vec<ParsedServer>> {
        for processor in &self.processors {
            if self.mode == ChainMode::Conditional {
                if let Some(reason) = processor.precondition(&servers, ctx) {
                    skipped.push(json!({"name": processor.name(), "reason": reason}));
                    continue;
                }
            }

            let input_count = servers.len();
            let step_started = Instant::now();
            match self.invoke(processor.as_ref(), &servers, ctx)? {
                Some(output) => {
                    runs.push(ProcessorRun {
                        name: processor.name().to_string(),
                        input_count,
                        output_count: output.len(),
                        duration_ms: step_started.elapsed().as_millis() as u64,
                    });
                    executed.push(processor.name().to_string());
                    servers = output;
                }
                None => failed.push(processor.name().to_string()),
            }
        }
        Ok(servers)
    }

    fn run_parallel(
        &self,
        servers: Vec<ParsedServer>,
        ctx: &PipelineContext,
        executed: &mut Vec<String>,
        failed: &mut Vec<String>,
        runs: &mut Vec<ProcessorRun>,
    ) -> Result<Vec<ParsedServer>> {
        let input_count = servers.len();
        let mut outputs: Vec<Option<Result<Vec<ParsedServer>>>> = Vec::new();
        for _ in &self.processors {
            outputs.push(None);
        }

        // Bounded fan-out: at most `parallel_workers` processors in flight.
        for (chunk_index, chunk) in self.processors.chunks(self.parallel_workers).enumerate() {
            let base = chunk_index * self.parallel_workers;
            let chunk_results: Vec<Result<Vec<ParsedServer>>> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|processor| {
                        let servers = &servers;
                        let ctx = &*ctx;
                        scope.spawn(move || processor.process(servers, ctx))
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("processor thread panicked")).collect()
            });
            for (offset, result) in chunk_results.into_iter().enumerate() {
                outputs[base + offset] = Some(result);
            }
        }

        // Deterministic merge in declaration order.
        let mut current = servers;
        for (processor, output) in self.processors.iter().zip(outputs) {
            let step_started = Instant::now();
            let output = match output.expect("missing processor output") {
                Ok(output) => output,
                Err(err) => match self.handle_failure(processor.as_ref(), &current, ctx, err)? {
                    Some(output) => output,
                    None => {
                        failed.push(processor.name().to_string());
                        continue;
                    }
                },
            };

            runs.push(ProcessorRun {
                name: processor.name().to_string(),
                input_count,
                output_count: output.len(),
                duration_ms: step_started.elapsed().as_millis() as u64,
            });
            executed.push(processor.name().to_string());

            match processor.merge_rule() {
                MergeRule::Intersection => {
                    let keep: BTreeSet<String> =
                        output.iter().map(ParsedServer::identity).collect();
                    current.retain(|s| keep.contains(&s.identity()));
                }
                MergeRule::Union => {
                    for server in output {
                        match current.iter_mut().find(|s| s.identity() == server.identity()) {
                            Some(slot) => *slot = server,
                            None => current.push(server),
                        }
                    }
                }
            }
        }
        Ok(current)
    }

    /// Apply the error strategy to one processor invocation.
    ///
    /// `Ok(Some(output))` is success (possibly after retries); `Ok(None)`
    /// means the failure was absorbed and the input should be kept.
    fn invoke(
        &self,
        processor: &dyn PostProcessor,
        servers: &[ParsedServer],
        ctx: &PipelineContext,
    ) -> Result<Option<Vec<ParsedServer>>> {
        match processor.process(servers, ctx) {
            Ok(output) => Ok(Some(output)),
            Err(err) => self.handle_failure(processor, servers, ctx, err),
        }
    }

    fn handle_failure(
        &self,
        processor: &dyn PostProcessor,
        servers: &[ParsedServer],
        ctx: &PipelineContext,
        err: anyhow::Error,
    ) -> Result<Option<Vec<ParsedServer>>> {
        match self.error_strategy {
            ErrorStrategy::Continue => Ok(None),
            ErrorStrategy::FailFast => {
                Err(err).with_context(|| format!("postprocessor {} failed", processor.name()))
            }
            ErrorStrategy::Retry => {
                for _ in 0..self.max_retries {
                    if let Ok(output) = processor.process(servers, ctx) {
                        return Ok(Some(output));
                    }
                }
                // Retries exhausted: absorb, keep the stage input.
                Ok(None)
            }
        }
    }
}

// --- country extraction shared by the geo filter ---

/// Country of a server, normalized to an uppercase two-letter code.
/// Extraction order: `meta.country` → `meta.geo.country` → tag-prefix
/// token → TLD of a domain address.
pub fn country_of(server: &ParsedServer) -> Option<String> {
    if let Some(code) = server.meta_str("country") {
        return normalize_country(code);
    }
    if let Some(code) = server
        .meta
        .get("geo")
        .and_then(|geo| geo.get("country"))
        .and_then(Value::as_str)
    {
        return normalize_country(code);
    }
    let tag_source = server
        .tag
        .as_deref()
        .or_else(|| server.meta_str("name"));
    if let Some(tag) = tag_source {
        let token = tag
            .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
            .find(|t| t.len() == 2 && t.chars().all(|c| c.is_ascii_alphabetic()));
        if let Some(token) = token {
            return normalize_country(token);
        }
    }
    let tld = server.address.rsplit('.').next()?;
    if tld.len() == 2 && tld.chars().all(|c| c.is_ascii_alphabetic()) {
        return normalize_country(tld);
    }
    None
}

fn normalize_country(code: &str) -> Option<String> {
    let code = code.trim();
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Some(code.to_ascii_uppercase())
    } else {
        None
    }
}

/// Behavior for servers without a resolvable country.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FallbackMode {
    #[default]
    AllowAll,
    DenyAll,
}

/// Country include/exclude filter.
pub struct GeoFilter {
    include: BTreeSet<String>,
    exclude: BTreeSet<String>,
    fallback: FallbackMode,
}

impl GeoFilter {
    pub fn new(include: Vec<String>, exclude: Vec<String>, fallback: FallbackMode) -> Self {
        Self {
            include: include.iter().map(|c| c.to_ascii_uppercase()).collect(),
            exclude: exclude.iter().map(|c| c.to_ascii_uppercase()).collect(),
            fallback,
        }
    }

    fn from_spec(spec: &PluginSpec) -> Self {
        let list = |key: &str| -> Vec<String> {
            spec.options
                .get(key)
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        let fallback = match spec.option_str("fallback_mode") {
            Some("deny_all") => FallbackMode::DenyAll,
            _ => FallbackMode::AllowAll,
        };
        Self::new(list("include"), list("exclude"), fallback)
    }
}

impl PostProcessor for GeoFilter {
    fn name(&self) -> &'static str {
        "geo-filter"
    }

    fn precondition(&self, servers: &[ParsedServer], _ctx: &PipelineContext) -> Option<String> {
        if servers.is_empty() {
            return Some("no servers to filter".to_string());
        }
        None
    }

    fn process(
        &self,
        servers: &[ParsedServer],
        _ctx: &PipelineContext,
    ) -> Result<Vec<ParsedServer>> {
        Ok(servers
            .iter()
            .filter(|server| match country_of(server) {
                Some(country) => {
                    if self.exclude.contains(&country) {
                        return false;
                    }
                    self.include.is_empty() || self.include.contains(&country)
                }
                None => self.fallback == FallbackMode::AllowAll,
            })
            .cloned()
            .collect())
    }
}

/// Tag token whitelist/blacklist filter.
pub struct TagFilter {
    whitelist: Vec<String>,
    blacklist: Vec<String>,
    case_sensitive: bool,
}

impl TagFilter {
    pub fn new(whitelist: Vec<String>, blacklist: Vec<String>, case_sensitive: bool) -> Self {
        Self {
            whitelist,
            blacklist,
            case_sensitive,
        }
    }

    fn from_spec(spec: &PluginSpec) -> Self {
        let list = |key: &str| -> Vec<String> {
            spec.options
                .get(key)
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        Self::new(
            list("whitelist"),
            list("blacklist"),
            spec.option_bool("case_sensitive").unwrap_or(false),
        )
    }

    /// Token pool: the tag itself, `meta.tags`, and the tag split on
    /// `-`, `_` and whitespace.
    fn tokens(&self, server: &ParsedServer) -> Vec<String> {
        let mut tokens: Vec<String> = Vec::new();
        let mut push = |raw: &str| {
            let token = if self.case_sensitive {
                raw.to_string()
            } else {
                raw.to_lowercase()
            };
            if !token.is_empty() && !tokens.contains(&token) {
                tokens.push(token);
            }
        };

        let tag_source = server.tag.clone().or_else(|| {
            server.meta_str("name").map(str::to_string)
        });
        if let Some(tag) = &tag_source {
            push(tag);
            for part in tag.split(|c: char| c.is_whitespace() || c == '-' || c == '_') {
                push(part);
            }
        }
        if let Some(tags) = server.meta.get("tags").and_then(Value::as_array) {
            for tag in tags.iter().filter_map(Value::as_str) {
                push(tag);
            }
        }
        tokens
    }

    fn matches(&self, candidates: &[String], needle: &str) -> bool {
        let needle = if self.case_sensitive {
            needle.to_string()
        } else {
            needle.to_lowercase()
        };
        candidates.contains(&needle)
    }
}

impl PostProcessor for TagFilter {
    fn name(&self) -> &'static str {
        "tag-filter"
    }

    fn process(
        &self,
        servers: &[ParsedServer],
        _ctx: &PipelineContext,
    ) -> Result<Vec<ParsedServer>> {
        Ok(servers
            .iter()
            .filter(|server| {
                let tokens = self.tokens(server);
                if self.blacklist.iter().any(|b| self.matches(&tokens, b)) {
                    return false;
                }
                self.whitelist.is_empty()
                    || self.whitelist.iter().any(|w| self.matches(&tokens, w))
            })
            .cloned()
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyMethod {
    /// Use `meta.latency_ms` as recorded upstream.
    #[default]
    Cached,
    /// Measure with a bounded TCP connect per server.
    Active,
}

/// Sorts by latency and flags (optionally drops) slow servers.
pub struct LatencySort {
    max_latency_ms: Option<f64>,
    remove_high_latency: bool,
    fallback_latency_ms: f64,
    method: LatencyMethod,
    probe_timeout: Duration,
}

impl Default for LatencySort {
    fn default() -> Self {
        Self {
            max_latency_ms: None,
            remove_high_latency: false,
            fallback_latency_ms: 10_000.0,
            method: LatencyMethod::Cached,
            probe_timeout: Duration::from_secs(1),
        }
    }
}

impl LatencySort {
    fn from_spec(spec: &PluginSpec) -> Self {
        let mut sort = Self::default();
        if let Some(max) = spec.options.get("max_latency_ms").and_then(Value::as_f64) {
            sort.max_latency_ms = Some(max);
        }
        if let Some(remove) = spec.option_bool("remove_high_latency") {
            sort.remove_high_latency = remove;
        }
        if let Some(fallback) = spec.options.get("fallback_latency").and_then(Value::as_f64) {
            sort.fallback_latency_ms = fallback;
        }
        if spec.option_str("method") == Some("active") {
            sort.method = LatencyMethod::Active;
        }
        sort
    }

    fn latency_of(&self, server: &ParsedServer) -> f64 {
        server
            .meta_f64("latency_ms")
            .unwrap_or(self.fallback_latency_ms)
    }

    fn probe(&self, server: &ParsedServer) -> Option<f64> {
        let addr = format!("{}:{}", server.address, server.port)
            .to_socket_addrs()
            .ok()?
            .next()?;
        let started = Instant::now();
        TcpStream::connect_timeout(&addr, self.probe_timeout).ok()?;
        Some(started.elapsed().as_secs_f64() * 1000.0)
    }
}

impl PostProcessor for LatencySort {
    fn name(&self) -> &'static str {
        "latency-sort"
    }

    fn merge_rule(&self) -> MergeRule {
        MergeRule::Union
    }

    fn precondition(&self, servers: &[ParsedServer], _ctx: &PipelineContext) -> Option<String> {
        if self.method == LatencyMethod::Cached
            && !servers.iter().any(|s| s.meta.contains_key("latency_ms"))
        {
            return Some("no latency metadata available".to_string());
        }
        None
    }

    fn process(
        &self,
        servers: &[ParsedServer],
        _ctx: &PipelineContext,
    ) -> Result<Vec<ParsedServer>> {
        let mut servers: Vec<ParsedServer> = servers.to_vec();

        if self.method == LatencyMethod::Active {
            for server in servers.iter_mut() {
                if let Some(ms) = self.probe(server) {
                    server.meta.insert("latency_ms".to_string(), Value::from(ms));
                }
            }
        }

        if let Some(max) = self.max_latency_ms {
            for server in servers.iter_mut() {
                if self.latency_of(server) > max {
                    server
                        .meta
                        .insert("high_latency".to_string(), Value::from(true));
                }
            }
            if self.remove_high_latency {
                servers.retain(|s| !s.meta.get("high_latency").and_then(Value::as_bool).unwrap_or(false));
            }
        }

        servers.sort_by(|a, b| {
            self.latency_of(a)
                .partial_cmp(&self.latency_of(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(servers)
    }
}

/// Removes identity duplicates, keeping the first (highest-priority source)
/// occurrence. The merged list arrives ordered by source priority.
pub struct Deduplicate;

impl PostProcessor for Deduplicate {
    fn name(&self) -> &'static str {
        "deduplicate"
    }

    fn precondition(&self, servers: &[ParsedServer], _ctx: &PipelineContext) -> Option<String> {
        if servers.len() < 2 {
            return Some("fewer than two servers".to_string());
        }
        None
    }

    fn process(
        &self,
        servers: &[ParsedServer],
        _ctx: &PipelineContext,
    ) -> Result<Vec<ParsedServer>> {
        let mut seen: BTreeSet<String> = BTreeSet::new();
        Ok(servers
            .iter()
            .filter(|s| seen.insert(s.identity()))
            .cloned()
            .collect())
    }
}
