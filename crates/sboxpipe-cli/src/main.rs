use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use sboxpipe::exclusions::{self, ExclusionStore};
use sboxpipe::fetch::{FetchOptions, UserAgent};
use sboxpipe::manager::{PipelineOptions, SubscriptionManager};
use sboxpipe::profile::ProfileStore;
use sboxpipe::report::Reporter;
use sboxpipe::select::Selector;
use sboxpipe_types::{ExportFormat, FullProfile, PipelineMode, SubscriptionSource};

#[derive(Parser, Debug)]
#[command(name = "sboxpipe", version)]
#[command(about = "Turn proxy subscriptions into sing-box / Clash configurations")]
struct Cli {
    /// Directory for sboxpipe state (profiles, exclusions).
    #[arg(long, default_value = ".sboxpipe")]
    state_dir: PathBuf,

    /// Profile to load; falls back to the active profile, then defaults.
    #[arg(long)]
    profile: Option<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline and write the client configuration.
    Export(ExportArgs),
    /// Fetch, parse and print the discovered servers.
    List(SourceArgs),
    /// Manage the persistent exclusion list.
    Exclusions {
        #[command(subcommand)]
        cmd: ExclusionCommands,
    },
    /// Manage profiles.
    Profile {
        #[command(subcommand)]
        cmd: ProfileCommands,
    },
    /// Talk to the sboxagent supervisor.
    Agent {
        #[command(subcommand)]
        cmd: AgentCommands,
    },
}

#[derive(clap::Args, Debug)]
struct SourceArgs {
    /// Subscription URL (http, https, file) or path.
    #[arg(long)]
    url: Option<String>,

    /// Parser format override (base64, uri-list, json, clash, singbox);
    /// disables detection.
    #[arg(long)]
    format: Option<String>,

    /// HTTP timeout (e.g. 30s, 500ms).
    #[arg(long, default_value = "30s")]
    timeout: String,

    /// Custom User-Agent header.
    #[arg(long)]
    user_agent: Option<String>,

    /// Omit the User-Agent header entirely.
    #[arg(long)]
    no_user_agent: bool,

    /// Bypass the in-process fetch cache.
    #[arg(long)]
    force_reload: bool,
}

#[derive(clap::Args, Debug)]
struct ExportArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Output file for the generated configuration.
    #[arg(long, default_value = "config.json")]
    output: PathBuf,

    /// Target document family: singbox or clash. Distinct from
    /// `--format`, which picks the subscription parser.
    #[arg(long)]
    export_format: Option<String>,

    /// Failure semantics: tolerant accumulates errors, strict aborts on
    /// the first fatal one.
    #[arg(long, default_value = "tolerant")]
    mode: String,

    /// Run the full pipeline without writing any file.
    #[arg(long)]
    dry_run: bool,

    /// Pick a single server by zero-based index.
    #[arg(long)]
    index: Option<usize>,

    /// Ask the supervisor to validate the artifact after writing.
    #[arg(long)]
    with_agent_check: bool,

    /// Assume modern sing-box syntax without probing the binary.
    #[arg(long)]
    skip_version_probe: bool,
}

#[derive(Subcommand, Debug)]
enum ExclusionCommands {
    /// Exclude a server by its zero-based index in the parsed list.
    Add {
        #[command(flatten)]
        source: SourceArgs,
        #[arg(long)]
        index: usize,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Remove an exclusion by its identity hash.
    Remove {
        #[arg(long)]
        hash: String,
    },
    /// Print the exclusion list.
    List,
    /// Drop every exclusion.
    Clear,
}

#[derive(Subcommand, Debug)]
enum ProfileCommands {
    /// List profiles in the profile directory.
    List,
    /// Print one profile as JSON.
    Show { name: String },
    /// Make a profile the active one.
    Switch { name: String },
}

#[derive(Subcommand, Debug)]
enum AgentCommands {
    /// Check whether the supervisor socket answers.
    Ping,
    /// Ask the supervisor for client installation status.
    Check,
}

struct CliReporter;

impl Reporter for CliReporter {
    fn info(&mut self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&mut self, msg: &str) {
        eprintln!("[warn] {msg}");
    }

    fn error(&mut self, msg: &str) {
        eprintln!("[error] {msg}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("[error] {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    match cli.cmd {
        Commands::Export(args) => run_export(&cli.state_dir, cli.profile.as_deref(), args),
        Commands::List(args) => run_list(&cli.state_dir, cli.profile.as_deref(), args),
        Commands::Exclusions { cmd } => run_exclusions(&cli.state_dir, cli.profile.as_deref(), cmd),
        Commands::Profile { cmd } => run_profile(&cli.state_dir, cmd),
        Commands::Agent { cmd } => run_agent(&cli.state_dir, cli.profile.as_deref(), cmd),
    }
}

fn profile_store(state_dir: &PathBuf) -> ProfileStore {
    ProfileStore::new(state_dir.join("profiles"))
}

fn exclusion_store(state_dir: &PathBuf) -> ExclusionStore {
    ExclusionStore::new(state_dir.join("exclusions.json"))
}

/// Resolve the effective profile: named > active > empty default.
fn load_profile(
    state_dir: &PathBuf,
    name: Option<&str>,
    url: Option<&str>,
) -> Result<FullProfile> {
    let store = profile_store(state_dir);
    let mut profile = match name {
        Some(name) => store.load(name)?,
        None => store
            .load_active()?
            .unwrap_or_else(|| FullProfile::named("default")),
    };
    if let Some(url) = url {
        profile.subscriptions = vec![SubscriptionSource::from_url("cli", url)];
    }
    if profile.subscriptions.is_empty() {
        bail!("no subscription source: pass --url or configure the profile");
    }
    Ok(profile)
}

fn fetch_options(args: &SourceArgs) -> Result<FetchOptions> {
    let user_agent = if args.no_user_agent {
        UserAgent::Omit
    } else {
        match &args.user_agent {
            Some(ua) => UserAgent::Custom(ua.clone()),
            None => UserAgent::Default,
        }
    };
    Ok(FetchOptions {
        timeout: parse_duration(&args.timeout)?,
        user_agent,
        force_reload: args.force_reload,
        ..FetchOptions::default()
    })
}

fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s).with_context(|| format!("invalid duration: {s}"))
}

fn parse_mode(s: &str) -> Result<PipelineMode> {
    match s {
        "strict" => Ok(PipelineMode::Strict),
        "tolerant" => Ok(PipelineMode::Tolerant),
        other => bail!("unknown mode: {other} (expected strict or tolerant)"),
    }
}

fn run_export(state_dir: &PathBuf, profile_name: Option<&str>, args: ExportArgs) -> Result<u8> {
    let mut profile = load_profile(state_dir, profile_name, args.source.url.as_deref())?;
    if let Some(format) = &args.export_format {
        profile.export.format = match format.as_str() {
            "singbox" | "sing-box" => ExportFormat::Singbox,
            "clash" => ExportFormat::Clash,
            other => bail!("unknown export format: {other}"),
        };
    }

    let manager =
        SubscriptionManager::new(profile).with_exclusion_store(exclusion_store(state_dir));
    let opts = PipelineOptions {
        mode: parse_mode(&args.mode)?,
        format_override: args.source.format.clone(),
        fetch: fetch_options(&args.source)?,
        dry_run: args.dry_run,
        selector: match args.index {
            Some(index) => Selector::Index(index),
            None => Selector::All,
        },
        with_agent_check: args.with_agent_check,
        skip_version_probe: args.skip_version_probe,
        output_file: Some(args.output.clone()),
        ..PipelineOptions::default()
    };

    let mut reporter = CliReporter;
    let result = manager.run(&opts, &mut reporter);

    if result.partial_success {
        eprintln!(
            "partial success: artifact written with {} recoverable error(s)",
            result.errors.len()
        );
    }
    if result.success {
        if !args.dry_run {
            println!("exported {}", args.output.display());
        }
        return Ok(0);
    }

    for error in &result.errors {
        eprintln!("[{:?}/{:?}] {}: {}", error.kind, error.severity, error.stage, error.message);
    }
    Ok(1)
}

fn parse_servers(
    state_dir: &PathBuf,
    profile_name: Option<&str>,
    args: &SourceArgs,
) -> Result<Vec<sboxpipe_types::ParsedServer>> {
    let profile = load_profile(state_dir, profile_name, args.url.as_deref())?;
    let manager = SubscriptionManager::new(profile);
    let opts = PipelineOptions {
        format_override: args.format.clone(),
        fetch: fetch_options(args)?,
        dry_run: true,
        ..PipelineOptions::default()
    };

    let mut reporter = CliReporter;
    let result = manager.run(&opts, &mut reporter);
    if !result.success {
        bail!("no servers discovered (see errors above)");
    }

    // Re-derive the displayed list from the artifact's outbounds.
    let doc = result.artifact.context("missing artifact")?;
    let outbounds = doc
        .get("outbounds")
        .and_then(serde_json::Value::as_array)
        .cloned()
        .unwrap_or_default();
    let mut servers = Vec::new();
    for outbound in &outbounds {
        let Some(map) = outbound.as_object() else {
            continue;
        };
        if let Ok(server) = sboxpipe::parse::server_from_map(map) {
            if !server.protocol.is_virtual() {
                let mut server = server;
                server.tag = map
                    .get("tag")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string);
                servers.push(server);
            }
        }
    }
    Ok(servers)
}

fn run_list(state_dir: &PathBuf, profile_name: Option<&str>, args: SourceArgs) -> Result<u8> {
    let servers = parse_servers(state_dir, profile_name, &args)?;
    for (index, server) in servers.iter().enumerate() {
        println!(
            "{:>3}. {} {}:{} [{}]",
            index,
            server.tag.as_deref().unwrap_or("-"),
            server.address,
            server.port,
            server.protocol
        );
    }
    Ok(0)
}

fn run_exclusions(
    state_dir: &PathBuf,
    profile_name: Option<&str>,
    cmd: ExclusionCommands,
) -> Result<u8> {
    let store = exclusion_store(state_dir);
    match cmd {
        ExclusionCommands::Add {
            source,
            index,
            reason,
        } => {
            let servers = parse_servers(state_dir, profile_name, &source)?;
            let server = servers
                .get(index)
                .with_context(|| format!("no server at index {index}"))?;
            let changed = store.add(exclusions::entry_for(server, reason))?;
            if changed {
                println!("excluded {}", server.tag.as_deref().unwrap_or(&server.address));
            } else {
                println!("already excluded");
            }
        }
        ExclusionCommands::Remove { hash } => {
            if store.remove(&hash)? {
                println!("removed {hash}");
            } else {
                println!("not present");
            }
        }
        ExclusionCommands::List => {
            let (list, reset) = store.load()?;
            if reset {
                eprintln!("[warn] exclusions file was corrupt; reset to empty");
            }
            for entry in &list.entries {
                println!(
                    "{} {}",
                    entry.id_sha256,
                    entry.name.as_deref().unwrap_or("-")
                );
            }
        }
        ExclusionCommands::Clear => {
            store.clear()?;
            println!("exclusions cleared");
        }
    }
    Ok(0)
}

fn run_profile(state_dir: &PathBuf, cmd: ProfileCommands) -> Result<u8> {
    let store = profile_store(state_dir);
    match cmd {
        ProfileCommands::List => {
            let active = store.active()?;
            for name in store.list()? {
                let marker = if active.as_deref() == Some(name.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {name}");
            }
        }
        ProfileCommands::Show { name } => {
            let profile = store.load(&name)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&profile).context("failed to render profile")?
            );
        }
        ProfileCommands::Switch { name } => {
            let record = store.switch(&name)?;
            println!("switched to {} ({})", record.to, &record.content_hash[..12]);
        }
    }
    Ok(0)
}

fn run_agent(
    state_dir: &PathBuf,
    profile_name: Option<&str>,
    cmd: AgentCommands,
) -> Result<u8> {
    let profile = match profile_name {
        Some(name) => profile_store(state_dir).load(name)?,
        None => profile_store(state_dir)
            .load_active()?
            .unwrap_or_else(|| FullProfile::named("default")),
    };
    let client = sboxpipe_agent::AgentClient::new(
        profile.agent.socket_path.clone(),
        profile.agent.timeout,
    );

    match cmd {
        AgentCommands::Ping => {
            if client.ping() {
                println!("agent: ok");
                Ok(0)
            } else {
                eprintln!("[warn] agent not available at {}", client.socket_path().display());
                Ok(1)
            }
        }
        AgentCommands::Check => match client.check(Some("sing-box")) {
            Ok(response) => {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&response)
                        .context("failed to render response")?
                );
                Ok(0)
            }
            Err(err) => {
                eprintln!("[warn] agent check failed: {err}");
                Ok(1)
            }
        },
    }
}
