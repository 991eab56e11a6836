use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use runwitness::attestation::Attestation;
use runwitness::config::WatchConfig;
use runwitness::fs_guard;
use runwitness::snapshot::MAX_STATE_BYTES;
use runwitness::vcs;
use runwitness::watcher::{StartMessage, Watcher};

const MAX_ATTESTATION_BYTES: u64 = 20 * 1024 * 1024; // 20MB
const SNAPSHOT_SUFFIX: &str = ".storage-snap.json";

#[derive(Parser)]
#[command(
    name = "runwitness",
    about = "Watch a build run and write SLSA provenance for what it produced",
    version
)]
struct Cli {
    /// WatchConfig JSON (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Snapshot stores, watch the run to completion and write the attestation
    Attest {
        /// Run specification URL (GitHub Actions run or gcb://project/build)
        spec_url: String,

        /// Artifact store URI (file://, gs://, oci://); repeatable or comma separated
        #[arg(long, value_delimiter = ',')]
        artifacts: Vec<String>,

        /// VCS locator recorded as a material (`repo-url[@commit]`)
        #[arg(long)]
        vcs_url: Option<String>,

        /// Local checkout inspected for a VCS locator when --vcs-url is absent
        #[arg(long)]
        repo_path: Option<PathBuf>,

        /// Pre-run snapshot state to diff against instead of snapshotting now
        #[arg(long)]
        snapshots: Option<PathBuf>,

        /// Attestation output path (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Attest the run in its current state without waiting for it
        #[arg(long)]
        no_watch: bool,
    },

    /// Snapshot stores and write a partial attestation with materials only
    Start {
        spec_url: String,

        #[arg(long, value_delimiter = ',')]
        artifacts: Vec<String>,

        #[arg(long)]
        vcs_url: Option<String>,

        #[arg(long)]
        repo_path: Option<PathBuf>,

        /// Partial attestation output path (stdout when omitted)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Snapshot state path (defaults to `<output>.storage-snap.json`)
        #[arg(long)]
        snapshots: Option<PathBuf>,

        /// Also write the start message payload JSON to this path
        #[arg(long)]
        pubsub_message: Option<PathBuf>,
    },

    /// Complete a partial attestation written by `start`
    Finish {
        spec_url: String,

        /// Partial attestation from `start`
        #[arg(long)]
        attestation: PathBuf,

        #[arg(long, value_delimiter = ',')]
        artifacts: Vec<String>,

        /// Snapshot state path (defaults to `<attestation>.storage-snap.json`)
        #[arg(long)]
        snapshots: Option<PathBuf>,

        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let cfg = WatchConfig::load(cli.config.as_deref())?;
    match cli.cmd {
        Cmd::Attest {
            spec_url,
            artifacts,
            vcs_url,
            repo_path,
            snapshots,
            output,
            no_watch,
        } => attest(
            &cfg,
            &spec_url,
            &artifacts,
            vcs_url,
            repo_path.as_deref(),
            snapshots.as_deref(),
            output.as_deref(),
            no_watch,
        ),
        Cmd::Start {
            spec_url,
            artifacts,
            vcs_url,
            repo_path,
            output,
            snapshots,
            pubsub_message,
        } => start(
            &cfg,
            &spec_url,
            &artifacts,
            vcs_url,
            repo_path.as_deref(),
            output.as_deref(),
            snapshots,
            pubsub_message.as_deref(),
        ),
        Cmd::Finish {
            spec_url,
            attestation,
            artifacts,
            snapshots,
            output,
        } => finish(
            &cfg,
            &spec_url,
            &attestation,
            &artifacts,
            snapshots,
            output.as_deref(),
        ),
    }
}

/// `<base>.storage-snap.json`, unless an explicit path was given.
fn snapshot_state_path(explicit: Option<PathBuf>, base: Option<&Path>) -> Option<PathBuf> {
    explicit.or_else(|| {
        base.map(|b| {
            let mut s = b.as_os_str().to_owned();
            s.push(SNAPSHOT_SUFFIX);
            PathBuf::from(s)
        })
    })
}

fn watcher_with_sources(cfg: &WatchConfig, spec_url: &str, artifacts: &[String]) -> Result<Watcher> {
    let mut w = Watcher::new(spec_url, cfg)?;
    for uri in artifacts {
        w.add_artifact_source(uri)
            .with_context(|| format!("adding artifacts source {uri}"))?;
    }
    Ok(w)
}

/// Explicit locator, else whatever the checkout at `repo_path` reports.
fn resolve_vcs_url(vcs_url: Option<String>, repo_path: Option<&Path>) -> Result<Option<String>> {
    if vcs_url.is_some() {
        return Ok(vcs_url);
    }
    match repo_path {
        Some(p) => vcs::locator_for_dir(p).context("fetching VCS URL"),
        None => Ok(None),
    }
}

fn emit(doc: &[u8], output: Option<&Path>) -> Result<()> {
    match output {
        Some(p) => {
            fs_guard::write_file(p, doc)?;
            info!(path = %p.display(), "attestation written");
        }
        None => println!("{}", String::from_utf8_lossy(doc)),
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn attest(
    cfg: &WatchConfig,
    spec_url: &str,
    artifacts: &[String],
    vcs_url: Option<String>,
    repo_path: Option<&Path>,
    snapshots: Option<&Path>,
    output: Option<&Path>,
    no_watch: bool,
) -> Result<()> {
    let mut w = watcher_with_sources(cfg, spec_url, artifacts)?;
    match snapshots {
        Some(p) => w.load_snapshots(p)?,
        None => w.snap().context("snapshotting the artifact repositories")?,
    }
    if let Some(locator) = resolve_vcs_url(vcs_url, repo_path)? {
        w.add_vcs_material(&locator);
    }

    let mut run = w.get_run(spec_url)?;
    if !no_watch {
        w.watch(&mut run)?;
    }
    let att = w.attest_run(&run)?;
    emit(&att.to_json()?, output)
}

#[allow(clippy::too_many_arguments)]
fn start(
    cfg: &WatchConfig,
    spec_url: &str,
    artifacts: &[String],
    vcs_url: Option<String>,
    repo_path: Option<&Path>,
    output: Option<&Path>,
    snapshots: Option<PathBuf>,
    pubsub_message: Option<&Path>,
) -> Result<()> {
    let mut w = watcher_with_sources(cfg, spec_url, artifacts)?;
    w.snap().context("snapshotting the artifact repositories")?;

    let state_path = snapshot_state_path(snapshots, output);
    match &state_path {
        Some(p) => w.save_snapshots(p)?,
        None if !w.stores().is_empty() => {
            warn!("not saving storage state but artifact sources defined");
        }
        None => {}
    }

    if let Some(locator) = resolve_vcs_url(vcs_url, repo_path)? {
        w.add_vcs_material(&locator);
    }
    let json = w.start_attestation().to_json()?;
    emit(&json, output)?;

    if let Some(msg_path) = pubsub_message {
        let state = match &state_path {
            Some(p) if p.exists() => Some(read_saved_state(p)?),
            _ => None,
        };
        let msg = StartMessage::new(w.builder().spec_url(), &json, state.as_deref(), artifacts);
        fs_guard::write_file(msg_path, &msg.to_json()?)?;
        info!(path = %msg_path.display(), "start message written");
    }
    Ok(())
}

/// Raw snapshot state bytes, capped like [`runwitness::snapshot::SnapshotState::load`].
fn read_saved_state(path: &Path) -> Result<Vec<u8>> {
    fs_guard::read_validated(path, MAX_STATE_BYTES)
}

fn finish(
    cfg: &WatchConfig,
    spec_url: &str,
    attestation: &Path,
    artifacts: &[String],
    snapshots: Option<PathBuf>,
    output: Option<&Path>,
) -> Result<()> {
    let raw = fs_guard::read_validated(attestation, MAX_ATTESTATION_BYTES)?;
    let partial = Attestation::from_json(&raw)
        .with_context(|| format!("reading partial attestation {}", attestation.display()))?;

    let mut w = watcher_with_sources(cfg, spec_url, artifacts)?;
    if let Some(p) = snapshot_state_path(snapshots, Some(attestation)) {
        if p.exists() {
            w.load_snapshots(&p)?;
        } else if !w.stores().is_empty() {
            warn!(path = %p.display(), "no storage state found, every artifact counts as new");
        }
    }

    let mut run = w.get_run(spec_url)?;
    w.watch(&mut run)?;
    let att = w.finish_attestation(&partial, &run)?;
    emit(&att.to_json()?, output)
}
