use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use drift_core::codec;
use drift_core::content_store::ContentStore;
use drift_core::paths::{default_settings_path, DataLayout};
use drift_core::settings::ServiceSettings;
use drift_core::snapshot::{CancelToken, FsWalker, Snapshotter};
use drift_core::store::FsChangeSetStore;
use drift_service::agent::{AgentStateStore, DriftAgent};
use drift_service::journal::IngestJournal;
use drift_service::scheduler::spawn_scheduler;
use drift_service::server::SyncServer;
use drift_service::transport::LocalTransport;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drift detection and change-set service", long_about = None)]
struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides the data directory from the settings file
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Scan all definitions (or one) once
    Scan {
        #[arg(long)]
        definition: Option<String>,
        /// Send a coverage change-set as the new replay anchor
        #[arg(long)]
        rebaseline: bool,
    },
    /// Run the scan scheduler until interrupted
    Run,
    /// Print the reconstructed state of a definition
    State {
        definition: String,
        /// Version to reconstruct; latest when omitted
        #[arg(long)]
        version: Option<u32>,
        /// Print the net change since this version instead
        #[arg(long)]
        since: Option<u32>,
    },
    /// List the stored versions of a definition
    History { definition: String },
    /// Parse a change-set file and print it as JSON
    Decode { file: PathBuf },
    /// Delete every change-set of a definition
    Purge { definition: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();

    if let Commands::Decode { file } = &cli.command {
        return decode_command(file);
    }

    let settings = load_settings(cli.config, cli.data_dir)?;
    let runtime = Runtime::build(settings)?;
    match cli.command {
        Commands::Scan {
            definition,
            rebaseline,
        } => runtime.scan_command(definition, rebaseline).await,
        Commands::Run => runtime.run_command().await,
        Commands::State {
            definition,
            version,
            since,
        } => runtime.state_command(&definition, version, since),
        Commands::History { definition } => runtime.history_command(&definition),
        Commands::Purge { definition } => runtime.purge_command(&definition),
        Commands::Decode { .. } => Ok(()),
    }
}

fn load_settings(config: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<ServiceSettings> {
    let path = match config {
        Some(path) => path,
        None => default_settings_path()?,
    };
    let mut settings = if path.exists() {
        ServiceSettings::load(&path).with_context(|| format!("load {}", path.display()))?
    } else {
        warn!(path = %path.display(), "settings file missing, using defaults");
        ServiceSettings::default()
    };
    if data_dir.is_some() {
        settings.data_dir = data_dir;
    }
    Ok(settings)
}

fn decode_command(file: &Path) -> Result<()> {
    let reader = BufReader::new(File::open(file).with_context(|| format!("open {}", file.display()))?);
    let change_set = codec::read_change_set(reader)
        .with_context(|| format!("decode {}", file.display()))?;
    println!("{}", serde_json::to_string_pretty(&change_set)?);
    Ok(())
}

/// Server, agent and settings wired together in one process.
struct Runtime {
    settings: ServiceSettings,
    server: Arc<SyncServer>,
    agent: Arc<DriftAgent<FsWalker>>,
}

impl Runtime {
    fn build(settings: ServiceSettings) -> Result<Self> {
        let layout = DataLayout::new(settings.data_dir()?);
        std::fs::create_dir_all(layout.root())?;

        let store = FsChangeSetStore::open(layout.change_sets_dir())?;
        let content = ContentStore::open(layout.content_dir(), settings.hasher())?;
        let server = Arc::new(SyncServer::new(Arc::new(store), content));
        for definition in &settings.definitions {
            server
                .register_definition(definition.clone())
                .with_context(|| format!("register {}", definition.name))?;
        }
        server
            .listeners()
            .register(Arc::new(IngestJournal::open(layout.journal_path())?))?;

        let agent = DriftAgent::new(
            Snapshotter::new(FsWalker, settings.hasher()),
            Arc::new(LocalTransport::new(server.clone())),
            AgentStateStore::open(layout.agent_state_dir())?,
            settings.transport.clone(),
        );

        info!(data_dir = %layout.root().display(), definitions = settings.definitions.len(), "runtime ready");
        Ok(Self {
            settings,
            server,
            agent: Arc::new(agent),
        })
    }

    async fn scan_command(&self, only: Option<String>, rebaseline: bool) -> Result<()> {
        let definitions: Vec<_> = match &only {
            Some(name) => vec![self
                .settings
                .definition(name)
                .cloned()
                .ok_or_else(|| anyhow!("unknown definition {name}"))?],
            None => self
                .settings
                .definitions
                .iter()
                .filter(|d| d.enabled)
                .cloned()
                .collect(),
        };

        let cancel = CancelToken::new();
        let mut failures = 0;
        for definition in &definitions {
            match self.agent.run_scan(definition, &cancel, rebaseline).await {
                Ok(outcome) => println!(
                    "{} v{} {:?} {} entries ({:?}, {} uploaded, {} warnings)",
                    outcome.definition,
                    outcome.version,
                    outcome.category,
                    outcome.entries,
                    outcome.outcome,
                    outcome.uploaded,
                    outcome.warnings.len()
                ),
                Err(e) => {
                    failures += 1;
                    eprintln!("{}: {e:#}", definition.name);
                }
            }
        }
        if failures > 0 {
            return Err(anyhow!("{failures} of {} scans failed", definitions.len()));
        }
        Ok(())
    }

    async fn run_command(&self) -> Result<()> {
        let definitions = self
            .settings
            .definitions
            .iter()
            .map(|d| (d.clone(), self.settings.interval_for(d)))
            .collect();
        let (tasks, handle) =
            spawn_scheduler(self.agent.clone(), definitions, self.settings.workers, None);

        info!("service started");
        signal::ctrl_c().await?;
        info!("service stopping");
        handle.shutdown();
        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }

    fn state_command(&self, definition: &str, version: Option<u32>, since: Option<u32>) -> Result<()> {
        let latest = self
            .server
            .next_version(definition)?
            .checked_sub(1)
            .ok_or_else(|| anyhow!("{definition} has no change-sets yet"))?;
        let version = version.unwrap_or(latest);

        if let Some(from) = since {
            let drift = self.server.drift_between(definition, from, version)?;
            println!("{}", serde_json::to_string_pretty(&drift)?);
            return Ok(());
        }
        let state = self.server.effective_state(definition, version)?;
        for (path, digest) in state.iter() {
            println!("{digest}  {path}");
        }
        Ok(())
    }

    fn history_command(&self, definition: &str) -> Result<()> {
        for summary in self.server.history(definition)? {
            println!(
                "{:>6}  {:<8}  {}  {} entries",
                summary.version,
                format!("{:?}", summary.category).to_lowercase(),
                summary.created_at.to_rfc3339(),
                summary.entries
            );
        }
        Ok(())
    }

    fn purge_command(&self, definition: &str) -> Result<()> {
        self.server.purge_definition(definition)?;
        self.agent.state().clear(definition)?;
        println!("purged {definition}");
        Ok(())
    }
}
