use anyhow::{bail, Context, Result};
use autosave::{DocumentPersistence, SaveOutcome};
use clap::{Parser, Subcommand, ValueEnum};
use offline::{ConnectivityMonitor, NullRemoteSink, PendingOpQueue};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::{DraftDb, DraftService, EngineConfig, SharedDb, VersionId, VersionStore};
use tabs::{CrossTabChannel, EditorSession, TabHub};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "draftsave")]
#[command(about = "Draft autosave engine - headless draft, version and sync queue operations")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file (defaults to the app data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON config file (defaults to the app data directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the number of versions kept per draft
    #[arg(long, global = true)]
    retention: Option<usize>,

    /// Override the automatic retry ceiling
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a project
    NewProject {
        name: String,

        #[arg(long)]
        description: Option<String>,
    },

    /// List projects
    Projects,

    /// Create a draft inside a project
    NewDraft {
        project_id: String,
        title: String,

        /// Initial content
        #[arg(long, default_value = "")]
        content: String,
    },

    /// List the drafts of a project
    Drafts { project_id: String },

    /// Save draft content through the scheduler (manual save)
    Save {
        draft_id: String,

        /// Content to save
        #[arg(conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,

        /// Read the content from a file
        #[arg(short, long)]
        file: Option<PathBuf>,

        /// Also record the saved content as a named version
        #[arg(short, long)]
        comment: Option<String>,
    },

    /// List versions of a draft, newest first
    Versions {
        draft_id: String,

        #[arg(long, default_value = "20")]
        limit: usize,

        #[arg(long, default_value = "0")]
        offset: usize,
    },

    /// Make a stored version current again
    Restore { draft_id: String, version_id: String },

    /// Word-level difference between two versions
    Diff { version_a: String, version_b: String },

    /// List operations waiting for the remote sink
    Queue,

    /// Replay queued operations against the remote sink
    Drain,

    /// Show or set the connectivity state
    Connectivity { state: Option<NetState> },

    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        write: bool,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NetState {
    Online,
    Offline,
}

/// Every engine component, opened on one database.
struct Engine {
    config: EngineConfig,
    drafts: Arc<DraftService>,
    versions: Arc<VersionStore>,
    monitor: ConnectivityMonitor,
    queue: PendingOpQueue,
    hub: TabHub,
}

impl Engine {
    fn open(db_path: &Path, config: EngineConfig) -> Result<Self> {
        let db: SharedDb = DraftDb::open_or_create(db_path)
            .with_context(|| format!("opening database {}", db_path.display()))?
            .into_shared();
        Self::with_db(db, config)
    }

    fn with_db(db: SharedDb, config: EngineConfig) -> Result<Self> {
        let monitor = ConnectivityMonitor::open(db.clone())?;
        let queue = PendingOpQueue::new(db.clone(), monitor.clone(), Arc::new(NullRemoteSink));
        Ok(Self {
            drafts: Arc::new(DraftService::new(db.clone(), &config)),
            versions: Arc::new(VersionStore::new(db.clone(), &config)),
            hub: TabHub::new(db),
            monitor,
            queue,
            config,
        })
    }

    fn persistence(&self) -> DocumentPersistence {
        DocumentPersistence::new(self.drafts.clone(), self.versions.clone(), self.queue.clone())
    }

    fn session(&self, draft_id: &str) -> Result<EditorSession> {
        let channel = CrossTabChannel::open(&self.hub)?;
        let session = EditorSession::open(
            channel,
            self.persistence(),
            self.monitor.clone(),
            &self.config,
            draft_id,
        )?;
        Ok(session)
    }
}

fn load_config(cli: &Cli) -> Result<(EngineConfig, PathBuf)> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| store::app_data_dir().join("config.json"));
    let mut config = EngineConfig::load(&path)
        .with_context(|| format!("loading config {}", path.display()))?;
    if let Some(retention) = cli.retention {
        config.version_retention = retention;
    }
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }
    config.validate()?;
    Ok((config, path))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let (config, config_path) = load_config(&cli)?;
    if let Commands::Config { write } = cli.command {
        return config_command(&config, &config_path, write);
    }

    let db_path = cli.db.clone().unwrap_or_else(store::default_db_path);
    let engine = Engine::open(&db_path, config)?;

    match cli.command {
        Commands::NewProject { name, description } => {
            new_project_command(&engine, &name, description.as_deref())
        }
        Commands::Projects => projects_command(&engine),
        Commands::NewDraft {
            project_id,
            title,
            content,
        } => new_draft_command(&engine, &project_id, &title, &content),
        Commands::Drafts { project_id } => drafts_command(&engine, &project_id),
        Commands::Save {
            draft_id,
            text,
            file,
            comment,
        } => save_command(&engine, &draft_id, text, file, comment.as_deref()).await,
        Commands::Versions {
            draft_id,
            limit,
            offset,
        } => versions_command(&engine, &draft_id, limit, offset),
        Commands::Restore {
            draft_id,
            version_id,
        } => restore_command(&engine, &draft_id, &version_id).await,
        Commands::Diff {
            version_a,
            version_b,
        } => diff_command(&engine, &version_a, &version_b),
        Commands::Queue => queue_command(&engine),
        Commands::Drain => drain_command(&engine).await,
        Commands::Connectivity { state } => connectivity_command(&engine, state),
        Commands::Config { .. } => Ok(()),
    }
}

fn new_project_command(engine: &Engine, name: &str, description: Option<&str>) -> Result<()> {
    let project = engine.drafts.create_project(name, description)?;
    info!("Created project '{}'", project.name);
    println!("{}", project.id);
    Ok(())
}

fn projects_command(engine: &Engine) -> Result<()> {
    for project in engine.drafts.list_projects()? {
        println!("{}  {}", project.id, project.name);
    }
    Ok(())
}

fn new_draft_command(engine: &Engine, project_id: &str, title: &str, content: &str) -> Result<()> {
    let draft = engine
        .drafts
        .create_draft(project_id, title, content)
        .with_context(|| format!("creating draft in project {project_id}"))?;
    if !content.is_empty() {
        engine
            .versions
            .auto_save_version(&draft.id, &draft.content, draft.word_count)?;
    }
    info!("Created draft '{}'", draft.title);
    println!("{}", draft.id);
    Ok(())
}

fn drafts_command(engine: &Engine, project_id: &str) -> Result<()> {
    for draft in engine.drafts.list_drafts(project_id)? {
        println!("{}  {:>6} words  {}", draft.id, draft.word_count, draft.title);
    }
    Ok(())
}

async fn save_command(
    engine: &Engine,
    draft_id: &str,
    text: Option<String>,
    file: Option<PathBuf>,
    comment: Option<&str>,
) -> Result<()> {
    let content = match (text, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?,
        (None, None) => bail!("nothing to save"),
    };

    let session = engine.session(draft_id)?;
    let state = session.save(&content).await;
    let checkpoint = match comment {
        Some(comment) if state.is_saved() => Some(session.checkpoint(comment).await),
        _ => None,
    };
    session.close();

    match state.outcome {
        SaveOutcome::Saved => info!("Saved draft {}", draft_id),
        SaveOutcome::SavedWithWarnings(warnings) => {
            for warning in warnings {
                warn!("{}", warning);
            }
            info!("Saved draft {} with warnings", draft_id);
        }
        SaveOutcome::Skipped(reason) => info!("Save skipped: {:?}", reason),
        SaveOutcome::Failed(err) => return Err(err).context(format!("saving draft {draft_id}")),
        SaveOutcome::Pending => {}
    }
    if let Some(checkpoint) = checkpoint {
        println!("{}", checkpoint.context("recording named version")?);
    }

    let pending = engine.queue.len()?;
    if pending > 0 {
        info!("{} operation(s) waiting for sync ({})", pending, engine.monitor.state());
    }
    Ok(())
}

fn versions_command(engine: &Engine, draft_id: &str, limit: usize, offset: usize) -> Result<()> {
    let current = engine.versions.current_version(draft_id)?.map(|v| v.id);
    for version in engine.versions.list_versions(draft_id, limit, offset)? {
        let marker = if Some(version.id) == current { "*" } else { " " };
        let kind = if version.metadata.is_auto_save { "auto" } else { "manual" };
        println!(
            "{} {}  {}  {:>6} words  {}{}",
            marker,
            version.id,
            version.created_at.to_rfc3339(),
            version.word_count,
            kind,
            version
                .metadata
                .comment
                .as_deref()
                .map(|c| format!("  {c}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

async fn restore_command(engine: &Engine, draft_id: &str, version_id: &str) -> Result<()> {
    let version_id = VersionId::parse(version_id)?;
    let session = engine.session(draft_id)?;
    let restored = session.restore_version(version_id).await;
    session.close();
    let version = restored?;
    info!(
        "Restored version {} ({} words) of draft {}",
        version.id, version.word_count, draft_id
    );
    Ok(())
}

fn diff_command(engine: &Engine, a: &str, b: &str) -> Result<()> {
    let diff = engine
        .versions
        .get_version_diff(VersionId::parse(a)?, VersionId::parse(b)?)?;
    println!("+{} -{}", diff.added, diff.removed);
    Ok(())
}

fn queue_command(engine: &Engine) -> Result<()> {
    println!("connectivity: {}", engine.monitor.state());
    for op in engine.queue.pending()? {
        println!(
            "{}  {}  {} {}",
            op.id,
            op.enqueued_at.to_rfc3339(),
            op.action.as_str(),
            op.entity_type.as_str()
        );
    }
    Ok(())
}

async fn drain_command(engine: &Engine) -> Result<()> {
    let report = engine.queue.drain().await?;
    if report.remaining > 0 {
        warn!(
            "{} operation(s) left queued, connectivity is {}",
            report.remaining,
            engine.monitor.state()
        );
    }
    println!("applied {} operation(s)", report.applied);
    Ok(())
}

fn connectivity_command(engine: &Engine, state: Option<NetState>) -> Result<()> {
    match state {
        Some(NetState::Online) => {
            engine.monitor.go_online()?;
        }
        Some(NetState::Offline) => {
            engine.monitor.go_offline()?;
        }
        None => {}
    }
    println!("{}", engine.monitor.state());
    Ok(())
}

fn config_command(config: &EngineConfig, path: &Path, write: bool) -> Result<()> {
    if write {
        config.save(path)?;
        info!("Config written to {:?}", path);
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
