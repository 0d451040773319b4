mod config;
mod console;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

use teachback_core::{
    GeminiClient, ParticipantRecord, QuizVariant, Session, SessionConfig, StateStore, TbResult,
    TeachbackError, TextCompletion, Treatment,
};
use teachback_proxy::ProxyState;
use teachback_store::SqliteStore;

use crate::config::Config;
use crate::console::Console;

#[derive(Parser)]
#[command(
    name = "teachback",
    version,
    about = "Learning-by-teaching experiment: AI tutor, teach-back, quiz and exit survey"
)]
struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one participant through the experiment in the terminal
    Run {
        /// Participant identifier (generated when omitted)
        #[arg(short, long)]
        participant: Option<String>,

        /// Skip the teach-back stage
        #[arg(long)]
        no_teach_back: bool,

        /// Quiz variant (defaults to the configured one)
        #[arg(short, long)]
        quiz: Option<CliQuizVariant>,

        /// Seed for fallback line selection
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Serve the completion proxy over HTTP
    Serve {
        /// Port to listen on (overrides config and API_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print a participant's recorded data as JSON, or list participants
    Show {
        #[arg(short, long)]
        participant: Option<String>,
    },

    /// Show the active configuration
    Config,
}

#[derive(Clone, ValueEnum)]
enum CliQuizVariant {
    MultipleChoice,
    FreeResponse,
}

impl From<CliQuizVariant> for QuizVariant {
    fn from(v: CliQuizVariant) -> Self {
        match v {
            CliQuizVariant::MultipleChoice => QuizVariant::MultipleChoice,
            CliQuizVariant::FreeResponse => QuizVariant::FreeResponse,
        }
    }
}

/// Stand-in when no API key is configured. Every turn falls back.
struct Unconfigured(String);

impl TextCompletion for Unconfigured {
    fn generate_text(&self, _prompt: &str) -> TbResult<String> {
        Err(TeachbackError::Provider(self.0.clone()))
    }
}

fn default_db_path() -> PathBuf {
    directories::ProjectDirs::from("dev", "teachback", "teachback")
        .map(|dirs| dirs.data_dir().join("teachback.db"))
        .unwrap_or_else(|| PathBuf::from("teachback.db"))
}

fn open_store(db: Option<PathBuf>, cfg: &Config) -> Result<SqliteStore> {
    let path = db
        .or_else(|| cfg.store.path.as_ref().map(PathBuf::from))
        .unwrap_or_else(default_db_path);
    SqliteStore::new(&path).context("failed to open database")
}

fn gemini_client(cfg: &Config, model: &str) -> TbResult<GeminiClient> {
    Ok(GeminiClient::from_env(&cfg.provider.api_key_env, model)?
        .with_base_url(&cfg.provider.base_url)
        .with_timeout(Duration::from_secs(cfg.provider.timeout_secs)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::WARN.into()),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config()?;

    match cli.command {
        Commands::Run {
            participant,
            no_teach_back,
            quiz,
            seed,
        } => {
            let store = open_store(cli.db, &cfg)?;
            cmd_run(&store, &cfg, participant, no_teach_back, quiz, seed)
        }
        Commands::Serve { port } => cmd_serve(&cfg, port),
        Commands::Show { participant } => {
            let store = open_store(cli.db, &cfg)?;
            cmd_show(&store, participant.as_deref())
        }
        Commands::Config => cmd_config(&cfg),
    }
}

fn cmd_run(
    store: &SqliteStore,
    cfg: &Config,
    participant: Option<String>,
    no_teach_back: bool,
    quiz: Option<CliQuizVariant>,
    seed: Option<u64>,
) -> Result<()> {
    let participant = participant.unwrap_or_else(|| ulid::Ulid::new().to_string().to_lowercase());
    if !store.entries(&participant, teachback_core::Scope::Game)?.is_empty() {
        bail!("participant {participant} already has a recorded session");
    }

    let client: Box<dyn TextCompletion> = match gemini_client(cfg, &cfg.provider.model) {
        Ok(client) => Box::new(client),
        Err(e) => {
            warn!("{e}; replies will use fallback lines");
            Box::new(Unconfigured(format!(
                "{} is not set",
                cfg.provider.api_key_env
            )))
        }
    };

    let session_config = SessionConfig {
        durations: cfg.experiment.durations(),
        quiz_variant: quiz.map(Into::into).unwrap_or(cfg.experiment.quiz_variant),
    };
    let mut session = Session::new(store, client.as_ref(), participant, session_config);
    if let Some(seed) = seed {
        session = session.with_rng(StdRng::seed_from_u64(seed));
    }

    let treatment = Treatment::with_teach_back(cfg.experiment.teach_back && !no_teach_back);
    let stdin = io::stdin();
    Console::new(stdin.lock(), io::stdout()).run(&mut session, treatment)
}

fn cmd_serve(cfg: &Config, port: Option<u16>) -> Result<()> {
    let completion: Option<Arc<dyn TextCompletion>> =
        match gemini_client(cfg, &cfg.provider.proxy_model) {
            Ok(client) => Some(Arc::new(client) as Arc<dyn TextCompletion>),
            Err(e) => {
                warn!("{e}; completion requests will fail until it is set");
                None
            }
        };

    let port = port.unwrap_or_else(|| cfg.server.effective_port());
    let addr: SocketAddr = format!("{}:{port}", cfg.server.host)
        .parse()
        .with_context(|| format!("invalid listen address {}:{port}", cfg.server.host))?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(teachback_proxy::run_server(addr, ProxyState::new(completion)))?;
    Ok(())
}

fn cmd_show(store: &SqliteStore, participant: Option<&str>) -> Result<()> {
    let Some(participant) = participant else {
        let ids = store.participants()?;
        if ids.is_empty() {
            println!("No participants recorded.");
        }
        for id in ids {
            println!("{id}");
        }
        return Ok(());
    };

    let record = ParticipantRecord::load(store, participant)?;
    if record.is_empty() {
        bail!("no data recorded for participant {participant}");
    }
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn cmd_config(cfg: &Config) -> Result<()> {
    println!("Config: {}", config::show_config_path());
    println!();
    println!("[store]");
    println!(
        "  path = {}",
        cfg.store
            .path
            .as_deref()
            .unwrap_or("(default platform path)")
    );
    println!();
    println!("[provider]");
    println!("  base_url = {}", cfg.provider.base_url);
    println!("  model = {}", cfg.provider.model);
    println!("  proxy_model = {}", cfg.provider.proxy_model);
    let key_state = match std::env::var(&cfg.provider.api_key_env) {
        Ok(v) if !v.trim().is_empty() => "set",
        _ => "not set",
    };
    println!("  api_key_env = {} ({key_state})", cfg.provider.api_key_env);
    println!("  timeout_secs = {}", cfg.provider.timeout_secs);
    println!();
    println!("[experiment]");
    println!("  teach_back = {}", cfg.experiment.teach_back);
    println!("  quiz_variant = {}", cfg.experiment.quiz_variant);
    println!("  teaching_secs = {}", cfg.experiment.teaching_secs);
    println!("  teach_back_secs = {}", cfg.experiment.teach_back_secs);
    println!("  quiz_secs = {}", cfg.experiment.quiz_secs);
    println!();
    println!("[server]");
    println!("  host = {}", cfg.server.host);
    println!("  port = {}", cfg.server.effective_port());
    Ok(())
}
