//! Tandem CLI - drive assistant CLI sessions from the terminal
//!
//! Two ways to talk to the assistant:
//! - `chat`: a streaming agent session (stream-json protocol)
//! - `pty`: the assistant inside a shell on a pseudo-terminal
//!
//! Both run on the same registries a graphical front-end would use.

mod render;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use tandem_core::config::{Config, ConfigManager};
use tandem_core::notify::{ChannelNotifier, Notification, NotificationReceiver};
use tandem_core::pty::{CreatePtyOptions, NativePtyBackend, PtyRegistry};
use tandem_core::session::{
    AgentRegistry, CreateAgentOptions, JsonFileStore, SendOptions, SendOutcome, SessionStore,
};
use tandem_core::stream::CliProtocol;
use tandem_core::{AgentStatus, Error, PtyStatus, link};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Drive assistant CLI sessions from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Working directory for new sessions
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive streaming chat
    Chat {
        /// Reopen a saved session by id
        #[arg(long)]
        session: Option<String>,

        /// Resume a conversation by its resumable id
        #[arg(long)]
        resume: Option<String>,

        /// Model to use
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Run the assistant inside a shell on a pseudo-terminal
    Pty {
        /// Resume a conversation by its resumable id
        #[arg(long)]
        resume: Option<String>,
    },

    /// Manage saved sessions
    #[command(subcommand)]
    Sessions(SessionCommands),

    /// Show configuration
    Config,
}

#[derive(Subcommand)]
enum SessionCommands {
    /// List saved sessions
    List,

    /// Show the transcript of a session
    Show {
        /// Session id
        id: String,
    },

    /// Delete a saved session
    Delete {
        /// Session id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(cli.verbose, cli.log_file.as_deref())?;

    // Use dunce::canonicalize to avoid UNC path prefix on Windows (\\?\)
    let workspace = dunce::canonicalize(&cli.workspace).unwrap_or_else(|_| {
        std::env::current_dir()
            .map(|cwd| cwd.join(&cli.workspace))
            .unwrap_or(cli.workspace.clone())
    });

    let config_manager = ConfigManager::new().unwrap_or_else(|e| {
        eprintln!("{}", style(format!("Warning: {}, using defaults", e)).yellow());
        ConfigManager::default()
    });
    let config = config_manager.config().clone();

    match cli.command {
        Some(Commands::Chat { session, resume, model }) => {
            run_chat(&config, &workspace, session, resume, model).await?
        }
        Some(Commands::Pty { resume }) => run_pty(&config, &workspace, resume).await?,
        Some(Commands::Sessions(cmd)) => handle_session_command(&config, cmd)?,
        Some(Commands::Config) => show_config(&config_manager),
        None => run_chat(&config, &workspace, None, None, None).await?,
    }

    Ok(())
}

/// Logs go to stderr by default (`warn`), or to a file with `--log-file`.
/// `TANDEM_LOG` overrides the filter.
fn init_logging(
    verbose: bool,
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default = if verbose {
        "info,tandem_core=debug,tandem_process=debug"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_env("TANDEM_LOG").unwrap_or_else(|_| EnvFilter::new(default));

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        return Ok(None);
    };

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("Invalid log file path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

/// Both registries, guarding each other, reporting into one channel
struct Runtime {
    agents: Arc<AgentRegistry>,
    ptys: Arc<PtyRegistry>,
    notifications: NotificationReceiver,
}

impl Runtime {
    fn new(config: &Config) -> Self {
        let (notifier, notifications) = ChannelNotifier::new();
        let notifier = Arc::new(notifier);
        let store = Arc::new(JsonFileStore::new(config.storage.sessions_dir()));

        let agents = Arc::new(AgentRegistry::new(
            config,
            Arc::new(CliProtocol::from_config(&config.cli)),
            store,
            notifier.clone(),
        ));
        let ptys = Arc::new(PtyRegistry::new(config, Arc::new(NativePtyBackend::new()), notifier));
        link(&ptys, &agents);

        Self {
            agents,
            ptys,
            notifications,
        }
    }
}

async fn run_chat(
    config: &Config,
    workspace: &Path,
    session: Option<String>,
    resume: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    let mut runtime = Runtime::new(config);
    let agents = runtime.agents.clone();

    let id = match session {
        Some(id) => {
            let reopened = agents.reopen(&id)?;
            if reopened.profile_changed {
                println!(
                    "{}",
                    style("Note: the active credential profile differs from the one this session was created with")
                        .yellow()
                );
            }
            id
        }
        None => {
            agents
                .create(CreateAgentOptions {
                    kind: None,
                    cwd: Some(workspace.to_path_buf()),
                    resume_id: resume,
                    model: model.clone(),
                })
                .id
        }
    };

    println!("{} {}", style("Session").bold(), style(&id).cyan());
    println!(
        "{}",
        style("Type a message. /cancel /compact /model <name> /models /status /quit").dim()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if !handle_chat_line(&agents, &id, line, model.as_deref()).await {
                    break;
                }
            }
            Some(notification) = runtime.notifications.recv() => {
                render::notification(&notification);
            }
            _ = tokio::signal::ctrl_c() => {
                if agents.get(&id).is_some_and(|v| v.status == AgentStatus::Streaming) {
                    agents.cancel(&id).await?;
                } else {
                    break;
                }
            }
        }
    }

    agents.close(&id).await?;
    while let Ok(notification) = runtime.notifications.try_recv() {
        render::notification(&notification);
    }
    Ok(())
}

/// Returns false when the chat should end
async fn handle_chat_line(agents: &AgentRegistry, id: &str, line: &str, model: Option<&str>) -> bool {
    let (command, arg) = match line.split_once(' ') {
        Some((command, arg)) => (command, Some(arg.trim())),
        None => (line, None),
    };

    let result = match command {
        "/quit" | "/exit" => return false,
        "/cancel" => agents.cancel(id).await.map(|_| ()),
        "/compact" => agents.compact_conversation(id).await.map(report_outcome),
        "/model" => agents
            .set_model(id, arg.filter(|a| !a.is_empty()).map(str::to_string))
            .await,
        "/models" => agents.supported_models(id).await.map(|models| {
            for m in models {
                println!("  {} {}", style(&m.value).cyan(), style(&m.display_name).dim());
            }
        }),
        "/status" => {
            match agents.get(id) {
                Some(view) => render::session(&view),
                None => println!("{}", style("Session is gone").red()),
            }
            Ok(())
        }
        _ => {
            let options = SendOptions {
                model: model.map(str::to_string),
                max_turns: None,
            };
            agents.send_message(id, line, options).await.map(report_outcome)
        }
    };

    if let Err(e) = result {
        match e {
            Error::AlreadyStreaming(_) => {
                println!("{}", style("Still answering; /cancel to interrupt").yellow())
            }
            e => println!("{}", style(format!("Error: {}", e)).red()),
        }
    }
    true
}

fn report_outcome(outcome: SendOutcome) {
    if let SendOutcome::Failed { message } = outcome {
        println!("{}", style(format!("Failed to start: {}", message)).red());
    }
}

async fn run_pty(config: &Config, workspace: &Path, resume: Option<String>) -> anyhow::Result<()> {
    let mut runtime = Runtime::new(config);
    let ptys = runtime.ptys.clone();

    let id = ptys
        .create(CreatePtyOptions {
            title: Some("tandem".to_string()),
            cwd: workspace.to_path_buf(),
            resume_id: resume,
            ..Default::default()
        })
        .id;
    ptys.start(&id).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => ptys.write_line(&id, &line),
                    None => break,
                }
            }
            Some(notification) = runtime.notifications.recv() => {
                render::notification(&notification);
                if let Notification::PtyStatus { status: PtyStatus::Exited | PtyStatus::Error, .. } = notification {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Some(outcome) = ptys.close(&id, true).await {
        println!("{}", style(format!("Terminal closed ({:?})", outcome)).dim());
    }
    Ok(())
}

fn handle_session_command(config: &Config, cmd: SessionCommands) -> anyhow::Result<()> {
    let store = JsonFileStore::new(config.storage.sessions_dir());

    match cmd {
        SessionCommands::List => {
            let sessions = store.list_sessions()?;
            println!("{}", style("Saved Sessions:").bold());
            if sessions.is_empty() {
                println!("  {}", style("No saved sessions").dim());
            }
            for record in sessions {
                render::record(&record);
            }
        }
        SessionCommands::Show { id } => {
            let record = store
                .get_session(&id)?
                .ok_or_else(|| anyhow::anyhow!("Unknown session: {}", id))?;
            render::record(&record);
            for entry in store.load_transcript(&id)? {
                render::transcript_entry(&entry);
            }
        }
        SessionCommands::Delete { id } => {
            store.delete_session(&id)?;
            println!("{}", style(format!("Session {} deleted", id)).green());
        }
    }
    Ok(())
}

fn show_config(manager: &ConfigManager) {
    let config = manager.config();
    println!("{}", style("Configuration:").bold());
    println!("  File: {}", style(manager.config_path().display()).green());
    println!("  Assistant: {}", style(&config.cli.program).cyan());
    if !config.cli.extra_args.is_empty() {
        println!("  Extra args: {}", config.cli.extra_args.join(" "));
    }
    println!("  Shell: {}", config.pty.resolve_shell());
    println!("  Sessions: {}", config.storage.sessions_dir().display());
    match config.active_profile() {
        Some(profile) => println!(
            "  Profile: {} {}",
            style(&profile.name).cyan(),
            style(profile.base_url.as_deref().unwrap_or("(default endpoint)")).dim()
        ),
        None => println!("  Profile: {}", style("none").dim()),
    }
}
