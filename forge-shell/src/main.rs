//! Forge shell: run a relay, or a headless line-oriented editing session.
//!
//! ```text
//! forge-shell relay [--bind 127.0.0.1:9090]
//! forge-shell session [--room NAME] [--name USER] [--offline]
//! ```
//!
//! Settings come from `FORGE_*` environment variables (and `.env`); flags
//! override them.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::info;
use tokio::io::{AsyncBufReadExt, BufReader};
use uuid::Uuid;

use forge_collab::RelayServer;
use forge_core::ModelId;
use forge_gen::StubBackend;
use forge_shell::{open_store, persist_store, PromptOutcome, Session, ShellConfig, ShellError};

#[derive(Parser)]
#[command(name = "forge-shell", version, about = "Collaborative code editor shell")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the room relay.
    Relay {
        #[arg(long)]
        bind: Option<String>,
    },
    /// Open an editing session on stdin/stdout.
    Session {
        #[arg(long)]
        room: Option<String>,
        #[arg(long)]
        name: Option<String>,
        /// Do not connect to the relay.
        #[arg(long)]
        offline: bool,
    },
}

const HELP: &str = "\
commands:
  /model [GPT4|CLAUDE|CODEQWEN]  show or pick the model
  /doc                           print the shared document
  /peers                         list participants
  /terminal  /projects           toggle panels
  /sh TEXT                       type into the terminal pane
  /new NAME                      create a project
  /list                          list your projects
  /deploy ID                     deploy a project
  /status                        connection state
  /quit
anything else is sent to the assistant";

/// Line-oriented front end over a [`Session`].
struct App {
    session: Session,
}

impl App {
    /// Handle one input line. Returns false to quit.
    async fn handle_line(&self, line: &str) -> Result<bool, ShellError> {
        let (command, arg) = match line.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" | "/exit" => return Ok(false),
            "/help" => println!("{HELP}"),

            // ── Model ───────────────────────────────────────────
            "/model" if arg.is_empty() => println!("model: {}", self.session.current_model()),
            "/model" => match arg.parse::<ModelId>() {
                Ok(model) if self.session.select_model(model) => println!("model: {model}"),
                Ok(model) => println!("{model} is not in the rotation"),
                Err(e) => println!("{e}"),
            },

            // ── Document & presence ─────────────────────────────
            "/doc" => println!("{}", self.session.editor_text()),
            "/peers" => {
                for p in self.session.participants() {
                    let cursor = p
                        .cursor
                        .map(|c| format!(" at {}:{}", c.line + 1, c.column + 1))
                        .unwrap_or_default();
                    println!("{} ({:?}){cursor}", p.name, p.role);
                }
            }
            "/status" => println!("{:?}", self.session.connection_state()),

            // ── Panels ──────────────────────────────────────────
            "/terminal" => {
                if self.session.toggle_terminal() {
                    println!("{}", self.session.terminal_screen());
                } else {
                    println!("terminal hidden");
                }
            }
            "/projects" => {
                let visible = self.session.toggle_projects();
                println!("projects panel {}", if visible { "shown" } else { "hidden" });
            }
            "/sh" => {
                let mut input = arg.as_bytes().to_vec();
                input.push(b'\r');
                print!("{}", self.session.terminal_input(&input));
                println!();
            }

            // ── Projects ────────────────────────────────────────
            "/new" => {
                let project = self.session.projects().create(arg, None).await?;
                println!("created {} ({})", project.name, project.id);
            }
            "/list" => {
                for project in self.session.projects().list().await? {
                    println!("{}  {}", project.id, project.name);
                }
            }
            "/deploy" => match arg.parse::<Uuid>() {
                Ok(id) => {
                    let deployment = self.session.projects().deploy(id, None).await?;
                    println!(
                        "{} {} {}",
                        deployment.deployment_id,
                        deployment.status.as_str(),
                        deployment.url
                    );
                }
                Err(e) => println!("bad project id: {e}"),
            },

            // ── Assistant ───────────────────────────────────────
            _ => match self.session.submit_prompt(line).await {
                PromptOutcome::Answered(response) => {
                    for notice in &response.fallbacks {
                        println!("[{} timed out, switched to {}]", notice.from, notice.to);
                    }
                    if let Some(reply) = self.session.chat().last() {
                        println!("{}", reply.content);
                    }
                }
                PromptOutcome::Failed => {
                    if let Some(reply) = self.session.chat().last() {
                        println!("{}", reply.content);
                    }
                }
                PromptOutcome::Ignored => {}
            },
        }
        Ok(true)
    }
}

async fn run_relay(config: ShellConfig, bind: Option<String>) -> Result<(), ShellError> {
    let mut relay_config = config.relay();
    if let Some(bind) = bind {
        relay_config.bind_addr = bind;
    }
    RelayServer::new(relay_config).run().await?;
    Ok(())
}

async fn run_session(
    mut config: ShellConfig,
    room: Option<String>,
    name: Option<String>,
    offline: bool,
) -> Result<(), ShellError> {
    if let Some(room) = room {
        config.room = room;
    }
    if let Some(name) = name {
        config.user_name = name;
    }

    let store = Arc::new(open_store(&config).await?);
    let session = Session::open(config.clone(), store.clone(), Arc::new(StubBackend::new())).await?;
    if !offline {
        session.connect();
    }
    if let Some(greeting) = session.chat().first() {
        println!("{}", greeting.content);
    }

    let app = App { session };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match app.handle_line(line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => println!("error: {e}"),
        }
    }

    app.session.close().await?;
    persist_store(&config, &store).await
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match ShellConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Command::Relay { bind } => {
            info!("Starting relay...");
            run_relay(config, bind).await
        }
        Command::Session { room, name, offline } => run_session(config, room, name, offline).await,
    };

    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
