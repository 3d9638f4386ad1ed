//! Groupchat session - terminal client
//!
//! Entry point for the `groupchat-session` binary. Opens a session to the
//! configured server, joins the requested groups, prints what happens in them
//! and sends every typed line to the first group.

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};

use groupchat_session::cli::{self, Cli, Commands, RunArgs};
use groupchat_session::config::{self, SessionConfig};
use groupchat_session::error::{Error, Result};
use groupchat_session::logging::{self, LogGuards};
use groupchat_session::protocol::{LoadGroupMessages, MessageType, PresenceStatus};
use groupchat_session::session::{Identity, Session, SessionEvent};
use groupchat_session::transport::WebSocketConnector;
use groupchat_session::version;

fn main() -> Result<()> {
    // Parse CLI arguments first (before logging, so we know verbosity)
    let cli = Cli::parse();

    // For commands that don't need full logging, use simple setup
    let args = match cli.command {
        Commands::Version => {
            version::print_version();
            return Ok(());
        }
        Commands::Config { subcommand } => {
            logging::init_simple(tracing::Level::WARN)?;
            return handle_config_command(subcommand);
        }
        Commands::Run(args) => args,
    };

    let config = match load_run_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprint!("{}", e.format_for_terminal());
            std::process::exit(e.exit_code());
        }
    };

    // The guards must be kept alive for the lifetime of the program
    let _log_guards = init_logging_from_config(&config, cli.verbose, cli.quiet)?;

    let build = version::build_info();
    info!(
        version = %build.full_version(),
        target = %build.target,
        profile = %build.profile,
        "Starting groupchat session"
    );

    if let Err(e) = run_session(config, args) {
        error!(error = %e.format_for_log(), "Session failed");
        eprint!("{}", e.format_for_terminal());
        std::process::exit(e.exit_code());
    }

    Ok(())
}

/// Load configuration and layer the `run` flags on top
fn load_run_config(args: &RunArgs) -> Result<SessionConfig> {
    let mut config = SessionConfig::load(args.config.as_deref())?;

    if let Some(ref url) = args.url {
        config.server.url = url.clone();
    }
    if let Some(ref user_id) = args.user_id {
        config.identity.user_id = Some(user_id.clone());
    }
    if let Some(ref name) = args.name {
        config.identity.display_name = Some(name.clone());
    }

    config.validate()?;
    Ok(config)
}

fn init_logging_from_config(config: &SessionConfig, verbose: u8, quiet: bool) -> Result<LogGuards> {
    logging::init_logging(&config.logging, verbose, quiet)
}

fn parse_status(value: &str) -> Result<PresenceStatus> {
    match value.parse::<PresenceStatus>() {
        Ok(PresenceStatus::Unknown) | Err(_) => Err(Error::config_field_invalid(
            "--status",
            format!("Unknown status '{}' (expected online or offline)", value),
        )),
        Ok(status) => Ok(status),
    }
}

/// Build the runtime and run the interactive session
fn run_session(config: SessionConfig, args: RunArgs) -> Result<()> {
    let identity = Identity::from_settings(&config.identity)?;
    let status = args.status.as_deref().map(parse_status).transpose()?;

    info!(
        user_id = %identity.user_id,
        display_name = %identity.display_name,
        server_url = %config.server.url,
        groups = ?args.groups,
        "Configuration loaded"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("groupchat-session")
        .build()
        .map_err(|e| Error::Internal(format!("Failed to create async runtime: {}", e)))?;

    runtime.block_on(async_session_main(config, identity, args.groups, status))
}

async fn async_session_main(
    config: SessionConfig,
    identity: Identity,
    groups: Vec<String>,
    status: Option<PresenceStatus>,
) -> Result<()> {
    let connector = WebSocketConnector::new(config.connect_timeout());
    let (session, mut events) = Session::start(&config, identity, connector)?;

    subscribe_printers(&session);

    for group in &groups {
        session.join_group(group)?;
    }
    if let Some(status) = status {
        session.update_status(status)?;
    }
    session.connect()?;

    let current_group = groups.first().cloned();

    let shutdown_signal = tokio::signal::ctrl_c();
    tokio::pin!(shutdown_signal);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    info!("Session event loop started");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Received shutdown signal");
                break;
            }

            Some(event) = events.recv() => {
                if !handle_session_event(event) {
                    break;
                }
            }

            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !handle_input(&session, current_group.as_deref(), line.trim()) {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    }

    info!("Shutting down session");
    session.disconnect().await?;
    info!("Session stopped");
    Ok(())
}

/// Print inbound traffic worth showing to the user
fn subscribe_printers(session: &Session) {
    session.on(MessageType::GroupMessage, |envelope| {
        let group = envelope.group_id().unwrap_or("?");
        let sender = envelope
            .data_str("username")
            .or_else(|| envelope.data_str("userId"))
            .unwrap_or("?");
        let content = envelope.data_str("content").unwrap_or_default();
        println!("[{}] {}: {}", group, sender, content);
    });

    for kind in [MessageType::UserJoined, MessageType::UserLeft] {
        session.on(kind, move |envelope| {
            let group = envelope.group_id().unwrap_or("?");
            let user = envelope
                .data_str("username")
                .or_else(|| envelope.data_str("userId"))
                .unwrap_or("?");
            let verb = if kind == MessageType::UserJoined { "joined" } else { "left" };
            println!("[{}] * {} {}", group, user, verb);
        });
    }

    session.on(MessageType::Error, |envelope| {
        let message = envelope.data_str("message").unwrap_or("unknown error");
        eprintln!("! server error: {}", message);
    });
}

/// Log lifecycle events; false when the session cannot continue
fn handle_session_event(event: SessionEvent) -> bool {
    match event {
        SessionEvent::StateChanged(state) => debug!(state = %state, "Connection state"),
        SessionEvent::Ready { reconnected } => {
            if reconnected {
                info!("Reconnected");
            } else {
                info!("Connected");
            }
        }
        SessionEvent::Reconnecting { attempt, delay } => {
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");
        }
        SessionEvent::ConnectionLost { reason } => warn!(reason = %reason, "Connection lost"),
        SessionEvent::ReconnectExhausted { attempts } => {
            error!(attempts, "Giving up on the server");
            return false;
        }
    }
    true
}

/// Run one line of input; false on `/quit`
///
/// Requests run on their own task so the input loop keeps serving signals
/// and session events while a reply is outstanding.
fn handle_input(session: &Session, group: Option<&str>, line: &str) -> bool {
    if line.is_empty() {
        return true;
    }

    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let arg = parts.next().map(str::trim).filter(|s| !s.is_empty());

    let result = match (command, group) {
        ("/quit", _) => return false,
        ("/join", _) => match arg {
            Some(g) => session.join_group(g),
            None => usage("/join <group>"),
        },
        ("/leave", _) => match arg {
            Some(g) => session.leave_group(g),
            None => usage("/leave <group>"),
        },
        ("/status", _) => match arg {
            Some(user_id) => {
                let session = session.clone();
                let user_id = user_id.to_string();
                spawn_request(async move {
                    let info = session.get_user_status(&user_id).await?;
                    println!("{} is {}", info.user_id, info.status);
                    Ok(())
                });
                Ok(())
            }
            None => usage("/status <user>"),
        },
        ("/typing", Some(g)) => {
            let typing = session.typing_users(g);
            if typing.is_empty() {
                println!("[{}] nobody is typing", g);
            } else {
                println!("[{}] typing: {}", g, typing.join(", "));
            }
            Ok(())
        }
        ("/members", Some(g)) => {
            println!("[{}] members: {}", g, session.members(g).join(", "));
            Ok(())
        }
        ("/history", Some(g)) => {
            let limit = arg.and_then(|n| n.parse().ok()).unwrap_or(20);
            let query = LoadGroupMessages {
                group_id: g.to_string(),
                limit: Some(limit),
                before: None,
            };
            let session = session.clone();
            spawn_request(async move {
                let history = session.load_group_messages(query).await?;
                println!("{}", history);
                Ok(())
            });
            Ok(())
        }
        (cmd, _) if cmd.starts_with('/') => usage(
            "/join <group> | /leave <group> | /status <user> | /typing | /members | /history [n] | /quit",
        ),
        (_, Some(g)) => session.send_group_message(g, line),
        (_, None) => usage("run with -g <group> to chat"),
    };

    if let Err(e) = result {
        eprintln!("! {}", e);
    }
    true
}

/// Run a request in the background and report its failure
fn spawn_request<F>(request: F)
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = request.await {
            eprintln!("! {}", e);
        }
    });
}

fn usage(text: &str) -> Result<()> {
    eprintln!("usage: {}", text);
    Ok(())
}

/// Handle config subcommands
fn handle_config_command(subcommand: cli::ConfigSubcommand) -> Result<()> {
    use cli::ConfigSubcommand;

    match subcommand {
        ConfigSubcommand::Show { config } => {
            let cfg = SessionConfig::load(config.as_deref())?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigSubcommand::Init { path, force } => {
            let path = config::init_config(path.as_deref(), force)?;
            println!("Configuration file created: {}", path.display());
        }
        ConfigSubcommand::Validate { config } => match SessionConfig::load(config.as_deref()) {
            Ok(_) => {
                println!("Configuration is valid.");
            }
            Err(e) => {
                eprint!("{}", e.format_for_terminal());
                std::process::exit(e.exit_code());
            }
        },
    }

    Ok(())
}
