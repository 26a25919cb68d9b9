use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use safari_chat::{NotificationKind, Role};

mod commands;
mod config;
mod output;

use output::Output;

#[derive(Parser)]
#[command(name = "jeepchat")]
#[command(version)]
#[command(about = "Chat between tourists and safari jeep providers")]
#[command(long_about = "A command-line client for safari marketplace messaging: conversations, read receipts, presence and notifications.\n\nDesigned for humans, scripts and agents.")]
struct Cli {
    /// Output in JSON format (for agents/scripts)
    #[arg(short, long, global = true)]
    json: bool,

    /// Data directory (default: platform data dir/jeepchat)
    #[arg(long, global = true, env = "JEEPCHAT_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Act as a marketplace participant
    Login {
        /// Participant id from the marketplace account
        id: String,
        /// Display name shown to the other side
        #[arg(short, long)]
        name: Option<String>,
        /// tourist or provider
        #[arg(short, long, default_value = "tourist")]
        role: Role,
    },

    /// Go offline and clear all data
    Logout,

    /// Show current identity
    Whoami,

    /// Conversation management
    #[command(subcommand)]
    Conversation(ConversationCommands),

    /// Send a message
    Send {
        /// Peer participant id
        peer: String,
        /// Message text
        text: String,
        /// Client-chosen message id; resending with the same id is a no-op
        #[arg(long)]
        id: Option<String>,
    },

    /// Read messages from a conversation
    Read {
        /// Peer participant id
        peer: String,
        /// Maximum number of messages to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },

    /// Mark messages from a peer as read
    MarkRead {
        /// Peer participant id
        peer: String,
        /// Only this message (default: everything unread)
        #[arg(short, long)]
        message: Option<String>,
    },

    /// Presence management
    #[command(subcommand)]
    Presence(PresenceCommands),

    /// Notification management
    #[command(subcommand)]
    Notifications(NotificationCommands),

    /// Stream a conversation and stay online until Ctrl+C
    Listen {
        /// Peer participant id
        peer: String,
    },
}

#[derive(Subcommand)]
enum ConversationCommands {
    /// Print the conversation key of two participants
    Resolve { a: String, b: String },

    /// Open (or create) the conversation with a peer
    Open {
        /// Peer participant id
        peer: String,
    },

    /// List my conversations, most recent first
    List,
}

#[derive(Subcommand)]
enum PresenceCommands {
    /// Go online
    Online {
        /// Custom status line
        #[arg(short, long)]
        status: Option<String>,
        /// Session (tab or device) id
        #[arg(long)]
        session: Option<String>,
    },

    /// Go offline (all sessions unless --session is given)
    Offline {
        #[arg(long)]
        session: Option<String>,
    },

    /// Refresh a session's heartbeat
    Heartbeat {
        #[arg(long)]
        session: Option<String>,
    },

    /// Report that the page became hidden
    Hidden {
        #[arg(long)]
        session: Option<String>,
    },

    /// Report that the page became visible again
    Visible {
        #[arg(long)]
        session: Option<String>,
    },

    /// Show a participant's presence
    Show {
        /// Participant id
        participant: String,
    },

    /// Expire timed-out sessions
    Sweep,
}

#[derive(Subcommand)]
enum NotificationCommands {
    /// List my notifications
    List {
        /// Only unread ones
        #[arg(short, long)]
        unread: bool,
    },

    /// Mark a notification read
    Read {
        /// Notification id
        id: String,
    },

    /// Notify a participant about a booking or review
    Send {
        /// Recipient participant id
        recipient: String,
        #[arg(short, long, value_enum, default_value = "booking")]
        kind: KindArg,
        #[arg(short, long)]
        title: String,
        #[arg(short, long, default_value = "")]
        body: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Message,
    Booking,
    Review,
}

impl From<KindArg> for NotificationKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Message => NotificationKind::Message,
            KindArg::Booking => NotificationKind::Booking,
            KindArg::Review => NotificationKind::Review,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output = Output::new(cli.json);

    let result = run(cli, &output).await;

    if let Err(e) = result {
        output.error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

async fn run(cli: Cli, output: &Output) -> anyhow::Result<()> {
    let data_dir = match cli.data_dir {
        Some(dir) => dir,
        None => dirs::data_dir()
            .context("Could not find data directory")?
            .join("jeepchat"),
    };

    // Ensure data directory exists
    std::fs::create_dir_all(&data_dir)?;

    let config = config::Config::load(&data_dir)?;

    match cli.command {
        Commands::Login { id, name, role } => {
            commands::identity::login(&id, name.as_deref(), role, &config, output).await
        }
        Commands::Logout => commands::identity::logout(&data_dir, &config, output).await,
        Commands::Whoami => commands::identity::whoami(&config, output).await,
        Commands::Conversation(cmd) => match cmd {
            ConversationCommands::Resolve { a, b } => {
                commands::conversation::resolve_key(&a, &b, output).await
            }
            ConversationCommands::Open { peer } => {
                commands::conversation::open(&peer, &data_dir, &config, output).await
            }
            ConversationCommands::List => {
                commands::conversation::list(&data_dir, &config, output).await
            }
        },
        Commands::Send { peer, text, id } => {
            commands::message::send(&peer, &text, id.as_deref(), &data_dir, &config, output).await
        }
        Commands::Read { peer, limit } => {
            commands::message::read(&peer, limit, &data_dir, &config, output).await
        }
        Commands::MarkRead { peer, message } => {
            commands::message::mark_read(&peer, message.as_deref(), &data_dir, &config, output)
                .await
        }
        Commands::Presence(cmd) => match cmd {
            PresenceCommands::Online { status, session } => {
                commands::presence::online(
                    status.as_deref(),
                    session.as_deref(),
                    &data_dir,
                    &config,
                    output,
                )
                .await
            }
            PresenceCommands::Offline { session } => {
                commands::presence::offline(session.as_deref(), &data_dir, &config, output).await
            }
            PresenceCommands::Heartbeat { session } => {
                commands::presence::heartbeat(session.as_deref(), &data_dir, &config, output).await
            }
            PresenceCommands::Hidden { session } => {
                commands::presence::visibility(false, session.as_deref(), &data_dir, &config, output)
                    .await
            }
            PresenceCommands::Visible { session } => {
                commands::presence::visibility(true, session.as_deref(), &data_dir, &config, output)
                    .await
            }
            PresenceCommands::Show { participant } => {
                commands::presence::show(&participant, &data_dir, &config, output).await
            }
            PresenceCommands::Sweep => commands::presence::sweep(&data_dir, &config, output).await,
        },
        Commands::Notifications(cmd) => match cmd {
            NotificationCommands::List { unread } => {
                commands::notification::list(unread, &data_dir, &config, output).await
            }
            NotificationCommands::Read { id } => {
                commands::notification::read(&id, &data_dir, &config, output).await
            }
            NotificationCommands::Send {
                recipient,
                kind,
                title,
                body,
            } => {
                commands::notification::send(
                    &recipient,
                    kind.into(),
                    &title,
                    &body,
                    &data_dir,
                    &config,
                    output,
                )
                .await
            }
        },
        Commands::Listen { peer } => {
            commands::message::listen(&peer, &data_dir, &config, output).await
        }
    }
}
