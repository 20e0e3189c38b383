//! relay-chat CLI
//!
//! Line-oriented front end: creates the identity, then runs the client with
//! the sync worker in the background and reads commands from stdin.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use relay_chat::model::{ContactId, Direction, Message};
use relay_chat::{
    Client, HttpTransport, Identity, MemoryStore, SessionStore, Settings, SqliteStore,
};

/// relay-chat: end-to-end encrypted messaging through an untrusted relay
#[derive(Parser)]
#[command(name = "relay-chat")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Path to identity file (default: ~/.relay-chat/identity.key)
    #[arg(short, long, global = true)]
    identity: Option<PathBuf>,

    /// Relay base URL
    #[arg(long, global = true)]
    server_url: Option<String>,

    /// SQLite database file
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Write logs here instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Keep everything in memory for this run
    #[arg(long, global = true)]
    ephemeral: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new identity keypair
    Init {
        /// Force overwrite existing identity
        #[arg(short, long)]
        force: bool,
    },

    /// Display your public key
    Identity,

    /// Connect to the relay and start chatting
    Run,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_deref())?;

    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(identity) = cli.identity {
        settings.identity_path = identity;
    }
    if let Some(url) = cli.server_url {
        settings.server_url = url;
    }
    if let Some(database) = cli.database {
        settings.database_path = database;
    }
    settings.validate()?;

    match cli.command {
        Commands::Init { force } => cmd_init(&settings.identity_path, force),
        Commands::Identity => cmd_identity(&settings.identity_path),
        Commands::Run => cmd_run(&settings, cli.ephemeral),
    }
}

fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match log_file {
        Some(path) => {
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {:?}", path))?;
            builder
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

fn load_identity(path: &Path) -> Result<Identity> {
    let bytes = fs::read(path).with_context(|| {
        format!(
            "no identity found at {:?}; run 'relay-chat init' to create one",
            path
        )
    })?;
    Identity::from_bytes(&bytes).context("invalid identity file")
}

fn save_identity(identity: &Identity, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    fs::write(path, identity.to_bytes()).with_context(|| format!("writing {:?}", path))
}

fn cmd_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("identity already exists at {:?}; use --force to overwrite", path);
    }

    let identity = Identity::generate();
    save_identity(&identity, path)?;

    println!("Identity created.");
    println!();
    println!("Your key (share this with contacts):");
    println!("{}", identity.public_key());
    println!();
    println!("Identity saved to: {:?}", path);
    Ok(())
}

fn cmd_identity(path: &Path) -> Result<()> {
    let identity = load_identity(path)?;
    println!("{}", identity.public_key());
    Ok(())
}

fn open_store(settings: &Settings, ephemeral: bool) -> Result<Arc<dyn SessionStore>> {
    if ephemeral {
        return Ok(Arc::new(MemoryStore::new()));
    }
    if let Some(parent) = settings.database_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {:?}", parent))?;
    }
    let store = SqliteStore::new(&settings.database_path)
        .with_context(|| format!("opening database {:?}", settings.database_path))?;
    Ok(Arc::new(store))
}

fn cmd_run(settings: &Settings, ephemeral: bool) -> Result<()> {
    let identity = if ephemeral {
        Identity::generate()
    } else {
        load_identity(&settings.identity_path)?
    };
    let store = open_store(settings, ephemeral)?;
    let transport = Arc::new(HttpTransport::new(settings)?);

    let mut client = Client::new(identity, store, transport, settings.event_log_capacity)?;
    client.spawn_sync(settings.poll_interval());

    println!("=== relay-chat ===");
    println!("Your key: {}", client.public_key());
    println!("Relay:    {}", settings.server_url);
    println!();
    print_help();

    let mut seen = 0;
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        seen = print_events(&client, seen);
        print!("> ");
        io::stdout().flush()?;

        let line = match lines.next() {
            Some(line) => line?,
            None => break,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        // Errors from intents are already in the event log
        match command {
            "/quit" => break,
            "/help" => print_help(),
            "/key" => println!("{}", client.public_key()),
            "/add" => match rest.rsplit_once(' ') {
                Some((name, key)) => {
                    let _ = client.add_contact(name, key);
                }
                None => println!("usage: /add <name> <key>"),
            },
            "/select" => {
                if let Ok(contact) = client.select_contact(rest) {
                    println!("Chatting with {}.", contact.name);
                    print_conversation(&client, contact.id);
                }
            }
            "/contacts" => print_contacts(&client)?,
            "/messages" => match client.selected()? {
                Some(contact) => print_conversation(&client, contact.id),
                None => println!("no contact selected"),
            },
            "/exchange" => match client.selected()? {
                Some(contact) => {
                    let _ = client.request_exchange(contact.id);
                }
                None => println!("no contact selected"),
            },
            "/send" => {
                let _ = client.send_to_selected(rest);
            }
            _ if command.starts_with('/') => println!("unknown command; try /help"),
            _ => {
                let _ = client.send_to_selected(line);
            }
        }
    }

    println!("Goodbye!");
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  /add <name> <key>   - Add a contact");
    println!("  /select <name|id>   - Choose who to talk to");
    println!("  /send <text>        - Send to the selected contact (or just type)");
    println!("  /contacts           - List contacts");
    println!("  /messages           - Show the selected conversation");
    println!("  /exchange           - Start a fresh key exchange");
    println!("  /key                - Show your key");
    println!("  /quit               - Exit");
    println!();
}

fn print_events(client: &Client, seen: u64) -> u64 {
    let mut last = seen;
    for entry in client.events_since(seen) {
        println!(
            "[{}] {}: {}",
            entry.timestamp.format("%H:%M:%S"),
            entry.title,
            entry.text
        );
        last = entry.seq;
    }
    last
}

fn print_contacts(client: &Client) -> Result<()> {
    let contacts = client.contacts()?;
    if contacts.is_empty() {
        println!("no contacts yet; add one with /add");
    }
    for contact in contacts {
        let status = if client.has_session_key(contact.id)? {
            "ready"
        } else {
            "exchanging keys"
        };
        println!("  {:>3}  {:<16} {}", contact.id, contact.name, status);
    }
    Ok(())
}

fn print_conversation(client: &Client, contact_id: ContactId) {
    match client.messages(contact_id) {
        Ok(messages) => messages.iter().for_each(print_message),
        Err(e) => println!("could not load messages: {}", e),
    }
}

fn print_message(message: &Message) {
    let who = match message.direction {
        Direction::Sent => "you",
        Direction::Received => "them",
    };
    let text = message
        .plaintext
        .as_deref()
        .unwrap_or("<could not decrypt>");
    println!(
        "  [{}] {}: {}",
        message.timestamp.format("%Y-%m-%d %H:%M"),
        who,
        text
    );
}
