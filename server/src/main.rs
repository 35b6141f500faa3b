//! Depot game distribution server (depotd)

use clap::{Parser, Subcommand};
use std::fs;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod daemon;
mod pipeline;
mod progress;
mod queue;
mod steam;
mod users;

use config::Config;
use daemon::Pidfile;
use progress::ProgressSink;
use users::UserStore;

fn pidfile() -> Pidfile {
    Pidfile::for_service("depotd")
}

#[derive(Parser)]
#[command(name = "depotd")]
#[command(about = "Depot game distribution server daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (runs in background)
    Serve {
        /// Run in foreground (don't daemonize)
        #[arg(long)]
        foreground: bool,
    },
    /// Stop the server
    Down,
    /// Show server status
    Status,
    /// Package a local zip into the published games tree (no HTTP involved)
    Pack {
        /// Packaged game archive
        zip: String,
        /// Game config yaml
        config: String,
    },
    /// User management
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a new user
    Create {
        /// Username
        #[arg(long)]
        username: String,
    },
    /// List all users
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Lifecycle commands resolve through the pid file alone.
    match &cli.command {
        Commands::Down => {
            return stop_server();
        }
        Commands::Status => {
            return show_status();
        }
        Commands::Serve { foreground } if !foreground => {
            return start_daemon();
        }
        _ => {}
    }

    // Everything past here runs in this process and logs.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depotd=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Serve { foreground: _ } => {
            run_server(config).await?;
        }
        Commands::Down => unreachable!(),
        Commands::Status => unreachable!(),
        Commands::Pack { zip, config: config_path } => {
            pack_local(&config, &zip, &config_path).await?;
        }
        Commands::User { command } => match command {
            UserCommands::Create { username } => {
                create_user(&config, &username).await?;
            }
            UserCommands::List => {
                list_users(&config)?;
            }
        },
    }

    Ok(())
}

fn start_daemon() -> anyhow::Result<()> {
    let pidfile = pidfile();
    if let Some(pid) = pidfile.live_pid() {
        println!("depotd already running (pid {pid})");
        return Ok(());
    }

    let pid = pidfile.spawn_detached(&["serve", "--foreground"])?;

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    println!("depotd serving on localhost:{} (pid {pid})", config.rest_port);
    Ok(())
}

fn stop_server() -> anyhow::Result<()> {
    match pidfile().terminate()? {
        Some(pid) => println!("depotd stopped (pid {pid})"),
        None => println!("depotd not running"),
    }
    Ok(())
}

fn show_status() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    match pidfile().live_pid() {
        Some(pid) => {
            println!("depotd running");
            println!("  pid: {pid}");
            println!("  rest: localhost:{}", config.rest_port);
            println!("  data: {}", config.data_dir.display());
        }
        None => println!("depotd not running"),
    }
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    // Foreground runs own the pid file too, so `down` and `status` see them.
    pidfile().record(std::process::id())?;

    fs::create_dir_all(config.games_dir())?;
    let user_store = UserStore::open(&config.users_path())?;
    let job_queue = queue::JobQueue::open(&config.processes_dir())?;

    let state = api::AppState::new(user_store, job_queue, config.clone());

    // The watchdog drains the packaging queue in the background.
    let watchdog_state = state.clone();
    tokio::spawn(async move {
        queue::run_watchdog(watchdog_state).await;
    });

    let addr = format!("0.0.0.0:{}", config.rest_port).parse()?;
    tracing::info!("REST listening on {}", addr);
    api::rest::serve(addr, state).await?;

    pidfile().clear();

    Ok(())
}

async fn create_user(config: &Config, username: &str) -> anyhow::Result<()> {
    use std::io::{self, Write};

    if username.len() < 3 {
        anyhow::bail!("Username must be at least 3 characters");
    }
    if !username
        .chars()
        .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        anyhow::bail!("Username can only contain letters, numbers, underscores, and hyphens");
    }

    print!("API key: ");
    io::stdout().flush()?;
    let api_key = tokio::task::spawn_blocking(|| -> anyhow::Result<String> {
        Ok(rpassword::read_password()?)
    })
    .await??;

    print!("Confirm API key: ");
    io::stdout().flush()?;
    let confirm = tokio::task::spawn_blocking(|| -> anyhow::Result<String> {
        Ok(rpassword::read_password()?)
    })
    .await??;

    if api_key != confirm {
        anyhow::bail!("Keys do not match");
    }
    if api_key.len() < 4 {
        anyhow::bail!("API key must be at least 4 characters");
    }

    let store = UserStore::open(&config.users_path())?;
    if !store.register(username, &api_key)? {
        anyhow::bail!("User already exists");
    }

    println!("User created: {}", username);
    Ok(())
}

fn list_users(config: &Config) -> anyhow::Result<()> {
    let store = UserStore::open(&config.users_path())?;
    let users = store.usernames();

    if users.is_empty() {
        println!("no users");
    } else {
        for user in users {
            println!("{}", user);
        }
    }
    Ok(())
}

async fn pack_local(config: &Config, zip: &str, config_path: &str) -> anyhow::Result<()> {
    let config_text = fs::read_to_string(config_path)?;
    let game_config = pipeline::GameConfig::parse(&config_text)?;

    let job_dir = config.processes_dir().join(&game_config.id);
    let work = job_dir.join("work");
    fs::create_dir_all(&work)?;
    fs::copy(zip, work.join(pipeline::ARCHIVE_NAME))?;
    fs::write(work.join(pipeline::CONFIG_NAME), &config_text)?;

    println!("packaging {}...", game_config.id);
    let sink = ProgressSink::new(|pct| println!("{pct}%"));
    let games_dir = config.games_dir();
    tokio::task::spawn_blocking(move || pipeline::run(&work, &games_dir, &sink)).await??;

    let _ = fs::remove_dir_all(&job_dir);
    println!("published {}", game_config.id);
    Ok(())
}
