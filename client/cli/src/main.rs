//! Depot game install client (depot)

use clap::{Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod chunkproc;
mod config;
mod download;
mod error;
mod hashing;
mod installer;
mod manifest;
mod reassemble;
mod saves;
mod status;

use api::ApiClient;
use config::{ClientDirs, UserConfig};
use installer::Installer;
use manifest::{GameConfig, Manifest};
use status::GameState;

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Depot game install client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in to a depot server and save credentials
    Setup {
        /// Server address, e.g. 192.168.1.4:8000
        #[arg(long)]
        ip: String,
        /// Username
        #[arg(long)]
        username: String,
    },
    /// Register a new account on a depot server
    Register {
        /// Server address
        #[arg(long)]
        ip: String,
        /// Username
        #[arg(long)]
        username: String,
    },
    /// List games published on the server
    Games,
    /// Download and install a game
    Install {
        /// Game id
        id: String,
    },
    /// Uninstall a game, preserving its saves
    Uninstall {
        /// Game id
        id: String,
    },
    /// Upload a packaged game zip to the server
    Upload {
        /// Packaged game archive
        zip: String,
        /// Game config yaml
        config: String,
    },
    /// Queue a server-side download job from a url in the config
    Request {
        /// Game config yaml (must embed a url)
        config: String,
    },
    /// Show the server's packaging queue
    Processes,
    /// Show games uploaded by this account
    Uploads,
    /// Rotate the account API key
    Password,
    /// Delete the account on the server
    DeleteAccount,
    /// Remove a published game from the server
    Delete {
        /// Game id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "depot=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let dirs = ClientDirs::resolve()?;

    match cli.command {
        Commands::Setup { ip, username } => setup(&dirs, &ip, &username).await,
        Commands::Register { ip, username } => register(&dirs, &ip, &username).await,
        Commands::Games => list_games(&dirs).await,
        Commands::Install { id } => install(dirs, &id).await,
        Commands::Uninstall { id } => uninstall(dirs, &id),
        Commands::Upload { zip, config } => upload(&dirs, &zip, &config).await,
        Commands::Request { config } => request_download(&dirs, &config).await,
        Commands::Processes => processes(&dirs).await,
        Commands::Uploads => uploads(&dirs).await,
        Commands::Password => change_password(&dirs).await,
        Commands::DeleteAccount => delete_account(&dirs).await,
        Commands::Delete { id } => delete_game(&dirs, &id).await,
    }
}

fn client(dirs: &ClientDirs) -> anyhow::Result<Arc<ApiClient>> {
    let user = UserConfig::load(dirs)?;
    Ok(Arc::new(ApiClient::new(&user.server_url(), &user.password)?))
}

async fn prompt_password(prompt: &'static str) -> anyhow::Result<String> {
    use std::io::Write;
    print!("{prompt}");
    std::io::stdout().flush()?;
    tokio::task::spawn_blocking(|| -> anyhow::Result<String> {
        Ok(rpassword::read_password()?)
    })
    .await?
}

async fn setup(dirs: &ClientDirs, ip: &str, username: &str) -> anyhow::Result<()> {
    let password = prompt_password("Password: ").await?;
    let user = UserConfig {
        username: username.to_string(),
        password,
        ip: ip.to_string(),
    };

    let api = ApiClient::new(&user.server_url(), &user.password)?;
    let resolved = api.check_user().await?;
    if resolved != user.username {
        anyhow::bail!("API key belongs to {resolved}, not {username}");
    }

    user.save(dirs)?;
    dirs.ensure_layout()?;
    println!("logged in as {username}");
    Ok(())
}

async fn register(dirs: &ClientDirs, ip: &str, username: &str) -> anyhow::Result<()> {
    let password = prompt_password("Password: ").await?;
    let confirm = prompt_password("Confirm password: ").await?;
    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }

    let user = UserConfig {
        username: username.to_string(),
        password,
        ip: ip.to_string(),
    };
    ApiClient::register(&user.server_url(), &user.username, &user.password).await?;
    user.save(dirs)?;
    dirs.ensure_layout()?;
    println!("registered {username}");
    Ok(())
}

async fn list_games(dirs: &ClientDirs) -> anyhow::Result<()> {
    let api = client(dirs)?;
    let ids = api.games().await?;
    if ids.is_empty() {
        println!("no games published");
        return Ok(());
    }

    for id in ids {
        let installed = dirs.games().join(&id).exists();
        // Per-game metadata failures degrade to an id-only row.
        let (name, size) = match library_row(&api, &id).await {
            Ok(row) => row,
            Err(_) => (id.clone(), 0),
        };
        println!(
            "{:<28} {:>10}  {}{}",
            id,
            format_size(size),
            name,
            if installed { "  [installed]" } else { "" }
        );
    }
    Ok(())
}

async fn library_row(api: &ApiClient, id: &str) -> Result<(String, u64), error::InstallError> {
    let config = GameConfig::parse(&api.config_text(id).await?)?;
    let manifest = Manifest::parse(&api.manifest_text(id).await?)?;
    Ok((config.name, manifest.total_bytes()))
}

fn format_size(bytes: u64) -> String {
    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;
    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else {
        format!("{bytes} B")
    }
}

async fn install(dirs: ClientDirs, id: &str) -> anyhow::Result<()> {
    let api = client(&dirs)?;
    let installer = Installer::new(dirs);
    let registry = installer.registry();

    if !installer.start(&api, id) {
        anyhow::bail!("{id} is already installing");
    }

    let progress = MultiProgress::new();
    let style = ProgressStyle::with_template("{prefix:>8} [{bar:40}] {pos:>3}%")
        .unwrap()
        .progress_chars("=> ");
    let download_bar = progress.add(ProgressBar::new(100));
    download_bar.set_style(style.clone());
    download_bar.set_prefix("download");
    let process_bar = progress.add(ProgressBar::new(100));
    process_bar.set_style(style);
    process_bar.set_prefix("process");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                progress.println("cancelling...")?;
                installer.stop(id);
            }
            _ = tokio::time::sleep(Duration::from_millis(200)) => {}
        }

        let current = registry.get(id);
        download_bar.set_position((current.download * 100.0) as u64);
        process_bar.set_position((current.process * 100.0) as u64);

        match current.status {
            GameState::Completed => {
                download_bar.finish();
                process_bar.finish();
                println!("installed {id}");
                return Ok(());
            }
            GameState::Cancelled => {
                download_bar.abandon();
                process_bar.abandon();
                println!("cancelled");
                return Ok(());
            }
            GameState::Error => {
                download_bar.abandon();
                process_bar.abandon();
                anyhow::bail!("install failed: {}", current.error);
            }
            _ => {}
        }
    }
}

fn uninstall(dirs: ClientDirs, id: &str) -> anyhow::Result<()> {
    let installer = Installer::new(dirs);
    if installer.uninstall(id)? {
        println!("uninstalled {id}");
    } else {
        println!("{id} is not installed");
    }
    Ok(())
}

async fn upload(dirs: &ClientDirs, zip: &str, config_path: &str) -> anyhow::Result<()> {
    let api = client(dirs)?;
    let config_text = std::fs::read_to_string(config_path)?;
    // Fail on malformed configs before shipping gigabytes.
    let config = GameConfig::parse(&config_text)?;

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("uploading {}", config.id));
    spinner.enable_steady_tick(Duration::from_millis(120));
    api.upload(config_text, std::path::Path::new(zip)).await?;
    spinner.finish_and_clear();

    println!("upload queued: {}", config.id);
    Ok(())
}

async fn request_download(dirs: &ClientDirs, config_path: &str) -> anyhow::Result<()> {
    let api = client(dirs)?;
    let config_text = std::fs::read_to_string(config_path)?;
    let config = GameConfig::parse(&config_text)?;
    if config.url.as_deref().unwrap_or("").is_empty() {
        anyhow::bail!("config has no url");
    }

    api.request_download(config_text).await?;
    println!("download job queued: {}", config.id);
    Ok(())
}

async fn processes(dirs: &ClientDirs) -> anyhow::Result<()> {
    let api = client(dirs)?;
    let rows = api.processes().await?;
    if rows.is_empty() {
        println!("queue is empty");
        return Ok(());
    }
    for row in rows {
        let source = if row.download_url.is_empty() {
            String::new()
        } else {
            format!("  ({})", row.download_url)
        };
        println!(
            "{:<28} download {:>5.1}%  process {:>5.1}%{}",
            row.id,
            row.download * 100.0,
            row.process * 100.0,
            source
        );
    }
    Ok(())
}

async fn uploads(dirs: &ClientDirs) -> anyhow::Result<()> {
    let api = client(dirs)?;
    let games = api.account_games().await?;
    if games.is_empty() {
        println!("no uploads");
        return Ok(());
    }
    for game in games {
        println!("{:<28} {}", game.id, game.name);
    }
    Ok(())
}

async fn change_password(dirs: &ClientDirs) -> anyhow::Result<()> {
    let api = client(dirs)?;
    let current = prompt_password("Current password: ").await?;
    let new = prompt_password("New password: ").await?;
    let confirm = prompt_password("Confirm new password: ").await?;
    if new != confirm {
        anyhow::bail!("Passwords do not match");
    }

    api.change_password(&current, &new).await?;

    let mut user = UserConfig::load(dirs)?;
    user.password = new;
    user.save(dirs)?;
    println!("password updated");
    Ok(())
}

async fn delete_account(dirs: &ClientDirs) -> anyhow::Result<()> {
    let api = client(dirs)?;
    let current = prompt_password("Current password: ").await?;
    api.delete_account(&current).await?;
    UserConfig::delete(dirs)?;
    println!("account deleted");
    Ok(())
}

async fn delete_game(dirs: &ClientDirs, id: &str) -> anyhow::Result<()> {
    let api = client(dirs)?;
    api.delete_game(id).await?;
    println!("removed {id} from the server");
    Ok(())
}
