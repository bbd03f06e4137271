//! apparea-server: administration CLI for the reverse-tunnel gateway.
//!
//! Initialises the configuration directory and inspects the user directory
//! the gateway resolves logins and virtual hostnames against.

use apparea_core::{virtual_hostname, AuthorizedUsers, UserDirectory};
use apparea_server::config::{self, expand_tilde, ServerConfig};
use clap::{Parser, Subcommand};
use std::path::Path;
use tracing::{error, info};

/// apparea-server: reverse-tunnel gateway
#[derive(Parser, Debug)]
#[command(name = "apparea-server", version, about = "Reverse-tunnel gateway server")]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "~/.apparea/config.toml")]
    config: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default config and an empty authorized_keys
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// List users and their key fingerprints
    Users,
    /// Show the principal and public sites a login resolves to
    Resolve {
        /// Login name, e.g. `alice` or `alice.dev.blog`
        login: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "apparea-server");

    let config_path = expand_tilde(Path::new(&cli.config));
    let code = match cli.command {
        Command::Init { force } => cmd_init(&config_path, force),
        Command::Users => cmd_users(&config_path),
        Command::Resolve { login } => cmd_resolve(&config_path, &login),
    };
    std::process::exit(code);
}

fn cmd_init(config_path: &Path, force: bool) -> i32 {
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(config::default_dir);
    match config::write_default(&dir, force) {
        Ok(written) => {
            for path in written {
                println!("wrote {}", path.display());
            }
            0
        }
        Err(e) => {
            error!(error = %e, "init failed");
            1
        }
    }
}

fn load_users(config_path: &Path) -> Option<(ServerConfig, AuthorizedUsers)> {
    let cfg = match ServerConfig::load(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            return None;
        }
    };
    match AuthorizedUsers::load(&cfg.authorized_keys) {
        Ok(users) => Some((cfg, users)),
        Err(e) => {
            error!(path = %cfg.authorized_keys.display(), error = %e, "failed to load authorized_keys");
            None
        }
    }
}

fn cmd_users(config_path: &Path) -> i32 {
    let Some((_, users)) = load_users(config_path) else {
        return 1;
    };
    if users.is_empty() {
        println!("no users");
        return 0;
    }
    for (name, keys) in users.iter() {
        println!("{name}");
        for key in keys {
            println!("  {} SHA256:{}", key.key_type, key.fingerprint);
        }
    }
    0
}

fn cmd_resolve(config_path: &Path, login: &str) -> i32 {
    let Some((cfg, users)) = load_users(config_path) else {
        return 1;
    };
    let Some(principal) = users.lookup_user(login) else {
        println!("{login}: unknown user or invalid login");
        return 1;
    };
    let host = virtual_hostname(&principal.name, &principal.subdomain, &cfg.hostname);
    println!("user:  {}", principal.name);
    println!("http:  http://{host}");
    println!("https: https://{host}");
    println!("raw:   {}:<assigned port>", cfg.hostname);
    0
}
