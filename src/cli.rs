// CLI: command-line surface, using a clap derive `handle_cli() -> bool`
// early-exit pattern. Covers the operator surface this crate needs:
// `run` (default), `config show`, `config init`, `migrate`. Grounded on
// the original's `run_api.py` / `init_db.py` / `runtime_config.current_items()`.

use clap::{Parser, Subcommand};
use proxy_audit::config::{Settings, RUNTIME_SCHEMA};
use proxy_audit::storage::StateStore;

#[derive(Parser)]
#[command(name = "proxy-audit")]
#[command(version = proxy_audit::config::VERSION)]
#[command(about = "Ingestion pipeline for a proxy server's access/error logs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the collector loop (default if no subcommand is given)
    Run,
    /// Configuration inspection and bootstrap
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run StateStore schema migrations and exit
    Migrate,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print effective settings and current runtime-config overrides
    Show,
    /// Write the default config template if one doesn't exist yet
    Init,
}

/// Returns `Some(())` if a command other than `run` was fully handled
/// (the caller should exit); `None` means "fall through to the collector
/// loop".
pub fn handle_cli(cli: Cli) -> Option<()> {
    match cli.command {
        None | Some(Commands::Run) => None,
        Some(Commands::Config { action }) => {
            match action {
                ConfigAction::Show => handle_config_show(),
                ConfigAction::Init => handle_config_init(),
            }
            Some(())
        }
        Some(Commands::Migrate) => {
            handle_migrate();
            Some(())
        }
    }
}

fn handle_config_show() {
    let settings = Settings::from_env();

    println!("# Effective configuration (env > file > defaults)");
    println!();
    println!("node_id = {:?}", settings.node_id);
    println!("log_path = {:?}", settings.log_path.display().to_string());
    println!(
        "error_log_path = {:?}",
        settings.error_log_path.display().to_string()
    );
    println!("error_log_enabled = {}", settings.error_log_enabled);
    println!("db_path = {:?}", settings.db_path.display().to_string());
    println!("redis_url = {:?}", settings.redis_url);
    println!("redis_enabled = {}", settings.redis_enabled);
    println!();
    println!("# Runtime-mutable defaults (overridable without restart via runtime_config)");
    for field in RUNTIME_SCHEMA {
        println!("{} = <{}, group={}>", field.key, value_type_name(field.value_type), field.group);
    }

    println!();
    if let Some(path) = Settings::config_path() {
        if path.exists() {
            println!("# Source: {}", path.display());
        } else {
            println!("# Source: defaults (no config file)");
        }
    }

    match StateStore::open(&settings.db_path) {
        Ok(store) => match store.load_runtime_overrides(&settings.node_id) {
            Ok(overrides) if !overrides.is_empty() => {
                println!();
                println!("# Active overrides ({}):", settings.db_path.display());
                for (key, _) in overrides {
                    println!("  {key} (overridden)");
                }
            }
            Ok(_) => {}
            Err(err) => eprintln!("warning: could not load overrides: {err}"),
        },
        Err(err) => eprintln!("warning: could not open state store: {err}"),
    }
}

fn value_type_name(ty: proxy_audit::config::ValueType) -> &'static str {
    use proxy_audit::config::ValueType;
    match ty {
        ValueType::Int => "int",
        ValueType::Float => "float",
        ValueType::Bool => "bool",
        ValueType::Csv => "csv",
        ValueType::Enum => "enum",
    }
}

fn handle_config_init() {
    let Some(path) = Settings::config_path() else {
        eprintln!("Error: could not determine config path");
        std::process::exit(1);
    };

    if path.exists() {
        println!("Config already exists: {}", path.display());
        return;
    }

    Settings::ensure_config_exists();
    println!("Created config: {}", path.display());
}

fn handle_migrate() {
    let settings = Settings::from_env();
    match StateStore::open(&settings.db_path) {
        Ok(_) => println!("Schema up to date: {}", settings.db_path.display()),
        Err(err) => {
            eprintln!("Migration failed: {err:?}");
            std::process::exit(1);
        }
    }
}
