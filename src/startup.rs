// Startup banner + module loading status for this crate's ingestion
// components.

use crate::config::{Settings, VERSION};

mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const DIM: &str = "\x1b[2m";
    pub const CYAN: &str = "\x1b[36m";
    pub const GREEN: &str = "\x1b[32m";
}

pub struct ModuleStatus {
    pub name: &'static str,
    pub enabled: bool,
    pub description: &'static str,
}

/// Prints the startup banner and module loading status before the
/// collector's run loop starts.
pub fn print_startup(settings: &Settings) {
    use colors::*;

    println!();
    println!("  {BOLD}{CYAN}proxy-audit{RESET} {DIM}v{VERSION}{RESET}");
    println!("  {DIM}Ingestion pipeline for proxy access/error logs{RESET}");
    println!();

    if let Some(path) = Settings::config_path() {
        if path.exists() {
            println!("  {DIM}Config:{RESET} {GREEN}\u{2713}{RESET} {}", path.display());
        } else {
            println!("  {DIM}Config:{RESET} {DIM}(using env/defaults){RESET}");
        }
    }
    println!("  {DIM}Node:{RESET} {}", settings.node_id);
    println!();

    println!("  {DIM}Loading modules...{RESET}");
    for module in module_status(settings) {
        print_module_status(&module);
    }
    println!();

    println!(
        "  {BOLD}\u{25b8}{RESET} Tailing {} {DIM}(access){RESET}",
        settings.log_path.display()
    );
    if settings.error_log_enabled {
        println!(
            "  {BOLD}\u{25b8}{RESET} Tailing {} {DIM}(error){RESET}",
            settings.error_log_path.display()
        );
    }
    println!("  {BOLD}\u{25b8}{RESET} State store: {}", settings.db_path.display());
    println!();
}

fn module_status(settings: &Settings) -> Vec<ModuleStatus> {
    vec![
        ModuleStatus {
            name: "tailer",
            enabled: true,
            description: "Access log follower",
        },
        ModuleStatus {
            name: "error-tailer",
            enabled: settings.error_log_enabled,
            description: "Error log follower",
        },
        ModuleStatus {
            name: "access-parser",
            enabled: true,
            description: "Access/DNS line grammar",
        },
        ModuleStatus {
            name: "error-parser",
            enabled: settings.error_log_enabled,
            description: "Error classification + signature hash",
        },
        ModuleStatus {
            name: "filter",
            enabled: true,
            description: "Noise/loopback drop rules",
        },
        ModuleStatus {
            name: "state-store",
            enabled: true,
            description: "SQLite batched ingestion",
        },
        ModuleStatus {
            name: "cache-projector",
            enabled: settings.redis_enabled,
            description: "Realtime Redis aggregates",
        },
        ModuleStatus {
            name: "retention",
            enabled: settings.retention_days > 0,
            description: "Bounded-chunk pruning",
        },
    ]
}

fn print_module_status(module: &ModuleStatus) {
    use colors::*;
    let (icon, style) = if module.enabled {
        (format!("{GREEN}\u{2713}{RESET}"), "")
    } else {
        (format!("{DIM}\u{25cb}{RESET}"), DIM)
    };
    println!(
        "    {icon} {style}{:<15}{RESET} {DIM}{}{RESET}",
        module.name, module.description
    );
}
