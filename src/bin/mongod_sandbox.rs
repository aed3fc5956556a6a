use mongod_sandbox::{RunConfiguration, ScopeKind};
use std::io::BufRead;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Starts a sandbox server from a JSON config, prints where it listens and
/// keeps it alive until stdin sees `stop` or EOF.
///
/// Lines `module` and `class` on stdin trigger the matching scope cleanup.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config = match std::env::args_os().nth(1) {
        Some(path) => RunConfiguration::from_json_file(&PathBuf::from(path))?,
        None => RunConfiguration::enabled(),
    };
    if !config.enable {
        eprintln!("configuration has \"enable\": false, nothing to do");
        return Ok(());
    }

    let mut run = mongod_sandbox::start(&config)?;
    if let Some(info) = run.connection_info() {
        println!("{}={}", config.endpoint_var, info.endpoint());
        println!("{}={}", config.database_var, info.database);
    }

    for line in std::io::stdin().lock().lines() {
        let scope = match line?.trim() {
            "stop" => break,
            "module" => ScopeKind::Module,
            "class" => ScopeKind::Class,
            "" => continue,
            other => {
                eprintln!("unknown command {other:?} (expected module, class or stop)");
                continue;
            }
        };
        let report = run.on_scope_boundary(scope)?;
        println!("dropped {} collection(s)", report.dropped.len());
    }

    let report = run.stop()?;
    for warning in &report.warnings {
        eprintln!("warning: {warning}");
    }
    Ok(())
}
