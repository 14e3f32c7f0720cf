//! The coordinator binary: hand-rolled CLI flags, config load, store
//! bootstrap, cron spawn, HTTP serve. Grounded on the original `main.go`.

mod config;
mod http;

use std::process::ExitCode;
use std::sync::Arc;

use config::Config;
use dtm_engine::{Dispatcher, TransactionEngine};
use dtm_store::Store;

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Cli {
    show_version: bool,
    debug: bool,
    show_help: bool,
    reset: bool,
    config_path: Option<String>,
}

fn parse_args(args: &[String]) -> Cli {
    let mut cli = Cli { show_version: false, debug: false, show_help: false, reset: false, config_path: None };
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-v" => cli.show_version = true,
            "-d" => cli.debug = true,
            "-h" => cli.show_help = true,
            "-r" => cli.reset = true,
            "-c" if i + 1 < args.len() => {
                cli.config_path = Some(args[i + 1].clone());
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    cli
}

fn usage() {
    eprintln!("Usage: dtm-server [options]\n");
    eprintln!("  -v          Show the version of dtm-server.");
    eprintln!("  -d          Set log level to debug.");
    eprintln!("  -h          Show this help.");
    eprintln!("  -r          Reset the store schema.");
    eprintln!("  -c <path>   Path to the server configuration file.");
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = parse_args(&args);

    if cli.show_help {
        usage();
        return ExitCode::SUCCESS;
    }
    if cli.show_version {
        println!("dtm-server version: {VERSION}");
        return ExitCode::SUCCESS;
    }

    let mut config = match Config::load(cli.config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config: {e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.debug {
        config.log_level = "debug".into();
    }

    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!(version = VERSION, "starting dtm-server");

    let store: Arc<dyn Store> = match build_store(&config, cli.reset).await {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize store");
            return ExitCode::FAILURE;
        }
    };

    let dispatcher = Dispatcher::with_null_driver();
    let flusher = dtm_engine::spawn_flusher(store.clone());
    let engine = Arc::new(TransactionEngine::new(store.clone(), dispatcher.clone(), flusher.clone(), config.update_branch_sync));

    let cron_config = dtm_engine::CronConfig {
        expire_in: 0,
        trans_cron_interval: config.trans_cron_interval,
        request_timeout: std::time::Duration::from_secs(config.request_timeout as u64),
        update_branch_sync: config.update_branch_sync,
    };
    tokio::spawn(dtm_engine::run_cron(store.clone(), dispatcher, flusher, cron_config));

    #[cfg(feature = "http-server")]
    {
        let state = http::AppState { engine, store };
        let app = http::build_router(state);
        let listener = match tokio::net::TcpListener::bind(&config.http_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, addr = %config.http_addr, "failed to bind HTTP listener");
                return ExitCode::FAILURE;
            }
        };
        tracing::info!(addr = %config.http_addr, "dtm-server listening");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server exited with error");
            return ExitCode::FAILURE;
        }
    }

    #[cfg(not(feature = "http-server"))]
    {
        let _ = engine;
        std::future::pending::<()>().await;
    }

    ExitCode::SUCCESS
}

#[cfg(feature = "sqlite")]
async fn build_store(config: &Config, reset: bool) -> Result<Arc<dyn Store>, String> {
    use dtm_store::SqliteStore;
    let store = SqliteStore::connect(&config.store_dsn).await.map_err(|e| e.to_string())?;
    if reset {
        store.reset_schema().await.map_err(|e| e.to_string())?;
    } else {
        store.ensure_schema().await.map_err(|e| e.to_string())?;
    }
    Ok(Arc::new(store))
}

#[cfg(all(feature = "postgres", not(feature = "sqlite")))]
async fn build_store(config: &Config, reset: bool) -> Result<Arc<dyn Store>, String> {
    use dtm_store::PostgresStore;
    let store = PostgresStore::connect(&config.store_dsn).await.map_err(|e| e.to_string())?;
    if reset {
        store.reset_schema().await.map_err(|e| e.to_string())?;
    } else {
        store.ensure_schema().await.map_err(|e| e.to_string())?;
    }
    Ok(Arc::new(store))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_flags() {
        let cli = parse_args(&["-v".into(), "-d".into(), "-c".into(), "dtm.toml".into()]);
        assert!(cli.show_version);
        assert!(cli.debug);
        assert_eq!(cli.config_path.as_deref(), Some("dtm.toml"));
    }

    #[test]
    fn defaults_to_no_flags_set() {
        let cli = parse_args(&[]);
        assert!(!cli.show_version && !cli.debug && !cli.show_help && !cli.reset);
        assert!(cli.config_path.is_none());
    }
}
