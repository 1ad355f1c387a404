//! dbmonitor - MySQL session exporter.
//!
//! Serves the processlist of every configured instance as `mysqlconn` gauges.

mod background;
mod handlers;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tracing::{Level, error, info, warn};
use tracing_subscriber::EnvFilter;

use dbmonitor_core::collector::{Collector, MetricVariant, MySqlConnector};
use dbmonitor_core::config::{
    CONFIGURATION_PATH_ENV, ConfigSource, Configuration, DEFAULT_CONFIGURATION_PATH,
};
use dbmonitor_core::registry::ConnectionRegistry;

/// MySQL session exporter.
#[derive(Parser)]
#[command(name = "dbmonitor", about = "MySQL session exporter", version = dbmonitor_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = "0.0.0.0:8080", env = "DBMONITOR_LISTEN")]
    listen: String,

    /// Path the metrics are served on.
    #[arg(long, default_value = "/metrics", env = "DBMONITOR_METRICS_PATH")]
    metrics_path: String,

    /// Path to the YAML configuration file.
    #[arg(long, default_value = DEFAULT_CONFIGURATION_PATH, env = CONFIGURATION_PATH_ENV)]
    config: PathBuf,

    /// Read instances from DBMONITOR_* environment variables instead of a file.
    #[arg(long)]
    config_from_env: bool,

    /// Per-instance processlist query timeout in seconds.
    #[arg(
        long,
        default_value = "10",
        env = "DBMONITOR_QUERY_TIMEOUT",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    query_timeout: u64,

    /// Number of runtime worker threads. Defaults to one per CPU core.
    #[arg(
        short = 'n',
        long,
        env = "DBMONITOR_WORKERS",
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
    )]
    workers: Option<usize>,

    /// Exported metric: "sessions" (mysqlconn) or "sleep" (mysqlsleepconn).
    #[arg(long, default_value = "sessions", value_parser = parse_variant)]
    metric: MetricVariant,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

const HEALTH_PATH: &str = "/health";

fn parse_variant(s: &str) -> Result<MetricVariant, String> {
    s.parse()
}

fn validate_metrics_path(path: &str) -> Result<(), String> {
    if !path.starts_with('/') {
        return Err("metrics path must start with '/'".to_string());
    }
    if path == HEALTH_PATH {
        return Err(format!("metrics path must differ from {}", HEALTH_PATH));
    }
    Ok(())
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["dbmonitor", "dbmonitor_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if let Some(workers) = args.workers {
        builder.worker_threads(workers);
    }

    let runtime = match builder.build() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };

    runtime.block_on(async_main(args));
}

async fn async_main(args: Args) {
    info!(version = dbmonitor_core::VERSION, "dbmonitor starting");

    let source = if args.config_from_env {
        ConfigSource::Env
    } else {
        ConfigSource::File(args.config.clone())
    };

    let config: Configuration = match source.load() {
        Ok(config) => config,
        Err(e) => {
            error!(source = %source, error = %e, "failed to load configuration");
            process::exit(1);
        }
    };
    info!(
        source = %source,
        instances = config.instances().len(),
        auto_discover_interval = config.auto_discover_interval,
        "configuration loaded"
    );

    if let Err(e) = validate_metrics_path(&args.metrics_path) {
        error!(path = %args.metrics_path, "{}", e);
        process::exit(1);
    }

    let registry = Arc::new(ConnectionRegistry::new(MySqlConnector::new()));
    let report = registry.discover(config.instances());
    info!(
        registered = report.registered.len(),
        skipped = report.skipped_unconfigured,
        failed = report.failed.len(),
        "initial discovery complete"
    );
    if registry.is_empty() {
        warn!("no instances registered, serving empty metrics");
    }

    if let Some(interval) = config.auto_discover_interval() {
        let registry = registry.clone();
        let source = source.clone();
        tokio::spawn(async move {
            background::discovery_loop(registry, source, interval).await;
        });
    }

    let collector = Arc::new(
        Collector::new(registry)
            .with_query_timeout(Duration::from_secs(args.query_timeout))
            .with_variant(args.metric),
    );

    let app = router(collector, &args.metrics_path);

    let addr: SocketAddr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, path = %args.metrics_path, metric = %args.metric, "listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }

    info!("shutdown complete");
}

fn router(collector: Arc<Collector>, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(handlers::handle_metrics))
        .route(HEALTH_PATH, get(handlers::handle_health))
        .with_state(collector)
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("received shutdown signal");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode, header};
    use dbmonitor_core::collector::mock::{MockSource, RecordingConnector, row};
    use dbmonitor_core::config::InstanceConfig;
    use tower::ServiceExt;

    fn instance(name: &str, host: &str) -> InstanceConfig {
        InstanceConfig {
            instance: name.to_string(),
            host: host.to_string(),
            user: "monitor".to_string(),
            ..Default::default()
        }
    }

    fn test_router() -> Router {
        let connector = RecordingConnector::new()
            .with_source(
                "db-a",
                MockSource::with_rows(vec![
                    Ok(row("5", "app", "10.0.0.5:33000", "Sleep", "42")),
                    Ok(row("6", "app", "10.0.0.6", "Query", "N/A")),
                ]),
            )
            .with_source("db-b", MockSource::failing("Access denied"))
            .failing_host("db-c");
        let registry = Arc::new(ConnectionRegistry::new(connector));
        registry.discover(&[
            instance("a", "db-a"),
            instance("b", "db-b"),
            instance("c", "db-c"),
        ]);
        router(Arc::new(Collector::new(registry)), "/hbec/metrics")
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, Option<String>, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_reachable_instances() {
        let (status, content_type, body) = get_body(test_router(), "/hbec/metrics").await;

        assert_eq!(status, StatusCode::OK);
        assert!(content_type.unwrap().starts_with("text/plain"));
        assert!(body.contains("# TYPE mysqlconn gauge"));

        let sample = |id: &str| {
            body.lines()
                .find(|l| l.starts_with("mysqlconn{") && l.contains(&format!(r#"id="{id}""#)))
                .map(str::to_string)
                .unwrap()
        };
        let sleeping = sample("5");
        assert!(sleeping.contains(r#"dbinstance="a""#));
        assert!(sleeping.contains(r#"host="10.0.0.5""#));
        assert!(sleeping.contains(r#"command="Sleep""#));
        assert!(sleeping.ends_with(" 42"));

        let malformed = sample("6");
        assert!(malformed.contains(r#"host="10.0.0.6""#));
        assert!(malformed.ends_with(" 0"));

        assert!(!body.contains(r#"dbinstance="b""#));
        assert!(!body.contains(r#"dbinstance="c""#));
    }

    #[tokio::test]
    async fn health_endpoint() {
        let (status, _, body) = get_body(test_router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (status, _, _) = get_body(test_router(), "/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn args_defaults() {
        let args = Args::try_parse_from(["dbmonitor"]).unwrap();
        assert_eq!(args.listen, "0.0.0.0:8080");
        assert_eq!(args.metric, MetricVariant::Sessions);
        assert_eq!(args.query_timeout, 10);
        assert_eq!(args.workers, None);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIGURATION_PATH));
    }

    #[test]
    fn args_workers() {
        let args = Args::try_parse_from(["dbmonitor", "-n", "2"]).unwrap();
        assert_eq!(args.workers, Some(2));
        let args = Args::try_parse_from(["dbmonitor", "--workers", "8"]).unwrap();
        assert_eq!(args.workers, Some(8));
        assert!(Args::try_parse_from(["dbmonitor", "-n", "0"]).is_err());
    }

    #[test]
    fn args_reject_zero_timeout() {
        assert!(Args::try_parse_from(["dbmonitor", "--query-timeout", "0"]).is_err());
        let args = Args::try_parse_from(["dbmonitor", "--query-timeout", "1"]).unwrap();
        assert_eq!(args.query_timeout, 1);
    }

    #[test]
    fn metrics_path_validation() {
        assert!(validate_metrics_path("/metrics").is_ok());
        assert!(validate_metrics_path("/hbec/metrics").is_ok());
        assert!(validate_metrics_path("metrics").is_err());
        assert!(validate_metrics_path(HEALTH_PATH).is_err());
    }

    #[test]
    fn args_metric_variant() {
        let args = Args::try_parse_from(["dbmonitor", "--metric", "sleep"]).unwrap();
        assert_eq!(args.metric, MetricVariant::Sleep);
        assert!(Args::try_parse_from(["dbmonitor", "--metric", "bogus"]).is_err());
    }
}
