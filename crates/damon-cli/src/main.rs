//! damon - run one executable inside a kernel resource container.
//!
//! `damon.exe <child> [args...]` starts the child contained, mirrors its
//! exit code, and optionally serves Prometheus metrics while it runs.
//! Invoked with no arguments it prints the version and exits 0.
//!
//! The entire argument list after the program name belongs to the child;
//! nothing is interpreted as a flag, so configuration comes exclusively
//! from the environment.

mod config;

#[cfg(windows)]
fn main() {
    std::process::exit(run::main());
}

#[cfg(not(windows))]
fn main() {
    eprintln!("damon supervises processes with Windows job objects and only runs on Windows");
    std::process::exit(1);
}

#[cfg(windows)]
mod run {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::State;
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use tokio_util::sync::CancellationToken;
    use tracing::{error, info};
    use tracing_subscriber::EnvFilter;

    use damon::container::{Config, Container, DEFAULT_SHUTDOWN_TIMEOUT};
    use damon::metrics::Metrics;
    use damon::win32::process::{ProcessCommand, EXIT_STATUS_START_ERROR};
    use damon::{resources, version};

    use crate::config;

    pub fn main() -> i32 {
        let args: Vec<String> = std::env::args().skip(1).collect();
        let version = version::get();
        if args.is_empty() {
            println!("{version}");
            return 0;
        }

        let env = config::process_env();
        init_logging(&env);
        info!(version = %version, cmdline = ?args, "damon starting");

        let ccfg = match config::container_config(&env) {
            Ok(ccfg) => ccfg,
            Err(err) => {
                error!(error = %err, "unable to load container configuration from environment");
                eprintln!("damon: {err}");
                return EXIT_STATUS_START_ERROR;
            }
        };

        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(err) => {
                eprintln!("damon: failed to start runtime: {err}");
                return EXIT_STATUS_START_ERROR;
            }
        };
        runtime.block_on(supervise(args, ccfg, &env))
    }

    fn init_logging(env: &dyn Fn(&str) -> Option<String>) {
        let lcfg = config::log_config(env);
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let builder = tracing_subscriber::fmt().with_env_filter(filter).json();
        let dir = lcfg.dir();
        let _ = std::fs::create_dir_all(&dir);
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(lcfg.path())
        {
            Ok(file) => builder.with_writer(Arc::new(file)).init(),
            Err(_) => builder.with_writer(std::io::stderr).init(),
        }
    }

    async fn supervise(
        args: Vec<String>,
        ccfg: Config,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> i32 {
        let sr = resources::get();
        let labels: HashMap<String, String> = config::nomad_fields(env);
        let metrics = match Metrics::new(sr.cpu_cores, sr.cpu_mhz_per_core, labels) {
            Ok(metrics) => Arc::new(metrics),
            Err(err) => {
                error!(error = %err, "unable to build metrics registry");
                eprintln!("damon: {err}");
                return EXIT_STATUS_START_ERROR;
            }
        };
        if ccfg.enforce_cpu || ccfg.enforce_memory {
            metrics.set_limits(
                ccfg.cpu_limit_mhz,
                ccfg.memory_limit_bytes(),
                sr.cpu_total_ticks,
            );
        }

        let mut cmd = ProcessCommand::new(args[0].clone());
        cmd.args = args[1..].to_vec();

        let container = match Container::run(cmd, &ccfg) {
            Ok(container) => container,
            Err(err) => {
                error!(error = %err, "damon startup error");
                eprintln!("damon: {err}");
                return EXIT_STATUS_START_ERROR;
            }
        };
        info!(pid = container.pid(), container = %container.name(), "child started");

        let stats_sink = Arc::clone(&metrics);
        container.poll_stats(move |stats| stats_sink.on_stats(&stats));
        let violation_sink = Arc::clone(&metrics);
        container.poll_violations(move |violation| {
            tracing::warn!(kind = %violation.kind, message = %violation.message, "limit violation");
            violation_sink.on_violation(&violation);
        });

        if let Some(addr) = config::listen_address(env) {
            let endpoint = config::metrics_endpoint(env);
            serve_metrics(addr, endpoint, Arc::clone(&metrics));
        }

        let breaker = Arc::clone(&container);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                if let Err(err) = breaker.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await {
                    error!(error = %err, "shutdown error");
                }
            }
        });

        let start = container.started_at();
        let result = match container.wait_for_result(&CancellationToken::new()).await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "wait error");
                return damon::win32::process::EXIT_STATUS_ERROR;
            }
        };
        if let Some(err) = &result.error {
            error!(error = %err, "process exited with an error");
        }
        info!(
            start = %start,
            run_time_secs = container.start_time().elapsed().as_secs(),
            exit_status = result.exit_status,
            "damon exiting"
        );
        result.exit_status
    }

    fn serve_metrics(addr: String, endpoint: String, metrics: Arc<Metrics>) {
        tokio::spawn(async move {
            let app = Router::new()
                .route(&endpoint, get(metrics_handler))
                .with_state(metrics);
            let listener = match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(err) => {
                    error!(addr = %addr, error = %err, "unable to bind metrics listener");
                    return;
                }
            };
            info!(addr = %addr, endpoint = %endpoint, "serving metrics");
            if let Err(err) = axum::serve(listener, app).await {
                error!(error = %err, "metrics server error");
            }
        });
    }

    async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> Response {
        match metrics.encode_text() {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                body,
            )
                .into_response(),
            Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response(),
        }
    }
}
