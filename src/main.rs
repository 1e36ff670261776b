//! Engine entry point.
//!
//! Runs either as a worker node (the default: session engine plus optional
//! cluster client) or, with `--serve-master`, as the cluster master.
//! Startup failures (config, proxy list, session creation) exit non-zero;
//! a signal-driven shutdown exits zero.

use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use url::Url;

use cohort::cluster::{listen_and_serve, MasterService, WorkerClient};
use cohort::config::Config;
use cohort::engine::Engine;
use cohort::events::{CookieSyncEvent, EngineEvent};

#[derive(Parser, Debug)]
#[command(author, version, about = "Distributed HTTP session-automation engine")]
struct Args {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<String>,

    /// Run as the cluster master, listening on this address (e.g.
    /// 0.0.0.0:50051). No sessions are created in this mode.
    #[arg(long)]
    serve_master: Option<String>,

    /// Master address to join as a worker (e.g. 10.0.0.1:50051).
    #[arg(long)]
    master_addr: Option<String>,

    /// Identifier for this worker node within the cluster.
    #[arg(long, default_value = "pc-1")]
    pc_id: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    if let Some(addr) = args.serve_master {
        return run_master(&addr).await;
    }
    run_worker(args).await
}

async fn run_master(addr: &str) -> ExitCode {
    let service = Arc::new(MasterService::new());
    let cancel = CancellationToken::new();

    let server = {
        let service = service.clone();
        let cancel = cancel.clone();
        let addr = addr.to_string();
        tokio::spawn(async move { listen_and_serve(&addr, service, cancel).await })
    };

    if tokio::signal::ctrl_c().await.is_err() {
        log::error!("failed to install signal handler");
        return ExitCode::FAILURE;
    }
    log::info!("signal received; stopping master");
    cancel.cancel();

    match server.await {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(err)) => {
            log::error!("master failed: {err}");
            ExitCode::FAILURE
        }
        Err(err) => {
            log::error!("master task panicked: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run_worker(args: Args) -> ExitCode {
    log::info!("cohort {} starting up", cohort::VERSION);

    let config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => {
                log::info!("configuration loaded from {path}");
                config
            }
            Err(err) => {
                log::error!("failed to load config: {err}");
                return ExitCode::FAILURE;
            }
        },
        None => {
            log::info!("using default configuration");
            Config::default()
        }
    };
    let target_url = config.target_url.clone();

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(err) => {
            log::error!("startup failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(err) = engine.start().await {
        log::error!("startup failed: {err}");
        return ExitCode::FAILURE;
    }

    // Join the cluster when a master address is given: cookies broadcast by
    // any node land in every local session's jar within one round-trip.
    let watch_cancel = CancellationToken::new();
    if let Some(addr) = &args.master_addr {
        match WorkerClient::connect(&args.pc_id, addr).await {
            Ok(client) => {
                let sessions = engine.sessions();
                let events = engine.events();
                let target = Url::parse(&target_url).ok();
                let result = client
                    .watch_cookies(watch_cancel.clone(), move |cookies, version| {
                        events.dispatch(EngineEvent::CookieSync(CookieSyncEvent {
                            cookie_count: cookies.len(),
                            jar_version: version,
                            timestamp: Utc::now(),
                        }));
                        let Some(url) = &target else { return };
                        for id in 0..sessions.count() as u32 {
                            let Some(session) = sessions.get_session(id) else { continue };
                            for cookie in &cookies {
                                session.add_cookie(&cookie.to_set_cookie_string(), url);
                            }
                        }
                    })
                    .await;
                match result {
                    Ok(_) => log::info!("watching global cookie jar via {addr}"),
                    Err(err) => log::warn!("cookie watch unavailable: {err}"),
                }
            }
            Err(err) => log::warn!("cluster master unreachable, running standalone: {err}"),
        }
    }

    if tokio::signal::ctrl_c().await.is_err() {
        log::error!("failed to install signal handler");
        return ExitCode::FAILURE;
    }
    log::info!("signal received; shutting down");

    watch_cancel.cancel();
    engine.shutdown().await;
    log::info!("cohort shut down cleanly");
    ExitCode::SUCCESS
}
