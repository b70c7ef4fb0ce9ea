mod cli;

use std::{
    io::{self, Read},
    path::Path,
    process::ExitCode,
};

use anyhow::{Context, Result};
use forestcache::{config::Config, service::Response, App};
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    task::JoinSet,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Cli::parse();
    let cfg = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    };

    // Configuration problems are fatal only here, before any request runs.
    let app = match App::from_config(&cfg) {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, config = %cfg.config_path.display(), "startup failed");
            match e.to_body().to_json() {
                Ok(body) => println!("{body}"),
                Err(_) => println!("{e}"),
            }
            return ExitCode::FAILURE;
        }
    };

    let serving = matches!(args.command, Command::Serve);
    let (outcome, interrupted) = tokio::select! {
        outcome = run(&app, args.command) => (outcome, false),
        () = shutdown_signal() => {
            info!("shutdown signal received");
            // Interrupting `serve` is its normal way to stop.
            (Ok(serving), true)
        }
    };
    app.shutdown().await;

    let success = match outcome {
        Ok(success) => success,
        Err(e) => {
            let detail = format!("{e:#}");
            error!(error = %detail, "command failed");
            false
        }
    };
    if interrupted {
        // A stdin read in flight cannot be cancelled and would keep the runtime alive.
        std::process::exit(if success { 0 } else { 1 });
    }
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Returns whether the command succeeded.
async fn run(app: &App, command: Command) -> Result<bool> {
    let service = &app.service;
    let response = match command {
        Command::Training => service.training().await,
        Command::Prediction => service.prediction().await,
        Command::SubmitTraining { file, random_state, estimators } => {
            let body = read_body(file.as_deref())?;
            match (random_state, estimators) {
                (Some(rs), Some(est)) => service.configure_and_submit_training(rs, est, &body).await,
                _ => service.submit_training(&body).await,
            }
        }
        Command::SubmitPrediction { file } => {
            let body = read_body(file.as_deref())?;
            service.submit_prediction(&body).await
        }
        Command::ConfigureTraining { random_state, estimators } => {
            service.configure_training(random_state, estimators)
        }
        Command::Status => service.status(),
        Command::Serve => return serve(app).await.map(|_| true),
    };
    println!("{}", response.body);
    Ok(response.is_success())
}

fn read_body(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading dataset {}", path.display())),
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf).context("reading dataset from stdin")?;
            Ok(buf)
        }
    }
}

async fn serve(app: &App) -> Result<()> {
    info!("serving requests from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut inflight = JoinSet::new();

    while let Some(line) = lines.next_line().await.context("reading request")? {
        if line.trim().is_empty() {
            continue;
        }
        if line.trim().eq_ignore_ascii_case("quit") {
            break;
        }
        let service = app.service.clone();
        inflight.spawn(async move {
            let response = service.handle_line(&line).await;
            print_response(&line, &response);
        });
    }

    while let Some(joined) = inflight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "request task failed");
        }
    }
    Ok(())
}

fn print_response(request: &str, response: &Response) {
    let body = serde_json::from_str::<serde_json::Value>(&response.body)
        .unwrap_or_else(|_| json!(response.body));
    println!(
        "{}",
        json!({ "request": request.trim(), "status": response.status, "body": body })
    );
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for interrupt");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => {}
        () = terminate => {}
    }
}
