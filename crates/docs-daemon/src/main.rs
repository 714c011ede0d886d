//! docs-daemon: Keeps a live view of the documents in the signed-in account's
//! container and accepts document commands on stdin.

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use docs_core::Coordinator;
use docs_daemon::identity::read_token;
use docs_daemon::repl::{self, Command};
use docs_daemon::{native_collaborators, Args, Config, FileIdentityMonitor};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,docs_daemon=debug,docs_core=debug"
    } else {
        "info,docs_daemon=info,docs_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    // Logs go to stderr so stdout stays parseable with --json
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_args(args)?;
    info!("Starting docs-daemon");
    info!("Document root: {:?}", config.root);
    info!("Identity file: {:?}", config.identity_file);

    std::fs::create_dir_all(&config.root)
        .with_context(|| format!("Failed to create {}", config.root.display()))?;
    if let Some(parent) = config.identity_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    match read_token(&config.identity_file) {
        Some(token) => info!("Signed in as {}", token),
        None => info!("Signed out; write a token to the identity file to sign in"),
    }

    let identity = FileIdentityMonitor::watch(config.identity_file.clone())?;
    let collaborators = native_collaborators(&config.root, identity);
    let (handle, task) = Coordinator::spawn(config.engine.clone(), collaborators);

    let mut views = handle.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("{}", repl::HELP);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    debug!("stdin closed");
                    break;
                };
                let command = match repl::parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        eprintln!("{}", e);
                        continue;
                    }
                };
                if command == Command::Quit {
                    break;
                }
                match repl::execute(&handle, command, config.json).await {
                    Ok(output) if !output.is_empty() => println!("{}", output),
                    Ok(_) => {}
                    Err(e) => eprintln!("error: {}", e),
                }
            }

            changed = views.changed() => {
                if changed.is_err() {
                    error!("Coordinator exited");
                    break;
                }
                let view = views.borrow_and_update().clone();
                debug!(
                    "View: {:?}, {} documents, busy: {}",
                    view.phase,
                    view.documents.len(),
                    view.busy
                );
                if config.json {
                    println!("{}", serde_json::to_string(&view)?);
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    handle.shutdown();
    task.await.context("Coordinator task failed")?;
    Ok(())
}
