use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use disbursement_tss::{
    bootstrap::Dependencies,
    config::Config,
    server::{self, AppState},
};

#[derive(Parser)]
#[command(name = "tss")]
#[command(about = "Transaction submission service for bulk Stellar payments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the submitter engine and the admin HTTP server
    Serve,
    /// Manage the channel account pool
    #[command(name = "channel-accounts", subcommand)]
    ChannelAccounts(ChannelAccountsCommand),
}

#[derive(Subcommand)]
enum ChannelAccountsCommand {
    View,
    Create { count: usize },
    /// Grow or shrink the pool to `count` (defaults to NUM_CHANNEL_ACCOUNTS)
    Ensure { count: Option<usize> },
    Delete(DeleteArgs),
    Verify {
        #[arg(long)]
        delete_invalid_accounts: bool,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct DeleteArgs {
    #[arg(long)]
    id: Option<String>,
    #[arg(long)]
    all: bool,
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,disbursement_tss=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "Failed to listen for SIGTERM"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
    cancel.cancel();
}

async fn serve(deps: Dependencies) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    let engine = deps.submitter().start(cancel.clone());

    let app = server::create_app(AppState {
        pool_manager: deps.pool_manager.clone(),
        tracker: deps.tracker.clone(),
    });
    let server_cancel = cancel.clone();
    let served = server::run_server(app, &deps.config.bind_address, async move {
        server_cancel.cancelled().await
    })
    .await;
    if served.is_err() {
        cancel.cancel();
    }

    engine.await.context("submitter engine task panicked")?;
    served?;
    info!("Shutdown complete");
    Ok(())
}

async fn channel_accounts(deps: Dependencies, command: ChannelAccountsCommand) -> Result<()> {
    let manager = &deps.pool_manager;
    match command {
        ChannelAccountsCommand::View => {
            let view = manager.view().await?;
            for account in &view.accounts {
                println!(
                    "{}\t{}\t{}",
                    account.public_key,
                    account.lease_state,
                    account.created_at.to_rfc3339()
                );
            }
            println!(
                "total={} free={} leased={} pending_deletion={}",
                view.accounts.len(),
                view.free,
                view.leased,
                view.pending_deletion
            );
        }
        ChannelAccountsCommand::Create { count } => {
            let created = manager.create(count).await?;
            info!(count = created.len(), "Created channel accounts");
            for pk in created {
                println!("{}", pk);
            }
        }
        ChannelAccountsCommand::Ensure { count } => {
            let Some(target) = count.or(deps.config.num_channel_accounts) else {
                bail!("pass a count or set NUM_CHANNEL_ACCOUNTS");
            };
            let outcome = manager.ensure_count(target).await?;
            info!(
                target,
                created = outcome.created.len(),
                deleted = outcome.deleted.len(),
                "Channel account pool resized"
            );
        }
        ChannelAccountsCommand::Delete(DeleteArgs { id: Some(pk), .. }) => {
            manager.delete(&pk).await?;
            info!(public_key = %pk, "Deleted channel account");
        }
        ChannelAccountsCommand::Delete(_) => {
            let deleted = manager.delete_all().await?;
            info!(count = deleted.len(), "Deleted all channel accounts");
        }
        ChannelAccountsCommand::Verify {
            delete_invalid_accounts,
        } => {
            let report = manager.verify(delete_invalid_accounts).await?;
            for pk in &report.invalid {
                println!("invalid\t{}", pk);
            }
            info!(
                checked = report.checked,
                invalid = report.invalid.len(),
                pruned = report.pruned.len(),
                "Channel account verification finished"
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = Config::from_env().context("invalid configuration")?;
    info!(?config, "Configuration loaded");
    let deps = Dependencies::build(config)
        .await
        .context("failed to initialize dependencies")?;

    match cli.command {
        Commands::Serve => serve(deps).await,
        Commands::ChannelAccounts(command) => channel_accounts(deps, command).await,
    }
}
