//! Oracle node entry point: wires the oracle server and the chain reporter
//! together and runs them until ctrl-c.

use anyhow::{Context, Result};
use ethers::signers::{LocalWallet, Signer};
use oracle_node::config::AppConfig;
use oracle_node::reporter::chain::{oracle_contract_address, WsConnector};
use oracle_node::reporter::Reporter;
use oracle_node::server::OracleServer;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::load()?;
    cfg.validate()?;
    info!(config = %cfg.digest(), "starting oracle node");

    let wallet = LocalWallet::decrypt_keystore(&cfg.l1.keystore_path, &cfg.l1.keystore_password)
        .with_context(|| format!("cannot open keystore {}", cfg.l1.keystore_path))?;
    let validator = cfg.l1.validator()?;

    let server = Arc::new(OracleServer::new(cfg.oracle.clone()).await?);
    info!(version = server.version(), "oracle server initialized");

    let (stop_tx, stop_rx) = watch::channel(false);
    let connector = WsConnector {
        ws_url: cfg.l1.ws_url.clone(),
        wallet: wallet.clone(),
        contract_address: oracle_contract_address(),
    };
    let reporter = Reporter::new(
        Box::new(connector),
        wallet.address(),
        validator,
        server.clone(),
        cfg.reporter.clone(),
        stop_rx,
    );

    let server_task = tokio::spawn({
        let server = server.clone();
        async move { server.run().await }
    });
    let mut reporter_task = tokio::spawn(reporter.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        result = &mut reporter_task => {
            // the reporter only returns early on a startup failure
            error!("reporter exited unexpectedly");
            server.stop();
            let _ = server_task.await;
            return result.context("reporter task aborted")?;
        }
    }

    let _ = stop_tx.send(true);
    server.stop();
    let _ = reporter_task.await;
    let _ = server_task.await;
    info!("oracle node stopped");
    Ok(())
}
