use std::sync::Arc;

use anyhow::Context;
use controlplane_operator::{
    config::OperatorConfig, controlplane_controller as cpc, gateway::KubeGateway,
};
use futures::StreamExt;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("controlplane-operator starting up");

    let config = OperatorConfig::from_env().context("reading operator configuration")?;
    let client = Client::try_default().await?;
    let cancel = CancellationToken::new();

    let ctx = Arc::new(cpc::Ctx {
        gateway: Arc::new(KubeGateway::new(client.clone(), config.field_manager.clone())),
        config,
        cancel: cancel.clone(),
    });
    let controller = cpc::controller(client)
        .run(cpc::reconcile, cpc::error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                tracing::warn!(error=?e, "controlplane reconcile error");
            }
        });

    // in-flight deletion waits stop polling; the controller drains on the same signal
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    });
    controller.await;
    Ok(())
}
