//! VRRP daemon binary

use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use vrrp::{Dependency, InterfaceEvent, VrrpServer};
use vrrpd::{Config, KernelAdapter, MetricsRegistry, StatusServer};

#[tokio::main]
async fn main() -> common::Result<()> {
    // Load configuration first (needed for logging settings)
    let config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            // Can't use tracing yet - not initialized
            eprintln!("Configuration error: {}", e);
            return Err(common::Error::config(e));
        }
    };

    common::logging::init_with_level(config.log_level(), config.json_logs());
    info!("vrrpd starting");

    let adapter = Arc::new(KernelAdapter::new(&config.interfaces));
    let dependencies: Vec<Arc<dyn Dependency>> = vec![adapter.clone()];
    let server = VrrpServer::spawn(adapter, dependencies, config.engine_settings());

    if let Err(e) = server.wait_ready().await {
        error!(error = %e, "VRRP engine failed to start");
        server.shutdown().await;
        return Err(common::Error::vrrp(e));
    }

    seed(&server, &config).await;

    let (stop_status, status_stopped) = oneshot::channel::<()>();
    let status = StatusServer::new(
        server.registry(),
        server.drop_counters(),
        Arc::new(MetricsRegistry::new()),
        config.server.status_listen.clone(),
    );
    let status_task = tokio::spawn(status.run(async move {
        let _ = status_stopped.await;
    }));

    wait_for_shutdown().await?;

    let _ = stop_status.send(());
    match status_task.await {
        Ok(Err(e)) => warn!(error = %e, "Status server failed"),
        Err(e) => warn!(error = %e, "Status server task failed"),
        Ok(Ok(())) => {}
    }

    server.shutdown().await;
    info!("vrrpd stopped");
    Ok(())
}

/// Announce configured interfaces and create the configured instances
async fn seed(server: &VrrpServer, config: &Config) {
    for interface in &config.interfaces {
        let address = interface
            .address
            .or_else(|| KernelAdapter::primary_address(&interface.name));
        let Some(address) = address else {
            warn!(interface = %interface.name, "No IPv4 address, instances stay dormant");
            continue;
        };
        if let Err(e) = server
            .notify_interface(InterfaceEvent::AddressAssigned {
                if_index: interface.if_index,
                address,
            })
            .await
        {
            warn!(interface = %interface.name, error = %e, "Failed to announce interface");
        }
    }

    for instance in &config.instances {
        match server.create_instance(instance.to_config()).await {
            Ok(outcome) => info!(
                if_index = instance.if_index,
                vrid = instance.vrid,
                ?outcome,
                "Configured VRRP instance"
            ),
            Err(e) => error!(
                if_index = instance.if_index,
                vrid = instance.vrid,
                error = %e,
                "Failed to configure VRRP instance"
            ),
        }
    }
}

/// Wait for SIGHUP, SIGTERM or Ctrl+C; all of them stop the daemon
async fn wait_for_shutdown() -> common::Result<()> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::select! {
        _ = hangup.recv() => info!("Received SIGHUP, shutting down"),
        _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
    }
    Ok(())
}
