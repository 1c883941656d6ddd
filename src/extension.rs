//! Process wiring
//!
//! Startup order:
//! 1. liveness marker
//! 2. embedded broker (with its leaf link)
//! 3. local client, with bounded retry
//! 4. lifecycle registration
//! 5. event bridge until SHUTDOWN
//!
//! Teardown closes the client, then shuts the broker down. Teardown also
//! runs when a later step fails, and the first error is returned.

use crate::bridge::{BridgeStats, EventBridge};
use crate::broker::{self, BrokerHandle};
use crate::client::BrokerClient;
use crate::config::ExtensionConfig;
use crate::error::Result;
use crate::lifecycle::{EventKind, LifecycleClient};
use crate::marker;
use tracing::{error, info, warn};

/// Run the extension to completion.
///
/// Returns `Ok` after a SHUTDOWN event has been handled and teardown is done.
pub async fn run(config: &ExtensionConfig) -> Result<BridgeStats> {
    marker::create(&config.marker_path)?;

    let broker = broker::start(config.broker.clone())?;
    info!(
        listen = %config.broker.host(),
        port = config.broker.port(),
        "Embedded broker started"
    );

    let client = match BrokerClient::connect(config.local_broker_addr(), &config.retry).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to connect to embedded broker");
            shutdown_broker(&broker).await;
            return Err(e);
        }
    };

    let result = serve(config, &client).await;

    if let Err(e) = client.close().await {
        warn!(error = %e, "Failed to close broker client");
    }
    shutdown_broker(&broker).await;

    match &result {
        Ok(stats) => info!(events = stats.events, "Extension exiting"),
        Err(e) => error!(error = %e, "Extension failed"),
    }
    result
}

/// Register with the lifecycle API and bridge events until SHUTDOWN.
async fn serve(config: &ExtensionConfig, client: &BrokerClient) -> Result<BridgeStats> {
    let lifecycle = LifecycleClient::from_config(config)?;
    let session = lifecycle
        .register(&[EventKind::Invoke, EventKind::Shutdown])
        .await?;

    let mut bridge = EventBridge::new(
        lifecycle,
        client.clone(),
        config.topic.clone(),
        config.messages.clone(),
    );
    bridge.run(&session).await
}

async fn shutdown_broker(broker: &BrokerHandle) {
    if let Err(e) = broker.shutdown().await {
        warn!(error = %e, "Embedded broker shutdown reported an error");
    }
}
