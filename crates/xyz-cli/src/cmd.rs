//! Subcommand implementations.

use crate::interval;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use xyz_types::{NodeConfig, XyzError, XyzResult};
use xyz_wire::{Node, Responder};

/// Parse a JSON payload given on the command line.
pub fn parse_payload(raw: &str) -> XyzResult<Value> {
    serde_json::from_str(raw)
        .map_err(|e| XyzError::Serialization(format!("Payload is not valid JSON: {e}")))
}

/// Upper- or lower-case a string payload.
fn change_case(payload: &Value, upper: bool) -> Result<String, String> {
    let text = payload
        .as_str()
        .ok_or_else(|| format!("Expected a string payload, got {payload}"))?;
    Ok(if upper {
        text.to_uppercase()
    } else {
        text.to_lowercase()
    })
}

fn reply_with_case(payload: Value, response: Responder, upper: bool) {
    let sent = match change_case(&payload, upper) {
        Ok(text) => response.send(text),
        Err(reason) => response.fail(reason),
    };
    if let Err(e) = sent {
        warn!(action = %response.action(), error = %e, "Could not reply");
    }
}

/// Register the `up` and `down` actions of the string service.
pub fn register_string_service(node: &Node) -> XyzResult<()> {
    node.register("up", |payload: Value, response: Responder| {
        reply_with_case(payload, response, true)
    })?;
    node.register("down", |payload: Value, response: Responder| {
        reply_with_case(payload, response, false)
    })?;
    Ok(())
}

/// Serve the string service and call `target` every `every_secs` until Ctrl+C.
pub async fn cmd_run(
    config: NodeConfig,
    target: String,
    payload: Value,
    every_secs: u64,
) -> XyzResult<()> {
    let (node, accept) = Node::start(config).await?;
    register_string_service(&node)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let period = Duration::from_secs(every_secs.max(1));
    let caller = Arc::clone(&node);
    let ticker = tokio::spawn(interval::every(period, shutdown_rx, move || {
        let service = target.clone();
        caller.call(&target, payload.clone(), move |result| match result {
            Ok(reply) => info!(
                service = %service,
                "my fellow service responded with {}",
                reply.body
            ),
            Err(e) => warn!(service = %service, error = %e, "Periodic call failed"),
        });
        async {}
    }));

    info!(
        node = %node.name(),
        addr = %node.local_addr(),
        "Serving up/down; press Ctrl+C to stop"
    );

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down"),
        Err(e) => error!(error = %e, "Failed to listen for Ctrl+C, shutting down"),
    }

    let _ = shutdown_tx.send(true);
    let _ = ticker.await;
    node.shutdown();
    let _ = accept.await;
    Ok(())
}

/// Call a peer once and print the reply body as JSON.
pub async fn cmd_call(
    config: NodeConfig,
    service: &str,
    payload: Value,
    timeout: Option<Duration>,
) -> XyzResult<()> {
    let (node, accept) = Node::start(config).await?;
    let result = match timeout {
        Some(deadline) => node.request_with_timeout(service, payload, deadline).await,
        None => node.request(service, payload).await,
    };
    node.shutdown();
    let _ = accept.await;

    let reply = result?;
    let body = serde_json::to_string_pretty(&reply.body)
        .map_err(|e| XyzError::Serialization(e.to_string()))?;
    println!("{body}");
    Ok(())
}

/// Ping a peer and print its uptime.
pub async fn cmd_ping(config: NodeConfig, service: &str) -> XyzResult<()> {
    let (node, accept) = Node::start(config).await?;
    let result = node.ping(service).await;
    node.shutdown();
    let _ = accept.await;

    let uptime = result?;
    println!("{service}: up {uptime}s");
    Ok(())
}
