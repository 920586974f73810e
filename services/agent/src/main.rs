//! tilth agent
//!
//! Recovers the allocations already present on the node, then schedules the
//! pods declared in the configured manifest files against the node facts.

use std::sync::Arc;

use anyhow::{Context, Result};
use tilth_agent::allocation::{recover, POD_EXEC_KEY};
use tilth_agent::scheduler::Source;
use tilth_agent::{Config, Evaluator, EvaluatorState, Scheduler, SystemdConnector};
use tilth_bus::{Consumer, Message};
use tilth_manifest::{load_pods, Constraint};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        local_dir = %config.paths.local.display(),
        runtime_dir = %config.paths.runtime.display(),
        namespaces = ?config.namespaces,
        "Starting tilth agent"
    );

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let recovered = recover(&config.paths).context("failed to recover allocations")?;
    let evaluator = Evaluator::new(
        EvaluatorState::new(recovered),
        Arc::new(SystemdConnector::new()),
        config.paths.clone(),
    );

    let sources = [
        Source::new("agent")
            .with_required(Constraint::new().with("${agent.drain}", "!= true")),
        Source::new("meta"),
    ];
    let scheduler = Scheduler::new(&sources, config.namespaces.clone(), evaluator, shutdown_rx);

    let mut agent_facts = vec![
        ("id".to_string(), config.node_id.clone()),
        ("drain".to_string(), config.drain.to_string()),
    ];
    if let Some(exec) = &config.pod_exec {
        // Published through the "agent" source, which prefixes its keys.
        let key = POD_EXEC_KEY.trim_start_matches("agent.");
        agent_facts.push((key.to_string(), exec.clone()));
    }
    scheduler
        .consume_message(Message::from_pairs("agent", agent_facts))
        .await;
    scheduler
        .consume_message(Message::new("meta", Some(config.meta.clone())))
        .await;

    for (namespace, path) in &config.pod_files {
        match load_pods(namespace, path) {
            Ok(pods) => scheduler.sync(namespace, pods).await,
            Err(e) => error!(
                namespace = %namespace,
                path = %path.display(),
                error = %e,
                "Failed to load pods"
            ),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // No new decisions arrive now; let dispatched plans finish.
    info!("Waiting for in-flight evaluations");
    scheduler.evaluator().drain().await;

    let metrics = scheduler.evaluator().metrics();
    info!(
        evaluations = metrics.evaluations,
        failures = metrics.failures,
        "Agent shutdown complete"
    );
    Ok(())
}
