use nuptial_agents::{BudgetDistributorAgent, PlannerAgent, SpecializedAgent};
use nuptial_bus::MessageBus;
use nuptial_core::{topic, Category, CoreConfig, Criteria};
use nuptial_storage::{MemoryProviderStore, SessionStore};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::info;

use crate::offline::{load_records, StaticGeneration};

pub async fn run(
    criteria_path: &Path,
    providers: Option<&Path>,
    timeout_secs: u64,
    sessions_dir: &Path,
) -> anyhow::Result<()> {
    let text = fs::read_to_string(criteria_path)
        .map_err(|e| anyhow::anyhow!("cannot read {}: {}", criteria_path.display(), e))?;
    let criteria: Criteria = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("invalid criteria file: {}", e))?;

    let cfg = CoreConfig::default();
    let bus = MessageBus::new(cfg.clone());
    let store = Arc::new(MemoryProviderStore::new());
    if let Some(path) = providers {
        let records = load_records(path)?;
        info!(count = records.len(), "Seeding provider store");
        store.seed(records).await?;
    }
    fs::create_dir_all(sessions_dir)?;
    let memory = Arc::new(SessionStore::new(sessions_dir)?);
    let planner = PlannerAgent::new(Arc::clone(&bus), memory, cfg.clone());

    let (shutdown_tx, _) = broadcast::channel(8);
    bus.serve(
        topic::BUDGET,
        BudgetDistributorAgent::new(Arc::clone(&bus), cfg.clone()),
        shutdown_tx.subscribe(),
    );
    for category in Category::ALL {
        bus.serve(
            topic::for_category(category),
            SpecializedAgent::new(
                category,
                Arc::clone(&store) as _,
                Arc::new(StaticGeneration),
                Arc::clone(&bus),
                cfg.clone(),
            ),
            shutdown_tx.subscribe(),
        );
    }
    bus.serve(topic::PLANNER, Arc::clone(&planner), shutdown_tx.subscribe());

    // Expire overdue intentions once a second.
    let ticker = Arc::clone(&planner);
    let mut ticker_shutdown = shutdown_tx.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(1)) => ticker.check_deadlines().await,
                _ = ticker_shutdown.recv() => break,
            }
        }
    });

    let session_id = planner.start_session(criteria).await?;
    info!(session_id, "Planning session started");

    let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
        loop {
            if let Some(plan) = planner.plan(&session_id).await {
                return plan;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;

    let _ = shutdown_tx.send(());
    match outcome {
        Ok(plan) => {
            println!("{}", serde_json::to_string_pretty(&plan)?);
            Ok(())
        }
        Err(_) => {
            planner.abort_session(&session_id).await?;
            anyhow::bail!("planning session timed out after {}s", timeout_secs)
        }
    }
}
