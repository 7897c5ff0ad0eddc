use nuptial_bus::MessageBus;
use nuptial_core::CoreConfig;
use nuptial_crawler::CrawlerService;
use nuptial_storage::MemoryProviderStore;
use std::path::Path;
use std::sync::Arc;

use crate::offline::{load_records, SeedSearch};

pub async fn run(providers: &Path) -> anyhow::Result<()> {
    let records = load_records(providers)?;
    let cfg = CoreConfig::default();
    let bus = MessageBus::new(cfg.clone());
    let store = Arc::new(MemoryProviderStore::new());
    let search = Arc::new(SeedSearch::new(&records));
    store.seed(records).await?;

    let crawler = CrawlerService::new(Arc::clone(&store) as _, search, bus, cfg);
    let report = crawler.sweep().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
