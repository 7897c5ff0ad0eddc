use nuptial_core::criteria::default_mandatory;
use std::path::Path;

use crate::offline::load_records;

pub fn run(file: &Path) -> anyhow::Result<()> {
    let records = load_records(file)?;
    println!(
        "{:<18} {:<10} {:>12} {:<8} {:<12} {}",
        "ID", "CATEGORY", "PRICE", "STATE", "VERIFIED", "FIELDS"
    );
    let mut incomplete = 0usize;
    for record in &records {
        let mandatory: Vec<String> = default_mandatory(record.category)
            .iter()
            .map(|s| s.to_string())
            .collect();
        let complete = record.has_mandatory(&mandatory);
        if !complete {
            incomplete += 1;
        }
        println!(
            "{:<18} {:<10} {:>12.2} {:<8} {:<12} {}",
            record.id,
            record.category.as_str(),
            record.price,
            format!("{:?}", record.state).to_lowercase(),
            record.last_verified.format("%Y-%m-%d"),
            if complete { "complete" } else { "missing mandatory" },
        );
    }
    println!("\n{} records, {} incomplete", records.len(), incomplete);
    Ok(())
}
