//! Providers Command
//!
//! Print the effective provider order and whether each one can be built.

use crate::ai::ProviderEntry;
use crate::config::ConfigLoader;
use crate::types::Result;

pub fn run(json: bool) -> Result<()> {
    let config = ConfigLoader::load()?;

    let mut providers = config.providers.clone();
    providers.sort_by_key(|p| p.priority);

    let rows: Vec<_> = providers
        .into_iter()
        .map(|provider| {
            let status = match ProviderEntry::from_config(provider.clone()) {
                Ok(_) => "ready".to_string(),
                Err(e) => e.to_string(),
            };
            (provider, status)
        })
        .collect();

    if json {
        let body: Vec<_> = rows
            .iter()
            .map(|(p, status)| {
                serde_json::json!({
                    "name": p.name,
                    "kind": p.kind,
                    "priority": p.priority,
                    "model": p.model,
                    "timeout_ms": p.timeout_ms,
                    "status": status,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No providers configured. Add [[providers]] to .talegate/config.toml");
        return Ok(());
    }

    println!("Provider order");
    println!("══════════════════════════════════════");
    for (index, (p, status)) in rows.iter().enumerate() {
        println!(
            "  {}. {} ({}, priority {}, model {}) {}",
            index + 1,
            p.name,
            p.kind,
            p.priority,
            p.model.as_deref().unwrap_or("default"),
            status
        );
    }
    Ok(())
}
