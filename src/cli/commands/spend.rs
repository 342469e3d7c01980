//! Spend Command
//!
//! Show windowed spend against every budget policy that applies to a user.

use crate::cli::util::CommandContext;
use crate::types::{Result, UserId};

pub async fn run(user: &str, json: bool) -> Result<()> {
    let ctx = CommandContext::load()?;
    let router = ctx.router()?;
    let user_id = UserId::from(user);
    let statuses = router.governor().status(&user_id).await?;

    if json {
        let body = serde_json::json!({
            "user_id": user_id,
            "ledger": ctx.ledger.backend(),
            "policies": statuses,
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Spend for {} ({} ledger)", user_id, ctx.ledger.backend());
    println!("══════════════════════════════════════");
    if statuses.is_empty() {
        println!("No budget policies apply.");
    }
    for status in &statuses {
        println!("  {}", status.summary());
    }
    Ok(())
}
