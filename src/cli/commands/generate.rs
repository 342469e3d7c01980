//! Generate Command
//!
//! Run one narrative request against the configured providers.
//!
//! Usage:
//!   talegate generate --user <id> --prompt <text> [--history turns.json]
//!                     [--max-attempts N] [--json]

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cli::util::CommandContext;
use crate::types::{GenerationRequest, GenerationResult, Result, ResultExt, TaleError, Turn};

pub struct GenerateOptions {
    pub user: String,
    pub prompt: String,
    pub history: Option<PathBuf>,
    pub max_attempts: Option<usize>,
    pub json: bool,
}

pub async fn run(options: GenerateOptions) -> Result<()> {
    let ctx = CommandContext::load()?;
    let router = ctx.router()?;

    let mut request = GenerationRequest::new(options.user, options.prompt);
    if let Some(path) = &options.history {
        request = request.with_history(read_history(path)?);
    }
    if let Some(max_attempts) = options.max_attempts {
        request = request.with_max_attempts(max_attempts);
    }

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling request");
                cancel.cancel();
            }
        }
    });

    let outcome = router
        .generate_narrative_with_cancel(&request, cancel)
        .await;
    watcher.abort();

    debug!("{}", ctx.metrics.snapshot().display());

    match outcome {
        Ok(result) => print_result(&result, options.json),
        Err(err) => {
            report_failure(&err, options.json)?;
            Err(err)
        }
    }
}

/// Load prior turns from a JSON array of `{ "role": "player" | "narrator", "content": ... }`
pub fn read_history(path: &Path) -> Result<Vec<Turn>> {
    let raw = std::fs::read_to_string(path)
        .with_context_fn(|| format!("Failed to read history file {}", path.display()))?;
    Ok(serde_json::from_str(&raw)?)
}

fn print_result(result: &GenerationResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    println!("{}", result.content.text.trim());
    println!();
    println!(
        "── {} | {} in / {} out tokens{} | cost {} | {} attempt(s)",
        result.provider_name,
        result.content.tokens_in,
        result.content.tokens_out,
        if result.content.estimated { " (est.)" } else { "" },
        result.cost,
        result.attempts.len()
    );
    Ok(())
}

fn report_failure(err: &TaleError, json: bool) -> Result<()> {
    if json {
        let body = serde_json::json!({
            "error": err.user_message(),
            "detail": err.to_string(),
            "attempts": err.attempts(),
        });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    eprintln!("{}", err.user_message());
    for (index, attempt) in err.attempts().iter().enumerate() {
        eprintln!(
            "  {}. {} {}",
            index + 1,
            attempt.provider_name.as_deref().unwrap_or("-"),
            attempt.outcome_label()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TurnRole;
    use tempfile::TempDir;

    #[test]
    fn test_read_history() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("turns.json");
        std::fs::write(
            &path,
            r#"[
                {"role": "narrator", "content": "A door creaks open. Enter? (Y/N)"},
                {"role": "player", "content": "Y"}
            ]"#,
        )
        .unwrap();

        let turns = read_history(&path).unwrap();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].role, TurnRole::Narrator);
        assert_eq!(turns[1], Turn::player("Y"));
    }

    #[test]
    fn test_read_history_errors() {
        let dir = TempDir::new().unwrap();
        assert!(read_history(&dir.path().join("missing.json")).is_err());

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, r#"[{"role": "villain", "content": "x"}]"#).unwrap();
        assert!(matches!(read_history(&bad), Err(TaleError::Json(_))));
    }
}
