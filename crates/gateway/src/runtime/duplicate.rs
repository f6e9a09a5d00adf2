//! Flags a mutating tool call that repeats a recent one with the same
//! intent.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use cf_domain::config::DuplicatesConfig;
use cf_domain::error::Result;
use cf_domain::model::ActionRecord;
use cf_store::Store;
use cf_tools::builtin::is_mutating;
use cf_tools::ToolHandler;

/// A repeat that was not executed.
#[derive(Debug, Clone)]
pub struct DuplicateWarning {
    pub prior: ActionRecord,
    /// Fed back to the model in place of the tool result.
    pub system_message: String,
}

#[derive(Clone)]
pub struct DuplicateDetector {
    store: Arc<dyn Store>,
    window: Duration,
    threshold: f64,
}

impl DuplicateDetector {
    pub fn new(store: Arc<dyn Store>, config: &DuplicatesConfig) -> Self {
        Self {
            store,
            window: config.window(),
            threshold: config.text_similarity,
        }
    }

    /// Compare against the most recent successful record of the same tool
    /// in this conversation. Failed attempts are never repeats.
    pub async fn check(
        &self,
        conversation_id: Uuid,
        tool_name: &str,
        handler: &dyn ToolHandler,
        arguments: &Value,
    ) -> Result<Option<DuplicateWarning>> {
        if !is_mutating(tool_name) {
            return Ok(None);
        }
        let Some(prior) = self
            .store
            .latest_successful_action(conversation_id, tool_name)
            .await?
        else {
            return Ok(None);
        };

        let elapsed = (Utc::now() - prior.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if elapsed > self.window {
            return Ok(None);
        }

        match handler.judge_repeat(&prior.arguments, arguments, self.threshold) {
            Some(true) => {
                tracing::info!(
                    tool = tool_name,
                    prior_id = %prior.id,
                    elapsed_secs = elapsed.as_secs(),
                    "duplicate tool call held back"
                );
                let system_message = warning_text(tool_name, elapsed, &prior);
                Ok(Some(DuplicateWarning {
                    prior,
                    system_message,
                }))
            }
            Some(false) | None => Ok(None),
        }
    }
}

fn warning_text(tool_name: &str, elapsed: Duration, prior: &ActionRecord) -> String {
    let args = serde_json::to_string(&prior.arguments).unwrap_or_default();
    format!(
        "Possible duplicate: `{tool_name}` already ran {} ago (at {}) with arguments {args} \
         and returned: {}. This call was NOT executed. If the repeat is intended, issue the \
         same call again; otherwise continue without it.",
        format_elapsed(elapsed),
        prior.created_at.format("%H:%M:%S UTC"),
        prior.result_summary,
    )
}

pub(crate) fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    match secs {
        0..=59 => format!("{secs}s"),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}
