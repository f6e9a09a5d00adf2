//! Append-only per-conversation log of executed tool calls.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use cf_domain::config::ActionsConfig;
use cf_domain::error::Result;
use cf_domain::model::ActionRecord;
use cf_store::Store;
use cf_tools::ToolOutput;

/// Writes [`ActionRecord`]s and keeps each conversation under the
/// retention cap.
#[derive(Clone)]
pub struct ActionLog {
    store: Arc<dyn Store>,
    max_records: usize,
}

impl ActionLog {
    pub fn new(store: Arc<dyn Store>, config: &ActionsConfig) -> Self {
        Self {
            store,
            max_records: config.max_records_per_conversation,
        }
    }

    pub async fn record_success(
        &self,
        conversation_id: Uuid,
        turn_id: Option<Uuid>,
        tool_name: &str,
        arguments: &Value,
        output: &ToolOutput,
    ) -> Result<ActionRecord> {
        let mut record = new_record(conversation_id, turn_id, tool_name, arguments);
        record.result_summary = output.summary.clone();
        record.entity = output.entity.clone();
        self.append(record.clone()).await?;
        Ok(record)
    }

    pub async fn record_failure(
        &self,
        conversation_id: Uuid,
        turn_id: Option<Uuid>,
        tool_name: &str,
        arguments: &Value,
        error: &str,
    ) -> Result<ActionRecord> {
        let mut record = new_record(conversation_id, turn_id, tool_name, arguments);
        record.result_summary = error.to_string();
        record.is_error = true;
        self.append(record.clone()).await?;
        Ok(record)
    }

    /// Append, then evict the oldest records beyond the cap.
    pub async fn append(&self, record: ActionRecord) -> Result<()> {
        let conversation_id = record.conversation_id;
        self.store.append_action(record).await?;
        let evicted = self
            .store
            .prune_actions(conversation_id, self.max_records)
            .await?;
        if evicted > 0 {
            tracing::debug!(%conversation_id, evicted, "action log pruned");
        }
        Ok(())
    }

    /// Newest first.
    pub async fn recent(&self, conversation_id: Uuid, limit: usize) -> Result<Vec<ActionRecord>> {
        self.store.list_actions(conversation_id, limit).await
    }
}

fn new_record(
    conversation_id: Uuid,
    turn_id: Option<Uuid>,
    tool_name: &str,
    arguments: &Value,
) -> ActionRecord {
    ActionRecord {
        id: Uuid::new_v4(),
        conversation_id,
        turn_id,
        tool_name: tool_name.to_string(),
        arguments: arguments.clone(),
        result_summary: String::new(),
        is_error: false,
        entity: None,
        created_at: Utc::now(),
    }
}
