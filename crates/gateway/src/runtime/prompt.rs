//! Prompt assembly for the first model call of a turn.

use cf_domain::error::{Error, Result};
use cf_domain::model::{Conversation, HistoryEntry};
use cf_domain::tool::Message;
use cf_store::Store;
use uuid::Uuid;

const SYSTEM_INSTRUCTION: &str = "\
You are an assistant taking part in a group chat. Several people may write \
in the conversation; each user message starts with the author's name. \
Answer the latest request concisely. Use the provided tools when an action \
is needed, and never repeat an action that already succeeded.";

/// Build the message list for depth 0: system instruction, one context
/// section per conversation topic, the mapped history, and an empty
/// assistant slot for the reply being generated.
pub async fn assemble(
    store: &dyn Store,
    conversation_id: Uuid,
    history: &[HistoryEntry],
) -> Result<Vec<Message>> {
    let conversation = store
        .get_conversation(conversation_id)
        .await?
        .ok_or_else(|| Error::not_found("conversation", conversation_id))?;

    let mut messages = vec![Message::system(format!(
        "{SYSTEM_INSTRUCTION}\n\nConversation: \"{}\"",
        conversation.name
    ))];

    for topic in &conversation.topics {
        if let Some(section) = topic_section(store, &conversation, topic).await? {
            messages.push(Message::system(section));
        }
    }

    messages.extend(history.iter().map(map_entry));
    messages.push(Message::assistant(""));
    Ok(messages)
}

fn map_entry(entry: &HistoryEntry) -> Message {
    match entry {
        HistoryEntry::User { author, content } => Message::user(format!("{author}: {content}")),
        HistoryEntry::Assistant { content } => Message::assistant(content.clone()),
    }
}

async fn topic_section(
    store: &dyn Store,
    conversation: &Conversation,
    topic: &str,
) -> Result<Option<String>> {
    match topic {
        "todo" => {
            let lists = store.list_todo_lists(conversation.id).await?;
            if lists.is_empty() {
                return Ok(Some("This conversation has no todo lists yet.".into()));
            }
            let mut lines = Vec::with_capacity(lists.len());
            for list in &lists {
                let items = store.list_work_items(list.id).await?;
                let open = items.iter().filter(|i| !i.done).count();
                lines.push(format!(
                    "- \"{}\" (id {}): {open} open, {} done",
                    list.title,
                    list.id,
                    items.len() - open
                ));
            }
            Ok(Some(format!("Current todo lists:\n{}", lines.join("\n"))))
        }
        "files" => {
            let files = store.list_files(conversation.id).await?;
            if files.is_empty() {
                return Ok(Some("No files have been written in this conversation.".into()));
            }
            let paths: Vec<String> = files.iter().map(|f| format!("- {}", f.path)).collect();
            Ok(Some(format!("Files in this conversation:\n{}", paths.join("\n"))))
        }
        other => {
            tracing::debug!(topic = other, "no prompt section for topic");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_domain::model::TodoList;
    use cf_domain::tool::Role;
    use cf_store::MemoryStore;

    #[tokio::test]
    async fn history_is_prefixed_and_slot_appended() {
        let store = MemoryStore::new();
        let conv = store
            .create_conversation(Conversation::new("Weekend"))
            .await
            .unwrap();

        let history = vec![
            HistoryEntry::user("alice", "hi"),
            HistoryEntry::assistant("hello"),
            HistoryEntry::user("bob", "rename this chat"),
        ];
        let messages = assemble(&store, conv.id, &history).await.unwrap();

        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("\"Weekend\""));
        assert_eq!(messages[1].content, "alice: hi");
        assert_eq!(messages[2], Message::assistant("hello"));
        assert_eq!(messages[3].content, "bob: rename this chat");
        assert!(messages[4].is_placeholder());
    }

    #[tokio::test]
    async fn topics_add_context_sections() {
        let store = MemoryStore::new();
        let conv = store
            .create_conversation(Conversation::new("Plans"))
            .await
            .unwrap();
        let list = store
            .create_todo_list(TodoList::new(conv.id, "Groceries"))
            .await
            .unwrap();
        store.create_work_item(list.id, "Buy milk").await.unwrap();
        store.write_file(conv.id, "notes.md", "x").await.unwrap();
        store.add_topic(conv.id, "todo").await.unwrap();
        store.add_topic(conv.id, "files").await.unwrap();

        let messages = assemble(&store, conv.id, &[]).await.unwrap();
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(system.len(), 3);
        assert!(system.iter().any(|s| s.contains("\"Groceries\"") && s.contains("1 open")));
        assert!(system.iter().any(|s| s.contains("- notes.md")));
    }

    #[tokio::test]
    async fn missing_conversation_is_not_found() {
        let store = MemoryStore::new();
        let err = assemble(&store, Uuid::new_v4(), &[]).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { kind: "conversation", .. }));
    }
}
