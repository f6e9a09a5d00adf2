//! Token sink: batches streamed reply text into durable [`TokenChunk`]s.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;
use uuid::Uuid;

use cf_domain::config::EngineConfig;
use cf_domain::error::Result;
use cf_domain::model::TokenChunk;
use cf_store::Store;

/// Buffers reply fragments for one turn and writes them as ordered
/// chunks. Also keeps the full reply text written so far.
pub struct TokenSink {
    store: Arc<dyn Store>,
    turn_id: Uuid,
    interval: Duration,
    threshold_chars: usize,

    seq: u64,
    buffer: String,
    last_flush: Instant,
    text: String,
}

impl TokenSink {
    pub fn new(store: Arc<dyn Store>, turn_id: Uuid, config: &EngineConfig) -> Self {
        Self {
            store,
            turn_id,
            interval: config.flush_interval(),
            threshold_chars: config.flush_threshold_chars,
            seq: 0,
            buffer: String::new(),
            last_flush: Instant::now(),
            text: String::new(),
        }
    }

    /// Add a fragment; flushes when the interval has passed since the
    /// last flush or the buffer outgrew the threshold.
    pub async fn absorb(&mut self, fragment: &str) -> Result<()> {
        if fragment.is_empty() {
            return Ok(());
        }
        self.buffer.push_str(fragment);
        self.text.push_str(fragment);

        if self.last_flush.elapsed() >= self.interval
            || self.buffer.chars().count() > self.threshold_chars
        {
            self.flush().await?;
        }
        Ok(())
    }

    /// Write the buffered text as the next chunk. No-op when empty.
    pub async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let seq = self.seq + 1;
        self.store
            .append_chunk(TokenChunk {
                turn_id: self.turn_id,
                seq,
                text: self.buffer.clone(),
                created_at: Utc::now(),
            })
            .await?;
        self.seq = seq;
        self.buffer.clear();
        self.last_flush = Instant::now();
        Ok(())
    }

    /// When an idle stream should force a flush. `None` with nothing
    /// buffered.
    pub fn deadline(&self) -> Option<Instant> {
        (!self.buffer.is_empty()).then(|| self.last_flush + self.interval)
    }

    /// Full reply text absorbed so far.
    pub fn text(&self) -> &str {
        &self.text
    }
}

/// Delete a turn's chunks once `delay` has passed. Detached so it
/// outlives the task that scheduled it.
pub fn schedule_chunk_purge(
    store: Arc<dyn Store>,
    turn_id: Uuid,
    delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match store.delete_chunks(turn_id).await {
            Ok(n) => tracing::debug!(%turn_id, removed = n, "token chunks purged"),
            Err(e) => tracing::warn!(%turn_id, error = %e, "token chunk purge failed"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_store::MemoryStore;

    fn sink(store: &MemoryStore) -> (TokenSink, Uuid) {
        let turn_id = Uuid::new_v4();
        let config = EngineConfig::default();
        (TokenSink::new(Arc::new(store.clone()), turn_id, &config), turn_id)
    }

    #[tokio::test(start_paused = true)]
    async fn small_fragments_wait_for_interval() {
        let store = MemoryStore::new();
        let (mut sink, turn_id) = sink(&store);

        sink.absorb("Hel").await.unwrap();
        sink.absorb("lo").await.unwrap();
        assert!(store.list_chunks(turn_id).await.unwrap().is_empty());
        assert!(sink.deadline().is_some());

        tokio::time::advance(Duration::from_millis(60)).await;
        sink.absorb(" world").await.unwrap();

        let chunks = store.list_chunks(turn_id).await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].seq, 1);
        assert_eq!(chunks[0].text, "Hello world");
        assert!(sink.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_buffer_flushes_immediately() {
        let store = MemoryStore::new();
        let (mut sink, turn_id) = sink(&store);

        sink.absorb(&"x".repeat(101)).await.unwrap();
        assert_eq!(store.list_chunks(turn_id).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_increasing_sequence() {
        let store = MemoryStore::new();
        let (mut sink, turn_id) = sink(&store);

        sink.absorb("a").await.unwrap();
        sink.flush().await.unwrap();
        sink.flush().await.unwrap();
        sink.absorb("b").await.unwrap();
        sink.flush().await.unwrap();

        let chunks = store.list_chunks(turn_id).await.unwrap();
        let seqs: Vec<u64> = chunks.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, sink.text());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_waits_for_delay() {
        let store = MemoryStore::new();
        let (mut sink, turn_id) = sink(&store);
        sink.absorb(&"y".repeat(120)).await.unwrap();

        let handle = schedule_chunk_purge(
            Arc::new(store.clone()),
            turn_id,
            Duration::from_secs(1),
        );
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(store.list_chunks(turn_id).await.unwrap().len(), 1);

        handle.await.unwrap();
        assert!(store.list_chunks(turn_id).await.unwrap().is_empty());
    }
}
