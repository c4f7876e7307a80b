//! Local live-changes feed for Burrow.
//!
//! Wraps an [`Adapter`]'s `changes_since` in two shapes:
//! - one-shot: fetch everything since a sequence and return
//! - live: keep yielding as new revisions land, either driven by a
//!   [`ChangeSender`] notification (pushed by a writer right after commit)
//!   or, absent one, by polling on an interval
//!
//! This is the purely local counterpart to `burrow-replication`'s change
//! tracker, which drives the same shape of feed against a remote peer.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use burrow_core::adapter::Adapter;
use burrow_core::document::{ChangeEvent, ChangesOptions, Seq};
use burrow_core::error::Result;

/// A notification that a document was written, broadcast by a writer right
/// after its transaction commits.
#[derive(Debug, Clone)]
pub struct ChangeNotification {
    pub seq: Seq,
    pub doc_id: String,
}

#[derive(Debug, Clone)]
pub struct ChangeSender {
    tx: broadcast::Sender<ChangeNotification>,
}

impl ChangeSender {
    pub fn new(capacity: usize) -> (Self, ChangeReceiver) {
        let (tx, rx) = broadcast::channel(capacity);
        (ChangeSender { tx }, ChangeReceiver { rx })
    }

    pub fn notify(&self, seq: Seq, doc_id: String) {
        let _ = self.tx.send(ChangeNotification { seq, doc_id });
    }

    pub fn subscribe(&self) -> ChangeReceiver {
        ChangeReceiver {
            rx: self.tx.subscribe(),
        }
    }
}

pub struct ChangeReceiver {
    rx: broadcast::Receiver<ChangeNotification>,
}

impl ChangeReceiver {
    pub async fn recv(&mut self) -> Option<ChangeNotification> {
        loop {
            match self.rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Configuration for a changes stream.
#[derive(Debug, Clone)]
pub struct ChangesStreamOptions {
    pub since: Seq,
    pub live: bool,
    pub include_docs: bool,
    pub style_all_docs: bool,
    pub doc_ids: Option<Vec<String>>,
    pub limit: Option<u64>,
    pub selector: Option<serde_json::Value>,
    /// Polling interval for live mode when no broadcast channel is wired up.
    pub poll_interval: Duration,
}

impl Default for ChangesStreamOptions {
    fn default() -> Self {
        Self {
            since: Seq::default(),
            live: false,
            include_docs: false,
            style_all_docs: false,
            doc_ids: None,
            limit: None,
            selector: None,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl ChangesStreamOptions {
    fn as_changes_options(&self, since: Seq, limit_remaining: Option<u64>) -> ChangesOptions {
        ChangesOptions {
            since,
            limit: limit_remaining,
            include_docs: self.include_docs,
            style_all_docs: self.style_all_docs,
            doc_ids: self.doc_ids.clone(),
            selector: self.selector.clone(),
        }
    }
}

/// Fetch changes from an adapter in one-shot mode.
pub async fn get_changes(
    adapter: &dyn Adapter,
    opts: ChangesStreamOptions,
) -> Result<Vec<ChangeEvent>> {
    let changes_opts = opts.as_changes_options(opts.since.clone(), opts.limit);
    let response = adapter.changes_since(changes_opts).await?;
    Ok(response.results)
}

/// A live changes stream that yields change events as they happen.
pub struct LiveChangesStream {
    adapter: Arc<dyn Adapter>,
    receiver: Option<ChangeReceiver>,
    opts: ChangesStreamOptions,
    last_seq: Seq,
    buffer: Vec<ChangeEvent>,
    buffer_idx: usize,
    state: LiveStreamState,
    count: u64,
}

enum LiveStreamState {
    FetchingInitial,
    Yielding,
    Waiting,
    Done,
}

impl LiveChangesStream {
    pub fn new(
        adapter: Arc<dyn Adapter>,
        receiver: Option<ChangeReceiver>,
        opts: ChangesStreamOptions,
    ) -> Self {
        let last_seq = opts.since.clone();
        Self {
            adapter,
            receiver,
            opts,
            last_seq,
            buffer: Vec::new(),
            buffer_idx: 0,
            state: LiveStreamState::FetchingInitial,
            count: 0,
        }
    }

    async fn fetch_changes(&mut self) -> Result<()> {
        let remaining = self.opts.limit.map(|l| l.saturating_sub(self.count));
        let changes_opts = self.opts.as_changes_options(self.last_seq.clone(), remaining);
        let response = self.adapter.changes_since(changes_opts).await?;
        if !response.results.is_empty() {
            self.last_seq = response.last_seq;
        }
        self.buffer = response.results;
        self.buffer_idx = 0;
        Ok(())
    }

    /// Get the next change event, blocking if in live mode.
    pub async fn next_change(&mut self) -> Option<ChangeEvent> {
        loop {
            if let Some(limit) = self.opts.limit
                && self.count >= limit
            {
                return None;
            }

            match self.state {
                LiveStreamState::FetchingInitial => {
                    if self.fetch_changes().await.is_err() {
                        return None;
                    }
                    self.state = if self.buffer.is_empty() {
                        if self.opts.live {
                            LiveStreamState::Waiting
                        } else {
                            LiveStreamState::Done
                        }
                    } else {
                        LiveStreamState::Yielding
                    };
                }
                LiveStreamState::Yielding => {
                    if self.buffer_idx < self.buffer.len() {
                        let event = self.buffer[self.buffer_idx].clone();
                        self.buffer_idx += 1;
                        self.count += 1;
                        return Some(event);
                    }
                    self.state = if self.opts.live {
                        LiveStreamState::Waiting
                    } else {
                        LiveStreamState::Done
                    };
                }
                LiveStreamState::Waiting => {
                    if let Some(ref mut receiver) = self.receiver {
                        receiver.recv().await.as_ref()?;
                    } else {
                        tokio::time::sleep(self.opts.poll_interval).await;
                    }

                    if self.fetch_changes().await.is_err() {
                        return None;
                    }
                    if !self.buffer.is_empty() {
                        self.state = LiveStreamState::Yielding;
                    }
                }
                LiveStreamState::Done => return None,
            }
        }
    }
}

/// Handle for a live changes stream. Dropping or cancelling stops the stream.
pub struct ChangesHandle {
    cancel: CancellationToken,
}

impl ChangesHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChangesHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a live changes stream that sends events through an mpsc channel.
pub fn live_changes(
    adapter: Arc<dyn Adapter>,
    opts: ChangesStreamOptions,
) -> (mpsc::Receiver<ChangeEvent>, ChangesHandle) {
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();

    tokio::spawn(async move {
        let mut stream =
            LiveChangesStream::new(adapter, None, ChangesStreamOptions { live: true, ..opts });

        loop {
            tokio::select! {
                change = stream.next_change() => {
                    match change {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = cancel_clone.cancelled() => break,
            }
        }
    });

    (rx, ChangesHandle { cancel })
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_adapter_memory::MemoryAdapter;
    use burrow_core::adapter::PutOptions;
    use burrow_core::revision::{Revision, compute_suffix};
    use std::collections::HashMap;

    async fn put_doc(db: &dyn Adapter, id: &str, data: serde_json::Value) -> String {
        let suffix = compute_suffix(None, &data);
        let rev = Revision::new(1, suffix);
        db.put(id, rev.clone(), data, HashMap::new(), None, PutOptions::default())
            .await
            .unwrap();
        rev.to_string()
    }

    #[tokio::test]
    async fn one_shot_changes() {
        let db = MemoryAdapter::new("test");
        put_doc(&db, "a", serde_json::json!({"v": 1})).await;
        put_doc(&db, "b", serde_json::json!({"v": 2})).await;

        let events = get_changes(&db, ChangesStreamOptions::default()).await.unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, "a");
        assert_eq!(events[1].id, "b");
    }

    #[tokio::test]
    async fn one_shot_changes_since() {
        let db = MemoryAdapter::new("test");
        put_doc(&db, "a", serde_json::json!({})).await;
        put_doc(&db, "b", serde_json::json!({})).await;
        put_doc(&db, "c", serde_json::json!({})).await;

        let events = get_changes(
            &db,
            ChangesStreamOptions {
                since: Seq::Num(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, "c");
    }

    #[tokio::test]
    async fn one_shot_with_limit() {
        let db = MemoryAdapter::new("test");
        for i in 0..5 {
            put_doc(&db, &format!("d{i}"), serde_json::json!({})).await;
        }

        let events = get_changes(
            &db,
            ChangesStreamOptions {
                limit: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn live_stream_initial_then_new() {
        let db = Arc::new(MemoryAdapter::new("test"));
        put_doc(db.as_ref(), "existing", serde_json::json!({})).await;

        let (sender, _rx) = ChangeSender::new(64);
        let receiver = sender.subscribe();
        let db_clone = db.clone();

        let mut stream = LiveChangesStream::new(
            db.clone(),
            Some(receiver),
            ChangesStreamOptions {
                live: true,
                limit: Some(3),
                ..Default::default()
            },
        );

        let event = stream.next_change().await.unwrap();
        assert_eq!(event.id, "existing");

        let sender_clone = sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            put_doc(db_clone.as_ref(), "new1", serde_json::json!({})).await;
            sender_clone.notify(Seq::Num(2), "new1".into());
            tokio::time::sleep(Duration::from_millis(50)).await;
            put_doc(db_clone.as_ref(), "new2", serde_json::json!({})).await;
            sender_clone.notify(Seq::Num(3), "new2".into());
        });

        let event = stream.next_change().await.unwrap();
        assert_eq!(event.id, "new1");

        let event = stream.next_change().await.unwrap();
        assert_eq!(event.id, "new2");

        assert!(stream.next_change().await.is_none());
    }

    #[tokio::test]
    async fn live_changes_via_channel() {
        let db = Arc::new(MemoryAdapter::new("test"));
        put_doc(db.as_ref(), "a", serde_json::json!({"v": 1})).await;

        let (mut rx, handle) = live_changes(
            db.clone(),
            ChangesStreamOptions {
                live: true,
                poll_interval: Duration::from_millis(50),
                ..Default::default()
            },
        );

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, "a");

        put_doc(db.as_ref(), "b", serde_json::json!({"v": 2})).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.id, "b");

        handle.cancel();
    }

    #[tokio::test]
    async fn change_sender_subscribe() {
        let (sender, _rx) = ChangeSender::new(16);
        let mut sub = sender.subscribe();

        sender.notify(Seq::Num(1), "doc1".into());

        let notification = sub.recv().await.unwrap();
        assert_eq!(notification.seq, Seq::Num(1));
        assert_eq!(notification.doc_id, "doc1");
    }
}
