//! Dispatch stage: throttled snapshots become one platform message that is
//! created once and then edited in place.

use crate::error::StorageError;
use crate::pipeline::AnswerSink;
use crate::storage::Storage;
use crate::{ChatId, MessageSource, PlatformMessageId};

use tokio::sync::mpsc;

/// Deliver snapshots to `sink` and persist the final answer.
///
/// The first non-empty snapshot is posted with `create`; later ones `edit`
/// that message. Sink failures are logged and skipped. After a failed create
/// the next snapshot tries to create again. Once the input closes the last
/// text the sink accepted is stored as the turn's assistant message and
/// returned. `None` means the user saw nothing and nothing was stored.
pub async fn dispatch<K: AnswerSink, S: Storage>(
    mut snapshots: mpsc::UnboundedReceiver<String>,
    sink: &K,
    storage: &S,
    chat_id: ChatId,
) -> Result<Option<String>, StorageError> {
    let mut cursor: Option<PlatformMessageId> = None;
    let mut last_sent: Option<String> = None;

    while let Some(snapshot) = snapshots.recv().await {
        if snapshot.is_empty() {
            continue;
        }

        match cursor {
            None => match sink.create(&snapshot).await {
                Ok(message_id) => {
                    cursor = Some(message_id);
                    last_sent = Some(snapshot.clone());
                }
                Err(error) => {
                    tracing::warn!(%chat_id, %error, "failed to post answer message");
                }
            },
            Some(message_id) if last_sent.as_deref() != Some(snapshot.as_str()) => {
                match sink.edit(message_id, &snapshot).await {
                    Ok(()) => last_sent = Some(snapshot.clone()),
                    Err(error) => {
                        tracing::warn!(%chat_id, message_id, %error, "failed to edit answer message");
                    }
                }
            }
            Some(_) => {}
        }
    }

    if let Some(answer) = &last_sent {
        storage
            .append_message(chat_id, answer, MessageSource::Assistant)
            .await?;
    }

    Ok(last_sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Message;
    use crate::pipeline::testing::{RecordingSink, SinkCall};
    use crate::storage::MemoryStorage;

    async fn run(sink: &RecordingSink, snapshots: &[&str]) -> (Option<String>, Vec<Message>) {
        let storage = MemoryStorage::new();
        let user_id = storage.create_user(1, &[]).await.unwrap();
        let chat = storage.create_chat(user_id, "gpt-test", 1.0).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        for snapshot in snapshots {
            tx.send(snapshot.to_string()).unwrap();
        }
        drop(tx);

        let answer = dispatch(rx, sink, &storage, chat.chat_id).await.unwrap();
        let stored = storage.get_chat(chat.chat_id).await.unwrap().messages;
        (answer, stored)
    }

    #[tokio::test]
    async fn one_create_then_edits_and_one_persisted_message() {
        let sink = RecordingSink::default();
        let (answer, stored) = run(&sink, &["a", "ab", "abc"]).await;

        assert_eq!(answer.as_deref(), Some("abc"));
        assert_eq!(stored, vec![Message::assistant("abc")]);
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Create("a".into()),
                SinkCall::Edit(77, "ab".into()),
                SinkCall::Edit(77, "abc".into()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_input_persists_nothing() {
        let sink = RecordingSink::default();
        let (answer, stored) = run(&sink, &[]).await;

        assert_eq!(answer, None);
        assert!(stored.is_empty());
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn empty_and_repeated_snapshots_are_skipped() {
        let sink = RecordingSink::default();
        let (answer, _) = run(&sink, &["", "a", "a", "ab", ""]).await;

        assert_eq!(answer.as_deref(), Some("ab"));
        assert_eq!(
            sink.calls(),
            vec![SinkCall::Create("a".into()), SinkCall::Edit(77, "ab".into())]
        );
    }

    #[tokio::test]
    async fn failed_create_is_retried_on_next_snapshot() {
        let sink = RecordingSink {
            failing_creates: 1.into(),
            ..RecordingSink::default()
        };
        let (answer, stored) = run(&sink, &["a", "ab", "abc"]).await;

        assert_eq!(answer.as_deref(), Some("abc"));
        assert_eq!(stored.len(), 1);
        assert_eq!(
            sink.calls(),
            vec![SinkCall::Create("ab".into()), SinkCall::Edit(77, "abc".into())]
        );
    }

    #[tokio::test]
    async fn failed_edit_does_not_stop_later_edits() {
        let sink = RecordingSink {
            failing_edits: vec!["ab".into()],
            ..RecordingSink::default()
        };
        let (answer, stored) = run(&sink, &["a", "ab", "abc"]).await;

        assert_eq!(answer.as_deref(), Some("abc"));
        assert_eq!(stored, vec![Message::assistant("abc")]);
        assert_eq!(
            sink.calls(),
            vec![SinkCall::Create("a".into()), SinkCall::Edit(77, "abc".into())]
        );
    }

    #[tokio::test]
    async fn nothing_delivered_persists_nothing() {
        let sink = RecordingSink {
            failing_creates: 3.into(),
            ..RecordingSink::default()
        };
        let (answer, stored) = run(&sink, &["a", "ab", "abc"]).await;

        assert_eq!(answer, None);
        assert!(stored.is_empty());
        assert!(sink.calls().is_empty());
    }

    #[tokio::test]
    async fn failed_final_edit_persists_what_the_user_sees() {
        let sink = RecordingSink {
            failing_edits: vec!["abc".into()],
            ..RecordingSink::default()
        };
        let (answer, stored) = run(&sink, &["a", "ab", "abc"]).await;

        assert_eq!(answer.as_deref(), Some("ab"));
        assert_eq!(stored, vec![Message::assistant("ab")]);
    }

    #[tokio::test]
    async fn persistence_failure_is_returned() {
        let storage = MemoryStorage::new();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send("orphan".to_string()).unwrap();
        drop(tx);

        let error = dispatch(rx, &RecordingSink::default(), &storage, uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(error, StorageError::ChatNotFound(_)));
    }
}
