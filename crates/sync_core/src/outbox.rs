//! Per-conversation holding area for unconfirmed outgoing messages.
//!
//! [`Outbox`] is plain data. [`OutboxHandle`] owns every outbox inside a
//! single task and is the only way the rest of the crate mutates them.

use std::collections::HashMap;

use shared::{domain::RecordId, error::SyncError, model::Message};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Outbox {
    pending: Vec<Message>,
    draft: String,
}

impl Outbox {
    /// Appends `message`, moving an existing entry with the same identity to the end.
    pub fn add_message(&mut self, message: Message) {
        self.pending.retain(|m| m != &message);
        self.pending.push(message);
    }

    pub fn delete_message(&mut self, message_id: &RecordId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|m| &m.id != message_id);
        self.pending.len() != before
    }

    pub fn delete_all(&mut self) {
        self.pending.clear();
    }

    pub fn pending(&self) -> &[Message] {
        &self.pending
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

enum OutboxCommand {
    Add {
        conversation: RecordId,
        message: Message,
        reply: oneshot::Sender<usize>,
    },
    Delete {
        conversation: RecordId,
        message: RecordId,
        reply: oneshot::Sender<bool>,
    },
    DeleteAll {
        conversation: RecordId,
        reply: oneshot::Sender<()>,
    },
    SetDraft {
        conversation: RecordId,
        draft: String,
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        conversation: RecordId,
        reply: oneshot::Sender<Outbox>,
    },
}

/// Cloneable handle to the outbox task.
#[derive(Clone)]
pub struct OutboxHandle {
    commands: mpsc::Sender<OutboxCommand>,
}

impl OutboxHandle {
    /// Spawns the owning task on the current runtime.
    pub fn spawn(capacity: usize) -> Self {
        let (commands, receiver) = mpsc::channel(capacity.max(1));
        tokio::spawn(run_outboxes(receiver));
        Self { commands }
    }

    /// Stages `message`; returns the number of pending messages afterwards.
    pub async fn add_message(
        &self,
        conversation: RecordId,
        message: Message,
    ) -> Result<usize, SyncError> {
        self.request(|reply| OutboxCommand::Add {
            conversation,
            message,
            reply,
        })
        .await
    }

    pub async fn delete_message(
        &self,
        conversation: RecordId,
        message: RecordId,
    ) -> Result<bool, SyncError> {
        self.request(|reply| OutboxCommand::Delete {
            conversation,
            message,
            reply,
        })
        .await
    }

    pub async fn delete_all(&self, conversation: RecordId) -> Result<(), SyncError> {
        self.request(|reply| OutboxCommand::DeleteAll {
            conversation,
            reply,
        })
        .await
    }

    pub async fn set_draft(
        &self,
        conversation: RecordId,
        draft: impl Into<String>,
    ) -> Result<(), SyncError> {
        let draft = draft.into();
        self.request(|reply| OutboxCommand::SetDraft {
            conversation,
            draft,
            reply,
        })
        .await
    }

    pub async fn snapshot(&self, conversation: RecordId) -> Result<Outbox, SyncError> {
        self.request(|reply| OutboxCommand::Snapshot {
            conversation,
            reply,
        })
        .await
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> OutboxCommand,
    ) -> Result<T, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| SyncError::OutboxClosed)?;
        response.await.map_err(|_| SyncError::OutboxClosed)
    }
}

async fn run_outboxes(mut commands: mpsc::Receiver<OutboxCommand>) {
    let mut outboxes: HashMap<RecordId, Outbox> = HashMap::new();

    while let Some(command) = commands.recv().await {
        match command {
            OutboxCommand::Add {
                conversation,
                message,
                reply,
            } => {
                let outbox = outboxes.entry(conversation.clone()).or_default();
                debug!(conversation_id = %conversation, message_id = %message.id, "outbox: staged message");
                outbox.add_message(message);
                let _ = reply.send(outbox.pending().len());
            }
            OutboxCommand::Delete {
                conversation,
                message,
                reply,
            } => {
                let removed = outboxes
                    .get_mut(&conversation)
                    .is_some_and(|outbox| outbox.delete_message(&message));
                debug!(conversation_id = %conversation, message_id = %message, removed, "outbox: delete message");
                let _ = reply.send(removed);
            }
            OutboxCommand::DeleteAll {
                conversation,
                reply,
            } => {
                if let Some(outbox) = outboxes.get_mut(&conversation) {
                    outbox.delete_all();
                }
                let _ = reply.send(());
            }
            OutboxCommand::SetDraft {
                conversation,
                draft,
                reply,
            } => {
                outboxes.entry(conversation).or_default().set_draft(draft);
                let _ = reply.send(());
            }
            OutboxCommand::Snapshot {
                conversation,
                reply,
            } => {
                let snapshot = outboxes.get(&conversation).cloned().unwrap_or_default();
                let _ = reply.send(snapshot);
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod tests;
