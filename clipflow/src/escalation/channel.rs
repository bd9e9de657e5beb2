//! In-process escalation channel.
//!
//! Questions wait in a table until a front-end answers them by id. The
//! handler owns the timeout; when it gives up, the waiting future is
//! dropped and the question leaves the table.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::oneshot;

use super::EscalationQuestion;
use crate::errors::ChannelError;
use crate::ports::EscalationChannel;

struct Waiting {
    question: EscalationQuestion,
    reply: oneshot::Sender<String>,
}

/// Escalation channel answered through [`PendingQuestions::answer`].
#[derive(Default)]
pub struct PendingQuestions {
    waiting: RwLock<HashMap<String, Waiting>>,
}

impl std::fmt::Debug for PendingQuestions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQuestions")
            .field("pending", &self.waiting.read().len())
            .finish()
    }
}

/// Removes the question when the asking future completes or is dropped.
struct Registration<'a> {
    table: &'a RwLock<HashMap<String, Waiting>>,
    id: String,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.table.write().remove(&self.id);
    }
}

impl PendingQuestions {
    /// Creates an empty channel.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Questions currently awaiting an answer, oldest first.
    #[must_use]
    pub fn pending(&self) -> Vec<EscalationQuestion> {
        let mut questions: Vec<EscalationQuestion> = self
            .waiting
            .read()
            .values()
            .map(|w| w.question.clone())
            .collect();
        questions.sort_by(|a, b| a.asked_at.cmp(&b.asked_at).then_with(|| a.id.cmp(&b.id)));
        questions
    }

    /// Answers a question. Returns false if it is no longer waiting.
    pub fn answer(&self, question_id: &str, text: impl Into<String>) -> bool {
        let Some(waiting) = self.waiting.write().remove(question_id) else {
            return false;
        };
        waiting.reply.send(text.into()).is_ok()
    }

    /// Drops a question without answering it.
    pub fn cancel(&self, question_id: &str) -> bool {
        self.waiting.write().remove(question_id).is_some()
    }
}

#[async_trait]
impl EscalationChannel for PendingQuestions {
    async fn ask(&self, question: &EscalationQuestion) -> Result<String, ChannelError> {
        let (tx, rx) = oneshot::channel();
        self.waiting.write().insert(
            question.id.clone(),
            Waiting {
                question: question.clone(),
                reply: tx,
            },
        );
        let _registration = Registration {
            table: &self.waiting,
            id: question.id.clone(),
        };
        tracing::info!(question_id = %question.id, run_id = %question.run_id, "Escalation question posted");

        rx.await
            .map_err(|_| ChannelError::Cancelled(question.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{EscalationReason, Stage};
    use std::sync::Arc;
    use std::time::Duration;

    fn question(id: &str) -> EscalationQuestion {
        EscalationQuestion::new("R1", Stage::Transcript, EscalationReason::UnclassifiableInput, "podcast-with-music")
            .with_id(id)
    }

    #[tokio::test]
    async fn test_answer_reaches_asker() {
        let channel = Arc::new(PendingQuestions::new());
        let asker = Arc::clone(&channel);
        let handle = tokio::spawn(async move { asker.ask(&question("q1")).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let pending = channel.pending();
        assert_eq!(pending.len(), 1);
        assert!(channel.answer(&pending[0].id, "treat as interview"));

        assert_eq!(handle.await.unwrap(), Ok("treat as interview".to_string()));
        assert!(channel.pending().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_reports_cancelled() {
        let channel = Arc::new(PendingQuestions::new());
        let asker = Arc::clone(&channel);
        let handle = tokio::spawn(async move { asker.ask(&question("q2")).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(channel.cancel("q2"));
        assert_eq!(
            handle.await.unwrap(),
            Err(ChannelError::Cancelled("q2".to_string()))
        );
    }

    #[tokio::test]
    async fn test_abandoned_question_is_removed() {
        let channel = PendingQuestions::new();
        let result =
            tokio::time::timeout(Duration::from_millis(20), channel.ask(&question("q3"))).await;
        assert!(result.is_err());
        assert!(channel.pending().is_empty());
        assert!(!channel.answer("q3", "late"));
    }
}
