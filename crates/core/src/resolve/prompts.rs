//! Prompt plumbing between handlers and the UI.
//!
//! A handler asks a question by emitting a prompt event and parking on the
//! gate until the UI replies through the owning manager. Only the latest
//! outstanding prompt id is answerable; replies to anything else are
//! dropped without effect so a slow double-click cannot answer the wrong
//! question.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::events::{ResolveEvent, ResolvePrompt};
use super::EventSink;

struct Pending {
    prompt_id: u64,
    reply: oneshot::Sender<String>,
}

#[derive(Default)]
struct GateState {
    closed: bool,
    pending: Option<Pending>,
}

/// Owner-facing side of the prompt channel: routes replies and closes the
/// gate on cancellation.
#[derive(Clone, Default)]
pub struct PromptGate {
    state: Arc<Mutex<GateState>>,
}

/// Handler-facing side: emit a prompt and wait for its answer.
#[derive(Clone)]
pub struct PromptSink {
    state: Arc<Mutex<GateState>>,
    sink: EventSink,
}

impl PromptGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the handler-facing side, bound to the run's event sink.
    pub fn sink(&self, sink: EventSink) -> PromptSink {
        PromptSink {
            state: Arc::clone(&self.state),
            sink,
        }
    }

    /// Deliver the user's answer. Returns whether it reached a waiting
    /// handler; stale ids, duplicate replies, and replies with nothing
    /// outstanding are dropped silently.
    pub fn reply(&self, prompt_id: u64, choice: impl Into<String>) -> bool {
        let mut state = lock(&self.state);
        let outstanding = state.pending.as_ref().map(|p| p.prompt_id);
        match outstanding {
            Some(id) if id == prompt_id => match state.pending.take() {
                Some(pending) => pending.reply.send(choice.into()).is_ok(),
                None => false,
            },
            Some(id) => {
                warn!(got = prompt_id, outstanding = id, "dropping stale prompt reply");
                false
            }
            None => {
                debug!(prompt_id, "dropping prompt reply with nothing outstanding");
                false
            }
        }
    }

    /// Close the gate: the outstanding ask (if any) observes `None`, and
    /// every later ask returns `None` immediately.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.pending.take();
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

impl PromptSink {
    /// Surface a prompt and wait for the chosen option. `None` means the
    /// run was cancelled and the handler should wind down.
    pub async fn ask(&self, prompt: ResolvePrompt) -> Option<String> {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = lock(&self.state);
            if state.closed {
                return None;
            }
            // A newer ask replaces anything stale; one handler runs at a
            // time, so this only matters for abandoned questions.
            state.pending = Some(Pending {
                prompt_id: prompt.id,
                reply: tx,
            });
        }

        debug!(prompt_id = prompt.id, kind = ?prompt.kind, "prompting user");
        (self.sink)(ResolveEvent::Prompt(prompt));
        rx.await.ok()
    }
}

fn lock(state: &Arc<Mutex<GateState>>) -> MutexGuard<'_, GateState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::events::PromptKind;
    use std::time::Duration;

    fn prompt(id: u64) -> ResolvePrompt {
        ResolvePrompt {
            id,
            kind: PromptKind::EmptyCommitChoice,
            title: "title".into(),
            text: "text".into(),
            options: vec!["skip".into(), "abort".into()],
        }
    }

    fn collecting_sink() -> (EventSink, Arc<Mutex<Vec<ResolveEvent>>>) {
        let events: Arc<Mutex<Vec<ResolveEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&events);
        let sink: EventSink = Arc::new(move |e| store.lock().unwrap().push(e));
        (sink, events)
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached within 1s");
    }

    #[tokio::test]
    async fn test_ask_and_reply() {
        let gate = PromptGate::new();
        let (sink, events) = collecting_sink();
        let asker = gate.sink(sink);

        let ask = tokio::spawn(async move { asker.ask(prompt(1)).await });
        wait_until(|| !events.lock().unwrap().is_empty()).await;

        assert!(gate.reply(1, "skip"));
        assert_eq!(ask.await.unwrap(), Some("skip".into()));
    }

    #[tokio::test]
    async fn test_stale_reply_is_dropped() {
        let gate = PromptGate::new();
        let (sink, events) = collecting_sink();
        let asker = gate.sink(sink);

        let ask = tokio::spawn(async move { asker.ask(prompt(7)).await });
        wait_until(|| !events.lock().unwrap().is_empty()).await;

        assert!(!gate.reply(3, "skip"));
        // The real answer still gets through.
        assert!(gate.reply(7, "abort"));
        assert_eq!(ask.await.unwrap(), Some("abort".into()));
    }

    #[tokio::test]
    async fn test_duplicate_reply_is_dropped() {
        let gate = PromptGate::new();
        let (sink, events) = collecting_sink();
        let asker = gate.sink(sink);

        let ask = tokio::spawn(async move { asker.ask(prompt(2)).await });
        wait_until(|| !events.lock().unwrap().is_empty()).await;

        assert!(gate.reply(2, "skip"));
        assert!(!gate.reply(2, "abort"));
        assert_eq!(ask.await.unwrap(), Some("skip".into()));
    }

    #[tokio::test]
    async fn test_close_unblocks_with_none() {
        let gate = PromptGate::new();
        let (sink, events) = collecting_sink();
        let asker = gate.sink(sink);

        let ask = tokio::spawn(async move { asker.ask(prompt(1)).await });
        wait_until(|| !events.lock().unwrap().is_empty()).await;

        gate.close();
        assert_eq!(ask.await.unwrap(), None);
        assert!(gate.is_closed());
    }

    #[tokio::test]
    async fn test_ask_after_close_returns_none() {
        let gate = PromptGate::new();
        let (sink, events) = collecting_sink();
        let asker = gate.sink(sink);

        gate.close();
        assert_eq!(asker.ask(prompt(1)).await, None);
        // No prompt event leaks out after close.
        assert!(events.lock().unwrap().is_empty());
    }
}
