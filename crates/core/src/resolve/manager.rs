//! Per-step driver for the handler chain.
//!
//! One manager drives one step (a single conflicted file, or the finalize
//! action) through the handler chain and is then spent. The panel creates a
//! fresh manager per step; the UI reaches the running step through
//! [`ResolveManager::reply_prompt`] and [`ResolveManager::cancel`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::events::{ResolveEvent, ResolveOutcome};
use super::prompts::PromptGate;
use super::{
    CancelFlag, EventSink, HandlerVerdict, ResolveContext, ResolveHandler, ResolveServices,
};
use crate::assist::Assistant;
use crate::git::GitClient;
use crate::tasks::TaskRunner;

/// Single-use sequencer for one resolution step.
pub struct ResolveManager {
    handlers: Mutex<Vec<Box<dyn ResolveHandler>>>,
    services: ResolveServices,
    sink: EventSink,
    gate: PromptGate,
    cancel: CancelFlag,
    started: AtomicBool,
    run_id: Uuid,
}

impl ResolveManager {
    pub fn new(
        handlers: Vec<Box<dyn ResolveHandler>>,
        tasks: TaskRunner,
        git: GitClient,
        assistant: Option<Arc<dyn Assistant>>,
        sink: EventSink,
    ) -> Self {
        let gate = PromptGate::new();
        let cancel = CancelFlag::new();
        let services = ResolveServices {
            tasks,
            git,
            assistant,
            prompts: gate.sink(Arc::clone(&sink)),
            cancel: cancel.clone(),
            events: Arc::clone(&sink),
        };
        Self {
            handlers: Mutex::new(handlers),
            services,
            sink,
            gate,
            cancel,
            started: AtomicBool::new(false),
            run_id: Uuid::new_v4(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Drive the chain for one step.
    ///
    /// Emits `Started`, then exactly one `Completed` carrying the returned
    /// outcome. Handlers are offered the step in chain order: a pass moves
    /// on, a resolved outcome is remembered while the chain continues (so a
    /// later stage can build on it), anything else stops the chain. An
    /// exhausted chain yields the remembered resolved outcome, or a failure
    /// naming the gap.
    #[instrument(skip(self, ctx), fields(run_id = %self.run_id, op = %ctx.operation))]
    pub async fn run(&self, ctx: ResolveContext) -> ResolveOutcome {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("resolve manager reused; refusing second run");
            return ResolveOutcome::failed("resolve manager already ran");
        }

        self.emit(ResolveEvent::Started {
            run_id: self.run_id,
            path: ctx.path.clone(),
        });

        let mut last_resolved: Option<ResolveOutcome> = None;
        let mut stopped: Option<ResolveOutcome> = None;

        let mut handlers = self.handlers.lock().await;
        for handler in handlers.iter_mut() {
            if self.cancel.is_cancelled() {
                // Keep real progress: a file already fixed by an earlier
                // stage stays resolved even when the abort races it.
                stopped = Some(
                    last_resolved
                        .take()
                        .unwrap_or_else(|| ResolveOutcome::aborted("resolution cancelled")),
                );
                break;
            }

            debug!(handler = handler.name(), "offering step to handler");
            match handler.run(&ctx, &self.services).await {
                HandlerVerdict::Pass => continue,
                HandlerVerdict::Handled(outcome) if outcome.is_resolved() => {
                    debug!(handler = handler.name(), "handler resolved step");
                    last_resolved = Some(outcome);
                }
                HandlerVerdict::Handled(outcome) => {
                    debug!(handler = handler.name(), status = %outcome.status, "handler stopped chain");
                    stopped = Some(outcome);
                    break;
                }
            }
        }
        drop(handlers);

        let outcome = stopped
            .or(last_resolved)
            .unwrap_or_else(|| ResolveOutcome::failed("no resolve handler available"));

        // Nothing may remain askable once the step has completed.
        self.gate.close();

        info!(status = %outcome.status, "resolution step completed");
        self.emit(ResolveEvent::Completed(outcome.clone()));
        outcome
    }

    /// Route a user's answer to the outstanding prompt. Stale and
    /// mismatched ids are dropped.
    pub fn reply_prompt(&self, prompt_id: u64, choice: impl Into<String>) -> bool {
        self.gate.reply(prompt_id, choice)
    }

    /// Cancel the run. The prompt gate closes (an outstanding ask observes
    /// `None`) and the in-flight handler winds down at its next await
    /// point; Git commands are never interrupted mid-flight.
    pub fn cancel(&self) {
        info!(run_id = %self.run_id, "cancelling resolution step");
        self.cancel.cancel();
        self.gate.close();
    }

    fn emit(&self, event: ResolveEvent) {
        (self.sink)(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolve::events::{OutcomeStatus, PromptKind, ResolvePrompt};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    struct ScriptedHandler {
        name: &'static str,
        verdict: StdMutex<Option<HandlerVerdict>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedHandler {
        fn boxed(name: &'static str, verdict: HandlerVerdict) -> (Box<dyn ResolveHandler>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let handler = Box::new(Self {
                name,
                verdict: StdMutex::new(Some(verdict)),
                calls: Arc::clone(&calls),
            });
            (handler, calls)
        }
    }

    #[async_trait]
    impl ResolveHandler for ScriptedHandler {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&mut self, _ctx: &ResolveContext, _services: &ResolveServices) -> HandlerVerdict {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.verdict
                .lock()
                .unwrap()
                .take()
                .unwrap_or(HandlerVerdict::Pass)
        }
    }

    struct AskingHandler;

    #[async_trait]
    impl ResolveHandler for AskingHandler {
        fn name(&self) -> &'static str {
            "asking"
        }

        async fn run(&mut self, _ctx: &ResolveContext, services: &ResolveServices) -> HandlerVerdict {
            let prompt = ResolvePrompt {
                id: 1,
                kind: PromptKind::EmptyCommitChoice,
                title: "choose".into(),
                text: "pick one".into(),
                options: vec!["yes".into(), "no".into()],
            };
            match services.prompts.ask(prompt).await {
                Some(choice) => HandlerVerdict::Handled(ResolveOutcome::resolved_with(choice)),
                None => HandlerVerdict::Handled(ResolveOutcome::aborted("no answer")),
            }
        }
    }

    type Events = Arc<StdMutex<Vec<ResolveEvent>>>;

    fn manager_with(handlers: Vec<Box<dyn ResolveHandler>>) -> (Arc<ResolveManager>, Events) {
        let events: Events = Arc::new(StdMutex::new(Vec::new()));
        let store = Arc::clone(&events);
        let sink: EventSink = Arc::new(move |e| store.lock().unwrap().push(e));
        let manager = Arc::new(ResolveManager::new(
            handlers,
            TaskRunner::new(),
            GitClient::new(),
            None,
            sink,
        ));
        (manager, events)
    }

    fn file_ctx() -> ResolveContext {
        ResolveContext {
            repo_dir: std::path::PathBuf::from("/tmp/repo"),
            operation: crate::resolve::ResolveOperation::CherryPick,
            sha1: "abc1234".into(),
            path: Some("src/app.c".into()),
            initial_error: None,
            mergetool: None,
            extra_context: None,
        }
    }

    fn completed_count(events: &Events) -> usize {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, ResolveEvent::Completed(_)))
            .count()
    }

    #[tokio::test]
    async fn test_pass_falls_through_to_next_handler() {
        let (first, first_calls) = ScriptedHandler::boxed("first", HandlerVerdict::Pass);
        let (second, second_calls) =
            ScriptedHandler::boxed("second", HandlerVerdict::Handled(ResolveOutcome::resolved()));
        let (manager, _events) = manager_with(vec![first, second]);

        let outcome = manager.run(file_ctx()).await;
        assert!(outcome.is_resolved());
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolved_outcome_continues_chain() {
        let (first, _) =
            ScriptedHandler::boxed("first", HandlerVerdict::Handled(ResolveOutcome::resolved()));
        let (second, second_calls) = ScriptedHandler::boxed("second", HandlerVerdict::Pass);
        let (manager, _events) = manager_with(vec![first, second]);

        let outcome = manager.run(file_ctx()).await;
        assert!(outcome.is_resolved());
        // The later stage still ran after the resolution.
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_stops_chain() {
        let (first, _) = ScriptedHandler::boxed(
            "first",
            HandlerVerdict::Handled(ResolveOutcome::failed("tool crashed")),
        );
        let (second, second_calls) =
            ScriptedHandler::boxed("second", HandlerVerdict::Handled(ResolveOutcome::resolved()));
        let (manager, events) = manager_with(vec![first, second]);

        let outcome = manager.run(file_ctx()).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.message.as_deref(), Some("tool crashed"));
        assert_eq!(second_calls.load(Ordering::SeqCst), 0);
        assert_eq!(completed_count(&events), 1);
    }

    #[tokio::test]
    async fn test_exhausted_chain_without_resolution_fails() {
        let (only, _) = ScriptedHandler::boxed("only", HandlerVerdict::Pass);
        let (manager, events) = manager_with(vec![only]);

        let outcome = manager.run(file_ctx()).await;
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.message.as_deref(), Some("no resolve handler available"));

        let recorded = events.lock().unwrap();
        assert!(matches!(recorded.first(), Some(ResolveEvent::Started { .. })));
        assert!(matches!(recorded.last(), Some(ResolveEvent::Completed(_))));
    }

    #[tokio::test]
    async fn test_empty_chain_fails_deterministically() {
        let (manager, events) = manager_with(Vec::new());
        let outcome = manager.run(file_ctx()).await;
        assert_eq!(outcome.message.as_deref(), Some("no resolve handler available"));
        assert_eq!(completed_count(&events), 1);
    }

    #[tokio::test]
    async fn test_second_run_is_refused_without_events() {
        let (only, _) =
            ScriptedHandler::boxed("only", HandlerVerdict::Handled(ResolveOutcome::resolved()));
        let (manager, events) = manager_with(vec![only]);

        assert!(manager.run(file_ctx()).await.is_resolved());
        let events_after_first = events.lock().unwrap().len();

        let second = manager.run(file_ctx()).await;
        assert_eq!(second.status, OutcomeStatus::Failed);
        assert_eq!(events.lock().unwrap().len(), events_after_first);
    }

    #[tokio::test]
    async fn test_cancel_before_run_aborts() {
        let (only, calls) =
            ScriptedHandler::boxed("only", HandlerVerdict::Handled(ResolveOutcome::resolved()));
        let (manager, events) = manager_with(vec![only]);

        manager.cancel();
        let outcome = manager.run(file_ctx()).await;
        assert_eq!(outcome.status, OutcomeStatus::Aborted);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(completed_count(&events), 1);
    }

    #[tokio::test]
    async fn test_prompt_reply_roundtrip() {
        let (manager, events) = manager_with(vec![Box::new(AskingHandler)]);
        let runner = Arc::clone(&manager);
        let run = tokio::spawn(async move { runner.run(file_ctx()).await });

        for _ in 0..200 {
            let prompted = events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, ResolveEvent::Prompt(_)));
            if prompted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(manager.reply_prompt(1, "yes"));
        let outcome = run.await.unwrap();
        assert!(outcome.is_resolved());
        assert_eq!(outcome.message.as_deref(), Some("yes"));
    }

    #[tokio::test]
    async fn test_cancel_closes_outstanding_prompt() {
        let (manager, events) = manager_with(vec![Box::new(AskingHandler)]);
        let runner = Arc::clone(&manager);
        let run = tokio::spawn(async move { runner.run(file_ctx()).await });

        for _ in 0..200 {
            let prompted = events
                .lock()
                .unwrap()
                .iter()
                .any(|e| matches!(e, ResolveEvent::Prompt(_)));
            if prompted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        manager.cancel();
        let outcome = run.await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Aborted);
        assert_eq!(outcome.message.as_deref(), Some("no answer"));
    }
}
