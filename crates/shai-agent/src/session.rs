//! Interactive session loop over a persisted thread

use async_trait::async_trait;
use shai_llm::{FunctionCallPolicy, Pricing, TokenUsage};
use std::sync::Arc;

use crate::engine::{ConversationEngine, TurnOutcome};
use crate::error::Result;
use crate::thread::{StoreError, Thread, ThreadStore, derive_thread_name};

pub const HELP: &str = "\
Commands:
  help              Show this help
  exit, quit, q     End the session

Anything else is sent to the assistant. The conversation is saved after
every exchange and can be resumed with --thread <id>.";

/// Source of user input
#[async_trait]
pub trait Prompter: Send {
    /// The next line of input, or `None` at end of input
    async fn read_line(&mut self, prompt: &str) -> std::io::Result<Option<String>>;
}

/// Where the session shows its output
pub trait SessionDisplay: Send {
    /// A fragment of streamed assistant text
    fn token(&mut self, text: &str);

    /// The streamed reply for this turn has ended
    fn end_of_reply(&mut self) {}

    fn help(&mut self, text: &str);

    fn notice(&mut self, message: &str);

    fn error(&mut self, message: &str);

    /// Cost of the last exchange
    fn exchange_cost(&mut self, usage: &TokenUsage, cost: f64);

    /// Cumulative cost for the session
    fn session_cost(&mut self, usage: &TokenUsage, cost: f64);
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub prompt: String,
    pub show_cost: bool,
    pub pricing: Pricing,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prompt: "> ".to_string(),
            show_cost: false,
            pricing: Pricing::default(),
        }
    }
}

/// What a finished session leaves behind
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub thread_id: String,
    pub thread_name: String,
    pub usage: TokenUsage,
    /// Completed turns
    pub turns: usize,
}

enum Command<'a> {
    Skip,
    Exit,
    Help,
    Ask(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    match line.trim() {
        "" => Command::Skip,
        "exit" | "quit" | "q" => Command::Exit,
        "help" => Command::Help,
        input => Command::Ask(input),
    }
}

pub struct SessionLoop {
    engine: Arc<ConversationEngine>,
    store: Arc<dyn ThreadStore>,
    config: SessionConfig,
}

impl SessionLoop {
    pub fn new(
        engine: Arc<ConversationEngine>,
        store: Arc<dyn ThreadStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    /// Drive turns until the user exits or input ends.
    ///
    /// Failing to open the thread is fatal. Errors inside a turn are shown
    /// and the loop moves on to the next prompt.
    pub async fn run(
        &self,
        thread_id: Option<&str>,
        prompter: &mut dyn Prompter,
        display: &mut dyn SessionDisplay,
    ) -> Result<SessionSummary> {
        let mut thread = self.open_thread(thread_id, display).await?;
        let mut total = TokenUsage::new(self.engine.config().model.clone());
        let mut turns = 0usize;

        loop {
            let line = match prompter.read_line(&self.config.prompt).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to read input: {}", e);
                    display.error(&format!("Failed to read input: {}", e));
                    break;
                }
            };

            let input = match parse_command(&line) {
                Command::Skip => continue,
                Command::Exit => break,
                Command::Help => {
                    display.help(HELP);
                    continue;
                }
                Command::Ask(input) => input,
            };

            let result = self
                .engine
                .run_turn(&thread.messages, input, &mut |t: &str| display.token(t))
                .await;
            display.end_of_reply();

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!("Turn failed: {}", e);
                    if let Some(usage) = e.partial_usage() {
                        total += usage;
                    }
                    display.error(&e.to_string());
                    continue;
                }
            };

            turns += 1;
            total += &outcome.usage;
            thread.messages = outcome.history;

            if let Err(e) = self.persist(&mut thread).await {
                tracing::error!("Failed to save thread {}: {}", thread.id, e);
                display.error(&format!("Failed to save conversation: {}", e));
            }

            if self.config.show_cost {
                display.exchange_cost(&outcome.usage, self.config.pricing.cost(&outcome.usage));
            }
        }

        if self.config.show_cost {
            display.session_cost(&total, self.config.pricing.cost(&total));
        }

        tracing::info!("Session on thread {} ended after {} turns", thread.id, turns);
        Ok(SessionSummary {
            thread_id: thread.id,
            thread_name: thread.name,
            usage: total,
            turns,
        })
    }

    async fn open_thread(
        &self,
        thread_id: Option<&str>,
        display: &mut dyn SessionDisplay,
    ) -> Result<Thread> {
        if let Some(id) = thread_id {
            if let Some(thread) = self.store.get_thread(id).await? {
                display.notice(&format!("Resuming thread {} ({})", thread.name, thread.id));
                return Ok(thread);
            }
            tracing::warn!("Thread {} not found, creating a new one", id);
            display.notice(&format!("Thread {} not found, starting a new thread", id));
        }

        let thread = self.store.create_thread().await?;
        display.notice(&format!("Started thread {} ({})", thread.name, thread.id));
        Ok(thread)
    }

    /// Save the history, then name the thread after its first exchange
    async fn persist(&self, thread: &mut Thread) -> std::result::Result<(), StoreError> {
        let stored = self
            .store
            .update_thread(&thread.id, thread.messages.clone())
            .await?;
        thread.updated_at = stored.updated_at;

        if thread.needs_auto_name() {
            if let Some(name) = derive_thread_name(&thread.messages) {
                self.store.rename_thread(&thread.id, &name).await?;
                tracing::debug!("Renamed thread {} to {:?}", thread.id, name);
                thread.name = name;
            }
        }
        Ok(())
    }
}

/// Run one stand-alone turn with no thread behind it
pub async fn run_single_turn(
    engine: &ConversationEngine,
    input: &str,
    policy: FunctionCallPolicy,
    config: &SessionConfig,
    display: &mut dyn SessionDisplay,
) -> Result<TurnOutcome> {
    let result = engine
        .run_turn_with_policy(&[], input, policy, &mut |t: &str| display.token(t))
        .await;
    display.end_of_reply();
    let outcome = result?;

    if config.show_cost {
        display.exchange_cost(&outcome.usage, config.pricing.cost(&outcome.usage));
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, RetryConfig};
    use crate::function::FunctionRegistry;
    use crate::testing::{ScriptedProvider, call, execute_command, reply};
    use crate::thread::{MemoryThreadStore, is_default_thread_name};
    use serde_json::json;
    use shai_llm::{Message, Usage};
    use std::collections::VecDeque;

    struct Lines(VecDeque<String>);

    impl Lines {
        fn new(lines: &[&str]) -> Self {
            Self(lines.iter().map(|l| l.to_string()).collect())
        }
    }

    #[async_trait]
    impl Prompter for Lines {
        async fn read_line(&mut self, _prompt: &str) -> std::io::Result<Option<String>> {
            Ok(self.0.pop_front())
        }
    }

    #[derive(Default)]
    struct Recorder {
        tokens: String,
        helps: usize,
        notices: Vec<String>,
        errors: Vec<String>,
        exchange_costs: Vec<f64>,
        session_cost: Option<(TokenUsage, f64)>,
    }

    impl SessionDisplay for Recorder {
        fn token(&mut self, text: &str) {
            self.tokens.push_str(text);
        }
        fn help(&mut self, _text: &str) {
            self.helps += 1;
        }
        fn notice(&mut self, message: &str) {
            self.notices.push(message.to_string());
        }
        fn error(&mut self, message: &str) {
            self.errors.push(message.to_string());
        }
        fn exchange_cost(&mut self, _usage: &TokenUsage, cost: f64) {
            self.exchange_costs.push(cost);
        }
        fn session_cost(&mut self, usage: &TokenUsage, cost: f64) {
            self.session_cost = Some((usage.clone(), cost));
        }
    }

    /// A store whose writes always fail
    struct ReadOnlyStore(MemoryThreadStore);

    #[async_trait]
    impl ThreadStore for ReadOnlyStore {
        async fn create_thread(&self) -> std::result::Result<Thread, StoreError> {
            self.0.create_thread().await
        }
        async fn get_thread(&self, id: &str) -> std::result::Result<Option<Thread>, StoreError> {
            self.0.get_thread(id).await
        }
        async fn update_thread(
            &self,
            _id: &str,
            _messages: Vec<Message>,
        ) -> std::result::Result<Thread, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        async fn rename_thread(&self, _id: &str, _name: &str) -> std::result::Result<Thread, StoreError> {
            Err(StoreError::Io(std::io::Error::other("disk full")))
        }
        async fn list_threads(&self) -> std::result::Result<Vec<Thread>, StoreError> {
            self.0.list_threads().await
        }
    }

    fn session(
        provider: Arc<ScriptedProvider>,
        functions: FunctionRegistry,
        store: Arc<dyn ThreadStore>,
        show_cost: bool,
    ) -> SessionLoop {
        let mut config = EngineConfig::new("test-model");
        config.retry = RetryConfig::disabled();
        let engine = Arc::new(ConversationEngine::new(provider, functions, config));
        SessionLoop::new(
            engine,
            store,
            SessionConfig {
                show_cost,
                pricing: Pricing::new(1.0, 2.0),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_exit_sentinel_skips_provider() {
        let provider = ScriptedProvider::new(vec![]);
        let store = Arc::new(MemoryThreadStore::new());
        let session = session(provider.clone(), FunctionRegistry::new(), store, false);

        let mut display = Recorder::default();
        let summary = session
            .run(None, &mut Lines::new(&["", "   ", "help", "exit", "never read"]), &mut display)
            .await
            .unwrap();

        assert!(provider.requests().is_empty());
        assert_eq!(summary.turns, 0);
        assert_eq!(display.helps, 1);
    }

    #[tokio::test]
    async fn test_sentinels_are_case_sensitive() {
        let provider = ScriptedProvider::new(vec![reply("Quit what?", Usage::default())]);
        let store = Arc::new(MemoryThreadStore::new());
        let session = session(provider.clone(), FunctionRegistry::new(), store, false);

        let summary = session
            .run(None, &mut Lines::new(&["QUIT", "q"]), &mut Recorder::default())
            .await
            .unwrap();

        assert_eq!(provider.requests().len(), 1);
        assert_eq!(summary.turns, 1);
    }

    #[tokio::test]
    async fn test_missing_thread_falls_back_to_new() {
        let provider = ScriptedProvider::new(vec![]);
        let store = Arc::new(MemoryThreadStore::new());
        let session = session(provider, FunctionRegistry::new(), store.clone(), false);

        let mut display = Recorder::default();
        let summary = session
            .run(Some("nonexistent"), &mut Lines::new(&[]), &mut display)
            .await
            .unwrap();

        assert_ne!(summary.thread_id, "nonexistent");
        assert!(is_default_thread_name(&summary.thread_name));
        assert!(store.get_thread(&summary.thread_id).await.unwrap().is_some());
        assert!(display.notices[0].contains("not found"));
    }

    #[tokio::test]
    async fn test_turns_persist_and_rename_once() {
        let provider = ScriptedProvider::new(vec![
            call("executeCommand", json!({ "command": "ls" }), "c1", Usage::new(100, 10)),
            reply("Done.", Usage::new(120, 5)),
            reply("You're welcome.", Usage::new(50, 4)),
        ]);
        let store = Arc::new(MemoryThreadStore::new());
        let session = session(provider, execute_command("a.txt"), store.clone(), true);

        let mut display = Recorder::default();
        let summary = session
            .run(None, &mut Lines::new(&["list files", "thanks", "quit"]), &mut display)
            .await
            .unwrap();

        assert_eq!(summary.turns, 2);
        assert_eq!(summary.thread_name, "list files - Done.");
        assert_eq!(summary.usage.input_tokens, 270);
        assert_eq!(summary.usage.output_tokens, 19);

        let stored = store.get_thread(&summary.thread_id).await.unwrap().unwrap();
        assert_eq!(stored.name, "list files - Done.");
        assert_eq!(stored.messages.len(), 6);
        assert_eq!(stored.messages[5], Message::assistant("You're welcome."));

        assert_eq!(display.exchange_costs.len(), 2);
        let (usage, cost) = display.session_cost.unwrap();
        assert_eq!(usage.total_tokens(), 289);
        let expected = (270.0 * 1.0 + 19.0 * 2.0) / 1_000_000.0;
        assert!((cost - expected).abs() < 1e-12);
        let per_exchange: f64 = display.exchange_costs.iter().sum();
        assert!((per_exchange - cost).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_default_looking_first_name_is_kept() {
        let provider = ScriptedProvider::new(vec![
            reply("", Usage::new(10, 0)),
            reply("Second answer", Usage::new(10, 2)),
        ]);
        let store = Arc::new(MemoryThreadStore::new());
        let session = session(provider, FunctionRegistry::new(), store.clone(), false);

        let summary = session
            .run(
                None,
                &mut Lines::new(&["Thread-42", "again"]),
                &mut Recorder::default(),
            )
            .await
            .unwrap();

        assert_eq!(summary.turns, 2);
        assert_eq!(summary.thread_name, "Thread-42");
        let stored = store.get_thread(&summary.thread_id).await.unwrap().unwrap();
        assert_eq!(stored.name, "Thread-42");
    }

    #[tokio::test]
    async fn test_resumed_thread_keeps_its_name() {
        let store = Arc::new(MemoryThreadStore::new());
        let mut existing = Thread::new();
        existing.name = "Deploy notes".into();
        existing.messages = vec![Message::user("hi"), Message::assistant("hello")];
        store.insert(existing.clone());

        let provider = ScriptedProvider::new(vec![reply("sure", Usage::default())]);
        let session = session(provider.clone(), FunctionRegistry::new(), store.clone(), false);

        let summary = session
            .run(Some(&existing.id), &mut Lines::new(&["again"]), &mut Recorder::default())
            .await
            .unwrap();

        assert_eq!(summary.thread_id, existing.id);
        assert_eq!(summary.thread_name, "Deploy notes");
        assert_eq!(provider.requests()[0].0.len(), 3);
        let stored = store.get_thread(&existing.id).await.unwrap().unwrap();
        assert_eq!(stored.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_turn_errors_do_not_end_session() {
        let provider = ScriptedProvider::new(vec![
            Err(shai_llm::Error::InvalidApiKey),
            reply("recovered", Usage::default()),
        ]);
        let store = Arc::new(MemoryThreadStore::new());
        let session = session(provider, FunctionRegistry::new(), store.clone(), false);

        let mut display = Recorder::default();
        let summary = session
            .run(None, &mut Lines::new(&["first", "second"]), &mut display)
            .await
            .unwrap();

        assert_eq!(display.errors.len(), 1);
        assert_eq!(summary.turns, 1);
        let stored = store.get_thread(&summary.thread_id).await.unwrap().unwrap();
        assert_eq!(stored.messages, vec![Message::user("second"), Message::assistant("recovered")]);
    }

    #[tokio::test]
    async fn test_abandoned_turn_still_counts_toward_cost() {
        let mut responses: Vec<_> = (0..9)
            .map(|i| call("executeCommand", json!({ "command": "ls" }), &format!("c{}", i), Usage::new(10, 1)))
            .collect();
        responses.push(reply("ok", Usage::new(5, 1)));
        let provider = ScriptedProvider::new(responses);
        let store = Arc::new(MemoryThreadStore::new());
        let session = session(provider, execute_command("a.txt"), store, true);

        let mut display = Recorder::default();
        let summary = session
            .run(None, &mut Lines::new(&["loop forever", "then stop"]), &mut display)
            .await
            .unwrap();

        assert_eq!(display.errors.len(), 1);
        assert_eq!(summary.turns, 1);
        assert_eq!(summary.usage.input_tokens, 95);
        assert_eq!(summary.usage.output_tokens, 10);
        let (usage, _) = display.session_cost.unwrap();
        assert_eq!(usage.total_tokens(), 105);
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_history_in_memory() {
        let provider = ScriptedProvider::new(vec![
            reply("one", Usage::default()),
            reply("two", Usage::default()),
        ]);
        let store = Arc::new(ReadOnlyStore(MemoryThreadStore::new()));
        let session = session(provider.clone(), FunctionRegistry::new(), store, false);

        let mut display = Recorder::default();
        let summary = session
            .run(None, &mut Lines::new(&["a", "b"]), &mut display)
            .await
            .unwrap();

        assert_eq!(summary.turns, 2);
        assert_eq!(display.errors.len(), 2);
        assert_eq!(provider.requests()[1].0.len(), 3);
    }

    #[tokio::test]
    async fn test_single_turn_forces_policy() {
        let provider = ScriptedProvider::new(vec![
            call("executeCommand", json!({ "command": "ls" }), "c1", Usage::default()),
            reply("Listed.", Usage::default()),
        ]);
        let mut config = EngineConfig::new("test-model");
        config.retry = RetryConfig::disabled();
        let engine = ConversationEngine::new(provider.clone(), execute_command("a.txt"), config);

        let mut display = Recorder::default();
        let outcome = run_single_turn(
            &engine,
            "list files",
            FunctionCallPolicy::Forced("executeCommand".into()),
            &SessionConfig::default(),
            &mut display,
        )
        .await
        .unwrap();

        assert_eq!(outcome.reply(), Some("Listed."));
        assert_eq!(display.tokens, "Listed.");
        assert!(display.exchange_costs.is_empty());
        assert_eq!(
            provider.requests()[0].1.function_call,
            FunctionCallPolicy::Forced("executeCommand".into())
        );
    }
}
