//! Agent loop — the LLM ↔ tool-calling main loop.
//!
//! Port of nanobot's `agent/loop.py`.
//! Receives inbound messages, builds context, calls the LLM, dispatches
//! tool calls, and publishes outbound responses.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{oneshot, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use nanobot_core::bus::queue::MessageBus;
use nanobot_core::bus::types::{InboundMessage, OutboundMessage};
use nanobot_core::session::manager::SessionManager;
use nanobot_core::types::{Message, ToolCall};
use nanobot_providers::traits::{LlmProvider, LlmRequestConfig};

use crate::context::ContextBuilder;
use crate::subagent::{SubagentLimits, SubagentManager};
use crate::tools::message::MessageTool;
use crate::tools::registry::{ToolCallRequest, ToolRegistry};
use crate::tools::filesystem::{EditFileTool, ListDirTool, ReadFileTool, WriteFileTool};
use crate::tools::shell::ExecTool;
use crate::tools::spawn::SpawnTool;
use crate::tools::web::{WebFetchTool, WebSearchTool};

/// Default maximum LLM ↔ tool iterations per user message.
const DEFAULT_MAX_ITERATIONS: usize = 20;

/// Configuration for the exec tool.
#[derive(Clone, Debug)]
pub struct ExecToolConfig {
    /// Timeout in seconds (default 60).
    pub timeout: u64,
}

impl Default for ExecToolConfig {
    fn default() -> Self {
        Self { timeout: 60 }
    }
}

/// Scheduler-level knobs, sourced from `AgentDefaults`.
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    /// Global cap on messages processed across all sessions at once.
    pub max_concurrent_messages: u32,
    /// Consecutive all-failed tool batches before a message's loop aborts.
    pub tool_error_backoff: u32,
    /// Truncation budget for system-message (subagent result) payloads.
    pub subagent_result_max_chars: usize,
    /// Grace period `stop()` gives in-flight messages before returning.
    pub shutdown_grace_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_messages: 16,
            tool_error_backoff: 3,
            subagent_result_max_chars: 32 * 1024,
            shutdown_grace_seconds: 30,
        }
    }
}

/// Lifecycle state of an in-flight message, tracked for introspection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageState {
    Queued,
    Admitted,
    Building,
    InLoop,
    Replied,
    Failed,
    Cancelled,
}

// ─────────────────────────────────────────────
// AgentLoop
// ─────────────────────────────────────────────

/// The main agent loop: polls the message bus, calls the LLM, dispatches tools.
pub struct AgentLoop {
    /// Message bus for inbound/outbound messages.
    bus: Arc<MessageBus>,
    /// LLM provider.
    provider: Arc<dyn LlmProvider>,
    /// Workspace root.
    workspace: PathBuf,
    /// Model to use (overrides provider default if set).
    model: String,
    /// Max LLM ↔ tool iterations per message.
    max_iterations: usize,
    /// LLM request config (temperature, max_tokens).
    request_config: LlmRequestConfig,
    /// Tool registry.
    tools: ToolRegistry,
    /// Context builder.
    context: ContextBuilder,
    /// Session manager.
    sessions: SessionManager,
    /// Reference to the message tool (for set_context).
    message_tool: Arc<MessageTool>,
    /// Spawn tool reference (for set_context).
    spawn_tool: Arc<SpawnTool>,
    /// Subagent manager (also held by SpawnTool; kept for direct access).
    #[allow(dead_code)]
    subagent_manager: Arc<SubagentManager>,
    /// Channels whose metadata is allowed to override a message's session key.
    trusted_channels: HashSet<String>,
    /// Consecutive all-failed tool batches before a message's loop aborts.
    tool_error_backoff: u32,
    /// Truncation budget for system-message payloads.
    subagent_result_max_chars: usize,
    /// Grace period `stop()` gives in-flight messages.
    shutdown_grace: Duration,
    /// Admission gate: bounds how many messages run concurrently.
    admission: Arc<Semaphore>,
    /// Per-session FIFO tail: `(message_id, "previous done" receiver)`.
    tails: StdMutex<HashMap<String, (u64, oneshot::Receiver<()>)>>,
    /// Root cancellation token; `stop()` cancels it, every in-flight task
    /// holds a child derived from it.
    cancellation: CancellationToken,
    /// State of every in-flight message, for introspection.
    message_states: RwLock<HashMap<u64, MessageState>>,
    /// Monotonic message id generator.
    next_message_id: AtomicU64,
}

impl AgentLoop {
    /// Create a new agent loop.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: Arc<MessageBus>,
        provider: Arc<dyn LlmProvider>,
        workspace: PathBuf,
        model: Option<String>,
        max_iterations: Option<usize>,
        request_config: Option<LlmRequestConfig>,
        brave_api_key: Option<String>,
        exec_config: Option<ExecToolConfig>,
        restrict_to_workspace: bool,
        session_manager: Option<SessionManager>,
        agent_name: Option<String>,
        subagent_limits: Option<SubagentLimits>,
        scheduler_config: Option<SchedulerConfig>,
        trusted_channels: HashSet<String>,
    ) -> Self {
        let model = model.unwrap_or_else(|| provider.default_model().to_string());
        let mut max_iterations = max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS);
        if max_iterations == 0 {
            warn!("max_tool_iterations configured <= 0, coercing to 1");
            max_iterations = 1;
        }
        let request_config = request_config.unwrap_or_default();
        let exec_config = exec_config.unwrap_or_default();
        let agent_name = agent_name.unwrap_or_else(|| "Nanobot".into());
        let scheduler_config = scheduler_config.unwrap_or_default();
        let sessions =
            session_manager.unwrap_or_else(|| SessionManager::new(None).expect("failed to create session manager"));

        let context = ContextBuilder::new(workspace.clone(), agent_name.clone());

        // Build tool registry
        let mut tools = ToolRegistry::new();
        let allowed_dir = if restrict_to_workspace {
            Some(workspace.clone())
        } else {
            None
        };

        tools
            .register(Arc::new(ReadFileTool::new(allowed_dir.clone())))
            .expect("built-in tool name collision");
        tools
            .register(Arc::new(WriteFileTool::new(allowed_dir.clone())))
            .expect("built-in tool name collision");
        tools
            .register(Arc::new(EditFileTool::new(allowed_dir.clone())))
            .expect("built-in tool name collision");
        tools
            .register(Arc::new(ListDirTool::new(allowed_dir)))
            .expect("built-in tool name collision");
        tools
            .register(Arc::new(ExecTool::new(
                workspace.clone(),
                Some(exec_config.timeout),
                restrict_to_workspace,
            )))
            .expect("built-in tool name collision");
        tools
            .register(Arc::new(WebSearchTool::new(brave_api_key.clone())))
            .expect("built-in tool name collision");
        tools
            .register(Arc::new(WebFetchTool::new()))
            .expect("built-in tool name collision");

        let message_tool = Arc::new(MessageTool::new(None));
        tools
            .register(message_tool.clone())
            .expect("built-in tool name collision");

        // Subagent manager + spawn tool
        let subagent_manager = Arc::new(SubagentManager::new(
            provider.clone(),
            workspace.clone(),
            bus.clone(),
            model.clone(),
            brave_api_key,
            exec_config,
            restrict_to_workspace,
            request_config.clone(),
            subagent_limits.unwrap_or_default(),
        ));

        let spawn_tool = Arc::new(SpawnTool::new(subagent_manager.clone()));
        tools
            .register(spawn_tool.clone())
            .expect("built-in tool name collision");

        info!(
            model = %model,
            tools = tools.len(),
            max_iterations = max_iterations,
            max_concurrent_messages = scheduler_config.max_concurrent_messages,
            "agent loop initialized"
        );

        Self {
            bus,
            provider,
            workspace,
            model,
            max_iterations,
            request_config,
            tools,
            context,
            sessions,
            message_tool,
            spawn_tool,
            subagent_manager,
            trusted_channels,
            tool_error_backoff: scheduler_config.tool_error_backoff,
            subagent_result_max_chars: scheduler_config.subagent_result_max_chars,
            shutdown_grace: Duration::from_secs(scheduler_config.shutdown_grace_seconds),
            admission: Arc::new(Semaphore::new(scheduler_config.max_concurrent_messages.max(1) as usize)),
            tails: StdMutex::new(HashMap::new()),
            cancellation: CancellationToken::new(),
            message_states: RwLock::new(HashMap::new()),
            next_message_id: AtomicU64::new(0),
        }
    }

    /// Run the event loop: poll inbound messages and process them.
    ///
    /// Each admitted message runs in its own spawned task, bounded by the
    /// admission semaphore; `run()` never advances past the semaphore
    /// acquire, so backlog waits in the bus's bounded channel rather than
    /// piling up as unbounded in-flight tasks.
    pub async fn run(self: Arc<Self>) {
        info!("agent loop started, waiting for messages");
        loop {
            let msg = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    info!("agent loop cancelled, exiting");
                    break;
                }
                msg = self.bus.consume_inbound() => msg,
            };

            let msg = match msg {
                Some(m) => m,
                None => {
                    info!("inbound channel closed, agent loop exiting");
                    break;
                }
            };

            let message_id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
            self.set_state(message_id, MessageState::Queued).await;

            let permit = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => {
                    self.remove_state(message_id).await;
                    info!("agent loop cancelled while awaiting an admission slot");
                    break;
                }
                permit = self.admission.clone().acquire_owned() => {
                    match permit {
                        Ok(p) => p,
                        Err(_) => {
                            self.remove_state(message_id).await;
                            break;
                        }
                    }
                }
            };
            self.set_state(message_id, MessageState::Admitted).await;

            let this = self.clone();
            tokio::spawn(async move {
                this.handle_message(msg, message_id, permit).await;
            });
        }
    }

    /// Cancel the root token and wait up to `shutdownGraceSeconds` for
    /// in-flight messages to drain before returning.
    pub async fn stop(&self) {
        info!("stop requested, cancelling in-flight work");
        self.cancellation.cancel();

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while tokio::time::Instant::now() < deadline {
            if self.message_states.read().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let remaining = self.message_states.read().await.len();
        if remaining > 0 {
            warn!(remaining, "shutdown grace period elapsed with messages still in flight");
        }
    }

    /// Number of messages currently tracked as in-flight.
    pub async fn in_flight_count(&self) -> usize {
        self.message_states.read().await.len()
    }

    /// State of a specific message, if still tracked.
    pub async fn message_state(&self, id: u64) -> Option<MessageState> {
        self.message_states.read().await.get(&id).copied()
    }

    async fn set_state(&self, id: u64, state: MessageState) {
        self.message_states.write().await.insert(id, state);
    }

    async fn remove_state(&self, id: u64) {
        self.message_states.write().await.remove(&id);
    }

    /// Drive one admitted message through the per-session tail chain and
    /// the LLM ↔ tool loop, then publish its response.
    async fn handle_message(
        self: Arc<Self>,
        msg: InboundMessage,
        message_id: u64,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let session_key = self.resolve_session_key(&msg);

        let (done_tx, prev) = {
            let (tx, rx) = oneshot::channel();
            let mut tails = self.tails.lock().unwrap();
            (tx, tails.insert(session_key.clone(), (message_id, rx)))
        };
        if let Some((_, prev_rx)) = prev {
            let _ = prev_rx.await;
        }

        self.set_state(message_id, MessageState::Building).await;

        let token = self.cancellation.child_token();
        let is_system = msg.channel == "system" && msg.sender_id == "subagent";

        let result = if token.is_cancelled() {
            Err(anyhow::anyhow!("cancelled before processing started"))
        } else {
            self.set_state(message_id, MessageState::InLoop).await;
            if is_system {
                self.process_system_message(&msg).await
            } else {
                self.process_message(&msg).await
            }
        };

        match result {
            Ok(response) => {
                self.set_state(message_id, MessageState::Replied).await;
                if let Err(e) = self.bus.publish_outbound(response).await {
                    error!(error = %e, "failed to publish outbound message");
                }
            }
            Err(e) => {
                let final_state = if token.is_cancelled() {
                    MessageState::Cancelled
                } else {
                    MessageState::Failed
                };
                self.set_state(message_id, final_state).await;
                error!(error = %e, session_key = %session_key, "message processing error");
                let err_msg = OutboundMessage::new(
                    &msg.channel,
                    &msg.chat_id,
                    &format!("I encountered an error: {e}"),
                );
                let _ = self.bus.publish_outbound(err_msg).await;
            }
        }

        {
            let mut tails = self.tails.lock().unwrap();
            if matches!(tails.get(&session_key), Some((id, _)) if *id == message_id) {
                tails.remove(&session_key);
            }
        }
        let _ = done_tx.send(());
        self.remove_state(message_id).await;
    }

    /// Resolve the session key for an inbound message.
    ///
    /// Only channels marked `trusted` may have their metadata override the
    /// session key (e.g. to address a different conversation's memory);
    /// an override attempt from an untrusted channel is logged and ignored.
    fn resolve_session_key(&self, msg: &InboundMessage) -> String {
        if self.trusted_channels.contains(&msg.channel) {
            if let Some(key) = msg.metadata.get("session_key") {
                return key.clone();
            }
        } else if msg.metadata.contains_key("session_key") {
            warn!(channel = %msg.channel, "ignoring session_key override from untrusted channel");
        }
        msg.session_key()
    }

    /// Process a single inbound message → outbound response.
    ///
    /// This is the core agent logic:
    /// 1. Get/create session, load history
    /// 2. Build context messages
    /// 3. LLM ↔ tool loop
    /// 4. Save session, return response
    pub async fn process_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        let session_key = self.resolve_session_key(msg);

        // Set message tool context for this conversation
        self.message_tool
            .set_context(&msg.channel, &msg.chat_id)
            .await;

        // Set spawn tool context for this conversation
        self.spawn_tool
            .set_context(&msg.channel, &msg.chat_id)
            .await;

        // Get session history
        let history = self.sessions.get_history(&session_key, 50);

        // Build LLM messages
        let media_paths: Vec<String> = msg.media.iter().map(|m| m.path.clone()).collect();
        let messages = self.context.build_messages(
            &history,
            &msg.content,
            &media_paths,
            &msg.channel,
            &msg.chat_id,
        );

        let token = self.cancellation.child_token();
        let content = self
            .run_tool_loop(messages, &msg.channel, &msg.chat_id, &token)
            .await?;

        // Save conversation to session
        self.sessions
            .add_message(&session_key, Message::user(&msg.content));
        self.sessions
            .add_message(&session_key, Message::assistant(&content));

        Ok(OutboundMessage::new(&msg.channel, &msg.chat_id, &content))
    }

    /// Process a system message (from a subagent or cron).
    ///
    /// Parses the original `channel:chat_id` from `msg.chat_id`, loads the
    /// original session, and runs a single lightweight summarization call —
    /// no tools, no iteration — over the (truncated) subagent payload, then
    /// routes the response back to the correct channel.
    async fn process_system_message(&self, msg: &InboundMessage) -> Result<OutboundMessage> {
        info!(
            sender = %msg.sender_id,
            chat_id = %msg.chat_id,
            "processing system message"
        );

        // Parse origin from chat_id format "channel:chat_id"
        let (origin_channel, origin_chat_id) = match msg.chat_id.split_once(':') {
            Some((ch, cid)) => (ch.to_string(), cid.to_string()),
            None => {
                return Err(anyhow::anyhow!(
                    "Invalid system message chat_id format: {}",
                    msg.chat_id
                ));
            }
        };

        let session_key = format!("{origin_channel}:{origin_chat_id}");

        // Set tools context to the original channel/chat
        self.message_tool
            .set_context(&origin_channel, &origin_chat_id)
            .await;
        self.spawn_tool
            .set_context(&origin_channel, &origin_chat_id)
            .await;

        // Load the original session
        let history = self.sessions.get_history(&session_key, 50);

        let payload = truncate_payload(&msg.content, self.subagent_result_max_chars);

        // Build messages with the (truncated) subagent result as the "user" message
        let messages =
            self.context
                .build_messages(&history, &payload, &[], &origin_channel, &origin_chat_id);

        let token = self.cancellation.child_token();
        let response = tokio::select! {
            _ = token.cancelled() => {
                return Err(anyhow::anyhow!("processing cancelled"));
            }
            r = self.provider.chat(&messages, None, &self.model, &self.request_config) => r,
        };

        let content = response
            .content
            .unwrap_or_else(|| "I reached my tool-call iteration limit without producing a final answer.".into());

        // Save to the original session
        self.sessions
            .add_message(&session_key, Message::user(&payload));
        self.sessions
            .add_message(&session_key, Message::assistant(&content));

        // Route response to the original channel/chat
        Ok(OutboundMessage::new(
            &origin_channel,
            &origin_chat_id,
            &content,
        ))
    }

    /// The LLM ↔ tool-calling iteration shared by every message path.
    ///
    /// Emits a `type=status` outbound naming the tools before each batch,
    /// tracks consecutive all-failed tool batches against
    /// `tool_error_backoff`, and races both the LLM call and the tool
    /// batch against `token`.
    async fn run_tool_loop(
        &self,
        mut messages: Vec<Message>,
        channel: &str,
        chat_id: &str,
        token: &CancellationToken,
    ) -> Result<String> {
        let tool_defs = self.tools.get_definitions();
        let mut final_content: Option<String> = None;
        let mut consecutive_tool_errors: u32 = 0;
        let mut last_tool_error: Option<String> = None;

        for iteration in 0..self.max_iterations {
            debug!(iteration = iteration, "LLM call");

            let response = tokio::select! {
                _ = token.cancelled() => {
                    return Err(anyhow::anyhow!("processing cancelled"));
                }
                r = self.provider.chat(&messages, Some(&tool_defs), &self.model, &self.request_config) => r,
            };

            if response.has_tool_calls() {
                // Add assistant message with tool calls
                let tool_calls: Vec<ToolCall> = response.tool_calls.clone();
                ContextBuilder::add_assistant_message(
                    &mut messages,
                    response.content.clone(),
                    tool_calls.clone(),
                );

                let names: Vec<&str> = tool_calls.iter().map(|tc| tc.function.name.as_str()).collect();
                let mut status = OutboundMessage::new(channel, chat_id, format!("Using tools: {}", names.join(", ")));
                status.metadata.insert("type".to_string(), "status".to_string());
                if let Err(e) = self.bus.publish_outbound(status).await {
                    debug!(error = %e, "failed to publish tool status update");
                }

                let calls: Vec<ToolCallRequest> = tool_calls
                    .iter()
                    .map(|tc| {
                        let params: HashMap<String, serde_json::Value> =
                            serde_json::from_str(&tc.function.arguments).unwrap_or_default();
                        ToolCallRequest {
                            name: tc.function.name.clone(),
                            params,
                        }
                    })
                    .collect();

                let results = tokio::select! {
                    _ = token.cancelled() => {
                        return Err(anyhow::anyhow!("processing cancelled"));
                    }
                    r = self.tools.execute_batch(calls) => r,
                };

                let mut any_succeeded = false;
                for (tc, result) in tool_calls.iter().zip(results.iter()) {
                    debug!(
                        tool = %tc.function.name,
                        result_len = result.len(),
                        "tool result"
                    );
                    if result.starts_with("Error") {
                        last_tool_error = Some(result.clone());
                    } else {
                        any_succeeded = true;
                    }
                    ContextBuilder::add_tool_result(&mut messages, &tc.id, result);
                }

                if any_succeeded {
                    consecutive_tool_errors = 0;
                } else {
                    consecutive_tool_errors += 1;
                    if consecutive_tool_errors >= self.tool_error_backoff {
                        let excerpt = last_tool_error
                            .as_deref()
                            .map(|e| truncate_excerpt(e, 200))
                            .unwrap_or_default();
                        warn!(
                            consecutive_tool_errors,
                            "ending tool loop early after repeated tool failures"
                        );
                        return Ok(format!(
                            "Tooling is failing repeatedly, I'm stopping here. Last error: {excerpt}"
                        ));
                    }
                }
            } else {
                // No tool calls → final answer
                final_content = response.content;
                break;
            }
        }

        Ok(final_content.unwrap_or_else(|| {
            "I reached my tool-call iteration limit without producing a final answer.".into()
        }))
    }

    /// Direct processing mode (CLI entry point).
    ///
    /// Wraps text into an `InboundMessage` on the "cli" channel and processes.
    pub async fn process_direct(&self, text: &str) -> Result<String> {
        let msg = InboundMessage::new("cli", "user", "direct", text);
        let response = self.process_message(&msg).await?;
        Ok(response.content)
    }

    /// Get a reference to the tool registry (for testing/extension).
    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Get the model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

/// Truncate an oversized system-message payload, marking how much was cut.
fn truncate_payload(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let kept: String = content.chars().take(max_chars).collect();
    format!("{kept}\n…(truncated, {} bytes total)", content.len())
}

/// Truncate a tool error string to a short user-facing excerpt.
fn truncate_excerpt(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars).collect();
        format!("{kept}…")
    }
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use nanobot_core::types::{LlmResponse, ToolDefinition};

    /// A mock LLM provider that returns canned responses.
    struct MockProvider {
        /// Responses to return in sequence.
        responses: std::sync::Mutex<Vec<LlmResponse>>,
    }

    impl MockProvider {
        fn new(responses: Vec<LlmResponse>) -> Self {
            Self {
                responses: std::sync::Mutex::new(responses),
            }
        }

        fn simple(text: &str) -> Self {
            Self::new(vec![LlmResponse {
                content: Some(text.into()),
                ..Default::default()
            }])
        }
    }

    #[async_trait]
    impl LlmProvider for MockProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                LlmResponse {
                    content: Some("(no more responses)".into()),
                    ..Default::default()
                }
            } else {
                responses.remove(0)
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "MockProvider"
        }
    }

    fn create_test_loop(provider: Arc<dyn LlmProvider>) -> AgentLoop {
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("nanobot_test_agent");
        let _ = std::fs::create_dir_all(&workspace);

        AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
            None,
            HashSet::new(),
        )
    }

    #[tokio::test]
    async fn test_agent_simple_response() {
        let provider = Arc::new(MockProvider::simple("Hello from Nanobot!"));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("Hi").await.unwrap();
        assert_eq!(result, "Hello from Nanobot!");
    }

    #[tokio::test]
    async fn test_agent_tool_calling() {
        // First response: LLM requests read_file tool call
        // Second response: LLM gives final answer
        let dir = tempfile::tempdir().unwrap();
        let test_file = dir.path().join("test.txt");
        std::fs::write(&test_file, "file content here").unwrap();

        let tool_call = ToolCall::new(
            "call_1",
            "read_file",
            serde_json::json!({"path": test_file.to_str().unwrap()}).to_string(),
        );

        let responses = vec![
            LlmResponse {
                content: None,
                tool_calls: vec![tool_call],
                ..Default::default()
            },
            LlmResponse {
                content: Some("The file contains: file content here".into()),
                ..Default::default()
            },
        ];

        let provider = Arc::new(MockProvider::new(responses));
        let bus = Arc::new(MessageBus::new(32));

        let agent = AgentLoop::new(
            bus,
            provider,
            dir.path().to_path_buf(),
            None,
            Some(10),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
            None,
            HashSet::new(),
        );

        let result = agent.process_direct("Read test.txt").await.unwrap();
        assert_eq!(result, "The file contains: file content here");
    }

    #[tokio::test]
    async fn test_agent_max_iterations() {
        // All responses are tool calls → should exhaust max_iterations
        let tool_call = ToolCall::new("call_loop", "list_dir", r#"{"path": "/tmp"}"#);
        let responses: Vec<LlmResponse> = (0..10)
            .map(|_| LlmResponse {
                content: None,
                tool_calls: vec![tool_call.clone()],
                ..Default::default()
            })
            .collect();

        let provider = Arc::new(MockProvider::new(responses));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("loop forever").await.unwrap();
        assert!(result.contains("tool-call iteration limit"));
    }

    #[tokio::test]
    async fn test_agent_tool_error_backoff_ends_loop_early() {
        // Every call requests a tool that doesn't exist → every batch fails.
        let tool_call = ToolCall::new("call_err", "no_such_tool", "{}");
        let responses: Vec<LlmResponse> = (0..10)
            .map(|_| LlmResponse {
                content: None,
                tool_calls: vec![tool_call.clone()],
                ..Default::default()
            })
            .collect();

        let provider = Arc::new(MockProvider::new(responses));
        let agent = create_test_loop(provider);

        let result = agent.process_direct("keep failing").await.unwrap();
        assert!(result.contains("Tooling is failing repeatedly"));
        assert!(result.contains("not found"));
    }

    #[test]
    fn test_default_tools_registered() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);

        let names = agent.tools().tool_names();
        assert!(names.contains(&"read_file".into()));
        assert!(names.contains(&"write_file".into()));
        assert!(names.contains(&"edit_file".into()));
        assert!(names.contains(&"list_dir".into()));
        assert!(names.contains(&"exec".into()));
        assert!(names.contains(&"web_search".into()));
        assert!(names.contains(&"web_fetch".into()));
        assert!(names.contains(&"message".into()));
        assert!(names.contains(&"spawn".into()));
        assert_eq!(names.len(), 9);
    }

    #[test]
    fn test_model_defaults_to_provider() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);
        assert_eq!(agent.model(), "mock-model");
    }

    #[test]
    fn test_exec_tool_config_default() {
        let config = ExecToolConfig::default();
        assert_eq!(config.timeout, 60);
    }

    #[test]
    fn test_scheduler_config_default_matches_agent_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.max_concurrent_messages, 16);
        assert_eq!(config.tool_error_backoff, 3);
        assert_eq!(config.subagent_result_max_chars, 32 * 1024);
        assert_eq!(config.shutdown_grace_seconds, 30);
    }

    #[test]
    fn test_max_iterations_zero_coerced_to_one() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("nanobot_test_zero_iter");
        let _ = std::fs::create_dir_all(&workspace);

        let agent = AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(0),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
            None,
            HashSet::new(),
        );
        assert_eq!(agent.max_iterations, 1);
    }

    #[tokio::test]
    async fn test_process_system_message() {
        let provider = Arc::new(MockProvider::simple("Here's a summary of the result."));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("nanobot_test_system_msg");
        let _ = std::fs::create_dir_all(&workspace);

        let agent = AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
            None,
            HashSet::new(),
        );

        // Simulate a subagent result message
        let msg = InboundMessage::new(
            "system",
            "subagent",
            "telegram:chat_42",
            "## Subagent Result\n**Task**: test\n\nDone!",
        );

        let response = agent.process_system_message(&msg).await.unwrap();

        // Response should be routed to the original channel/chat
        assert_eq!(response.channel, "telegram");
        assert_eq!(response.chat_id, "chat_42");
        assert_eq!(response.content, "Here's a summary of the result.");
    }

    #[tokio::test]
    async fn test_process_system_message_truncates_payload() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("nanobot_test_system_truncate");
        let _ = std::fs::create_dir_all(&workspace);

        let mut scheduler = SchedulerConfig::default();
        scheduler.subagent_result_max_chars = 10;

        let agent = AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
            Some(scheduler),
            HashSet::new(),
        );

        let long_payload = "x".repeat(500);
        let msg = InboundMessage::new("system", "subagent", "cli:default", long_payload.clone());

        agent.process_system_message(&msg).await.unwrap();

        let history = agent.sessions.get_history("cli:default", 10);
        let saved_user_content = history
            .iter()
            .find_map(|m| match m {
                Message::User {
                    content: nanobot_core::types::MessageContent::Text(text),
                } => Some(text.clone()),
                _ => None,
            })
            .expect("user message should be saved");
        assert!(saved_user_content.contains("truncated"));
        assert!(saved_user_content.len() < long_payload.len());
    }

    #[tokio::test]
    async fn test_process_system_message_invalid_format() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);

        // Missing colon separator
        let msg = InboundMessage::new("system", "subagent", "invalid_chat_id", "test");

        let result = agent.process_system_message(&msg).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_run_routes_system_messages() {
        // Verify that the scheduled run loop correctly routes an inbound
        // system message to process_system_message and publishes the
        // response to the original channel/chat.
        let provider = Arc::new(MockProvider::simple("Summary of result"));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("nanobot_test_run_route");
        let _ = std::fs::create_dir_all(&workspace);

        let agent = Arc::new(AgentLoop::new(
            bus.clone(),
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
            None,
            HashSet::new(),
        ));

        let msg = InboundMessage::new(
            "system",
            "subagent",
            "discord:guild_1",
            "Subagent result content",
        );
        bus.publish_inbound(msg).await.unwrap();

        let run_handle = tokio::spawn(agent.clone().run());

        let response = tokio::time::timeout(Duration::from_secs(5), bus.consume_outbound())
            .await
            .expect("should receive an outbound response before timing out")
            .expect("bus should still be open");

        assert_eq!(response.channel, "discord");
        assert_eq!(response.chat_id, "guild_1");
        assert_eq!(response.content, "Summary of result");

        agent.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(2), run_handle).await;
    }

    #[tokio::test]
    async fn test_stop_cancels_root_token() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);
        agent.stop().await;
        assert!(agent.cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn test_resolve_session_key_respects_trust() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let bus = Arc::new(MessageBus::new(32));
        let workspace = std::env::temp_dir().join("nanobot_test_trust");
        let _ = std::fs::create_dir_all(&workspace);

        let mut trusted = HashSet::new();
        trusted.insert("cli".to_string());

        let agent = AgentLoop::new(
            bus,
            provider,
            workspace,
            None,
            Some(5),
            None,
            None,
            None,
            false,
            None,
            None,
            None,
            None,
            trusted,
        );

        let mut trusted_msg = InboundMessage::new("cli", "user", "default", "hi");
        trusted_msg
            .metadata
            .insert("session_key".to_string(), "cli:override".to_string());
        assert_eq!(agent.resolve_session_key(&trusted_msg), "cli:override");

        let mut untrusted_msg = InboundMessage::new("telegram", "user", "chat_1", "hi");
        untrusted_msg
            .metadata
            .insert("session_key".to_string(), "telegram:override".to_string());
        assert_eq!(agent.resolve_session_key(&untrusted_msg), "telegram:chat_1");
    }

    #[tokio::test]
    async fn test_subagent_manager_accessible() {
        let provider = Arc::new(MockProvider::simple("ok"));
        let agent = create_test_loop(provider);

        // Subagent manager should start with 0 tasks
        assert_eq!(agent.subagent_manager.task_count().await, 0);
    }
}
