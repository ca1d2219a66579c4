//! Context builder — constructs the system prompt and conversation messages.
//!
//! Port of nanobot's `agent/context.py`.
//! Builds the system prompt from identity, bootstrap files, memory, and skills,
//! then assembles the full message list for an LLM call.

use std::path::PathBuf;

use base64::Engine;
use chrono::Utc;
use nanobot_core::types::{ContentPart, ImageUrl, Message, MessageContent};
use tracing::{debug, warn};

use crate::memory::MemoryStore;
use crate::skills::SkillsLoader;

/// Media attachments larger than this are omitted from the multimodal
/// message, replaced with a text note, rather than blowing up the prompt
/// (or the provider's request body limit).
const MAX_MEDIA_BYTES: usize = 8 * 1024 * 1024;

// ─────────────────────────────────────────────
// Bootstrap / identity files
// ─────────────────────────────────────────────

/// Files that are automatically injected into the system prompt when present
/// in the workspace root.
const BOOTSTRAP_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "USER.md",
    "TOOLS.md",
    "IDENTITY.md",
];

// ─────────────────────────────────────────────
// Context builder
// ─────────────────────────────────────────────

/// Builds system prompts and conversation message lists for the agent loop.
pub struct ContextBuilder {
    /// Root workspace directory.
    workspace: PathBuf,
    /// Agent identity name (for the system prompt).
    agent_name: String,
    /// Memory store for long-term + daily notes.
    memory: MemoryStore,
    /// Skills loader for discovering and loading skill files.
    skills: SkillsLoader,
    /// Character budget for the bootstrap-files section.
    bootstrap_max_chars: usize,
    /// Character budget for the memory section.
    memory_max_chars: usize,
    /// Character budget for the skills section (active + catalogue).
    skills_max_chars: usize,
    /// Character budget for conversation history.
    history_max_chars: usize,
}

impl ContextBuilder {
    /// Create a new context builder, using the config defaults for every
    /// section's character budget.
    pub fn new(workspace: impl Into<PathBuf>, agent_name: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let memory = MemoryStore::new_lazy(&workspace);
        let skills = SkillsLoader::new(&workspace, None);
        Self {
            workspace,
            agent_name: agent_name.into(),
            memory,
            skills,
            bootstrap_max_chars: 8_000,
            memory_max_chars: 6_000,
            skills_max_chars: 4_000,
            history_max_chars: 20_000,
        }
    }

    /// Set the built-in skills directory (builder pattern).
    pub fn with_builtin_skills(mut self, path: PathBuf) -> Self {
        self.skills = SkillsLoader::new(&self.workspace, Some(path));
        self
    }

    /// Override the per-section character budgets (builder pattern).
    pub fn with_budgets(
        mut self,
        bootstrap_max_chars: usize,
        memory_max_chars: usize,
        skills_max_chars: usize,
        history_max_chars: usize,
    ) -> Self {
        self.bootstrap_max_chars = bootstrap_max_chars;
        self.memory_max_chars = memory_max_chars;
        self.skills_max_chars = skills_max_chars;
        self.history_max_chars = history_max_chars;
        self
    }

    /// Get a reference to the memory store.
    pub fn memory(&self) -> &MemoryStore {
        &self.memory
    }

    /// Get a reference to the skills loader.
    pub fn skills(&self) -> &SkillsLoader {
        &self.skills
    }

    // ────────────── System prompt ──────────────

    /// Build the full system prompt.
    pub fn build_system_prompt(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        // 1) Identity
        parts.push(self.build_identity());

        // 2) Bootstrap files, budgeted together so one oversized AGENTS.md
        // can't crowd out the others.
        let mut bootstrap_parts = Vec::new();
        for filename in BOOTSTRAP_FILES {
            let path = self.workspace.join(filename);
            if path.is_file() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    debug!(file = filename, "loaded bootstrap file");
                    bootstrap_parts.push(format!("## {filename}\n\n{content}"));
                }
            }
        }
        if !bootstrap_parts.is_empty() {
            parts.push(truncate_chars(&bootstrap_parts.join("\n\n"), self.bootstrap_max_chars));
        }

        // 3) Memory context (via MemoryStore)
        if let Some(memory) = self.memory.get_memory_context() {
            parts.push(truncate_chars(&memory, self.memory_max_chars));
        }

        // 4) Skills — always-on bodies plus the catalogue summary, budgeted
        // together under one cap.
        let mut skills_parts = Vec::new();
        let always_skills = self.skills.get_always_skills();
        if !always_skills.is_empty() {
            let always_content = self.skills.load_skills_for_context(&always_skills);
            if !always_content.is_empty() {
                skills_parts.push(format!("# Active Skills\n\n{always_content}"));
            }
        }
        let skills_summary = self.skills.build_skills_summary();
        if !skills_summary.is_empty() {
            skills_parts.push(format!(
                "# Skills\n\n\
                 The following skills extend your capabilities. \
                 To use a skill, read its SKILL.md file using the `read_file` tool.\n\
                 Skills with available=\"false\" need dependencies installed first.\n\n\
                 {skills_summary}"
            ));
        }
        if !skills_parts.is_empty() {
            parts.push(truncate_chars(&skills_parts.join("\n\n"), self.skills_max_chars));
        }

        parts.join("\n\n---\n\n")
    }

    /// Core identity block.
    fn build_identity(&self) -> String {
        let now = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
        let os = std::env::consts::OS;
        let arch = std::env::consts::ARCH;
        let workspace = self.workspace.display();
        let memory_file = self.memory.memory_file().display();
        let today = Utc::now().format("%Y-%m-%d");

        format!(
            "# Identity\n\n\
             You are **{name}**, an AI assistant.\n\n\
             - **Date/time**: {now}\n\
             - **Runtime**: Rust on {os}/{arch}\n\
             - **Workspace**: `{workspace}`\n\n\
             You have access to tools. Use them when needed to answer questions, \
             read/write files, run commands, search the web, and more.\n\
             Always prefer using tools over guessing. \
             Be concise and helpful.\n\n\
             ## Memory\n\n\
             When you learn something important about the user or the project, \
             persist it by writing to `{memory_file}` using the `write_file` or `edit_file` tool.\n\
             For daily notes, write to `{workspace}/memory/{today}.md`.",
            name = self.agent_name,
        )
    }

    // ────────────── Message building ──────────────

    /// Build the full message list for an LLM call.
    ///
    /// 1. System prompt
    /// 2. Session history
    /// 3. Current user message
    pub fn build_messages(
        &self,
        history: &[Message],
        user_text: &str,
        media: &[String],
        channel: &str,
        chat_id: &str,
    ) -> Vec<Message> {
        let mut messages = Vec::new();

        // System prompt + session info
        let mut system = self.build_system_prompt();
        system.push_str(&format!(
            "\n\n## Current Session\nChannel: {channel}\nChat ID: {chat_id}"
        ));
        messages.push(Message::system(system));

        // History, bounded so a long-running session doesn't blow the
        // request budget. Drops oldest messages first, always keeping at
        // least the most recent one.
        messages.extend(truncate_history(history, self.history_max_chars));

        // Current user message
        if media.is_empty() {
            messages.push(Message::user(user_text));
        } else {
            messages.push(build_multimodal_user_message(user_text, media));
        }

        messages
    }

    /// Add a tool result to the message list (convenience wrapper).
    pub fn add_tool_result(messages: &mut Vec<Message>, tool_call_id: &str, result: &str) {
        messages.push(Message::tool_result(tool_call_id, result));
    }

    /// Add an assistant message (with optional tool calls) to the message list.
    pub fn add_assistant_message(
        messages: &mut Vec<Message>,
        content: Option<String>,
        tool_calls: Vec<nanobot_core::types::ToolCall>,
    ) {
        if tool_calls.is_empty() {
            if let Some(text) = content {
                messages.push(Message::assistant(text));
            }
        } else {
            messages.push(Message::assistant_tool_calls(tool_calls));
        }
    }
}

/// Truncate a string to at most `max_chars` characters, appending a note
/// about how much was dropped. No-op if already within budget or the
/// budget is 0 (0 means "unbounded").
fn truncate_chars(s: &str, max_chars: usize) -> String {
    if max_chars == 0 {
        return s.to_string();
    }
    let total = s.chars().count();
    if total <= max_chars {
        return s.to_string();
    }
    let kept: String = s.chars().take(max_chars).collect();
    let omitted = total - max_chars;
    format!("{kept}\n\n[... truncated, {omitted} more characters omitted ...]")
}

/// Rough character length of a message, for history budgeting.
fn message_len(msg: &Message) -> usize {
    match msg {
        Message::System { content } => content.chars().count(),
        Message::Tool { content, .. } => content.chars().count(),
        Message::Assistant {
            content,
            reasoning_content,
            ..
        } => {
            content.as_ref().map(|c| c.chars().count()).unwrap_or(0)
                + reasoning_content.as_ref().map(|c| c.chars().count()).unwrap_or(0)
        }
        Message::User { content } => match content {
            MessageContent::Text(t) => t.chars().count(),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|p| match p {
                    ContentPart::Text { text } => text.chars().count(),
                    ContentPart::ImageUrl { .. } => 0,
                })
                .sum(),
        },
    }
}

/// Keep the most recent messages whose combined length fits `max_chars`,
/// always keeping at least the single most recent message. 0 means
/// unbounded (full history kept).
fn truncate_history(history: &[Message], max_chars: usize) -> Vec<Message> {
    if max_chars == 0 || history.is_empty() {
        return history.to_vec();
    }
    let mut kept: Vec<Message> = Vec::new();
    let mut total = 0usize;
    for msg in history.iter().rev() {
        let len = message_len(msg);
        if !kept.is_empty() && total + len > max_chars {
            break;
        }
        total += len;
        kept.push(msg.clone());
    }
    kept.reverse();
    kept
}

// ─────────────────────────────────────────────
// Multimodal helpers
// ─────────────────────────────────────────────

/// Build a user message with base64-encoded images.
///
/// Audio files are skipped — their transcription is already in the text content.
fn build_multimodal_user_message(text: &str, media_paths: &[String]) -> Message {
    let mut parts = Vec::new();

    for path in media_paths {
        // Skip audio files — transcription text is already in `content`
        if is_audio_extension(path) {
            continue;
        }
        match std::fs::read(path) {
            Ok(data) if data.len() > MAX_MEDIA_BYTES => {
                warn!(path, size = data.len(), limit = MAX_MEDIA_BYTES, "media attachment too large, omitting");
                parts.push(ContentPart::Text {
                    text: format!(
                        "[attachment {path} omitted: {} bytes exceeds the {} byte limit]",
                        data.len(),
                        MAX_MEDIA_BYTES
                    ),
                });
            }
            Ok(data) => {
                let mime = guess_mime(path);
                let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
                parts.push(ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: format!("data:{mime};base64,{b64}"),
                        detail: None,
                    },
                });
            }
            Err(e) => {
                warn!(path, error = %e, "failed to read media attachment");
            }
        }
    }

    parts.push(ContentPart::Text {
        text: text.to_string(),
    });

    Message::user_parts(parts)
}

/// Check if a file path has an audio extension.
fn is_audio_extension(path: &str) -> bool {
    let lower = path.to_lowercase();
    lower.ends_with(".ogg")
        || lower.ends_with(".oga")
        || lower.ends_with(".opus")
        || lower.ends_with(".mp3")
        || lower.ends_with(".m4a")
        || lower.ends_with(".wav")
        || lower.ends_with(".flac")
        || lower.ends_with(".aac")
        || lower.ends_with(".wma")
        || lower.ends_with(".webm")
}

/// Simple MIME guesser based on extension.
fn guess_mime(path: &str) -> &str {
    let lower = path.to_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".gif") {
        "image/gif"
    } else if lower.ends_with(".webp") {
        "image/webp"
    } else if lower.ends_with(".svg") {
        "image/svg+xml"
    } else {
        "image/jpeg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_mime() {
        assert_eq!(guess_mime("photo.png"), "image/png");
        assert_eq!(guess_mime("photo.PNG"), "image/png");
        assert_eq!(guess_mime("photo.jpg"), "image/jpeg");
        assert_eq!(guess_mime("photo.gif"), "image/gif");
        assert_eq!(guess_mime("photo.webp"), "image/webp");
        assert_eq!(guess_mime("photo.unknown"), "image/jpeg");
    }

    #[test]
    fn test_truncate_chars_under_budget_is_noop() {
        assert_eq!(truncate_chars("short", 100), "short");
        assert_eq!(truncate_chars("anything", 0), "anything");
    }

    #[test]
    fn test_truncate_chars_over_budget() {
        let out = truncate_chars("abcdefghij", 4);
        assert!(out.starts_with("abcd"));
        assert!(out.contains("6 more characters omitted"));
    }

    #[test]
    fn test_truncate_history_keeps_most_recent() {
        let history = vec![
            Message::user("a".repeat(50)),
            Message::assistant("b".repeat(50)),
            Message::user("c".repeat(50)),
        ];
        let kept = truncate_history(&history, 60);
        assert_eq!(kept.len(), 1);
        assert_eq!(message_len(&kept[0]), 50);
    }

    #[test]
    fn test_truncate_history_keeps_at_least_one_even_if_oversized() {
        let history = vec![Message::user("x".repeat(1000))];
        let kept = truncate_history(&history, 10);
        assert_eq!(kept.len(), 1);
    }

    #[test]
    fn test_truncate_history_zero_budget_is_unbounded() {
        let history = vec![Message::user("a"), Message::assistant("b")];
        let kept = truncate_history(&history, 0);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_multimodal_message_omits_oversized_attachment() {
        let dir = tempfile::tempdir().unwrap();
        let big_path = dir.path().join("big.png");
        std::fs::write(&big_path, vec![0u8; MAX_MEDIA_BYTES + 1]).unwrap();
        let msg = build_multimodal_user_message("hi", &[big_path.display().to_string()]);
        if let Message::User {
            content: MessageContent::Parts(parts),
        } = msg
        {
            let has_text_omission = parts.iter().any(|p| match p {
                ContentPart::Text { text } => text.contains("omitted"),
                _ => false,
            });
            assert!(has_text_omission);
            assert!(!parts.iter().any(|p| matches!(p, ContentPart::ImageUrl { .. })));
        } else {
            panic!("expected multipart user message");
        }
    }

    #[test]
    fn test_build_identity() {
        let ctx = ContextBuilder::new("/tmp/workspace", "TestBot");
        let identity = ctx.build_identity();
        assert!(identity.contains("TestBot"));
        assert!(identity.contains("/tmp/workspace"));
        assert!(identity.contains("Rust on"));
    }

    #[test]
    fn test_build_system_prompt_no_files() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Nanobot");
        let prompt = ctx.build_system_prompt();
        assert!(prompt.contains("Nanobot"));
        // No bootstrap files → no "---" separator for them
    }

    #[test]
    fn test_build_system_prompt_with_bootstrap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "# Agent config\nBe helpful.").unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Nanobot");
        let prompt = ctx.build_system_prompt();
        assert!(prompt.contains("Be helpful."));
        assert!(prompt.contains("## AGENTS.md"));
    }

    #[test]
    fn test_build_system_prompt_with_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mem_dir = dir.path().join("memory");
        std::fs::create_dir(&mem_dir).unwrap();
        std::fs::write(mem_dir.join("MEMORY.md"), "User prefers dark mode.").unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Nanobot");
        let prompt = ctx.build_system_prompt();
        assert!(prompt.contains("User prefers dark mode."));
        assert!(prompt.contains("Long-term Memory"));
    }

    #[test]
    fn test_build_messages_text_only() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Nanobot");
        let history = vec![
            Message::user("previous question"),
            Message::assistant("previous answer"),
        ];
        let msgs = ctx.build_messages(&history, "new question", &[], "cli", "direct");
        // system + 2 history + 1 user = 4
        assert_eq!(msgs.len(), 4);
    }

    #[test]
    fn test_build_messages_with_session_info() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ContextBuilder::new(dir.path(), "Nanobot");
        let msgs = ctx.build_messages(&[], "hello", &[], "telegram", "chat_42");
        // The system message should contain channel/chat info
        if let Message::System { content } = &msgs[0] {
            assert!(content.contains("Channel: telegram"));
            assert!(content.contains("Chat ID: chat_42"));
        } else {
            panic!("First message should be System");
        }
    }

    #[test]
    fn test_add_tool_result() {
        let mut msgs = vec![Message::user("test")];
        ContextBuilder::add_tool_result(&mut msgs, "call_1", "result data");
        assert_eq!(msgs.len(), 2);
    }

    #[test]
    fn test_add_assistant_message_text() {
        let mut msgs = Vec::new();
        ContextBuilder::add_assistant_message(&mut msgs, Some("hello".into()), vec![]);
        assert_eq!(msgs.len(), 1);
    }

    #[test]
    fn test_add_assistant_message_tool_calls() {
        use nanobot_core::types::ToolCall;
        let mut msgs = Vec::new();
        let tc = ToolCall::new("id1", "read_file", r#"{"path":"foo"}"#);
        ContextBuilder::add_assistant_message(&mut msgs, None, vec![tc]);
        assert_eq!(msgs.len(), 1);
    }
}
