//! Shared CLI helpers — path expansion, response printing, version banner.

use std::collections::HashSet;
use std::path::PathBuf;

use colored::Colorize;
use nanobot_agent::{SchedulerConfig, SubagentLimits};
use nanobot_core::config::schema::{AgentDefaults, ChannelsConfig};

/// Build subagent resource limits from the agent defaults config section.
pub fn subagent_limits(defaults: &AgentDefaults) -> SubagentLimits {
    SubagentLimits {
        max_concurrent: defaults.max_concurrent_subagents,
        timeout_seconds: defaults.subagent_timeout_seconds,
        result_max_chars: defaults.subagent_result_max_chars,
    }
}

/// Build the agent loop's scheduler config from the agent defaults section.
pub fn scheduler_config(defaults: &AgentDefaults) -> SchedulerConfig {
    SchedulerConfig {
        max_concurrent_messages: defaults.max_concurrent_messages,
        tool_error_backoff: defaults.tool_error_backoff,
        subagent_result_max_chars: defaults.subagent_result_max_chars,
        shutdown_grace_seconds: defaults.shutdown_grace_seconds,
    }
}

/// Channels allowed to override `session_key` via inbound message metadata.
///
/// The local CLI/REPL channel is always trusted; network-facing channels
/// opt in individually via their `trusted` config flag.
pub fn trusted_channels(channels: &ChannelsConfig) -> HashSet<String> {
    let mut set = HashSet::new();
    set.insert("cli".to_string());
    if channels.telegram.trusted {
        set.insert("telegram".to_string());
    }
    if channels.discord.trusted {
        set.insert("discord".to_string());
    }
    if channels.whatsapp.trusted {
        set.insert("whatsapp".to_string());
    }
    if channels.feishu.trusted {
        set.insert("feishu".to_string());
    }
    if channels.dingtalk.trusted {
        set.insert("dingtalk".to_string());
    }
    if channels.slack.trusted {
        set.insert("slack".to_string());
    }
    if channels.email.trusted {
        set.insert("email".to_string());
    }
    if channels.qq.trusted {
        set.insert("qq".to_string());
    }
    if channels.mochat.trusted {
        set.insert("mochat".to_string());
    }
    set
}

/// Expand `~` at the start of a path to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_next::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs_next::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

/// Print an agent response to stdout.
pub fn print_response(response: &str, _render_markdown: bool) {
    // TODO: add termimad or similar markdown renderer when render_markdown=true
    println!();
    println!("{}", "🦀 Nanobot".cyan().bold());
    if response.is_empty() {
        println!("{}", "(no response)".dimmed());
    } else {
        println!("{response}");
    }
    println!();
}

/// Print the banner shown at REPL start.
pub fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    println!();
    println!(
        "{}  v{}",
        "🦀 Nanobot".cyan().bold(),
        version.dimmed()
    );
    println!(
        "{}",
        "Type a message, or \"exit\" to quit.".dimmed()
    );
    println!();
}

/// Print a "thinking" spinner placeholder (for non-log mode).
pub fn print_thinking() {
    eprint!("{}", "⠿ thinking...".dimmed());
}

/// Clear the "thinking" placeholder.
pub fn clear_thinking() {
    eprint!("\r{}\r", " ".repeat(40));
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_tilde_home() {
        let result = expand_tilde("~/foo/bar");
        assert!(result.ends_with("foo/bar"));
        assert!(!result.starts_with("~"));
    }

    #[test]
    fn expand_tilde_no_tilde() {
        let result = expand_tilde("/absolute/path");
        assert_eq!(result, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn expand_tilde_bare() {
        let result = expand_tilde("~");
        assert!(!result.to_string_lossy().contains('~'));
    }

    #[test]
    fn expand_tilde_relative() {
        let result = expand_tilde("relative/path");
        assert_eq!(result, PathBuf::from("relative/path"));
    }

    #[test]
    fn subagent_limits_reads_agent_defaults() {
        let defaults = AgentDefaults::default();
        let limits = subagent_limits(&defaults);
        assert_eq!(limits.max_concurrent, defaults.max_concurrent_subagents);
        assert_eq!(limits.timeout_seconds, defaults.subagent_timeout_seconds);
        assert_eq!(limits.result_max_chars, defaults.subagent_result_max_chars);
    }

    #[test]
    fn scheduler_config_reads_agent_defaults() {
        let defaults = AgentDefaults::default();
        let sched = scheduler_config(&defaults);
        assert_eq!(sched.max_concurrent_messages, defaults.max_concurrent_messages);
        assert_eq!(sched.tool_error_backoff, defaults.tool_error_backoff);
        assert_eq!(sched.subagent_result_max_chars, defaults.subagent_result_max_chars);
        assert_eq!(sched.shutdown_grace_seconds, defaults.shutdown_grace_seconds);
    }

    #[test]
    fn trusted_channels_always_includes_cli() {
        let channels = ChannelsConfig::default();
        let set = trusted_channels(&channels);
        assert!(set.contains("cli"));
        assert!(!set.contains("telegram"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn trusted_channels_includes_opted_in_channels() {
        let mut channels = ChannelsConfig::default();
        channels.telegram.trusted = true;
        channels.slack.trusted = true;
        let set = trusted_channels(&channels);
        assert!(set.contains("cli"));
        assert!(set.contains("telegram"));
        assert!(set.contains("slack"));
        assert!(!set.contains("discord"));
    }
}
