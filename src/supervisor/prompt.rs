//! Prompt construction for a supervisor turn and parsing of its marker
//! response back into a [`Decision`].

use crate::session::ToolHistoryEntry;
use crate::supervisor::decision::Decision;

const PROTOCOL_BLOCK: &str = "\
Respond with ONE marker at the start of your reply, followed by content:\n\
[COMPLETE] <summary> - work done, stop.\n\
[ABORT] <reason> - something is wrong, stop.\n\
[CONTINUE] <exact instruction> - worker should do this next.\n";

/// Builds the one-shot print-mode prompt: task, iteration banner, a compact
/// tool-history summary, then the response protocol.
pub fn build_print_mode_prompt(
    task_description: &str,
    current_iteration: u32,
    max_iterations: u32,
    tool_history: &[ToolHistoryEntry],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("TASK: {task_description}\n"));
    out.push_str(&format!(
        "ITERATION: {current_iteration}/{max_iterations}\n\n"
    ));

    if tool_history.is_empty() {
        out.push_str("RECENT TOOL ACTIVITY: none since the last check-in.\n\n");
    } else {
        out.push_str("RECENT TOOL ACTIVITY:\n");
        for entry in tool_history {
            let status = match &entry.error {
                Some(e) => format!("ERROR: {e}"),
                None => entry.output_snippet.clone(),
            };
            out.push_str(&format!("- {}: {}\n", entry.tool_name, status));
        }
        out.push('\n');
    }

    out.push_str(PROTOCOL_BLOCK);
    out
}

/// Builds the interactive-PTY prompt: the worker's transcript replayed as
/// role-tagged lines (last ~30 entries), instead of the compact summary.
pub fn build_interactive_prompt(
    task_description: &str,
    current_iteration: u32,
    max_iterations: u32,
    transcript_lines: &[String],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("TASK: {task_description}\n"));
    out.push_str(&format!(
        "ITERATION: {current_iteration}/{max_iterations}\n\n"
    ));

    out.push_str("WORKER TRANSCRIPT (most recent turns):\n");
    let start = transcript_lines.len().saturating_sub(30);
    for line in &transcript_lines[start..] {
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');

    out.push_str(PROTOCOL_BLOCK);
    out
}

/// Parses a supervisor's raw reply into a Decision per the marker->action
/// table. Missing marker defaults to `continue` with the full trimmed text
/// as the instruction; empty reply defaults to `continue` with no command.
pub fn parse_response(reply: &str) -> Decision {
    let trimmed = reply.trim();

    if trimmed.is_empty() {
        log::warn!("supervisor returned an empty reply, defaulting to continue");
        return Decision::continue_monitoring("empty supervisor reply", 0.5);
    }

    if let Some(rest) = strip_marker(trimmed, "[COMPLETE]") {
        return Decision::stop(rest.to_string(), 0.9);
    }
    if let Some(rest) = strip_marker(trimmed, "[ABORT]") {
        return Decision::abort(rest.to_string(), Some("/clear".to_string()), 0.9);
    }
    if let Some(rest) = strip_marker(trimmed, "[CONTINUE]") {
        if rest.is_empty() {
            return Decision::continue_monitoring("supervisor said continue with no instruction", 0.5);
        }
        return Decision::inject(rest.to_string(), "supervisor issued a follow-up instruction", 0.8);
    }

    log::warn!("supervisor reply carried no recognised marker: {trimmed:?}");
    Decision::continue_monitoring("no marker found in supervisor reply", 0.3)
}

fn strip_marker<'a>(text: &'a str, marker: &str) -> Option<&'a str> {
    text.find(marker)
        .map(|idx| text[idx + marker.len()..].trim())
}
