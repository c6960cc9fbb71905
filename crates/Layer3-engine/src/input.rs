//! Operator input routing and the advisory messages sent to tasks

use crate::signal::Signal;
use hive_task::TaskId;

/// Where free-form operator text was addressed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputScope {
    Global,
    Task(TaskId),
}

/// Where operator text ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputRoute {
    /// Delivered to the inbox of the task in alignment
    Alignment(TaskId),
    /// `/end` during alignment; independent judgment authorized
    AlignmentEnded(TaskId),
    /// Delivered to the addressed task's inbox
    TaskInbox(TaskId),
    /// Parsed as a scheduler command and queued
    Signal(Signal),
    /// Enqueued as a new human task
    NewTask(TaskId),
}

/// Ends the current alignment session when sent during one
pub const END_ALIGNMENT_COMMAND: &str = "/end";

const TITLE_MAX_CHARS: usize = 80;

pub(crate) const REST_ADVISORY: &str = "[hive] The operator has called it a day. Finish your \
current step, write a checkpoint to progress.json, then stop at the next convenient boundary. \
Do not start new work.";

pub(crate) const INDEPENDENT_JUDGMENT: &str = "[hive] The operator has ended the alignment \
session without further input. Use your own judgment to resolve the open question and continue.";

pub(crate) fn alignment_advisory(message: &str) -> String {
    format!(
        "[hive] The operator requests alignment: {}\n\
         Stop at the next safe boundary, then write progress.json with status \
         \"waiting_for_human\" and your question in \"question\".",
        message
    )
}

/// Parse `/freeze [reason]`, `/resume`, `/rest`
pub(crate) fn parse_command(text: &str) -> Option<Signal> {
    let text = text.trim();
    let (command, rest) = match text.split_once(char::is_whitespace) {
        Some((command, rest)) => (command, rest.trim()),
        None => (text, ""),
    };
    match command {
        "/freeze" => Some(Signal::freeze_all(if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        })),
        "/resume" => Some(Signal::resume_all()),
        "/rest" => Some(Signal::Rest),
        _ => None,
    }
}

/// Title for a task created from free text: first line, bounded
pub(crate) fn title_from_text(text: &str) -> String {
    let first = text.trim().lines().next().unwrap_or_default().trim();
    if first.chars().count() <= TITLE_MAX_CHARS {
        return first.to_string();
    }
    let mut title: String = first.chars().take(TITLE_MAX_CHARS - 3).collect();
    title.push_str("...");
    title
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(
            parse_command("/freeze deploy window"),
            Some(Signal::freeze_all(Some("deploy window".into())))
        );
        assert_eq!(parse_command(" /freeze "), Some(Signal::freeze_all(None)));
        assert_eq!(parse_command("/resume"), Some(Signal::resume_all()));
        assert_eq!(parse_command("/rest"), Some(Signal::Rest));
        assert_eq!(parse_command("/frozen"), None);
        assert_eq!(parse_command("please /rest"), None);
    }

    #[test]
    fn test_title_from_text() {
        assert_eq!(title_from_text("  Draft announcement\nmore detail"), "Draft announcement");
        let long = "x".repeat(200);
        let title = title_from_text(&long);
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS);
        assert!(title.ends_with("..."));
    }
}
