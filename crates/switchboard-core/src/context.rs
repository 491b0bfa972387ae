//! Bounded conversation window
//!
//! A handler never sees the raw transcript; it sees a bounded view: the
//! leading system instruction (when present) plus the most recent turns.
//! The full history stays in the transcript store, untouched.

use tracing::debug;

use crate::types::{ChatMessage, ChatRole};

/// Default number of recent messages presented to a handler
pub const DEFAULT_WINDOW: usize = 10;

/// Return the slice of `history` to present to a handler.
///
/// If the history holds at most `k` messages it is returned unchanged,
/// including any leading system message. Otherwise the result is the
/// leading system message (when present) followed by the `k` most recent
/// messages, oldest discarded first.
///
/// Pure function of its inputs: applying it to its own output returns the
/// same output.
pub fn bounded_window(history: &[ChatMessage], k: usize) -> Vec<ChatMessage> {
    if history.len() <= k {
        return history.to_vec();
    }

    let system = history
        .first()
        .filter(|m| m.role == ChatRole::System)
        .cloned();

    let recent = &history[history.len() - k..];

    let mut window = Vec::with_capacity(k + 1);
    if let Some(system) = system {
        // Keep the instruction only when truncation would otherwise drop it
        if recent.first().map(|m| m.role) != Some(ChatRole::System) {
            window.push(system);
        }
    }
    window.extend_from_slice(recent);

    debug!(
        total = history.len(),
        window = window.len(),
        "truncated conversation history"
    );

    window
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turns(n: usize) -> Vec<ChatMessage> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("user {i}"))
                } else {
                    ChatMessage::assistant(format!("assistant {i}"))
                }
            })
            .collect()
    }

    #[test]
    fn test_short_history_unchanged() {
        let history = turns(4);
        let window = bounded_window(&history, DEFAULT_WINDOW);
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].content, "user 0");
    }

    #[test]
    fn test_exactly_k_unchanged() {
        let history = turns(10);
        let window = bounded_window(&history, 10);
        assert_eq!(window.len(), 10);
    }

    #[test]
    fn test_truncates_oldest_first() {
        let history = turns(25);
        let window = bounded_window(&history, 10);
        assert_eq!(window.len(), 10);
        assert_eq!(window[0].content, "assistant 15");
        assert_eq!(window.last().unwrap().content, "user 24");
    }

    #[test]
    fn test_system_message_survives_truncation() {
        let mut history = vec![ChatMessage::system("You are the billing handler.")];
        history.extend(turns(20));

        let window = bounded_window(&history, 10);
        assert_eq!(window.len(), 11);
        assert_eq!(window[0].role, ChatRole::System);
        assert_eq!(window.last().unwrap().content, "assistant 19");
    }

    #[test]
    fn test_idempotent() {
        let mut history = vec![ChatMessage::system("instructions")];
        history.extend(turns(30));

        let once = bounded_window(&history, 10);
        let twice = bounded_window(&once, 10);
        assert_eq!(once.len(), twice.len());
        for (a, b) in once.iter().zip(twice.iter()) {
            assert_eq!(a.content, b.content);
            assert_eq!(a.role, b.role);
        }
    }

    #[test]
    fn test_empty_history() {
        let window = bounded_window(&[], 10);
        assert!(window.is_empty());
    }

    #[test]
    fn test_no_system_message() {
        let history = turns(15);
        let window = bounded_window(&history, 10);
        assert_eq!(window.len(), 10);
        assert!(window.iter().all(|m| m.role != ChatRole::System));
    }
}
