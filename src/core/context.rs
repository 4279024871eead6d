//! Valid context resolution
//!
//! Decides which messages of a session would be sent to the model as
//! conversation history.

use super::types::{ChatMessage, Role};

/// Messages eligible to be sent as history
///
/// In continuous mode this is every complete user → assistant pair whose reply
/// is not a temporary placeholder. Otherwise only pinned (`locked`) messages
/// are carried forward.
pub fn valid_context(messages: &[ChatMessage], continuous_dialogue: bool) -> Vec<ChatMessage> {
    if !continuous_dialogue {
        return messages.iter().filter(|m| m.is_locked()).cloned().collect();
    }

    messages
        .iter()
        .enumerate()
        .filter(|&(i, message)| match message.role {
            Role::Assistant => {
                !message.is_temporary()
                    && i > 0
                    && messages.get(i - 1).map(|m| m.role) == Some(Role::User)
            }
            Role::User => messages.get(i + 1).is_some_and(is_reply),
            Role::System | Role::Error => false,
        })
        .map(|(_, message)| message.clone())
        .collect()
}

/// Whether `next` completes a pair with the user message before it
fn is_reply(next: &ChatMessage) -> bool {
    next.role == Role::Assistant && !next.is_temporary()
}

/// Text handed to the token counter for a context
pub fn joined_content(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| m.content.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
