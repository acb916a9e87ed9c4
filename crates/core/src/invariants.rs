//! Developer guardrails and invariants
//!
//! Debug assertions for detecting impossible states during development.
//! These checks are compiled out in release builds.

use crate::models::{Conversation, Message, MessageKind, SenderRole, UnreadCounters};
use crate::redact::contains_sensitive;

/// Validate that a persisted message is internally consistent
pub fn assert_message_invariants(message: &Message) {
    // Filtered content must not leak what was filtered
    debug_assert!(
        !message.was_filtered() || !contains_sensitive(message.content()),
        "Message {} is marked filtered but still contains contact details",
        message.id
    );

    // System kind and system role go together
    debug_assert!(
        (message.kind() == MessageKind::System) == (message.sender_role == SenderRole::System),
        "Message {} has kind {:?} but sender role {:?}",
        message.id,
        message.kind(),
        message.sender_role
    );

    debug_assert!(
        message.sequence > 0,
        "Message {} was not assigned a sequence",
        message.id
    );
}

/// Validate that a conversation history is in delivery order
pub fn assert_sequence_order(messages: &[Message]) {
    for pair in messages.windows(2) {
        debug_assert!(
            pair[0].sequence < pair[1].sequence,
            "Messages out of order: sequence {} before {}",
            pair[0].sequence,
            pair[1].sequence
        );
        debug_assert!(
            pair[0].created_at <= pair[1].created_at,
            "Message {} has a later timestamp than its successor {}",
            pair[0].id,
            pair[1].id
        );
    }
}

/// Validate that unread counters never exceed the number of user messages
pub fn assert_unread_bounds(conversation: &Conversation, user_messages: u64) {
    let UnreadCounters { farmer, buyer } = conversation.unread;
    debug_assert!(
        u64::from(farmer) <= user_messages && u64::from(buyer) <= user_messages,
        "Conversation {} unread counters {}/{} exceed {} user messages",
        conversation.id,
        farmer,
        buyer,
        user_messages
    );
}
