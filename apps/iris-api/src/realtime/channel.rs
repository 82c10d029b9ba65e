//! Broker channel naming.

/// Glob matching every per-recipient event channel.
pub const USER_CHANNEL_PATTERN: &str = "user:*:events";

/// The event channel for one recipient.
///
/// The prefix and suffix are fixed, so distinct ids always yield distinct
/// names.
pub fn user_channel(recipient_id: &str) -> String {
    format!("user:{recipient_id}:events")
}
