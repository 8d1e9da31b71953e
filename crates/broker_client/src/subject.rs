//! NATS subject checks for relay channels.
//!
//! Relay channels are URL paths used verbatim. NATS gives `.` a meaning
//! (token separator) and treats `*` and `>` tokens as wildcards, so a channel
//! is only usable on NATS when it reads as a literal subject:
//! - no empty tokens (leading, trailing or doubled `.`)
//! - no `*` or `>` token
//! - no whitespace

/// Validate that a channel is a literal NATS subject.
/// Returns an error message if invalid, None if valid.
pub fn validate_literal_subject(channel: &str) -> Option<String> {
    if channel.is_empty() {
        return Some("Empty subject".to_string());
    }

    if channel.chars().any(char::is_whitespace) {
        return Some("Whitespace in subject".to_string());
    }

    for token in channel.split('.') {
        if token.is_empty() {
            return Some("Empty token in subject".to_string());
        }
        if token == "*" || token == ">" {
            return Some(format!("Wildcard token '{}' in subject", token));
        }
    }

    None
}
