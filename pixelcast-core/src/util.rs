//! Utility bits, used throughout the crate.

/// Extract a printable message from a caught panic payload.
#[must_use]
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_owned()
    }
}

/// Case-insensitive name comparison, as used for resource and marker names.
#[must_use]
pub fn names_match(a: &str, b: &str) -> bool {
    // Fast path for the common ascii case, avoiding allocation.
    if a.is_ascii() && b.is_ascii() {
        a.eq_ignore_ascii_case(b)
    } else {
        a.to_lowercase() == b.to_lowercase()
    }
}

/// Format a byte count for logging.
#[must_use]
pub fn bytes(count: usize) -> String {
    // Lossy above 2^53 bytes, which we won't be seeing.
    #[allow(clippy::cast_precision_loss)]
    human_bytes::human_bytes(count as f64)
}
