/// Formatting helpers shared by logging and the control channel
use time::{format_description, OffsetDateTime};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format.
/// Falls back to the default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]")
        .ok()
        .and_then(|format| dt.format(&format).ok())
        .unwrap_or_else(|| dt.to_string())
}
