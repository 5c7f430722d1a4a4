use unveil_types::Event;

use crate::error::CompositionError;

/// Carriers truncate long sender prefixes; keep the header short.
pub const MAX_EVENT_TAG_LEN: usize = 14;

/// Tag used when a title has nothing usable in it.
const FALLBACK_TAG: &str = "Event";

/// Validate a tag for use inside `[...]` and return it trimmed.
pub fn validate_event_tag(tag: &str) -> Result<&str, CompositionError> {
    let trimmed = tag.trim();
    let problem = if trimmed.is_empty() {
        Some("empty")
    } else if trimmed.chars().count() > MAX_EVENT_TAG_LEN {
        Some("too long")
    } else if trimmed.chars().any(|c| c == '[' || c == ']') {
        Some("contains brackets")
    } else if trimmed.chars().any(char::is_control) {
        Some("contains control characters")
    } else {
        None
    };

    match problem {
        Some(problem) => Err(CompositionError::MalformedEventTag {
            tag: tag.to_string(),
            problem,
        }),
        None => Ok(trimmed),
    }
}

/// Build a tag from an event title: letters, digits and single spaces,
/// cut to [`MAX_EVENT_TAG_LEN`].
pub fn derive_event_tag(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let truncated: String = collapsed.chars().take(MAX_EVENT_TAG_LEN).collect();
    let tag = truncated.trim_end();

    if tag.is_empty() {
        FALLBACK_TAG.to_string()
    } else {
        tag.to_string()
    }
}

/// The tag an event's SMS header uses. An explicitly configured tag wins,
/// even if malformed, so that misconfiguration surfaces as a composition
/// error instead of being papered over.
pub fn event_tag_for(event: &Event) -> String {
    match event.sms_tag.as_deref().map(str::trim) {
        Some(tag) if !tag.is_empty() => tag.to_string(),
        _ => derive_event_tag(&event.title),
    }
}
