use uuid::Uuid;

/// The recipient set could not be computed. Always fatal to the send attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolutionError {
    #[error("recipient filter selects nothing: supply guest ids, all guests, tags or RSVP statuses")]
    EmptyFilter,

    #[error("{} guest id(s) are unknown or removed from this event", ids.len())]
    InvalidGuestIds { ids: Vec<Uuid> },

    #[error("no eligible recipients after applying opt-outs and RSVP rules")]
    NoEligibleRecipients,
}

/// The SMS could not be composed with its compliance header.
/// Composition falls back to the raw body instead of failing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompositionError {
    #[error("malformed event tag {tag:?}: {problem}")]
    MalformedEventTag { tag: String, problem: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("access denied: {reason}")]
pub struct AccessDenied {
    pub reason: &'static str,
}
