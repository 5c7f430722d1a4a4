//! Recipient resolution over an in-memory roster snapshot.
//!
//! The roster is every guest row of one event, removed guests included.
//! Resolution is a pure function of (roster, selector, channels): the same
//! inputs always produce the same ordered set.

use std::collections::{BTreeSet, HashMap};

use uuid::Uuid;

use unveil_types::{ChannelSet, Guest, RecipientFilter, TargetSelector};

use crate::error::ResolutionError;

pub type RecipientSet = BTreeSet<Uuid>;

/// Pick the single selector a host filter resolves with.
pub fn selector_for(filter: &RecipientFilter) -> Result<TargetSelector, ResolutionError> {
    filter.selector().ok_or(ResolutionError::EmptyFilter)
}

/// Resolve a selector against the roster.
///
/// Explicit guest ids are a hard contract: an unknown or removed id fails
/// the whole resolution, and an explicit list that ends up empty is an
/// error. The implicit selectors (all, tags, RSVP) may return an empty
/// set; see [`require_recipients`].
pub fn resolve(
    roster: &[Guest],
    selector: &TargetSelector,
    channels: ChannelSet,
) -> Result<RecipientSet, ResolutionError> {
    let selected: Vec<&Guest> = match selector {
        TargetSelector::GuestIds { guest_ids } => return resolve_explicit(roster, guest_ids),
        TargetSelector::AllGuests => roster
            .iter()
            .filter(|g| is_default_eligible(g, channels))
            .collect(),
        TargetSelector::Tags { tags, require_all } => {
            let wanted = normalize_tags(tags);
            if wanted.is_empty() {
                return Err(ResolutionError::EmptyFilter);
            }
            roster
                .iter()
                .filter(|g| is_default_eligible(g, channels))
                .filter(|g| matches_tags(g, &wanted, *require_all))
                .collect()
        }
        TargetSelector::RsvpStatuses {
            statuses,
            include_declined,
        } => {
            if statuses.is_empty() {
                return Err(ResolutionError::EmptyFilter);
            }
            roster
                .iter()
                .filter(|g| !g.is_removed() && g.reachable_by(channels))
                .filter(|g| *include_declined || !g.has_declined())
                .filter(|g| statuses.contains(&g.rsvp_status))
                .collect()
        }
    };

    Ok(without_opt_outs(selected))
}

/// Convenience for callers holding the host's raw filter.
pub fn resolve_filter(
    roster: &[Guest],
    filter: &RecipientFilter,
    channels: ChannelSet,
) -> Result<RecipientSet, ResolutionError> {
    resolve(roster, &selector_for(filter)?, channels)
}

/// A send must never silently go to nobody.
pub fn require_recipients(set: RecipientSet) -> Result<RecipientSet, ResolutionError> {
    if set.is_empty() {
        Err(ResolutionError::NoEligibleRecipients)
    } else {
        Ok(set)
    }
}

fn resolve_explicit(roster: &[Guest], guest_ids: &[Uuid]) -> Result<RecipientSet, ResolutionError> {
    if guest_ids.is_empty() {
        return Err(ResolutionError::EmptyFilter);
    }

    let by_id: HashMap<Uuid, &Guest> = roster.iter().map(|g| (g.id, g)).collect();
    let requested: BTreeSet<Uuid> = guest_ids.iter().copied().collect();

    let mut invalid = Vec::new();
    let mut picked = Vec::with_capacity(requested.len());
    for id in requested {
        match by_id.get(&id) {
            Some(guest) if !guest.is_removed() => picked.push(*guest),
            _ => invalid.push(id),
        }
    }

    if !invalid.is_empty() {
        return Err(ResolutionError::InvalidGuestIds { ids: invalid });
    }

    require_recipients(without_opt_outs(picked))
}

/// Default audience rules shared by "all guests" and tag selection.
fn is_default_eligible(guest: &Guest, channels: ChannelSet) -> bool {
    !guest.is_removed() && !guest.has_declined() && !guest.sms_opt_out && guest.reachable_by(channels)
}

fn normalize_tags(tags: &[String]) -> BTreeSet<&str> {
    tags.iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect()
}

fn matches_tags(guest: &Guest, wanted: &BTreeSet<&str>, require_all: bool) -> bool {
    let has = |tag: &&str| guest.tags.iter().any(|t| t.trim() == *tag);
    if require_all {
        wanted.iter().all(has)
    } else {
        wanted.iter().any(has)
    }
}

/// Safety net applied on every path, even when the selector already
/// excluded opt-outs.
fn without_opt_outs(guests: Vec<&Guest>) -> RecipientSet {
    guests
        .into_iter()
        .filter(|g| !g.sms_opt_out)
        .map(|g| g.id)
        .collect()
}
