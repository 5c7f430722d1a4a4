//! Outbound SMS formatting under the carrier compliance contract.
//!
//! Layout on first contact:
//!
//! ```text
//! [Tag]
//! body
//!
//! via Unveil
//! Reply STOP to opt out.
//! ```
//!
//! Repeat contacts get only the header and body. The kill switch drops the
//! brand and STOP lines but keeps the header; full fallback sends the raw
//! body. Both immediate and scheduled sends go through [`compose`], so the
//! same inputs always produce the same bytes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use unveil_types::Guest;

use crate::tag::validate_event_tag;

pub const BRAND_LINE: &str = "via Unveil";
pub const STOP_LINE: &str = "Reply STOP to opt out.";

/// Process-wide compliance switches, passed explicitly into [`compose`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceConfig {
    /// Suppress brand and STOP lines, keep the `[Tag]` header.
    pub kill_switch: bool,
    /// Send the raw body with no header or footer. Ops/debug only.
    /// Takes precedence over `kill_switch` when both are set.
    pub full_fallback: bool,
}

/// The part of a recipient's history the composer looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContactHistory {
    pub first_contact_at: Option<DateTime<Utc>>,
}

impl ContactHistory {
    pub fn is_first_contact(&self) -> bool {
        self.first_contact_at.is_none()
    }
}

impl From<&Guest> for ContactHistory {
    fn from(guest: &Guest) -> Self {
        Self {
            first_contact_at: guest.first_contact_at,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Included {
    pub header: bool,
    pub brand: bool,
    pub stop: bool,
}

/// Why the output deviates from the normal layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComposeReason {
    KillSwitch,
    FullFallback,
    MalformedEventTag,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedSms {
    pub text: String,
    pub included: Included,
    pub reason: Option<ComposeReason>,
    /// The footer went out with this text; once the provider accepts it the
    /// caller must persist the recipient's first-contact timestamp.
    pub marks_first_contact: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceViolation {
    MissingHeader,
    UnexpectedHeader,
    MissingFooter,
    UnexpectedFooter,
    BrandWithoutStop,
}

pub fn compose(
    event_tag: &str,
    contact: &ContactHistory,
    body: &str,
    config: &ComplianceConfig,
) -> ComposedSms {
    if config.full_fallback {
        return raw_body(body, ComposeReason::FullFallback);
    }

    let Ok(tag) = validate_event_tag(event_tag) else {
        return raw_body(body, ComposeReason::MalformedEventTag);
    };

    let mut text = format!("[{tag}]\n{body}");

    if config.kill_switch {
        return ComposedSms {
            text,
            included: Included {
                header: true,
                ..Included::default()
            },
            reason: Some(ComposeReason::KillSwitch),
            marks_first_contact: false,
        };
    }

    let first_contact = contact.is_first_contact();
    if first_contact {
        text.push_str("\n\n");
        text.push_str(BRAND_LINE);
        text.push('\n');
        text.push_str(STOP_LINE);
    }

    ComposedSms {
        text,
        included: Included {
            header: true,
            brand: first_contact,
            stop: first_contact,
        },
        reason: None,
        marks_first_contact: first_contact,
    }
}

fn raw_body(body: &str, reason: ComposeReason) -> ComposedSms {
    ComposedSms {
        text: body.to_string(),
        included: Included::default(),
        reason: Some(reason),
        marks_first_contact: false,
    }
}

impl ComposedSms {
    /// Check the output against the compliance contract for the config it
    /// was composed under. Empty means compliant.
    pub fn verify(&self, config: &ComplianceConfig, had_prior_contact: bool) -> Vec<ComplianceViolation> {
        let mut violations = Vec::new();

        if self.included.brand && !self.included.stop {
            violations.push(ComplianceViolation::BrandWithoutStop);
        }

        let header_expected = !config.full_fallback && self.reason != Some(ComposeReason::MalformedEventTag);
        if header_expected && !self.included.header {
            violations.push(ComplianceViolation::MissingHeader);
        }
        if !header_expected && self.included.header {
            violations.push(ComplianceViolation::UnexpectedHeader);
        }

        let footer_expected = header_expected && !config.kill_switch && !had_prior_contact;
        if footer_expected && !self.included.stop {
            violations.push(ComplianceViolation::MissingFooter);
        }
        if !footer_expected && (self.included.stop || self.included.brand) {
            violations.push(ComplianceViolation::UnexpectedFooter);
        }

        violations
    }
}
