/// Rendered when neither the account nor the guest list has a name.
pub const UNKNOWN_NAME: &str = "Unknown";

/// Display name fallback: account name, then imported guest-list name,
/// then [`UNKNOWN_NAME`]. Blank values count as missing.
pub fn resolve_display_name(user_full_name: Option<&str>, guest_name: Option<&str>) -> String {
    [user_full_name, guest_name]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|name| !name.is_empty())
        .unwrap_or(UNKNOWN_NAME)
        .to_string()
}
