//! Cache key conventions
//!
//! Keys are `"<resource>:<scope>"`, e.g. `"profile:<user-id>"`. Resources
//! without a scope use the bare name, e.g. `"lookup-tables"`.

use std::fmt::Display;

use regex::Regex;

pub const PROFILE: &str = "profile";
pub const USER_CAMPAIGNS: &str = "user-campaigns";
pub const CAMPAIGN_MEMBERS: &str = "campaign-members";
pub const INVITATIONS: &str = "invitations";
pub const LOOKUP_TABLES: &str = "lookup-tables";

/// Builds `"<resource>:<scope>"`.
pub fn scoped(resource: &str, scope: impl Display) -> String {
    format!("{resource}:{scope}")
}

/// Regex matching every scoped key of `resource`.
pub fn family_pattern(resource: &str) -> Regex {
    Regex::new(&format!("^{}:", regex::escape(resource)))
        .expect("escaped resource name is a valid pattern")
}
