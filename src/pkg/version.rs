// Purpose: Version ordering used by maximum-version-wins selection and tag picking.
// Inputs/Outputs: Loose version strings in, semver ordering / selected labels out.
// Invariants: Ordering is total over parseable versions; unparseable input is an error, never "equal".
// Gotchas: KCL packages often write `v0.4.0` or `1.28`; both must order like full semver.

use semver::Version;

use crate::error::{PkgError, Result};

/// Parse `v1.2.3`, `1.2`, `1` and full semver (pre-release/build included).
pub fn parse_version_loose(raw: &str) -> Option<Version> {
    let t = raw.trim();
    let t = t.strip_prefix('v').unwrap_or(t);
    if t.is_empty() {
        return None;
    }
    if let Ok(v) = Version::parse(t) {
        return Some(v);
    }
    // Pad missing minor/patch, keeping any pre-release or build suffix.
    let split = t.find(['-', '+']).unwrap_or(t.len());
    let (core, suffix) = t.split_at(split);
    let parts = core.split('.').count();
    let numeric = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    if parts >= 3 || !core.split('.').all(numeric) {
        return None;
    }
    let padded = format!("{}{}{}", core, ".0".repeat(3 - parts), suffix);
    Version::parse(&padded).ok()
}

/// `left < right` under semver ordering.
pub fn version_less_than(left: &str, right: &str) -> Result<bool> {
    match (parse_version_loose(left), parse_version_loose(right)) {
        (Some(l), Some(r)) => Ok(l < r),
        _ => Err(PkgError::VersionComparisonFailure {
            left: left.to_string(),
            right: right.to_string(),
        }),
    }
}

/// Greatest semver label, ignoring labels that are not versions.
pub fn select_latest<'a, I>(labels: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut best: Option<(Version, &str)> = None;
    for label in labels {
        if let Some(ver) = parse_version_loose(label) {
            match &best {
                Some((bver, _)) if ver <= *bver => {}
                _ => best = Some((ver, label)),
            }
        }
    }
    best.map(|(_, s)| s.to_string())
}
