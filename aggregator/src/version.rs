//! Kube-like version ordering.
//!
//! Versions of the form `v<major>[(alpha|beta)<minor>]` sort GA first, then beta,
//! then alpha; within a level higher majors win, then higher minors. Anything
//! else sorts after every conforming version, in lexicographic order.
//!
//! ```text
//! v10 > v2 > v1 > v11beta2 > v10beta3 > v3beta1 > v12alpha1 > v11alpha2 > foo1 > foo10
//! ```

use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Level {
    Alpha,
    Beta,
    Ga,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct KubeVersion {
    major: u64,
    level: Level,
    minor: u64,
}

fn parse_kube_version(v: &str) -> Option<KubeVersion> {
    let rest = v.strip_prefix('v')?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let (major_str, suffix) = rest.split_at(digits_end);
    if major_str.is_empty() {
        return None;
    }
    let major = major_str.parse().ok()?;

    if suffix.is_empty() {
        return Some(KubeVersion {
            major,
            level: Level::Ga,
            minor: 0,
        });
    }

    let (level, minor_str) = if let Some(m) = suffix.strip_prefix("alpha") {
        (Level::Alpha, m)
    } else if let Some(m) = suffix.strip_prefix("beta") {
        (Level::Beta, m)
    } else {
        return None;
    };

    if minor_str.is_empty() || !minor_str.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    Some(KubeVersion {
        major,
        level,
        minor: minor_str.parse().ok()?,
    })
}

/// Compares two version strings with the kube-like rule. `Ordering::Greater`
/// means `a` is preferred over `b`.
pub fn compare_kube_versions(a: &str, b: &str) -> Ordering {
    match (parse_kube_version(a), parse_kube_version(b)) {
        (Some(va), Some(vb)) => va
            .level
            .cmp(&vb.level)
            .then(va.major.cmp(&vb.major))
            .then(va.minor.cmp(&vb.minor)),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        // Non-conforming strings: lexicographically smaller is preferred
        (None, None) => b.cmp(a),
    }
}

/// Orders group priorities descending, ties broken by group name ascending.
pub fn compare_groups(a_priority: i32, a_name: &str, b_priority: i32, b_name: &str) -> Ordering {
    b_priority
        .cmp(&a_priority)
        .then_with(|| a_name.cmp(b_name))
}

/// Orders versions inside one group: higher version priority first, then the
/// kube-like comparator (preferred first).
pub fn compare_versions(
    a_priority: i32,
    a_version: &str,
    b_priority: i32,
    b_version: &str,
) -> Ordering {
    b_priority
        .cmp(&a_priority)
        .then_with(|| compare_kube_versions(b_version, a_version))
}
