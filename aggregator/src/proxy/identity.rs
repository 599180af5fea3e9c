//! Identity of the requesting user, as forwarded to backends.
//!
//! Whatever authenticated the request upstream of the gateway inserts a
//! [`UserInfo`] into the request extensions. Client supplied identity headers
//! are always dropped so backends only ever see what the gateway vouches for.

use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

pub const REMOTE_USER: &str = "x-remote-user";
pub const REMOTE_GROUP: &str = "x-remote-group";
pub const REMOTE_EXTRA_PREFIX: &str = "x-remote-extra-";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    pub name: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

pub fn apply_identity(headers: &mut HeaderMap, user: Option<&UserInfo>) {
    let spoofed: Vec<HeaderName> = headers
        .keys()
        .filter(|name| {
            let name = name.as_str();
            name == REMOTE_USER || name == REMOTE_GROUP || name.starts_with(REMOTE_EXTRA_PREFIX)
        })
        .cloned()
        .collect();
    for name in spoofed {
        headers.remove(name);
    }

    let Some(user) = user else {
        return;
    };

    if let Ok(value) = HeaderValue::from_str(&user.name) {
        headers.insert(REMOTE_USER, value);
    }
    for group in &user.groups {
        if let Ok(value) = HeaderValue::from_str(group) {
            headers.append(REMOTE_GROUP, value);
        }
    }
    for (key, values) in &user.extra {
        let Ok(name) = HeaderName::from_bytes(
            format!("{REMOTE_EXTRA_PREFIX}{}", key.to_ascii_lowercase()).as_bytes(),
        ) else {
            tracing::debug!(key, "Dropping extra identity key that is not a valid header name");
            continue;
        };
        for value in values {
            if let Ok(value) = HeaderValue::from_str(value) {
                headers.append(name.clone(), value);
            }
        }
    }
}
