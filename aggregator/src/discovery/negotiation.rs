//! `Accept` header negotiation between legacy and aggregated discovery.
//!
//! Aggregated discovery is requested with media type parameters, e.g.
//! `application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList`.
//! Media ranges are tried by descending `q`, then in header order.

use super::types::{AGGREGATED_GROUP, AGGREGATED_LIST_KIND};
use http::HeaderMap;
use http::header::ACCEPT;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregatedVersion {
    V2,
    V2Beta1,
}

impl AggregatedVersion {
    pub fn api_version(&self) -> &'static str {
        match self {
            AggregatedVersion::V2 => "apidiscovery.k8s.io/v2",
            AggregatedVersion::V2Beta1 => "apidiscovery.k8s.io/v2beta1",
        }
    }

    fn version(&self) -> &'static str {
        match self {
            AggregatedVersion::V2 => "v2",
            AggregatedVersion::V2Beta1 => "v2beta1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryFormat {
    Legacy,
    Aggregated(AggregatedVersion),
}

impl DiscoveryFormat {
    pub fn content_type(&self) -> String {
        match self {
            DiscoveryFormat::Legacy => "application/json".to_string(),
            DiscoveryFormat::Aggregated(v) => format!(
                "application/json;g={AGGREGATED_GROUP};v={};as={AGGREGATED_LIST_KIND}",
                v.version()
            ),
        }
    }
}

/// Accept header value asking a backend for aggregated discovery, with legacy
/// JSON as fallback.
pub fn aggregated_accept_header() -> String {
    format!(
        "{},{},application/json",
        DiscoveryFormat::Aggregated(AggregatedVersion::V2).content_type(),
        DiscoveryFormat::Aggregated(AggregatedVersion::V2Beta1).content_type(),
    )
}

struct MediaRange<'a> {
    essence: &'a str,
    group: Option<&'a str>,
    version: Option<&'a str>,
    kind: Option<&'a str>,
    q: f32,
}

fn parse_media_range(raw: &str) -> MediaRange<'_> {
    let mut parts = raw.split(';').map(str::trim);
    let mut range = MediaRange {
        essence: parts.next().unwrap_or(""),
        group: None,
        version: None,
        kind: None,
        q: 1.0,
    };
    for param in parts {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"');
        match key.trim() {
            "g" => range.group = Some(value),
            "v" => range.version = Some(value),
            "as" => range.kind = Some(value),
            "q" => range.q = value.parse().unwrap_or(0.0),
            _ => {}
        }
    }
    range
}

fn format_for(range: &MediaRange<'_>) -> Option<DiscoveryFormat> {
    if !matches!(range.essence, "application/json" | "application/*" | "*/*") {
        return None;
    }
    match (range.group, range.version, range.kind) {
        (None, None, None) => Some(DiscoveryFormat::Legacy),
        (Some(AGGREGATED_GROUP), Some(version), Some(AGGREGATED_LIST_KIND)) => match version {
            "v2" => Some(DiscoveryFormat::Aggregated(AggregatedVersion::V2)),
            "v2beta1" => Some(DiscoveryFormat::Aggregated(AggregatedVersion::V2Beta1)),
            _ => None,
        },
        _ => None,
    }
}

/// Discovery format described by a response's content type.
pub fn format_of_content_type(content_type: &str) -> Option<DiscoveryFormat> {
    format_for(&parse_media_range(content_type))
}

pub fn negotiate(headers: &HeaderMap) -> DiscoveryFormat {
    let mut ranges: Vec<MediaRange<'_>> = headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(parse_media_range)
        .filter(|r| r.q > 0.0)
        .collect();

    // Stable sort keeps header order among equal weights.
    ranges.sort_by(|a, b| b.q.total_cmp(&a.q));

    ranges
        .iter()
        .find_map(format_for)
        .unwrap_or(DiscoveryFormat::Legacy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn negotiate_str(accept: &str) -> DiscoveryFormat {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_str(accept).unwrap());
        negotiate(&headers)
    }

    #[test]
    fn test_negotiation() {
        assert_eq!(negotiate(&HeaderMap::new()), DiscoveryFormat::Legacy);
        assert_eq!(negotiate_str("application/json"), DiscoveryFormat::Legacy);
        assert_eq!(
            negotiate_str("application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList"),
            DiscoveryFormat::Aggregated(AggregatedVersion::V2)
        );
        assert_eq!(
            negotiate_str(
                "application/json;g=apidiscovery.k8s.io;v=v2beta1;as=APIGroupDiscoveryList,application/json"
            ),
            DiscoveryFormat::Aggregated(AggregatedVersion::V2Beta1)
        );
        // Unknown aggregated version falls through to the next range
        assert_eq!(
            negotiate_str(
                "application/json;g=apidiscovery.k8s.io;v=v9;as=APIGroupDiscoveryList,application/json"
            ),
            DiscoveryFormat::Legacy
        );
        // q values reorder preferences
        assert_eq!(
            negotiate_str(
                "application/json;q=0.5,application/json;g=apidiscovery.k8s.io;v=v2;as=APIGroupDiscoveryList"
            ),
            DiscoveryFormat::Aggregated(AggregatedVersion::V2)
        );
        assert_eq!(
            negotiate_str("application/vnd.kubernetes.protobuf"),
            DiscoveryFormat::Legacy
        );
    }

    #[test]
    fn test_content_type_roundtrip() {
        let format = DiscoveryFormat::Aggregated(AggregatedVersion::V2);
        assert_eq!(format_of_content_type(&format.content_type()), Some(format));
        assert!(aggregated_accept_header().starts_with(&format.content_type()));
    }
}
