//! Wire shapes of discovery documents.
//!
//! Legacy discovery is split across `ApiGroupList` (`/apis`), `ApiGroup`
//! (`/apis/<group>`) and `ApiResourceList` (`/apis/<group>/<version>`).
//! Aggregated discovery returns everything in one `ApiGroupDiscoveryList`.

use crate::types::GroupVersion;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const AGGREGATED_GROUP: &str = "apidiscovery.k8s.io";
pub const AGGREGATED_LIST_KIND: &str = "APIGroupDiscoveryList";

fn is_false(b: &bool) -> bool {
    !*b
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResource {
    pub name: String,
    #[serde(default)]
    pub singular_name: String,
    #[serde(default)]
    pub namespaced: bool,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceList {
    #[serde(default = "resource_list_kind")]
    pub kind: String,
    #[serde(default = "v1")]
    pub api_version: String,
    pub group_version: String,
    #[serde(default)]
    pub resources: Vec<ApiResource>,
}

fn resource_list_kind() -> String {
    "APIResourceList".to_string()
}

fn v1() -> String {
    "v1".to_string()
}

impl ApiResourceList {
    pub fn new(gv: &GroupVersion, resources: Vec<ApiResource>) -> Self {
        ApiResourceList {
            kind: resource_list_kind(),
            api_version: v1(),
            group_version: gv.as_path_segment(),
            resources,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionForDiscovery {
    pub group_version: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroup {
    pub kind: String,
    pub api_version: String,
    pub name: String,
    pub versions: Vec<GroupVersionForDiscovery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_version: Option<GroupVersionForDiscovery>,
}

impl ApiGroup {
    /// Group listing `versions` in preference order; the first one is preferred.
    pub fn new(name: &str, versions: Vec<String>) -> Self {
        let versions: Vec<GroupVersionForDiscovery> = versions
            .into_iter()
            .map(|version| GroupVersionForDiscovery {
                group_version: GroupVersion::new(name, &version).as_path_segment(),
                version,
            })
            .collect();
        ApiGroup {
            kind: "APIGroup".to_string(),
            api_version: v1(),
            name: name.to_string(),
            preferred_version: versions.first().cloned(),
            versions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroupList {
    pub kind: String,
    pub api_version: String,
    pub groups: Vec<ApiGroup>,
}

impl ApiGroupList {
    pub fn new(groups: Vec<ApiGroup>) -> Self {
        ApiGroupList {
            kind: "APIGroupList".to_string(),
            api_version: v1(),
            groups,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Freshness {
    #[default]
    Current,
    Stale,
}

fn is_current(f: &Freshness) -> bool {
    *f == Freshness::Current
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceScope {
    #[default]
    Namespaced,
    Cluster,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSubresourceDiscovery {
    pub subresource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_kind: Option<GroupVersionKind>,
    #[serde(default)]
    pub verbs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceDiscovery {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_kind: Option<GroupVersionKind>,
    #[serde(default)]
    pub scope: ResourceScope,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub singular_resource: String,
    #[serde(default)]
    pub verbs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub short_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subresources: Vec<ApiSubresourceDiscovery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiVersionDiscovery {
    pub version: String,
    #[serde(default)]
    pub resources: Vec<ApiResourceDiscovery>,
    #[serde(default, skip_serializing_if = "is_current")]
    pub freshness: Freshness,
}

impl ApiVersionDiscovery {
    /// Placeholder published when a backend cannot be reached.
    pub fn stale(version: &str) -> Self {
        ApiVersionDiscovery {
            version: version.to_string(),
            resources: Vec::new(),
            freshness: Freshness::Stale,
        }
    }

    /// Entry for a group version its backend answered for but did not list.
    pub fn empty(version: &str) -> Self {
        ApiVersionDiscovery {
            version: version.to_string(),
            resources: Vec::new(),
            freshness: Freshness::Current,
        }
    }

    /// Converts a legacy resource list. Entries named `resource/sub` become
    /// subresources of `resource`.
    pub fn from_resource_list(gv: &GroupVersion, list: &ApiResourceList) -> Self {
        let kind_of = |kind: &str| {
            (!kind.is_empty()).then(|| GroupVersionKind {
                group: gv.group.clone(),
                version: gv.version.clone(),
                kind: kind.to_string(),
            })
        };

        let mut resources: Vec<ApiResourceDiscovery> = list
            .resources
            .iter()
            .filter(|r| !r.name.contains('/'))
            .map(|r| ApiResourceDiscovery {
                resource: r.name.clone(),
                response_kind: kind_of(&r.kind),
                scope: if r.namespaced {
                    ResourceScope::Namespaced
                } else {
                    ResourceScope::Cluster
                },
                singular_resource: r.singular_name.clone(),
                verbs: r.verbs.clone(),
                short_names: r.short_names.clone(),
                categories: r.categories.clone(),
                subresources: Vec::new(),
            })
            .collect();

        for r in list.resources.iter() {
            let Some((parent, sub)) = r.name.split_once('/') else {
                continue;
            };
            if let Some(owner) = resources.iter_mut().find(|o| o.resource == parent) {
                owner.subresources.push(ApiSubresourceDiscovery {
                    subresource: sub.to_string(),
                    response_kind: kind_of(&r.kind),
                    verbs: r.verbs.clone(),
                });
            }
        }

        ApiVersionDiscovery {
            version: gv.version.clone(),
            resources,
            freshness: Freshness::Current,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiGroupDiscovery {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub versions: Vec<ApiVersionDiscovery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiGroupDiscoveryList {
    pub kind: String,
    pub api_version: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub items: Vec<ApiGroupDiscovery>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
}

impl ApiGroupDiscoveryList {
    pub fn new(api_version: &str, items: Vec<ApiGroupDiscovery>) -> Self {
        ApiGroupDiscoveryList {
            kind: AGGREGATED_LIST_KIND.to_string(),
            api_version: api_version.to_string(),
            metadata: ObjectMeta::default(),
            items,
            partial: false,
        }
    }

    /// Flattens the document into one entry per group version.
    pub fn into_version_map(self) -> HashMap<GroupVersion, ApiVersionDiscovery> {
        self.items
            .into_iter()
            .flat_map(|group| {
                let name = group.metadata.name;
                group
                    .versions
                    .into_iter()
                    .map(move |v| (GroupVersion::new(name.clone(), v.version.clone()), v))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_list_conversion() {
        let list: ApiResourceList = serde_json::from_value(json!({
            "groupVersion": "foo.io/v1",
            "resources": [
                {"name": "widgets", "singularName": "widget", "namespaced": true, "kind": "Widget", "verbs": ["get", "list"]},
                {"name": "widgets/status", "namespaced": true, "kind": "Widget", "verbs": ["get", "patch"]},
                {"name": "gadgets", "namespaced": false, "kind": "Gadget", "verbs": ["get"], "shortNames": ["gd"]}
            ]
        }))
        .unwrap();
        let gv = GroupVersion::new("foo.io", "v1");
        let version = ApiVersionDiscovery::from_resource_list(&gv, &list);

        assert_eq!(version.version, "v1");
        assert_eq!(version.resources.len(), 2);
        let widgets = &version.resources[0];
        assert_eq!(widgets.scope, ResourceScope::Namespaced);
        assert_eq!(widgets.subresources.len(), 1);
        assert_eq!(widgets.subresources[0].subresource, "status");
        assert_eq!(version.resources[1].scope, ResourceScope::Cluster);
        assert_eq!(version.resources[1].short_names, vec!["gd"]);
    }

    #[test]
    fn test_stale_entry_serialization() {
        let value = serde_json::to_value(ApiVersionDiscovery::stale("v1")).unwrap();
        assert_eq!(value, json!({"version": "v1", "resources": [], "freshness": "Stale"}));

        let current: ApiVersionDiscovery =
            serde_json::from_value(json!({"version": "v2", "resources": []})).unwrap();
        assert_eq!(current.freshness, Freshness::Current);
    }

    #[test]
    fn test_group_preferred_version() {
        let group = ApiGroup::new("foo.io", vec!["v2".to_string(), "v1".to_string()]);
        assert_eq!(group.preferred_version.unwrap().group_version, "foo.io/v2");
        assert_eq!(group.versions[1].group_version, "foo.io/v1");
    }
}
