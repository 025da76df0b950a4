use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Fewest rule sources a RuleSet may reference.
pub const MIN_RULE_SOURCES: usize = 1;

/// Most rule sources a RuleSet may reference.
pub const MAX_RULE_SOURCES: usize = 2048;

/// A named, ordered aggregation of rule sources. The concatenated text of the
/// sources is the WAF policy served under the RuleSet's `namespace/name` key.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "waf.k8s.coraza.io",
    version = "v1alpha1",
    kind = "RuleSet",
    namespaced,
    status = "RuleSetStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetSpec {
    /// Ordered references to the objects carrying firewall rule text.
    ///
    /// Only core/v1 ConfigMaps in the RuleSet's own namespace are supported.
    pub rules: Vec<RuleSourceRef>,
}

/// Reference to a single rule source object.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSourceRef {
    pub api_version: String,

    pub kind: String,

    pub name: String,

    /// Cross-namespace references are rejected by admission; the field exists
    /// so that a populated value can be named in the rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetStatus {
    /// Current state of the RuleSet, keyed by condition type. `Ready` means
    /// the aggregated rules have been cached; `Progressing` and `Degraded`
    /// report reconciliation in flight and failures respectively.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}
