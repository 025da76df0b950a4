use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Default data-plane poll interval against the ruleset cache server.
pub const DEFAULT_POLL_INTERVAL_SECONDS: i32 = 15;

/// A single WAF instance: a RuleSet to enforce and a driver describing how
/// the engine is injected into the data plane.
#[derive(Clone, Debug, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "waf.k8s.coraza.io",
    version = "v1alpha1",
    kind = "Engine",
    namespaced,
    status = "EngineStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct EngineSpec {
    /// The RuleSet whose compiled rules this engine loads. Name-only; the
    /// RuleSet must live in the Engine's namespace.
    pub rule_set: RuleSetRef,

    pub driver: DriverConfig,

    /// Behavior when the WAF is not ready or encounters errors: `fail` blocks
    /// traffic, `allow` lets it through.
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

/// Name-only reference to a RuleSet in the same namespace.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetRef {
    pub name: String,

    /// Cross-namespace references are rejected by admission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Tagged sum of data-plane integrations. Exactly one variant must be
/// populated; admission rejects zero or more than one.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DriverConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub istio: Option<IstioDriver>,
}

impl DriverConfig {
    /// Number of populated driver variants.
    pub fn populated_variants(&self) -> usize {
        usize::from(self.istio.is_some())
    }
}

/// Istio-specific driver configuration. Exactly one integration mechanism
/// must be populated within the variant.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IstioDriver {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wasm: Option<WasmConfig>,
}

/// Deploys the engine as a WASM module loaded by Istio proxies.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WasmConfig {
    /// OCI image reference of the WASM plugin. Must use the `oci://` scheme.
    pub image: String,

    /// Selects the workloads the plugin is attached to. Required in
    /// `gateway` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_selector: Option<LabelSelector>,

    pub mode: IstioIntegrationMode,

    /// Dynamic rule loading from the ruleset cache server. When omitted the
    /// engine runs with whatever rules are embedded in the image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rule_set_cache_server: Option<RuleSetCacheServerConfig>,
}

/// Mechanism used to attach the WAF to Istio.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum IstioIntegrationMode {
    /// Attach at the Gateway level.
    #[serde(rename = "gateway")]
    Gateway,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetCacheServerConfig {
    /// How often the data plane polls for rule updates, in seconds. Bounded
    /// to [1, 3600].
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: i32,
}

fn default_poll_interval() -> i32 {
    DEFAULT_POLL_INTERVAL_SECONDS
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum FailurePolicy {
    #[default]
    #[serde(rename = "fail")]
    Fail,

    #[serde(rename = "allow")]
    Allow,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    /// Current state of the Engine, keyed by condition type.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Downstream resources created and managed for this Engine.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub owned_resources: Vec<ObjectReference>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_policy_defaults_to_fail() {
        let spec: EngineSpec = serde_json::from_value(serde_json::json!({
            "ruleSet": {"name": "default"},
            "driver": {"istio": {"wasm": {
                "image": "oci://ghcr.io/example/waf:latest",
                "mode": "gateway",
                "workloadSelector": {"matchLabels": {"istio": "ingress"}},
            }}},
        }))
        .expect("spec must parse");
        assert_eq!(spec.failure_policy, FailurePolicy::Fail);
    }

    #[test]
    fn poll_interval_defaults_when_stanza_present() {
        let config: RuleSetCacheServerConfig =
            serde_json::from_value(serde_json::json!({})).expect("config must parse");
        assert_eq!(config.poll_interval_seconds, DEFAULT_POLL_INTERVAL_SECONDS);
    }
}
