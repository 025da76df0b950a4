use anyhow::{bail, ensure, Result};
use coraza_waf_controller_k8s_api::engine::{DriverConfig, EngineSpec, IstioIntegrationMode, WasmConfig};
use coraza_waf_controller_k8s_api::ruleset::{RuleSourceRef, MAX_RULE_SOURCES};

const OCI_SCHEME: &str = "oci://";

const MIN_POLL_INTERVAL_SECONDS: i32 = 1;
const MAX_POLL_INTERVAL_SECONDS: i32 = 3600;

pub(crate) fn validate_rule_sources(rules: &[RuleSourceRef]) -> Result<()> {
    ensure!(!rules.is_empty(), "at least one rule source is required");
    ensure!(
        rules.len() <= MAX_RULE_SOURCES,
        "at most {} rule sources are supported",
        MAX_RULE_SOURCES
    );

    for source in rules {
        if source.kind != "ConfigMap" || source.api_version != "v1" {
            bail!(
                "only core/v1 ConfigMap kind is supported for rule sources, found {}/{}",
                source.api_version,
                source.kind
            );
        }
        ensure!(!source.name.is_empty(), "rule source name must not be empty");
        if let Some(namespace) = source.namespace.as_deref() {
            ensure!(
                namespace.is_empty(),
                "cannot reference another namespace: {}",
                namespace
            );
        }
    }

    Ok(())
}

pub(crate) fn validate_engine(spec: &EngineSpec) -> Result<()> {
    ensure!(!spec.rule_set.name.is_empty(), "ruleSet name must not be empty");
    if let Some(namespace) = spec.rule_set.namespace.as_deref() {
        ensure!(
            namespace.is_empty(),
            "cannot reference another namespace: {}",
            namespace
        );
    }

    let wasm = validate_driver(&spec.driver)?;
    validate_wasm(wasm)
}

// The driver is a tagged sum; cardinality is rejected here rather than at
// dispatch time.
fn validate_driver(driver: &DriverConfig) -> Result<&WasmConfig> {
    let populated = driver.populated_variants();
    ensure!(populated != 0, "a driver variant must be configured");
    ensure!(
        populated == 1,
        "exactly one driver variant may be configured, found {}",
        populated
    );

    let Some(istio) = &driver.istio else {
        bail!("a driver variant must be configured");
    };
    let Some(wasm) = &istio.wasm else {
        bail!("the istio driver requires wasm integration configuration");
    };
    Ok(wasm)
}

fn validate_wasm(wasm: &WasmConfig) -> Result<()> {
    ensure!(
        wasm.image.starts_with(OCI_SCHEME),
        "image must be an {}... reference",
        OCI_SCHEME
    );

    if wasm.mode == IstioIntegrationMode::Gateway {
        ensure!(
            wasm.workload_selector.is_some(),
            "workloadSelector is required in gateway mode"
        );
    }

    if let Some(cache_server) = &wasm.rule_set_cache_server {
        ensure!(
            (MIN_POLL_INTERVAL_SECONDS..=MAX_POLL_INTERVAL_SECONDS)
                .contains(&cache_server.poll_interval_seconds),
            "pollIntervalSeconds must be within [{}, {}]",
            MIN_POLL_INTERVAL_SECONDS,
            MAX_POLL_INTERVAL_SECONDS
        );
    }

    Ok(())
}
