use std::sync::Arc;

use coraza_waf_controller_k8s_api::{
    engine::WasmConfig, Condition, Engine, EngineStatus, ObjectReference,
};
use futures::{future, prelude::*};
use kube::{
    api::{Api, DeleteParams, DynamicObject, Patch, PatchParams},
    core::{ApiResource, GroupVersionKind},
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        finalizer::{finalizer, Error as FinalizerError, Event as Finalizer},
        predicates, reflector, watcher, WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{conditions, ResourceId, RetryBackoff};

/// Prefix of every WasmPlugin created for an Engine.
pub const WASM_PLUGIN_NAME_PREFIX: &str = "coraza-engine-";

/// Field manager identifier used for server-side apply of downstream
/// resources. Ownership is forced so the apply path needs no
/// read-modify-write retries.
const FIELD_MANAGER: &str = "coraza-waf-controller";

const CONTROLLER_NAME: &str = "engine-controller";
const FINALIZER: &str = "waf.k8s.coraza.io/engine-cleanup";

const WASM_PLUGIN_GROUP: &str = "extensions.istio.io";
const WASM_PLUGIN_VERSION: &str = "v1alpha1";
const WASM_PLUGIN_KIND: &str = "WasmPlugin";

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid driver configuration: only the Istio driver with wasm integration is currently supported")]
    InvalidDriver,

    #[error("engine is missing object metadata required for ownership")]
    MissingMetadata,

    #[error("failed to apply WasmPlugin: {0}")]
    Apply(#[source] kube::Error),

    #[error("failed to delete WasmPlugin: {0}")]
    Delete(#[source] kube::Error),

    #[error("failed to patch status: {0}")]
    StatusPatch(#[source] kube::Error),
}

fn wasm_plugin_resource() -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(
        WASM_PLUGIN_GROUP,
        WASM_PLUGIN_VERSION,
        WASM_PLUGIN_KIND,
    ))
}

/// Validates an Engine's driver configuration and provisions the WasmPlugin
/// that injects the WAF module into the selected workloads.
pub struct EngineController {
    client: Client,
    recorder: Recorder,
    cache_server_cluster: String,
    retries: RetryBackoff,
}

impl EngineController {
    pub fn new(client: Client, cache_server_cluster: String) -> Arc<Self> {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: CONTROLLER_NAME.to_string(),
                instance: None,
            },
        );
        Arc::new(Self {
            client,
            recorder,
            cache_server_cluster,
            retries: RetryBackoff::default(),
        })
    }

    /// Runs the controller until the shutdown drain fires. Engine changes
    /// trigger directly; changes to owned WasmPlugins are mapped back to
    /// their Engine through the owner reference.
    pub async fn run(self: Arc<Self>, drain: drain::Watch) {
        let engines = Api::<Engine>::all(self.client.clone());
        let resource = wasm_plugin_resource();
        let plugins = Api::<DynamicObject>::all_with(self.client.clone(), &resource);

        // Reconcile on generation change only: status-only Engine updates
        // are filtered out. Deletion still triggers, as setting the deletion
        // timestamp increments the generation.
        let (reader, writer) = reflector::store();
        let engines = watcher(engines, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects()
            .predicate_filter(predicates::generation);

        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        let controller = Controller::for_stream(engines, reader)
            .owns_with(plugins, resource, watcher::Config::default())
            .graceful_shutdown_on(close_rx.map(|_| ()))
            .run(reconcile, error_policy, self.clone())
            .for_each(|result| {
                match result {
                    Ok((engine, _)) => {
                        debug!(namespace = ?engine.namespace, name = %engine.name, "reconciled")
                    }
                    Err(error) => debug!(%error, "reconcile failed"),
                }
                future::ready(())
            });
        tokio::pin!(controller);

        tokio::select! {
            _ = &mut controller => {}
            handle = drain.signaled() => {
                let _ = close_tx.send(());
                handle.release_after(controller).await;
            }
        }
    }

    async fn apply(&self, engine: Arc<Engine>) -> Result<Action, Error> {
        let namespace = engine.namespace().unwrap_or_default();
        let name = engine.name_any();
        debug!(%namespace, %name, "starting reconciliation");

        let generation = engine.metadata.generation;
        let reference = engine.object_ref(&());
        let mut conditions = engine
            .status
            .as_ref()
            .map(|status| status.conditions.clone())
            .unwrap_or_default();

        if conditions::find(&conditions, conditions::READY).is_none() {
            conditions::set_progressing(&mut conditions, generation, "Reconciling", "Starting reconciliation");
            self.patch_conditions(&namespace, &name, &conditions).await?;
        }

        // The driver is a tagged sum; exactly one variant is recognized.
        let wasm = match engine.spec.driver.istio.as_ref().and_then(|istio| istio.wasm.as_ref()) {
            Some(wasm) => wasm,
            None => {
                let message = Error::InvalidDriver.to_string();
                self.publish_event(reference, EventType::Warning, "InvalidConfiguration", &message)
                    .await;
                conditions::set_degraded(&mut conditions, generation, "InvalidConfiguration", &message);
                self.patch_conditions(&namespace, &name, &conditions).await?;
                return Err(Error::InvalidDriver);
            }
        };

        let plugin = build_wasm_plugin(&engine, wasm, &self.cache_server_cluster)?;
        let plugin_name = plugin.name_any();
        let plugins =
            Api::<DynamicObject>::namespaced_with(self.client.clone(), &namespace, &wasm_plugin_resource());
        let apply = PatchParams::apply(FIELD_MANAGER).force();
        if let Err(error) = plugins.patch(&plugin_name, &apply, &Patch::Apply(&plugin)).await {
            let message = format!("Failed to create or update WasmPlugin: {error}");
            self.publish_event(reference, EventType::Warning, "ProvisioningFailed", &message)
                .await;
            conditions::set_degraded(&mut conditions, generation, "ProvisioningFailed", &message);
            self.patch_conditions(&namespace, &name, &conditions).await?;
            return Err(Error::Apply(error));
        }
        info!(%namespace, %name, wasm_plugin = %plugin_name, "provisioned WasmPlugin");

        let mut owned = engine
            .status
            .as_ref()
            .map(|status| status.owned_resources.clone())
            .unwrap_or_default();
        record_owned_resource(&mut owned, owned_plugin_reference(&namespace, &plugin_name));
        conditions::set_ready(&mut conditions, generation, "Configured", "WasmPlugin successfully created or updated");
        self.patch_status(
            &namespace,
            &name,
            &EngineStatus {
                conditions,
                owned_resources: owned,
            },
        )
        .await?;

        self.publish_event(
            reference,
            EventType::Normal,
            "WasmPluginCreated",
            &format!("Created WasmPlugin {namespace}/{plugin_name}"),
        )
        .await;

        self.retries.reset(&ResourceId::new(namespace, name));
        Ok(Action::await_change())
    }

    // The API server's garbage collector reaps the WasmPlugin through its
    // owner reference; deleting it here on finalization is defense in depth.
    async fn cleanup(&self, engine: Arc<Engine>) -> Result<Action, Error> {
        let namespace = engine.namespace().unwrap_or_default();
        let name = engine.name_any();
        let plugin_name = format!("{WASM_PLUGIN_NAME_PREFIX}{name}");

        let plugins =
            Api::<DynamicObject>::namespaced_with(self.client.clone(), &namespace, &wasm_plugin_resource());
        match plugins.delete(&plugin_name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(%namespace, %name, wasm_plugin = %plugin_name, "deleted WasmPlugin");
                Ok(Action::await_change())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(Action::await_change()),
            Err(error) => {
                let message = format!("Failed to delete WasmPlugin {namespace}/{plugin_name}: {error}");
                self.publish_event(engine.object_ref(&()), EventType::Warning, "FailedDelete", &message)
                    .await;
                Err(Error::Delete(error))
            }
        }
    }

    async fn patch_conditions(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[Condition],
    ) -> Result<(), Error> {
        let api = Api::<Engine>::namespaced(self.client.clone(), namespace);
        let patch = json!({"status": {"conditions": conditions}});
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::StatusPatch)?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &EngineStatus,
    ) -> Result<(), Error> {
        let api = Api::<Engine>::namespaced(self.client.clone(), namespace);
        let patch = json!({"status": status});
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(Error::StatusPatch)?;
        Ok(())
    }

    async fn publish_event(
        &self,
        reference: ObjectReference,
        type_: EventType,
        reason: &str,
        note: &str,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(error) = self.recorder.publish(&event, &reference).await {
            warn!(%error, %reason, "failed to publish event");
        }
    }
}

async fn reconcile(
    engine: Arc<Engine>,
    ctx: Arc<EngineController>,
) -> Result<Action, FinalizerError<Error>> {
    let namespace = engine.namespace().unwrap_or_default();
    let engines = Api::<Engine>::namespaced(ctx.client.clone(), &namespace);
    finalizer(&engines, FINALIZER, engine, |event| async {
        match event {
            Finalizer::Apply(engine) => ctx.apply(engine).await,
            Finalizer::Cleanup(engine) => ctx.cleanup(engine).await,
        }
    })
    .await
}

fn error_policy(
    engine: Arc<Engine>,
    error: &FinalizerError<Error>,
    ctx: Arc<EngineController>,
) -> Action {
    let namespace = engine.namespace().unwrap_or_default();
    let name = engine.name_any();
    let delay = ctx.retries.next_delay(ResourceId::new(&namespace, &name));
    warn!(%namespace, %name, %error, ?delay, "reconcile failed, backing off");
    Action::requeue(delay)
}

/// Builds the WasmPlugin that loads the engine's WAF module into the selected
/// workloads and points it at the ruleset cache server.
fn build_wasm_plugin(
    engine: &Engine,
    wasm: &WasmConfig,
    cache_server_cluster: &str,
) -> Result<DynamicObject, Error> {
    let namespace = engine.namespace().ok_or(Error::MissingMetadata)?;
    let name = format!("{WASM_PLUGIN_NAME_PREFIX}{}", engine.name_any());
    let owner = engine.controller_owner_ref(&()).ok_or(Error::MissingMetadata)?;

    let ruleset_key = format!("{namespace}/{}", engine.spec.rule_set.name);
    let mut plugin_config = json!({
        "cache_server_instance": ruleset_key,
        "cache_server_cluster": cache_server_cluster,
    });
    if let Some(cache_server) = &wasm.rule_set_cache_server {
        plugin_config["rule_reload_interval_seconds"] = json!(cache_server.poll_interval_seconds);
    }

    let match_labels = wasm
        .workload_selector
        .as_ref()
        .and_then(|selector| selector.match_labels.clone())
        .unwrap_or_default();

    let mut plugin = DynamicObject::new(&name, &wasm_plugin_resource()).within(&namespace);
    plugin.metadata.owner_references = Some(vec![owner]);
    plugin.data = json!({
        "spec": {
            "url": wasm.image,
            "pluginConfig": plugin_config,
            "selector": {
                "matchLabels": match_labels,
            },
        }
    });
    Ok(plugin)
}

fn owned_plugin_reference(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{WASM_PLUGIN_GROUP}/{WASM_PLUGIN_VERSION}")),
        kind: Some(WASM_PLUGIN_KIND.to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Records a downstream resource in `status.ownedResources`, replacing an
/// existing entry of the same apiVersion/kind or appending otherwise.
fn record_owned_resource(owned: &mut Vec<ObjectReference>, reference: ObjectReference) {
    match owned.iter_mut().find(|existing| {
        existing.kind == reference.kind && existing.api_version == reference.api_version
    }) {
        Some(existing) => *existing = reference,
        None => owned.push(reference),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coraza_waf_controller_k8s_api::engine::{
        DriverConfig, EngineSpec, IstioDriver, IstioIntegrationMode, RuleSetCacheServerConfig,
        RuleSetRef,
    };
    use coraza_waf_controller_k8s_api::{LabelSelector, ObjectMeta};

    fn mk_engine(name: &str, wasm: WasmConfig) -> Engine {
        Engine {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("test-ns".to_string()),
                uid: Some("0000-1111".to_string()),
                ..Default::default()
            },
            spec: EngineSpec {
                rule_set: RuleSetRef {
                    name: "default".to_string(),
                    namespace: None,
                },
                driver: DriverConfig {
                    istio: Some(IstioDriver { wasm: Some(wasm) }),
                },
                failure_policy: Default::default(),
            },
            status: None,
        }
    }

    fn mk_wasm(poll_interval: Option<i32>) -> WasmConfig {
        WasmConfig {
            image: "oci://ghcr.io/example/coraza-waf:v1".to_string(),
            workload_selector: Some(LabelSelector {
                match_labels: Some(
                    [("istio".to_string(), "ingress".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            }),
            mode: IstioIntegrationMode::Gateway,
            rule_set_cache_server: poll_interval
                .map(|poll_interval_seconds| RuleSetCacheServerConfig { poll_interval_seconds }),
        }
    }

    #[test]
    fn builds_wasm_plugin_from_engine() {
        let engine = mk_engine("my-waf", mk_wasm(Some(30)));
        let wasm = mk_wasm(Some(30));
        let plugin = build_wasm_plugin(&engine, &wasm, "waf-cache").unwrap();

        assert_eq!(plugin.name_any(), "coraza-engine-my-waf");
        assert_eq!(plugin.metadata.namespace.as_deref(), Some("test-ns"));

        let spec = &plugin.data["spec"];
        assert_eq!(spec["url"], "oci://ghcr.io/example/coraza-waf:v1");
        assert_eq!(spec["selector"]["matchLabels"]["istio"], "ingress");
        assert_eq!(spec["pluginConfig"]["cache_server_instance"], "test-ns/default");
        assert_eq!(spec["pluginConfig"]["cache_server_cluster"], "waf-cache");
        assert_eq!(spec["pluginConfig"]["rule_reload_interval_seconds"], 30);
    }

    #[test]
    fn plugin_config_omits_interval_without_cache_server() {
        let engine = mk_engine("my-waf", mk_wasm(None));
        let wasm = mk_wasm(None);
        let plugin = build_wasm_plugin(&engine, &wasm, "waf-cache").unwrap();

        assert!(plugin.data["spec"]["pluginConfig"]
            .get("rule_reload_interval_seconds")
            .is_none());
    }

    #[test]
    fn plugin_is_owned_by_the_engine() {
        let engine = mk_engine("my-waf", mk_wasm(None));
        let wasm = mk_wasm(None);
        let plugin = build_wasm_plugin(&engine, &wasm, "waf-cache").unwrap();

        let owners = plugin.metadata.owner_references.as_ref().unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Engine");
        assert_eq!(owners[0].name, "my-waf");
        assert_eq!(owners[0].controller, Some(true));
    }

    #[test]
    fn build_fails_without_namespace() {
        let mut engine = mk_engine("my-waf", mk_wasm(None));
        engine.metadata.namespace = None;
        let wasm = mk_wasm(None);
        assert!(matches!(
            build_wasm_plugin(&engine, &wasm, "waf-cache"),
            Err(Error::MissingMetadata)
        ));
    }

    #[test]
    fn owned_resources_replace_same_kind_or_append() {
        let mut owned = vec![owned_plugin_reference("test-ns", "coraza-engine-old")];
        record_owned_resource(&mut owned, owned_plugin_reference("test-ns", "coraza-engine-new"));
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].name.as_deref(), Some("coraza-engine-new"));

        record_owned_resource(
            &mut owned,
            ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some("Service".to_string()),
                name: Some("other".to_string()),
                ..Default::default()
            },
        );
        assert_eq!(owned.len(), 2);
    }
}
