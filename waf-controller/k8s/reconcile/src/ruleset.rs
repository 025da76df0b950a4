use std::sync::Arc;

use coraza_waf_controller_cache::SharedRuleSetCache;
use coraza_waf_controller_k8s_api::{Condition, ConfigMap, ObjectReference, RuleSet};
use futures::{future, prelude::*};
use kube::{
    api::{Api, Patch, PatchParams},
    runtime::{
        controller::{Action, Controller},
        events::{Event, EventType, Recorder, Reporter},
        predicates, reflector, watcher, WatchStreamExt,
    },
    Client, Resource, ResourceExt,
};
use serde_json::json;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::{conditions, ResourceId, RetryBackoff, SharedReferenceIndex};

/// ConfigMap data key carrying rule text.
const RULES_KEY: &str = "rules";

const CONTROLLER_NAME: &str = "ruleset-controller";
const MISSING_CONFIGMAP_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported rule source kind: {0}")]
    UnsupportedSourceKind(String),

    #[error("ConfigMap {0} missing 'rules' key")]
    MissingRulesKey(String),

    #[error("failed to get ConfigMap {name}: {source}")]
    ConfigMapAccess {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("failed to patch status: {0}")]
    StatusPatch(#[source] kube::Error),
}

/// Keeps the cache entry for each RuleSet in lock-step with its `spec.rules`
/// sources and maintains the RuleSet's status conditions.
pub struct RuleSetController {
    client: Client,
    cache: SharedRuleSetCache,
    references: SharedReferenceIndex,
    recorder: Recorder,
    retries: RetryBackoff,
}

impl RuleSetController {
    pub fn new(
        client: Client,
        cache: SharedRuleSetCache,
        references: SharedReferenceIndex,
    ) -> Arc<Self> {
        let recorder = Recorder::new(
            client.clone(),
            Reporter {
                controller: CONTROLLER_NAME.to_string(),
                instance: None,
            },
        );
        Arc::new(Self {
            client,
            cache,
            references,
            recorder,
            retries: RetryBackoff::default(),
        })
    }

    /// Runs the controller until the shutdown drain fires. RuleSet changes
    /// trigger directly; ConfigMap changes are mapped through the reference
    /// index to the RuleSets in the same namespace that use them.
    pub async fn run(self: Arc<Self>, drain: drain::Watch) {
        let rulesets = Api::<RuleSet>::all(self.client.clone());
        let configmaps = Api::<ConfigMap>::all(self.client.clone());
        let references = self.references.clone();

        // Reconcile on generation change only: status-only RuleSet updates
        // are filtered out so status patches cannot retrigger the
        // reconciler. ConfigMap-mapped triggers are not filtered.
        let (reader, writer) = reflector::store();
        let rulesets = watcher(rulesets, watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .applied_objects()
            .predicate_filter(predicates::generation);

        let (close_tx, close_rx) = tokio::sync::oneshot::channel::<()>();
        let controller = Controller::for_stream(rulesets, reader)
            .watches(
                configmaps,
                watcher::Config::default(),
                move |configmap: ConfigMap| {
                    let namespace = configmap.namespace().unwrap_or_default();
                    let name = configmap.name_any();
                    let affected = references.read().rulesets_for(&namespace, &name);
                    if !affected.is_empty() {
                        info!(%namespace, configmap = %name, count = affected.len(), "enqueueing rulesets for changed configmap");
                    }
                    affected
                },
            )
            .graceful_shutdown_on(close_rx.map(|_| ()))
            .run(reconcile, error_policy, self.clone())
            .for_each(|result| {
                match result {
                    Ok((ruleset, _)) => {
                        debug!(namespace = ?ruleset.namespace, name = %ruleset.name, "reconciled")
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

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        conditions: &[Condition],
    ) -> Result<(), Error> {
        let api = Api::<RuleSet>::namespaced(self.client.clone(), namespace);
        let patch = json!({"status": {"conditions": conditions}});
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
    ruleset: Arc<RuleSet>,
    ctx: Arc<RuleSetController>,
) -> Result<Action, Error> {
    let namespace = ruleset.namespace().unwrap_or_default();
    let name = ruleset.name_any();
    let key = format!("{namespace}/{name}");
    debug!(%namespace, %name, "starting reconciliation");

    let generation = ruleset.metadata.generation;
    let reference = ruleset.object_ref(&());
    let mut conditions = ruleset
        .status
        .as_ref()
        .map(|status| status.conditions.clone())
        .unwrap_or_default();

    // Refresh the reference index before anything can fail so that source
    // changes keep triggering reconciliation even while degraded.
    ctx.references.write().update(
        &namespace,
        &name,
        ruleset
            .spec
            .rules
            .iter()
            .filter(|source| source.kind == "ConfigMap")
            .map(|source| source.name.clone()),
    );

    if conditions::find(&conditions, conditions::READY).is_none() {
        conditions::set_progressing(&mut conditions, generation, "Reconciling", "Starting reconciliation");
        ctx.patch_status(&namespace, &name, &conditions).await?;
    }

    let mut texts = Vec::with_capacity(ruleset.spec.rules.len());
    for source in &ruleset.spec.rules {
        if source.kind != "ConfigMap" {
            let message = format!("unsupported rule source kind: {}", source.kind);
            ctx.publish_event(reference.clone(), EventType::Warning, "InvalidConfiguration", &message)
                .await;
            conditions::set_degraded(&mut conditions, generation, "InvalidConfiguration", &message);
            ctx.patch_status(&namespace, &name, &conditions).await?;
            return Err(Error::UnsupportedSourceKind(source.kind.clone()));
        }

        let configmaps = Api::<ConfigMap>::namespaced(ctx.client.clone(), &namespace);
        let configmap = match configmaps.get(&source.name).await {
            Ok(configmap) => configmap,
            Err(kube::Error::Api(response)) if response.code == 404 => {
                let message = format!("ConfigMap {} not found", source.name);
                info!(%namespace, %name, configmap = %source.name, "configmap not found, requeueing");
                ctx.publish_event(reference.clone(), EventType::Warning, "ConfigMapNotFound", &message)
                    .await;
                conditions::set_degraded(&mut conditions, generation, "ConfigMapNotFound", &message);
                ctx.patch_status(&namespace, &name, &conditions).await?;
                return Ok(Action::requeue(MISSING_CONFIGMAP_REQUEUE));
            }
            Err(error) => {
                let message = format!("failed to get ConfigMap {}: {error}", source.name);
                ctx.publish_event(reference.clone(), EventType::Warning, "ConfigMapAccessError", &message)
                    .await;
                conditions::set_degraded(&mut conditions, generation, "ConfigMapAccessError", &message);
                ctx.patch_status(&namespace, &name, &conditions).await?;
                return Err(Error::ConfigMapAccess {
                    name: source.name.clone(),
                    source: error,
                });
            }
        };

        match configmap.data.as_ref().and_then(|data| data.get(RULES_KEY)) {
            Some(rules) => texts.push(rules.clone()),
            None => {
                let message = format!("ConfigMap {} missing '{RULES_KEY}' key", source.name);
                ctx.publish_event(reference.clone(), EventType::Warning, "InvalidConfigMap", &message)
                    .await;
                conditions::set_degraded(&mut conditions, generation, "InvalidConfigMap", &message);
                ctx.patch_status(&namespace, &name, &conditions).await?;
                return Err(Error::MissingRulesKey(source.name.clone()));
            }
        }
    }

    ctx.cache.put(key.clone(), aggregate(&texts));
    info!(%namespace, %name, %key, "stored rules in cache");

    if conditions::set_ready(&mut conditions, generation, "RulesCached", "Rules aggregated and cached") {
        ctx.patch_status(&namespace, &name, &conditions).await?;
    }
    ctx.publish_event(
        reference,
        EventType::Normal,
        "RulesCached",
        &format!("Cached rules under key {key}"),
    )
    .await;

    ctx.retries.reset(&ResourceId::new(namespace, name));
    Ok(Action::await_change())
}

fn error_policy(ruleset: Arc<RuleSet>, error: &Error, ctx: Arc<RuleSetController>) -> Action {
    let namespace = ruleset.namespace().unwrap_or_default();
    let name = ruleset.name_any();
    let delay = ctx.retries.next_delay(ResourceId::new(&namespace, &name));
    warn!(%namespace, %name, %error, ?delay, "reconcile failed, backing off");
    Action::requeue(delay)
}

/// Joins rule source texts in `spec.rules` order with a single newline and no
/// trailing separator.
fn aggregate(texts: &[String]) -> String {
    texts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_joins_in_order_without_trailing_newline() {
        let texts = ["x".to_string(), "y".to_string(), "z".to_string()];
        assert_eq!(aggregate(&texts), "x\ny\nz");
    }

    #[test]
    fn aggregate_single_source_is_unchanged() {
        let rules = "SecRule ARGS \"@contains attack\" \"id:1,phase:2,deny\"".to_string();
        assert_eq!(aggregate(std::slice::from_ref(&rules)), rules);
    }

    #[test]
    fn aggregate_preserves_interior_newlines() {
        let texts = ["a\nb".to_string(), "c".to_string()];
        assert_eq!(aggregate(&texts), "a\nb\nc");
    }
}
