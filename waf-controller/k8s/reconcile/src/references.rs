use std::sync::Arc;

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use coraza_waf_controller_k8s_api::RuleSet;
use kube::runtime::reflector::ObjectRef;
use parking_lot::RwLock;

pub type SharedReferenceIndex = Arc<RwLock<ReferenceIndex>>;

/// Reverse index from ConfigMap names to the RuleSets that reference them,
/// scoped by namespace.
///
/// The RuleSet reconciler refreshes a RuleSet's references on every pass; the
/// ConfigMap watch reads the index to enqueue exactly the RuleSets affected
/// by a ConfigMap change. References are never followed across namespaces.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    by_namespace: HashMap<String, NamespaceRefs>,
}

#[derive(Debug, Default)]
struct NamespaceRefs {
    configmaps_by_ruleset: HashMap<String, HashSet<String>>,
    rulesets_by_configmap: HashMap<String, HashSet<String>>,
}

impl ReferenceIndex {
    pub fn shared() -> SharedReferenceIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Replaces the set of ConfigMaps referenced by a RuleSet.
    pub fn update(
        &mut self,
        namespace: &str,
        ruleset: &str,
        configmaps: impl IntoIterator<Item = String>,
    ) {
        let refs = self.by_namespace.entry(namespace.to_string()).or_default();
        let configmaps: HashSet<String> = configmaps.into_iter().collect();

        let stale: Vec<String> = refs
            .configmaps_by_ruleset
            .get(ruleset)
            .map(|previous| previous.difference(&configmaps).cloned().collect())
            .unwrap_or_default();
        for configmap in stale {
            if let Some(rulesets) = refs.rulesets_by_configmap.get_mut(&configmap) {
                rulesets.remove(ruleset);
                if rulesets.is_empty() {
                    refs.rulesets_by_configmap.remove(&configmap);
                }
            }
        }

        for configmap in &configmaps {
            refs.rulesets_by_configmap
                .entry(configmap.clone())
                .or_default()
                .insert(ruleset.to_string());
        }
        refs.configmaps_by_ruleset.insert(ruleset.to_string(), configmaps);
    }

    /// The RuleSets to enqueue when the given ConfigMap changes.
    pub fn rulesets_for(&self, namespace: &str, configmap: &str) -> Vec<ObjectRef<RuleSet>> {
        self.by_namespace
            .get(namespace)
            .and_then(|refs| refs.rulesets_by_configmap.get(configmap))
            .map(|rulesets| {
                rulesets
                    .iter()
                    .map(|name| ObjectRef::new(name).within(namespace))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(refs: Vec<ObjectRef<RuleSet>>) -> Vec<String> {
        let mut names: Vec<String> = refs.into_iter().map(|r| r.name).collect();
        names.sort();
        names
    }

    #[test]
    fn maps_configmap_change_to_referencing_rulesets_only() {
        let mut index = ReferenceIndex::default();
        index.update("ns", "set-a", ["shared".to_string(), "only-a".to_string()]);
        index.update("ns", "set-b", ["shared".to_string()]);
        index.update("ns", "set-c", ["only-c".to_string()]);

        assert_eq!(names(index.rulesets_for("ns", "shared")), ["set-a", "set-b"]);
        assert_eq!(names(index.rulesets_for("ns", "only-a")), ["set-a"]);
        assert_eq!(names(index.rulesets_for("ns", "unreferenced")), Vec::<String>::new());
    }

    #[test]
    fn lookups_are_namespace_scoped() {
        let mut index = ReferenceIndex::default();
        index.update("ns-one", "set", ["rules".to_string()]);
        index.update("ns-two", "set", ["rules".to_string()]);

        let refs = index.rulesets_for("ns-one", "rules");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].namespace.as_deref(), Some("ns-one"));
        assert!(index.rulesets_for("ns-three", "rules").is_empty());
    }

    #[test]
    fn update_drops_stale_references() {
        let mut index = ReferenceIndex::default();
        index.update("ns", "set", ["old".to_string(), "kept".to_string()]);
        index.update("ns", "set", ["kept".to_string(), "new".to_string()]);

        assert!(index.rulesets_for("ns", "old").is_empty());
        assert_eq!(names(index.rulesets_for("ns", "kept")), ["set"]);
        assert_eq!(names(index.rulesets_for("ns", "new")), ["set"]);
    }

    #[test]
    fn update_to_empty_clears_all_references() {
        let mut index = ReferenceIndex::default();
        index.update("ns", "set", ["rules".to_string()]);
        index.update("ns", "set", Vec::new());

        assert!(index.rulesets_for("ns", "rules").is_empty());
    }
}
