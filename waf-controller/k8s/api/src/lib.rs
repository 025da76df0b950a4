#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod engine;
pub mod ruleset;

pub use self::engine::{Engine, EngineSpec, EngineStatus, FailurePolicy};
pub use self::ruleset::{RuleSet, RuleSetSpec, RuleSetStatus, RuleSourceRef};
pub use k8s_openapi::{
    api::core::v1::{ConfigMap, ObjectReference},
    apimachinery::pkg::apis::meta::v1::{Condition, LabelSelector, Time},
};
pub use kube::{
    api::{Api, ListParams, ObjectMeta, Patch, PatchParams, Resource, ResourceExt},
    error::ErrorResponse,
    Client, Error,
};

/// API group of the WAF custom resources.
pub const API_GROUP: &str = "waf.k8s.coraza.io";

/// Fully-qualified apiVersion of the WAF custom resources.
pub const API_VERSION: &str = "waf.k8s.coraza.io/v1alpha1";
