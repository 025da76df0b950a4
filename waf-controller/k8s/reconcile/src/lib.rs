#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Controllers coupling the WAF custom resources to the ruleset cache and
//! the Istio data plane.
//!
//! Both reconcilers are level-triggered: each pass is a function of current
//! API state, re-running is cheap, and the only observable state is the
//! `Ready`/`Progressing`/`Degraded` condition set on the resource.

pub mod conditions;
mod engine;
mod references;
mod retry;
mod ruleset;

pub use self::engine::{EngineController, WASM_PLUGIN_NAME_PREFIX};
pub use self::references::{ReferenceIndex, SharedReferenceIndex};
pub use self::retry::{ResourceId, RetryBackoff};
pub use self::ruleset::RuleSetController;
