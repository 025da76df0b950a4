use std::{net::SocketAddr, time::Duration};

use anyhow::{bail, Result};
use clap::Parser;
use coraza_waf_controller_cache::{self as cache, GcConfig, RuleSetCache, SharedRuleSetCache};
use coraza_waf_controller_k8s_reconcile::{EngineController, ReferenceIndex, RuleSetController};
use tracing::{error, info_span, Instrument};

use crate::admission::Admission;

#[derive(Debug, Parser)]
#[clap(name = "waf-controller", about = "A WAF policy controller for Istio gateways")]
pub struct Args {
    #[clap(
        long,
        default_value = "waf_controller=info,warn",
        env = "CORAZA_WAF_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Address the ruleset cache server listens on.
    #[clap(long, default_value = "0.0.0.0:18080")]
    cache_addr: SocketAddr,

    /// Seconds between cache garbage collection passes.
    #[clap(long, default_value = "300")]
    cache_gc_interval_seconds: u64,

    /// Maximum age in seconds of a non-latest cache entry.
    #[clap(long, default_value = "86400")]
    cache_max_age_seconds: u64,

    /// Maximum total size in bytes of all cached rules.
    #[clap(long, default_value = "104857600")]
    cache_max_size_bytes: usize,

    /// Cluster name the data plane uses to reach the cache server; passed
    /// through to WasmPlugin configuration.
    #[clap(long, default_value = "ruleset-cache-server")]
    cache_server_cluster: String,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            cache_addr,
            cache_gc_interval_seconds,
            cache_max_age_seconds,
            cache_max_size_bytes,
            cache_server_cluster,
        } = self;

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_admin(admin)
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await?;

        // The process-wide cache singleton, shared by the RuleSet reconciler
        // (writer) and the cache server (reader).
        let rulesets = RuleSetCache::shared();

        let gc = GcConfig {
            interval: Duration::from_secs(cache_gc_interval_seconds),
            max_age: Duration::from_secs(cache_max_age_seconds),
            max_size: cache_max_size_bytes,
        };
        tokio::spawn(
            cache::sweep(rulesets.clone(), gc, runtime.shutdown_handle())
                .instrument(info_span!("cache_gc")),
        );

        // The cache server runs on every replica: its output is a function of
        // cache state only, so the data plane gets local fanout without
        // leader coordination.
        tokio::spawn(
            serve_cache(cache_addr, rulesets.clone(), runtime.shutdown_handle())
                .instrument(info_span!("cache_server")),
        );

        let references = ReferenceIndex::shared();
        let ruleset_controller =
            RuleSetController::new(runtime.client(), rulesets, references);
        tokio::spawn(
            ruleset_controller
                .run(runtime.shutdown_handle())
                .instrument(info_span!("ruleset_controller")),
        );

        let engine_controller = EngineController::new(runtime.client(), cache_server_cluster);
        tokio::spawn(
            engine_controller
                .run(runtime.shutdown_handle())
                .instrument(info_span!("engine_controller")),
        );

        let runtime = runtime.spawn_server(Admission::new);

        // Block the main thread on the shutdown signal. Once it fires, wait
        // for the background tasks to complete before exiting.
        if runtime.run().await.is_err() {
            bail!("aborted");
        }

        Ok(())
    }
}

async fn serve_cache(addr: SocketAddr, cache: SharedRuleSetCache, drain: drain::Watch) {
    if let Err(error) = cache::serve(addr, cache, drain).await {
        error!(%error, "ruleset cache server failed");
    }
}
