#[macro_use]
extern crate log;

use std::{collections::HashSet, sync::Arc};

use anyhow::anyhow;
use kube::{Api, Client};
use kube_runtime::{WatchStreamExt, watcher};
use mimir_rules_controller_apis::MimirRule;
use opentelemetry::metrics::MeterProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use tokio::{signal::unix::SignalKind, task::JoinSet};
use tokio_util::sync::CancellationToken;

mod cache;
mod configuration;
mod controller;
mod errors;
mod leader;
mod lint;
mod metrics;
mod mimir_client;
mod prometheus_exporter;
mod queue;
mod reconciler;
mod status;
mod store;
#[cfg(test)]
mod testing;

use configuration::Configuration;
use controller::RuleController;
use leader::{KubeLeaseStore, LeaderCoordinator, LeaderEvent, LeaderState, SystemClock};
use lint::DelimiterLinter;
use metrics::{METER_NAME, OtelSyncMetrics};
use mimir_client::MimirClient;
use prometheus_exporter::{register_process_collector, start_prometheus_metrics_server};
use reconciler::Reconciler;
use store::KubeRuleStore;

/// The K8s field manager name.
const MANAGER: &'static str = "mimir-rules-controller";

fn rules_api(client: Client, watch_namespaces: &Option<HashSet<String>>) -> Api<MimirRule> {
    let mut tmp = watch_namespaces.iter().flatten();
    if let (Some(ns), None) = (tmp.next(), tmp.next()) {
        // Optimize for the use-case where exactly one watch-namespace is provided.
        info!("Controller is only watching MimirRules in namespace {}", ns);
        Api::namespaced(client, ns.as_str())
    } else {
        if let Some(namespaces) = watch_namespaces {
            let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
            info!(
                "Controller is watching MimirRules in namespaces: {}",
                namespaces.join(",")
            );
        } else {
            info!("Controller is watching MimirRules in all namespaces");
        }
        Api::all(client)
    }
}

/// Cancel `cancel` on SIGINT or SIGTERM.
fn cancel_on_signal(cancel: CancellationToken) -> anyhow::Result<()> {
    let mut terminate = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
            _ = terminate.recv() => info!("received SIGTERM, shutting down"),
        }
        cancel.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider already installed");
    }
    let configuration = Configuration::from_env()?;
    let identity = configuration.identity();
    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone())?;

    let registry = prometheus::Registry::new();
    register_process_collector(&registry)?;
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let meter_provider = SdkMeterProvider::builder().with_reader(exporter).build();
    let meter = meter_provider.meter(METER_NAME);

    let client = Client::try_default().await?;
    let (writer, cache, notifications) = cache::cache();
    let rule_watcher = watcher::watcher(
        rules_api(client.clone(), &configuration.watch_namespaces),
        watcher::Config::default(),
    )
    .default_backoff();

    let reconciler = Arc::new(Reconciler::new(
        configuration.cluster_name.clone(),
        cache.clone(),
        Arc::new(MimirClient::new(configuration.mimir.clone())?),
        Arc::new(KubeRuleStore::new(client.clone())),
        Arc::new(DelimiterLinter),
        Arc::new(OtelSyncMetrics::new(&meter)),
    ));
    let controller = Arc::new(RuleController::new(
        reconciler,
        cache.clone(),
        configuration.watch_namespaces.clone(),
        configuration.workers,
        configuration.resync_period,
        configuration.cache_sync_timeout,
    ));
    let (coordinator, mut leader_events) = LeaderCoordinator::new(
        configuration.leader_config(),
        Arc::new(KubeLeaseStore::new(
            client.clone(),
            configuration.lease_namespace.as_str(),
            configuration.lease_name.as_str(),
        )),
        Arc::new(SystemClock),
    )?;

    // Cache and dispatcher run on every replica, workers only on the leader.
    tokio::spawn(writer.run(rule_watcher, cancel.clone()));
    tokio::spawn(controller.clone().dispatch(notifications, cancel.clone()));
    tokio::spawn(controller.clone().resync(cancel.clone()));
    tokio::spawn(start_prometheus_metrics_server(
        configuration.metrics_addr,
        registry,
        cache.clone(),
        cancel.clone(),
    ));
    let mut leader = tokio::spawn(coordinator.run(cancel.clone()));
    let mut workers = JoinSet::new();

    info!("starting {} ...", identity);
    let result: anyhow::Result<()> = loop {
        tokio::select! {
            Some(event) = leader_events.recv() => match event {
                LeaderEvent::Transition(LeaderState::Standby) => info!("waiting for leadership"),
                LeaderEvent::Transition(LeaderState::Leading) => {
                    info!("{} is leading, starting workers", identity);
                    workers.spawn(controller.clone().run(cancel.clone()));
                }
                LeaderEvent::Transition(LeaderState::Stopped) => {
                    if cancel.is_cancelled() {
                        break Ok(());
                    }
                    break Err(anyhow!("{} lost leadership", identity));
                }
                LeaderEvent::NewLeader(holder) if holder == identity => (),
                LeaderEvent::NewLeader(holder) => info!("new leader elected: {}", holder),
            },
            Some(stopped) = workers.join_next(), if !workers.is_empty() => match stopped {
                Ok(Ok(())) if cancel.is_cancelled() => (),
                Ok(Ok(())) => break Err(anyhow!("workers stopped unexpectedly")),
                Ok(Err(e)) => break Err(e.into()),
                Err(e) => break Err(e.into()),
            },
            finished = &mut leader => match finished {
                Ok(Ok(())) if cancel.is_cancelled() => break Ok(()),
                Ok(Ok(())) => break Err(anyhow!("leader election stopped")),
                Ok(Err(e)) => break Err(e.into()),
                Err(e) => break Err(e.into()),
            },
        }
    };
    if let Err(e) = &result {
        error!("{}", e);
    }

    cancel.cancel();
    if !leader.is_finished() {
        if let Ok(Err(e)) = leader.await {
            warn!("leader election failed during shutdown: {}", e);
        }
    }
    while let Some(stopped) = workers.join_next().await {
        if let Ok(Err(e)) = stopped {
            warn!("workers failed during shutdown: {}", e);
        }
    }
    if let Err(e) = meter_provider.shutdown() {
        warn!("failed to shut down meter provider: {}", e);
    }
    info!("stopped {}", identity);
    result
}
