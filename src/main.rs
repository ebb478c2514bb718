use std::{net::SocketAddr, sync::Arc};

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dns_reconciler::{
    config::{Config, ProviderKind, RegistryKind},
    controller::Controller,
    handlers::{self, AppState},
    leader::AlwaysLeader,
    pdns::{PdnsClient, PdnsProvider},
    provider::{InMemoryProvider, Provider},
    registry::{NoopRegistry, Registry, TxtRegistry},
    source::{FileSource, Source},
};

// ─────────────────────────────────────────────────────────────────────────────
// Wiring
//
// Every source, provider and registry is built here, once, and handed to the
// controller explicitly.
// ─────────────────────────────────────────────────────────────────────────────

async fn build_providers(cfg: &Config) -> anyhow::Result<Vec<Arc<dyn Provider>>> {
    match cfg.provider_kind()? {
        ProviderKind::Pdns => {
            let client = PdnsClient::new(&cfg.pdns_api_url, &cfg.pdns_api_key, &cfg.pdns_server_id)?;
            let zones = client
                .discover_zones(&cfg.domain_filter()?)
                .await
                .context("discovering PowerDNS zones")?;
            if zones.is_empty() {
                bail!("no PowerDNS zone matches the domain filter");
            }
            Ok(zones
                .iter()
                .map(|zone| {
                    Arc::new(PdnsProvider::new(client.clone(), zone, cfg.default_ttl)) as Arc<dyn Provider>
                })
                .collect())
        }
        ProviderKind::InMemory => {
            let zones = cfg.domain_filter_list();
            if zones.is_empty() {
                bail!("the in-memory provider needs DOMAIN_FILTER to name its zones");
            }
            Ok(zones
                .iter()
                .map(|zone| Arc::new(InMemoryProvider::new(zone)) as Arc<dyn Provider>)
                .collect())
        }
    }
}

fn build_registries(cfg: &Config, providers: Vec<Arc<dyn Provider>>) -> anyhow::Result<Vec<Arc<dyn Registry>>> {
    let kind = cfg.registry_kind()?;
    let mut registries: Vec<Arc<dyn Registry>> = Vec::with_capacity(providers.len());
    for provider in providers {
        let registry: Arc<dyn Registry> = match kind {
            RegistryKind::Txt => Arc::new(
                TxtRegistry::new(provider, &cfg.owner_id, cfg.name_mapper()?, cfg.allow_unowned_degraded)?
                    .with_cache_interval(cfg.txt_cache_interval()),
            ),
            RegistryKind::Noop => {
                warn!(zone = provider.zone(), "ownership tracking disabled; existing records will never be changed");
                Arc::new(NoopRegistry::new(provider))
            }
        };
        registries.push(registry);
    }
    Ok(registries)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("ctrl-c received"),
        _ = terminate => info!("SIGTERM received"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(f) => {
            eprintln!(
                "[tracing] using RUST_LOG={}",
                std::env::var("RUST_LOG").unwrap_or_default()
            );
            f
        }
        Err(e) => {
            let default = "dns_reconciler=debug,reconciler=debug,tower_http=info";
            eprintln!("[tracing] RUST_LOG not set or invalid ({e}), defaulting to: {default}");
            EnvFilter::new(default)
        }
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(false)
                .with_ansi(true),
        )
        .init();

    let cfg = Config::from_env()?;
    let settings = cfg.controller_settings()?;

    info!("Owner ID     : {}", cfg.owner_id);
    info!("Policy       : {}", settings.policy);
    info!("Registry     : {}", cfg.registry);
    info!("Provider     : {}", cfg.provider);
    let scope = &settings.plan.domain_filter;
    if scope.is_configured() {
        info!("Domain filter: include={:?} exclude={:?}", scope.include, scope.exclude);
    } else {
        info!("Domain filter: (all zones)");
    }
    info!("Interval     : {}s", cfg.interval_secs);
    if cfg.dry_run {
        info!("Dry run      : changes are planned and logged, never applied");
    }

    let providers = build_providers(&cfg).await?;
    let registries = build_registries(&cfg, providers)?;
    let sources: Vec<Arc<dyn Source>> = cfg
        .source_files()
        .into_iter()
        .map(|path| Arc::new(FileSource::new(path)) as Arc<dyn Source>)
        .collect();
    if sources.is_empty() {
        warn!("no sources configured; every owned record will be considered stale");
    }

    let domain_filter = settings.plan.domain_filter.clone();
    let controller = Controller::new(settings, sources, registries, Arc::new(AlwaysLeader));
    info!("Zones        : {:?}", controller.zones());

    if cfg.once {
        let report = controller.run_once().await;
        println!("{}", serde_json::to_string_pretty(&report)?);
        if !report.is_clean() {
            bail!("cycle finished with errors");
        }
        return Ok(());
    }

    let app = handlers::router(AppState::new(controller.clone(), domain_filter));
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("ops server stopped: {e}");
        }
    });

    controller.run(shutdown_signal()).await;
    Ok(())
}
