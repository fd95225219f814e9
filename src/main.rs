mod cli;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::tls_rustls::RustlsConfig;
use clap::Parser;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cluster_sentinel::config::{Config, StaticServiceConfig};
use cluster_sentinel::gitops::{run_helmrelease_watcher, run_kustomization_watcher};
use cluster_sentinel::gitprovider::GitProvider;
use cluster_sentinel::model::ServiceSource;
use cluster_sentinel::notify;
use cluster_sentinel::oidc::OidcClient;
use cluster_sentinel::podwatch::{self, PodDiagnosticsIndex};
use cluster_sentinel::prober::HealthProber;
use cluster_sentinel::ratelimit::RateLimiter;
use cluster_sentinel::routes::{self, AppState, GitopsRouteState, PeerCertInfo, SessionState};
use cluster_sentinel::scheduler::ProbeScheduler;
use cluster_sentinel::sse::{K8sConnectivity, SseBroker};
use cluster_sentinel::store::ServiceStore;
use cluster_sentinel::time::system_clock;
use cluster_sentinel::discovery::EndpointDiscoverer;

use cli::{Cli, LogFormat};

/// Quota applied to outbound Git provider calls (spec §5 "Shared resources").
const GIT_PROVIDER_RATE_CAPACITY: u32 = 10;
const GIT_PROVIDER_RATE_REFILL: u32 = 10;
const GIT_PROVIDER_RATE_PERIOD: Duration = Duration::from_secs(60);

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    info!("sentinel_starting");

    let config = Config::load(std::path::Path::new(&cli.config)).unwrap_or_else(|err| {
        warn!(error = %err, "config_load_failed, falling back to defaults");
        Config::default()
    });
    let config_errors: Vec<String> = config.validate().iter().map(|e| e.to_string()).collect();
    for err in &config_errors {
        warn!(error = %err, "config_validation_problem");
    }

    let clock = system_clock();
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .context("building shared HTTP client")?;

    let store = ServiceStore::new(clock.clone());
    let k8s_connectivity = K8sConnectivity::new();
    let pods = PodDiagnosticsIndex::new();

    let oidc_client = config
        .oidc
        .as_ref()
        .filter(|oidc_config| oidc_config.client_secret.is_some())
        .map(|oidc_config| Arc::new(OidcClient::new(http.clone(), oidc_config, clock.clone())));

    let discoverer = EndpointDiscoverer::new(http.clone());
    let prober = Arc::new(HealthProber::new(http.clone(), discoverer, oidc_client.clone()));
    let scheduler = ProbeScheduler::new(
        store.clone(),
        prober,
        pods.clone(),
        Duration::from_millis(config.health.check_interval_ms),
    );

    for service in &config.services {
        seed_static_service(&store, &scheduler, service).await;
    }

    let shutdown = CancellationToken::new();

    let kube_client = match kube::Client::try_default().await {
        Ok(client) => {
            k8s_connectivity.mark_event().await;
            Some(client)
        }
        Err(err) => {
            warn!(error = %err, "kube_client_unavailable, gitops and pod watchers disabled");
            None
        }
    };

    if let Some(client) = kube_client.clone() {
        tokio::spawn(podwatch::run(client.clone(), pods.clone(), shutdown.clone()));

        let ns = config.flux.namespace.clone();
        tokio::spawn(run_kustomization_watcher(
            client.clone(),
            ns.clone(),
            store.clone(),
            config.gitops_cross_namespace_propagation,
            shutdown.clone(),
        ));
        tokio::spawn(run_helmrelease_watcher(
            client,
            ns,
            store.clone(),
            config.gitops_cross_namespace_propagation,
            shutdown.clone(),
        ));
    }

    let gitops_route_state = build_gitops_state(&config, clock.clone());

    let notify_engine = notify::Engine::new(store.clone(), &config.notifications, clock.clone());
    tokio::spawn({
        let cancel = shutdown.clone();
        async move { notify_engine.run(cancel).await }
    });

    let sse = Arc::new(SseBroker::new(
        store,
        k8s_connectivity,
        oidc_client,
        config_errors,
        config.health.check_interval_ms,
    ));
    tokio::spawn({
        let sse = sse.clone();
        let cancel = shutdown.clone();
        async move { sse.run(cancel).await }
    });

    let session_secret = config
        .session
        .secret
        .clone()
        .context("session.secret is required to start the HTTPS server")?;
    let session_state = SessionState {
        secret: session_secret,
        duration_secs: config.session.duration_secs,
        secure: config.session.secure,
        clock: clock.clone(),
    };

    let app_state = AppState { sse, gitops: gitops_route_state, session: session_state };
    let app = routes::build_router(app_state);

    let addr: SocketAddr = cli.addr.parse().context("invalid --addr")?;
    let rustls_config = RustlsConfig::from_pem_file(&cli.tls_cert, &cli.tls_key)
        .await
        .context("loading TLS certificate/key")?;

    let handle = axum_server::Handle::new();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut server_shutdown = shutdown_tx.subscribe();
    let server_handle = handle.clone();
    tokio::spawn(async move {
        let _ = server_shutdown.recv().await;
        server_handle.graceful_shutdown(Some(Duration::from_secs(5)));
    });

    info!(%addr, "https_server_starting");
    let server = tokio::spawn(
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<PeerCertInfo>()),
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutdown_signal_received");
    shutdown.cancel();
    let _ = shutdown_tx.send(());

    if let Err(err) = server.await.context("https server task panicked")? {
        error!(error = %err, "https_server_error");
    }

    info!("sentinel_stopped");
    Ok(())
}

async fn seed_static_service(store: &ServiceStore, scheduler: &ProbeScheduler, config: &StaticServiceConfig) {
    let key = cluster_sentinel::model::ServiceKey::new(config.namespace.clone(), config.name.clone());
    let url = config.url.clone();
    let display_name = config.display_name.clone();
    let group = config.group.clone();

    store
        .update(&key, ServiceSource::Config, move |svc| {
            if let Some(display_name) = display_name {
                svc.display_name = display_name;
            }
            svc.group = group;
            svc.url = url;
        })
        .await;

    scheduler
        .ensure_scheduled(key, config.url.clone(), ServiceSource::Config)
        .await;
}

fn build_gitops_state(config: &Config, clock: cluster_sentinel::time::SharedClock) -> Option<GitopsRouteState> {
    let gitops_config = config.gitops.as_ref()?;
    let token = config.git_provider_token()?;
    let limiter = Arc::new(RateLimiter::new(
        GIT_PROVIDER_RATE_CAPACITY,
        GIT_PROVIDER_RATE_REFILL,
        GIT_PROVIDER_RATE_PERIOD,
        clock,
    ));
    let provider = GitProvider::new(gitops_config, token, limiter)
        .inspect_err(|err| warn!(error = %err, "gitops_provider_construction_failed"))
        .ok()?;

    Some(GitopsRouteState {
        provider: Arc::new(provider),
        provider_kind: gitops_config.provider,
        repository: gitops_config.repository.clone(),
    })
}
