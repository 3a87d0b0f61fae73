//! memento server.
//!
//! Connects to the chat gateway, wires the ingestion pipeline into its event
//! stream and serves the archive over HTTP.

use crate::assets::{AssetDir, HttpAssetFetcher};
use crate::config::{MementoConfig, TitlesConfig};
use crate::ingest::IngestPipeline;
use crate::lock::LockRegistry;
use crate::notices::{self, Notifier};
use crate::push::PushWorkflow;
use crate::records::FORWARD_VIEWS;
use crate::routes;
use crate::store::{DocumentStore, Filter, SqliteDocumentStore};
use crate::titles::{SweepReport, TitleWorkflow};
use anyhow::Result;
use axum::Extension;
use axum::http::HeaderMap;
use axum::http::Request;
use axum::http::StatusCode;
use axum::response::Response;
use chrono::{DateTime, Utc};
use mm_gateway::{Dispatcher, GatewayClient, Transport, TransportConfig};
use mm_titler::{HttpSummarizer, OpenAiSummarizer, Provider, Summarizer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub store: Arc<dyn DocumentStore>,
    pub titles: Arc<TitleWorkflow>,
    pub push: Arc<PushWorkflow>,
    pub assets: AssetDir,
    pub started_at: DateTime<Utc>,
}

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = MementoConfig::load_with_path(config_path).await?;
    let store = open_store(&cfg).await?;
    let views = store.find_many(FORWARD_VIEWS, Filter::All).await?;
    build_summarizer(&cfg.titles)?;
    tracing::info!(
        config_path = %path.display(),
        gateway_url = %cfg.gateway.url,
        title_provider = ?cfg.titles.provider,
        sqlite_path = %cfg.sqlite_path()?.display(),
        assets_dir = %cfg.assets_dir()?.display(),
        archived_views = views.len(),
        "config ok"
    );
    Ok(())
}

/// Titles every untitled view once, without connecting to the gateway for events.
pub async fn sweep(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = MementoConfig::load(config_path).await?;
    let dispatcher = Arc::new(Dispatcher::new());
    let transport = Transport::connect(transport_config(&cfg), dispatcher).await?;
    let result = run_sweep(&cfg, transport.clone()).await;
    transport.shutdown().await;

    let report = result?;
    println!(
        "memento sweep: {} untitled, {} titled, {} busy, {} failed",
        report.total, report.generated, report.busy, report.failed
    );
    Ok(())
}

async fn run_sweep(cfg: &MementoConfig, gateway: Arc<dyn GatewayClient>) -> Result<SweepReport> {
    let store = open_store(cfg).await?;
    build_titles(cfg, store, gateway)?.sweep_untitled().await
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = MementoConfig::load_with_path(config_path).await?;
    let addr = cfg.bind_addr()?;
    tracing::info!(
        config_path = %path.display(),
        gateway_url = %cfg.gateway.url,
        title_provider = ?cfg.titles.provider,
        inform_group = %cfg.titles.inform_group,
        max_forward_depth = cfg.ingest.max_forward_depth,
        bind_addr = %addr,
        "memento starting"
    );

    let listener = preflight_bind_listener(addr).await?;

    // Handlers are registered once their collaborators exist; events that
    // arrive before that are dropped by the dispatcher.
    let dispatcher = Arc::new(Dispatcher::new());
    let transport = Transport::connect(transport_config(&cfg), dispatcher.clone()).await?;
    let gateway: Arc<dyn GatewayClient> = transport.clone();
    let store = match greet_and_open_store(&cfg, gateway.clone()).await {
        Ok(store) => store,
        Err(e) => {
            transport.shutdown().await;
            return Err(e);
        }
    };

    let assets = AssetDir::new(cfg.assets_dir()?);
    assets.ensure().await?;
    tracing::info!(assets_dir = %assets.root().display(), "asset directory ready");

    let titles = Arc::new(build_titles(&cfg, store.clone(), gateway.clone())?);
    let pipeline = IngestPipeline::new(
        gateway.clone(),
        store.clone(),
        Arc::new(HttpAssetFetcher::new(Duration::from_secs(
            cfg.ingest.asset_timeout_seconds,
        ))),
        assets.clone(),
        titles.clone(),
    )
    .with_max_forward_depth(cfg.ingest.max_forward_depth);
    dispatcher.register_handler(Arc::new(pipeline));

    if cfg.titles.sweep_on_startup {
        let titles = titles.clone();
        tokio::spawn(async move {
            if let Err(e) = titles.sweep_untitled().await {
                tracing::warn!(error = %format!("{e:#}"), "startup title sweep failed");
            }
        });
    }

    let push = Arc::new(PushWorkflow::new(
        store.clone(),
        Notifier::new(gateway.clone(), cfg.titles.inform_group.clone()),
        cfg.public_base_url(),
    ));
    let state = Arc::new(AppState {
        store,
        titles,
        push,
        assets,
        started_at: Utc::now(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                uri = %request.uri(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(CorsLayer::permissive())
        .layer(GlobalConcurrencyLimitLayer::new(cfg.http.max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.http.timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let shutdown = CancellationToken::new();
    tracing::info!(%addr, "memento serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    transport.shutdown().await;
    tracing::info!("gateway shutdown completed");
    Ok(())
}

/// Greets the admin, then opens the store. A store that cannot be opened is
/// reported to the admin before the error is returned.
async fn greet_and_open_store(
    cfg: &MementoConfig,
    gateway: Arc<dyn GatewayClient>,
) -> Result<Arc<dyn DocumentStore>> {
    let admin = Notifier::new(gateway, cfg.titles.inform_group.clone());
    admin
        .private(&cfg.gateway.admin_user_id, cfg.gateway.greeting.clone())
        .await;

    match open_store(cfg).await {
        Ok(store) => Ok(store),
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "document store unavailable");
            admin
                .private(&cfg.gateway.admin_user_id, notices::store_unavailable(&e))
                .await;
            Err(e)
        }
    }
}

fn transport_config(cfg: &MementoConfig) -> TransportConfig {
    TransportConfig::new(cfg.gateway.url.trim())
        .with_access_token(cfg.gateway.access_token.clone())
        .with_call_timeout(cfg.call_timeout())
}

async fn open_store(cfg: &MementoConfig) -> Result<Arc<dyn DocumentStore>> {
    let path = cfg.sqlite_path()?;
    let store = SqliteDocumentStore::open(&path)
        .await
        .map_err(|e| anyhow::anyhow!("open document store {}: {e}", path.display()))?;
    Ok(Arc::new(store))
}

fn build_titles(
    cfg: &MementoConfig,
    store: Arc<dyn DocumentStore>,
    gateway: Arc<dyn GatewayClient>,
) -> Result<TitleWorkflow> {
    Ok(TitleWorkflow::new(
        store,
        build_summarizer(&cfg.titles)?,
        Notifier::new(gateway, cfg.titles.inform_group.clone()),
        LockRegistry::new(),
    )
    .with_lock_ttl(cfg.lock_ttl()))
}

fn build_summarizer(titles: &TitlesConfig) -> Result<Arc<dyn Summarizer>> {
    let summarizer: Arc<dyn Summarizer> = match Provider::from(titles.provider) {
        Provider::Http => Arc::new(HttpSummarizer::new(titles.endpoint.trim())?),
        Provider::OpenAi => {
            let api_key = titles
                .api_key
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("titles.api_key is required for openai"))?;
            Arc::new(OpenAiSummarizer::new(
                titles.base_url.as_deref(),
                api_key,
                &titles.model,
            )?)
        }
    };
    Ok(summarizer)
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
    shutdown.cancel();
}
