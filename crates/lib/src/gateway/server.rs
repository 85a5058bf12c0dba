//! Gateway HTTP server: health check and webhook endpoint, plus process wiring.

use crate::channels::TelegramClient;
use crate::config::{self, Config};
use crate::dispatch::{
    CannedReplies, ErrorBoundary, HandlerTable, LoggingMiddleware, Pipeline, PriorityRouter,
    Stateless,
};
use crate::limiter::{
    MemoryWindowStore, NotificationGate, RateLimitPolicy, RedisWindowStore, SlidingWindowLimiter,
    SystemClock, WindowStore,
};
use crate::notifier::AntiSpamEphemeralNotifier;
use crate::retry::RetryPolicy;
use crate::transport::{TransportListener, TransportSettings, WebhookReceipt, SECRET_HEADER};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// None when no bot token is configured.
    pub listener: Option<Arc<TransportListener>>,
}

/// Limiter over Redis when configured and reachable, else over process-local windows.
async fn build_limiter(config: &Config) -> Arc<SlidingWindowLimiter> {
    let store: Arc<dyn WindowStore> = match config::resolve_redis_url(config) {
        Some(url) => match RedisWindowStore::connect(&url).await {
            Ok(store) => {
                log::info!("limiter: using redis store");
                Arc::new(store)
            }
            Err(e) => {
                log::warn!("limiter: redis unavailable ({}), using in-process windows", e);
                Arc::new(MemoryWindowStore::new())
            }
        },
        None => {
            log::debug!("limiter: no redis configured, using in-process windows");
            Arc::new(MemoryWindowStore::new())
        }
    };
    Arc::new(
        SlidingWindowLimiter::new(store, Arc::new(SystemClock))
            .with_store_retry(config.limiter.store_retry())
            .with_expiry_margin(config.limiter.expiry_safety_margin_secs),
    )
}

/// Everything behind the webhook route and the long-poll loop, built once.
struct Bot {
    listener: Arc<TransportListener>,
    notifier: Arc<AntiSpamEphemeralNotifier>,
}

async fn build_bot(config: &Config, token: String, retry: RetryPolicy) -> Bot {
    let client = Arc::new(TelegramClient::new(
        token,
        config::resolve_telegram_api_base(config),
    ));
    let limiter = build_limiter(config).await;

    let notifier = Arc::new(AntiSpamEphemeralNotifier::new(
        client.clone(),
        retry,
        config.notifier.settings(),
    ));
    let handlers = HandlerTable::builder()
        .command(Arc::new(CannedReplies::new(
            &config.commands,
            client.clone(),
            retry,
        )))
        .build();
    let router = PriorityRouter::new(
        handlers,
        Arc::new(Stateless),
        notifier.clone(),
        client.clone(),
        retry,
    );
    let gate = NotificationGate::new(
        limiter,
        client.clone(),
        RateLimitPolicy::new(
            "error-notice",
            config.limiter.error_notice_limit,
            Duration::from_secs(config.limiter.error_notice_window_secs),
        ),
        config.limiter.key_prefix.clone(),
    );
    let pipeline = Pipeline::builder()
        .middleware(Arc::new(LoggingMiddleware))
        .build(
            Arc::new(router),
            ErrorBoundary::new(config.error_notice.clone(), Arc::new(gate)),
        );
    let listener = TransportListener::new(
        client,
        Arc::new(pipeline),
        TransportSettings {
            webhook_url: config.telegram.webhook_url.clone(),
            webhook_secret: config.telegram.webhook_secret.clone(),
            poll_timeout_secs: config.telegram.poll_timeout_secs,
        },
    );
    Bot { listener, notifier }
}

/// Run the gateway; binds to config.gateway.bind:config.gateway.port.
/// Starts the Telegram transport when a bot token is configured.
/// Blocks until shutdown (Ctrl+C / SIGTERM) or until the platform rejects the bot token.
pub async fn run_gateway(config: Config) -> Result<()> {
    config.validate()?;
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && config.telegram.webhook_secret.is_none() {
        log::warn!(
            "gateway bound to {} without telegram.webhookSecret; anyone can post updates",
            bind
        );
    }

    let retry = config.retry.policy();
    let bot = match config::resolve_telegram_token(&config) {
        Some(token) => {
            let bot = build_bot(&config, token, retry).await;
            let mode = bot
                .listener
                .start(config.telegram.mode)
                .await
                .context("starting telegram transport")?;
            log::info!("telegram transport started ({} mode)", mode);
            Some(bot)
        }
        None => {
            log::warn!("no telegram bot token configured (TELEGRAM_BOT_TOKEN); serving health only");
            None
        }
    };

    let state = GatewayState {
        config: Arc::new(config.clone()),
        listener: bot.as_ref().map(|b| b.listener.clone()),
    };
    let app = Router::new()
        .route("/", get(health_http))
        .route(&config.telegram.webhook_path, post(telegram_webhook))
        .with_state(state);

    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    let fatal = bot
        .as_ref()
        .map(|b| b.listener.fatal_token())
        .unwrap_or_default();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(fatal.clone(), bot))
        .await
        .context("gateway server exited")?;
    if fatal.is_cancelled() {
        anyhow::bail!("telegram rejected the bot token; gateway stopped");
    }
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT, SIGTERM, or a fatal
/// transport error). Stops the transport (removing any webhook) and waits for detached notices.
async fn shutdown_signal(fatal: CancellationToken, bot: Option<Bot>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = fatal.cancelled() => {},
    }
    log::info!("shutdown signal received, stopping transport and draining events");

    if let Some(bot) = bot {
        bot.listener.stop().await;
        bot.notifier.shutdown().await;
    }
    log::info!("transport and background tasks finished");
}

/// POST <webhookPath>: receives Telegram update JSON; verifies optional secret and dispatches.
async fn telegram_webhook(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(listener) = state.listener.as_ref() else {
        return StatusCode::SERVICE_UNAVAILABLE;
    };
    let secret = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    match listener.accept_webhook(secret, &body) {
        WebhookReceipt::Accepted | WebhookReceipt::Ignored => StatusCode::OK,
        WebhookReceipt::BadSecret => StatusCode::FORBIDDEN,
        WebhookReceipt::Malformed => StatusCode::BAD_REQUEST,
        WebhookReceipt::Inactive => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// GET / returns a simple health JSON.
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let transport = state
        .listener
        .as_ref()
        .and_then(|l| l.active_mode())
        .map(|m| m.to_string())
        .unwrap_or_else(|| "none".to_string());
    Json(json!({
        "runtime": "running",
        "transport": transport,
        "port": state.config.gateway.port,
    }))
}
