use std::sync::Arc;

use anyhow::{Context, Result};
use autoland_core::{Coordinator, FanoutNotifier, HostingGateway, LogNotifier};
use tokio::net::TcpListener;
use tracing::{info, Level};

use autoland_server::config::Config;
use autoland_server::github::GitHubClient;
use autoland_server::notify::{PullRequestCommentNotifier, SlackNotifier};
use autoland_server::reconciliation::{reconcile_repositories, reconciliation_loop};
use autoland_server::{app, get_bot_version, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let version = get_bot_version();
    info!("Starting autoland {}", version);

    let config = Config::from_env().context("Failed to load configuration from environment")?;

    let gateway: Arc<dyn HostingGateway> = Arc::new(GitHubClient::new(
        config.github_token.clone(),
        &config.github_api_url,
        config.api_timeout,
    )?);

    let mut notifier = FanoutNotifier::new().with(Arc::new(LogNotifier));
    if let Some(webhook_url) = &config.slack_webhook_url {
        info!("Sending notices to Slack");
        notifier = notifier.with(Arc::new(SlackNotifier::new(
            webhook_url.clone(),
            config.slack_channel.clone(),
            config.slack_username.clone(),
            config.api_timeout,
        )?));
    }
    if config.comment_on_pull_requests {
        notifier = notifier.with(Arc::new(PullRequestCommentNotifier::new(
            gateway.clone(),
            version,
        )));
    }

    let coordinator = Arc::new(Coordinator::new(
        config.queue_config(),
        gateway,
        Arc::new(notifier),
    ));

    // Recover attempts left in flight by a previous instance before taking
    // new commands.
    reconcile_repositories(&coordinator, &config.repositories).await;

    if config.reconcile_interval.is_zero() {
        info!("Periodic reconciliation disabled");
    } else {
        tokio::spawn(reconciliation_loop(
            coordinator.clone(),
            config.repositories.clone(),
            config.reconcile_interval,
        ));
    }

    let app_state = Arc::new(AppState {
        coordinator,
        webhook_secret: config.github_webhook_secret,
        ci_token: config.ci_callback_token,
        admin_token: config.admin_token,
    });

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app(app_state)).await?;

    Ok(())
}
