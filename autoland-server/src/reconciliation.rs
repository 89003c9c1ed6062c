//! Startup and periodic reconciliation.
//!
//! Queue state lives only in memory, so after a restart the integration
//! branch on GitHub is the only record of an attempt in flight. Before the
//! server accepts requests it reconciles every configured repository; after
//! that it keeps re-checking every repository it knows about, which also
//! catches branches deleted by hand and mutations whose outcome was unknown.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use autoland_core::{Coordinator, Reason, ReconcileOutcome, RepositoryKey};
use tracing::{info, info_span, warn, Instrument};

/// Reconcile each repository once, in order.
pub async fn reconcile_repositories(coordinator: &Coordinator, repositories: &[RepositoryKey]) {
    if repositories.is_empty() {
        info!("No repositories configured for startup reconciliation");
        return;
    }

    info!(
        "Reconciling {} repositor{}...",
        repositories.len(),
        if repositories.len() == 1 { "y" } else { "ies" }
    );

    for repository in repositories {
        let resolution = coordinator
            .reconcile(repository)
            .instrument(info_span!("reconcile", repository = %repository))
            .await;

        match &resolution.reason {
            Reason::Reconciled(ReconcileOutcome::InSync) => {
                info!("{}: in sync", repository);
            }
            Reason::Reconciled(ReconcileOutcome::Adopted { pr_number }) => {
                info!("{}: resumed tracking #{}", repository, pr_number);
            }
            other => {
                warn!("{}: {}", repository, other);
            }
        }
    }
}

/// Reconcile the configured repositories, plus any seen since startup,
/// every `interval`.
pub async fn reconciliation_loop(
    coordinator: Arc<Coordinator>,
    configured: Vec<RepositoryKey>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; startup reconciliation covered it.
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let repositories: Vec<_> = configured
            .iter()
            .cloned()
            .chain(coordinator.known_repositories())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        reconcile_repositories(&coordinator, &repositories).await;
    }
}

#[cfg(test)]
mod tests {
    use autoland_core::merge_message::MergeMarker;
    use autoland_core::testing::{pull_request, FakeHost};
    use autoland_core::{
        AttemptMode, CommitSha, HostingGateway, LogNotifier, QueueConfig, QueueStatus, ReviewerSet,
    };

    use super::*;

    fn repo(name: &str) -> RepositoryKey {
        RepositoryKey::new("octo", name)
    }

    fn coordinator(host: Arc<FakeHost>) -> Arc<Coordinator> {
        let config = QueueConfig::new("@bot", ReviewerSet::new(["alice"]));
        Arc::new(Coordinator::new(config, host, Arc::new(LogNotifier)))
    }

    fn marker(pr_number: u64) -> String {
        MergeMarker {
            pr_number,
            mode: AttemptMode::Merge,
            requested_by: "alice".to_string(),
            base_branch: "main".to_string(),
            base_sha: CommitSha::from("base000"),
            head_sha: CommitSha::from("head007"),
        }
        .render()
    }

    #[tokio::test]
    async fn test_startup_adopts_in_flight_attempts() {
        let host = Arc::new(FakeHost::new());
        host.add_pull_request(&repo("widgets"), pull_request(&repo("widgets"), 7, "head007"));
        host.add_branch(&repo("widgets"), "auto", "merge007", &marker(7));
        let coordinator = coordinator(host.clone());

        reconcile_repositories(&coordinator, &[repo("widgets"), repo("gadgets")]).await;

        assert_eq!(
            coordinator.status(&repo("widgets")).await.pr_number(),
            Some(7)
        );
        assert_eq!(coordinator.status(&repo("gadgets")).await, QueueStatus::Idle);
        assert_eq!(
            coordinator.known_repositories(),
            vec![repo("gadgets"), repo("widgets")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_releases_vanished_branch() {
        let host = Arc::new(FakeHost::new());
        host.add_pull_request(&repo("widgets"), pull_request(&repo("widgets"), 7, "head007"));
        let coordinator = coordinator(host.clone());

        let started = coordinator
            .start_attempt(&repo("widgets"), 7, AttemptMode::DryRun, "alice")
            .await;
        assert!(matches!(started.reason, Reason::Started { .. }));

        let handle = tokio::spawn(reconciliation_loop(
            coordinator.clone(),
            Vec::new(),
            Duration::from_secs(60),
        ));

        // Someone deletes the branch by hand.
        host.delete_branch(&repo("widgets"), "auto").await.unwrap();

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..10 {
            if coordinator.status(&repo("widgets")).await.is_idle() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(coordinator.status(&repo("widgets")).await.is_idle());
        handle.abort();
    }
}
