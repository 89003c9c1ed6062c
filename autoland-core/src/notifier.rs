//! Notifier port and the background dispatcher that feeds it.
//!
//! Notices are produced by the state machine while a repository worker is
//! busy. They are queued on a channel and delivered by a single background
//! task, so a slow or failing sink never holds up a repository and delivery
//! order matches production order.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::state_machine::effect::Notice;
use crate::state_machine::state::RepositoryKey;

/// A sink for human-readable notices.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, repository: &RepositoryKey, notice: &Notice) -> Result<()>;
}

/// Writes notices to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, repository: &RepositoryKey, notice: &Notice) -> Result<()> {
        if notice.needs_operator() {
            warn!(repository = %repository, "{}", notice);
        } else {
            info!(repository = %repository, "{}", notice);
        }
        Ok(())
    }
}

/// Sends every notice to every sink.
///
/// All sinks are tried even if one fails; the first error is returned.
#[derive(Default, Clone)]
pub struct FanoutNotifier {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, repository: &RepositoryKey, notice: &Notice) -> Result<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(repository, notice).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Queues notices for background delivery.
#[derive(Clone)]
pub struct NoticeDispatcher {
    sender: mpsc::UnboundedSender<(RepositoryKey, Notice)>,
}

impl NoticeDispatcher {
    /// Spawn the delivery task. Must be called inside a tokio runtime.
    pub fn spawn(notifier: Arc<dyn Notifier>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(Self::delivery_task(notifier, receiver));
        Self { sender }
    }

    /// Queue a notice. Never blocks.
    pub fn dispatch(&self, repository: RepositoryKey, notice: Notice) {
        if let Err(e) = self.sender.send((repository, notice)) {
            let (repository, notice) = e.0;
            error!(
                "Notice dispatcher stopped; dropping notice for {}: {}",
                repository, notice
            );
        }
    }

    async fn delivery_task(
        notifier: Arc<dyn Notifier>,
        mut receiver: mpsc::UnboundedReceiver<(RepositoryKey, Notice)>,
    ) {
        while let Some((repository, notice)) = receiver.recv().await {
            if let Err(e) = notifier.notify(&repository, &notice).await {
                warn!("Failed to deliver notice for {}: {:#}", repository, e);
            }
        }
        info!("Notice dispatcher shutting down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::state_machine::state::AttemptMode;

    #[derive(Default)]
    struct Collecting {
        seen: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Collecting {
        async fn notify(&self, repository: &RepositoryKey, notice: &Notice) -> Result<()> {
            self.seen
                .lock()
                .unwrap()
                .push(format!("{}: {}", repository, notice));
            if self.fail {
                anyhow::bail!("sink is down");
            }
            Ok(())
        }
    }

    fn notice(pr_number: u64) -> Notice {
        Notice::AttemptRecovered {
            pr_number,
            mode: AttemptMode::DryRun,
        }
    }

    #[tokio::test]
    async fn test_fanout_tries_every_sink() {
        let failing = Arc::new(Collecting {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Collecting::default());
        let fanout = FanoutNotifier::new()
            .with(failing.clone())
            .with(healthy.clone());

        let result = fanout
            .notify(&RepositoryKey::new("octo", "widgets"), &notice(1))
            .await;

        assert!(result.is_err());
        assert_eq!(failing.seen.lock().unwrap().len(), 1);
        assert_eq!(healthy.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order_despite_failures() {
        let sink = Arc::new(Collecting {
            fail: true,
            ..Default::default()
        });
        let dispatcher = NoticeDispatcher::spawn(sink.clone());
        let repo = RepositoryKey::new("octo", "widgets");

        for pr in 1..=3 {
            dispatcher.dispatch(repo.clone(), notice(pr));
        }

        for _ in 0..100 {
            if sink.seen.lock().unwrap().len() == 3 {
                break;
            }
            tokio::task::yield_now().await;
        }

        let seen = sink.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);
        assert!(seen[0].contains("#1"));
        assert!(seen[2].contains("#3"));
    }
}
