//! Invariants under randomized, concurrent command injection.

use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;
use tokio::task::JoinSet;

use super::*;
use crate::config::ReviewerSet;
use crate::notifier::LogNotifier;
use crate::state_machine::event::CiStatus;
use crate::testing::{pull_request, BranchChange, FakeHost};

const REPOSITORIES: [&str; 2] = ["widgets", "gadgets"];

#[derive(Debug, Clone)]
enum Op {
    Start { repo: usize, pr: u64, mode: AttemptMode },
    Ci { repo: usize, status: CiStatus },
    Assign { repo: usize, pr: u64 },
    Reconcile { repo: usize },
}

fn arb_mode() -> impl Strategy<Value = AttemptMode> {
    prop_oneof![Just(AttemptMode::DryRun), Just(AttemptMode::Merge)]
}

fn arb_status() -> impl Strategy<Value = CiStatus> {
    prop_oneof![
        Just(CiStatus::Passed),
        Just(CiStatus::Failed),
        Just(CiStatus::Unrecognized("errored".to_string())),
    ]
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..2usize, 1..4u64, arb_mode())
            .prop_map(|(repo, pr, mode)| Op::Start { repo, pr, mode }),
        3 => (0..2usize, arb_status()).prop_map(|(repo, status)| Op::Ci { repo, status }),
        1 => (0..2usize, 1..4u64).prop_map(|(repo, pr)| Op::Assign { repo, pr }),
        1 => (0..2usize).prop_map(|repo| Op::Reconcile { repo }),
    ]
}

fn key(index: usize) -> RepositoryKey {
    RepositoryKey::new("octo", REPOSITORIES[index])
}

fn host() -> Arc<FakeHost> {
    let host = Arc::new(FakeHost::new());
    for index in 0..REPOSITORIES.len() {
        for pr in 1..4 {
            host.add_pull_request(
                &key(index),
                pull_request(&key(index), pr, &format!("head{}{}", index, pr)),
            );
        }
    }
    host
}

fn config() -> QueueConfig {
    QueueConfig::new("@bot", ReviewerSet::new(["alice"]))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the integration branch of a repository is never created
    /// twice without a delete in between, and after the dust settles the
    /// queue is testing exactly when the branch exists.
    #[test]
    fn at_most_one_attempt_per_repository(ops in proptest::collection::vec(arb_op(), 1..40)) {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let host = host();
            let coordinator = Arc::new(Coordinator::new(config(), host.clone(), Arc::new(LogNotifier)));

            let mut tasks = JoinSet::new();
            for op in ops {
                let coordinator = coordinator.clone();
                tasks.spawn(async move {
                    match op {
                        Op::Start { repo, pr, mode } => {
                            coordinator.start_attempt(&key(repo), pr, mode, "alice").await
                        }
                        Op::Ci { repo, status } => {
                            coordinator.ci_report(&key(repo), CiReport::new("auto", status)).await
                        }
                        Op::Assign { repo, pr } => {
                            coordinator.assign_review(&key(repo), pr, "alice").await
                        }
                        Op::Reconcile { repo } => coordinator.reconcile(&key(repo)).await,
                    }
                });
            }
            while let Some(joined) = tasks.join_next().await {
                let resolution = joined.unwrap();
                assert_ne!(resolution.reason, Reason::WorkerUnavailable);
            }

            let mut holding: HashMap<RepositoryKey, bool> = HashMap::new();
            for change in host.branch_history() {
                match change {
                    BranchChange::Created { repo, name } if name == "auto" => {
                        let held = holding.entry(repo.clone()).or_default();
                        assert!(!*held, "second integration branch created in {}", repo);
                        *held = true;
                    }
                    BranchChange::Deleted { repo, name } if name == "auto" => {
                        holding.insert(repo, false);
                    }
                    _ => {}
                }
            }

            for index in 0..REPOSITORIES.len() {
                let repo = key(index);
                let status = coordinator.status(&repo).await;
                let branch = host.branch(&repo, "auto");
                assert_eq!(
                    status.is_idle(),
                    branch.is_none(),
                    "{}: status {:?} but branch {:?}",
                    repo,
                    status,
                    branch
                );
            }
        });
    }

    /// Property: commands from non-reviewers never reach the hosting side.
    #[test]
    fn unauthorized_senders_never_act(
        sender in "[a-z]{3,8}".prop_filter("must not be a reviewer", |login| login != "alice"),
        verb in prop_oneof![Just("try"), Just("r+"), Just("r?")],
        trigger in prop_oneof![Just("@bot"), Just("@alice")],
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let host = host();
            let coordinator = Coordinator::new(config(), host.clone(), Arc::new(LogNotifier));

            let resolution = coordinator
                .handle_comment(ReviewComment {
                    repository: key(0),
                    issue_number: 1,
                    sender: sender.clone(),
                    body: format!("{} {} bob", trigger, verb),
                })
                .await;

            assert!(resolution.status.is_idle());
            assert!(
                host.calls().iter().all(|call| !call.is_mutating()),
                "{} caused {:?}",
                sender,
                host.calls()
            );
        });
    }
}
