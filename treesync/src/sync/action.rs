use futures_util::future::BoxFuture;
use treesync_core::Connector;

use super::pool::{Command, CommandError, CommandPool, Reply};

pub type CommandFactory = Box<dyn Fn() -> Command + Send>;
/// Inspects a reply and judges the attempt. `None` means the handler could
/// not decide; each evaluation mode supplies its own default.
pub type ReplyHandler = Box<dyn FnMut(Reply) -> BoxFuture<'static, Option<bool>> + Send>;
/// `(attempt, error, exhausted)` notification after a failed attempt.
pub type ErrorHandler = Box<dyn FnMut(u32, Option<&CommandError>, bool) + Send>;

pub enum Evaluation {
    /// A settled main command is enough; its reply is returned as-is.
    AssumeSuccess,
    /// Judge the main reply directly. An undecided handler counts as success.
    ForEach(ReplyHandler),
    /// Issue a separate probe command after the main one settles and judge
    /// its reply. An undecided handler counts as failure, as does a probe
    /// that fails to settle.
    Verify {
        probe: CommandFactory,
        accept: ReplyHandler,
    },
}

pub struct ActionSpec {
    pub main: CommandFactory,
    pub evaluation: Evaluation,
    pub on_error: Option<ErrorHandler>,
    /// Full attempts of the whole action, on top of the scheduler's own
    /// per-command transport retries.
    pub retry_limit: u32,
}

pub struct ActionOutcome {
    pub success: bool,
    /// Main reply of the successful attempt; only kept for `AssumeSuccess`,
    /// the judging modes consume it.
    pub reply: Option<Reply>,
}

/// Run one action to completion: up to `retry_limit` full attempts of the
/// main command plus its evaluation.
pub async fn run_action<C: Connector>(
    pool: &CommandPool<C>,
    mut spec: ActionSpec,
) -> ActionOutcome {
    let limit = spec.retry_limit.max(1);
    for attempt in 1..=limit {
        let exhausted = attempt == limit;
        let error = match pool.submit((spec.main)()).await {
            Ok(reply) => match &mut spec.evaluation {
                Evaluation::AssumeSuccess => {
                    return ActionOutcome {
                        success: true,
                        reply: Some(reply),
                    };
                }
                Evaluation::ForEach(judge) => {
                    if judge(reply).await.unwrap_or(true) {
                        return ActionOutcome {
                            success: true,
                            reply: None,
                        };
                    }
                    None
                }
                Evaluation::Verify { probe, accept } => match pool.submit(probe()).await {
                    Ok(reply) => {
                        if accept(reply).await.unwrap_or(false) {
                            return ActionOutcome {
                                success: true,
                                reply: None,
                            };
                        }
                        None
                    }
                    Err(err) => Some(err),
                },
            },
            Err(err) => Some(err),
        };
        if let Some(on_error) = &mut spec.on_error {
            on_error(attempt, error.as_ref(), exhausted);
        }
    }
    ActionOutcome {
        success: false,
        reply: None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use treesync_core::{ConnectionParams, RemoteError};

    use super::*;
    use crate::sync::pool::{PoolConfig, Verb};
    use crate::sync::testing::{FakeCall, FakeConnector, FakeResponse};

    fn pool(connector: FakeConnector) -> CommandPool<FakeConnector> {
        CommandPool::new(
            connector,
            PoolConfig {
                connection: ConnectionParams::default(),
                num_workers: 1,
                retry_limit: 1,
                request_timeout: Duration::from_millis(2000),
                transfer_timeout: Duration::from_millis(5000),
            },
        )
    }

    fn delete_main() -> CommandFactory {
        Box::new(|| {
            Command::new(Verb::Delete {
                path: "/www/a.txt".to_string(),
            })
        })
    }

    #[tokio::test]
    async fn assume_success_returns_the_settled_reply() {
        let connector = FakeConnector::new(|_, _| FakeResponse::Done);
        let pool = pool(connector);

        let outcome = run_action(
            &pool,
            ActionSpec {
                main: delete_main(),
                evaluation: Evaluation::AssumeSuccess,
                on_error: None,
                retry_limit: 3,
            },
        )
        .await;
        assert!(outcome.success);
        assert!(matches!(outcome.reply, Some(Reply::Done)));
    }

    #[tokio::test]
    async fn undecided_for_each_counts_as_success() {
        let connector = FakeConnector::new(|_, _| FakeResponse::Done);
        let stats = Arc::clone(&connector.stats);
        let pool = pool(connector);

        let outcome = run_action(
            &pool,
            ActionSpec {
                main: delete_main(),
                evaluation: Evaluation::ForEach(Box::new(|_| Box::pin(async { None }))),
                on_error: None,
                retry_limit: 3,
            },
        )
        .await;
        assert!(outcome.success);
        assert_eq!(stats.calls().len(), 1);
    }

    #[tokio::test]
    async fn rejecting_verification_consumes_the_full_budget() {
        let connector = FakeConnector::new(|call, _| match call {
            FakeCall::Delete(_) => FakeResponse::Done,
            FakeCall::List(_) => FakeResponse::Entries(vec![]),
            _ => panic!("unexpected call"),
        });
        let stats = Arc::clone(&connector.stats);
        let pool = pool(connector);

        let attempts = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&attempts);
        let outcome = run_action(
            &pool,
            ActionSpec {
                main: delete_main(),
                evaluation: Evaluation::Verify {
                    probe: Box::new(|| {
                        Command::new(Verb::List {
                            path: "/www/a.txt".to_string(),
                        })
                    }),
                    // undecided probe verdicts count as failure
                    accept: Box::new(|_| Box::pin(async { None })),
                },
                on_error: Some(Box::new(move |attempt, error, exhausted| {
                    seen.store(attempt, Ordering::SeqCst);
                    assert!(error.is_none());
                    assert_eq!(exhausted, attempt == 3);
                })),
                retry_limit: 3,
            },
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // each attempt issues the main command and its probe
        assert_eq!(stats.calls().len(), 6);
    }

    #[tokio::test]
    async fn settled_protocol_error_is_reported_each_attempt() {
        let connector = FakeConnector::new(|_, _| {
            FakeResponse::Fail(RemoteError::Reply {
                code: 550,
                message: "no such file".to_string(),
            })
        });
        let pool = pool(connector);

        let codes = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&codes);
        let outcome = run_action(
            &pool,
            ActionSpec {
                main: delete_main(),
                evaluation: Evaluation::AssumeSuccess,
                on_error: Some(Box::new(move |_, error, _| {
                    if let Some(code) = error.and_then(CommandError::reply_code) {
                        seen.fetch_add(u32::from(code), Ordering::SeqCst);
                    }
                })),
                retry_limit: 2,
            },
        )
        .await;
        assert!(!outcome.success);
        assert_eq!(codes.load(Ordering::SeqCst), 1100);
    }
}
