//! Ordered fallback chains
//!
//! Bootstrap, image build and git push each have more than one way to
//! succeed. Each way is a [`Strategy`]; [`FallbackChain`] tries them in order
//! and reports a single failure only when every one of them is exhausted.

use async_trait::async_trait;
use thiserror::Error;

/// Outcome of one strategy attempt
#[derive(Debug)]
pub enum Attempt<T> {
    /// The strategy succeeded
    Done(T),
    /// The strategy cannot run here (tool missing, not applicable)
    Unavailable(String),
    /// The strategy ran and failed
    Failed(String),
}

/// One way of achieving a chain's goal
#[async_trait]
pub trait Strategy<C: ?Sized + Sync, T: Send>: Send + Sync {
    fn name(&self) -> &'static str;

    async fn attempt(&self, ctx: &C) -> Attempt<T>;
}

/// Record of a strategy that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub strategy: &'static str,
    pub unavailable: bool,
    pub detail: String,
}

impl std::fmt::Display for AttemptRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let what = if self.unavailable {
            "unavailable"
        } else {
            "failed"
        };
        write!(f, "{} {}: {}", self.strategy, what, self.detail)
    }
}

/// Every strategy in a chain was exhausted
#[derive(Error, Debug, Clone)]
#[error("{label}: all methods exhausted ({})", summary(.attempts))]
pub struct ChainFailure {
    pub label: &'static str,
    pub attempts: Vec<AttemptRecord>,
}

impl ChainFailure {
    /// Whether at least one strategy actually ran
    pub fn any_ran(&self) -> bool {
        self.attempts.iter().any(|a| !a.unavailable)
    }
}

fn summary(attempts: &[AttemptRecord]) -> String {
    if attempts.is_empty() {
        return "no methods configured".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A successful chain run
#[derive(Debug)]
pub struct ChainSuccess<T> {
    /// Name of the strategy that succeeded
    pub strategy: &'static str,
    pub value: T,
    /// Strategies tried before the successful one
    pub skipped: Vec<AttemptRecord>,
}

/// Strategies tried in a fixed order
pub struct FallbackChain<C: ?Sized + Sync, T: Send> {
    label: &'static str,
    strategies: Vec<Box<dyn Strategy<C, T>>>,
}

impl<C: ?Sized + Sync, T: Send> FallbackChain<C, T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            strategies: Vec::new(),
        }
    }

    pub fn with(mut self, strategy: impl Strategy<C, T> + 'static) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &C) -> std::result::Result<ChainSuccess<T>, ChainFailure> {
        let mut records = Vec::new();
        for strategy in &self.strategies {
            tracing::debug!("{}: trying {}", self.label, strategy.name());
            match strategy.attempt(ctx).await {
                Attempt::Done(value) => {
                    tracing::debug!("{}: {} succeeded", self.label, strategy.name());
                    return Ok(ChainSuccess {
                        strategy: strategy.name(),
                        value,
                        skipped: records,
                    });
                }
                Attempt::Unavailable(detail) => {
                    tracing::debug!("{}: {} unavailable: {}", self.label, strategy.name(), detail);
                    records.push(AttemptRecord {
                        strategy: strategy.name(),
                        unavailable: true,
                        detail,
                    });
                }
                Attempt::Failed(detail) => {
                    tracing::warn!("{}: {} failed", self.label, strategy.name());
                    records.push(AttemptRecord {
                        strategy: strategy.name(),
                        unavailable: false,
                        detail,
                    });
                }
            }
        }
        Err(ChainFailure {
            label: self.label,
            attempts: records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        result: fn() -> Attempt<u32>,
    }

    #[async_trait]
    impl Strategy<AtomicUsize, u32> for Fixed {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn attempt(&self, ctx: &AtomicUsize) -> Attempt<u32> {
            ctx.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    #[tokio::test]
    async fn test_first_success_stops_chain() {
        let chain = FallbackChain::new("demo")
            .with(Fixed {
                name: "a",
                result: || Attempt::Unavailable("no tool".into()),
            })
            .with(Fixed {
                name: "b",
                result: || Attempt::Done(7),
            })
            .with(Fixed {
                name: "c",
                result: || Attempt::Done(9),
            });
        let calls = AtomicUsize::new(0);
        let ok = chain.run(&calls).await.unwrap();
        assert_eq!(ok.value, 7);
        assert_eq!(ok.strategy, "b");
        assert_eq!(ok.skipped.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_exhausted_chain_reports_every_attempt() {
        let chain = FallbackChain::new("push")
            .with(Fixed {
                name: "agent",
                result: || Attempt::Failed("denied".into()),
            })
            .with(Fixed {
                name: "direct",
                result: || Attempt::Failed("denied again".into()),
            });
        let calls = AtomicUsize::new(0);
        let err = chain.run(&calls).await.unwrap_err();
        assert_eq!(err.attempts.len(), 2);
        assert!(err.any_ran());
        let msg = err.to_string();
        assert!(msg.contains("agent failed: denied"));
        assert!(msg.contains("direct failed: denied again"));
    }

    #[tokio::test]
    async fn test_all_unavailable() {
        let chain = FallbackChain::new("bootstrap").with(Fixed {
            name: "only",
            result: || Attempt::Unavailable("missing".into()),
        });
        let err = chain.run(&AtomicUsize::new(0)).await.unwrap_err();
        assert!(!err.any_ran());
    }
}
