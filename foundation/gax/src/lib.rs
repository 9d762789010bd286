//! Retry, backoff and polling primitives used by `td-client`.
//!
//! Nothing in this crate knows about HTTP. The transport decides which outcomes
//! are retryable through [`retry::Predicate`], and long-running operations decide
//! what a terminal state is while [`poll::Poller`] owns interval and timeout
//! bookkeeping. All waiting goes through a [`clock::Clock`] so callers can
//! substitute virtual time.

pub mod clock;
pub mod poll;
pub mod retry;
