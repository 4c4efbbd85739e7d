//! Shared expiring store for in-flight work.
//!
//! Holds commands awaiting execution (bounded FIFO) and results
//! awaiting pickup (token-keyed, TTL-bound). This is the only shared
//! mutable state in the broker; everything crosses it, nothing survives
//! a restart. Expiry silently removes entries and never reorders the
//! live ones, which is what lets a sluggish bus shed stale user intents
//! instead of queueing them up.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use heapless::{Deque, FnvIndexMap};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;
use thiserror::Error;
use tracing::trace;

use crate::protocol::{Command, CommandValue, PendingResult, Token, Verb};

pub const MAX_PENDING_COMMANDS: usize = 32;
pub const MAX_PENDING_RESULTS: usize = 64;

// FnvIndexMap requires a power-of-two capacity.
const_assert!(MAX_PENDING_RESULTS.is_power_of_two());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("command queue full ({MAX_PENDING_COMMANDS} entries)")]
    QueueFull,
}

/// Non-blocking result lookup outcome.
#[derive(Debug, Clone, Copy)]
pub enum FetchOutcome {
    Ready(PendingResult),
    /// No result under this token (yet). A token that never existed
    /// looks the same; callers poll until their own timeout.
    NotReady,
    /// A result existed but outlived its TTL unread.
    Expired,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub commands_enqueued: u64,
    pub commands_dequeued: u64,
    /// Expired entries discarded during dequeue scans. Not failures.
    pub commands_expired: u64,
    pub results_published: u64,
    pub results_expired: u64,
}

#[derive(Debug, Clone, Copy)]
struct QueuedCommand {
    command: Command,
    ttl: Duration,
}

#[derive(Debug, Clone, Copy)]
struct StoredResult {
    result: PendingResult,
    ttl: Duration,
}

#[derive(Debug)]
struct Inner {
    queue: Deque<QueuedCommand, MAX_PENDING_COMMANDS>,
    results: FnvIndexMap<Token, StoredResult, MAX_PENDING_RESULTS>,
    next_token: Token,
    stats: StoreStats,
}

/// The shared source of truth for pending commands and results.
///
/// All methods take `&self`; share it with `Arc` across submitters and
/// the dispatcher.
#[derive(Debug)]
pub struct CommandStore {
    inner: Mutex<Inner>,
}

impl CommandStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: Deque::new(),
                results: FnvIndexMap::new(),
                next_token: 1,
                stats: StoreStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock means a panicking submitter; the store data
        // itself is still coherent (single-field updates only).
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a command with the given lifetime and return its token.
    pub fn enqueue(&self, verb: Verb, board: u8, arg: u8, ttl: Duration) -> Result<Token, StoreError> {
        let mut inner = self.lock();
        let token = inner.next_token;

        let entry = QueuedCommand {
            command: Command {
                token,
                verb,
                board,
                arg,
                submitted_at: Instant::now(),
            },
            ttl,
        };

        if inner.queue.push_back(entry).is_err() {
            return Err(StoreError::QueueFull);
        }

        inner.next_token += 1;
        inner.stats.commands_enqueued += 1;
        trace!(token, verb = %verb, board, arg, "command enqueued");
        Ok(token)
    }

    /// Remove and return the oldest live command, silently discarding
    /// expired entries encountered along the way. Expired commands are
    /// never handed to a caller.
    pub fn dequeue_next(&self) -> Option<Command> {
        let mut inner = self.lock();
        let now = Instant::now();

        while let Some(entry) = inner.queue.pop_front() {
            if now.duration_since(entry.command.submitted_at) > entry.ttl {
                inner.stats.commands_expired += 1;
                trace!(token = entry.command.token, "command expired unexecuted");
                continue;
            }
            inner.stats.commands_dequeued += 1;
            return Some(entry.command);
        }
        None
    }

    /// Store a result under its originating token, visible for `ttl`.
    pub fn publish_result(&self, token: Token, value: CommandValue, ttl: Duration) {
        let mut inner = self.lock();
        let now = Instant::now();

        inner.prune_expired_results(now);

        // Saturated even after pruning: evict the oldest unread result.
        // A reader that slow would have timed out long ago anyway.
        if inner.results.len() == MAX_PENDING_RESULTS {
            if let Some(oldest) = inner
                .results
                .iter()
                .min_by_key(|(_, stored)| stored.result.produced_at)
                .map(|(token, _)| *token)
            {
                inner.results.remove(&oldest);
                inner.stats.results_expired += 1;
            }
        }

        let stored = StoredResult {
            result: PendingResult {
                token,
                value,
                produced_at: now,
            },
            ttl,
        };
        // Capacity was just ensured above.
        let _ = inner.results.insert(token, stored);
        inner.stats.results_published += 1;
        trace!(token, ?value, "result published");
    }

    /// Non-blocking result lookup. A result stays readable until its
    /// TTL elapses; expired results vanish on first observation.
    pub fn fetch_result(&self, token: Token) -> FetchOutcome {
        let mut inner = self.lock();

        let Some(stored) = inner.results.get(&token).copied() else {
            return FetchOutcome::NotReady;
        };

        if stored.result.produced_at.elapsed() > stored.ttl {
            inner.results.remove(&token);
            inner.stats.results_expired += 1;
            return FetchOutcome::Expired;
        }
        FetchOutcome::Ready(stored.result)
    }

    pub fn pending_commands(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn stats(&self) -> StoreStats {
        self.lock().stats
    }
}

impl Default for CommandStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn prune_expired_results(&mut self, now: Instant) {
        let expired: heapless::Vec<Token, MAX_PENDING_RESULTS> = self
            .results
            .iter()
            .filter(|(_, stored)| now.duration_since(stored.result.produced_at) > stored.ttl)
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            self.results.remove(&token);
            self.stats.results_expired += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG_TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_tokens_are_unique_and_monotonic() {
        let store = CommandStore::new();
        let a = store.enqueue(Verb::SetPin, 0x20, 0, LONG_TTL).unwrap();
        let b = store.enqueue(Verb::ClrPin, 0x20, 0, LONG_TTL).unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_fifo_order_among_live_commands() {
        let store = CommandStore::new();
        let a = store.enqueue(Verb::SetPin, 0x20, 1, LONG_TTL).unwrap();
        let b = store.enqueue(Verb::ClrPin, 0x21, 2, LONG_TTL).unwrap();

        assert_eq!(store.dequeue_next().unwrap().token, a);
        assert_eq!(store.dequeue_next().unwrap().token, b);
        assert!(store.dequeue_next().is_none());
    }

    #[test]
    fn test_expired_commands_are_skipped_silently() {
        let store = CommandStore::new();
        store
            .enqueue(Verb::SetPin, 0x20, 1, Duration::ZERO)
            .unwrap();
        let live = store.enqueue(Verb::ClrPin, 0x20, 1, LONG_TTL).unwrap();

        std::thread::sleep(Duration::from_millis(5));

        // The expired head vanishes; the live entry keeps its position.
        assert_eq!(store.dequeue_next().unwrap().token, live);
        assert_eq!(store.stats().commands_expired, 1);
    }

    #[test]
    fn test_queue_full_is_reported_to_submitter() {
        let store = CommandStore::new();
        for _ in 0..MAX_PENDING_COMMANDS {
            store.enqueue(Verb::GetPin, 0x20, 0, LONG_TTL).unwrap();
        }
        assert_eq!(
            store.enqueue(Verb::GetPin, 0x20, 0, LONG_TTL),
            Err(StoreError::QueueFull)
        );
    }

    #[test]
    fn test_result_round_trip() {
        let store = CommandStore::new();
        let token = store.enqueue(Verb::GetPin, 0x20, 3, LONG_TTL).unwrap();

        assert!(matches!(store.fetch_result(token), FetchOutcome::NotReady));

        store.publish_result(token, CommandValue::Bit(1), LONG_TTL);
        match store.fetch_result(token) {
            FetchOutcome::Ready(result) => {
                assert_eq!(result.token, token);
                assert_eq!(result.value, CommandValue::Bit(1));
            }
            other => panic!("expected ready result, got {other:?}"),
        }
    }

    #[test]
    fn test_unread_result_expires() {
        let store = CommandStore::new();
        store.publish_result(7, CommandValue::Flag(true), Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        assert!(matches!(store.fetch_result(7), FetchOutcome::Expired));
        // Gone after the first expired observation.
        assert!(matches!(store.fetch_result(7), FetchOutcome::NotReady));
    }
}
