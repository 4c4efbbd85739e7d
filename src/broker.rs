//! Client-facing broker context: configuration, worker lifecycle, and
//! the submit / submit-and-wait entry points.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::bus::BusDriver;
use crate::dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, SharedDispatcherStats};
use crate::protocol::{CommandValue, Token, Verb};
use crate::store::{CommandStore, FetchOutcome, StoreError, StoreStats};

pub const DEFAULT_COMMAND_TTL_MS: u64 = 1500;
pub const DEFAULT_RESULT_TTL_MS: u64 = 1500;

#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    /// Lifetime of a queued command before it silently vanishes.
    pub command_ttl: Duration,
    /// Lifetime of an unread result.
    pub result_ttl: Duration,
    /// Poll cadence of `submit_and_wait`.
    pub result_poll_interval: Duration,
    /// Dispatcher sleep when the queue is empty.
    pub idle_wait: Duration,
    /// Per-transaction bus deadline.
    pub bus_deadline: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            command_ttl: Duration::from_millis(DEFAULT_COMMAND_TTL_MS),
            result_ttl: Duration::from_millis(DEFAULT_RESULT_TTL_MS),
            result_poll_interval: Duration::from_millis(10),
            idle_wait: Duration::from_millis(20),
            bus_deadline: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    /// No result arrived in time. Distinct from a hardware-reported
    /// false/zero: this is "no answer", not "negative answer".
    #[error("no result arrived within {0:?}")]
    Timeout(Duration),
    #[error("broker worker already running")]
    AlreadyRunning,
    #[error("failed to spawn dispatcher thread")]
    WorkerSpawn(#[source] std::io::Error),
}

/// Combined counters for the stats query surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BrokerStats {
    pub store: StoreStats,
    pub dispatcher: DispatcherStats,
}

/// The broker context object: owns the store, the configuration, and
/// (once started) the dispatcher worker thread.
///
/// Submission works whether or not the worker runs; commands submitted
/// while it is down simply expire, which is the intended behavior for
/// a broker that is restarting.
pub struct Broker {
    config: BrokerConfig,
    store: Arc<CommandStore>,
    dispatcher_stats: SharedDispatcherStats,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            store: Arc::new(CommandStore::new()),
            dispatcher_stats: Arc::new(Mutex::new(DispatcherStats::default())),
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Spawn the dispatcher thread that owns `bus` exclusively.
    pub fn start<B: BusDriver + 'static>(&mut self, bus: B) -> Result<(), BrokerError> {
        if self.worker.is_some() {
            return Err(BrokerError::AlreadyRunning);
        }

        self.shutdown.store(false, Ordering::Relaxed);
        let mut dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            bus,
            DispatcherConfig {
                idle_wait: self.config.idle_wait,
                result_ttl: self.config.result_ttl,
                bus_deadline: self.config.bus_deadline,
            },
            Arc::clone(&self.shutdown),
            Arc::clone(&self.dispatcher_stats),
        );

        let handle = std::thread::Builder::new()
            .name("pinbroker-dispatcher".into())
            .spawn(move || dispatcher.run())
            .map_err(BrokerError::WorkerSpawn)?;

        self.worker = Some(handle);
        debug!("broker worker started");
        Ok(())
    }

    /// Stop the worker and wait for it to finish its in-flight command.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                warn!("dispatcher thread terminated abnormally");
            }
            debug!("broker worker stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Fire-and-forget submission. The returned token may be ignored.
    pub fn submit(&self, verb: Verb, board: u8, arg: u8) -> Result<Token, BrokerError> {
        let token = self
            .store
            .enqueue(verb, board, arg, self.config.command_ttl)?;
        Ok(token)
    }

    /// Submit, then poll for the result until `timeout` elapses.
    ///
    /// Blocks only the calling thread. A timeout never retracts the
    /// command: it may still execute later, its result then expiring
    /// unread.
    pub fn submit_and_wait(
        &self,
        verb: Verb,
        board: u8,
        arg: u8,
        timeout: Duration,
    ) -> Result<CommandValue, BrokerError> {
        let token = self.submit(verb, board, arg)?;
        let deadline = Instant::now() + timeout;

        loop {
            match self.store.fetch_result(token) {
                FetchOutcome::Ready(result) => return Ok(result.value),
                FetchOutcome::NotReady | FetchOutcome::Expired => {
                    if Instant::now() >= deadline {
                        return Err(BrokerError::Timeout(timeout));
                    }
                    std::thread::sleep(self.config.result_poll_interval);
                }
            }
        }
    }

    /// Non-blocking poll for a previously submitted command, for
    /// callers that manage their own wait cadence.
    pub fn fetch_result(&self, token: Token) -> FetchOutcome {
        self.store.fetch_result(token)
    }

    pub fn pending_commands(&self) -> usize {
        self.store.pending_commands()
    }

    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            store: self.store.stats(),
            dispatcher: *self
                .dispatcher_stats
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.stop();
    }
}
