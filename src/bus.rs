//! Bus driver boundary.
//!
//! The broker treats the bus as an opaque synchronous capability: read
//! a register byte, write a register byte. Real deployments plug in an
//! I2C-backed driver; tests and the bundled server run against
//! [`SimulatedBus`]. Drivers must bound their own transactions and
//! report a hang as [`BusError::Timeout`] rather than blocking forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::registers::{IODIRA, IODIRB, REGISTER_FILE_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no acknowledge from board 0x{0:02X}")]
    Nack(u8),
    #[error("bus transaction exceeded its deadline")]
    Timeout,
}

/// Synchronous register access to one bus segment. The dispatcher is
/// the only caller; `&mut self` keeps that exclusivity in the types.
pub trait BusDriver: Send {
    fn read_register(&mut self, board: u8, register: u8) -> Result<u8, BusError>;
    fn write_register(&mut self, board: u8, register: u8, value: u8) -> Result<(), BusError>;
}

#[derive(Debug, Clone, Copy)]
struct SimBoard {
    regs: [u8; REGISTER_FILE_SIZE as usize],
}

impl SimBoard {
    fn new() -> Self {
        let mut regs = [0u8; REGISTER_FILE_SIZE as usize];
        // Power-on reset: all pins are inputs.
        regs[IODIRA as usize] = 0xFF;
        regs[IODIRB as usize] = 0xFF;
        Self { regs }
    }
}

#[derive(Debug)]
struct SimInner {
    boards: HashMap<u8, SimBoard>,
    latency: Duration,
    fail_next: u32,
    in_flight: bool,
    overlap_detected: bool,
    transactions: u64,
}

/// In-memory stand-in for a bus segment with expander boards on it.
///
/// Cloning shares the underlying state, so a test can hand one handle
/// to the broker and keep another for inspection and fault injection.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    inner: Arc<Mutex<SimInner>>,
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                boards: HashMap::new(),
                latency: Duration::ZERO,
                fail_next: 0,
                in_flight: false,
                overlap_detected: false,
                transactions: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a board at the given address, registers at power-on reset.
    pub fn add_board(&self, addr: u8) {
        self.lock().boards.insert(addr, SimBoard::new());
    }

    /// Detach a board; subsequent transactions to it see no acknowledge.
    pub fn remove_board(&self, addr: u8) {
        self.lock().boards.remove(&addr);
    }

    /// Per-transaction latency, for exercising deadline handling.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Fail the next `count` transactions with a timeout.
    pub fn fail_next_transactions(&self, count: u32) {
        self.lock().fail_next = count;
    }

    /// Poke a register directly, bypassing the transaction path. Test
    /// setup only; no-op for absent boards.
    pub fn set_register(&self, addr: u8, register: u8, value: u8) {
        if let Some(board) = self.lock().boards.get_mut(&addr) {
            board.regs[register as usize] = value;
        }
    }

    /// Raw register inspection for assertions.
    pub fn register(&self, addr: u8, register: u8) -> Option<u8> {
        self.lock()
            .boards
            .get(&addr)
            .map(|board| board.regs[register as usize])
    }

    pub fn transaction_count(&self) -> u64 {
        self.lock().transactions
    }

    /// True if two transactions ever overlapped. With a correctly
    /// serialized dispatcher this never trips, no matter how many
    /// clients submit concurrently.
    pub fn overlap_detected(&self) -> bool {
        self.lock().overlap_detected
    }

    /// Marks the transaction window and returns the latency to spend
    /// outside the lock, so overlap detection actually observes
    /// concurrent callers instead of serializing them itself.
    fn begin_transaction(&self) -> Duration {
        let mut inner = self.lock();
        if inner.in_flight {
            inner.overlap_detected = true;
        }
        inner.in_flight = true;
        inner.transactions += 1;
        inner.latency
    }

    fn finish_transaction<T>(&self, outcome: Result<T, BusError>) -> Result<T, BusError> {
        let mut inner = self.lock();
        inner.in_flight = false;
        outcome
    }
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusDriver for SimulatedBus {
    fn read_register(&mut self, board: u8, register: u8) -> Result<u8, BusError> {
        let latency = self.begin_transaction();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let outcome = {
            let mut inner = self.lock();
            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                Err(BusError::Timeout)
            } else {
                inner
                    .boards
                    .get(&board)
                    .map(|b| b.regs[register as usize])
                    .ok_or(BusError::Nack(board))
            }
        };
        debug!(board, register, ?outcome, "simulated bus read");
        self.finish_transaction(outcome)
    }

    fn write_register(&mut self, board: u8, register: u8, value: u8) -> Result<(), BusError> {
        let latency = self.begin_transaction();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }

        let outcome = {
            let mut inner = self.lock();
            if inner.fail_next > 0 {
                inner.fail_next -= 1;
                Err(BusError::Timeout)
            } else {
                match inner.boards.get_mut(&board) {
                    Some(b) => {
                        b.regs[register as usize] = value;
                        // GPIO writes land on the output latch; reads of
                        // GPIO reflect driven outputs in this model.
                        Ok(())
                    }
                    None => Err(BusError::Nack(board)),
                }
            }
        };
        debug!(board, register, value, ?outcome, "simulated bus write");
        self.finish_transaction(outcome)
    }
}
