//! The single authority executing commands against the bus.
//!
//! One dispatcher drains the store in FIFO order and performs at most
//! one bus transaction at a time, which is what makes the non-reentrant
//! bus safe to share across unsynchronized clients. Failures of any
//! kind (bad address, absent board, bus timeout) are published as
//! result data for that one command; the loop itself never propagates
//! them and never stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::bus::{BusDriver, BusError};
use crate::protocol::{Command, CommandValue, Verb};
use crate::registers::{
    register_address, AddressError, BoardAddress, PinIndex, RegisterHalf, RegisterKind,
    IOCON, IOCON_INIT, IODIRA, STRAP_ADDR_COUNT,
};
use crate::store::CommandStore;

#[derive(Debug, Clone, Copy)]
pub struct DispatcherConfig {
    /// Sleep between polls when the queue is empty.
    pub idle_wait: Duration,
    /// Lifetime of published results.
    pub result_ttl: Duration,
    /// A transaction running longer than this is failed even if the
    /// driver eventually came back with data.
    pub bus_deadline: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            idle_wait: Duration::from_millis(20),
            result_ttl: Duration::from_millis(1500),
            bus_deadline: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct DispatcherStats {
    pub commands_executed: u64,
    /// Commands answered with a failure value (bus fault or deadline).
    pub commands_failed: u64,
    /// Commands rejected before touching the bus (address validation).
    pub commands_invalid: u64,
}

pub type SharedDispatcherStats = Arc<Mutex<DispatcherStats>>;

pub struct Dispatcher<B: BusDriver> {
    store: Arc<CommandStore>,
    bus: B,
    config: DispatcherConfig,
    shutdown: Arc<AtomicBool>,
    stats: SharedDispatcherStats,
    /// Boards whose IOCON has been programmed this run. The only
    /// cross-request state the dispatcher holds.
    managed_boards: heapless::Vec<u8, { STRAP_ADDR_COUNT as usize }>,
}

impl<B: BusDriver> Dispatcher<B> {
    pub fn new(
        store: Arc<CommandStore>,
        bus: B,
        config: DispatcherConfig,
        shutdown: Arc<AtomicBool>,
        stats: SharedDispatcherStats,
    ) -> Self {
        Self {
            store,
            bus,
            config,
            shutdown,
            stats,
            managed_boards: heapless::Vec::new(),
        }
    }

    /// Cooperative polling loop: drain, execute, publish, idle-sleep.
    /// Returns when the shutdown flag is raised.
    pub fn run(&mut self) {
        debug!("dispatcher started");
        while !self.shutdown.load(Ordering::Relaxed) {
            if !self.poll_once() {
                std::thread::sleep(self.config.idle_wait);
            }
        }
        debug!("dispatcher stopped");
    }

    /// Execute at most one queued command. Returns false if the queue
    /// held nothing live.
    pub fn poll_once(&mut self) -> bool {
        let Some(command) = self.store.dequeue_next() else {
            return false;
        };

        let value = self.execute(command);
        self.store
            .publish_result(command.token, value, self.config.result_ttl);
        true
    }

    fn execute(&mut self, command: Command) -> CommandValue {
        let started = Instant::now();
        let value = self.run_verb(&command);
        let elapsed = started.elapsed();

        // A command that was dequeued live runs to completion, but a
        // transaction that blew past the bus deadline is reported as a
        // failure regardless of what the driver returned.
        if elapsed > self.config.bus_deadline {
            warn!(
                token = command.token,
                verb = %command.verb,
                ?elapsed,
                "bus transaction exceeded deadline, failing command"
            );
            let mut stats = self.lock_stats();
            stats.commands_failed += 1;
            stats.commands_executed += 1;
            return command.verb.failure_value();
        }

        self.lock_stats().commands_executed += 1;
        trace!(token = command.token, verb = %command.verb, ?value, "command executed");
        value
    }

    fn lock_stats(&self) -> MutexGuard<'_, DispatcherStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate the command against the register model and run it.
    /// Out-of-range fields resolve to the verb's failure value, never
    /// to an error out of the loop.
    fn run_verb(&mut self, command: &Command) -> CommandValue {
        let board = match BoardAddress::new(command.board) {
            Ok(board) => board,
            Err(err) => return self.reject(command, err),
        };

        match command.verb {
            Verb::Identify => CommandValue::Flag(self.probe_board(board)),
            Verb::GetDirBit => self.read_bit(command, board, RegisterKind::Direction),
            Verb::GetPin => self.read_bit(command, board, RegisterKind::State),
            Verb::GetDirReg => self.read_register_half(command, board, RegisterKind::Direction),
            Verb::GetIoReg => self.read_register_half(command, board, RegisterKind::State),
            Verb::SetDirBit => self.write_bit(command, board, RegisterKind::Direction, true),
            Verb::ClrDirBit => self.write_bit(command, board, RegisterKind::Direction, false),
            Verb::SetPin => self.write_bit(command, board, RegisterKind::State, true),
            Verb::ClrPin => self.write_bit(command, board, RegisterKind::State, false),
        }
    }

    fn reject(&mut self, command: &Command, err: AddressError) -> CommandValue {
        debug!(token = command.token, verb = %command.verb, %err, "command rejected");
        self.lock_stats().commands_invalid += 1;
        command.verb.failure_value()
    }

    fn read_bit(&mut self, command: &Command, board: BoardAddress, kind: RegisterKind) -> CommandValue {
        let pin = match PinIndex::new(command.arg) {
            Ok(pin) => pin,
            Err(err) => return self.reject(command, err),
        };

        match self.read_half(board, kind, pin.half()) {
            Ok(byte) => CommandValue::Bit(u8::from(byte & pin.mask() != 0)),
            Err(err) => self.bus_failure(command, err),
        }
    }

    fn read_register_half(
        &mut self,
        command: &Command,
        board: BoardAddress,
        kind: RegisterKind,
    ) -> CommandValue {
        let half = match RegisterHalf::from_index(command.arg) {
            Ok(half) => half,
            Err(err) => return self.reject(command, err),
        };

        match self.read_half(board, kind, half) {
            Ok(byte) => CommandValue::Byte(byte),
            Err(err) => self.bus_failure(command, err),
        }
    }

    /// Read-modify-write one bit of a direction or state register.
    fn write_bit(
        &mut self,
        command: &Command,
        board: BoardAddress,
        kind: RegisterKind,
        set: bool,
    ) -> CommandValue {
        let pin = match PinIndex::new(command.arg) {
            Ok(pin) => pin,
            Err(err) => return self.reject(command, err),
        };

        let outcome = self.read_half(board, kind, pin.half()).and_then(|current| {
            let updated = if set {
                current | pin.mask()
            } else {
                current & !pin.mask()
            };
            let register = register_address(kind, pin.half());
            self.bus.write_register(board.raw(), register, updated)
        });

        match outcome {
            Ok(()) => CommandValue::Flag(true),
            Err(err) => self.bus_failure(command, err),
        }
    }

    fn read_half(
        &mut self,
        board: BoardAddress,
        kind: RegisterKind,
        half: RegisterHalf,
    ) -> Result<u8, BusError> {
        self.ensure_board(board)?;
        self.bus
            .read_register(board.raw(), register_address(kind, half))
    }

    /// IDENTIFY touches the bus on every probe so presence reflects the
    /// current state of the segment, not a cached initialization. A
    /// board that stops answering is dropped from the managed set, so a
    /// reattached board gets IOCON reprogrammed on next contact.
    fn probe_board(&mut self, board: BoardAddress) -> bool {
        let outcome = if self.managed_boards.contains(&board.raw()) {
            self.bus.read_register(board.raw(), IODIRA).map(|_| ())
        } else {
            self.ensure_board(board)
        };

        if let Err(err) = outcome {
            debug!(board = board.raw(), %err, "board probe failed");
            self.managed_boards.retain(|addr| *addr != board.raw());
            return false;
        }
        true
    }

    /// Program IOCON on first contact with a board. Boards that never
    /// acknowledge are retried on the next command addressing them.
    fn ensure_board(&mut self, board: BoardAddress) -> Result<(), BusError> {
        if self.managed_boards.contains(&board.raw()) {
            return Ok(());
        }

        self.bus.write_register(board.raw(), IOCON, IOCON_INIT)?;
        // Probe read: a board that acks the write but cannot be read
        // back is not usable.
        self.bus.read_register(board.raw(), IODIRA)?;
        // Capacity equals the strap address count, so this cannot fail.
        let _ = self.managed_boards.push(board.raw());
        debug!(board = board.raw(), "board initialized (IOCON programmed)");
        Ok(())
    }

    fn bus_failure(&mut self, command: &Command, err: BusError) -> CommandValue {
        warn!(token = command.token, verb = %command.verb, board = command.board, %err, "bus transaction failed");
        self.lock_stats().commands_failed += 1;
        command.verb.failure_value()
    }
}
