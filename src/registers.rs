//! Register-level model of an MCP23017-family expander.
//!
//! Each board exposes 16 I/O lines split across two 8-bit register
//! halves (A = pins 0-7, B = pins 8-15). Logical bit `n` always maps to
//! bit `n % 8` of half `n / 8`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lowest bus address the A2..A0 strap pins can select.
pub const MIN_BOARD_ADDR: u8 = 0x20;
/// Number of addresses the strap pins can select.
pub const STRAP_ADDR_COUNT: u8 = 8;

/// Highest valid strap address (inclusive).
pub const MAX_BOARD_ADDR: u8 = MIN_BOARD_ADDR + STRAP_ADDR_COUNT - 1;

pub const PIN_COUNT: u8 = 16;
pub const PINS_PER_HALF: u8 = 8;

// Physical register addresses (bank 0 layout).
pub const IODIRA: u8 = 0x00;
pub const IODIRB: u8 = 0x01;
pub const GPIOA: u8 = 0x12;
pub const GPIOB: u8 = 0x13;

/// Size of the register file in bank 0 layout (OLATB = 0x15 is last).
pub const REGISTER_FILE_SIZE: u8 = 0x16;

/// Configuration register, written once per board before first use.
pub const IOCON: u8 = 0x0A;
/// IOCON value the dispatcher programs at board bootstrap.
pub const IOCON_INIT: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("board address 0x{0:02X} outside strap range [0x{MIN_BOARD_ADDR:02X}, 0x{MAX_BOARD_ADDR:02X}]")]
    Board(u8),
    #[error("pin index {0} outside range [0, 15]")]
    Pin(u8),
    #[error("register half {0} outside range [0, 1]")]
    Half(u8),
}

/// 7-bit bus address of one expander, restricted to the strap range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BoardAddress(u8);

impl BoardAddress {
    pub fn new(addr: u8) -> Result<Self, AddressError> {
        if (MIN_BOARD_ADDR..=MAX_BOARD_ADDR).contains(&addr) {
            Ok(Self(addr))
        } else {
            Err(AddressError::Board(addr))
        }
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

/// Logical pin index, 0-15 across both halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinIndex(u8);

impl PinIndex {
    pub fn new(pin: u8) -> Result<Self, AddressError> {
        if pin < PIN_COUNT {
            Ok(Self(pin))
        } else {
            Err(AddressError::Pin(pin))
        }
    }

    pub fn raw(self) -> u8 {
        self.0
    }

    pub fn half(self) -> RegisterHalf {
        if self.0 < PINS_PER_HALF {
            RegisterHalf::A
        } else {
            RegisterHalf::B
        }
    }

    /// Bit position within the owning half.
    pub fn bit(self) -> u8 {
        self.0 % PINS_PER_HALF
    }

    pub fn mask(self) -> u8 {
        1 << self.bit()
    }
}

/// A/B grouping of 8 pins sharing one physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterHalf {
    A,
    B,
}

impl RegisterHalf {
    /// Whole-register verbs select the half by index: 0 = A, 1 = B.
    pub fn from_index(index: u8) -> Result<Self, AddressError> {
        match index {
            0 => Ok(RegisterHalf::A),
            1 => Ok(RegisterHalf::B),
            other => Err(AddressError::Half(other)),
        }
    }
}

/// Logical register types the broker exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterKind {
    /// IODIR: 1 = input, 0 = output.
    Direction,
    /// GPIO: current logic levels.
    State,
}

/// Physical register address for a logical kind/half pair.
pub fn register_address(kind: RegisterKind, half: RegisterHalf) -> u8 {
    match (kind, half) {
        (RegisterKind::Direction, RegisterHalf::A) => IODIRA,
        (RegisterKind::Direction, RegisterHalf::B) => IODIRB,
        (RegisterKind::State, RegisterHalf::A) => GPIOA,
        (RegisterKind::State, RegisterHalf::B) => GPIOB,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_board_address_strap_range() {
        assert!(BoardAddress::new(0x20).is_ok());
        assert!(BoardAddress::new(0x27).is_ok());
        assert_eq!(BoardAddress::new(0x1F), Err(AddressError::Board(0x1F)));
        assert_eq!(BoardAddress::new(0x28), Err(AddressError::Board(0x28)));
    }

    #[test]
    fn test_pin_half_and_bit_mapping() {
        let pin = PinIndex::new(10).unwrap();
        assert_eq!(pin.half(), RegisterHalf::B);
        assert_eq!(pin.bit(), 2);
        assert_eq!(pin.mask(), 0b0000_0100);

        let pin = PinIndex::new(7).unwrap();
        assert_eq!(pin.half(), RegisterHalf::A);
        assert_eq!(pin.bit(), 7);
    }

    #[test]
    fn test_pin_range_rejection() {
        assert!(PinIndex::new(15).is_ok());
        assert_eq!(PinIndex::new(16), Err(AddressError::Pin(16)));
    }

    #[test]
    fn test_register_address_map() {
        assert_eq!(register_address(RegisterKind::Direction, RegisterHalf::A), 0x00);
        assert_eq!(register_address(RegisterKind::Direction, RegisterHalf::B), 0x01);
        assert_eq!(register_address(RegisterKind::State, RegisterHalf::A), 0x12);
        assert_eq!(register_address(RegisterKind::State, RegisterHalf::B), 0x13);
    }

    #[test]
    fn test_half_from_index() {
        assert_eq!(RegisterHalf::from_index(0), Ok(RegisterHalf::A));
        assert_eq!(RegisterHalf::from_index(1), Ok(RegisterHalf::B));
        assert!(RegisterHalf::from_index(2).is_err());
    }
}
