//! # Mock Register HAL
//!
//! A scriptable stand-in for the SPI/GPIO surface, used by the driver
//! tests. Register writes land in a shadow register file with the chip's
//! write-1-to-clear IRQ semantics; FIFO reads pop from a scripted packet
//! buffer; every access is journaled so tests can assert exact register
//! sequences. DIO0 edges are injected through [`MockHal::fire_dio0`].

use crate::radio::sx1276::irq::IRQ_TX_DONE;
use crate::radio::sx1276::registers::{
    LONG_RANGE_MODE, MODE_TX, REG_FIFO, REG_IRQ_FLAGS, REG_OP_MODE,
};
use crate::radio::sx1276::hal::{HalError, RadioHal};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// One journaled register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read { addr: u8, value: u8 },
    Write { addr: u8, value: u8 },
}

struct MockState {
    regs: [u8; 128],
    journal: Vec<Access>,
    fifo_rx: VecDeque<u8>,
    fifo_tx: Vec<u8>,
    /// Raise TxDone as soon as the chip enters TX mode.
    auto_tx_done: bool,
    /// Make every transfer fail, simulating a dead bus.
    fail_io: bool,
    reset_pulses: u32,
    dio0: Option<mpsc::UnboundedSender<()>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            regs: [0; 128],
            journal: Vec::new(),
            fifo_rx: VecDeque::new(),
            fifo_tx: Vec::new(),
            auto_tx_done: false,
            fail_io: false,
            reset_pulses: 0,
            dio0: None,
        }
    }
}

/// Shared-state mock of [`RadioHal`].
#[derive(Clone, Default)]
pub struct MockHal {
    state: Arc<Mutex<MockState>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preload a register value (e.g. the version register).
    pub fn set_reg(&self, addr: u8, value: u8) {
        self.state.lock().unwrap().regs[addr as usize] = value;
    }

    /// Current shadow value of a register.
    pub fn reg(&self, addr: u8) -> u8 {
        self.state.lock().unwrap().regs[addr as usize]
    }

    /// Script the bytes the FIFO register returns on successive reads.
    pub fn load_fifo_rx(&self, bytes: &[u8]) {
        self.state.lock().unwrap().fifo_rx.extend(bytes.iter().copied());
    }

    /// Bytes the driver streamed into the FIFO register.
    pub fn fifo_tx(&self) -> Vec<u8> {
        self.state.lock().unwrap().fifo_tx.clone()
    }

    /// Raise TxDone automatically whenever TX mode is entered.
    pub fn set_auto_tx_done(&self, on: bool) {
        self.state.lock().unwrap().auto_tx_done = on;
    }

    /// Fail every subsequent transfer.
    pub fn set_fail_io(&self, on: bool) {
        self.state.lock().unwrap().fail_io = on;
    }

    /// Number of reset pulses seen.
    pub fn reset_pulses(&self) -> u32 {
        self.state.lock().unwrap().reset_pulses
    }

    /// Full access journal.
    pub fn journal(&self) -> Vec<Access> {
        self.state.lock().unwrap().journal.clone()
    }

    /// Every value written to one register, in order.
    pub fn writes_to(&self, addr: u8) -> Vec<u8> {
        self.state
            .lock()
            .unwrap()
            .journal
            .iter()
            .filter_map(|a| match a {
                Access::Write { addr: a, value } if *a == addr => Some(*value),
                _ => None,
            })
            .collect()
    }

    /// Inject a DIO0 rising edge. Returns false if no receiver is
    /// attached (driver gone).
    pub fn fire_dio0(&self) -> bool {
        match &self.state.lock().unwrap().dio0 {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

impl RadioHal for MockHal {
    fn read_register(&mut self, addr: u8) -> Result<u8, HalError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_io {
            return Err(HalError::Spi("mock bus fault".into()));
        }
        let value = if addr == REG_FIFO {
            state.fifo_rx.pop_front().unwrap_or(0)
        } else {
            state.regs[addr as usize]
        };
        state.journal.push(Access::Read { addr, value });
        Ok(value)
    }

    fn write_register(&mut self, addr: u8, value: u8) -> Result<(), HalError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_io {
            return Err(HalError::Spi("mock bus fault".into()));
        }
        state.journal.push(Access::Write { addr, value });
        match addr {
            // IRQ flags clear on write-1
            REG_IRQ_FLAGS => {
                state.regs[REG_IRQ_FLAGS as usize] &= !value;
            }
            REG_FIFO => {
                state.fifo_tx.push(value);
            }
            REG_OP_MODE => {
                state.regs[REG_OP_MODE as usize] = value;
                if value == LONG_RANGE_MODE | MODE_TX && state.auto_tx_done {
                    state.regs[REG_IRQ_FLAGS as usize] |= IRQ_TX_DONE;
                }
            }
            _ => {
                state.regs[addr as usize] = value;
            }
        }
        Ok(())
    }

    fn reset_pulse(&mut self) -> Result<(), HalError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_io {
            return Err(HalError::Gpio("mock reset fault".into()));
        }
        state.reset_pulses += 1;
        Ok(())
    }

    fn attach_dio0(&mut self, edges: mpsc::UnboundedSender<()>) -> Result<(), HalError> {
        self.state.lock().unwrap().dio0 = Some(edges);
        Ok(())
    }
}
