//! Host Serial UART (Intel 8251)
//!
//! The VT100's communication port: an 8251 USART plus the baud-rate
//! generator, at three IO ports:
//!
//! | Port | Read        | Write            |
//! |------|-------------|------------------|
//! | 0x00 | Received data | Transmit data  |
//! | 0x01 | Status      | Mode, then command |
//! | 0x02 | —           | Baud-rate dial (RX low nibble, TX high) |
//!
//! ## Mode/command sequencing
//!
//! After reset the 8251 expects a MODE byte on the control port (baud
//! factor, data bits, parity, stop bits); every control write after that is
//! a COMMAND until a command with the internal-reset bit puts it back into
//! mode-expecting state.
//!
//! ## Timing
//!
//! Transmit and receive pace are real: a byte occupies the line for
//! start + data + parity + stop bit times at the programmed rate, and the
//! ready bits come back through cycle-countdown timers rather than
//! instantly. The ROM's pacing loops (and XON/XOFF auto-flow, when enabled)
//! depend on this.
//!
//! ## Peer connection
//!
//! A UART can be wired to a peer — another instance, or any
//! [`SerialPeer`] the host provides. Delivery is synchronous: `transmit`
//! invokes the peer's `receive_data` in the same tick, and the peer buffers
//! and paces it from there. Null-modem wiring swaps RTS→CTS and
//! DTR→(DSR|CD) on delivery.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::cpu::IntrLine;
use crate::time::Time;

/// 8251 status-register bits (port 0x01 read).
pub mod status {
    /// Transmitter can accept a byte.
    pub const XMIT_READY: u8 = 0x01;
    /// Receiver holds an unread byte.
    pub const RECV_FULL: u8 = 0x02;
    /// Transmit shift register idle.
    pub const XMIT_EMPTY: u8 = 0x04;
    pub const PARITY_ERROR: u8 = 0x08;
    pub const OVERRUN_ERROR: u8 = 0x10;
    pub const FRAMING_ERROR: u8 = 0x20;
    pub const BREAK_DETECT: u8 = 0x40;
    /// Data set ready (modem line).
    pub const DSR: u8 = 0x80;
}

/// 8251 command-byte bits (port 0x01 write once mode is set).
pub mod command {
    pub const TX_ENABLE: u8 = 0x01;
    pub const DTR: u8 = 0x02;
    pub const RX_ENABLE: u8 = 0x04;
    pub const SEND_BREAK: u8 = 0x08;
    pub const ERROR_RESET: u8 = 0x10;
    pub const RTS: u8 = 0x20;
    /// Return to mode-expecting state.
    pub const INTERNAL_RESET: u8 = 0x40;
    pub const HUNT_MODE: u8 = 0x80;
}

/// 8251 mode-byte fields (first port 0x01 write).
pub mod mode {
    /// Baud factor (sync, 1x, 16x, 64x).
    pub const BAUD_FACTOR: u8 = 0x03;
    /// Data bits: 5 + field.
    pub const DATA_BITS: u8 = 0x0C;
    pub const PARITY_ENABLE: u8 = 0x10;
    pub const EVEN_PARITY: u8 = 0x20;
    /// Stop bits: 01 = 1, 10 = 1.5, 11 = 2.
    pub const STOP_BITS: u8 = 0xC0;
}

/// RS-232 line bits in the 32-bit status word exchanged between peers.
pub mod rs232 {
    pub const RTS: u32 = 0x0000_0010;
    pub const CTS: u32 = 0x0000_0020;
    pub const DSR: u32 = 0x0000_0040;
    pub const CD: u32 = 0x0000_0100;
    pub const DTR: u32 = 0x0010_0000;
    pub const RI: u32 = 0x0040_0000;
}

/// The 16-position baud-rate dial (VT100 SET-UP B), in bits per second.
pub const BAUD_TABLE: [f64; 16] = [
    50.0, 75.0, 110.0, 134.5, 150.0, 200.0, 300.0, 600.0, 1200.0, 1800.0, 2000.0, 2400.0,
    3600.0, 4800.0, 9600.0, 19200.0,
];

/// XON/XOFF flow-control bytes.
pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;

/// Default CPU interrupt level for received data.
pub const SERIAL_INTR_LEVEL: u8 = 2;

/// Far side of a serial connection.
pub trait SerialPeer {
    /// A byte arrives from the wire.
    fn receive_data(&mut self, data: u8);
    /// The RS-232 status lines changed.
    fn receive_status(&mut self, pins: u32) {
        let _ = pins;
    }
}

/// Serial UART configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// CPU interrupt level for received data.
    pub irq_level: u8,
    /// Honor XON/XOFF sent by the CPU.
    pub auto_flow: bool,
    /// Swap RTS→CTS and DTR→(DSR|CD) when delivering status to the peer.
    pub null_modem: bool,
    /// Peer device id, resolved by the machine after construction
    /// (`"<sourceId>-><targetId>"` in full form; the target id suffices).
    pub connection: Option<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            irq_level: SERIAL_INTR_LEVEL,
            auto_flow: false,
            null_modem: true,
            connection: None,
        }
    }
}

/// Persisted serial-UART state.
#[derive(Serialize, Deserialize)]
pub struct SerialState {
    pub id: String,
    pub version: u32,
    pub ready: bool,
    pub data_in: u8,
    pub data_out: u8,
    pub status: u8,
    pub mode: u8,
    pub cmd: u8,
    pub baud_rates: u8,
    pub auto_stop: bool,
    pub recv_fifo: Vec<u8>,
}

/// State-format version for [`SerialState`].
pub const SERIAL_STATE_VERSION: u32 = 1;

/// The 8251 and its pacing timers.
pub struct Serial {
    /// False: next control write is MODE. True: control writes are COMMANDs.
    ready: bool,
    data_in: u8,
    data_out: u8,
    status: u8,
    mode: u8,
    cmd: u8,
    baud_rates: u8,
    auto_flow: bool,
    /// CPU sent XOFF: hold received data until XON.
    auto_stop: bool,
    null_modem: bool,
    irq_level: u8,
    recv_fifo: VecDeque<u8>,
    timer_transmit: usize,
    timer_receive: usize,
    time: Time,
    intr: IntrLine,
    peer: Option<Weak<RefCell<dyn SerialPeer>>>,
}

impl Serial {
    #[must_use]
    pub fn new(time: Time, intr: IntrLine, config: &SerialConfig) -> Self {
        Self {
            ready: false,
            data_in: 0,
            data_out: 0,
            status: status::XMIT_READY | status::XMIT_EMPTY,
            mode: 0,
            cmd: 0,
            baud_rates: 0,
            auto_flow: config.auto_flow,
            auto_stop: false,
            null_modem: config.null_modem,
            irq_level: config.irq_level & 0x07,
            recv_fifo: VecDeque::new(),
            timer_transmit: 0,
            timer_receive: 0,
            time,
            intr,
            peer: None,
        }
    }

    /// Registers the pacing timers. Must run once the UART is behind its
    /// `Rc` so the callbacks can reach it.
    pub fn init_timers(this: &Rc<RefCell<Self>>) {
        let time = this.borrow().time.clone();
        let uart = Rc::clone(this);
        let transmit = time.add_timer(
            "serial-transmit",
            Rc::new(move || uart.borrow_mut().on_transmit_timer()),
            None,
        );
        let uart = Rc::clone(this);
        let receive = time.add_timer(
            "serial-receive",
            Rc::new(move || uart.borrow_mut().on_receive_timer()),
            None,
        );
        let mut uart = this.borrow_mut();
        uart.timer_transmit = transmit;
        uart.timer_receive = receive;
    }

    /// Wires two UARTs back to back. The `null_modem` flag of each side's
    /// config governs how its outgoing status lines land on the other.
    pub fn connect(a: &Rc<RefCell<Self>>, b: &Rc<RefCell<Self>>) {
        let peer_a: Rc<RefCell<dyn SerialPeer>> = Rc::clone(b) as Rc<RefCell<dyn SerialPeer>>;
        let peer_b: Rc<RefCell<dyn SerialPeer>> = Rc::clone(a) as Rc<RefCell<dyn SerialPeer>>;
        a.borrow_mut().peer = Some(Rc::downgrade(&peer_a));
        b.borrow_mut().peer = Some(Rc::downgrade(&peer_b));
    }

    /// Wires this UART to an arbitrary host-side peer.
    pub fn set_peer(&mut self, peer: &Rc<RefCell<dyn SerialPeer>>) {
        self.peer = Some(Rc::downgrade(peer));
    }

    pub fn reset(&mut self) {
        self.ready = false;
        self.data_in = 0;
        self.data_out = 0;
        self.status = status::XMIT_READY | status::XMIT_EMPTY;
        self.mode = 0;
        self.cmd = 0;
        self.auto_stop = false;
        self.recv_fifo.clear();
    }

    /// Transmitter-ready bit for the composite flags register.
    #[must_use]
    pub const fn transmitter_ready(&self) -> bool {
        self.status & status::XMIT_READY != 0
    }

    /// Byte-time in milliseconds at the programmed rate: start + data +
    /// parity + stop bits at the dialed baud.
    #[must_use]
    pub fn baud_timeout(&self, transmit: bool) -> f64 {
        let index = if transmit {
            (self.baud_rates >> 4) & 0x0F
        } else {
            self.baud_rates & 0x0F
        };
        let baud = BAUD_TABLE[index as usize];
        let data_bits = 5.0 + f64::from((self.mode & mode::DATA_BITS) >> 2);
        let parity = if self.mode & mode::PARITY_ENABLE != 0 {
            1.0
        } else {
            0.0
        };
        let stop_bits = match self.mode & mode::STOP_BITS {
            0x80 => 1.5,
            0xC0 => 2.0,
            _ => 1.0,
        };
        let bits = 1.0 + data_bits + parity + stop_bits;
        1000.0 / (baud / bits)
    }

    // ==================== PORT 0x00 ====================

    /// Data read: hand over the latched byte and free the receiver.
    pub fn in_data(&mut self) -> u8 {
        self.status &= !status::RECV_FULL;
        if !self.recv_fifo.is_empty() {
            let ms = self.baud_timeout(false);
            self.time.set_timer(self.timer_receive, ms, false);
        }
        self.data_in
    }

    /// Data write: start transmitting. The ready bits drop and come back
    /// when the byte has left the shift register.
    pub fn out_data(&mut self, value: u8) {
        self.data_out = value;
        self.status &= !(status::XMIT_READY | status::XMIT_EMPTY);
        self.transmit_byte(value);
        let ms = self.baud_timeout(true);
        self.time.set_timer(self.timer_transmit, ms, true);
    }

    /// Forwards a byte to the peer. XON/XOFF are consumed locally when
    /// auto-flow is enabled. Returns whether the byte reached a wire.
    fn transmit_byte(&mut self, value: u8) -> bool {
        if self.auto_flow {
            if value == XOFF {
                trace!("auto-flow: XOFF, pausing delivery");
                self.auto_stop = true;
                return false;
            }
            if value == XON {
                trace!("auto-flow: XON, resuming delivery");
                self.auto_stop = false;
                // Anything held back can now be delivered.
                if !self.recv_fifo.is_empty() {
                    let ms = self.baud_timeout(false);
                    self.time.set_timer(self.timer_receive, ms, false);
                }
                return false;
            }
        }
        match self.peer.as_ref().and_then(Weak::upgrade) {
            Some(peer) => {
                peer.borrow_mut().receive_data(value);
                true
            }
            None => false,
        }
    }

    fn on_transmit_timer(&mut self) {
        self.status |= status::XMIT_READY | status::XMIT_EMPTY;
    }

    // ==================== PORT 0x01 ====================

    /// Status read.
    #[must_use]
    pub const fn in_status(&self) -> u8 {
        self.status
    }

    /// Control write: MODE first, COMMANDs thereafter.
    pub fn out_control(&mut self, value: u8) {
        if !self.ready {
            self.mode = value;
            self.ready = true;
            return;
        }
        let prev = self.cmd;
        self.cmd = value;
        if value & command::INTERNAL_RESET != 0 {
            debug!("8251 internal reset");
            self.ready = false;
        }
        if value & command::ERROR_RESET != 0 {
            self.status &= !(status::PARITY_ERROR
                | status::OVERRUN_ERROR
                | status::FRAMING_ERROR);
        }
        if (prev ^ value) & (command::DTR | command::RTS) != 0 {
            self.notify_peer_status();
        }
    }

    /// Raw RS-232 lines this UART is asserting.
    #[must_use]
    fn pins(&self) -> u32 {
        let mut pins = 0;
        if self.cmd & command::DTR != 0 {
            pins |= rs232::DTR;
        }
        if self.cmd & command::RTS != 0 {
            pins |= rs232::RTS;
        }
        pins
    }

    fn notify_peer_status(&mut self) {
        let Some(peer) = self.peer.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        let mut pins = self.pins();
        if self.null_modem {
            let mut mapped = 0;
            if pins & rs232::RTS != 0 {
                mapped |= rs232::CTS;
            }
            if pins & rs232::DTR != 0 {
                mapped |= rs232::DSR | rs232::CD;
            }
            pins = mapped;
        }
        peer.borrow_mut().receive_status(pins);
    }

    // ==================== PORT 0x02 ====================

    /// Baud-rate dial: receive index in the low nibble, transmit in the
    /// high.
    pub fn out_baud_rates(&mut self, value: u8) {
        self.baud_rates = value;
    }

    // ==================== RECEIVE PATH ====================

    fn on_receive_timer(&mut self) {
        if self.auto_stop || self.status & status::RECV_FULL != 0 {
            // Holding off: try again in a byte time (the CPU may read or
            // send XON meanwhile; both also re-arm this timer).
            if !self.recv_fifo.is_empty() {
                let ms = self.baud_timeout(false);
                self.time.set_timer(self.timer_receive, ms, false);
            }
            return;
        }
        if let Some(byte) = self.recv_fifo.pop_front() {
            self.data_in = byte;
            self.status |= status::RECV_FULL;
            self.intr.request_intr(self.irq_level);
            if !self.recv_fifo.is_empty() {
                let ms = self.baud_timeout(false);
                self.time.set_timer(self.timer_receive, ms, false);
            }
        }
    }

    // ==================== STATE ====================

    #[must_use]
    pub fn save_state(&self) -> SerialState {
        SerialState {
            id: "serial8251".to_string(),
            version: SERIAL_STATE_VERSION,
            ready: self.ready,
            data_in: self.data_in,
            data_out: self.data_out,
            status: self.status,
            mode: self.mode,
            cmd: self.cmd,
            baud_rates: self.baud_rates,
            auto_stop: self.auto_stop,
            recv_fifo: self.recv_fifo.iter().copied().collect(),
        }
    }

    pub fn load_state(&mut self, state: &SerialState) -> bool {
        if state.id != "serial8251" || state.version != SERIAL_STATE_VERSION {
            return false;
        }
        self.ready = state.ready;
        self.data_in = state.data_in;
        self.data_out = state.data_out;
        self.status = state.status;
        self.mode = state.mode;
        self.cmd = state.cmd;
        self.baud_rates = state.baud_rates;
        self.auto_stop = state.auto_stop;
        self.recv_fifo = state.recv_fifo.iter().copied().collect();
        true
    }
}

impl SerialPeer for Serial {
    /// Wire delivery from the peer: buffer the byte and start pacing it
    /// toward the CPU.
    fn receive_data(&mut self, data: u8) {
        self.recv_fifo.push_back(data);
        let ms = self.baud_timeout(false);
        self.time.set_timer(self.timer_receive, ms, false);
    }

    /// Peer status change: only DSR is visible in the 8251 status byte.
    fn receive_status(&mut self, pins: u32) {
        if pins & rs232::DSR != 0 {
            self.status |= status::DSR;
        } else {
            self.status &= !status::DSR;
        }
    }
}
