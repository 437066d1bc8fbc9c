//! Keyboard Scanner UART
//!
//! The VT100 keyboard hangs off a single bidirectional UART at port 0x82:
//! writes carry the status byte (LEDs, LOCAL, and the scan START bit), reads
//! return key addresses. A scan is interrupt-driven: setting START latches
//! the first active key and raises interrupt level 1; every read of the key
//! address latches the next active key and raises the level again, until the
//! scan runs out and the terminator code 0x7F is latched with no further
//! interrupt.
//!
//! | Status bit | Meaning            |
//! |------------|--------------------|
//! | 0x01–0x08  | LED indicators 4–1 |
//! | 0x10       | LOCKED indicator   |
//! | 0x20       | LOCAL indicator    |
//! | 0x40       | START scan         |
//! | 0x80       | Key click          |
//!
//! The host supplies key state through [`KeyboardHost`]: already-mapped
//! 7-bit VT100 key codes, stable by index for the duration of one scan.

use std::cell::RefCell;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::cpu::IntrLine;
use crate::time::Time;

/// Status byte bits (port 0x82 write).
pub mod status {
    pub const LED4: u8 = 0x01;
    pub const LED3: u8 = 0x02;
    pub const LED2: u8 = 0x04;
    pub const LED1: u8 = 0x08;
    pub const LOCKED: u8 = 0x10;
    pub const LOCAL: u8 = 0x20;
    /// Start a keyboard scan.
    pub const START: u8 = 0x40;
    /// Key-click on next scan.
    pub const CLICK: u8 = 0x80;
}

/// Key address latched when a scan runs out of keys.
pub const KEY_LAST: u8 = 0x7F;

/// Interrupt level raised for each latched key address.
pub const KBD_INTR_LEVEL: u8 = 1;

/// Cycles the keyboard UART stays busy after a status write: one UART frame,
/// about 100 µs at the VT100's 2.76 MHz.
pub const UART_BUSY_CYCLES: u64 = 276;

/// Indicator ids passed to the host when status bits change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Led {
    Led4,
    Led3,
    Led2,
    Led1,
    Locked,
    Local,
}

const LED_BITS: [(u8, Led); 6] = [
    (status::LED4, Led::Led4),
    (status::LED3, Led::Led3),
    (status::LED2, Led::Led2),
    (status::LED1, Led::Led1),
    (status::LOCKED, Led::Locked),
    (status::LOCAL, Led::Local),
];

/// Host side of the keyboard: key state in, indicator state out.
pub trait KeyboardHost {
    /// The `index`-th currently-pressed key as a mapped 7-bit VT100 code.
    /// Bit 7 may be set to mean "SHIFT held with this key". Indices are
    /// stable across a single scan.
    fn get_active_key(&mut self, index: usize) -> Option<u8>;

    /// An indicator changed state.
    fn set_led(&mut self, led: Led, on: bool) {
        let _ = (led, on);
    }
}

/// Headless host: no keys, indicators ignored.
pub struct NullKeyboardHost;

impl KeyboardHost for NullKeyboardHost {
    fn get_active_key(&mut self, _index: usize) -> Option<u8> {
        None
    }
}

/// Persisted keyboard state.
#[derive(Serialize, Deserialize)]
pub struct KeyboardState {
    pub id: String,
    pub version: u32,
    pub status: u8,
    pub address: u8,
    pub uart_busy: bool,
    pub uart_snap: u64,
    pub key_next: i32,
}

/// State-format version for [`KeyboardState`].
pub const KBD_STATE_VERSION: u32 = 1;

/// The keyboard UART.
pub struct Keyboard {
    status: u8,
    /// Last latched key address.
    address: u8,
    uart_busy: bool,
    /// Cycle timestamp of the last status write.
    uart_snap: u64,
    /// Index of the next key to latch, -1 while no scan is in progress.
    key_next: i32,
    host: Rc<RefCell<dyn KeyboardHost>>,
    time: Time,
    intr: IntrLine,
}

impl Keyboard {
    #[must_use]
    pub fn new(time: Time, intr: IntrLine, host: Rc<RefCell<dyn KeyboardHost>>) -> Self {
        Self {
            status: 0,
            address: KEY_LAST,
            uart_busy: false,
            uart_snap: 0,
            key_next: -1,
            host,
            time,
            intr,
        }
    }

    pub fn reset(&mut self) {
        self.status = 0;
        self.address = KEY_LAST;
        self.uart_busy = false;
        self.uart_snap = 0;
        self.key_next = -1;
    }

    /// Current status byte, for host display.
    #[must_use]
    pub const fn status(&self) -> u8 {
        self.status
    }

    /// Last latched key address, for host display.
    #[must_use]
    pub const fn address(&self) -> u8 {
        self.address
    }

    /// Transmitter-ready bit for the composite flags register: the UART is
    /// busy for one frame after each status write.
    #[must_use]
    pub const fn transmitter_ready(&self, cycles_now: u64) -> bool {
        !self.uart_busy || cycles_now >= self.uart_snap + UART_BUSY_CYCLES
    }

    /// Status write (port 0x82 out). Diffs the indicator bits against the
    /// previous byte and notifies the host of each change; START begins an
    /// interrupt-driven scan.
    pub fn out_status(&mut self, value: u8) {
        let diff = value ^ self.status;
        for (bit, led) in LED_BITS {
            if diff & bit != 0 {
                self.host.borrow_mut().set_led(led, value & bit != 0);
            }
        }
        self.status = value;
        self.uart_snap = self.time.cycles();
        self.uart_busy = true;
        if value & status::START != 0 {
            trace!("keyboard scan start");
            self.key_next = 0;
            self.intr.request_intr(KBD_INTR_LEVEL);
        }
    }

    /// Key-address read (port 0x82 in). During a scan each read latches the
    /// next active key and re-raises the interrupt; the scan ends by
    /// latching [`KEY_LAST`] with no interrupt.
    pub fn in_address(&mut self) -> u8 {
        if self.key_next < 0 {
            return self.address;
        }
        let key = self.host.borrow_mut().get_active_key(self.key_next as usize);
        match key {
            Some(mut key) => {
                if key & 0x80 != 0 {
                    // SHIFT is reported in-band; the ROM sees the base code
                    // and samples SHIFT from the concurrent modifier scan.
                    key &= 0x7F;
                }
                self.key_next += 1;
                self.address = key;
                self.intr.request_intr(KBD_INTR_LEVEL);
            }
            None => {
                self.address = KEY_LAST;
                self.key_next = -1;
            }
        }
        self.address
    }

    // ==================== STATE ====================

    #[must_use]
    pub fn save_state(&self) -> KeyboardState {
        KeyboardState {
            id: "kbd".to_string(),
            version: KBD_STATE_VERSION,
            status: self.status,
            address: self.address,
            uart_busy: self.uart_busy,
            uart_snap: self.uart_snap,
            key_next: self.key_next,
        }
    }

    pub fn load_state(&mut self, state: &KeyboardState) -> bool {
        if state.id != "kbd" || state.version != KBD_STATE_VERSION {
            return false;
        }
        self.status = state.status;
        self.address = state.address;
        self.uart_busy = state.uart_busy;
        self.uart_snap = state.uart_snap;
        self.key_next = state.key_next;
        true
    }
}
