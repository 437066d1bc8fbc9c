//! Machine Assembly
//!
//! Builds a complete VT100 core from configuration: two buses, the 8080,
//! the chip bank, both UARTs, the video processor and the scheduler, wired
//! together the way the basic video board wires them:
//!
//! | Port | Device   | In             | Out              |
//! |------|----------|----------------|------------------|
//! | 0x00 | Serial   | received data  | transmit data    |
//! | 0x01 | Serial   | status         | mode/command     |
//! | 0x02 | Serial   | —              | baud dial        |
//! | 0x42 | Chips    | flags          | brightness       |
//! | 0x62 | Chips    | —              | NVR latch        |
//! | 0x82 | Keyboard | key address    | status/LEDs      |
//! | 0xA2 | Chips    | —              | DC012            |
//! | 0xC2 | Chips    | —              | DC011            |
//!
//! Construction is fallible: overlapping memory windows, bad bus geometry
//! and port-listener collisions are configuration errors that abort
//! assembly with a diagnostic naming the offender. After construction the
//! machine is driven through [`Machine::run`] / [`Machine::step`] and the
//! host-facing accessors.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::bus::{Bus, BusError, BusKind};
use crate::chips::Chips;
use crate::cpu::{Cpu, IntrLine};
use crate::kbd::{Keyboard, KeyboardHost, NullKeyboardHost};
use crate::memory::BlockType;
use crate::serial::{Serial, SerialConfig};
use crate::time::{Time, TimeConfig};
use crate::video::{DrawingSurface, NullSurface, Video, VideoConfig};

/// Machine-level errors.
#[derive(Debug)]
pub enum MachineError {
    /// Bus or listener misconfiguration.
    Bus(BusError),
    /// A device could not be assembled as configured.
    Config { device: String, reason: String },
    /// A state snapshot could not be applied.
    State(String),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(e) => write!(f, "bus configuration: {e}"),
            Self::Config { device, reason } => {
                write!(f, "device {device:?} configuration: {reason}")
            }
            Self::State(reason) => write!(f, "state load: {reason}"),
        }
    }
}

impl std::error::Error for MachineError {}

impl From<BusError> for MachineError {
    fn from(e: BusError) -> Self {
        Self::Bus(e)
    }
}

/// One window of the memory bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemRegionConfig {
    pub addr: u32,
    pub size: u32,
    pub writable: bool,
    /// Initial contents (ROM image or RAM seed).
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Memory-bus geometry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub addr_width: u32,
    pub block_size: u32,
    pub io_width: u32,
    pub io_block_size: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            addr_width: 16,
            block_size: 0x1000,
            io_width: 8,
            io_block_size: 0x100,
        }
    }
}

/// Chip-bank configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChipsConfig {
    /// Persisted NVR words (100 × 14-bit); absent words read as erased.
    pub nvr_words: Option<Vec<u16>>,
}

/// Complete machine configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub time: TimeConfig,
    pub bus: BusConfig,
    pub memory: Vec<MemRegionConfig>,
    pub video: VideoConfig,
    pub serial: SerialConfig,
    pub chips: ChipsConfig,
}

/// State-format version for whole-machine snapshots.
pub const MACHINE_STATE_VERSION: u32 = 1;

/// Uniform device lifecycle. The machine walks its directory in
/// construction order for power-up and reset, and in reverse order for
/// power-down; snapshots collect every device's state block under its id.
pub trait Device {
    fn device_id(&self) -> &'static str;

    fn on_power(&mut self, on: bool) {
        let _ = on;
    }

    fn on_reset(&mut self);

    /// Serializes this device's state (id + version prefix first).
    fn on_save(&self) -> Value;

    /// Restores state; `false` on an id/version/shape mismatch, leaving the
    /// device reset.
    fn on_load(&mut self, state: &Value) -> bool;
}

impl Device for Cpu {
    fn device_id(&self) -> &'static str {
        "cpu8080"
    }
    fn on_reset(&mut self) {
        self.reset();
    }
    fn on_save(&self) -> Value {
        serde_json::to_value(self.save_state()).unwrap_or(Value::Null)
    }
    fn on_load(&mut self, state: &Value) -> bool {
        serde_json::from_value(state.clone())
            .map(|s| self.load_state(&s))
            .unwrap_or(false)
    }
}

impl Device for Chips {
    fn device_id(&self) -> &'static str {
        "chips"
    }
    fn on_reset(&mut self) {
        self.reset();
    }
    fn on_save(&self) -> Value {
        serde_json::to_value(self.save_state()).unwrap_or(Value::Null)
    }
    fn on_load(&mut self, state: &Value) -> bool {
        serde_json::from_value(state.clone())
            .map(|s| self.load_state(&s))
            .unwrap_or(false)
    }
}

impl Device for Keyboard {
    fn device_id(&self) -> &'static str {
        "kbd"
    }
    fn on_reset(&mut self) {
        self.reset();
    }
    fn on_save(&self) -> Value {
        serde_json::to_value(self.save_state()).unwrap_or(Value::Null)
    }
    fn on_load(&mut self, state: &Value) -> bool {
        serde_json::from_value(state.clone())
            .map(|s| self.load_state(&s))
            .unwrap_or(false)
    }
}

impl Device for Serial {
    fn device_id(&self) -> &'static str {
        "serial8251"
    }
    fn on_reset(&mut self) {
        self.reset();
    }
    fn on_save(&self) -> Value {
        serde_json::to_value(self.save_state()).unwrap_or(Value::Null)
    }
    fn on_load(&mut self, state: &Value) -> bool {
        serde_json::from_value(state.clone())
            .map(|s| self.load_state(&s))
            .unwrap_or(false)
    }
}

impl Device for Video {
    fn device_id(&self) -> &'static str {
        "video"
    }
    fn on_reset(&mut self) {
        self.reset();
    }
    fn on_save(&self) -> Value {
        serde_json::to_value(self.save_state()).unwrap_or(Value::Null)
    }
    fn on_load(&mut self, state: &Value) -> bool {
        serde_json::from_value(state.clone())
            .map(|s| self.load_state(&s))
            .unwrap_or(false)
    }
}

/// The assembled machine.
pub struct Machine {
    time: Time,
    bus_mem: Rc<RefCell<Bus>>,
    bus_io: Rc<RefCell<Bus>>,
    intr: IntrLine,
    cpu: Rc<RefCell<Cpu>>,
    chips: Rc<RefCell<Chips>>,
    kbd: Rc<RefCell<Keyboard>>,
    serial: Rc<RefCell<Serial>>,
    /// Host-side companion UART, present when the configuration asks for a
    /// peer connection.
    peer: Option<Rc<RefCell<Serial>>>,
    video: Rc<RefCell<Video>>,
    /// Every lifecycle-managed device, in construction order.
    directory: Vec<Rc<RefCell<dyn Device>>>,
    powered: bool,
}

impl std::fmt::Debug for Machine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Machine").finish_non_exhaustive()
    }
}

impl Machine {
    /// Assembles a machine. The surface and keyboard host are the two
    /// out-of-scope collaborators; pass [`NullSurface`] /
    /// [`NullKeyboardHost`] for headless operation.
    pub fn new(
        config: &MachineConfig,
        surface: Rc<RefCell<dyn DrawingSurface>>,
        kbd_host: Rc<RefCell<dyn KeyboardHost>>,
    ) -> Result<Self, MachineError> {
        let time = Time::new(&config.time);

        // Buses first: everything else hangs off them.
        let mut bus_mem = Bus::new(BusKind::Static, config.bus.addr_width, config.bus.block_size)?;
        for region in &config.memory {
            let kind = if region.writable {
                BlockType::ReadWrite
            } else {
                BlockType::ReadOnly
            };
            let seed = if region.data.is_empty() {
                None
            } else {
                Some(region.data.as_slice())
            };
            if !bus_mem.add_blocks(region.addr, region.size, kind, seed) {
                return Err(MachineError::Config {
                    device: "memory".to_string(),
                    reason: format!(
                        "window {:#06x}+{:#x} overlaps or is misaligned",
                        region.addr, region.size
                    ),
                });
            }
        }
        let mut bus_io = Bus::new(
            BusKind::Dynamic,
            config.bus.io_width,
            config.bus.io_block_size,
        )?;
        let io_size = 1u32 << config.bus.io_width;
        if !bus_io.add_blocks(0, io_size, BlockType::Ports, None) {
            return Err(MachineError::Config {
                device: "ports".to_string(),
                reason: "io space could not be populated".to_string(),
            });
        }
        let bus_mem = Rc::new(RefCell::new(bus_mem));
        let bus_io = Rc::new(RefCell::new(bus_io));

        let intr = IntrLine::new(time.clone());
        let cpu = Rc::new(RefCell::new(Cpu::new(
            Rc::clone(&bus_mem),
            Rc::clone(&bus_io),
            time.clone(),
            intr.clone(),
        )));

        let chips = Rc::new(RefCell::new(Chips::new(
            time.clone(),
            intr.clone(),
            config.chips.nvr_words.as_deref(),
        )));
        let kbd = Rc::new(RefCell::new(Keyboard::new(
            time.clone(),
            intr.clone(),
            kbd_host,
        )));
        let serial = Rc::new(RefCell::new(Serial::new(
            time.clone(),
            intr.clone(),
            &config.serial,
        )));
        Serial::init_timers(&serial);

        // Resolve the peer connection: "<sourceId>-><targetId>" (or just the
        // target id). Failure is non-fatal; the UART runs unconnected.
        let peer = Self::init_connection(&config.serial, &time, &intr, &serial);

        let video = Rc::new(RefCell::new(Video::new(
            config.video.clone(),
            Rc::clone(&bus_mem),
            surface,
            time.clone(),
            intr.clone(),
        )));
        Video::init_timers(&video);

        // The CPU is the machine's clock.
        {
            let cpu = Rc::clone(&cpu);
            time.add_clock(Rc::new(move |n| cpu.borrow_mut().clock(n)));
        }

        let directory: Vec<Rc<RefCell<dyn Device>>> = vec![
            Rc::clone(&cpu) as Rc<RefCell<dyn Device>>,
            Rc::clone(&chips) as Rc<RefCell<dyn Device>>,
            Rc::clone(&kbd) as Rc<RefCell<dyn Device>>,
            Rc::clone(&serial) as Rc<RefCell<dyn Device>>,
            Rc::clone(&video) as Rc<RefCell<dyn Device>>,
        ];

        let machine = Self {
            time,
            bus_mem,
            bus_io,
            intr,
            cpu,
            chips,
            kbd,
            serial,
            peer,
            video,
            directory,
            powered: false,
        };
        machine.init_listeners()?;
        Ok(machine)
    }

    fn init_connection(
        config: &SerialConfig,
        time: &Time,
        intr: &IntrLine,
        serial: &Rc<RefCell<Serial>>,
    ) -> Option<Rc<RefCell<Serial>>> {
        let connection = config.connection.as_deref()?;
        let target = connection
            .split_once("->")
            .map_or(connection, |(_, rhs)| rhs);
        let target = target.split('.').next().unwrap_or(target);
        if target.is_empty() || target == "serial8251" {
            warn!(connection, "serial connection target unusable; running unconnected");
            return None;
        }
        let peer_config = SerialConfig {
            connection: None,
            ..config.clone()
        };
        let peer = Rc::new(RefCell::new(Serial::new(
            time.clone(),
            intr.clone(),
            &peer_config,
        )));
        Serial::init_timers(&peer);
        Serial::connect(serial, &peer);
        info!(peer = target, "serial peer connected");
        Some(peer)
    }

    /// Registers every device's port listeners.
    fn init_listeners(&self) -> Result<(), MachineError> {
        let mut io = self.bus_io.borrow_mut();

        let s = Rc::clone(&self.serial);
        let s2 = Rc::clone(&self.serial);
        io.add_listener(
            0x00,
            Some(Box::new(move |_| s.borrow_mut().in_data())),
            Some(Box::new(move |_, v| s2.borrow_mut().out_data(v))),
        )?;
        let s = Rc::clone(&self.serial);
        let s2 = Rc::clone(&self.serial);
        io.add_listener(
            0x01,
            Some(Box::new(move |_| s.borrow().in_status())),
            Some(Box::new(move |_, v| s2.borrow_mut().out_control(v))),
        )?;
        let s = Rc::clone(&self.serial);
        io.add_listener(
            0x02,
            None,
            Some(Box::new(move |_, v| s.borrow_mut().out_baud_rates(v))),
        )?;

        let c = Rc::clone(&self.chips);
        let c2 = Rc::clone(&self.chips);
        io.add_listener(
            0x42,
            Some(Box::new(move |_| c.borrow_mut().in_flags())),
            Some(Box::new(move |_, v| c2.borrow_mut().out_brightness(v))),
        )?;
        let c = Rc::clone(&self.chips);
        io.add_listener(
            0x62,
            None,
            Some(Box::new(move |_, v| c.borrow_mut().out_nvr_latch(v))),
        )?;
        let c = Rc::clone(&self.chips);
        io.add_listener(
            0xA2,
            None,
            Some(Box::new(move |_, v| c.borrow_mut().out_dc012(v))),
        )?;
        let c = Rc::clone(&self.chips);
        io.add_listener(
            0xC2,
            None,
            Some(Box::new(move |_, v| c.borrow_mut().out_dc011(v))),
        )?;

        let k = Rc::clone(&self.kbd);
        let k2 = Rc::clone(&self.kbd);
        io.add_listener(
            0x82,
            Some(Box::new(move |_| k.borrow_mut().in_address())),
            Some(Box::new(move |_, v| k2.borrow_mut().out_status(v))),
        )?;
        Ok(())
    }

    // ==================== LIFECYCLE ====================

    /// Powers the machine on or off. Power-on completes the wiring the
    /// constructor cannot: the chips consult the keyboard, serial and video
    /// devices found in the directory. Devices see `on_power` in
    /// construction order going up, reverse order going down.
    pub fn power(&mut self, on: bool) {
        if on == self.powered {
            return;
        }
        self.powered = on;
        if on {
            info!("power on");
            let mut chips = self.chips.borrow_mut();
            chips.set_video(Rc::clone(&self.video));
            chips.set_kbd(Rc::clone(&self.kbd));
            chips.set_serial(Rc::clone(&self.serial));
            drop(chips);
            for device in &self.directory {
                device.borrow_mut().on_power(true);
            }
            self.time.start();
        } else {
            info!("power off");
            self.time.stop();
            for device in self.directory.iter().rev() {
                device.borrow_mut().on_power(false);
            }
        }
    }

    /// Resets every device without tearing the machine down.
    pub fn reset(&mut self) {
        for device in &self.directory {
            device.borrow_mut().on_reset();
        }
        if let Some(peer) = &self.peer {
            peer.borrow_mut().reset();
        }
    }

    /// Runs one scheduler slice; returns the suggested host sleep in ms, or
    /// `None` once stopped.
    pub fn run(&self) -> Option<f64> {
        self.time.run()
    }

    /// Runs one minimum burst (single instruction).
    pub fn step(&self) -> u64 {
        self.time.step()
    }

    /// Frame hook for frame-driven clocking and redraw.
    pub fn animate(&self, ms_timestamp: f64) {
        self.time.animate(ms_timestamp);
    }

    // ==================== STATE ====================

    /// Serializes every device's state into one JSON document.
    #[must_use]
    pub fn save(&self) -> Value {
        let mut devices = serde_json::Map::new();
        for device in &self.directory {
            let device = device.borrow();
            devices.insert(device.device_id().to_string(), device.on_save());
        }
        json!({
            "id": "vt100",
            "version": MACHINE_STATE_VERSION,
            "cycles": self.time.cycles(),
            "multiplier": self.time.multiplier(),
            "devices": devices,
        })
    }

    /// Restores a snapshot. A device whose id/version prefix does not match
    /// is left in reset state and the load reports the failure.
    pub fn load(&mut self, state: &Value) -> Result<(), MachineError> {
        if state.get("id").and_then(Value::as_str) != Some("vt100")
            || state.get("version").and_then(Value::as_u64)
                != Some(u64::from(MACHINE_STATE_VERSION))
        {
            return Err(MachineError::State(
                "machine id/version prefix mismatch".to_string(),
            ));
        }
        let devices = state
            .get("devices")
            .ok_or_else(|| MachineError::State("missing devices".to_string()))?;
        self.reset();

        for device in &self.directory {
            let mut device = device.borrow_mut();
            let id = device.device_id();
            let block = devices
                .get(id)
                .ok_or_else(|| MachineError::State(format!("missing device {id:?}")))?;
            if !device.on_load(block) {
                warn!(id, "state rejected; device left reset");
                return Err(MachineError::State(format!(
                    "device {id:?}: id/version prefix mismatch"
                )));
            }
        }
        Ok(())
    }

    // ==================== ACCESSORS ====================

    #[must_use]
    pub fn time(&self) -> &Time {
        &self.time
    }

    #[must_use]
    pub fn cpu(&self) -> Rc<RefCell<Cpu>> {
        Rc::clone(&self.cpu)
    }

    #[must_use]
    pub fn bus_mem(&self) -> Rc<RefCell<Bus>> {
        Rc::clone(&self.bus_mem)
    }

    #[must_use]
    pub fn bus_io(&self) -> Rc<RefCell<Bus>> {
        Rc::clone(&self.bus_io)
    }

    #[must_use]
    pub fn chips(&self) -> Rc<RefCell<Chips>> {
        Rc::clone(&self.chips)
    }

    #[must_use]
    pub fn kbd(&self) -> Rc<RefCell<Keyboard>> {
        Rc::clone(&self.kbd)
    }

    #[must_use]
    pub fn serial(&self) -> Rc<RefCell<Serial>> {
        Rc::clone(&self.serial)
    }

    /// The host-side companion UART, when a connection was configured.
    #[must_use]
    pub fn serial_peer(&self) -> Option<Rc<RefCell<Serial>>> {
        self.peer.as_ref().map(Rc::clone)
    }

    #[must_use]
    pub fn video(&self) -> Rc<RefCell<Video>> {
        Rc::clone(&self.video)
    }

    #[must_use]
    pub fn intr_line(&self) -> IntrLine {
        self.intr.clone()
    }

    /// Current NVR contents, for the host's persistence store.
    #[must_use]
    pub fn nvr_words(&self) -> Vec<u16> {
        self.chips.borrow().nvr_words().to_vec()
    }
}

/// A machine over null host devices, for embedding and tests.
pub fn headless(config: &MachineConfig) -> Result<Machine, MachineError> {
    Machine::new(
        config,
        Rc::new(RefCell::new(NullSurface)),
        Rc::new(RefCell::new(NullKeyboardHost)),
    )
}
