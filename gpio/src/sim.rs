//! In-memory GPIO driver for running the scanner without hardware.
//!
//! Besides plain pins it can model analog multiplexer chips (CD74HC4067-style): a set of select
//! pins, an active-low enable pin and a shared signal pin that follows the level of the
//! currently addressed channel.
use crate::{
    GpioActiveLevel, GpioBias, GpioDriveMode, GpioDriver, GpioError, GpioInput, GpioOutput,
    GpioPin, GpioResult,
};
use bitvec::vec::BitVec;
use log::trace;
use std::cell::RefCell;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::AtomicU8;

/// Identifies a multiplexer attached to a [SimGpioDriver].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SimMuxId(usize);

#[derive(Debug)]
struct SimMultiplexer {
    select_pins: Vec<usize>,
    signal_pin: usize,
    enable_pin: usize,
    channels: BitVec,
}

#[derive(Debug)]
struct SimState {
    outputs: BitVec,
    driven: BitVec,
    external: BitVec,
    bias: Vec<GpioBias>,
    faults: Vec<Option<GpioError>>,
    writes: Vec<usize>,
    muxes: Vec<SimMultiplexer>,
}

impl SimState {
    fn floating_level(&self, index: usize) -> bool {
        // Undriven lines read high, as with the external pull-up on the reference board
        !matches!(self.bias[index], GpioBias::PullDown)
    }

    fn resolve(&self, index: usize) -> bool {
        if self.outputs[index] {
            return self.driven[index];
        }

        let Some(mux) = self.muxes.iter().find(|mux| mux.signal_pin == index) else {
            return self.external[index];
        };

        let enabled = self.outputs[mux.enable_pin] && !self.driven[mux.enable_pin];
        if !enabled {
            return self.floating_level(index);
        }

        let address = mux
            .select_pins
            .iter()
            .enumerate()
            .filter(|&(_, &pin)| self.outputs[pin] && self.driven[pin])
            .fold(0usize, |address, (bit, _)| address | (1 << bit));

        match mux.channels.get(address) {
            Some(level) => *level,
            None => self.floating_level(index),
        }
    }

    fn check_fault(&self, index: usize) -> GpioResult<()> {
        match &self.faults[index] {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// A simulated GPIO driver backed by memory.
pub struct SimGpioDriver {
    used_pins: BitVec<AtomicU8>,
    state: RefCell<SimState>,
}

impl SimGpioDriver {
    /// Creates a driver with `pin_count` pins, all floating inputs.
    pub fn new(pin_count: usize) -> Self {
        Self {
            used_pins: BitVec::repeat(false, pin_count),
            state: RefCell::new(SimState {
                outputs: BitVec::repeat(false, pin_count),
                driven: BitVec::repeat(false, pin_count),
                external: BitVec::repeat(true, pin_count),
                bias: vec![GpioBias::None; pin_count],
                faults: vec![None; pin_count],
                writes: vec![0; pin_count],
                muxes: Vec::new(),
            }),
        }
    }

    /// Wires a multiplexer chip to the given pins.
    ///
    /// All channels start high (switch open).
    ///
    /// # Errors
    /// - `GpioError::InvalidArgument` if any pin is out of range.
    pub fn attach_multiplexer(
        &self,
        select_pins: &[usize],
        signal_pin: usize,
        enable_pin: usize,
        channel_count: usize,
    ) -> GpioResult<SimMuxId> {
        let pin_count = self.used_pins.len();
        let mut pins = select_pins.iter().chain([&signal_pin, &enable_pin]);
        if pins.any(|&pin| pin >= pin_count) {
            return Err(GpioError::InvalidArgument);
        }

        let mut state = self.state.borrow_mut();
        state.muxes.push(SimMultiplexer {
            select_pins: select_pins.to_vec(),
            signal_pin,
            enable_pin,
            channels: BitVec::repeat(true, channel_count),
        });
        Ok(SimMuxId(state.muxes.len() - 1))
    }

    /// Sets the raw level a multiplexer channel presents while it is addressed.
    ///
    /// # Panics
    /// If the multiplexer or channel does not exist.
    pub fn set_channel_level(&self, mux: SimMuxId, channel: usize, level: bool) {
        self.state.borrow_mut().muxes[mux.0].channels.set(channel, level);
    }

    /// Closes the switch on a channel, pulling it low.
    pub fn press(&self, mux: SimMuxId, channel: usize) {
        self.set_channel_level(mux, channel, false);
    }

    /// Opens the switch on a channel, letting it float back high.
    pub fn release(&self, mux: SimMuxId, channel: usize) {
        self.set_channel_level(mux, channel, true);
    }

    /// Sets the level applied from outside to a plain input pin.
    pub fn set_input(&self, index: usize, level: bool) {
        self.state.borrow_mut().external.set(index, level);
    }

    /// Makes every read and write on the pin fail with `err`, or clears the fault with `None`.
    pub fn set_fault(&self, index: usize, err: Option<GpioError>) {
        self.state.borrow_mut().faults[index] = err;
    }

    /// Gets the raw level currently present on the pin.
    pub fn level(&self, index: usize) -> bool {
        self.state.borrow().resolve(index)
    }

    /// Gets how many times the pin has been written as an output.
    pub fn write_count(&self, index: usize) -> usize {
        self.state.borrow().writes[index]
    }

    /// Gets whether the pin is currently claimed by a handle.
    pub fn is_claimed(&self, index: usize) -> bool {
        self.used_pins[index]
    }
}

impl Debug for SimGpioDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SimGpioDriver({})", self.used_pins.len())
    }
}

impl GpioDriver for SimGpioDriver {
    fn count(&self) -> GpioResult<usize> {
        Ok(self.used_pins.len())
    }

    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin<'_> + '_>> {
        if index >= self.count()? {
            return Err(GpioError::InvalidArgument);
        }

        if self.used_pins[index] {
            return Err(GpioError::AlreadyInUse);
        }

        self.used_pins.set_aliased(index, true);

        Ok(Box::new(SimPin {
            driver: self,
            pin_index: index,
            active_level: GpioActiveLevel::High,
            drive_mode: GpioDriveMode::PushPull,
        }))
    }
}

struct SimPin<'a> {
    driver: &'a SimGpioDriver,
    pin_index: usize,
    active_level: GpioActiveLevel,
    drive_mode: GpioDriveMode,
}

impl Debug for SimPin<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.driver, self.pin_index)
    }
}

impl<'a> GpioPin<'a> for SimPin<'a> {
    fn index(&self) -> usize {
        self.pin_index
    }

    fn into_input(self: Box<Self>) -> GpioResult<Box<dyn GpioInput + 'a>> {
        self.driver.state.borrow_mut().outputs.set(self.pin_index, false);
        Ok(Box::new(SimInput { pin: *self }))
    }

    fn into_output(self: Box<Self>) -> GpioResult<Box<dyn GpioOutput + 'a>> {
        {
            let mut state = self.driver.state.borrow_mut();
            state.outputs.set(self.pin_index, true);
            let idle = self.active_level.get_state(false);
            state.driven.set(self.pin_index, idle);
        }
        Ok(Box::new(SimOutput { pin: *self }))
    }

    fn supports_active_level(&self) -> bool {
        true
    }

    fn active_level(&self) -> GpioActiveLevel {
        self.active_level
    }

    fn set_active_level(&mut self, level: GpioActiveLevel) -> GpioResult<()> {
        self.active_level = level;
        Ok(())
    }

    fn supports_bias(&self) -> bool {
        true
    }

    fn bias(&self) -> GpioBias {
        self.driver.state.borrow().bias[self.pin_index]
    }

    fn set_bias(&mut self, bias: GpioBias) -> GpioResult<()> {
        self.driver.state.borrow_mut().bias[self.pin_index] = bias;
        Ok(())
    }

    fn supports_drive_mode(&self) -> bool {
        true
    }

    fn drive_mode(&self) -> GpioDriveMode {
        self.drive_mode
    }

    fn set_drive_mode(&mut self, mode: GpioDriveMode) -> GpioResult<()> {
        self.drive_mode = mode;
        Ok(())
    }
}

impl Drop for SimPin<'_> {
    fn drop(&mut self) {
        let mut state = self.driver.state.borrow_mut();
        state.outputs.set(self.pin_index, false);
        state.bias[self.pin_index] = GpioBias::None;
        drop(state);

        self.driver.used_pins.set_aliased(self.pin_index, false);
        trace!("Released sim pin {}", self.pin_index);
    }
}

struct SimInput<'a> {
    pin: SimPin<'a>,
}

impl Debug for SimInput<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[input]", self.pin)
    }
}

impl GpioInput for SimInput<'_> {
    fn read(&self) -> GpioResult<bool> {
        let state = self.pin.driver.state.borrow();
        state.check_fault(self.pin.pin_index)?;
        Ok(self.pin.active_level.get_state(state.resolve(self.pin.pin_index)))
    }
}

struct SimOutput<'a> {
    pin: SimPin<'a>,
}

impl Debug for SimOutput<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[output]", self.pin)
    }
}

impl GpioOutput for SimOutput<'_> {
    fn write(&self, value: bool) -> GpioResult<()> {
        let index = self.pin.pin_index;
        let mut state = self.pin.driver.state.borrow_mut();
        state.check_fault(index)?;

        let level = self.pin.drive_mode.get_state(self.pin.active_level.get_state(value));
        match level {
            Some(level) => {
                state.outputs.set(index, true);
                state.driven.set(index, level);
            }
            None => state.outputs.set(index, false),
        }
        state.writes[index] += 1;
        Ok(())
    }
}
