//! Memory-mapped driver for the Raspberry Pi GPIO block.
//!
//! Works through `/dev/gpiomem` (no root needed on Raspberry Pi OS) or `/dev/mem`.
//! Supports the BCM2835 (Pi 1, Zero), BCM2836/BCM2837 (Pi 2, 3) and BCM2711 (Pi 4). The chip
//! is read from the device tree unless given explicitly.
use crate::{GpioActiveLevel, GpioBias, GpioDriveMode, GpioDriver, GpioError, GpioInput, GpioOutput, GpioPin, GpioResult};
use bitvec::vec::BitVec;
use log::{debug, trace};
use memmap2::{MmapOptions, MmapRaw};
use std::fmt::{Debug, Formatter};
use std::fs::OpenOptions;
use std::sync::atomic::AtomicU8;
use std::thread;
use std::time::Duration;

// Register offsets, in bytes from the start of the GPIO block.
const GPFSEL0: usize = 0x00;
const GPSET0: usize = 0x1c;
const GPCLR0: usize = 0x28;
const GPLEV0: usize = 0x34;
// BCM2835..BCM2837 only
const GPPUD: usize = 0x94;
const GPPUDCLK0: usize = 0x98;
// BCM2711 only
const GPIO_PUP_PDN_CNTRL_REG0: usize = 0xe4;

const FUNCTION_INPUT: u32 = 0b000;
const FUNCTION_OUTPUT: u32 = 0b001;

/// Setup and hold time of the legacy pull control sequence (at least 150 core cycles).
const PULL_CLOCK_DELAY: Duration = Duration::from_micros(5);

const DEVICE_TREE_COMPATIBLE: &str = "/proc/device-tree/compatible";

/// The SoC whose GPIO block is mapped.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RawGpioChip {
    /// Pi 1 and Zero.
    Bcm2835,
    /// Pi 2 and 3 (BCM2836/BCM2837), which share the peripheral layout.
    Bcm2837,
    /// Pi 4.
    Bcm2711,
}

impl RawGpioChip {
    /// Picks the chip from the contents of the device tree's `compatible` property,
    /// a list of NUL-separated strings.
    pub fn from_compatible(compatible: &str) -> Option<Self> {
        compatible
            .split('\0')
            .find_map(|entry| match entry.trim() {
                "brcm,bcm2835" => Some(RawGpioChip::Bcm2835),
                "brcm,bcm2836" | "brcm,bcm2837" => Some(RawGpioChip::Bcm2837),
                "brcm,bcm2711" => Some(RawGpioChip::Bcm2711),
                _ => None,
            })
    }

    /// Reads the chip from the running system's device tree.
    ///
    /// # Errors
    /// - `GpioError::Io` if the device tree can't be read.
    /// - `GpioError::NotSupported` if the board isn't a supported Raspberry Pi.
    pub fn detect() -> GpioResult<Self> {
        let compatible = std::fs::read(DEVICE_TREE_COMPATIBLE)?;
        let compatible = String::from_utf8_lossy(&compatible);
        let chip = Self::from_compatible(&compatible).ok_or(GpioError::NotSupported)?;
        debug!("Detected {:?} GPIO block", chip);
        Ok(chip)
    }

    /// Gets the physical address of the GPIO block, as seen through `/dev/mem`.
    pub fn gpio_base(self) -> u64 {
        match self {
            RawGpioChip::Bcm2835 => 0x2020_0000,
            RawGpioChip::Bcm2837 => 0x3F20_0000,
            RawGpioChip::Bcm2711 => 0xFE20_0000,
        }
    }

    pub fn pin_count(self) -> usize {
        match self {
            RawGpioChip::Bcm2835 | RawGpioChip::Bcm2837 => 54,
            RawGpioChip::Bcm2711 => 58,
        }
    }

    /// Gets the pull control code for `bias`. The two register layouts encode the directions differently.
    fn pull_code(self, bias: GpioBias) -> u32 {
        match (self, bias) {
            (_, GpioBias::None) => 0b00,
            (RawGpioChip::Bcm2711, GpioBias::PullUp) => 0b01,
            (RawGpioChip::Bcm2711, GpioBias::PullDown) => 0b10,
            (_, GpioBias::PullDown) => 0b01,
            (_, GpioBias::PullUp) => 0b10,
        }
    }
}

pub struct RawGpioDriver {
    mmap: MmapRaw,
    chip: RawGpioChip,
    used_pins: BitVec<AtomicU8>,
}

impl RawGpioDriver {
    fn create(path: &str, offset: u64, chip: RawGpioChip) -> GpioResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)?;

        let mmap = MmapOptions::new()
            .offset(offset)
            .len(4096)
            .map_raw(&file)?;

        Ok(RawGpioDriver {
            mmap,
            chip,
            used_pins: BitVec::repeat(false, chip.pin_count()),
        })
    }

    /// Maps the GPIO block through `/dev/gpiomem` on the detected chip.
    pub fn new_gpiomem() -> GpioResult<Self> {
        Self::new_gpiomem_for(RawGpioChip::detect()?)
    }

    /// Maps the GPIO block through `/dev/gpiomem`, which already starts at the block.
    pub fn new_gpiomem_for(chip: RawGpioChip) -> GpioResult<Self> {
        Self::create("/dev/gpiomem", 0, chip)
    }

    /// Maps the GPIO block through `/dev/mem` on the detected chip.
    pub fn new_mem() -> GpioResult<Self> {
        Self::new_mem_for(RawGpioChip::detect()?)
    }

    /// Maps the GPIO block through `/dev/mem` at the chip's peripheral base address.
    pub fn new_mem_for(chip: RawGpioChip) -> GpioResult<Self> {
        Self::create("/dev/mem", chip.gpio_base(), chip)
    }

    pub fn chip(&self) -> RawGpioChip {
        self.chip
    }

    fn register(&self, byte_offset: usize, pin_index: usize, pins_per_register: usize) -> GpioResult<*mut u32> {
        if pin_index >= self.chip.pin_count() {
            return Err(GpioError::InvalidArgument);
        }
        let base = self.mmap.as_mut_ptr() as *mut u32;
        Ok(unsafe { base.add(byte_offset / 4 + pin_index / pins_per_register) })
    }

    fn set_function(&self, pin_index: usize, function: u32) -> GpioResult<()> {
        let register_ptr = self.register(GPFSEL0, pin_index, 10)?;
        let shift = (pin_index % 10) * 3;

        let mut register_value = unsafe { register_ptr.read_volatile() };
        register_value &= !(0b111 << shift);
        register_value |= function << shift;
        unsafe { register_ptr.write_volatile(register_value) };

        trace!("Set pin function: pin_index={} function={:03b}", pin_index, function);
        Ok(())
    }

    fn set_level(&self, pin_index: usize, high: bool) -> GpioResult<()> {
        // GPSETn/GPCLRn only act on the bits written as 1
        let register_ptr = self.register(if high { GPSET0 } else { GPCLR0 }, pin_index, 32)?;
        unsafe { register_ptr.write_volatile(1 << (pin_index % 32)) };
        Ok(())
    }

    fn level(&self, pin_index: usize) -> GpioResult<bool> {
        let register_ptr = self.register(GPLEV0, pin_index, 32)?;
        let register_value = unsafe { register_ptr.read_volatile() };
        Ok((register_value >> (pin_index % 32)) & 1 != 0)
    }

    fn drive(&self, pin_index: usize, high: bool, mode: GpioDriveMode) -> GpioResult<()> {
        match mode.get_state(high) {
            Some(level) => {
                self.set_level(pin_index, level)?;
                self.set_function(pin_index, FUNCTION_OUTPUT)
            }
            None => self.set_function(pin_index, FUNCTION_INPUT),
        }
    }

    fn set_bias(&self, pin_index: usize, bias: GpioBias) -> GpioResult<()> {
        let code = self.chip.pull_code(bias);
        match self.chip {
            RawGpioChip::Bcm2711 => {
                let register_ptr = self.register(GPIO_PUP_PDN_CNTRL_REG0, pin_index, 16)?;
                let shift = (pin_index % 16) * 2;
                let mut register_value = unsafe { register_ptr.read_volatile() };
                register_value &= !(0b11 << shift);
                register_value |= code << shift;
                unsafe { register_ptr.write_volatile(register_value) };
            }
            RawGpioChip::Bcm2835 | RawGpioChip::Bcm2837 => {
                // Latch the control code into the pin with a clock pulse, then clear both registers
                let clock_ptr = self.register(GPPUDCLK0, pin_index, 32)?;
                let control_ptr = self.register(GPPUD, 0, 32)?;
                unsafe { control_ptr.write_volatile(code) };
                thread::sleep(PULL_CLOCK_DELAY);
                unsafe { clock_ptr.write_volatile(1 << (pin_index % 32)) };
                thread::sleep(PULL_CLOCK_DELAY);
                unsafe { control_ptr.write_volatile(0) };
                unsafe { clock_ptr.write_volatile(0) };
            }
        }

        trace!("Set pin bias: pin_index={} bias={:?}", pin_index, bias);
        Ok(())
    }

    /// Puts the pin back into a floating input with no bias.
    fn reset(&self, pin_index: usize) -> GpioResult<()> {
        self.set_function(pin_index, FUNCTION_INPUT)?;
        self.set_bias(pin_index, GpioBias::None)
    }
}

impl Debug for RawGpioDriver {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawGpioDriver({:?} @ {:#x})", self.chip, self.mmap.as_ptr().addr())
    }
}

impl GpioDriver for RawGpioDriver {
    fn count(&self) -> GpioResult<usize> {
        Ok(self.chip.pin_count())
    }

    fn get_pin(&self, index: usize) -> GpioResult<Box<dyn GpioPin<'_> + '_>> {
        if index >= self.count()? {
            return Err(GpioError::InvalidArgument);
        }

        if self.used_pins[index] {
            return Err(GpioError::AlreadyInUse);
        }

        self.used_pins.set_aliased(index, true);
        let pin = RawGpioPin {
            driver: self,
            pin_index: index,
            active_level: GpioActiveLevel::High,
            bias: GpioBias::None,
            drive_mode: GpioDriveMode::PushPull,
        };
        // The claim is released by the pin's drop if the reset fails
        self.reset(index)?;

        Ok(Box::new(pin))
    }
}

struct RawGpioPin<'a> {
    driver: &'a RawGpioDriver,
    pin_index: usize,
    active_level: GpioActiveLevel,
    /// Last bias written. The legacy pull registers are write-only.
    bias: GpioBias,
    drive_mode: GpioDriveMode,
}

impl Debug for RawGpioPin<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{}]", self.driver, self.pin_index)
    }
}

impl<'a> GpioPin<'a> for RawGpioPin<'a> {
    fn index(&self) -> usize {
        self.pin_index
    }

    fn into_input(self: Box<Self>) -> GpioResult<Box<dyn GpioInput + 'a>> {
        self.driver.set_function(self.pin_index, FUNCTION_INPUT)?;
        Ok(Box::new(RawGpioInput { pin: *self }))
    }

    fn into_output(self: Box<Self>) -> GpioResult<Box<dyn GpioOutput + 'a>> {
        let idle = self.active_level.get_state(false);
        self.driver.drive(self.pin_index, idle, self.drive_mode)?;
        Ok(Box::new(RawGpioOutput { pin: *self }))
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
        self.bias
    }

    fn set_bias(&mut self, bias: GpioBias) -> GpioResult<()> {
        self.driver.set_bias(self.pin_index, bias)?;
        self.bias = bias;
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

impl Drop for RawGpioPin<'_> {
    fn drop(&mut self) {
        _ = self.driver.reset(self.pin_index);
        self.driver.used_pins.set_aliased(self.pin_index, false);
        trace!("Released pin {}", self.pin_index);
    }
}

struct RawGpioInput<'a> {
    pin: RawGpioPin<'a>,
}

impl Debug for RawGpioInput<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[input]", self.pin)
    }
}

impl GpioInput for RawGpioInput<'_> {
    fn read(&self) -> GpioResult<bool> {
        let level = self.pin.driver.level(self.pin.pin_index)?;
        Ok(self.pin.active_level.get_state(level))
    }
}

struct RawGpioOutput<'a> {
    pin: RawGpioPin<'a>,
}

impl Debug for RawGpioOutput<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[output]", self.pin)
    }
}

impl GpioOutput for RawGpioOutput<'_> {
    fn write(&self, value: bool) -> GpioResult<()> {
        let pin = &self.pin;
        pin.driver.drive(pin.pin_index, pin.active_level.get_state(value), pin.drive_mode)
    }
}
