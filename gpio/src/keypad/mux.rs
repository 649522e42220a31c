use std::fmt::{Debug, Formatter};
use std::thread;
use std::time::Duration;
use bitvec::vec::BitVec;
use log::debug;
use thiserror::Error;
use crate::{GpioBias, GpioDriver, GpioError, GpioInput, GpioOutput};
use crate::keypad::{KeyEvent, KeyScanner};

#[derive(Debug, Error, Eq, PartialEq, Clone)]
pub enum MuxError {
    #[error("the multiplexer needs at least one channel")]
    NoChannels,
    #[error("{channels} channels need {required} select lines, got {supplied}")]
    NotEnoughSelectLines {
        channels: usize,
        required: usize,
        supplied: usize,
    },
    #[error("{channels} channels use exactly {required} select lines, got {supplied}")]
    SelectWidthMismatch {
        channels: usize,
        required: usize,
        supplied: usize,
    },
    #[error("pin {0} is assigned more than once")]
    DuplicatePin(usize),
    #[error("channel {channel} is out of range (0..{count})")]
    ChannelOutOfRange { channel: usize, count: usize },
    #[error(transparent)]
    Gpio(#[from] GpioError),
}

pub type MuxResult<T> = Result<T, MuxError>;

/// Gets the number of select lines needed to address `channels` channels, i.e. `ceil(log2(channels))`.
pub fn required_select_lines(channels: usize) -> usize {
    if channels <= 1 {
        0
    } else {
        (usize::BITS - (channels - 1).leading_zeros()) as usize
    }
}

/// Wiring and timing of a multiplexed keypad.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MuxScannerConfig {
    /// Select (address) pins, least significant bit first.
    pub select_pins: Vec<usize>,
    /// The shared signal pin the multiplexer connects the addressed key to.
    pub signal_pin: usize,
    /// The active-low enable pin of the multiplexer.
    pub enable_pin: usize,
    /// The number of keys wired to the multiplexer.
    pub key_count: usize,
    /// How long to wait after addressing a channel before sampling the signal pin.
    pub settle_time: Duration,
    /// Bias for the signal pin. Leave at [GpioBias::None] when the board has its own pull-up.
    pub signal_bias: GpioBias,
}

impl MuxScannerConfig {
    pub const DEFAULT_SETTLE_TIME: Duration = Duration::from_millis(10);

    /// Creates a config using every address the select pins can reach.
    pub fn new(select_pins: Vec<usize>, signal_pin: usize, enable_pin: usize) -> Self {
        let key_count = u32::try_from(select_pins.len())
            .ok()
            .and_then(|width| 1usize.checked_shl(width))
            .unwrap_or(usize::MAX);

        MuxScannerConfig {
            select_pins,
            signal_pin,
            enable_pin,
            key_count,
            settle_time: Self::DEFAULT_SETTLE_TIME,
            signal_bias: GpioBias::None,
        }
    }

    pub fn with_key_count(mut self, key_count: usize) -> Self {
        self.key_count = key_count;
        self
    }

    pub fn with_settle_time(mut self, settle_time: Duration) -> Self {
        self.settle_time = settle_time;
        self
    }

    pub fn with_signal_bias(mut self, signal_bias: GpioBias) -> Self {
        self.signal_bias = signal_bias;
        self
    }

    /// Checks the config without touching any hardware.
    ///
    /// # Errors
    /// - `MuxError::NoChannels` if `key_count` is zero.
    /// - `MuxError::NotEnoughSelectLines` if the select pins can't address every key.
    /// - `MuxError::SelectWidthMismatch` if there are more select pins than `ceil(log2(key_count))`.
    /// - `MuxError::DuplicatePin` if a pin appears twice.
    pub fn validate(&self) -> MuxResult<()> {
        if self.key_count == 0 {
            return Err(MuxError::NoChannels);
        }

        let required = required_select_lines(self.key_count);
        let supplied = self.select_pins.len();
        if supplied < required {
            return Err(MuxError::NotEnoughSelectLines {
                channels: self.key_count,
                required,
                supplied,
            });
        }
        if supplied > required {
            return Err(MuxError::SelectWidthMismatch {
                channels: self.key_count,
                required,
                supplied,
            });
        }

        let mut seen = Vec::with_capacity(self.select_pins.len() + 2);
        for &pin in self.select_pins.iter().chain([&self.signal_pin, &self.enable_pin]) {
            if seen.contains(&pin) {
                return Err(MuxError::DuplicatePin(pin));
            }
            seen.push(pin);
        }

        Ok(())
    }
}

/// The select lines of the multiplexer, presenting a channel number as a parallel address.
struct SelectBus<'a> {
    lines: Vec<Box<dyn GpioOutput + 'a>>,
    channel_count: usize,
}

impl SelectBus<'_> {
    fn select(&self, channel: usize) -> MuxResult<()> {
        if channel >= self.channel_count {
            return Err(MuxError::ChannelOutOfRange {
                channel,
                count: self.channel_count,
            });
        }

        for (bit, line) in self.lines.iter().enumerate() {
            let high = u32::try_from(bit)
                .ok()
                .and_then(|bit| channel.checked_shr(bit))
                .is_some_and(|shifted| shifted & 1 == 1);
            line.write(high)?;
        }
        Ok(())
    }
}

impl Debug for SelectBus<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.lines).finish()
    }
}

/// Scans keys wired through an analog multiplexer (e.g. a CD74HC4067) sharing one signal pin.
///
/// The switches are active-low: a closed switch pulls the signal line low.
/// Every pass addresses each channel in turn, waits for the signal to settle and samples it,
/// then reports the lowest channel whose level differs from the last reported one.
/// Simultaneous changes come out one per pass, lowest channel first.
///
/// A pass blocks for `key_count × settle_time`.
pub struct MuxScanner<'a> {
    select: SelectBus<'a>,
    signal: Box<dyn GpioInput + 'a>,
    enable: Box<dyn GpioOutput + 'a>,
    settle_time: Duration,
    /// Last reported raw level per channel, `true` when released.
    state: BitVec,
    /// Raw levels sampled by the current pass.
    samples: BitVec,
}

impl Debug for MuxScanner<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MuxScanner({:?}, {:?}, {:?})",
            self.select, self.signal, self.enable
        )
    }
}

impl<'a> MuxScanner<'a> {
    /// Claims the configured pins, idles the select lines on channel 0 and enables the multiplexer.
    ///
    /// All keys start out released.
    ///
    /// # Errors
    /// - Any [MuxScannerConfig::validate] error.
    /// - `MuxError::Gpio` if a pin can't be claimed or driven. Pins claimed so far are released.
    pub fn new(driver: &'a dyn GpioDriver, config: &MuxScannerConfig) -> MuxResult<Self> {
        config.validate()?;

        let lines = config
            .select_pins
            .iter()
            .map(|&pin| driver.claim_output(pin))
            .collect::<Result<Vec<_>, _>>()?;
        for line in &lines {
            line.write(false)?;
        }
        let select = SelectBus {
            lines,
            channel_count: config.key_count,
        };

        let signal = driver.claim_input(config.signal_pin, config.signal_bias)?;

        let enable = driver.claim_output(config.enable_pin)?;
        enable.write(false)?;

        let scanner = MuxScanner {
            select,
            signal,
            enable,
            settle_time: config.settle_time,
            state: BitVec::repeat(true, config.key_count),
            samples: BitVec::repeat(true, config.key_count),
        };
        debug!("{:?} enabled with {} keys.", scanner, config.key_count);

        Ok(scanner)
    }

    /// Addresses `channel` on the select lines, bit 0 on the first line.
    ///
    /// # Errors
    /// - `MuxError::ChannelOutOfRange` if `channel >= key_count()`. Nothing is written then.
    pub fn select(&self, channel: usize) -> MuxResult<()> {
        self.select.select(channel)
    }

    pub fn settle_time(&self) -> Duration {
        self.settle_time
    }

    /// Gets the number of select lines in use.
    pub fn select_width(&self) -> usize {
        self.select.lines.len()
    }

    /// Releases the select and signal lines.
    ///
    /// The enable line is handed back still claimed and driven low, so the multiplexer stays
    /// enabled until the caller drops it.
    pub fn deinit(self) -> Box<dyn GpioOutput + 'a> {
        let MuxScanner { select, signal, enable, .. } = self;
        debug!("{:?} and {:?} released, {:?} kept enabled.", select, signal, enable);
        enable
    }
}

impl KeyScanner for MuxScanner<'_> {
    type Error = MuxError;

    fn scan_for_changes(&mut self) -> MuxResult<Option<KeyEvent>> {
        for channel in 0..self.state.len() {
            self.select.select(channel)?;
            if !self.settle_time.is_zero() {
                thread::sleep(self.settle_time);
            }
            let level = self.signal.read()?;
            self.samples.set(channel, level);
        }

        let changed = (0..self.state.len()).find(|&channel| self.state[channel] != self.samples[channel]);
        let Some(channel) = changed else {
            return Ok(None);
        };

        let level = self.samples[channel];
        self.state.set(channel, level);

        Ok(Some(KeyEvent::new(channel, !level)))
    }

    fn key_count(&self) -> usize {
        self.state.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimGpioDriver;

    const SELECT: [usize; 4] = [10, 11, 12, 13];
    const SIGNAL: usize = 28;
    const ENABLE: usize = 14;

    fn config() -> MuxScannerConfig {
        MuxScannerConfig::new(SELECT.to_vec(), SIGNAL, ENABLE).with_settle_time(Duration::ZERO)
    }

    #[test]
    fn select_line_count_is_ceil_log2() {
        assert_eq!(required_select_lines(1), 0);
        assert_eq!(required_select_lines(2), 1);
        assert_eq!(required_select_lines(3), 2);
        assert_eq!(required_select_lines(8), 3);
        assert_eq!(required_select_lines(9), 4);
        assert_eq!(required_select_lines(16), 4);
        assert_eq!(required_select_lines(17), 5);
    }

    #[test]
    fn default_config_matches_reference_board() {
        let config = MuxScannerConfig::new(SELECT.to_vec(), SIGNAL, ENABLE);
        assert_eq!(config.key_count, 16);
        assert_eq!(config.settle_time, Duration::from_millis(10));
        assert_eq!(config.signal_bias, GpioBias::None);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn zero_keys_is_rejected() {
        assert_eq!(config().with_key_count(0).validate(), Err(MuxError::NoChannels));
    }

    #[test]
    fn too_few_select_lines_is_rejected() {
        let config = MuxScannerConfig::new(vec![10, 11, 12], SIGNAL, ENABLE).with_key_count(16);
        assert_eq!(
            config.validate(),
            Err(MuxError::NotEnoughSelectLines {
                channels: 16,
                required: 4,
                supplied: 3,
            })
        );
    }

    #[test]
    fn surplus_select_lines_are_rejected() {
        assert_eq!(
            config().with_key_count(5).validate(),
            Err(MuxError::SelectWidthMismatch {
                channels: 5,
                required: 3,
                supplied: 4,
            })
        );
        assert_eq!(
            config().with_key_count(1).validate(),
            Err(MuxError::SelectWidthMismatch {
                channels: 1,
                required: 0,
                supplied: 4,
            })
        );

        let sim = SimGpioDriver::new(32);
        let err = MuxScanner::new(&sim, &config().with_key_count(8)).unwrap_err();
        assert!(matches!(err, MuxError::SelectWidthMismatch { channels: 8, required: 3, supplied: 4 }));
        for pin in SELECT.into_iter().chain([SIGNAL, ENABLE]) {
            assert!(!sim.is_claimed(pin));
        }
    }

    #[test]
    fn non_power_of_two_key_count_fits_its_bus() {
        let config = MuxScannerConfig::new(vec![10, 11, 12], SIGNAL, ENABLE)
            .with_key_count(5)
            .with_settle_time(Duration::ZERO);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn shared_pins_are_rejected() {
        let config = MuxScannerConfig::new(vec![10, 11, 12, 14], SIGNAL, ENABLE);
        assert_eq!(config.validate(), Err(MuxError::DuplicatePin(14)));

        let config = MuxScannerConfig::new(SELECT.to_vec(), 7, 7);
        assert_eq!(config.validate(), Err(MuxError::DuplicatePin(7)));
    }

    #[test]
    fn construction_enables_mux_once() {
        let sim = SimGpioDriver::new(32);
        let mut scanner = MuxScanner::new(&sim, &config()).unwrap();

        assert!(!sim.level(ENABLE));
        assert_eq!(sim.write_count(ENABLE), 1);
        for pin in SELECT {
            assert!(!sim.level(pin));
        }

        scanner.scan_for_changes().unwrap();
        assert_eq!(sim.write_count(ENABLE), 1);
    }

    #[test]
    fn select_writes_binary_address_lsb_first() {
        let sim = SimGpioDriver::new(32);
        let scanner = MuxScanner::new(&sim, &config()).unwrap();

        scanner.select(10).unwrap();
        let levels: Vec<bool> = SELECT.iter().map(|&pin| sim.level(pin)).collect();
        assert_eq!(levels, [false, true, false, true]);

        scanner.select(10).unwrap();
        let again: Vec<bool> = SELECT.iter().map(|&pin| sim.level(pin)).collect();
        assert_eq!(again, levels);
    }

    #[test]
    fn select_out_of_range_is_rejected_without_writing() {
        let sim = SimGpioDriver::new(32);
        let scanner = MuxScanner::new(&sim, &config().with_key_count(12)).unwrap();
        scanner.select(3).unwrap();
        let writes = sim.write_count(SELECT[0]);

        assert_eq!(
            scanner.select(12),
            Err(MuxError::ChannelOutOfRange { channel: 12, count: 12 })
        );
        assert_eq!(scanner.select(16).unwrap_err(), MuxError::ChannelOutOfRange { channel: 16, count: 12 });
        assert_eq!(sim.write_count(SELECT[0]), writes);
        assert!(sim.level(SELECT[0]));
        assert!(sim.level(SELECT[1]));
    }

    #[test]
    fn failed_construction_releases_claimed_pins() {
        let sim = SimGpioDriver::new(32);
        let driver: &dyn GpioDriver = &sim;
        let _taken = driver.claim_output(ENABLE).unwrap();

        let err = MuxScanner::new(&sim, &config()).unwrap_err();
        assert_eq!(err, MuxError::Gpio(GpioError::AlreadyInUse));
        for pin in SELECT.into_iter().chain([SIGNAL]) {
            assert!(!sim.is_claimed(pin));
        }
    }

    #[test]
    fn missing_pins_are_reported() {
        let sim = SimGpioDriver::new(16);
        let err = MuxScanner::new(&sim, &config()).unwrap_err();
        assert_eq!(err, MuxError::Gpio(GpioError::InvalidArgument));
    }

    #[test]
    fn single_key_mux_uses_no_select_lines() {
        let sim = SimGpioDriver::new(4);
        let mux = sim.attach_multiplexer(&[], 0, 1, 1).unwrap();
        let config = MuxScannerConfig::new(Vec::new(), 0, 1).with_settle_time(Duration::ZERO);
        let mut scanner = MuxScanner::new(&sim, &config).unwrap();
        assert_eq!(scanner.key_count(), 1);
        assert_eq!(scanner.select_width(), 0);

        sim.press(mux, 0);
        let event = scanner.scan_for_changes().unwrap().unwrap();
        assert_eq!(event.channel(), 0);
        assert!(event.pressed());
    }
}
