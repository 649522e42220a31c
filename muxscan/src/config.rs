use std::env::var_os;
use std::ffi::OsStr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use dotenv::var;
use eyre::WrapErr;
use muxscan_gpio::GpioBias;
use muxscan_gpio::keypad::MuxScannerConfig;
use serde::{Serialize, Deserialize};

/// Which GPIO driver to open.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Default, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Memory-mapped registers through `/dev/gpiomem`.
    #[default]
    Gpiomem,
    /// Memory-mapped registers through `/dev/mem`.
    Mem,
    /// The GPIO character device at [Config::gpio_chip].
    Gpiod,
}

impl FromStr for Backend {
    type Err = eyre::Report;

    fn from_str(s: &str) -> eyre::Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gpiomem" => Ok(Backend::Gpiomem),
            "mem" => Ok(Backend::Mem),
            "gpiod" => Ok(Backend::Gpiod),
            other => Err(eyre::eyre!("Unknown GPIO backend {:?}", other)),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
#[serde(default)]
pub struct Config {
    pub backend: Backend,
    pub gpio_chip: String,
    /// S0..Sn, least significant first.
    pub select_pins: Vec<usize>,
    pub signal_pin: usize,
    pub enable_pin: usize,
    pub key_count: usize,
    pub settle_time_ms: u64,
    pub poll_interval_ms: u64,
    /// Enables the internal pull-up on the signal pin, for boards without an external one.
    pub signal_pull_up: bool,
}

impl Config {
    /// Loads the config file named by `CONFIG_FILE`, `muxscan.json` by default.
    ///
    /// `Ok(None)` means there is no config file yet.
    pub fn try_load() -> eyre::Result<Option<Self>> {
        let config_str = var_os("CONFIG_FILE");
        let config_str: &OsStr = config_str.as_deref().unwrap_or(OsStr::new("muxscan.json"));
        Self::load_from(Path::new(config_str))
    }

    /// Loads a config file, failing on files that can't be read or parsed.
    pub fn load_from(config_path: &Path) -> eyre::Result<Option<Self>> {
        if !config_path.exists() {
            return Ok(None);
        }

        let file = std::fs::File::open(config_path)
            .wrap_err_with(|| format!("Cannot open config file {}", config_path.display()))?;
        let reader = std::io::BufReader::new(file);
        let config = serde_json::from_reader(reader)
            .wrap_err_with(|| format!("Invalid config file {}", config_path.display()))?;
        Ok(Some(config))
    }

    pub fn save(&self) -> std::io::Result<()> {
        let config_str = var("CONFIG_FILE").unwrap_or_else(|_| "muxscan.json".to_string());
        let config_path = Path::new(&config_str);
        let file = std::fs::File::create(config_path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Applies `MUXSCAN_*` overrides looked up through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<()> {
        if let Some(value) = lookup("MUXSCAN_BACKEND") {
            self.backend = value.parse()?;
        }
        if let Some(value) = lookup("MUXSCAN_GPIO_CHIP") {
            self.gpio_chip = value;
        }
        if let Some(value) = lookup("MUXSCAN_PINS_SELECT") {
            self.select_pins = parse_pin_list(&value)?;
        }
        if let Some(value) = lookup("MUXSCAN_PIN_SIGNAL") {
            self.signal_pin = value.trim().parse()?;
        }
        if let Some(value) = lookup("MUXSCAN_PIN_ENABLE") {
            self.enable_pin = value.trim().parse()?;
        }
        if let Some(value) = lookup("MUXSCAN_KEY_COUNT") {
            self.key_count = value.trim().parse()?;
        }
        if let Some(value) = lookup("MUXSCAN_SETTLE_MS") {
            self.settle_time_ms = value.trim().parse()?;
        }
        if let Some(value) = lookup("MUXSCAN_POLL_MS") {
            self.poll_interval_ms = value.trim().parse()?;
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn scanner_config(&self) -> MuxScannerConfig {
        let bias = if self.signal_pull_up { GpioBias::PullUp } else { GpioBias::None };
        MuxScannerConfig::new(self.select_pins.clone(), self.signal_pin, self.enable_pin)
            .with_key_count(self.key_count)
            .with_settle_time(Duration::from_millis(self.settle_time_ms))
            .with_signal_bias(bias)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: Backend::default(),
            gpio_chip: "/dev/gpiochip0".to_string(),
            select_pins: vec![10, 11, 12, 13],
            signal_pin: 28,
            enable_pin: 14,
            key_count: 16,
            settle_time_ms: 10,
            poll_interval_ms: 1,
            signal_pull_up: false,
        }
    }
}

/// Parses a list of pin numbers separated by commas, spaces or semicolons.
pub fn parse_pin_list(pin_str: &str) -> eyre::Result<Vec<usize>> {
    let pins = pin_str
        .split([',', ' ', ';'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.parse())
        .collect::<Result<Vec<_>, _>>()?;

    if pins.is_empty() {
        return Err(eyre::eyre!("No select pins given"));
    }
    Ok(pins)
}
