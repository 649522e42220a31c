mod config;

use std::env::var;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use dotenv::dotenv;
use log::{debug, error, info};
use muxscan_gpio::GpioDriver;
use muxscan_gpio::gpiod::GpiodDriver;
use muxscan_gpio::keypad::{KeyScanner, MuxScanner};
use muxscan_gpio::raw::RawGpioDriver;
use sysinfo::System;
use time::OffsetDateTime;
use time::macros::format_description;
use crate::config::{Backend, Config};

fn open_driver(config: &Config) -> eyre::Result<Box<dyn GpioDriver>> {
    let driver: Box<dyn GpioDriver> = match config.backend {
        Backend::Gpiomem => Box::new(RawGpioDriver::new_gpiomem()?),
        Backend::Mem => Box::new(RawGpioDriver::new_mem()?),
        Backend::Gpiod => Box::new(GpiodDriver::open(&config.gpio_chip)?),
    };
    Ok(driver)
}

/// Polls the scanner until `running` is cleared or a line fails, logging every press and release.
fn run<S>(scanner: &mut S, poll_interval: Duration, running: &AtomicBool) -> eyre::Result<()>
where
    S: KeyScanner,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let mut pressed_at: Vec<Option<Instant>> = vec![None; scanner.key_count()];

    while running.load(Ordering::SeqCst) {
        if let Some(event) = scanner.scan_for_changes()? {
            let channel = event.channel();
            if event.pressed() {
                pressed_at[channel] = Some(event.timestamp());
                info!("Key {} pressed.", channel);
            } else {
                match pressed_at[channel].take() {
                    Some(since) => info!(
                        "Key {} released after {:?}.",
                        channel,
                        event.timestamp().duration_since(since)
                    ),
                    None => info!("Key {} released.", channel),
                }
            }
        }

        thread::sleep(poll_interval);
    }

    info!("Scan loop stopped.");
    Ok(())
}

fn main() -> eyre::Result<()> {
    dotenv().ok();
    pretty_env_logger::init();

    const UNKNOWN_STR: &str = "???";

    let started = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    let started = started
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_else(|_| UNKNOWN_STR.to_string());
    info!("muxscan v{} starting at {}...", env!("CARGO_PKG_VERSION"), started);
    info!(
        "System ver {} kernel ver {}",
        System::long_os_version().as_deref().unwrap_or(UNKNOWN_STR),
        System::kernel_version().as_deref().unwrap_or(UNKNOWN_STR),
    );
    info!(
        "Hostname {}",
        System::host_name().as_deref().unwrap_or(UNKNOWN_STR)
    );
    info!("Architecture {}", System::cpu_arch());

    debug!("Trying to load config...");
    let mut config = if let Some(config) = Config::try_load()? {
        info!("Config loaded.");
        config
    } else {
        info!("Config not found. Using default");
        let config = Config::default();
        config.save()?;
        info!("Default config saved.");
        config
    };
    config.apply_overrides(|key| var(key).ok())?;

    info!(
        "Mux @ Select: {:?}, Signal: {}, Enable: {}, {} keys, {} ms settle",
        config.select_pins, config.signal_pin, config.enable_pin, config.key_count, config.settle_time_ms
    );

    debug!("Initializing GPIO driver...");
    let gpio = open_driver(&config)?;
    debug!("{:?} initialized.", gpio);

    let running = Arc::new(AtomicBool::new(true));
    let running_handler = running.clone();
    ctrlc::set_handler(move || running_handler.store(false, Ordering::SeqCst))?;

    let mut scanner = MuxScanner::new(&*gpio, &config.scanner_config())?;

    info!("Starting scan loop...");
    let result = run(&mut scanner, config.poll_interval(), &running);
    if let Err(err) = &result {
        error!("Scanning stopped: {}", err);
    }

    // Enable line goes last, after the select and signal lines
    drop(scanner.deinit());
    result
}
