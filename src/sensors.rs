//! Sensor access layer: the hardware seam traits and the sample source.
//!
//! [`SensorBus`] abstracts the physical bus (the real device reads a DHT
//! pair and a 4-channel ADC over I2C); [`SampleSource`] polls every
//! attached input through it and normalizes failures into sentinel values
//! so one broken sensor never aborts a tick. [`SimulatedBus`] stands in for
//! hardware with plausible drifting values and per-channel failure
//! injection.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::warn;

use crate::sample::CHANNEL_COUNT;

/// One addressable input on the sensor bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorChannel {
    Temperature,
    Humidity,
    /// ADC input index, 0..CHANNEL_COUNT
    Adc(u8),
}

impl std::fmt::Display for SensorChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorChannel::Temperature => write!(f, "temperature"),
            SensorChannel::Humidity => write!(f, "humidity"),
            SensorChannel::Adc(i) => write!(f, "adc{}", i),
        }
    }
}

/// A raw reading from one sensor input.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Degrees Celsius from the environmental sensor
    Celsius(f32),

    /// Relative humidity percent from the environmental sensor
    Percent(f32),

    /// Raw signed 16-bit ADC conversion
    Raw(i16),
}

/// Errors surfaced by a sensor bus implementation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// The device did not acknowledge the transaction
    NoAck,

    /// The transaction timed out
    Timeout,

    /// The requested channel does not exist on this bus
    InvalidChannel,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::NoAck => write!(f, "device did not acknowledge"),
            BusError::Timeout => write!(f, "bus transaction timed out"),
            BusError::InvalidChannel => write!(f, "no such sensor channel"),
        }
    }
}

impl std::error::Error for BusError {}

/// Exclusive-access sensor bus.
///
/// Exclusivity is enforced by the caller: the acquisition worker wraps the
/// bus in a mutex held only for the duration of one tick's reads.
pub trait SensorBus: Send {
    fn read(&mut self, channel: SensorChannel) -> Result<Reading, BusError>;
}

/// Wall-clock source with an authority flag.
///
/// `is_authoritative` flips true once an external time sync (SNTP on the
/// real device) has completed; before that, `now` reports the free-running
/// device clock.
pub trait ClockSource: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn is_authoritative(&self) -> bool;
}

/// System clock whose authority is set once by whoever completes a time
/// sync (the device wiring does this on the first link-up).
#[derive(Debug, Default)]
pub struct SystemClock {
    authoritative: AtomicBool,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that an external time sync has completed.
    pub fn mark_authoritative(&self) {
        self.authoritative.store(true, Ordering::Release);
    }
}

impl ClockSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn is_authoritative(&self) -> bool {
        self.authoritative.load(Ordering::Acquire)
    }
}

/// The normalized result of polling every attached sensor once.
#[derive(Debug, Clone, Copy)]
pub struct SensorFrame {
    pub temperature: f32,
    pub humidity: f32,
    pub channels: [i16; CHANNEL_COUNT],

    /// How many individual reads failed this tick
    pub failed_reads: u32,
}

/// Polls each attached sensor through the bus and substitutes sentinels on
/// failure (NaN for the environmental pair, 0 for ADC channels).
///
/// Owns no shared state; the caller holds the bus lock.
pub struct SampleSource;

impl SampleSource {
    /// Read every input once. A failed or mis-typed read is logged and
    /// replaced by its sentinel; the frame is always produced.
    pub fn poll(bus: &mut dyn SensorBus) -> SensorFrame {
        let mut frame = SensorFrame {
            temperature: f32::NAN,
            humidity: f32::NAN,
            channels: [0; CHANNEL_COUNT],
            failed_reads: 0,
        };

        match bus.read(SensorChannel::Temperature) {
            Ok(Reading::Celsius(v)) => frame.temperature = v,
            Ok(other) => {
                warn!(channel = %SensorChannel::Temperature, reading = ?other,
                    "Unexpected reading type, substituting sentinel");
                frame.failed_reads += 1;
            }
            Err(e) => {
                warn!(channel = %SensorChannel::Temperature, error = %e,
                    "Sensor read failed, substituting sentinel");
                frame.failed_reads += 1;
            }
        }

        match bus.read(SensorChannel::Humidity) {
            Ok(Reading::Percent(v)) => frame.humidity = v,
            Ok(other) => {
                warn!(channel = %SensorChannel::Humidity, reading = ?other,
                    "Unexpected reading type, substituting sentinel");
                frame.failed_reads += 1;
            }
            Err(e) => {
                warn!(channel = %SensorChannel::Humidity, error = %e,
                    "Sensor read failed, substituting sentinel");
                frame.failed_reads += 1;
            }
        }

        for i in 0..CHANNEL_COUNT as u8 {
            match bus.read(SensorChannel::Adc(i)) {
                Ok(Reading::Raw(v)) => frame.channels[i as usize] = v,
                Ok(other) => {
                    warn!(channel = %SensorChannel::Adc(i), reading = ?other,
                        "Unexpected reading type, substituting sentinel");
                    frame.failed_reads += 1;
                }
                Err(e) => {
                    warn!(channel = %SensorChannel::Adc(i), error = %e,
                        "Sensor read failed, substituting sentinel");
                    frame.failed_reads += 1;
                }
            }
        }

        frame
    }
}

/// Simulated sensor bus producing plausible drifting values.
///
/// Individual channels can be marked as failing to exercise the sentinel
/// path end to end without hardware.
pub struct SimulatedBus {
    temperature: f32,
    humidity: f32,
    channels: [i16; CHANNEL_COUNT],
    failing_env: [bool; 2],
    failing_adc: [bool; CHANNEL_COUNT],
    rng: StdRng,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self {
            temperature: 27.0,
            humidity: 62.0,
            channels: [12_000, 11_500, 13_200, 12_800],
            failing_env: [false; 2],
            failing_adc: [false; CHANNEL_COUNT],
            rng: StdRng::from_entropy(),
        }
    }

    /// Mark one channel as permanently failing (miswired sensor).
    pub fn fail_channel(&mut self, channel: SensorChannel) {
        match channel {
            SensorChannel::Temperature => self.failing_env[0] = true,
            SensorChannel::Humidity => self.failing_env[1] = true,
            SensorChannel::Adc(i) => {
                if (i as usize) < CHANNEL_COUNT {
                    self.failing_adc[i as usize] = true;
                }
            }
        }
    }

    fn drift(&mut self, value: f32, step: f32, min: f32, max: f32) -> f32 {
        (value + self.rng.gen_range(-step..=step)).clamp(min, max)
    }
}

impl SensorBus for SimulatedBus {
    fn read(&mut self, channel: SensorChannel) -> Result<Reading, BusError> {
        match channel {
            SensorChannel::Temperature => {
                if self.failing_env[0] {
                    return Err(BusError::NoAck);
                }
                self.temperature = self.drift(self.temperature, 0.2, 5.0, 45.0);
                Ok(Reading::Celsius(self.temperature))
            }
            SensorChannel::Humidity => {
                if self.failing_env[1] {
                    return Err(BusError::NoAck);
                }
                self.humidity = self.drift(self.humidity, 0.5, 10.0, 95.0);
                Ok(Reading::Percent(self.humidity))
            }
            SensorChannel::Adc(i) => {
                let idx = i as usize;
                if idx >= CHANNEL_COUNT {
                    return Err(BusError::InvalidChannel);
                }
                if self.failing_adc[idx] {
                    return Err(BusError::Timeout);
                }
                let step: i16 = self.rng.gen_range(-50..=50);
                self.channels[idx] = self.channels[idx].saturating_add(step);
                Ok(Reading::Raw(self.channels[idx]))
            }
        }
    }
}
