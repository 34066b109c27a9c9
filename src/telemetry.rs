//! Traits for the external collaborators a characterization run talks to
//!
//! The cryostat thermometry, IF power meters, and LO chain live on other
//! buses entirely (a GPIB bridge and a synthesizer serial link in
//! production). This crate treats them as black boxes: the sweep and servo
//! engines call through these traits and surface failures to the caller
//! without retrying. Nothing here opens hardware.

use crate::{
    error::Error,
    units::{ Kelvin, Watt },
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{ AtomicU64, Ordering },
        Mutex,
    },
};
use tracing::{ debug, error, info, warn };

/// Lower edge of the LO chain's output range in GHz
pub const LO_FREQ_MIN: f64 = 216.0;

/// Upper edge of the LO chain's output range in GHz
pub const LO_FREQ_MAX: f64 = 285.0;

/// YIG oscillator frequency for a requested LO frequency.
///
/// The LO chain multiplies the YIG by 12; requests outside the chain's range
/// are clamped, not rejected, matching how operators drive it by hand.
pub fn yig_frequency(lo_ghz: f64) -> f64
{
    let clamped = lo_ghz.clamp(LO_FREQ_MIN, LO_FREQ_MAX);
    if clamped != lo_ghz {
        debug!(lo_ghz, clamped, "LO frequency request outside range, clamped");
    }
    clamped / 12.0
}

/// Slow sensors sampled alongside sweep points
#[allow(async_fn_in_trait)]
pub trait TelemetryClient
{
    /// Cryostat temperature map keyed by monitor channel
    async fn read_temperature(&mut self) -> Result<BTreeMap<u8, Kelvin>, Error>;

    /// Detected power on one IF chain
    async fn if_power(&mut self, if_channel: u8) -> Result<Watt, Error>;

    /// Detected LO drive power
    async fn lo_power(&mut self) -> Result<Watt, Error>;
}

/// The two LO knobs the servo loops drive
#[allow(async_fn_in_trait)]
pub trait LoActuator
{
    /// Tune the LO chain. Implementations receive the requested LO frequency
    /// in GHz and are expected to program the YIG via [`yig_frequency`].
    async fn set_frequency(&mut self, lo_ghz: f64) -> Result<(), Error>;

    /// Set the ferrite attenuator control voltage
    async fn set_power_voltage(&mut self, volts: f64) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity
{
    Debug,
    Info,
    Warning,
    Error,
}

/// Operator-facing progress lines from long-running engines.
///
/// Emitting must never fail: a sweep that completed should not be reported as
/// broken because a log line could not be persisted. Implementations that
/// write somewhere fallible swallow the failure and count it instead.
pub trait EventSink
{
    fn emit(&self, severity: Severity, message: &str);

    /// Number of events that could not be persisted since construction
    fn dropped_events(&self) -> u64
    {
        0
    }
}

/// Default sink: forwards every event to `tracing` and nothing else
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink
{
    fn emit(&self, severity: Severity, message: &str)
    {
        match severity {
            Severity::Debug => debug!("{}", message),
            Severity::Info => info!("{}", message),
            Severity::Warning => warn!("{}", message),
            Severity::Error => error!("{}", message),
        }
    }
}

/// A persistence backend whose writes can fail (a database logger, a file)
pub trait FallibleSink
{
    fn persist(&mut self, severity: Severity, message: &str) -> Result<(), Error>;
}

/// Wraps a [`FallibleSink`] into an infallible [`EventSink`].
///
/// Events always reach `tracing`; persistence failures increment the health
/// counter and are otherwise invisible to the engine that emitted them.
pub struct GuardedSink<F>
{
    inner: Mutex<F>,
    dropped: AtomicU64,
}

impl <F> GuardedSink<F>
where
    F: FallibleSink,
{
    pub fn new(inner: F) -> Self
    {
        Self {
            inner: Mutex::new(inner),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn into_inner(self) -> F
    where
        F: Sized,
    {
        match self.inner.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl <F> EventSink for GuardedSink<F>
where
    F: FallibleSink,
{
    fn emit(&self, severity: Severity, message: &str)
    {
        TracingSink.emit(severity, message);

        let outcome = match self.inner.lock() {
            Ok(mut inner) => inner.persist(severity, message),
            Err(mut poisoned) => poisoned.get_mut().persist(severity, message),
        };
        if let Err(cause) = outcome {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("event sink persistence failed: {}", cause);
        }
    }

    fn dropped_events(&self) -> u64
    {
        self.dropped.load(Ordering::Relaxed)
    }
}
