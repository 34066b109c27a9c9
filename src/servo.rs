//! Closed-loop step-search controllers
//!
//! # Purpose
//! Two slow control loops built on the same engine: holding the junction
//! current in a target band by trimming the LO ferrite attenuator voltage,
//! and holding the sensed junction voltage in a band by trimming the bias
//! set-point. Both assume the measured value increases monotonically with
//! the actuator over the working range; the loop steps toward the band and
//! stops at a hard bound on either side.
//!
//! Hitting a bound is a named terminal outcome, not an error: the caller
//! gets the last actuator value and reading either way and decides what the
//! saturation means operationally.

use crate::{
    board::BoardContext,
    bus::BiasTransport,
    error::Error,
    sweep::StopFlag,
    telemetry::LoActuator,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{ debug, info, warn };

/// Ferrite attenuator response time; dominated by the LO chain, not the bus
pub const LO_SETTLE: Duration = Duration::from_secs(10);

/// Bias DAC settle when the servo actuator is the bias set-point itself
pub const BIAS_SERVO_SETTLE: Duration = Duration::from_millis(5);

/// Settle after an initial bias set-point written before a current servo run
pub const PRE_SERVO_BIAS_SETTLE: Duration = Duration::from_millis(50);

/// Hard limits and default step for the ferrite attenuator voltage
pub const FERRITE_MIN: f64 = -1.0;
pub const FERRITE_MAX: f64 = 0.7;
pub const FERRITE_STEP: f64 = 0.05;

/// Hard limits and default step for the bias set-point in millivolts
pub const BIAS_MIN: f64 = -20.0;
pub const BIAS_MAX: f64 = 20.0;
pub const BIAS_STEP: f64 = 0.05;

/// Closed acceptance band on the measured value
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Band
{
    pub low: f64,
    pub high: f64,
}

/// Where a reading sits relative to the band, named by the drive direction
/// it implies on a monotone increasing plant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deviation
{
    /// Below the band; the actuator must increase
    Low,
    Inside,
    /// Above the band; the actuator must decrease
    High,
}

impl Band
{
    pub fn new(low: f64, high: f64) -> Self
    {
        Self { low: low, high: high }
    }

    pub fn classify(&self, value: f64) -> Deviation
    {
        if value < self.low {
            Deviation::Low
        } else if value > self.high {
            Deviation::High
        } else {
            Deviation::Inside
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServoConfig
{
    pub band: Band,
    /// Initial actuator value, clamped into `[min, max]` before the first step
    pub start: f64,
    pub step: f64,
    pub min: f64,
    pub max: f64,
    /// Delay between moving the actuator and trusting the next reading
    pub settle: Duration,
    /// Optional cap on loop iterations; `None` runs until a band or bound.
    /// When the cap trips the loop reports `Saturated` at wherever it stood.
    pub max_iterations: Option<u32>,
}

impl ServoConfig
{
    /// Ferrite attenuator servo with the production limits and LO settle
    pub fn ferrite(band: Band, start: f64) -> Self
    {
        Self {
            band: band,
            start: start,
            step: FERRITE_STEP,
            min: FERRITE_MIN,
            max: FERRITE_MAX,
            settle: LO_SETTLE,
            max_iterations: None,
        }
    }

    /// Bias set-point servo with the production limits and DAC settle
    pub fn bias(band: Band, start: f64) -> Self
    {
        Self {
            band: band,
            start: start,
            step: BIAS_STEP,
            min: BIAS_MIN,
            max: BIAS_MAX,
            settle: BIAS_SERVO_SETTLE,
            max_iterations: None,
        }
    }

    pub fn step(mut self, step: f64) -> Self
    {
        self.step = step;
        self
    }

    pub fn settle(mut self, settle: Duration) -> Self
    {
        self.settle = settle;
        self
    }

    pub fn max_iterations(mut self, cap: u32) -> Self
    {
        self.max_iterations = Some(cap);
        self
    }
}

/// How a servo run ended. The last actuator value and reading are always
/// reported; only `Converged` means the reading sits inside the band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ServoOutcome
{
    Converged
    {
        actuator: f64,
        reading: f64,
    },
    /// The loop reached a bound (or its iteration cap) with the reading
    /// still outside the band
    Saturated
    {
        actuator: f64,
        reading: f64,
    },
    /// A cooperative stop was requested before the loop finished
    Stopped
    {
        actuator: f64,
        reading: f64,
    },
}

impl ServoOutcome
{
    pub fn actuator(&self) -> f64
    {
        match self {
            Self::Converged { actuator, .. }
            | Self::Saturated { actuator, .. }
            | Self::Stopped { actuator, .. } => *actuator,
        }
    }

    pub fn reading(&self) -> f64
    {
        match self {
            Self::Converged { reading, .. }
            | Self::Saturated { reading, .. }
            | Self::Stopped { reading, .. } => *reading,
        }
    }

    pub fn converged(&self) -> bool
    {
        matches!(self, Self::Converged { .. })
    }
}

/// The actuator/sensor pair a servo drives
#[allow(async_fn_in_trait)]
pub trait ServoPlant
{
    async fn apply(&mut self, actuator: f64) -> Result<(), Error>;

    async fn measure(&mut self) -> Result<f64, Error>;
}

/// Run the step-search loop over any plant.
///
/// Applies the start value, settles, measures, then steps one increment at a
/// time toward the band, never past a bound. Parameter validation happens
/// before the plant is touched.
pub async fn run_servo<P>(
    plant: &mut P,
    config: &ServoConfig,
    stop: &StopFlag,
) -> Result<ServoOutcome, Error>
where
    P: ServoPlant,
{
    if !config.step.is_finite() || config.step <= 0.0 {
        return Err(Error::DegenerateStep(config.step));
    }
    if config.max < config.min {
        return Err(Error::InvertedRange { v_min: config.min, v_max: config.max });
    }

    let mut actuator = config.start.clamp(config.min, config.max);
    plant.apply(actuator).await?;
    sleep(config.settle).await;
    let mut reading = plant.measure().await?;

    let mut iterations = 0u32;
    loop {
        match config.band.classify(reading) {
            Deviation::Inside => {
                info!(actuator, reading, "servo converged");
                return Ok(ServoOutcome::Converged { actuator: actuator, reading: reading });
            },
            Deviation::High => {
                if actuator <= config.min {
                    info!(actuator, reading, "servo at lower bound");
                    return Ok(ServoOutcome::Saturated { actuator: actuator, reading: reading });
                }
                actuator = (actuator - config.step).max(config.min);
            },
            Deviation::Low => {
                if actuator >= config.max {
                    info!(actuator, reading, "servo at upper bound");
                    return Ok(ServoOutcome::Saturated { actuator: actuator, reading: reading });
                }
                actuator = (actuator + config.step).min(config.max);
            },
        }

        iterations += 1;
        if let Some(cap) = config.max_iterations {
            if iterations > cap {
                warn!(cap, actuator, "servo iteration cap reached");
                return Ok(ServoOutcome::Saturated { actuator: actuator, reading: reading });
            }
        }
        if stop.is_stopped() {
            info!(actuator, "servo stop requested");
            return Ok(ServoOutcome::Stopped { actuator: actuator, reading: reading });
        }

        debug!(iterations, actuator, reading, "servo step");
        plant.apply(actuator).await?;
        sleep(config.settle).await;
        reading = plant.measure().await?;
    }
}

struct CurrentPlant<'a, T, L>
{
    board: &'a mut BoardContext<T>,
    lo: &'a mut L,
    channel: u8,
    calibrated: bool,
}

impl <'a, T, L> ServoPlant for CurrentPlant<'a, T, L>
where
    T: BiasTransport,
    L: LoActuator,
{
    async fn apply(&mut self, actuator: f64) -> Result<(), Error>
    {
        self.lo.set_power_voltage(actuator).await
    }

    async fn measure(&mut self) -> Result<f64, Error>
    {
        Ok(self.board.read_is(self.channel, self.calibrated).await?.value())
    }
}

struct VoltagePlant<'a, T>
{
    board: &'a mut BoardContext<T>,
    channel: u8,
    calibrated: bool,
}

impl <'a, T> ServoPlant for VoltagePlant<'a, T>
where
    T: BiasTransport,
{
    async fn apply(&mut self, actuator: f64) -> Result<(), Error>
    {
        self.board.set_bias(&[self.channel], actuator).await
    }

    async fn measure(&mut self) -> Result<f64, Error>
    {
        Ok(self.board.read_vs(self.channel, self.calibrated).await?.value())
    }
}

/// Hold the junction current in `config.band` (microamps) by trimming the LO
/// ferrite attenuator voltage.
///
/// `vbias` optionally parks the junction at a known set-point first; `None`
/// servos at whatever bias is already applied.
pub async fn servo_current<T, L>(
    board: &mut BoardContext<T>,
    lo: &mut L,
    channel: u8,
    calibrated: bool,
    vbias: Option<f64>,
    config: &ServoConfig,
    stop: &StopFlag,
) -> Result<ServoOutcome, Error>
where
    T: BiasTransport,
    L: LoActuator,
{
    if let Some(vsis_mv) = vbias {
        board.set_bias(&[channel], vsis_mv).await?;
        sleep(PRE_SERVO_BIAS_SETTLE).await;
    }

    let mut plant = CurrentPlant {
        board: board,
        lo: lo,
        channel: channel,
        calibrated: calibrated,
    };
    run_servo(&mut plant, config, stop).await
}

/// Hold the sensed junction voltage in `config.band` (millivolts) by
/// trimming the bias set-point
pub async fn servo_voltage<T>(
    board: &mut BoardContext<T>,
    channel: u8,
    calibrated: bool,
    config: &ServoConfig,
    stop: &StopFlag,
) -> Result<ServoOutcome, Error>
where
    T: BiasTransport,
{
    let mut plant = VoltagePlant {
        board: board,
        channel: channel,
        calibrated: calibrated,
    };
    run_servo(&mut plant, config, stop).await
}
