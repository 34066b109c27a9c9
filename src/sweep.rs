//! I-V sweep engine
//!
//! # Purpose
//! The workhorse of mixer characterization: walk the bias set-point over a
//! closed voltage range, settle, and record the sensed voltage and current at
//! each point, optionally alongside cryostat temperatures and IF power.
//!
//! Whatever bias the junction was sitting at before the sweep is read back
//! first and restored on **every** exit path: normal completion, hardware
//! fault, or cooperative cancellation. A junction left parked at a sweep
//! endpoint is an operational hazard, so the restore is not best-effort.
//!
//! # Cancel Safety
//! Cancellation is cooperative, via [`StopFlag`], and only honored between
//! set-points; a transaction in flight always completes. A cancelled sweep
//! returns the rows collected so far with `cancelled` set.

use crate::{
    board::BoardContext,
    bus::BiasTransport,
    codec::{ AdcInput, LNA_DRAIN_MAX },
    error::Error,
    telemetry::TelemetryClient,
    units::{ Kelvin, Microamp, Millivolt, Volt, Watt },
};
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{ AtomicBool, Ordering },
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tracing::{ debug, info, warn };

/// Delay between writing a bias set-point and reading the sense outputs
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(10);

/// Delay between the temperature read and the IF power reads at each point
pub const TELEMETRY_SETTLE: Duration = Duration::from_millis(25);

/// Shared cooperative stop request. Cloning hands out another handle to the
/// same flag; once raised it stays raised.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag
{
    pub fn new() -> Self
    {
        Self::default()
    }

    pub fn stop(&self)
    {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool
    {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct SweepConfig
{
    pub channel: u8,
    /// Range endpoints in millivolts at the junction
    pub v_min: f64,
    pub v_max: f64,
    pub step: f64,
    pub settle: Duration,
    /// Apply the loaded calibration record to every sensed reading
    pub calibrated: bool,
}

impl SweepConfig
{
    pub fn new(channel: u8, v_min: f64, v_max: f64, step: f64) -> Self
    {
        Self {
            channel: channel,
            v_min: v_min,
            v_max: v_max,
            step: step,
            settle: DEFAULT_SETTLE,
            calibrated: false,
        }
    }

    pub fn settle(mut self, settle: Duration) -> Self
    {
        self.settle = settle;
        self
    }

    pub fn calibrated(mut self, calibrated: bool) -> Self
    {
        self.calibrated = calibrated;
        self
    }
}

/// One sweep row. Telemetry fields are populated only by the telemetry
/// variant; the row shape is otherwise identical.
#[derive(Debug, Clone)]
pub struct Reading
{
    /// Commanded junction voltage
    pub vsis: Millivolt,
    /// Sensed junction voltage
    pub vs: Millivolt,
    /// Sensed junction current
    pub is: Microamp,
    pub temperatures: Option<BTreeMap<u8, Kelvin>>,
    pub if_power: Vec<Watt>,
}

/// An ordered sweep table plus the restore confirmation
#[derive(Debug, Clone)]
pub struct SweepResult
{
    pub channel: u8,
    readings: Vec<Reading>,
    /// Sensed bias read back after the pre-sweep set-point was restored
    pub restored: Millivolt,
    /// True when the sweep ended early on a stop request
    pub cancelled: bool,
}

impl SweepResult
{
    pub fn readings(&self) -> &[Reading]
    {
        &self.readings
    }

    pub fn len(&self) -> usize
    {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.readings.is_empty()
    }
}

/// The closed set-point grid for a range, matching the half-open-plus-step
/// arithmetic operators expect: `v_min` inclusive, stepping until the upper
/// bound is reached or first exceeded by less than one step.
///
/// Rejected before any hardware call: non-finite or non-positive steps and
/// inverted ranges.
pub fn grid(v_min: f64, v_max: f64, step: f64) -> Result<Vec<f64>, Error>
{
    if !step.is_finite() || step <= 0.0 {
        return Err(Error::DegenerateStep(step));
    }
    if !v_min.is_finite() || !v_max.is_finite() || v_max < v_min {
        return Err(Error::InvertedRange { v_min: v_min, v_max: v_max });
    }

    // rounding the span keeps 0.1-style steps from losing the endpoint
    let count = ((v_max - v_min) / step + 0.5).floor() as usize + 1;
    Ok((0..count).map(|i| v_min + i as f64 * step).collect())
}

/// Sweep one channel, recording `Vsis, Vs, Is` per point
pub async fn sweep<T>(
    board: &mut BoardContext<T>,
    config: &SweepConfig,
    stop: &StopFlag,
) -> Result<SweepResult, Error>
where
    T: BiasTransport,
{
    run(board, None::<&mut Disconnected>, &[], config, stop).await
}

/// Sweep one channel, additionally recording the cryostat temperature map
/// and the detected power on each listed IF channel at every point.
///
/// Telemetry is a black box here: a failed sensor read aborts the sweep (the
/// restore still runs) and surfaces to the caller unretried.
pub async fn sweep_with_telemetry<T, C>(
    board: &mut BoardContext<T>,
    telemetry: &mut C,
    if_channels: &[u8],
    config: &SweepConfig,
    stop: &StopFlag,
) -> Result<SweepResult, Error>
where
    T: BiasTransport,
    C: TelemetryClient,
{
    run(board, Some(telemetry), if_channels, config, stop).await
}

async fn run<T, C>(
    board: &mut BoardContext<T>,
    telemetry: Option<&mut C>,
    if_channels: &[u8],
    config: &SweepConfig,
    stop: &StopFlag,
) -> Result<SweepResult, Error>
where
    T: BiasTransport,
    C: TelemetryClient,
{
    let points = grid(config.v_min, config.v_max, config.step)?;

    // the operating point to come back to, as the junction actually sees it
    let previous = board.read_vs(config.channel, config.calibrated).await?;
    info!(
        channel = config.channel,
        points = points.len(),
        previous = previous.value(),
        "sweep starting"
    );

    let outcome = run_points(board, telemetry, if_channels, config, &points, stop).await;
    let restore = restore_bias(board, config, previous).await;

    match outcome {
        Ok((readings, cancelled)) => {
            let restored = restore?;
            Ok(SweepResult {
                channel: config.channel,
                readings: readings,
                restored: restored,
                cancelled: cancelled,
            })
        },
        Err(cause) => {
            if let Err(restore_cause) = restore {
                warn!("bias restore also failed after sweep fault: {}", restore_cause);
            }
            Err(cause)
        },
    }
}

async fn run_points<T, C>(
    board: &mut BoardContext<T>,
    mut telemetry: Option<&mut C>,
    if_channels: &[u8],
    config: &SweepConfig,
    points: &[f64],
    stop: &StopFlag,
) -> Result<(Vec<Reading>, bool), Error>
where
    T: BiasTransport,
    C: TelemetryClient,
{
    let mut readings = Vec::with_capacity(points.len());
    let mut cancelled = false;

    for vsis in points {
        if stop.is_stopped() {
            info!(collected = readings.len(), "sweep stop requested");
            cancelled = true;
            break;
        }

        board.set_bias(&[config.channel], *vsis).await?;
        sleep(config.settle).await;
        let vs = board.read_vs(config.channel, config.calibrated).await?;
        let is = board.read_is(config.channel, config.calibrated).await?;

        let mut reading = Reading {
            vsis: Millivolt(*vsis),
            vs: vs,
            is: is,
            temperatures: None,
            if_power: Vec::new(),
        };
        if let Some(client) = telemetry.as_mut() {
            reading.temperatures = Some(client.read_temperature().await?);
            sleep(TELEMETRY_SETTLE).await;
            for if_channel in if_channels {
                reading.if_power.push(client.if_power(*if_channel).await?);
            }
        }
        debug!(vsis, vs = vs.value(), is = is.value(), "sweep point");
        readings.push(reading);
    }

    Ok((readings, cancelled))
}

async fn restore_bias<T>(
    board: &mut BoardContext<T>,
    config: &SweepConfig,
    previous: Millivolt,
) -> Result<Millivolt, Error>
where
    T: BiasTransport,
{
    board.set_bias(&[config.channel], previous.value()).await?;
    sleep(config.settle).await;
    let confirmed = board.read_vs(config.channel, config.calibrated).await?;
    info!(
        target = previous.value(),
        confirmed = confirmed.value(),
        "pre-sweep bias restored"
    );
    Ok(confirmed)
}

/// Placeholder client for sweeps that carry no telemetry; never called
struct Disconnected;

impl TelemetryClient for Disconnected
{
    async fn read_temperature(&mut self) -> Result<BTreeMap<u8, Kelvin>, Error>
    {
        Ok(BTreeMap::new())
    }

    async fn if_power(&mut self, _if_channel: u8) -> Result<Watt, Error>
    {
        Ok(Watt(0.0))
    }

    async fn lo_power(&mut self) -> Result<Watt, Error>
    {
        Ok(Watt(0.0))
    }
}

#[derive(Debug, Clone)]
pub struct LnaSweepConfig
{
    pub channel: u8,
    /// Drain range in volts, clamped to the drain limit before use
    pub v_min: f64,
    pub v_max: f64,
    pub step: f64,
    pub settle: Duration,
}

/// One LNA drain sweep row, raw monitor voltages at the ADC pin
#[derive(Debug, Clone, Copy)]
pub struct LnaReading
{
    pub drain: Volt,
    pub monitor_v: Volt,
    pub monitor_i: Volt,
}

/// Sweep one LNA channel's drain supply, recording the raw drain voltage and
/// current monitor outputs.
///
/// The drain range is clamped to `[0, LNA_DRAIN_MAX]`. Like the bias sweep,
/// the pre-sweep drain monitor voltage is read back first and re-commanded
/// on every exit path, so the amplifier comes out of the sweep at the
/// operating point it went in with.
pub async fn sweep_lna_drain<T>(
    board: &mut BoardContext<T>,
    config: &LnaSweepConfig,
    stop: &StopFlag,
) -> Result<Vec<LnaReading>, Error>
where
    T: BiasTransport,
{
    let v_min = config.v_min.clamp(0.0, LNA_DRAIN_MAX);
    let v_max = config.v_max.clamp(0.0, LNA_DRAIN_MAX);
    if v_min != config.v_min || v_max != config.v_max {
        debug!(v_min, v_max, "LNA drain range clamped");
    }
    let points = grid(v_min, v_max, config.step)?;

    let previous = board.adc_read(config.channel, AdcInput::LnaVoltage).await?;

    let outcome = run_lna_points(board, config, &points, stop).await;
    let restore = restore_lna_drain(board, config, previous).await;

    match outcome {
        Ok(readings) => {
            restore?;
            Ok(readings)
        },
        Err(cause) => {
            if let Err(restore_cause) = restore {
                warn!("drain restore also failed after LNA sweep fault: {}", restore_cause);
            }
            Err(cause)
        },
    }
}

async fn run_lna_points<T>(
    board: &mut BoardContext<T>,
    config: &LnaSweepConfig,
    points: &[f64],
    stop: &StopFlag,
) -> Result<Vec<LnaReading>, Error>
where
    T: BiasTransport,
{
    let mut readings = Vec::with_capacity(points.len());
    for drain in points {
        if stop.is_stopped() {
            info!(collected = readings.len(), "LNA drain sweep stop requested");
            break;
        }

        board.set_lna_drain(config.channel, *drain).await?;
        sleep(config.settle).await;
        let monitor_v = board.adc_read(config.channel, AdcInput::LnaVoltage).await?;
        let monitor_i = board.adc_read(config.channel, AdcInput::LnaCurrent).await?;
        readings.push(LnaReading {
            drain: Volt(*drain),
            monitor_v: monitor_v,
            monitor_i: monitor_i,
        });
    }

    Ok(readings)
}

async fn restore_lna_drain<T>(
    board: &mut BoardContext<T>,
    config: &LnaSweepConfig,
    previous: Volt,
) -> Result<(), Error>
where
    T: BiasTransport,
{
    board.set_lna_drain(config.channel, previous.value()).await?;
    sleep(config.settle).await;
    info!(drain = previous.value(), "pre-sweep drain restored");
    Ok(())
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn grid_includes_both_endpoints_of_the_standard_iv_range()
    {
        let points = grid(-2.0, 16.0, 0.1).unwrap();
        assert_eq!(points.len(), 181);
        assert!((points[0] - -2.0).abs() < 1e-9);
        assert!((points[180] - 16.0).abs() < 1e-9);
    }

    #[test]
    fn grid_overshoots_a_non_dividing_endpoint_by_less_than_a_step()
    {
        let points = grid(0.0, 1.0, 0.4).unwrap();
        assert_eq!(points.len(), 4);
        assert!((points[3] - 1.2).abs() < 1e-9);

        let points = grid(0.0, 1.0, 0.5).unwrap();
        assert_eq!(points.len(), 3);
        assert!((points[2] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn grid_rejects_degenerate_parameters()
    {
        assert!(matches!(grid(0.0, 1.0, 0.0), Err(Error::DegenerateStep(_))));
        assert!(matches!(grid(0.0, 1.0, -0.1), Err(Error::DegenerateStep(_))));
        assert!(matches!(grid(0.0, 1.0, f64::NAN), Err(Error::DegenerateStep(_))));
        assert!(matches!(grid(2.0, 1.0, 0.1), Err(Error::InvertedRange { .. })));
    }

    #[test]
    fn stop_flag_is_shared_and_sticky()
    {
        let flag = StopFlag::new();
        let clone = flag.clone();
        assert!(!flag.is_stopped());

        clone.stop();
        assert!(flag.is_stopped());
        assert!(clone.is_stopped());
    }
}
