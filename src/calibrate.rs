//! Sense-chain calibration
//!
//! The nominal resistor model in [`crate::codec::BiasParams`] is good to a
//! few percent; board-to-board spread in the sense amplifiers accounts for
//! the rest. Sweeping each channel over its linear region and fitting
//! `Vs = slope * Vsis + offset` captures that spread in a
//! [`CalibrationRecord`] that later sessions load and apply.

use crate::{
    error::Error,
    sweep::SweepResult,
    telemetry::{ EventSink, Severity },
};
use std::{
    collections::BTreeMap,
    time::SystemTime,
};
use tracing::info;

/// One calibration fit for one channel on one card
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationRecord
{
    pub card: u8,
    pub channel: u8,
    pub slope: f64,
    pub offset: f64,
    pub timestamp: SystemTime,
}

impl CalibrationRecord
{
    /// Corrected value for a raw sensed reading
    pub fn correct(&self, measured: f64) -> f64
    {
        (measured - self.offset) / self.slope
    }
}

/// Append-only home for calibration records.
///
/// Absence of a record is an expected answer, not a fault: a fresh board has
/// none until its first calibration run.
pub trait CalibrationStore
{
    fn append(&mut self, record: CalibrationRecord) -> Result<(), Error>;

    /// The most recent record for `(card, channel)` by timestamp
    fn latest(&self, card: u8, channel: u8) -> Option<CalibrationRecord>;
}

/// In-memory reference store
#[derive(Debug, Default)]
pub struct MemoryCalStore
{
    records: Vec<CalibrationRecord>,
}

impl MemoryCalStore
{
    pub fn new() -> Self
    {
        Self { records: Vec::new() }
    }

    pub fn len(&self) -> usize
    {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool
    {
        self.records.is_empty()
    }
}

impl CalibrationStore for MemoryCalStore
{
    fn append(&mut self, record: CalibrationRecord) -> Result<(), Error>
    {
        self.records.push(record);
        Ok(())
    }

    fn latest(&self, card: u8, channel: u8) -> Option<CalibrationRecord>
    {
        let mut newest: Option<CalibrationRecord> = None;
        for record in &self.records {
            if record.card != card || record.channel != channel {
                continue;
            }
            // >= so that of two equal timestamps the later append wins
            if newest.map_or(true, |best| record.timestamp >= best.timestamp) {
                newest = Some(*record);
            }
        }
        newest
    }
}

/// Ordinary least squares line through `points` as `(slope, offset)`.
///
/// `None` when there are fewer than two points or the abscissa is
/// degenerate (zero variance).
pub fn linear_fit(points: &[(f64, f64)]) -> Option<(f64, f64)>
{
    let n = points.len() as f64;
    if points.len() < 2 {
        return None;
    }

    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let mean_x = sum_x / n;
    let mean_y = sum_y / n;

    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, y) in points {
        sxx += (x - mean_x) * (x - mean_x);
        sxy += (x - mean_x) * (y - mean_y);
    }

    if sxx == 0.0 {
        return None;
    }

    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Fit every channel's sweep and append the results to the store.
///
/// Store write failures never abort a calibration run: the sweep data that
/// produced the fit is already in hand, so the failure is reported through
/// the event sink and the fit is still returned to the caller. Channels whose
/// sweep cannot support a fit are skipped with a warning.
pub fn calibrate<S>(
    card: u8,
    sweeps: &BTreeMap<u8, SweepResult>,
    store: &mut S,
    sink: &dyn EventSink,
) -> BTreeMap<u8, (f64, f64)>
where
    S: CalibrationStore,
{
    let mut fits = BTreeMap::new();

    for (channel, sweep) in sweeps {
        let points: Vec<(f64, f64)> = sweep
            .readings()
            .iter()
            .map(|reading| (reading.vsis.value(), reading.vs.value()))
            .collect();

        let Some((slope, offset)) = linear_fit(&points) else {
            sink.emit(
                Severity::Warning,
                &format!("channel {}: sweep too degenerate to fit, skipped", channel),
            );
            continue;
        };

        info!(card, channel, slope, offset, "calibration fit");
        let record = CalibrationRecord {
            card: card,
            channel: *channel,
            slope: slope,
            offset: offset,
            timestamp: SystemTime::now(),
        };
        if let Err(cause) = store.append(record) {
            sink.emit(
                Severity::Warning,
                &format!("channel {}: calibration store append failed: {}", channel, cause),
            );
        }
        fits.insert(*channel, (slope, offset));
    }

    fits
}

#[cfg(test)]
mod tests
{
    use super::*;
    use std::time::Duration;

    #[test]
    fn fit_recovers_a_synthetic_line()
    {
        let points: Vec<(f64, f64)> = (0..20)
            .map(|i| {
                let x = -2.0 + i as f64 * 0.5;
                (x, 2.0 * x + 1.0)
            })
            .collect();

        let (slope, offset) = linear_fit(&points).unwrap();
        assert!((slope - 2.0).abs() < 1e-9);
        assert!((offset - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fit_refuses_degenerate_input()
    {
        assert!(linear_fit(&[]).is_none());
        assert!(linear_fit(&[(1.0, 2.0)]).is_none());
        assert!(linear_fit(&[(1.0, 2.0), (1.0, 3.0), (1.0, 4.0)]).is_none());
    }

    #[test]
    fn latest_returns_the_newer_of_two_records()
    {
        let mut store = MemoryCalStore::new();
        let older = CalibrationRecord {
            card: 0,
            channel: 1,
            slope: 1.00,
            offset: 0.0,
            timestamp: SystemTime::UNIX_EPOCH,
        };
        let newer = CalibrationRecord {
            card: 0,
            channel: 1,
            slope: 1.05,
            offset: 0.2,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(86_400),
        };

        store.append(newer).unwrap();
        store.append(older).unwrap();

        let found = store.latest(0, 1).unwrap();
        assert_eq!(found, newer);
        assert!(store.latest(0, 2).is_none());
        assert!(store.latest(3, 1).is_none());
    }

    #[test]
    fn correction_inverts_the_fitted_line()
    {
        let record = CalibrationRecord {
            card: 0,
            channel: 0,
            slope: 2.0,
            offset: 1.0,
            timestamp: SystemTime::UNIX_EPOCH,
        };

        // a true 3.0 reads back as 2*3 + 1 = 7
        assert!((record.correct(7.0) - 3.0).abs() < 1e-12);
    }
}
