//! Continuous analog acquisition
//!
//! # Purpose
//! Noise characterization wants seconds of uninterrupted samples from the
//! sense outputs rather than single-shot conversions. The adapter's streaming
//! engine delivers interleaved scan batches; this module wraps that in a
//! finite, explicitly bounded acquisition and a fixed smoothing summary.
//!
//! When the device-side buffer overflows, the adapter substitutes a sentinel
//! value for the lost samples. Those are counted and surfaced on every batch,
//! never silently dropped, so downstream statistics can judge the damage.

use crate::{
    bus::BiasTransport,
    error::Error,
};
use tracing::{ debug, warn };

/// Value the adapter substitutes for samples lost to buffer overflow
pub const SKIP_SENTINEL: f64 = -9999.0;

/// Moving-average width used by [`summarize`], in samples
pub const SMOOTHING_WINDOW: usize = 40;

#[derive(Debug, Clone)]
pub struct StreamConfig
{
    /// Analog input numbers to scan, in scan order
    pub inputs: Vec<u8>,
    /// Requested scans per second; the adapter may grant a nearby rate
    pub scan_rate: f64,
    /// Number of batches to collect before the stream ends on its own
    pub max_reads: u32,
}

/// One delivered batch with its overflow accounting
#[derive(Debug, Clone)]
pub struct ScanBatch
{
    /// Interleaved samples in input order, sentinels included
    pub data: Vec<f64>,
    /// Sentinel values found in `data`
    pub skipped: usize,
    pub device_backlog: u32,
    pub host_backlog: u32,
}

/// Totals over a completed acquisition
#[derive(Debug, Clone, Copy)]
pub struct StreamTotals
{
    pub scans: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelStats
{
    pub mean: f64,
    pub std: f64,
}

/// A running finite acquisition. Borrows the transport for its whole
/// lifetime, so no register transaction can interleave with the stream.
pub struct Streamer<'t, T>
{
    transport: &'t mut T,
    channels: usize,
    granted_rate: f64,
    reads_left: u32,
    stopped: bool,
    total_scans: u64,
    total_skipped: u64,
}

impl <'t, T> Streamer<'t, T>
where
    T: BiasTransport,
{
    pub(crate) async fn start(transport: &'t mut T, config: &StreamConfig) -> Result<Self, Error>
    {
        if config.inputs.is_empty() {
            return Err(Error::EmptyChannelList);
        }
        if !config.scan_rate.is_finite() || config.scan_rate <= 0.0 {
            return Err(Error::DegenerateStep(config.scan_rate));
        }

        // half a second of data per read keeps host buffers shallow
        let scans_per_read = (config.scan_rate / 2.0).max(1.0) as u32;
        let granted_rate = transport
            .stream_start(&config.inputs, config.scan_rate, scans_per_read)
            .await?;
        debug!(
            requested = config.scan_rate,
            granted = granted_rate,
            inputs = config.inputs.len(),
            "stream started"
        );

        Ok(Self {
            transport: transport,
            channels: config.inputs.len(),
            granted_rate: granted_rate,
            reads_left: config.max_reads,
            stopped: false,
            total_scans: 0,
            total_skipped: 0,
        })
    }

    /// Scan rate the adapter actually granted
    pub fn granted_rate(&self) -> f64
    {
        self.granted_rate
    }

    /// The next batch, or `None` once `max_reads` batches have been
    /// delivered. A stream that was stopped cannot deliver more.
    pub async fn next_batch(&mut self) -> Result<Option<ScanBatch>, Error>
    {
        if self.stopped {
            return Err(Error::StreamFinished);
        }
        if self.reads_left == 0 {
            return Ok(None);
        }
        self.reads_left -= 1;

        let raw = self.transport.stream_read().await?;
        let skipped = raw.data.iter().filter(|sample| **sample == SKIP_SENTINEL).count();
        if skipped > 0 {
            warn!(skipped, "device-side buffer overflow in batch");
        }

        self.total_scans += (raw.data.len() / self.channels) as u64;
        self.total_skipped += skipped as u64;

        Ok(Some(ScanBatch {
            data: raw.data,
            skipped: skipped,
            device_backlog: raw.device_backlog,
            host_backlog: raw.host_backlog,
        }))
    }

    /// Stop the hardware stream. Safe to call after the read budget is
    /// exhausted; required before the transport can be used for register
    /// transactions again.
    pub async fn stop(&mut self) -> Result<StreamTotals, Error>
    {
        if !self.stopped {
            self.transport.stream_stop().await?;
            self.stopped = true;
            debug!(
                scans = self.total_scans,
                skipped = self.total_skipped,
                "stream stopped"
            );
        }

        Ok(StreamTotals {
            scans: self.total_scans,
            skipped: self.total_skipped,
        })
    }
}

fn moving_average(samples: &[f64], window: usize) -> Vec<f64>
{
    if samples.len() < window || window == 0 {
        return samples.to_vec();
    }

    let mut smoothed = Vec::with_capacity(samples.len() - window + 1);
    let mut acc: f64 = samples[..window].iter().sum();
    smoothed.push(acc / window as f64);
    for i in window..samples.len() {
        acc += samples[i] - samples[i - window];
        smoothed.push(acc / window as f64);
    }
    smoothed
}

fn stats(samples: &[f64]) -> ChannelStats
{
    if samples.is_empty() {
        return ChannelStats { mean: f64::NAN, std: f64::NAN };
    }

    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n;
    ChannelStats { mean: mean, std: var.sqrt() }
}

/// Per-channel mean and standard deviation of a batch after sentinel removal
/// and a [`SMOOTHING_WINDOW`]-wide moving average
pub fn summarize(batch: &ScanBatch, channels: usize) -> Vec<ChannelStats>
{
    (0..channels)
        .map(|channel| {
            let series: Vec<f64> = batch.data
                .iter()
                .skip(channel)
                .step_by(channels)
                .copied()
                .filter(|sample| *sample != SKIP_SENTINEL)
                .collect();
            stats(&moving_average(&series, SMOOTHING_WINDOW))
        })
        .collect()
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn moving_average_smooths_and_preserves_short_series()
    {
        let flat = vec![2.0; 100];
        let smoothed = moving_average(&flat, 40);
        assert_eq!(smoothed.len(), 61);
        assert!(smoothed.iter().all(|s| (s - 2.0).abs() < 1e-12));

        let short = vec![1.0, 2.0, 3.0];
        assert_eq!(moving_average(&short, 40), short);
    }

    #[test]
    fn summary_ignores_sentinels_and_deinterleaves()
    {
        // two channels: channel 0 constant 1.0 with one overflow sentinel,
        // channel 1 constant 5.0
        let mut data = Vec::new();
        for i in 0..50 {
            data.push(if i == 10 { SKIP_SENTINEL } else { 1.0 });
            data.push(5.0);
        }
        let batch = ScanBatch {
            data: data,
            skipped: 1,
            device_backlog: 0,
            host_backlog: 0,
        };

        let summary = summarize(&batch, 2);
        assert_eq!(summary.len(), 2);
        assert!((summary[0].mean - 1.0).abs() < 1e-12);
        assert!(summary[0].std.abs() < 1e-12);
        assert!((summary[1].mean - 5.0).abs() < 1e-12);
    }
}
