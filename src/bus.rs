//! Byte-serial transport seam and on-board device addressing
//!
//! # Purpose
//! The bias boards hang off a host adapter (a LabJack T7 in production) that
//! exposes digital I/O lines and a bit-banged SPI engine through named
//! registers. Everything above this module speaks in whole transactions;
//! everything below it is adapter-specific and lives outside the crate,
//! behind [`BiasTransport`]. Integration tests bind the same trait to a
//! simulated card.
//!
//! Addressing is two level: a backplane card slot (0..=3, each with a
//! dedicated active-low select line) and one of eight sub-devices on that
//! card, chosen by a 3-bit pattern on shared select lines. Exactly one
//! (card, device) pair is selected at a time; callers finish a transaction
//! before re-selecting.

use crate::error::Error;
use std::io;
use tracing::trace;

/// One scan batch as delivered by the adapter's streaming engine, before any
/// sentinel filtering
#[derive(Debug, Clone)]
pub struct RawScan
{
    /// Interleaved samples, one value per configured input per scan
    pub data: Vec<f64>,
    /// Scans waiting in the device-side buffer when this batch was read
    pub device_backlog: u32,
    /// Scans waiting in the host-side buffer when this batch was read
    pub host_backlog: u32,
}

/// SPI engine parameters written once when a session opens
#[derive(Debug, Clone)]
pub struct SpiConfig
{
    pub clk: u8,
    pub cs: u8,
    pub mosi: u8,
    pub miso: u8,
    /// Clock polarity/phase (CPOL/CPHA); the bias card devices run mode 0
    pub mode: u8,
    /// Clock divisor register; 0 runs the engine at full speed
    pub speed_throttle: u16,
    /// Adapter option bits (CS behavior, bit order)
    pub options: u16,
}

/// Host adapter register interface
///
/// Implementations map these calls onto the adapter's own register naming.
/// All methods take `&mut self`: one transaction in flight at a time is a
/// hardware requirement, and the borrow checker enforces it.
#[allow(async_fn_in_trait)]
pub trait BiasTransport
{
    async fn configure_spi(&mut self, config: &SpiConfig) -> Result<(), io::Error>;

    /// Drive a single digital line high or low
    async fn write_dio(&mut self, line: u8, level: bool) -> Result<(), io::Error>;

    /// Set the byte length of the next SPI frame
    async fn set_frame_len(&mut self, len: u8) -> Result<(), io::Error>;

    /// Clock a frame out on MOSI
    async fn spi_write(&mut self, frame: &[u8]) -> Result<(), io::Error>;

    /// Clock `len` bytes in on MISO
    async fn spi_read(&mut self, len: usize) -> Result<Vec<u8>, io::Error>;

    /// Begin continuous sampling of the given analog inputs. Returns the scan
    /// rate the adapter actually granted, which may differ from the request.
    async fn stream_start(
        &mut self,
        inputs: &[u8],
        scan_rate: f64,
        scans_per_read: u32,
    ) -> Result<f64, io::Error>;

    async fn stream_read(&mut self) -> Result<RawScan, io::Error>;

    async fn stream_stop(&mut self) -> Result<(), io::Error>;
}

/// Which hardware revision of the bias board is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardGeneration
{
    /// Original prototype wiring. Only card slot 2 is connected and there is
    /// no reset line.
    Old,
    /// Production wiring with all four card slots and a DAC reset line
    New,
}

/// Logical line assignments for one board generation
#[derive(Debug, Clone)]
pub struct PinMap
{
    pub mosi: u8,
    pub miso: u8,
    pub clk: u8,
    pub cs: u8,
    /// Shared 3-bit device select, least significant bit first
    pub select: [u8; 3],
    /// Active-low card select per slot; `None` where the slot is not wired
    pub card: [Option<u8>; 4],
    pub reset: Option<u8>,
}

impl PinMap
{
    pub fn for_generation(generation: BoardGeneration) -> Self
    {
        match generation {
            BoardGeneration::Old => Self {
                mosi: 2,
                miso: 3,
                clk: 0,
                cs: 1,
                select: [16, 17, 18],
                card: [None, None, Some(8), None],
                reset: None,
            },
            BoardGeneration::New => Self {
                mosi: 18,
                miso: 19,
                clk: 16,
                cs: 17,
                select: [8, 9, 10],
                card: [Some(13), Some(12), Some(11), Some(14)],
                reset: Some(15),
            },
        }
    }

    pub fn spi_config(&self) -> SpiConfig
    {
        SpiConfig {
            clk: self.clk,
            cs: self.cs,
            mosi: self.mosi,
            miso: self.miso,
            mode: 0,
            speed_throttle: 0,
            options: 0,
        }
    }

    /// The select line for `card`, validated against both the slot range and
    /// this generation's wiring. Fails before any line is touched.
    pub fn card_line(&self, card: u8) -> Result<u8, Error>
    {
        let slot = self.card
            .get(card as usize)
            .ok_or(Error::InvalidCard(card))?;
        slot.ok_or(Error::CardNotWired(card))
    }
}

/// The eight SPI sub-devices on a bias card
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAddress
{
    /// Mixer bias DAC, channels 0-3
    MixerDac0,
    /// Mixer bias DAC, channels 4-7
    MixerDac1,
    /// PCA9502 driving the per-channel feedback loop relays
    LoopControl,
    SyncLoad,
    /// LNA drain supply DAC
    LnaDac,
    /// PCA9502 steering the sense multiplexer
    MuxSpi,
    Adc,
    /// PCA9502 whose pins are strapped to the card's ID code
    BoardId,
}

impl DeviceAddress
{
    /// Levels for the three shared select lines, least significant bit first
    pub fn select_bits(self) -> [bool; 3]
    {
        match self {
            Self::MixerDac0 => [false, false, false],
            Self::MixerDac1 => [true, false, false],
            Self::LoopControl => [false, true, false],
            Self::SyncLoad => [true, true, false],
            Self::LnaDac => [false, false, true],
            Self::MuxSpi => [true, false, true],
            Self::Adc => [false, true, true],
            Self::BoardId => [true, true, true],
        }
    }
}

/// Route the SPI bus to one sub-device on one card.
///
/// Every other wired card line is driven high first so that exactly one card
/// is electrically selected, then the three shared select lines take the
/// device pattern, then the chosen card's line drops (active low).
pub async fn select<T>(
    transport: &mut T,
    pins: &PinMap,
    card: u8,
    device: DeviceAddress,
) -> Result<(), Error>
where
    T: BiasTransport,
{
    let card_line = pins.card_line(card)?;

    for line in pins.card.iter().flatten() {
        if *line != card_line {
            transport.write_dio(*line, true).await?;
        }
    }

    let bits = device.select_bits();
    for (line, level) in pins.select.iter().zip(bits) {
        transport.write_dio(*line, level).await?;
    }
    transport.write_dio(card_line, false).await?;
    trace!(card, ?device, "bus routed");

    Ok(())
}
