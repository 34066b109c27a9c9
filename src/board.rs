//! Bias board session context and acquisition primitives
//!
//! # Purpose
//! [`BoardContext`] owns the host adapter for the duration of a session and
//! exposes whole transactions: start-up, offset capture, bias set-points, and
//! sensed readings. A transaction is select, frame length, command bytes,
//! settle, response; nothing here returns until its response is decoded.
//!
//! # Cancel Safety
//! Every method runs its transaction to completion or fails; none leave the
//! bus mid-frame across an await point a caller might drop. Long-running
//! callers (sweeps, servos) cancel *between* calls into this module.

use crate::{
    bus::{ self, BiasTransport, BoardGeneration, DeviceAddress, PinMap },
    calibrate::{ CalibrationRecord, CalibrationStore },
    codec::{ self, AdcInput, BiasParams, DacMode },
    error::Error,
    stream::{ StreamConfig, Streamer },
    units::{ Microamp, Millivolt, Volt },
};
use std::{
    collections::HashMap,
    io,
    time::Duration,
};
use tokio::time::sleep;
use tracing::{ debug, info };

/// Delay between a conversion command and reading its result
pub const ADC_SETTLE: Duration = Duration::from_millis(10);

/// Width of the reset pulse on boards that wire one
pub const RESET_PULSE: Duration = Duration::from_millis(1);

/// Sense amplifier gain on the voltage monitor path
pub const DEFAULT_GAIN_VS: f64 = 80.0;

/// Sense amplifier gain on the current monitor path
pub const DEFAULT_GAIN_IS: f64 = 200.0;

/// State of a channel's bias feedback loop relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl
{
    Open,
    Closed,
}

/// Exclusive session handle for one card on one bias board.
///
/// `&mut self` on every transaction is deliberate: the card cannot service
/// two transactions at once, so the borrow checker enforces what the
/// hardware requires.
pub struct BoardContext<T>
{
    transport: T,
    pins: PinMap,
    card: u8,
    gain_vs: f64,
    gain_is: f64,
    bias: BiasParams,
    offsets: HashMap<u8, f64>,
    calibration: HashMap<u8, CalibrationRecord>,
}

impl <T> BoardContext<T>
where
    T: BiasTransport,
{
    /// Open a session on `card`, configuring the adapter's SPI engine.
    ///
    /// Card validation happens before any register is touched.
    pub async fn open(
        mut transport: T,
        generation: BoardGeneration,
        card: u8,
    ) -> Result<Self, Error>
    {
        let pins = PinMap::for_generation(generation);
        pins.card_line(card)?;

        transport.configure_spi(&pins.spi_config()).await?;
        if let Some(line) = pins.reset {
            // park the reset line inactive
            transport.write_dio(line, true).await?;
        }
        info!(card, ?generation, "bias board session open");

        Ok(Self {
            transport: transport,
            pins: pins,
            card: card,
            gain_vs: DEFAULT_GAIN_VS,
            gain_is: DEFAULT_GAIN_IS,
            bias: BiasParams::default(),
            offsets: HashMap::new(),
            calibration: HashMap::new(),
        })
    }

    /// Override the sense amplifier gains
    pub fn with_gains(mut self, gain_vs: f64, gain_is: f64) -> Self
    {
        self.gain_vs = gain_vs;
        self.gain_is = gain_is;
        self
    }

    /// Override the divider network model
    pub fn with_bias_params(mut self, params: BiasParams) -> Self
    {
        self.bias = params;
        self
    }

    pub fn card(&self) -> u8
    {
        self.card
    }

    pub fn bias_params(&self) -> &BiasParams
    {
        &self.bias
    }

    async fn select(&mut self, device: DeviceAddress) -> Result<(), Error>
    {
        bus::select(&mut self.transport, &self.pins, self.card, device).await
    }

    async fn write_frame(&mut self, device: DeviceAddress, frame: &[u8]) -> Result<(), Error>
    {
        self.select(device).await?;
        self.transport.set_frame_len(frame.len() as u8).await?;
        self.transport.spi_write(frame).await?;
        Ok(())
    }

    async fn exchange_frame(
        &mut self,
        device: DeviceAddress,
        frame: &[u8],
        settle: Duration,
    ) -> Result<Vec<u8>, Error>
    {
        self.write_frame(device, frame).await?;
        sleep(settle).await;
        let response = self.transport.spi_read(frame.len()).await?;
        if response.len() < frame.len() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short SPI response",
            )));
        }
        Ok(response)
    }

    /// Pulse the DAC reset line. A no-op on generations without one.
    pub async fn reset(&mut self) -> Result<(), Error>
    {
        let Some(line) = self.pins.reset else {
            debug!("no reset line on this generation, skipping");
            return Ok(());
        };

        self.transport.write_dio(line, false).await?;
        sleep(RESET_PULSE).await;
        self.transport.write_dio(line, true).await?;
        Ok(())
    }

    /// Read the card's hard-strapped identity code
    pub async fn board_id(&mut self) -> Result<u8, Error>
    {
        self.write_frame(DeviceAddress::BoardId, &codec::PCA_IODIR_INPUT).await?;
        let response = self
            .exchange_frame(DeviceAddress::BoardId, &codec::PCA_READ_PINS, ADC_SETTLE)
            .await?;
        Ok(response[1])
    }

    /// Steer the sense multiplexer to `channel`
    pub async fn set_mux(&mut self, channel: u8) -> Result<(), Error>
    {
        if channel > 7 {
            return Err(Error::InvalidChannel(channel));
        }

        self.write_frame(DeviceAddress::MuxSpi, &codec::PCA_IODIR_OUTPUT).await?;
        self.write_frame(DeviceAddress::MuxSpi, &codec::pca_output(channel & 0x07)).await?;
        Ok(())
    }

    /// Latch one channel's feedback loop relay open or closed.
    ///
    /// The loop state byte is presented on the loop-control expander, then
    /// strobed into the addressed channel's latch through the mux expander.
    pub async fn set_loop_control(&mut self, channel: u8, loop_state: LoopControl) -> Result<(), Error>
    {
        if channel > 7 {
            return Err(Error::InvalidChannel(channel));
        }

        // relay drivers are active high: all pins set closes the loop
        let state_byte = match loop_state {
            LoopControl::Closed => 0xFF,
            LoopControl::Open => 0x00,
        };
        self.write_frame(DeviceAddress::LoopControl, &codec::PCA_IODIR_OUTPUT).await?;
        self.write_frame(DeviceAddress::LoopControl, &codec::pca_output(state_byte)).await?;

        self.write_frame(DeviceAddress::MuxSpi, &codec::PCA_IODIR_OUTPUT).await?;
        self.write_frame(DeviceAddress::MuxSpi, &codec::pca_output(0x7F & channel)).await?;
        self.write_frame(DeviceAddress::MuxSpi, &codec::pca_output(0x80)).await?;
        self.write_frame(DeviceAddress::MuxSpi, &codec::pca_output(0x00)).await?;
        debug!(channel, ?loop_state, "loop relay latched");
        Ok(())
    }

    /// Wake the ADC with its internal clock and reference enabled
    pub async fn adc_wake(&mut self) -> Result<(), Error>
    {
        self.write_frame(DeviceAddress::Adc, &codec::ADC_WAKE_REF).await
    }

    /// Clear both mixer DAC chips to midscale and latch all channels
    pub async fn dac_reset(&mut self) -> Result<(), Error>
    {
        for chip in [DeviceAddress::MixerDac0, DeviceAddress::MixerDac1] {
            self.write_frame(chip, &codec::DAC_CLEAR_MIDSCALE).await?;
            self.write_frame(chip, &codec::DAC_SOFT_LDAC_ALL).await?;
        }
        Ok(())
    }

    /// Bring the card to a known state: read its identity, park the mux,
    /// latch every requested channel's loop relay, wake the ADC, and clear
    /// the bias DACs to midscale.
    pub async fn start_up(&mut self, channels: &[u8], loop_state: LoopControl) -> Result<u8, Error>
    {
        if channels.is_empty() {
            return Err(Error::EmptyChannelList);
        }

        let id = self.board_id().await?;
        info!(card = self.card, id, "board identified");

        self.set_mux(0).await?;
        for channel in channels {
            self.set_loop_control(*channel, loop_state).await?;
        }
        self.adc_wake().await?;
        self.dac_reset().await?;
        Ok(id)
    }

    /// One single-shot conversion of `input` on `channel`, in volts at the
    /// ADC pin. The mux settles under the conversion settle.
    pub async fn adc_read(&mut self, channel: u8, input: AdcInput) -> Result<Volt, Error>
    {
        self.set_mux(channel).await?;
        let response = self
            .exchange_frame(DeviceAddress::Adc, &codec::adc_command(input), ADC_SETTLE)
            .await?;
        let word: [u8; 3] = [response[0], response[1], response[2]];
        Ok(Volt(codec::counts_to_voltage(codec::decode_adc_word(&word))))
    }

    /// Capture each channel's zero-signal offset from the half-scale
    /// reference tap. Valid for the rest of the session; consulted by every
    /// sensed reading.
    pub async fn capture_offsets(&mut self, channels: &[u8]) -> Result<(), Error>
    {
        if channels.is_empty() {
            return Err(Error::EmptyChannelList);
        }

        for channel in channels {
            let reference = self.adc_read(*channel, AdcInput::Reference2V).await?;
            let offset = reference.value() * 2.0;
            debug!(channel, offset, "session offset captured");
            self.offsets.insert(*channel, offset);
        }
        Ok(())
    }

    pub fn offset(&self, channel: u8) -> Result<f64, Error>
    {
        self.offsets
            .get(&channel)
            .copied()
            .ok_or(Error::MissingOffset(channel))
    }

    /// Command the same junction voltage on every listed channel.
    ///
    /// All channels are validated before the first byte goes out, so a bad
    /// list never leaves the hardware half-programmed.
    pub async fn set_bias(&mut self, channels: &[u8], vsis_mv: f64) -> Result<(), Error>
    {
        if channels.is_empty() {
            return Err(Error::EmptyChannelList);
        }
        for channel in channels {
            codec::mixer_dac_for(*channel)?;
        }

        let code = codec::dac_code(vsis_mv, &self.bias);
        for channel in channels {
            let (chip, _) = codec::mixer_dac_for(*channel)?;
            let word = codec::encode_dac_word(code, *channel, DacMode::SoftwareLdac);
            self.write_frame(chip, &word).await?;
            debug!(channel, code, vsis_mv, "bias set-point written");
        }
        Ok(())
    }

    /// Sensed junction voltage in millivolts
    pub async fn read_vs(&mut self, channel: u8, calibrated: bool) -> Result<Millivolt, Error>
    {
        let raw = self.adc_read(channel, AdcInput::BiasVoltage).await?;
        let offset = self.offset(channel)?;
        let mut mv = codec::vsense(raw.value(), self.gain_vs, offset) / 1e-3;
        if calibrated {
            mv = self.calibration_for(channel)?.correct(mv);
        }
        Ok(Millivolt(mv))
    }

    /// Sensed junction current in microamps
    pub async fn read_is(&mut self, channel: u8, calibrated: bool) -> Result<Microamp, Error>
    {
        let raw = self.adc_read(channel, AdcInput::BiasCurrent).await?;
        let offset = self.offset(channel)?;
        let mut ua = codec::isense(raw.value(), self.gain_is, offset, self.bias.r_isense) / 1e-6;
        if calibrated {
            ua = self.calibration_for(channel)?.correct(ua);
        }
        Ok(Microamp(ua))
    }

    fn calibration_for(&self, channel: u8) -> Result<&CalibrationRecord, Error>
    {
        self.calibration.get(&channel).ok_or(Error::MissingCalibration {
            card: self.card,
            channel: channel,
        })
    }

    /// Load the latest calibration record for each listed channel. Channels
    /// with no record stay uncalibrated; returns how many were loaded.
    pub fn load_calibration<S>(&mut self, store: &S, channels: &[u8]) -> usize
    where
        S: CalibrationStore,
    {
        let mut loaded = 0;
        for channel in channels {
            if let Some(record) = store.latest(self.card, *channel) {
                self.calibration.insert(*channel, record);
                loaded += 1;
            }
        }
        loaded
    }

    /// Power the listed LNA channels up or down
    pub async fn lna_power(&mut self, channels: &[u8], on: bool) -> Result<(), Error>
    {
        if channels.is_empty() {
            return Err(Error::EmptyChannelList);
        }
        let mut mask = 0u8;
        for channel in channels {
            if *channel > 7 {
                return Err(Error::InvalidChannel(*channel));
            }
            mask |= 1 << channel;
        }

        self.write_frame(DeviceAddress::LnaDac, &codec::lna_power_word(mask, on)).await
    }

    /// Set one LNA channel's drain voltage, clamped to the drain limit
    pub async fn set_lna_drain(&mut self, channel: u8, volts: f64) -> Result<(), Error>
    {
        if channel > 7 {
            return Err(Error::InvalidChannel(channel));
        }
        self.write_frame(DeviceAddress::LnaDac, &codec::encode_lna_word(channel, volts)).await
    }

    /// Begin a finite streaming acquisition. The streamer borrows the
    /// transport, so no register transaction can interleave with it.
    pub async fn stream(&mut self, config: &StreamConfig) -> Result<Streamer<'_, T>, Error>
    {
        Streamer::start(&mut self.transport, config).await
    }
}
