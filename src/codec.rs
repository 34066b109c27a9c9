//! Register codec for the bias card's converters and GPIO expanders
//!
//! # Purpose
//! Everything in this module is a pure function from engineering values to
//! wire bytes and back. No I/O happens here; [`crate::board`] owns the
//! transactions. Field packing is spelled out bit by bit rather than through
//! a declarative layout layer so the data sheet arithmetic stays auditable.
//!
//! The bias DAC does not drive the junction directly. Its output passes
//! through a divider network (safety resistor in parallel with the current
//! sense resistor plus the junction's normal-state resistance), so converting
//! a desired junction voltage to a DAC code requires the resistor model in
//! [`BiasParams`].

use crate::{
    bus::DeviceAddress,
    error::Error,
};
use tracing::debug;

/// DAC and ADC reference voltage in volts
pub const V_REF: f64 = 4.05;

/// LNA drain DAC reference voltage in volts
pub const LNA_V_REF: f64 = 2.5;

/// Hard ceiling on the commanded LNA drain voltage in volts
pub const LNA_DRAIN_MAX: f64 = 2.5;

/// Wakes the ADC and enables its internal clock and reference
pub const ADC_WAKE_REF: [u8; 3] = [0x41, 0x00, 0x00];

/// Clears every DAC channel to midscale (0 V at the pin)
pub const DAC_CLEAR_MIDSCALE: [u8; 4] = [0x05, 0x00, 0x00, 0x01];

/// Software-LDAC for all four channels of one DAC chip
pub const DAC_SOFT_LDAC_ALL: [u8; 4] = [0x06, 0x00, 0x00, 0x0F];

/// PCA9502 expander: all pins to input
pub const PCA_IODIR_INPUT: [u8; 2] = [0x50, 0x00];

/// PCA9502 expander: all pins to output
pub const PCA_IODIR_OUTPUT: [u8; 2] = [0x50, 0xFF];

/// PCA9502 expander: read the pin register
pub const PCA_READ_PINS: [u8; 2] = [0xD8, 0x00];

/// PCA9502 expander: read back the IODIR register
pub const PCA_READ_IODIR: [u8; 2] = [0xD0, 0x00];

/// PCA9502 expander: load `byte` into the output register
pub fn pca_output(byte: u8) -> [u8; 2]
{
    [0x58, byte]
}

/// DAC input-register command, the first byte of every 4-byte DAC word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DacMode
{
    /// Write the input register; the output pin updates on a later LDAC
    WriteOne = 0x00,
    /// Update the output from the already-written input register
    UpdateOne = 0x01,
    /// Write through the software-LDAC path, ignoring the LDAC pin
    SoftwareLdac = 0x02,
    /// Write the input register and update the output in one frame
    WriteOneUpdateOne = 0x03,
}

impl DacMode
{
    pub fn from_byte(byte: u8) -> Option<Self>
    {
        match byte {
            0x00 => Some(Self::WriteOne),
            0x01 => Some(Self::UpdateOne),
            0x02 => Some(Self::SoftwareLdac),
            0x03 => Some(Self::WriteOneUpdateOne),
            _ => None,
        }
    }
}

/// Resistor network between the DAC pin and the SIS junction, all in ohms
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BiasParams
{
    /// Safety resistor in parallel with the junction branch
    pub r_safety: f64,
    /// Current sense resistor in series with the junction
    pub r_isense: f64,
    /// Junction normal-state resistance
    pub r_normal: f64,
    /// Series divider between the DAC output stage and the network
    pub r_divider: f64,
}

impl Default for BiasParams
{
    fn default() -> Self
    {
        Self {
            r_safety: 200.0,
            r_isense: 10.0,
            r_normal: 40.0,
            r_divider: 5e3,
        }
    }
}

impl BiasParams
{
    /// Fraction of the DAC pin voltage that appears across the junction
    pub fn divider_ratio(&self) -> f64
    {
        let branch = self.r_isense + self.r_normal;
        let r_sis = (self.r_safety * branch) / (self.r_safety + branch);
        (r_sis / (self.r_divider + r_sis)) * (self.r_normal / branch)
    }
}

/// DAC pin voltage that puts `vsis_mv` millivolts across the junction
pub fn bias_voltage(vsis_mv: f64, params: &BiasParams) -> f64
{
    vsis_mv * 1e-3 / params.divider_ratio()
}

/// 16-bit DAC code for a desired junction voltage in millivolts.
///
/// Saturates at the rails instead of wrapping; clamping is a policy decision,
/// logged at debug level, not an error.
pub fn dac_code(vsis_mv: f64, params: &BiasParams) -> u16
{
    let v_pin = bias_voltage(vsis_mv, params);
    let scaled = (v_pin + V_REF) * 65536.0 / (2.0 * V_REF);

    if scaled < 0.0 {
        debug!(vsis_mv, "bias request below DAC range, clamping to 0");
        0
    } else if scaled > 65535.0 {
        debug!(vsis_mv, "bias request above DAC range, clamping to full scale");
        0xFFFF
    } else {
        scaled.round() as u16
    }
}

/// The mixer DAC chip serving `channel` and the channel address within it.
/// Channels 0-3 live on the first chip, 4-7 on the second.
pub fn mixer_dac_for(channel: u8) -> Result<(DeviceAddress, u8), Error>
{
    match channel {
        0..=3 => Ok((DeviceAddress::MixerDac0, channel)),
        4..=7 => Ok((DeviceAddress::MixerDac1, channel % 4)),
        _ => Err(Error::InvalidChannel(channel)),
    }
}

fn pack_dac_nibbles(command: u8, address: u8, code: u16) -> [u8; 4]
{
    let hi = (code >> 8) as u8;
    let lo = (code & 0xFF) as u8;

    // 16 data bits straddle three bytes, offset by the 4-bit channel address
    [
        command,
        ((address & 0x0F) << 4) | (hi >> 4),
        ((hi & 0x0F) << 4) | (lo >> 4),
        (lo & 0x0F) << 4,
    ]
}

/// 4-byte mixer DAC frame carrying `code` to `channel`'s chip address
pub fn encode_dac_word(code: u16, channel: u8, mode: DacMode) -> [u8; 4]
{
    pack_dac_nibbles(mode as u8, channel % 4, code)
}

/// A decoded mixer DAC frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DacWord
{
    /// Channel address within the chip, 0..=3
    pub address: u8,
    pub code: u16,
    pub mode: DacMode,
}

/// Exact inverse of [`encode_dac_word`]. `None` when the command byte is not
/// a recognized mode or the trailing nibble is not zero padding.
pub fn decode_dac_word(word: &[u8; 4]) -> Option<DacWord>
{
    let mode = DacMode::from_byte(word[0])?;
    if word[3] & 0x0F != 0 {
        return None;
    }

    let address = word[1] >> 4;
    let hi = ((word[1] & 0x0F) << 4) | (word[2] >> 4);
    let lo = ((word[2] & 0x0F) << 4) | (word[3] >> 4);

    Some(DacWord {
        address: address,
        code: ((hi as u16) << 8) | lo as u16,
        mode: mode,
    })
}

/// The eight single-ended inputs behind the sense multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcInput
{
    BiasVoltage = 0,
    BiasCurrent = 1,
    LnaVoltage = 2,
    LnaCurrent = 3,
    MagnetVoltage = 4,
    MagnetCurrent = 5,
    /// Half-scale reference tap used for session offset capture
    Reference2V = 6,
    Spare = 7,
}

impl AdcInput
{
    pub fn from_index(index: u8) -> Option<Self>
    {
        match index {
            0 => Some(Self::BiasVoltage),
            1 => Some(Self::BiasCurrent),
            2 => Some(Self::LnaVoltage),
            3 => Some(Self::LnaCurrent),
            4 => Some(Self::MagnetVoltage),
            5 => Some(Self::MagnetCurrent),
            6 => Some(Self::Reference2V),
            7 => Some(Self::Spare),
            _ => None,
        }
    }
}

/// Single-shot conversion command: input number in the channel-select field,
/// internal clock and reference enabled
pub fn adc_command(input: AdcInput) -> [u8; 3]
{
    [(((input as u8) << 5) & 0xE0) | 0x01, 0x00, 0x00]
}

/// Raw counts from a 3-byte conversion response. The sample sits in the
/// middle two bytes; the low two bits are masked off and the result shifted
/// up by the front-end gain factor of 8.
pub fn decode_adc_word(word: &[u8; 3]) -> u32
{
    let value = ((word[1] as u32) << 8) | word[2] as u32;
    (value & 0xFFFFC) << 3
}

pub fn counts_to_voltage(counts: u32) -> f64
{
    counts as f64 / 65536.0 * V_REF
}

/// Sensed voltage in volts from a raw ADC voltage, removing the session
/// offset and the sense amplifier gain
pub fn vsense(raw: f64, gain: f64, offset: f64) -> f64
{
    (raw - offset) / gain
}

/// Sensed current in amperes, via the voltage across the sense resistor
pub fn isense(raw: f64, gain: f64, offset: f64, r_isense: f64) -> f64
{
    vsense(raw, gain, offset) / r_isense
}

/// 4-byte LNA drain DAC frame. The commanded voltage is clamped to
/// `[0, LNA_DRAIN_MAX]` before conversion.
pub fn encode_lna_word(channel: u8, volts: f64) -> [u8; 4]
{
    let clamped = if volts < 0.0 {
        debug!(volts, "negative LNA drain request, clamping to 0");
        0.0
    } else if volts > LNA_DRAIN_MAX {
        debug!(volts, "LNA drain request above limit, clamping");
        LNA_DRAIN_MAX
    } else {
        volts
    };

    let scaled = (clamped / LNA_V_REF * 65536.0).round();
    let code = if scaled > 65535.0 { 0xFFFF } else { scaled as u16 };

    pack_dac_nibbles(DacMode::WriteOneUpdateOne as u8, channel, code)
}

/// LNA DAC power-control frame for the channels set in `mask`
pub fn lna_power_word(mask: u8, on: bool) -> [u8; 4]
{
    if on {
        [0x08, 0x00, 0x00, mask]
    } else {
        [0x08, 0x00, 0x03, mask]
    }
}
