//! Crate-wide error taxonomy
//!
//! Only genuine faults live here. Two conditions that look error-shaped are
//! deliberately excluded: DAC range saturation is a policy clamp (logged,
//! value clamped, operation proceeds) and servo non-convergence is a named
//! terminal outcome ([`ServoOutcome::Saturated`]). Parameter errors are
//! reported before any hardware transaction begins.
//!
//! [`ServoOutcome::Saturated`]: crate::servo::ServoOutcome

use std::{ error, fmt, io };

#[derive(Debug)]
pub enum Error
{
    /// Card index outside the backplane's 0..=3 slot range
    InvalidCard(u8),
    /// Card index is valid but not wired on this board generation
    CardNotWired(u8),
    /// Mixer channel outside 0..=7
    InvalidChannel(u8),
    /// An operation that needs at least one channel was given none
    EmptyChannelList,
    /// Sweep or servo step that is zero, negative, or non-finite
    DegenerateStep(f64),
    /// Sweep range whose upper bound lies below its lower bound
    InvertedRange
    {
        v_min: f64,
        v_max: f64,
    },
    /// A reading was requested on a channel whose session offset was never captured
    MissingOffset(u8),
    /// A calibrated reading was requested but no calibration record is loaded
    MissingCalibration
    {
        card: u8,
        channel: u8,
    },
    /// A batch was requested from a stream that already ran to completion
    StreamFinished,
    /// The host adapter reported an I/O fault mid-transaction
    Io(io::Error),
    /// An external telemetry or actuator collaborator failed; not retried
    Telemetry(Box<dyn error::Error + Send + Sync>),
}

impl fmt::Display for Error
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        match self {
            Self::InvalidCard(card) => write!(f, "card index {} outside 0..=3", card),
            Self::CardNotWired(card) => write!(f, "card {} is not wired on this board generation", card),
            Self::InvalidChannel(channel) => write!(f, "mixer channel {} outside 0..=7", channel),
            Self::EmptyChannelList => f.write_str("at least one channel is required"),
            Self::DegenerateStep(step) => write!(f, "step {} is not a strictly positive finite value", step),
            Self::InvertedRange { v_min, v_max } => {
                write!(f, "range upper bound {} lies below lower bound {}", v_max, v_min)
            },
            Self::MissingOffset(channel) => {
                write!(f, "no session offset captured for channel {}", channel)
            },
            Self::MissingCalibration { card, channel } => {
                write!(f, "no calibration record loaded for card {} channel {}", card, channel)
            },
            Self::StreamFinished => f.write_str("stream already ran to completion"),
            Self::Io(cause) => write!(f, "host adapter I/O fault: {}", cause),
            Self::Telemetry(cause) => write!(f, "telemetry collaborator failed: {}", cause),
        }
    }
}

impl error::Error for Error
{
    fn source(&self) -> Option<&(dyn error::Error + 'static)>
    {
        match self {
            Self::Io(cause) => Some(cause),
            Self::Telemetry(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error
{
    fn from(cause: io::Error) -> Self
    {
        Self::Io(cause)
    }
}
