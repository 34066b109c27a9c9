//! Remote control and characterization of SIS mixer bias electronics
//!
//! # Purpose
//! A cryogenic receiver's SIS mixers are biased by multi-channel cards on a
//! backplane, driven over bit-banged SPI from a host DIO adapter. This crate
//! owns that bus: device addressing, the fixed-point register codec for the
//! bias DACs and monitor ADC, single-shot and streaming acquisition, I-V
//! sweep and servo engines, and sense-chain calibration.
//!
//! The crate never opens hardware itself. Everything is generic over
//! [`BiasTransport`], the register-level seam a concrete adapter binding (or
//! a simulator, as in the integration tests) implements. External
//! collaborators on other buses, the cryostat thermometry, IF power meters,
//! and the LO chain, appear only as traits in [`telemetry`].
//!
//! Module map:
//! - [`bus`] transport seam, pin maps, card/device addressing
//! - [`codec`] pure register encode/decode and the divider network model
//! - [`board`] session context and whole-transaction acquisition primitives
//! - [`stream`] finite continuous acquisition with overflow accounting
//! - [`sweep`] I-V sweep engine with guaranteed bias restore
//! - [`servo`] step-search current and voltage controllers
//! - [`calibrate`] OLS sense-chain calibration and its record store
//! - [`telemetry`] external collaborator traits and the event sink

pub mod board;
pub mod bus;
pub mod calibrate;
pub mod codec;
pub mod error;
pub mod servo;
pub mod stream;
pub mod sweep;
pub mod telemetry;
pub mod units;

pub use board::{ BoardContext, LoopControl };
pub use bus::{ BiasTransport, BoardGeneration, DeviceAddress, PinMap, RawScan, SpiConfig };
pub use calibrate::{ CalibrationRecord, CalibrationStore, MemoryCalStore };
pub use codec::{ AdcInput, BiasParams, DacMode };
pub use error::Error;
pub use servo::{ Band, ServoConfig, ServoOutcome, ServoPlant };
pub use stream::{ ScanBatch, StreamConfig, Streamer };
pub use sweep::{ Reading, StopFlag, SweepConfig, SweepResult };
pub use telemetry::{ EventSink, LoActuator, Severity, TelemetryClient, TracingSink };
pub use units::{ Kelvin, Microamp, Millivolt, Volt, Watt };
