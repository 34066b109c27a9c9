//! End-to-end tests against a simulated bias card
//!
//! The mock implements [`BiasTransport`] with a behavioral model of the card:
//! DAC registers, the divider network, the sense amplifiers, and the ADC's
//! byte format. Engine code therefore exercises the exact same transactions
//! it would run against real hardware.

use sis_bias::{
    calibrate::{ self, CalibrationStore, MemoryCalStore },
    codec::{ self, AdcInput, BiasParams },
    servo::{ self, Band, ServoConfig },
    stream::{ StreamConfig, SKIP_SENTINEL },
    sweep::{ self, LnaSweepConfig, StopFlag, SweepConfig, SweepResult },
    telemetry::{ yig_frequency, LoActuator, TelemetryClient, TracingSink },
    units::{ Kelvin, Watt },
    BiasTransport, BoardContext, BoardGeneration, DeviceAddress, Error, LoopControl, RawScan,
    SpiConfig,
};
use std::{
    collections::{ BTreeMap, HashMap },
    io,
    sync::{ Arc, Mutex },
};

const ALL_DEVICES: [DeviceAddress; 8] = [
    DeviceAddress::MixerDac0,
    DeviceAddress::MixerDac1,
    DeviceAddress::LoopControl,
    DeviceAddress::SyncLoad,
    DeviceAddress::LnaDac,
    DeviceAddress::MuxSpi,
    DeviceAddress::Adc,
    DeviceAddress::BoardId,
];

const BOARD_ID: u8 = 0xA5;
const ZERO_OFFSET: f64 = 4.05;
const GAIN_VS: f64 = 80.0;
const GAIN_IS: f64 = 200.0;

#[derive(Default)]
struct CardState
{
    dio: HashMap<u8, bool>,
    frame_len: u8,
    /// Mixer DAC codes, channels 0-7 across both chips
    dac: [u16; 8],
    lna: [u16; 8],
    mux: u8,
    /// Pin bytes written to the loop relay expander, in order
    loop_bytes: Vec<u8>,
    pending_adc: u8,
    pending_id: bool,
    /// SPI frames written so far; used to assert fail-fast paths
    writes: u64,
    /// When set, the write at this count fails once with an I/O error
    fail_once_at: Option<u64>,
    /// When true, the bias current input tracks the LO ferrite voltage
    lo_coupled: bool,
    lo_volts: f64,
    streaming: bool,
    stream_channels: usize,
    batches_emitted: u32,
}

impl CardState
{
    fn selected(&self) -> DeviceAddress
    {
        // select lines for the New generation pin map
        let bits = [
            *self.dio.get(&8).unwrap_or(&false),
            *self.dio.get(&9).unwrap_or(&false),
            *self.dio.get(&10).unwrap_or(&false),
        ];
        *ALL_DEVICES
            .iter()
            .find(|device| device.select_bits() == bits)
            .expect("select bits always map to a device")
    }

    fn vsis_mv(&self, channel: usize) -> f64
    {
        let params = BiasParams::default();
        let v_pin = self.dac[channel] as f64 / 65536.0 * (2.0 * codec::V_REF) - codec::V_REF;
        v_pin * params.divider_ratio() * 1e3
    }

    fn adc_volts(&self) -> f64
    {
        let params = BiasParams::default();
        let channel = self.mux as usize;
        match self.pending_adc {
            0 => ZERO_OFFSET + GAIN_VS * (self.vsis_mv(channel) * 1e-3),
            1 => {
                let amps = if self.lo_coupled {
                    (100.0 + 60.0 * self.lo_volts) * 1e-6
                } else {
                    self.vsis_mv(channel) * 1e-3 / params.r_normal
                };
                ZERO_OFFSET + GAIN_IS * amps * params.r_isense
            },
            2 => self.lna[channel] as f64 / 65536.0 * codec::LNA_V_REF,
            3 => 0.1,
            6 => ZERO_OFFSET / 2.0,
            _ => 0.0,
        }
    }

    fn adc_bytes(&self) -> Vec<u8>
    {
        // invert the decode: sample * 8 / 65536 * Vref, low two bits masked
        let sample = (self.adc_volts() / codec::V_REF * 65536.0 / 8.0 / 4.0).round() * 4.0;
        let sample = sample.clamp(0.0, 65532.0) as u32;
        vec![0x00, (sample >> 8) as u8, (sample & 0xFF) as u8]
    }

    fn accept_frame(&mut self, frame: &[u8]) -> Result<(), io::Error>
    {
        if let Some(at) = self.fail_once_at {
            if self.writes >= at {
                self.fail_once_at = None;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "injected fault"));
            }
        }
        self.writes += 1;
        assert_eq!(frame.len(), self.frame_len as usize, "frame length not programmed");

        match self.selected() {
            chip @ (DeviceAddress::MixerDac0 | DeviceAddress::MixerDac1) => {
                let base = if chip == DeviceAddress::MixerDac0 { 0 } else { 4 };
                let word: [u8; 4] = frame.try_into().expect("mixer DAC frames are 4 bytes");
                match word[0] {
                    0x05 => {
                        for slot in 0..4 {
                            self.dac[base + slot] = 0x8000;
                        }
                    },
                    0x06 => {},
                    _ => {
                        let decoded = codec::decode_dac_word(&word).expect("well-formed DAC word");
                        self.dac[base + decoded.address as usize] = decoded.code;
                    },
                }
            },
            DeviceAddress::LnaDac => {
                let word: [u8; 4] = frame.try_into().expect("LNA DAC frames are 4 bytes");
                if word[0] != 0x08 {
                    let decoded = codec::decode_dac_word(&word).expect("well-formed LNA word");
                    self.lna[decoded.address as usize] = decoded.code;
                }
            },
            DeviceAddress::Adc => {
                // the wake-with-reference frame is also the input-2
                // conversion command, so every frame steers pending_adc
                self.pending_adc = (frame[0] >> 5) & 0x07;
            },
            DeviceAddress::MuxSpi => {
                if frame[0] == 0x58 && frame[1] & 0x80 == 0 {
                    self.mux = frame[1] & 0x07;
                }
            },
            DeviceAddress::BoardId => {
                if frame[0] == 0xD8 {
                    self.pending_id = true;
                }
            },
            DeviceAddress::LoopControl => {
                if frame[0] == 0x58 {
                    self.loop_bytes.push(frame[1]);
                }
            },
            DeviceAddress::SyncLoad => {},
        }
        Ok(())
    }
}

#[derive(Clone)]
struct MockCard(Arc<Mutex<CardState>>);

impl MockCard
{
    fn new() -> Self
    {
        Self(Arc::new(Mutex::new(CardState::default())))
    }

    fn state(&self) -> Arc<Mutex<CardState>>
    {
        self.0.clone()
    }
}

impl BiasTransport for MockCard
{
    async fn configure_spi(&mut self, _config: &SpiConfig) -> Result<(), io::Error>
    {
        Ok(())
    }

    async fn write_dio(&mut self, line: u8, level: bool) -> Result<(), io::Error>
    {
        self.0.lock().unwrap().dio.insert(line, level);
        Ok(())
    }

    async fn set_frame_len(&mut self, len: u8) -> Result<(), io::Error>
    {
        self.0.lock().unwrap().frame_len = len;
        Ok(())
    }

    async fn spi_write(&mut self, frame: &[u8]) -> Result<(), io::Error>
    {
        self.0.lock().unwrap().accept_frame(frame)
    }

    async fn spi_read(&mut self, len: usize) -> Result<Vec<u8>, io::Error>
    {
        let mut state = self.0.lock().unwrap();
        let response = match state.selected() {
            DeviceAddress::BoardId if state.pending_id => {
                state.pending_id = false;
                vec![0x00, BOARD_ID]
            },
            DeviceAddress::Adc => state.adc_bytes(),
            _ => vec![0x00; len],
        };
        Ok(response)
    }

    async fn stream_start(
        &mut self,
        inputs: &[u8],
        scan_rate: f64,
        _scans_per_read: u32,
    ) -> Result<f64, io::Error>
    {
        let mut state = self.0.lock().unwrap();
        state.streaming = true;
        state.stream_channels = inputs.len();
        state.batches_emitted = 0;
        Ok(scan_rate)
    }

    async fn stream_read(&mut self) -> Result<RawScan, io::Error>
    {
        let mut state = self.0.lock().unwrap();
        let channels = state.stream_channels;
        let mut data = Vec::new();
        for scan in 0..4 {
            for channel in 0..channels {
                // one overflow sentinel in the first batch only
                if state.batches_emitted == 0 && scan == 1 && channel == 0 {
                    data.push(SKIP_SENTINEL);
                } else {
                    data.push((channel + 1) as f64);
                }
            }
        }
        state.batches_emitted += 1;
        Ok(RawScan { data: data, device_backlog: 0, host_backlog: 0 })
    }

    async fn stream_stop(&mut self) -> Result<(), io::Error>
    {
        self.0.lock().unwrap().streaming = false;
        Ok(())
    }
}

struct MockLo(Arc<Mutex<CardState>>);

impl LoActuator for MockLo
{
    async fn set_frequency(&mut self, lo_ghz: f64) -> Result<(), Error>
    {
        // a real binding would program the YIG at this frequency
        let _yig = yig_frequency(lo_ghz);
        Ok(())
    }

    async fn set_power_voltage(&mut self, volts: f64) -> Result<(), Error>
    {
        self.0.lock().unwrap().lo_volts = volts;
        Ok(())
    }
}

struct MockTelemetry
{
    /// Sensor reads in the order they arrived
    calls: Vec<&'static str>,
}

impl TelemetryClient for MockTelemetry
{
    async fn read_temperature(&mut self) -> Result<BTreeMap<u8, Kelvin>, Error>
    {
        self.calls.push("temperature");
        Ok([1u8, 2, 3, 5, 6, 7]
            .into_iter()
            .map(|channel| (channel, Kelvin(4.0 + channel as f64 * 0.1)))
            .collect())
    }

    async fn if_power(&mut self, if_channel: u8) -> Result<Watt, Error>
    {
        self.calls.push("if_power");
        Ok(Watt(if_channel as f64 * 1e-9))
    }

    async fn lo_power(&mut self) -> Result<Watt, Error>
    {
        Ok(Watt(2e-3))
    }
}

async fn open_board(card: MockCard) -> BoardContext<MockCard>
{
    let mut board = BoardContext::open(card, BoardGeneration::New, 0)
        .await
        .expect("session opens");
    let id = board
        .start_up(&[0, 1], LoopControl::Closed)
        .await
        .expect("start-up succeeds");
    assert_eq!(id, BOARD_ID);
    board.capture_offsets(&[0, 1]).await.expect("offsets captured");
    board
}

#[tokio::test(start_paused = true)]
async fn startup_parks_every_channel_at_zero_bias()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;

    let vs = board.read_vs(0, false).await.unwrap();
    let is = board.read_is(0, false).await.unwrap();
    assert!(vs.value().abs() < 0.1, "vs after start-up: {}", vs);
    assert!(is.value().abs() < 2.0, "is after start-up: {}", is);
}

#[tokio::test(start_paused = true)]
async fn commanded_bias_reads_back_through_the_sense_chain()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;

    board.set_bias(&[0, 1], 10.0).await.unwrap();
    let vs = board.read_vs(0, false).await.unwrap();
    let is = board.read_is(0, false).await.unwrap();

    assert!((vs.value() - 10.0).abs() < 0.1, "vs: {}", vs);
    // 10 mV across the 40 ohm junction model is 250 uA
    assert!((is.value() - 250.0).abs() < 2.0, "is: {}", is);

    let vs1 = board.read_vs(1, false).await.unwrap();
    assert!((vs1.value() - 10.0).abs() < 0.1, "channel 1 vs: {}", vs1);
}

#[tokio::test(start_paused = true)]
async fn loop_relay_byte_matches_the_driver_sense()
{
    let card = MockCard::new();
    let state = card.state();
    // start-up closes the loop on both channels
    let mut board = open_board(card).await;

    // the relay drivers are active high: all pins set means closed
    assert_eq!(state.lock().unwrap().loop_bytes.last(), Some(&0xFF));

    board.set_loop_control(0, LoopControl::Open).await.unwrap();
    assert_eq!(state.lock().unwrap().loop_bytes.last(), Some(&0x00));

    board.set_loop_control(0, LoopControl::Closed).await.unwrap();
    assert_eq!(state.lock().unwrap().loop_bytes.last(), Some(&0xFF));
}

#[tokio::test(start_paused = true)]
async fn reading_without_captured_offset_fails()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;

    let result = board.read_vs(5, false).await;
    assert!(matches!(result, Err(Error::MissingOffset(5))));
}

#[tokio::test(start_paused = true)]
async fn iv_sweep_yields_the_full_grid_and_restores_bias()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;

    board.set_bias(&[0], 5.0).await.unwrap();
    let config = SweepConfig::new(0, -2.0, 16.0, 0.1);
    let result = sweep::sweep(&mut board, &config, &StopFlag::new()).await.unwrap();

    assert_eq!(result.len(), 181);
    assert!(!result.cancelled);
    for reading in result.readings() {
        assert!(
            (reading.vs.value() - reading.vsis.value()).abs() < 0.1,
            "row {} read {}",
            reading.vsis,
            reading.vs
        );
    }

    assert!((result.restored.value() - 5.0).abs() < 0.1, "restored: {}", result.restored);
    let after = board.read_vs(0, false).await.unwrap();
    assert!((after.value() - 5.0).abs() < 0.1, "bias after sweep: {}", after);
}

#[tokio::test(start_paused = true)]
async fn degenerate_step_is_rejected_before_any_transaction()
{
    let card = MockCard::new();
    let state = card.state();
    let mut board = open_board(card).await;

    let writes_before = state.lock().unwrap().writes;
    let config = SweepConfig::new(0, -2.0, 16.0, 0.0);
    let result = sweep::sweep(&mut board, &config, &StopFlag::new()).await;

    assert!(matches!(result, Err(Error::DegenerateStep(_))));
    assert_eq!(state.lock().unwrap().writes, writes_before);
}

#[tokio::test(start_paused = true)]
async fn cancelled_sweep_still_restores_the_previous_bias()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;

    board.set_bias(&[0], 3.0).await.unwrap();
    let stop = StopFlag::new();
    stop.stop();

    let config = SweepConfig::new(0, -2.0, 16.0, 0.1);
    let result = sweep::sweep(&mut board, &config, &stop).await.unwrap();

    assert!(result.cancelled);
    assert!(result.is_empty());
    let after = board.read_vs(0, false).await.unwrap();
    assert!((after.value() - 3.0).abs() < 0.1, "bias after cancel: {}", after);
}

#[tokio::test(start_paused = true)]
async fn faulted_sweep_restores_bias_and_surfaces_the_fault()
{
    let card = MockCard::new();
    let state = card.state();
    let mut board = open_board(card).await;

    board.set_bias(&[0], 4.0).await.unwrap();
    {
        let mut state = state.lock().unwrap();
        let at = state.writes + 20;
        state.fail_once_at = Some(at);
    }

    let config = SweepConfig::new(0, -2.0, 16.0, 0.1);
    let result = sweep::sweep(&mut board, &config, &StopFlag::new()).await;

    assert!(matches!(result, Err(Error::Io(_))));
    let after = board.read_vs(0, false).await.unwrap();
    assert!((after.value() - 4.0).abs() < 0.1, "bias after fault: {}", after);
}

#[tokio::test(start_paused = true)]
async fn telemetry_sweep_carries_temperatures_and_if_power()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;
    let mut telemetry = MockTelemetry { calls: Vec::new() };

    let config = SweepConfig::new(0, 0.0, 1.0, 0.5);
    let result = sweep::sweep_with_telemetry(&mut board, &mut telemetry, &[1, 2], &config, &StopFlag::new())
        .await
        .unwrap();

    assert_eq!(result.len(), 3);
    // each point reads the temperature map first, then both IF channels
    let per_point = ["temperature", "if_power", "if_power"];
    assert_eq!(telemetry.calls.len(), 9);
    for point in telemetry.calls.chunks(3) {
        assert_eq!(point, per_point);
    }
    for reading in result.readings() {
        let temps = reading.temperatures.as_ref().expect("temperature map present");
        assert_eq!(temps.len(), 6);
        assert!((temps[&5].value() - 4.5).abs() < 1e-9);
        assert_eq!(reading.if_power.len(), 2);
        assert!((reading.if_power[1].value() - 2e-9).abs() < 1e-15);
    }
}

#[tokio::test(start_paused = true)]
async fn current_servo_converges_through_the_lo_actuator()
{
    let card = MockCard::new();
    let state = card.state();
    let mut board = open_board(card).await;
    {
        let mut state = state.lock().unwrap();
        state.lo_coupled = true;
        state.lo_volts = servo::FERRITE_MAX;
    }
    let mut lo = MockLo(state.clone());

    // current model is 100 + 60 * ferrite uA; [50, 70] needs [-0.833, -0.5]
    let config = ServoConfig::ferrite(Band::new(50.0, 70.0), servo::FERRITE_MAX);
    let outcome = servo::servo_current(
        &mut board,
        &mut lo,
        0,
        false,
        Some(9.0),
        &config,
        &StopFlag::new(),
    )
    .await
    .unwrap();

    assert!(outcome.converged(), "outcome: {:?}", outcome);
    let ferrite = state.lock().unwrap().lo_volts;
    assert!(ferrite >= -0.834 && ferrite <= -0.499, "ferrite at {}", ferrite);
    let is = board.read_is(0, false).await.unwrap();
    assert!((48.0..=72.0).contains(&is.value()), "servoed current: {}", is);
}

#[tokio::test(start_paused = true)]
async fn voltage_servo_walks_the_bias_into_the_band()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;

    let config = ServoConfig::bias(Band::new(10.2, 10.4), 8.0);
    let outcome = servo::servo_voltage(&mut board, 0, false, &config, &StopFlag::new())
        .await
        .unwrap();

    assert!(outcome.converged(), "outcome: {:?}", outcome);
    assert!((10.2..=10.4).contains(&outcome.reading()), "reading: {}", outcome.reading());
}

#[tokio::test(start_paused = true)]
async fn calibration_fits_load_and_apply()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;

    let mut sweeps: BTreeMap<u8, SweepResult> = BTreeMap::new();
    for channel in [0u8, 1] {
        let config = SweepConfig::new(channel, 0.0, 10.0, 0.5);
        let result = sweep::sweep(&mut board, &config, &StopFlag::new()).await.unwrap();
        sweeps.insert(channel, result);
    }

    let mut store = MemoryCalStore::new();
    let fits = calibrate::calibrate(board.card(), &sweeps, &mut store, &TracingSink);

    assert_eq!(fits.len(), 2);
    assert_eq!(store.len(), 2);
    let (slope, offset) = fits[&0];
    // the simulated sense chain is ideal, so the fit is near identity
    assert!((slope - 1.0).abs() < 0.02, "slope: {}", slope);
    assert!(offset.abs() < 0.1, "offset: {}", offset);

    // calibrated reads refuse to guess before records are loaded
    let result = board.read_vs(0, true).await;
    assert!(matches!(result, Err(Error::MissingCalibration { card: 0, channel: 0 })));

    assert_eq!(board.load_calibration(&store, &[0, 1]), 2);
    board.set_bias(&[0], 6.0).await.unwrap();
    let vs = board.read_vs(0, true).await.unwrap();
    assert!((vs.value() - 6.0).abs() < 0.2, "calibrated vs: {}", vs);

    assert!(store.latest(board.card(), 0).is_some());
    assert!(store.latest(board.card(), 7).is_none());
}

#[tokio::test(start_paused = true)]
async fn streaming_is_finite_and_accounts_for_overflow()
{
    let card = MockCard::new();
    let state = card.state();
    let mut board = open_board(card).await;

    let config = StreamConfig {
        inputs: vec![2, 3],
        scan_rate: 1000.0,
        max_reads: 2,
    };
    let mut stream = board.stream(&config).await.unwrap();
    assert_eq!(stream.granted_rate(), 1000.0);
    assert!(state.lock().unwrap().streaming);

    let first = stream.next_batch().await.unwrap().expect("first batch");
    assert_eq!(first.skipped, 1);
    assert!(first.data.contains(&SKIP_SENTINEL));

    let second = stream.next_batch().await.unwrap().expect("second batch");
    assert_eq!(second.skipped, 0);

    assert!(stream.next_batch().await.unwrap().is_none());

    let totals = stream.stop().await.unwrap();
    assert_eq!(totals.scans, 8);
    assert_eq!(totals.skipped, 1);
    assert!(!state.lock().unwrap().streaming);

    let result = stream.next_batch().await;
    assert!(matches!(result, Err(Error::StreamFinished)));
}

#[tokio::test(start_paused = true)]
async fn lna_drain_sweep_clamps_its_range()
{
    let card = MockCard::new();
    let mut board = open_board(card).await;
    board.lna_power(&[0], true).await.unwrap();
    board.set_lna_drain(0, 1.0).await.unwrap();

    let config = LnaSweepConfig {
        channel: 0,
        v_min: -0.5,
        v_max: 3.0,
        step: 0.5,
        settle: std::time::Duration::from_millis(10),
    };
    let readings = sweep::sweep_lna_drain(&mut board, &config, &StopFlag::new())
        .await
        .unwrap();

    // clamped to [0, 2.5] in 0.5 V steps
    assert_eq!(readings.len(), 6);
    assert!((readings[0].drain.value() - 0.0).abs() < 1e-9);
    assert!((readings[5].drain.value() - 2.5).abs() < 1e-9);
    let last = readings[5];
    assert!((last.monitor_v.value() - 2.5).abs() < 0.01, "drain monitor: {}", last.monitor_v);

    // the pre-sweep drain comes back on the way out
    let after = board.adc_read(0, AdcInput::LnaVoltage).await.unwrap();
    assert!((after.value() - 1.0).abs() < 0.01, "drain after sweep: {}", after);
}

#[tokio::test(start_paused = true)]
async fn unwired_card_is_rejected_before_the_bus_is_touched()
{
    let card = MockCard::new();
    let result = BoardContext::open(card, BoardGeneration::Old, 0).await;
    assert!(matches!(result, Err(Error::CardNotWired(0))));
}
