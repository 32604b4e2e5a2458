//! Device facade: typed methods over a composed command set.
//!
//! A [`Device`] is bound to one (connection, node, port) triple and a
//! [`CommandRegistry`] composed at construction. Every typed method follows
//! the same path: resolve the descriptor by name, build the transaction
//! (encoding the payload and applying subsystem and port offsets), dispatch
//! to the connection, decode, and return the typed value or a failure
//! carrying the command name and bus address.
//!
//! Batch operations build all their transactions up front and submit one
//! sequence, so a multi-point bias sweep costs one transport call on a
//! batch-capable connection.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::connection::BusConnection;
use crate::codec::payload;
use crate::core::address::{port_offset, BusAddress};
use crate::core::error::{Error, Result};
use crate::core::transaction::{Direction, Sequence, Transaction, TransactionResult};
use crate::core::value::Value;
use crate::device::capability::{
    BAND_POWER_OFFSET, CARTRIDGE_TEMP_OFFSET, DEVICE2_OFFSET, LNA_STAGE_OFFSET, POL_OFFSET,
};
use crate::device::registry::{Capability, CapabilityLayer, CommandRegistry, Scope};

/// Cartridge bands (and so port numbers) run 1..=10.
const NUM_BANDS: u8 = 10;
/// Highest port on a module controller (FETIM).
const MAX_PORT: u8 = 15;
/// Largest YTO coarse tune word.
const YTO_TUNE_MAX: u16 = 4095;
/// Points in a default IV curve sweep.
const IV_CURVE_POINTS: usize = 401;
/// Settling time after slewing to the first sweep point.
const IV_SETTLE: Duration = Duration::from_millis(10);
/// Wait for the 1-wire bus rescan to finish.
const ESN_RESCAN_WAIT: Duration = Duration::from_millis(200);

/// Warm cartridge multiplier per band.
const WARM_MULTIPLIERS: [f64; 10] = [1.0, 4.0, 6.0, 3.0, 6.0, 6.0, 6.0, 3.0, 3.0, 6.0];
/// Cold cartridge multiplier per band.
const COLD_MULTIPLIERS: [f64; 10] = [1.0, 1.0, 1.0, 2.0, 2.0, 3.0, 3.0, 6.0, 9.0, 9.0];
/// Default loop bandwidth selection per band (0 = 7.5 MHz/V, 1 = 15 MHz/V).
const DEFAULT_LOOP_BW: [u8; 10] = [0, 0, 1, 0, 1, 1, 1, 0, 0, 1];

/// Front end operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeMode {
    Operational,
    Troubleshooting,
    Maintenance,
    Simulate,
}

impl FeMode {
    const fn code(self) -> u8 {
        match self {
            Self::Operational => 0,
            Self::Troubleshooting => 1,
            Self::Maintenance => 2,
            Self::Simulate => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Operational),
            1 => Ok(Self::Troubleshooting),
            2 => Ok(Self::Maintenance),
            3 => Ok(Self::Simulate),
            other => Err(Error::decoding(format!(
                "unknown front end mode code {}",
                other
            ))),
        }
    }
}

/// PLL loop bandwidth selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopBandwidth {
    /// Use the band's default.
    BandDefault,
    /// 7.5 MHz/V.
    Normal,
    /// 15 MHz/V.
    Alternate,
}

/// Which side of the reference the PLL locks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockSideband {
    BelowRef,
    AboveRef,
}

/// SIS mixer monitor block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SisReadings {
    /// Junction voltage, mV, averaged.
    pub vj: f64,
    /// Junction current, mA, averaged.
    pub ij: f64,
    /// Magnet voltage, V.
    pub vmag: f64,
    /// Magnet current, mA.
    pub imag: f64,
    /// Samples averaged for vj and ij.
    pub averaging: u32,
}

/// One LNA stage bias point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LnaStage {
    pub drain_voltage: f64,
    pub drain_current: f64,
    pub gate_voltage: f64,
}

/// LNA monitor block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LnaReadings {
    pub enabled: bool,
    pub stages: Vec<LnaStage>,
}

/// PLL lock state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LockInfo {
    /// Raw lock detect voltage at or above 3.0 V.
    pub lock_detect: bool,
    /// Latched unlock detect bit.
    pub unlock_latched: bool,
    /// Reference total power detector voltage.
    pub ref_total_power: f64,
    /// IF total power detector voltage.
    pub if_total_power: f64,
    /// Loop correction voltage.
    pub correction_voltage: f64,
    /// Lock detect plus both total power detectors seeing signal.
    pub is_locked: bool,
}

/// Full PLL monitor block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PllReadings {
    pub coarse_tune: u16,
    /// Assembly temperature, C.
    pub temperature: f64,
    pub null_integrator: bool,
    pub lock: LockInfo,
}

/// Photomixer monitor block.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Photomixer {
    pub enabled: bool,
    pub voltage: f64,
    pub current: f64,
}

/// Result of tuning the LO chain to a sky frequency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoTuning {
    /// Frequency at the warm cartridge assembly output, GHz.
    pub wca_ghz: f64,
    /// YTO tuning frequency, GHz.
    pub yto_ghz: f64,
    /// Applied coarse tune word.
    pub coarse_tune: u16,
}

/// IV curve sweep results, vj_set increasing monotonically.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IvCurve {
    /// Commanded junction voltages, mV.
    pub vj_set: Vec<f64>,
    /// Read-back junction voltages, mV.
    pub vj_read: Vec<f64>,
    /// Read-back junction currents, mA.
    pub ij_read: Vec<f64>,
}

/// True for bands with an SIS mixer.
pub const fn has_sis(band: u8) -> bool {
    band >= 3
}

/// True for bands with a second SIS/LNA device.
pub const fn has_sis2(band: u8) -> bool {
    band >= 3 && band <= 8
}

/// Band-specific IV curve defaults: (vj_low, vj_high, vj_step) in mV.
pub fn iv_curve_defaults(band: u8) -> Option<(f64, f64, f64)> {
    let vj_max: f64 = match band {
        4 => 6.5,
        3 | 6 => 12.0,
        5 | 7 | 8 | 9 | 10 => 3.0,
        _ => return None,
    };
    let step = (2.0 * vj_max) / (IV_CURVE_POINTS - 1) as f64;
    Some((-vj_max, vj_max, step))
}

/// A device bound to one (connection, node, port) with a composed command
/// set. For cartridge and oscillator devices the port number is the band.
pub struct Device {
    conn: Arc<dyn BusConnection>,
    node: u8,
    port: u8,
    registry: Arc<CommandRegistry>,
    yto_low_ghz: f64,
    yto_high_ghz: f64,
}

impl Device {
    /// Compose capability layers into a device facade.
    ///
    /// Fails with [`Error::Config`] on any composition violation (see
    /// [`CommandRegistry::compose`]), or when a port-scoped capability is
    /// composed with port 0 or a port above 15.
    pub fn compose(
        conn: Arc<dyn BusConnection>,
        node: u8,
        port: u8,
        layers: Vec<CapabilityLayer>,
    ) -> Result<Self> {
        let registry = CommandRegistry::compose(layers)?;
        if port > MAX_PORT {
            return Err(Error::Config(format!(
                "port {} out of range 0..={}",
                port, MAX_PORT
            )));
        }
        if port == 0 && registry.has_port_scoped_commands() {
            return Err(Error::Config(
                "port-scoped capabilities need a port in 1..=15".into(),
            ));
        }
        Ok(Self {
            conn,
            node,
            port,
            registry: Arc::new(registry),
            yto_low_ghz: 0.0,
            yto_high_ghz: 0.0,
        })
    }

    pub fn node(&self) -> u8 {
        self.node
    }

    pub fn port(&self) -> u8 {
        self.port
    }

    pub fn registry(&self) -> &CommandRegistry {
        &self.registry
    }

    /// Structural "supports X" check.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.registry.has_capability(capability)
    }

    // ------------------------------------------------------------------
    // Core dispatch
    // ------------------------------------------------------------------

    /// Build the transaction for a named command.
    ///
    /// `offset` is added to the descriptor's base RCA (subsystem selection);
    /// port-scoped commands additionally get this device's port window.
    /// Control commands need `value`, monitors ignore it.
    pub fn transaction(&self, name: &str, offset: u32, value: Option<&Value>) -> Result<Transaction> {
        let descriptor = self.registry.resolve(name)?;
        let window = match descriptor.scope {
            Scope::Port => port_offset(self.port),
            Scope::Node => 0,
        };
        let address = BusAddress::new(self.node, descriptor.rca + offset + window);
        match descriptor.direction {
            Direction::Monitor => {
                let mut txn = Transaction::monitor(address).with_command(descriptor.name);
                if let Some(decoder) = descriptor.decoder {
                    txn = txn.with_decoder(decoder);
                }
                Ok(txn)
            }
            Direction::Control => {
                let encoder = descriptor.encoder.ok_or_else(|| {
                    Error::Config(format!("command '{}' has no payload encoder", name))
                })?;
                let value = value.ok_or_else(|| {
                    Error::encoding(format!("control command '{}' needs a value", name))
                })?;
                let data =
                    encoder(value).map_err(|e| e.with_command(descriptor.name, address))?;
                Ok(Transaction::control(address, data).with_command(descriptor.name))
            }
        }
    }

    /// Monitor a named command.
    pub async fn monitor(&self, name: &str) -> Result<Value> {
        self.monitor_at(name, 0).await
    }

    /// Monitor a named command with a subsystem offset.
    pub async fn monitor_at(&self, name: &str, offset: u32) -> Result<Value> {
        let txn = self.transaction(name, offset, None)?;
        self.conn.submit(txn).await.into_value()
    }

    /// Control a named command.
    pub async fn control(&self, name: &str, value: Value) -> Result<()> {
        self.control_at(name, 0, value).await
    }

    /// Control a named command with a subsystem offset.
    pub async fn control_at(&self, name: &str, offset: u32, value: Value) -> Result<()> {
        let txn = self.transaction(name, offset, Some(&value))?;
        self.conn.submit(txn).await.into_ack()
    }

    /// Submit a pre-built sequence on this device's connection.
    ///
    /// Transactions built by [`Device::transaction`] already carry their
    /// subsystem and port offsets.
    pub async fn run_sequence(&self, sequence: Sequence) -> Vec<TransactionResult> {
        self.conn.run_sequence(sequence).await
    }

    fn decode_all(results: Vec<TransactionResult>) -> Result<Vec<Value>> {
        results
            .into_iter()
            .map(TransactionResult::into_value)
            .collect()
    }

    // ------------------------------------------------------------------
    // Generic bus node
    // ------------------------------------------------------------------

    /// Node serial number, 8 raw bytes.
    pub async fn serial_number(&self) -> Result<Vec<u8>> {
        expect_bytes(self.monitor("serial_number").await?)
    }

    /// Interface protocol revision as "major.minor.patch".
    pub async fn protocol_revision(&self) -> Result<String> {
        expect_string(self.monitor("protocol_revision").await?)
    }

    /// Interface firmware revision as "major.minor.patch".
    pub async fn node_firmware_revision(&self) -> Result<String> {
        expect_string(self.monitor("node_firmware_revision").await?)
    }

    /// Interface board temperature in Celsius.
    pub async fn node_temperature(&self) -> Result<f64> {
        expect_f64(self.monitor("node_temperature").await?)
    }

    /// Transactions the node has handled since power-up.
    pub async fn transaction_count(&self) -> Result<u32> {
        Ok(expect_i64(self.monitor("transaction_count").await?)? as u32)
    }

    /// Interface error counters: (errors seen, last error code).
    pub async fn node_error_status(&self) -> Result<(u16, u8)> {
        let raw = expect_bytes(self.monitor("node_errors").await?)?;
        Ok((
            payload::unpack_u16(&raw, 0)?,
            payload::unpack_u8(&raw, 3)?,
        ))
    }

    // ------------------------------------------------------------------
    // Module controller
    // ------------------------------------------------------------------

    /// Run the controller init handshake. True when the controller reports
    /// itself initialized.
    pub async fn init_session(&self) -> Result<bool> {
        let code = expect_i64(self.monitor("setup_info").await?)?;
        Ok(code == 0x00 || code == 0x05)
    }

    /// Controller firmware revision.
    pub async fn femc_version(&self) -> Result<String> {
        expect_string(self.monitor("femc_version").await?)
    }

    /// AMBSI firmware revision.
    pub async fn ambsi_version(&self) -> Result<String> {
        expect_string(self.monitor("ambsi_version").await?)
    }

    /// FPGA firmware revision.
    pub async fn fpga_version(&self) -> Result<String> {
        expect_string(self.monitor("fpga_version").await?)
    }

    /// Current front end operating mode.
    pub async fn fe_mode(&self) -> Result<FeMode> {
        FeMode::from_code(expect_i64(self.monitor("fe_mode").await?)? as u8)
    }

    /// Switch the front end operating mode.
    pub async fn set_fe_mode(&self, mode: FeMode) -> Result<()> {
        self.control("set_fe_mode", Value::from(mode.code())).await
    }

    /// Read the electronic serial numbers found on the 1-wire bus.
    ///
    /// With `reload` the controller rescans the bus first. The queue reads
    /// are submitted as one sequence.
    pub async fn esn_list(&self, reload: bool) -> Result<Vec<Vec<u8>>> {
        if reload {
            self.control("rescan_esns", Value::Bool(true)).await?;
            tokio::time::sleep(ESN_RESCAN_WAIT).await;
        }
        let count = expect_i64(self.monitor("esns_found").await?)?;
        let mut sequence = Sequence::with_capacity(count as usize);
        for _ in 0..count {
            sequence.push(self.transaction("esn_next", 0, None)?);
        }
        Self::decode_all(self.run_sequence(sequence).await)?
            .into_iter()
            .map(expect_bytes)
            .collect()
    }

    /// Power one cartridge band on or off.
    pub async fn set_band_power(&self, band: u8, enable: bool) -> Result<()> {
        self.control_at("set_band_power", band_offset(band)?, Value::Bool(enable))
            .await
    }

    /// Whether one cartridge band is powered.
    pub async fn band_power(&self, band: u8) -> Result<bool> {
        expect_bool(self.monitor_at("band_power", band_offset(band)?).await?)
    }

    /// Power every cartridge band off, as one sequence.
    pub async fn set_all_bands_off(&self) -> Result<()> {
        let mut sequence = Sequence::with_capacity(NUM_BANDS as usize);
        for band in 1..=NUM_BANDS {
            sequence.push(self.transaction(
                "set_band_power",
                band_offset(band)?,
                Some(&Value::Bool(false)),
            )?);
        }
        for result in self.run_sequence(sequence).await {
            result.into_ack()?;
        }
        Ok(())
    }

    /// How many cartridge bands are currently powered.
    pub async fn num_bands_powered(&self) -> Result<u8> {
        Ok(expect_i64(self.monitor("num_bands_powered").await?)? as u8)
    }

    // ------------------------------------------------------------------
    // Cold cartridge
    // ------------------------------------------------------------------

    /// Coerce polarization and device selection into the legal range for
    /// this band. Bands without a second device always select device 1.
    fn coerce_pol_device(&self, pol: i32, device: i32) -> (u32, u32) {
        let pol = pol.clamp(0, 1) as u32;
        let device = if has_sis2(self.port) {
            device.clamp(1, 2) as u32
        } else {
            1
        };
        (pol, device)
    }

    const fn subsys_offset(pol: u32, device: u32) -> u32 {
        pol * POL_OFFSET + (device - 1) * DEVICE2_OFFSET
    }

    fn require_sis(&self) -> Result<()> {
        if !has_sis(self.port) {
            return Err(Error::Config(format!(
                "band {} has no SIS mixer",
                self.port
            )));
        }
        Ok(())
    }

    /// Set SIS junction voltage and/or magnet current.
    pub async fn set_sis(
        &self,
        pol: i32,
        sis: i32,
        vj_mv: Option<f64>,
        imag_ma: Option<f64>,
    ) -> Result<()> {
        self.require_sis()?;
        let (pol, sis) = self.coerce_pol_device(pol, sis);
        let offset = Self::subsys_offset(pol, sis);
        if let Some(vj) = vj_mv {
            self.control_at("set_sis_voltage", offset, Value::Float(vj))
                .await?;
        }
        if let Some(imag) = imag_ma {
            self.control_at("set_sis_magnet_current", offset, Value::Float(imag))
                .await?;
        }
        Ok(())
    }

    /// Read the SIS monitor block, averaging `averaging` samples of the
    /// junction voltage and current. One sequence regardless of averaging.
    pub async fn sis(&self, pol: i32, sis: i32, averaging: u32) -> Result<SisReadings> {
        self.require_sis()?;
        let (pol, sis) = self.coerce_pol_device(pol, sis);
        let offset = Self::subsys_offset(pol, sis);
        let averaging = averaging.max(1);

        let mut sequence = Sequence::with_capacity(averaging as usize * 2 + 2);
        for _ in 0..averaging {
            sequence.push(self.transaction("sis_voltage", offset, None)?);
            sequence.push(self.transaction("sis_current", offset, None)?);
        }
        sequence.push(self.transaction("sis_magnet_voltage", offset, None)?);
        sequence.push(self.transaction("sis_magnet_current", offset, None)?);

        let mut values = Self::decode_all(self.run_sequence(sequence).await)?.into_iter();
        let mut sum_vj = 0.0;
        let mut sum_ij = 0.0;
        for _ in 0..averaging {
            sum_vj += expect_f64(values.next().unwrap_or_default())?;
            sum_ij += expect_f64(values.next().unwrap_or_default())?;
        }
        Ok(SisReadings {
            vj: sum_vj / f64::from(averaging),
            ij: sum_ij / f64::from(averaging),
            vmag: expect_f64(values.next().unwrap_or_default())?,
            imag: expect_f64(values.next().unwrap_or_default())?,
            averaging,
        })
    }

    /// Whether the SIS bias loop is open.
    pub async fn sis_open_loop(&self) -> Result<bool> {
        expect_bool(self.monitor("sis_open_loop").await?)
    }

    /// Open or close the SIS bias loop.
    pub async fn set_sis_open_loop(&self, open_loop: bool) -> Result<()> {
        self.control("set_sis_open_loop", Value::Bool(open_loop))
            .await
    }

    /// Enable or disable the SIS heater.
    pub async fn set_sis_heater(&self, enable: bool) -> Result<()> {
        self.control("set_sis_heater_enable", Value::Bool(enable))
            .await
    }

    /// SIS heater current, mA.
    pub async fn sis_heater_current(&self) -> Result<f64> {
        expect_f64(self.monitor("sis_heater_current").await?)
    }

    /// Enable or disable one LNA device.
    pub async fn set_lna_enable(&self, pol: i32, lna: i32, enable: bool) -> Result<()> {
        let (pol, lna) = self.coerce_pol_device(pol, lna);
        self.control_at(
            "set_lna_enable",
            Self::subsys_offset(pol, lna),
            Value::Bool(enable),
        )
        .await
    }

    /// Set one LNA stage's drain bias.
    pub async fn set_lna_bias(
        &self,
        pol: i32,
        lna: i32,
        stage: u8,
        drain_voltage: Option<f64>,
        drain_current: Option<f64>,
    ) -> Result<()> {
        if stage > 2 {
            return Err(Error::Config(format!("LNA stage {} out of range 0..=2", stage)));
        }
        let (pol, lna) = self.coerce_pol_device(pol, lna);
        let offset = Self::subsys_offset(pol, lna) + u32::from(stage) * LNA_STAGE_OFFSET;
        if let Some(vd) = drain_voltage {
            self.control_at("set_lna_drain_voltage", offset, Value::Float(vd))
                .await?;
        }
        if let Some(id) = drain_current {
            self.control_at("set_lna_drain_current", offset, Value::Float(id))
                .await?;
        }
        Ok(())
    }

    /// Read the LNA monitor block for one device: enable plus three stages
    /// of drain voltage, drain current, and gate voltage, as one sequence.
    pub async fn lna(&self, pol: i32, lna: i32) -> Result<LnaReadings> {
        let (pol, lna) = self.coerce_pol_device(pol, lna);
        let offset = Self::subsys_offset(pol, lna);

        let mut sequence = Sequence::with_capacity(10);
        sequence.push(self.transaction("lna_enable", offset, None)?);
        for stage in 0..3u32 {
            let stage_offset = offset + stage * LNA_STAGE_OFFSET;
            sequence.push(self.transaction("lna_drain_voltage", stage_offset, None)?);
            sequence.push(self.transaction("lna_drain_current", stage_offset, None)?);
            sequence.push(self.transaction("lna_gate_voltage", stage_offset, None)?);
        }

        let mut values = Self::decode_all(self.run_sequence(sequence).await)?.into_iter();
        let enabled = expect_bool(values.next().unwrap_or_default())?;
        let mut stages = Vec::with_capacity(3);
        for _ in 0..3 {
            stages.push(LnaStage {
                drain_voltage: expect_f64(values.next().unwrap_or_default())?,
                drain_current: expect_f64(values.next().unwrap_or_default())?,
                gate_voltage: expect_f64(values.next().unwrap_or_default())?,
            });
        }
        Ok(LnaReadings { enabled, stages })
    }

    /// Read all six cartridge temperature sensors, Kelvin, as one sequence.
    pub async fn cartridge_temps(&self) -> Result<Vec<f64>> {
        let mut sequence = Sequence::with_capacity(6);
        for sensor in 0..6u32 {
            sequence.push(self.transaction(
                "cartridge_temp",
                sensor * CARTRIDGE_TEMP_OFFSET,
                None,
            )?);
        }
        Self::decode_all(self.run_sequence(sequence).await)?
            .into_iter()
            .map(expect_f64)
            .collect()
    }

    /// Sweep an IV curve: set, read back, and record the junction bias
    /// across the range, three transactions per point on the batched path.
    ///
    /// `None` bounds take the band defaults. A range crossing zero is swept
    /// as two monotonic half-sweeps from the rails towards zero, then merged
    /// so `vj_set` increases monotonically.
    pub async fn iv_curve(
        &self,
        pol: i32,
        sis: i32,
        vj_low: Option<f64>,
        vj_high: Option<f64>,
        vj_step: Option<f64>,
    ) -> Result<IvCurve> {
        self.require_sis()?;
        let (pol, sis) = self.coerce_pol_device(pol, sis);
        let offset = Self::subsys_offset(pol, sis);

        let (default_low, default_high, default_step) = iv_curve_defaults(self.port)
            .ok_or_else(|| {
                Error::Config(format!("band {} has no IV curve defaults", self.port))
            })?;
        let mut low = vj_low.unwrap_or(default_low);
        let mut high = vj_high.unwrap_or(default_high);
        if high < low {
            std::mem::swap(&mut low, &mut high);
        }
        let step = vj_step.unwrap_or(default_step).abs();
        let range = high - low;
        if range == 0.0 {
            return Err(Error::Config(format!(
                "IV curve range {}..{} is empty",
                low, high
            )));
        }
        if range < step {
            return Err(Error::Config(format!(
                "IV curve range {}..{} is smaller than one step {}",
                low, high, step
            )));
        }

        let crossing = low < 0.0 && high > 0.0;
        let mut curve = IvCurve {
            vj_set: Vec::new(),
            vj_read: Vec::new(),
            ij_read: Vec::new(),
        };

        // Negative side, swept from the rail towards zero.
        if low < 0.0 {
            let end = if crossing { 0.0 } else { high };
            let points = sweep_points(low, end, step);
            let (vj, ij) = self.run_iv_sweep(offset, &points).await?;
            curve.vj_set.extend(points);
            curve.vj_read.extend(vj);
            curve.ij_read.extend(ij);
        }

        // Positive side, swept from the rail towards zero, then reversed so
        // vj_set increases monotonically.
        if high > 0.0 {
            let end = if crossing { 0.0 } else { low };
            let points = sweep_points(high, end, -step);
            let (vj, ij) = self.run_iv_sweep(offset, &points).await?;
            curve.vj_set.extend(points.into_iter().rev());
            curve.vj_read.extend(vj.into_iter().rev());
            curve.ij_read.extend(ij.into_iter().rev());
        }

        Ok(curve)
    }

    async fn run_iv_sweep(&self, offset: u32, points: &[f64]) -> Result<(Vec<f64>, Vec<f64>)> {
        // Slew to the first point and let the junction settle before the
        // timed part of the sweep.
        self.control_at("set_sis_voltage", offset, Value::Float(points[0]))
            .await?;
        tokio::time::sleep(IV_SETTLE).await;

        let mut sequence = Sequence::with_capacity(points.len() * 3);
        for &vj in points {
            sequence.push(self.transaction("set_sis_voltage", offset, Some(&Value::Float(vj)))?);
            sequence.push(self.transaction("sis_voltage", offset, None)?);
            sequence.push(self.transaction("sis_current", offset, None)?);
        }

        let mut results = self.run_sequence(sequence).await.into_iter();
        let mut vj_read = Vec::with_capacity(points.len());
        let mut ij_read = Vec::with_capacity(points.len());
        for _ in points {
            next_result(&mut results)?.into_ack()?;
            vj_read.push(expect_f64(next_result(&mut results)?.into_value()?)?);
            ij_read.push(expect_f64(next_result(&mut results)?.into_value()?)?);
        }
        Ok((vj_read, ij_read))
    }

    // ------------------------------------------------------------------
    // Local oscillator
    // ------------------------------------------------------------------

    /// Set the YTO frequency endpoints used to map GHz to tune words.
    pub fn set_yto_limits(&mut self, low_ghz: f64, high_ghz: f64) {
        self.yto_low_ghz = low_ghz;
        self.yto_high_ghz = high_ghz;
    }

    /// Tune the LO chain to a sky frequency in GHz.
    ///
    /// Divides through the band's cold and warm multipliers, maps the YTO
    /// frequency to a coarse tune word against the configured limits, and
    /// applies it.
    pub async fn set_lo_frequency(&self, freq_ghz: f64) -> Result<LoTuning> {
        if freq_ghz <= 0.0 {
            return Err(Error::Config(format!(
                "LO frequency {} GHz out of range",
                freq_ghz
            )));
        }
        let band = band_index(self.port)?;
        let wca_ghz = freq_ghz / COLD_MULTIPLIERS[band];
        let yto_ghz = wca_ghz / WARM_MULTIPLIERS[band];
        let coarse_tune = self.yto_freq_to_coarse(yto_ghz)?;
        self.set_yto_coarse_tune(i32::from(coarse_tune)).await?;
        Ok(LoTuning {
            wca_ghz,
            yto_ghz,
            coarse_tune,
        })
    }

    fn yto_freq_to_coarse(&self, yto_ghz: f64) -> Result<u16> {
        if self.yto_high_ghz <= self.yto_low_ghz {
            return Err(Error::Config(
                "YTO limits are not valid, call set_yto_limits first".into(),
            ));
        }
        let clamped = yto_ghz.clamp(self.yto_low_ghz, self.yto_high_ghz);
        let span = self.yto_high_ghz - self.yto_low_ghz;
        Ok(((clamped - self.yto_low_ghz) / span * f64::from(YTO_TUNE_MAX)) as u16)
    }

    /// Apply a YTO coarse tune word, clamped to 0..=4095. Returns the
    /// applied word.
    pub async fn set_yto_coarse_tune(&self, tune: i32) -> Result<u16> {
        let tune = tune.clamp(0, i32::from(YTO_TUNE_MAX)) as u16;
        self.control("set_yto_coarse_tune", Value::from(tune)).await?;
        Ok(tune)
    }

    /// Current YTO coarse tune word.
    pub async fn yto_coarse_tune(&self) -> Result<u16> {
        Ok(expect_i64(self.monitor("yto_coarse_tune").await?)? as u16)
    }

    /// Read the PLL lock state, one sequence.
    pub async fn lock_info(&self) -> Result<LockInfo> {
        let sequence = vec![
            self.transaction("pll_lock_detect_voltage", 0, None)?,
            self.transaction("pll_unlock_latch", 0, None)?,
            self.transaction("pll_ref_total_power", 0, None)?,
            self.transaction("pll_if_total_power", 0, None)?,
            self.transaction("pll_correction_voltage", 0, None)?,
        ];
        let mut values = Self::decode_all(self.run_sequence(sequence).await)?.into_iter();
        let lock_detect = expect_f64(values.next().unwrap_or_default())? >= 3.0;
        let unlock_latched = expect_bool(values.next().unwrap_or_default())?;
        let ref_total_power = expect_f64(values.next().unwrap_or_default())?;
        let if_total_power = expect_f64(values.next().unwrap_or_default())?;
        let correction_voltage = expect_f64(values.next().unwrap_or_default())?;
        Ok(LockInfo {
            lock_detect,
            unlock_latched,
            ref_total_power,
            if_total_power,
            correction_voltage,
            is_locked: lock_detect
                && ref_total_power.abs() >= 0.5
                && if_total_power.abs() >= 0.5,
        })
    }

    /// Read the full PLL monitor block, one sequence.
    pub async fn pll(&self) -> Result<PllReadings> {
        let sequence = vec![
            self.transaction("yto_coarse_tune", 0, None)?,
            self.transaction("pll_assembly_temp", 0, None)?,
            self.transaction("pll_null_integrator", 0, None)?,
        ];
        let mut values = Self::decode_all(self.run_sequence(sequence).await)?.into_iter();
        Ok(PllReadings {
            coarse_tune: expect_i64(values.next().unwrap_or_default())? as u16,
            temperature: expect_f64(values.next().unwrap_or_default())?,
            null_integrator: expect_bool(values.next().unwrap_or_default())?,
            lock: self.lock_info().await?,
        })
    }

    /// Read the photomixer monitor block, one sequence.
    pub async fn photomixer(&self) -> Result<Photomixer> {
        let sequence = vec![
            self.transaction("photomixer_enable", 0, None)?,
            self.transaction("photomixer_voltage", 0, None)?,
            self.transaction("photomixer_current", 0, None)?,
        ];
        let mut values = Self::decode_all(self.run_sequence(sequence).await)?.into_iter();
        Ok(Photomixer {
            enabled: expect_bool(values.next().unwrap_or_default())?,
            voltage: expect_f64(values.next().unwrap_or_default())?,
            current: expect_f64(values.next().unwrap_or_default())?,
        })
    }

    /// Enable or disable the photomixer.
    pub async fn set_photomixer_enable(&self, enable: bool) -> Result<()> {
        self.control("set_photomixer_enable", Value::Bool(enable))
            .await
    }

    /// Null (disable) or reactivate the PLL loop integrator.
    pub async fn set_null_loop_integrator(&self, null: bool) -> Result<()> {
        self.control("set_pll_null_integrator", Value::Bool(null))
            .await
    }

    /// Clear the latched unlock detect bit.
    pub async fn clear_unlock_latch(&self) -> Result<()> {
        self.control("clear_unlock_latch", Value::Bool(true)).await
    }

    /// Select the PLL loop bandwidth.
    pub async fn select_loop_bandwidth(&self, select: LoopBandwidth) -> Result<()> {
        let code = match select {
            LoopBandwidth::Normal => 0,
            LoopBandwidth::Alternate => 1,
            LoopBandwidth::BandDefault => DEFAULT_LOOP_BW[band_index(self.port)?],
        };
        self.control("set_pll_loop_bandwidth", Value::from(code))
            .await
    }

    /// Select which side of the reference the PLL locks on.
    pub async fn select_lock_sideband(&self, select: LockSideband) -> Result<()> {
        let code = match select {
            LockSideband::BelowRef => 0u8,
            LockSideband::AboveRef => 1,
        };
        self.control("set_pll_lock_sideband", Value::from(code))
            .await
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("node", &self.node)
            .field("port", &self.port)
            .field("capabilities", &self.registry.capabilities())
            .finish()
    }
}

/// RCA offset of one cartridge band in the power distribution block.
fn band_offset(band: u8) -> Result<u32> {
    if band < 1 || band > NUM_BANDS {
        return Err(Error::Config(format!(
            "band {} out of range 1..={}",
            band, NUM_BANDS
        )));
    }
    Ok(u32::from(band - 1) * BAND_POWER_OFFSET)
}

fn band_index(port: u8) -> Result<usize> {
    if port < 1 || port > NUM_BANDS {
        return Err(Error::Config(format!(
            "port {} is not a cartridge band 1..={}",
            port, NUM_BANDS
        )));
    }
    Ok(usize::from(port) - 1)
}

/// Points of one monotonic half-sweep, starting at `from` and stepping by
/// `step` until the next point would pass `to`.
fn sweep_points(from: f64, to: f64, step: f64) -> Vec<f64> {
    let mut points = Vec::new();
    let mut v = from;
    loop {
        points.push(v);
        v += step;
        let done = if step < 0.0 { v <= to } else { v >= to };
        if done {
            break;
        }
    }
    points
}

fn next_result(
    results: &mut std::vec::IntoIter<TransactionResult>,
) -> Result<TransactionResult> {
    results
        .next()
        .ok_or_else(|| Error::decoding("sequence result list truncated"))
}

fn expect_f64(value: Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| Error::decoding("expected a numeric value"))
}

fn expect_i64(value: Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| Error::decoding("expected an integer value"))
}

fn expect_bool(value: Value) -> Result<bool> {
    value
        .as_bool()
        .ok_or_else(|| Error::decoding("expected a boolean value"))
}

fn expect_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s),
        _ => Err(Error::decoding("expected a string value")),
    }
}

fn expect_bytes(value: Value) -> Result<Vec<u8>> {
    match value {
        Value::Bytes(b) => Ok(b),
        _ => Err(Error::decoding("expected raw bytes")),
    }
}
