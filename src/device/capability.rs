//! Stock capability layers.
//!
//! Each function builds the fixed command set one capability contributes.
//! Control points for the cartridge and oscillator subsystems live at the
//! monitor RCA plus [`CMD_OFFSET`]; facades add the polarization, device,
//! stage, and port offsets on top of the base RCAs declared here.

use crate::codec::payload::{
    decode_bool, decode_f32, decode_raw, decode_sensor_temperature, decode_u16, decode_u32,
    decode_u8, decode_version, encode_bool, encode_f32, encode_u16, encode_u8,
};
use crate::device::registry::{Capability, CapabilityLayer, CommandDescriptor};

/// Control points sit one command window above their monitor points.
pub const CMD_OFFSET: u32 = 0x10000;

/// RCA offset of polarization 1 in the cartridge bias space.
pub const POL_OFFSET: u32 = 0x0400;
/// RCA offset of the second SIS/LNA device within a polarization.
pub const DEVICE2_OFFSET: u32 = 0x0080;
/// RCA stride between LNA stages.
pub const LNA_STAGE_OFFSET: u32 = 0x0004;
/// RCA stride between cartridge temperature sensors.
pub const CARTRIDGE_TEMP_OFFSET: u32 = 0x0010;
/// RCA stride between cartridge bands in the power distribution block.
pub const BAND_POWER_OFFSET: u32 = 0x0010;

/// Lowest-level commands every bus node answers.
pub fn generic_bus() -> CapabilityLayer {
    CapabilityLayer::new(
        Capability::GenericBus,
        vec![
            CommandDescriptor::monitor("serial_number", 0x00000, 8, decode_raw)
                .node_scoped()
                .label("Node serial number"),
            CommandDescriptor::monitor("protocol_revision", 0x30000, 3, decode_version)
                .node_scoped()
                .label("Interface protocol revision"),
            CommandDescriptor::monitor("node_errors", 0x30001, 4, decode_raw)
                .node_scoped()
                .label("Interface error counters"),
            CommandDescriptor::monitor("transaction_count", 0x30002, 4, decode_u32)
                .node_scoped()
                .label("Transactions handled since power-up"),
            CommandDescriptor::monitor("node_temperature", 0x30003, 2, decode_sensor_temperature)
                .node_scoped()
                .label("Interface board temperature")
                .units("C"),
            CommandDescriptor::monitor("node_firmware_revision", 0x30004, 3, decode_version)
                .node_scoped()
                .label("Interface firmware revision"),
        ],
    )
}

/// Commands meaningful to any module controller.
pub fn module_controller() -> CapabilityLayer {
    CapabilityLayer::new(
        Capability::ModuleController,
        vec![
            CommandDescriptor::monitor("ambsi_version", 0x20000, 3, decode_version)
                .node_scoped()
                .label("AMBSI firmware revision"),
            CommandDescriptor::monitor("setup_info", 0x20001, 1, decode_u8)
                .node_scoped()
                .label("Controller init handshake"),
            CommandDescriptor::monitor("femc_version", 0x20002, 3, decode_version)
                .node_scoped()
                .label("Controller firmware revision"),
            CommandDescriptor::monitor("ppcomm_time", 0x20007, 8, decode_raw)
                .node_scoped()
                .label("Parallel port turnaround probe"),
            CommandDescriptor::monitor("fpga_version", 0x20008, 3, decode_version)
                .node_scoped()
                .label("FPGA firmware revision"),
            CommandDescriptor::monitor("esns_found", 0x2000A, 1, decode_u8)
                .node_scoped()
                .label("Serial numbers found on the 1-wire bus"),
            CommandDescriptor::monitor("esn_next", 0x2000B, 8, decode_raw)
                .node_scoped()
                .label("Next serial number in the queue"),
            CommandDescriptor::monitor("error_count", 0x2000C, 2, decode_u16)
                .node_scoped()
                .label("Errors queued in the controller"),
            CommandDescriptor::monitor("next_error", 0x2000D, 4, decode_raw)
                .node_scoped()
                .label("Next error in the queue"),
            CommandDescriptor::monitor("fe_mode", 0x2000E, 1, decode_u8)
                .node_scoped()
                .label("Front end operating mode"),
            CommandDescriptor::control("set_fe_mode", 0x2100E, encode_u8)
                .node_scoped()
                .label("Set front end operating mode"),
            CommandDescriptor::control("rescan_esns", 0x2100F, encode_bool)
                .node_scoped()
                .label("Rescan the 1-wire bus for serial numbers"),
            CommandDescriptor::monitor("band_power", 0x0A00C, 1, decode_bool)
                .node_scoped()
                .label("Cartridge band power state"),
            CommandDescriptor::control("set_band_power", 0x1A00C, encode_bool)
                .node_scoped()
                .label("Cartridge band power enable"),
            CommandDescriptor::monitor("num_bands_powered", 0x0A0A0, 1, decode_u8)
                .node_scoped()
                .label("Cartridge bands currently powered"),
        ],
    )
}

/// Cold cartridge bias commands, all port-scoped.
pub fn cold_cartridge() -> CapabilityLayer {
    CapabilityLayer::new(
        Capability::ColdCartridge,
        vec![
            // SIS mixer
            CommandDescriptor::monitor("sis_voltage", 0x0008, 4, decode_f32)
                .label("SIS junction voltage")
                .units("mV"),
            CommandDescriptor::monitor("sis_current", 0x0010, 4, decode_f32)
                .label("SIS junction current")
                .units("mA"),
            CommandDescriptor::monitor("sis_open_loop", 0x0018, 1, decode_bool)
                .label("SIS open loop mode"),
            CommandDescriptor::monitor("sis_magnet_voltage", 0x0020, 4, decode_f32)
                .label("SIS magnet voltage")
                .units("V"),
            CommandDescriptor::monitor("sis_magnet_current", 0x0030, 4, decode_f32)
                .label("SIS magnet current")
                .units("mA"),
            CommandDescriptor::control("set_sis_voltage", CMD_OFFSET + 0x0008, encode_f32)
                .label("Set SIS junction voltage")
                .units("mV"),
            CommandDescriptor::control("set_sis_magnet_current", CMD_OFFSET + 0x0030, encode_f32)
                .label("Set SIS magnet current")
                .units("mA"),
            CommandDescriptor::control("set_sis_open_loop", CMD_OFFSET + 0x0018, encode_bool)
                .label("Set SIS open loop mode"),
            // LNA
            CommandDescriptor::monitor("lna_drain_voltage", 0x0040, 4, decode_f32)
                .label("LNA drain voltage")
                .units("V"),
            CommandDescriptor::monitor("lna_drain_current", 0x0041, 4, decode_f32)
                .label("LNA drain current")
                .units("mA"),
            CommandDescriptor::monitor("lna_gate_voltage", 0x0042, 4, decode_f32)
                .label("LNA gate voltage")
                .units("V"),
            CommandDescriptor::monitor("lna_enable", 0x0058, 1, decode_bool)
                .label("LNA bias enable"),
            CommandDescriptor::control("set_lna_enable", CMD_OFFSET + 0x0058, encode_bool)
                .label("Set LNA bias enable"),
            CommandDescriptor::control("set_lna_drain_voltage", CMD_OFFSET + 0x0040, encode_f32)
                .label("Set LNA drain voltage")
                .units("V"),
            CommandDescriptor::control("set_lna_drain_current", CMD_OFFSET + 0x0041, encode_f32)
                .label("Set LNA drain current")
                .units("mA"),
            CommandDescriptor::monitor("lna_led_enable", 0x0100, 1, decode_bool)
                .label("LNA LED enable"),
            CommandDescriptor::control("set_lna_led_enable", CMD_OFFSET + 0x0100, encode_bool)
                .label("Set LNA LED enable"),
            // Heater and temperatures
            CommandDescriptor::control("set_sis_heater_enable", CMD_OFFSET + 0x0180, encode_bool)
                .label("Set SIS heater enable"),
            CommandDescriptor::monitor("sis_heater_current", 0x01C0, 4, decode_f32)
                .label("SIS heater current")
                .units("mA"),
            CommandDescriptor::monitor("cartridge_temp", 0x0880, 4, decode_f32)
                .label("Cartridge temperature sensor")
                .units("K"),
        ],
    )
}

/// Local oscillator commands, all port-scoped.
pub fn local_oscillator() -> CapabilityLayer {
    CapabilityLayer::new(
        Capability::LocalOscillator,
        vec![
            // YTO
            CommandDescriptor::monitor("yto_coarse_tune", 0x0800, 2, decode_u16)
                .label("YTO coarse tune word"),
            CommandDescriptor::control("set_yto_coarse_tune", CMD_OFFSET + 0x0800, encode_u16)
                .label("Set YTO coarse tune word"),
            // Photomixer
            CommandDescriptor::monitor("photomixer_enable", 0x0810, 1, decode_bool)
                .label("Photomixer enable"),
            CommandDescriptor::control("set_photomixer_enable", CMD_OFFSET + 0x0810, encode_bool)
                .label("Set photomixer enable"),
            CommandDescriptor::monitor("photomixer_voltage", 0x0814, 4, decode_f32)
                .label("Photomixer voltage")
                .units("V"),
            CommandDescriptor::monitor("photomixer_current", 0x0818, 4, decode_f32)
                .label("Photomixer current")
                .units("mA"),
            // PLL
            CommandDescriptor::monitor("pll_lock_detect_voltage", 0x0820, 4, decode_f32)
                .label("PLL lock detect voltage")
                .units("V"),
            CommandDescriptor::monitor("pll_correction_voltage", 0x0821, 4, decode_f32)
                .label("PLL correction voltage")
                .units("V"),
            CommandDescriptor::monitor("pll_assembly_temp", 0x0822, 4, decode_f32)
                .label("PLL assembly temperature")
                .units("C"),
            CommandDescriptor::monitor("pll_ref_total_power", 0x0824, 4, decode_f32)
                .label("Reference total power detector")
                .units("V"),
            CommandDescriptor::monitor("pll_if_total_power", 0x0825, 4, decode_f32)
                .label("IF total power detector")
                .units("V"),
            CommandDescriptor::monitor("pll_unlock_latch", 0x0827, 1, decode_bool)
                .label("Latched unlock detect"),
            CommandDescriptor::control("clear_unlock_latch", CMD_OFFSET + 0x0828, encode_bool)
                .label("Clear the unlock detect latch"),
            CommandDescriptor::monitor("pll_loop_bandwidth", 0x0829, 1, decode_u8)
                .label("Loop bandwidth selection"),
            CommandDescriptor::control("set_pll_loop_bandwidth", CMD_OFFSET + 0x0829, encode_u8)
                .label("Select loop bandwidth"),
            CommandDescriptor::monitor("pll_lock_sideband", 0x082A, 1, decode_u8)
                .label("Lock sideband selection"),
            CommandDescriptor::control("set_pll_lock_sideband", CMD_OFFSET + 0x082A, encode_u8)
                .label("Select lock sideband"),
            CommandDescriptor::monitor("pll_null_integrator", 0x082B, 1, decode_bool)
                .label("Null loop integrator state"),
            CommandDescriptor::control("set_pll_null_integrator", CMD_OFFSET + 0x082B, encode_bool)
                .label("Null the loop integrator"),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::Direction;
    use crate::device::registry::Scope;

    #[test]
    fn test_stock_layers_compose_cleanly() {
        for layers in [
            vec![generic_bus()],
            vec![generic_bus(), module_controller()],
            vec![generic_bus(), module_controller(), cold_cartridge()],
            vec![generic_bus(), module_controller(), local_oscillator()],
            vec![
                generic_bus(),
                module_controller(),
                cold_cartridge(),
                local_oscillator(),
            ],
        ] {
            crate::device::registry::CommandRegistry::compose(layers).unwrap();
        }
    }

    #[test]
    fn test_control_points_sit_one_window_above_monitors() {
        let layer = cold_cartridge();
        let monitor = layer
            .commands()
            .iter()
            .find(|c| c.name == "sis_voltage")
            .unwrap();
        let control = layer
            .commands()
            .iter()
            .find(|c| c.name == "set_sis_voltage")
            .unwrap();
        assert_eq!(control.rca, monitor.rca + CMD_OFFSET);
        assert_eq!(monitor.direction, Direction::Monitor);
        assert_eq!(control.direction, Direction::Control);
    }

    #[test]
    fn test_subsystem_layers_are_port_scoped() {
        for layer in [cold_cartridge(), local_oscillator()] {
            assert!(layer.commands().iter().all(|c| c.scope == Scope::Port));
        }
        assert!(generic_bus()
            .commands()
            .iter()
            .all(|c| c.scope == Scope::Node));
    }
}
