//! Command registry and capability composition.
//!
//! Device flavors are not a type hierarchy. A facade composes an ordered
//! list of [`CapabilityLayer`]s and its command set is the union of their
//! descriptors: code is polymorphic over "supports capability X", checked
//! structurally, not over a nominal device type.
//!
//! Each layer declares a fixed set of [`CommandDescriptor`]s at construction
//! and the registry is immutable after [`CommandRegistry::compose`], so it
//! is safe to share read-only across threads. Two layers colliding on the
//! same effective RCA is a configuration error surfaced at composition time,
//! before any transaction is sent - never as a wrong monitor value at
//! runtime.

use std::collections::HashMap;

use crate::codec::payload::EncodeFn;
use crate::core::error::{Error, Result};
use crate::core::transaction::{DecodeFn, Direction, ReplyDecoder};

/// A capability a facade can be composed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Lowest-level commands every bus node answers (serial number,
    /// firmware revision, node temperature). Always the first layer.
    GenericBus,
    /// Commands meaningful to any module controller (init handshake,
    /// ESN scan, operating mode, band power).
    ModuleController,
    /// Cold cartridge bias commands (SIS, LNA, cartridge temperatures).
    ColdCartridge,
    /// Local oscillator commands (YTO tuning, PLL, photomixer).
    LocalOscillator,
}

impl Capability {
    /// Capability that must appear earlier in the composition list.
    pub const fn requires(self) -> Option<Capability> {
        match self {
            Capability::GenericBus => None,
            Capability::ModuleController => Some(Capability::GenericBus),
            Capability::ColdCartridge | Capability::LocalOscillator => {
                Some(Capability::ModuleController)
            }
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Capability::GenericBus => "generic-bus",
            Capability::ModuleController => "module-controller",
            Capability::ColdCartridge => "cold-cartridge",
            Capability::LocalOscillator => "local-oscillator",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// How a command's RCA relates to the node's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// RCA is absolute within the node.
    Node,
    /// RCA is relative to the facade's port window.
    Port,
}

/// One named command: RCA, payload shape, and codec.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    /// Symbolic name used by facade methods.
    pub name: &'static str,
    /// Human-readable label.
    pub label: &'static str,
    /// Engineering units of the decoded value, empty when dimensionless.
    pub units: &'static str,
    /// Base relative CAN address. Facades may add subsystem and port
    /// offsets when building the transaction.
    pub rca: u32,
    pub direction: Direction,
    pub scope: Scope,
    /// Reply decoder, for monitor commands.
    pub decoder: Option<ReplyDecoder>,
    /// Payload encoder, for control commands.
    pub encoder: Option<EncodeFn>,
}

impl CommandDescriptor {
    /// A port-scoped monitor command.
    pub const fn monitor(
        name: &'static str,
        rca: u32,
        expected_len: usize,
        decode: DecodeFn,
    ) -> Self {
        Self {
            name,
            label: name,
            units: "",
            rca,
            direction: Direction::Monitor,
            scope: Scope::Port,
            decoder: Some(ReplyDecoder::new(expected_len, decode)),
            encoder: None,
        }
    }

    /// A port-scoped control command.
    pub const fn control(name: &'static str, rca: u32, encode: EncodeFn) -> Self {
        Self {
            name,
            label: name,
            units: "",
            rca,
            direction: Direction::Control,
            scope: Scope::Port,
            decoder: None,
            encoder: Some(encode),
        }
    }

    /// Make the RCA absolute within the node.
    pub const fn node_scoped(mut self) -> Self {
        self.scope = Scope::Node;
        self
    }

    pub const fn label(mut self, label: &'static str) -> Self {
        self.label = label;
        self
    }

    pub const fn units(mut self, units: &'static str) -> Self {
        self.units = units;
        self
    }
}

/// A fixed set of command descriptors contributed by one capability.
#[derive(Debug, Clone)]
pub struct CapabilityLayer {
    capability: Capability,
    commands: Vec<CommandDescriptor>,
}

impl CapabilityLayer {
    pub fn new(capability: Capability, commands: Vec<CommandDescriptor>) -> Self {
        Self {
            capability,
            commands,
        }
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn commands(&self) -> &[CommandDescriptor] {
        &self.commands
    }
}

/// Immutable union of the command sets of composed capability layers.
#[derive(Debug)]
pub struct CommandRegistry {
    capabilities: Vec<Capability>,
    commands: HashMap<&'static str, CommandDescriptor>,
}

impl CommandRegistry {
    /// Compose an ordered list of layers into one registry.
    ///
    /// Fails with [`Error::Config`] when the first layer is not
    /// [`Capability::GenericBus`], a layer's prerequisite is missing or out
    /// of order, a capability appears twice, a name is redefined, or two
    /// layers claim the same effective (RCA, direction, scope).
    pub fn compose(layers: Vec<CapabilityLayer>) -> Result<Self> {
        match layers.first() {
            Some(first) if first.capability() == Capability::GenericBus => {}
            Some(first) => {
                return Err(Error::Config(format!(
                    "the first capability layer must be generic-bus, got {}",
                    first.capability()
                )))
            }
            None => {
                return Err(Error::Config(
                    "a device needs at least the generic-bus layer".into(),
                ))
            }
        }

        let mut capabilities: Vec<Capability> = Vec::with_capacity(layers.len());
        let mut commands: HashMap<&'static str, CommandDescriptor> = HashMap::new();
        // (rca, direction, scope) -> owning command, for collision detection.
        let mut claimed: HashMap<(u32, Direction, Scope), &'static str> = HashMap::new();

        for layer in &layers {
            let capability = layer.capability();
            if capabilities.contains(&capability) {
                return Err(Error::Config(format!(
                    "capability {} composed twice",
                    capability
                )));
            }
            if let Some(required) = capability.requires() {
                if !capabilities.contains(&required) {
                    return Err(Error::Config(format!(
                        "capability {} requires {} earlier in the composition",
                        capability, required
                    )));
                }
            }

            for descriptor in layer.commands() {
                let key = (descriptor.rca, descriptor.direction, descriptor.scope);
                if let Some(owner) = claimed.get(&key) {
                    return Err(Error::Config(format!(
                        "layer {} redefines RCA 0x{:05X} already claimed by '{}' (as '{}')",
                        capability, descriptor.rca, owner, descriptor.name
                    )));
                }
                if commands.contains_key(descriptor.name) {
                    return Err(Error::Config(format!(
                        "layer {} redefines command '{}'",
                        capability, descriptor.name
                    )));
                }
                claimed.insert(key, descriptor.name);
                commands.insert(descriptor.name, *descriptor);
            }

            capabilities.push(capability);
        }

        Ok(Self {
            capabilities,
            commands,
        })
    }

    /// Look up a command by symbolic name.
    pub fn resolve(&self, name: &str) -> Result<&CommandDescriptor> {
        self.commands
            .get(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_string()))
    }

    /// Capabilities in composition order.
    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    /// Structural "supports X" check.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// True if any composed command is port-scoped.
    pub fn has_port_scoped_commands(&self) -> bool {
        self.commands.values().any(|c| c.scope == Scope::Port)
    }

    /// Number of composed commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::payload;
    use crate::device::capability::{
        cold_cartridge, generic_bus, local_oscillator, module_controller,
    };

    #[test]
    fn test_full_stack_composes() {
        let registry = CommandRegistry::compose(vec![
            generic_bus(),
            module_controller(),
            cold_cartridge(),
            local_oscillator(),
        ])
        .unwrap();
        assert!(registry.has_capability(Capability::ColdCartridge));
        assert!(registry.has_capability(Capability::LocalOscillator));
        assert!(registry.resolve("sis_voltage").is_ok());
        assert!(registry.resolve("yto_coarse_tune").is_ok());
    }

    #[test]
    fn test_generic_bus_must_come_first() {
        let err = CommandRegistry::compose(vec![module_controller(), generic_bus()]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_subsystem_layer_requires_module_controller() {
        let err = CommandRegistry::compose(vec![generic_bus(), cold_cartridge()]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rca_collision_fails_composition() {
        // Two layers claiming 0x0030 for different commands must fail before
        // any transaction is sent.
        let a = CapabilityLayer::new(
            Capability::GenericBus,
            vec![CommandDescriptor::monitor(
                "serial_number",
                0x0030,
                8,
                payload::decode_raw,
            )
            .node_scoped()],
        );
        let b = CapabilityLayer::new(
            Capability::ModuleController,
            vec![CommandDescriptor::monitor(
                "frequency",
                0x0030,
                4,
                payload::decode_f32,
            )
            .node_scoped()],
        );
        let err = CommandRegistry::compose(vec![a, b]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("0x00030"));
        assert!(text.contains("serial_number"));
        assert!(text.contains("frequency"));
    }

    #[test]
    fn test_same_rca_different_direction_is_no_collision() {
        // Monitor and control points may share an RCA base.
        let a = CapabilityLayer::new(
            Capability::GenericBus,
            vec![
                CommandDescriptor::monitor("level", 0x0040, 4, payload::decode_f32).node_scoped(),
                CommandDescriptor::control("set_level", 0x0040, payload::encode_f32).node_scoped(),
            ],
        );
        assert!(CommandRegistry::compose(vec![a]).is_ok());
    }

    #[test]
    fn test_duplicate_capability_rejected() {
        let err =
            CommandRegistry::compose(vec![generic_bus(), module_controller(), module_controller()])
                .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_resolve_unknown_command_fails() {
        let registry = CommandRegistry::compose(vec![generic_bus()]).unwrap();
        let err = registry.resolve("unknown_command").unwrap_err();
        assert!(matches!(err, Error::UnknownCommand(_)));
    }
}
