//! Component slots making up the device-side processing graph.

use std::fmt;

use crate::pipeline::StreamId;

/// Device handle value meaning "not created".
pub const HANDLE_NONE: u16 = 0xffff;

/// Index of a component in the graph table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentIndex(pub usize);

impl fmt::Display for ComponentIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Firmware operator classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorClass {
    Mixer,
    Resampler,
    Equalizer,
}

impl OperatorClass {
    pub fn wire(self) -> u16 {
        match self {
            OperatorClass::Mixer => 0x0001,
            OperatorClass::Resampler => 0x0002,
            OperatorClass::Equalizer => 0x0003,
        }
    }
}

/// What a graph slot stands for on the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    /// A processing operator, created with an optional set of parameter
    /// blocks written immediately after creation.
    Operator {
        class: OperatorClass,
        config: &'static [&'static [u16]],
    },
    /// An audio source endpoint identified by a firmware endpoint id.
    Source { endpoint: u16 },
    /// An audio sink endpoint identified by a firmware endpoint id.
    Sink { endpoint: u16 },
    /// A connection from one component's output to another's input.
    Link {
        from: ComponentIndex,
        to: ComponentIndex,
    },
}

/// One slot in the component table.
///
/// `create_refcnt` counts streams whose pipeline includes this slot;
/// `running_refcnt` counts streams currently running it. The invariant
/// `0 <= running_refcnt <= create_refcnt` holds at all times.
#[derive(Debug, Clone)]
pub struct Component {
    pub kind: ComponentKind,
    pub handle: u16,
    pub create_refcnt: u32,
    pub running_refcnt: u32,
    /// Primary-stream tag, tracked for mixers so re-elections only reach
    /// the device when the winner actually changes.
    pub primary: Option<StreamId>,
}

impl Component {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            handle: HANDLE_NONE,
            create_refcnt: 0,
            running_refcnt: 0,
            primary: None,
        }
    }

    pub fn is_created(&self) -> bool {
        self.handle != HANDLE_NONE
    }

    pub fn is_operator(&self) -> bool {
        matches!(self.kind, ComponentKind::Operator { .. })
    }

    /// Clear all device-derived state. Used after destroy and after a
    /// crash, when the device-side objects no longer exist.
    pub fn reset(&mut self) {
        self.handle = HANDLE_NONE;
        self.primary = None;
    }
}
