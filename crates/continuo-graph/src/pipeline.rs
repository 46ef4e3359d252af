//! Stream identities, the fixed component table and per-stream pipelines.
//!
//! The processing topology is fixed at build time: every stream's
//! pipeline is a list of indices into one shared component table, so
//! components shared between streams (the main mixer, the post EQ, the
//! codec sink) are the same table slots and their refcounts do the
//! sharing bookkeeping.

use std::fmt;

use crate::component::{Component, ComponentIndex, ComponentKind, OperatorClass};

/// The four audio streams the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamId {
    Playback,
    VoiceCall,
    Capture,
    Loopback,
}

impl StreamId {
    pub const COUNT: usize = 4;
    pub const ALL: [StreamId; Self::COUNT] = [
        StreamId::Playback,
        StreamId::VoiceCall,
        StreamId::Capture,
        StreamId::Loopback,
    ];

    pub fn index(self) -> usize {
        match self {
            StreamId::Playback => 0,
            StreamId::VoiceCall => 1,
            StreamId::Capture => 2,
            StreamId::Loopback => 3,
        }
    }

    pub fn wire(self) -> u16 {
        self.index() as u16
    }

    fn bit(self) -> u8 {
        1 << self.index()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamId::Playback => "playback",
            StreamId::VoiceCall => "voice-call",
            StreamId::Capture => "capture",
            StreamId::Loopback => "loopback",
        };
        write!(f, "{s}")
    }
}

/// Bitmask of currently open streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveStreamSet(u8);

impl ActiveStreamSet {
    pub fn contains(self, stream: StreamId) -> bool {
        self.0 & stream.bit() != 0
    }

    pub fn insert(&mut self, stream: StreamId) {
        self.0 |= stream.bit();
    }

    pub fn remove(&mut self, stream: StreamId) {
        self.0 &= !stream.bit();
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, stream: StreamId) -> Self {
        Self(self.0 & !stream.bit())
    }
}

/// Stream pairs that cannot be active at the same time. The codec's
/// capture path is single-client, and voice calls own both directions.
pub const CONFLICTS: &[(StreamId, StreamId)] = &[
    (StreamId::Capture, StreamId::Loopback),
    (StreamId::VoiceCall, StreamId::Capture),
    (StreamId::VoiceCall, StreamId::Loopback),
];

/// Returns the active stream that blocks `stream` from opening, if any.
pub fn conflict_with(stream: StreamId, active: ActiveStreamSet) -> Option<StreamId> {
    CONFLICTS.iter().find_map(|&(a, b)| {
        if a == stream && active.contains(b) {
            Some(b)
        } else if b == stream && active.contains(a) {
            Some(a)
        } else {
            None
        }
    })
}

/// Primary-stream precedence, highest first. The first entry present in
/// the active set wins the election.
pub const PRIMARY_PRECEDENCE: &[StreamId] =
    &[StreamId::VoiceCall, StreamId::Playback, StreamId::Loopback];

/// Elect the stream that should drive the main mixer's gain staging.
pub fn elect_primary(active: ActiveStreamSet) -> Option<StreamId> {
    PRIMARY_PRECEDENCE
        .iter()
        .copied()
        .find(|&s| active.contains(s))
}

// Component table slots. Operators and endpoints first, links after.
pub const MAIN_MIXER: ComponentIndex = ComponentIndex(0);
pub const POST_EQ: ComponentIndex = ComponentIndex(1);
pub const MUSIC_RESAMPLER: ComponentIndex = ComponentIndex(2);
pub const VOICE_RESAMPLER: ComponentIndex = ComponentIndex(3);
pub const CAPTURE_RESAMPLER: ComponentIndex = ComponentIndex(4);
pub const CODEC_SINK: ComponentIndex = ComponentIndex(5);
pub const CODEC_SOURCE: ComponentIndex = ComponentIndex(6);
pub const AUX_SOURCE: ComponentIndex = ComponentIndex(7);
pub const HOST_MUSIC_SOURCE: ComponentIndex = ComponentIndex(8);
pub const HOST_VOICE_SOURCE: ComponentIndex = ComponentIndex(9);
pub const HOST_VOICE_SINK: ComponentIndex = ComponentIndex(10);
pub const HOST_CAPTURE_SINK: ComponentIndex = ComponentIndex(11);
pub const LINK_MUSIC_IN: ComponentIndex = ComponentIndex(12);
pub const LINK_MUSIC_MIX: ComponentIndex = ComponentIndex(13);
pub const LINK_VOICE_IN: ComponentIndex = ComponentIndex(14);
pub const LINK_VOICE_MIX: ComponentIndex = ComponentIndex(15);
pub const LINK_AUX_MIX: ComponentIndex = ComponentIndex(16);
pub const LINK_MIX_EQ: ComponentIndex = ComponentIndex(17);
pub const LINK_EQ_CODEC: ComponentIndex = ComponentIndex(18);
pub const LINK_CODEC_UPLINK: ComponentIndex = ComponentIndex(19);
pub const LINK_CODEC_CAPTURE: ComponentIndex = ComponentIndex(20);
pub const LINK_CAPTURE_OUT: ComponentIndex = ComponentIndex(21);

/// Firmware endpoint ids.
mod endpoint {
    pub const CODEC_SINK: u16 = 0x01;
    pub const CODEC_SOURCE: u16 = 0x02;
    pub const AUX_SOURCE: u16 = 0x03;
    pub const HOST_MUSIC: u16 = 0x10;
    pub const HOST_VOICE_DOWN: u16 = 0x11;
    pub const HOST_VOICE_UP: u16 = 0x12;
    pub const HOST_CAPTURE: u16 = 0x13;
}

/// Endpoint parameter keys for CONFIGURE_ENDPOINT.
pub mod param {
    pub const SAMPLE_RATE: u16 = 0x01;
    pub const CHANNELS: u16 = 0x02;
    pub const FORMAT: u16 = 0x03;
    pub const CLOCK_MASTER: u16 = 0x04;
}

/// Rate the mixer and EQ run at; resamplers convert to and from it.
pub const NATIVE_RATE: u32 = 48_000;

// Default parameter blocks written right after operator creation.
const MIXER_CONFIG: &[&[u16]] = &[&[0x0001, 0x0000]]; // unity gain, no mute
const EQ_CONFIG: &[&[u16]] = &[&[0x0000]]; // flat curve

/// Build the fixed component table, all slots unreferenced.
pub fn build_component_table() -> Vec<Component> {
    let link = |from, to| Component::new(ComponentKind::Link { from, to });
    vec![
        // 0..=4: operators
        Component::new(ComponentKind::Operator {
            class: OperatorClass::Mixer,
            config: MIXER_CONFIG,
        }),
        Component::new(ComponentKind::Operator {
            class: OperatorClass::Equalizer,
            config: EQ_CONFIG,
        }),
        Component::new(ComponentKind::Operator {
            class: OperatorClass::Resampler,
            config: &[],
        }),
        Component::new(ComponentKind::Operator {
            class: OperatorClass::Resampler,
            config: &[],
        }),
        Component::new(ComponentKind::Operator {
            class: OperatorClass::Resampler,
            config: &[],
        }),
        // 5..=11: endpoints
        Component::new(ComponentKind::Sink {
            endpoint: endpoint::CODEC_SINK,
        }),
        Component::new(ComponentKind::Source {
            endpoint: endpoint::CODEC_SOURCE,
        }),
        Component::new(ComponentKind::Source {
            endpoint: endpoint::AUX_SOURCE,
        }),
        Component::new(ComponentKind::Source {
            endpoint: endpoint::HOST_MUSIC,
        }),
        Component::new(ComponentKind::Source {
            endpoint: endpoint::HOST_VOICE_DOWN,
        }),
        Component::new(ComponentKind::Sink {
            endpoint: endpoint::HOST_VOICE_UP,
        }),
        Component::new(ComponentKind::Sink {
            endpoint: endpoint::HOST_CAPTURE,
        }),
        // 12..=21: links
        link(HOST_MUSIC_SOURCE, MUSIC_RESAMPLER),
        link(MUSIC_RESAMPLER, MAIN_MIXER),
        link(HOST_VOICE_SOURCE, VOICE_RESAMPLER),
        link(VOICE_RESAMPLER, MAIN_MIXER),
        link(AUX_SOURCE, MAIN_MIXER),
        link(MAIN_MIXER, POST_EQ),
        link(POST_EQ, CODEC_SINK),
        link(CODEC_SOURCE, HOST_VOICE_SINK),
        link(CODEC_SOURCE, CAPTURE_RESAMPLER),
        link(CAPTURE_RESAMPLER, HOST_CAPTURE_SINK),
    ]
}

/// Everything the stream manager needs to drive one stream.
#[derive(Debug)]
pub struct StreamTopology {
    /// Pipeline walk order: producers first, links after the components
    /// they join.
    pub pipeline: &'static [ComponentIndex],
    /// Endpoints that receive the caller's stream parameters.
    pub endpoints: &'static [ComponentIndex],
    /// The stream's rate converter, if its rate differs from native.
    pub resampler: Option<ComponentIndex>,
    /// Endpoint that receives the clock-master role at start.
    pub clock_endpoint: ComponentIndex,
    /// Capture direction: the resampler converts native to stream rate.
    pub capture: bool,
}

static PLAYBACK: StreamTopology = StreamTopology {
    pipeline: &[
        HOST_MUSIC_SOURCE,
        MUSIC_RESAMPLER,
        MAIN_MIXER,
        POST_EQ,
        CODEC_SINK,
        LINK_MUSIC_IN,
        LINK_MUSIC_MIX,
        LINK_MIX_EQ,
        LINK_EQ_CODEC,
    ],
    endpoints: &[HOST_MUSIC_SOURCE, CODEC_SINK],
    resampler: Some(MUSIC_RESAMPLER),
    clock_endpoint: CODEC_SINK,
    capture: false,
};

static VOICE_CALL: StreamTopology = StreamTopology {
    pipeline: &[
        HOST_VOICE_SOURCE,
        VOICE_RESAMPLER,
        MAIN_MIXER,
        POST_EQ,
        CODEC_SINK,
        CODEC_SOURCE,
        HOST_VOICE_SINK,
        LINK_VOICE_IN,
        LINK_VOICE_MIX,
        LINK_MIX_EQ,
        LINK_EQ_CODEC,
        LINK_CODEC_UPLINK,
    ],
    endpoints: &[HOST_VOICE_SOURCE, HOST_VOICE_SINK, CODEC_SINK, CODEC_SOURCE],
    resampler: Some(VOICE_RESAMPLER),
    clock_endpoint: CODEC_SINK,
    capture: false,
};

static CAPTURE: StreamTopology = StreamTopology {
    pipeline: &[
        CODEC_SOURCE,
        CAPTURE_RESAMPLER,
        HOST_CAPTURE_SINK,
        LINK_CODEC_CAPTURE,
        LINK_CAPTURE_OUT,
    ],
    endpoints: &[CODEC_SOURCE, HOST_CAPTURE_SINK],
    resampler: Some(CAPTURE_RESAMPLER),
    clock_endpoint: CODEC_SOURCE,
    capture: true,
};

static LOOPBACK: StreamTopology = StreamTopology {
    pipeline: &[
        AUX_SOURCE,
        MAIN_MIXER,
        POST_EQ,
        CODEC_SINK,
        LINK_AUX_MIX,
        LINK_MIX_EQ,
        LINK_EQ_CODEC,
    ],
    endpoints: &[AUX_SOURCE, CODEC_SINK],
    resampler: None,
    clock_endpoint: CODEC_SINK,
    capture: false,
};

pub fn topology(stream: StreamId) -> &'static StreamTopology {
    match stream {
        StreamId::Playback => &PLAYBACK,
        StreamId::VoiceCall => &VOICE_CALL,
        StreamId::Capture => &CAPTURE,
        StreamId::Loopback => &LOOPBACK,
    }
}
