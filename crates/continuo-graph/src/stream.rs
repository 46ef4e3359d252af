//! Stream lifecycle: open, prepare, start, stop, destroy.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use continuo_ipc::Watchdog;

use crate::error::{GraphError, Result};
use crate::graph::ComponentGraph;
use crate::pipeline::{
    conflict_with, elect_primary, param, topology, ActiveStreamSet, StreamId, StreamTopology,
    MAIN_MIXER, NATIVE_RATE,
};

/// Lifecycle state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opened,
    Prepared,
    Running,
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StreamState::Closed => "closed",
            StreamState::Opened => "opened",
            StreamState::Prepared => "prepared",
            StreamState::Running => "running",
        };
        write!(f, "{s}")
    }
}

/// PCM sample encodings the endpoints understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    S16,
    S24,
    S32,
    F32,
}

impl SampleFormat {
    pub fn wire(self) -> u16 {
        match self {
            SampleFormat::S16 => 0x0000,
            SampleFormat::S24 => 0x0001,
            SampleFormat::S32 => 0x0002,
            SampleFormat::F32 => 0x0003,
        }
    }
}

/// Caller-supplied stream format, applied at prepare.
#[derive(Debug, Clone, Copy)]
pub struct StreamParams {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
}

/// Who drives the sample clock for a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockRole {
    Master,
    Consumer,
}

impl ClockRole {
    fn wire(self) -> u16 {
        match self {
            ClockRole::Master => 1,
            ClockRole::Consumer => 0,
        }
    }
}

struct StreamsInner {
    states: [StreamState; StreamId::COUNT],
    active: ActiveStreamSet,
}

/// Drives the four streams through their lifecycle against the shared
/// component graph.
///
/// All transitions run under one lock, so a stream operation observes a
/// consistent active set and the primary election is race-free.
pub struct StreamManager {
    graph: Arc<ComponentGraph>,
    watchdog: Arc<Watchdog>,
    inner: Mutex<StreamsInner>,
}

impl StreamManager {
    pub fn new(graph: Arc<ComponentGraph>, watchdog: Arc<Watchdog>) -> Self {
        Self {
            graph,
            watchdog,
            inner: Mutex::new(StreamsInner {
                states: [StreamState::Closed; StreamId::COUNT],
                active: ActiveStreamSet::default(),
            }),
        }
    }

    pub fn graph(&self) -> &Arc<ComponentGraph> {
        &self.graph
    }

    pub fn state(&self, stream: StreamId) -> StreamState {
        self.inner.lock().states[stream.index()]
    }

    /// Claim a stream. Fails with [`GraphError::Busy`] when a conflicting
    /// stream is already open; no state changes in that case.
    pub fn open(&self, stream: StreamId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.expect(&inner, stream, StreamState::Closed, "closed")?;
        if let Some(holder) = conflict_with(stream, inner.active) {
            return Err(GraphError::Busy { stream, holder });
        }
        inner.states[stream.index()] = StreamState::Opened;
        inner.active.insert(stream);
        if let Err(err) = self.apply_primary(inner.active, None) {
            // A failed election must not leave a half-open stream holding
            // the conflict slot; revert so the caller can retry.
            inner.states[stream.index()] = StreamState::Closed;
            inner.active.remove(stream);
            return Err(err);
        }
        debug!(%stream, "stream opened");
        Ok(())
    }

    /// Materialize the stream's pipeline and program its format. On any
    /// failure the components acquired so far are released again and the
    /// stream stays opened.
    pub fn prepare(&self, stream: StreamId, params: &StreamParams) -> Result<()> {
        let mut inner = self.inner.lock();
        self.expect(&inner, stream, StreamState::Opened, "opened")?;
        let topo = topology(stream);

        let mut built = 0;
        for &idx in topo.pipeline {
            if let Err(err) = self.graph.execute(idx) {
                self.unwind(&topo.pipeline[..built]);
                return Err(err);
            }
            built += 1;
        }
        if let Err(err) = self.configure(topo, params) {
            self.unwind(topo.pipeline);
            return Err(err);
        }

        inner.states[stream.index()] = StreamState::Prepared;
        debug!(%stream, rate = params.sample_rate, "stream prepared");
        Ok(())
    }

    /// Start the stream's operators in one batch and hand the clock role
    /// to its clock endpoint.
    pub fn start(&self, stream: StreamId, clock: ClockRole) -> Result<()> {
        let mut inner = self.inner.lock();
        self.expect(&inner, stream, StreamState::Prepared, "prepared")?;
        let topo = topology(stream);

        self.apply_primary(inner.active, None)?;
        self.graph
            .configure_endpoint(topo.clock_endpoint, param::CLOCK_MASTER, &[clock.wire()])?;
        self.graph.start_batch(topo.pipeline)?;

        inner.states[stream.index()] = StreamState::Running;
        debug!(%stream, "stream running");
        Ok(())
    }

    /// Stop the stream's operators; the pipeline stays materialized so a
    /// later start is cheap. The primary election reruns without this
    /// stream so a quieter winner takes over immediately.
    pub fn stop(&self, stream: StreamId) -> Result<()> {
        let mut inner = self.inner.lock();
        self.expect(&inner, stream, StreamState::Running, "running")?;
        let topo = topology(stream);

        self.graph.stop_batch(topo.pipeline)?;
        inner.states[stream.index()] = StreamState::Prepared;
        debug!(%stream, "stream stopped");
        self.apply_primary(inner.active, Some(stream))
    }

    /// Tear the stream down from any non-closed state. Teardown always
    /// completes locally; the first device error encountered is returned
    /// after the walk finishes.
    pub fn destroy(&self, stream: StreamId) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = inner.states[stream.index()];
        if state == StreamState::Closed {
            return Err(GraphError::InvalidState {
                stream,
                state,
                expected: "open, prepared or running",
            });
        }
        let topo = topology(stream);
        let mut first_err: Option<GraphError> = None;

        if state == StreamState::Running {
            if let Err(err) = self.graph.stop_batch(topo.pipeline) {
                warn!(%stream, %err, "stop during destroy failed");
                first_err.get_or_insert(err);
            }
        }
        if state != StreamState::Opened {
            for &idx in topo.pipeline.iter().rev() {
                if let Err(err) = self.graph.release(idx) {
                    warn!(%stream, component = %idx, %err, "release during destroy failed");
                    first_err.get_or_insert(err);
                }
            }
        }

        inner.states[stream.index()] = StreamState::Closed;
        inner.active.remove(stream);
        if let Err(err) = self.apply_primary(inner.active, None) {
            first_err.get_or_insert(err);
        }
        debug!(%stream, crashed = self.watchdog.is_crashed(), "stream destroyed");

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn expect(
        &self,
        inner: &StreamsInner,
        stream: StreamId,
        want: StreamState,
        expected: &'static str,
    ) -> Result<()> {
        let state = inner.states[stream.index()];
        if state != want {
            return Err(GraphError::InvalidState {
                stream,
                state,
                expected,
            });
        }
        Ok(())
    }

    /// Re-run the primary election and push the result to the main mixer
    /// if the winner changed.
    fn apply_primary(&self, active: ActiveStreamSet, exclude: Option<StreamId>) -> Result<()> {
        let active = match exclude {
            Some(stream) => active.without(stream),
            None => active,
        };
        let elected = elect_primary(active);
        if self.graph.set_primary(MAIN_MIXER, elected)? {
            debug!(?elected, "primary stream changed");
        }
        Ok(())
    }

    fn configure(&self, topo: &StreamTopology, params: &StreamParams) -> Result<()> {
        let rate = [
            (params.sample_rate >> 16) as u16,
            params.sample_rate as u16,
        ];
        for &ep in topo.endpoints {
            self.graph.configure_endpoint(ep, param::SAMPLE_RATE, &rate)?;
            self.graph
                .configure_endpoint(ep, param::CHANNELS, &[params.channels])?;
            self.graph
                .configure_endpoint(ep, param::FORMAT, &[params.format.wire()])?;
        }
        if let Some(resampler) = topo.resampler {
            let (input, output) = if topo.capture {
                (NATIVE_RATE, params.sample_rate)
            } else {
                (params.sample_rate, NATIVE_RATE)
            };
            self.graph.set_resampler_rate(resampler, input, output)?;
        }
        Ok(())
    }

    fn unwind(&self, built: &[crate::component::ComponentIndex]) {
        for &idx in built.iter().rev() {
            if let Err(err) = self.graph.release(idx) {
                warn!(component = %idx, %err, "unwind release failed");
            }
        }
    }
}
