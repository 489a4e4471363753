use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_stream::stream;
use futures::stream::BoxStream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::ErrorKind;
use crate::models::{Frame, TerminalReason};

/// One item delivered to a subscriber.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// A published frame and its zero-based offset within the stream.
    Frame { offset: usize, frame: Frame },
    /// The stream terminated; nothing follows.
    Closed(TerminalReason),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Stream {stream_id} already has an active producer")]
    AlreadyOpen { stream_id: String },

    #[error("Stream {stream_id} is not known to the broker")]
    NotFound { stream_id: String },

    #[error("Stream {stream_id} is already closed")]
    Closed { stream_id: String },
}

/// Lifecycle of a stream as seen by readers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    Live,
    Terminated(TerminalReason),
}

struct SlotState {
    frames: Vec<Frame>,
    terminal: Option<TerminalReason>,
    producer_active: bool,
}

/// Buffered frames of one stream. All mutation goes through `state`, so
/// operations on one stream id are linearized while other streams proceed.
struct StreamSlot {
    state: Mutex<SlotState>,
    /// Bumped after every publish and on close to wake subscribers.
    version: watch::Sender<u64>,
}

impl StreamSlot {
    fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Mutex::new(SlotState {
                frames: Vec::new(),
                terminal: None,
                producer_active: true,
            }),
            version,
        }
    }

    fn publish(&self, stream_id: &str, frame: Frame) -> Result<usize, BrokerError> {
        let offset = {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return Err(BrokerError::Closed {
                    stream_id: stream_id.to_string(),
                });
            }
            state.frames.push(frame);
            state.frames.len() - 1
        };
        self.version.send_modify(|v| *v += 1);
        Ok(offset)
    }

    /// Returns false if the stream was already terminated.
    fn close(&self, reason: TerminalReason) -> bool {
        {
            let mut state = self.state.lock();
            if state.terminal.is_some() {
                return false;
            }
            state.terminal = Some(reason);
            state.producer_active = false;
        }
        self.version.send_modify(|v| *v += 1);
        true
    }
}

struct BrokerInner {
    streams: Mutex<HashMap<String, Arc<StreamSlot>>>,
    grace_period: Duration,
}

/// In-process publish/subscribe fan-out of generation frames.
///
/// One producer per stream id appends frames; any number of subscribers
/// read them from an offset, including after the stream has closed. Closed
/// streams keep their buffer for `grace_period`, then are evicted.
#[derive(Clone)]
pub struct StreamBroker {
    inner: Arc<BrokerInner>,
}

impl StreamBroker {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                streams: Mutex::new(HashMap::new()),
                grace_period,
            }),
        }
    }

    /// Become the producer of `stream_id`.
    pub fn open(&self, stream_id: &str) -> Result<Producer, BrokerError> {
        let mut streams = self.inner.streams.lock();
        let slot = match streams.get(stream_id) {
            Some(slot) => {
                let mut state = slot.state.lock();
                if state.producer_active {
                    return Err(BrokerError::AlreadyOpen {
                        stream_id: stream_id.to_string(),
                    });
                }
                if state.terminal.is_some() {
                    return Err(BrokerError::Closed {
                        stream_id: stream_id.to_string(),
                    });
                }
                state.producer_active = true;
                slot.clone()
            }
            None => {
                let slot = Arc::new(StreamSlot::new());
                streams.insert(stream_id.to_string(), slot.clone());
                slot
            }
        };

        debug!(stream_id, "Opened stream");
        Ok(Producer {
            broker: self.clone(),
            stream_id: stream_id.to_string(),
            slot,
            closed: false,
        })
    }

    /// Append a frame to `stream_id`, returning its offset.
    pub fn publish(&self, stream_id: &str, frame: Frame) -> Result<usize, BrokerError> {
        self.slot(stream_id)?.publish(stream_id, frame)
    }

    /// Terminate `stream_id`. Closing an already-closed stream is a no-op.
    pub fn close(&self, stream_id: &str, reason: TerminalReason) -> Result<(), BrokerError> {
        let slot = self.slot(stream_id)?;
        self.close_slot(stream_id, &slot, reason);
        Ok(())
    }

    /// Frames from `from_offset` onward, then the terminal marker once closed.
    ///
    /// The returned stream is lazy and owns its own cursor; dropping it has no
    /// effect on the producer or on other subscribers.
    pub fn subscribe(
        &self,
        stream_id: &str,
        from_offset: usize,
    ) -> Result<BoxStream<'static, StreamEvent>, BrokerError> {
        let slot = self.slot(stream_id)?;
        let mut version = slot.version.subscribe();
        debug!(stream_id, from_offset, "Subscribed to stream");

        Ok(Box::pin(stream! {
            let mut next = from_offset;
            loop {
                version.mark_unchanged();
                let (batch, terminal) = {
                    let state = slot.state.lock();
                    let batch = state.frames.get(next..).map(<[Frame]>::to_vec).unwrap_or_default();
                    (batch, state.terminal)
                };

                for frame in batch {
                    yield StreamEvent::Frame { offset: next, frame };
                    next += 1;
                }

                if let Some(reason) = terminal {
                    yield StreamEvent::Closed(reason);
                    break;
                }

                if version.changed().await.is_err() {
                    break;
                }
            }
        }))
    }

    pub fn status(&self, stream_id: &str) -> Option<StreamStatus> {
        let slot = self.slot(stream_id).ok()?;
        let state = slot.state.lock();
        Some(match state.terminal {
            Some(reason) => StreamStatus::Terminated(reason),
            None => StreamStatus::Live,
        })
    }

    /// Number of frames buffered for `stream_id`.
    pub fn frame_count(&self, stream_id: &str) -> Option<usize> {
        let slot = self.slot(stream_id).ok()?;
        let len = slot.state.lock().frames.len();
        Some(len)
    }

    fn slot(&self, stream_id: &str) -> Result<Arc<StreamSlot>, BrokerError> {
        self.inner
            .streams
            .lock()
            .get(stream_id)
            .cloned()
            .ok_or_else(|| BrokerError::NotFound {
                stream_id: stream_id.to_string(),
            })
    }

    fn close_slot(&self, stream_id: &str, slot: &Arc<StreamSlot>, reason: TerminalReason) {
        if !slot.close(reason) {
            return;
        }
        debug!(stream_id, reason = %reason, "Closed stream");
        self.schedule_eviction(stream_id.to_string(), Arc::downgrade(slot));
    }

    fn schedule_eviction(&self, stream_id: String, slot: Weak<StreamSlot>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(stream_id = %stream_id, "No runtime to schedule stream eviction");
            return;
        };
        let inner = Arc::downgrade(&self.inner);
        let grace_period = self.inner.grace_period;

        runtime.spawn(async move {
            tokio::time::sleep(grace_period).await;
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let mut streams = inner.streams.lock();
            // Only evict the slot this close belonged to.
            let same_slot = match (streams.get(&stream_id), slot.upgrade()) {
                (Some(current), Some(closed)) => Arc::ptr_eq(current, &closed),
                _ => false,
            };
            if same_slot {
                streams.remove(&stream_id);
                debug!(stream_id = %stream_id, "Evicted closed stream");
            }
        });
    }
}

/// Exclusive write access to one stream.
///
/// Dropping a producer without closing it terminates the stream with
/// `error:interrupted` so readers never wait on an abandoned generation.
pub struct Producer {
    broker: StreamBroker,
    stream_id: String,
    slot: Arc<StreamSlot>,
    closed: bool,
}

impl Producer {
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn publish(&self, frame: Frame) -> Result<usize, BrokerError> {
        self.slot.publish(&self.stream_id, frame)
    }

    pub fn close(mut self, reason: TerminalReason) {
        self.closed = true;
        self.broker.close_slot(&self.stream_id, &self.slot, reason);
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        if !self.closed {
            warn!(stream_id = %self.stream_id, "Producer dropped without closing stream");
            self.broker.close_slot(
                &self.stream_id,
                &self.slot,
                TerminalReason::Error(ErrorKind::Interrupted),
            );
        }
    }
}
