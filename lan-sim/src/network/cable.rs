use crate::context::SimulationContext;
use crate::network::frame::Frame;
use crate::network::inbound_queue::{InboundQueue, NextFrameDelivery};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CableError {
    #[error("port `{0}` is already connected to a cable")]
    PortInUse(String),
    #[error("a cable cannot connect port `{0}` to itself")]
    SamePort(String),
    #[error("cable `{0}` is not connected")]
    NotConnected(Arc<str>),
}

/// A physical connection point of a node, holding at most one cable
pub struct Port {
    pub(crate) owner: Arc<str>,
    pub(crate) index: usize,
    cable: Mutex<Option<Weak<Cable>>>,
    inbound: Arc<Mutex<InboundQueue>>,
}

impl Port {
    pub(crate) fn new(owner: Arc<str>, index: usize) -> Arc<Self> {
        Arc::new(Self {
            owner,
            index,
            cable: Mutex::new(None),
            inbound: Arc::new(Mutex::new(InboundQueue::new())),
        })
    }

    pub fn owner(&self) -> &Arc<str> {
        &self.owner
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn cable(&self) -> Option<Arc<Cable>> {
        self.cable.lock().as_ref().and_then(|cable| cable.upgrade())
    }

    pub fn is_connected(&self) -> bool {
        self.cable().is_some()
    }

    /// Whether the cable plugged into this port was blocked by the spanning tree
    pub fn is_blocked(&self) -> bool {
        self.cable().is_some_and(|cable| cable.is_blocked())
    }

    /// Puts the frame on the cable, or silently drops it when no cable is plugged in
    pub(crate) fn send(&self, frame: Frame) {
        match self.cable() {
            Some(cable) => cable.transmit(frame, self),
            None => {
                // Nowhere to go
            }
        }
    }

    pub(crate) fn next_frames(&self) -> NextFrameDelivery {
        InboundQueue::receive(self.inbound.clone(), usize::MAX)
    }

    pub(crate) fn clear_inbound(&self) {
        self.inbound.lock().clear();
    }

    fn deliver(&self, frame: Frame, delay: Duration) {
        self.inbound.lock().send(frame, delay);
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.owner, self.index)
    }
}

/// A symmetric point-to-point link between two ports
pub struct Cable {
    pub id: Arc<str>,
    ends: [Arc<Port>; 2],
    base_delay: Duration,
    context: Arc<SimulationContext>,
    blocked: AtomicBool,
    connected: AtomicBool,
    busy_until: Mutex<Option<Instant>>,
}

impl Cable {
    /// Plugs a new cable into two free ports
    pub fn connect(
        id: Arc<str>,
        a: &Arc<Port>,
        b: &Arc<Port>,
        base_delay: Duration,
        context: Arc<SimulationContext>,
    ) -> Result<Arc<Cable>, CableError> {
        if Arc::ptr_eq(a, b) {
            return Err(CableError::SamePort(a.to_string()));
        }

        let mut a_cable = a.cable.lock();
        let mut b_cable = b.cable.lock();
        for (port, cable) in [(a, &a_cable), (b, &b_cable)] {
            if matches!(&**cable, Some(c) if c.strong_count() > 0) {
                return Err(CableError::PortInUse(port.to_string()));
            }
        }

        let cable = Arc::new(Cable {
            id,
            ends: [a.clone(), b.clone()],
            base_delay,
            context,
            blocked: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            busy_until: Mutex::new(None),
        });

        *a_cable = Some(Arc::downgrade(&cable));
        *b_cable = Some(Arc::downgrade(&cable));
        Ok(cable)
    }

    /// Unplugs both ends of the cable
    pub fn disconnect(&self) -> Result<(), CableError> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Err(CableError::NotConnected(self.id.clone()));
        }

        for port in &self.ends {
            *port.cable.lock() = None;
        }

        Ok(())
    }

    pub fn ends(&self) -> &[Arc<Port>; 2] {
        &self.ends
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// The delay a frame sent right now would experience
    pub fn delay(&self) -> Duration {
        self.context.scaled(self.base_delay)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// True while at least one frame is travelling over the cable
    pub fn is_active(&self) -> bool {
        self.busy_until
            .lock()
            .is_some_and(|busy_until| Instant::now() < busy_until)
    }

    /// Whether `a` and `b` are the two ends of this cable (in any order)
    pub fn connects(&self, a: &str, b: &str) -> bool {
        let [x, y] = &self.ends;
        (x.owner.as_ref() == a && y.owner.as_ref() == b)
            || (x.owner.as_ref() == b && y.owner.as_ref() == a)
    }

    pub(crate) fn transmit(&self, frame: Frame, from: &Port) {
        let tracer = &self.context.tracer;
        if !self.is_connected() {
            return;
        }

        if self.is_blocked() {
            tracer.track_dropped_on_blocked_cable(&from.owner, &frame);
            return;
        }

        let [a, b] = &self.ends;
        let to = if std::ptr::eq(a.as_ref(), from) { b } else { a };

        let delay = self.delay();
        tracer.track_frame_sent(&from.owner, &self.id, &frame);

        let arrival_time = Instant::now() + delay;
        {
            let mut busy_until = self.busy_until.lock();
            if busy_until.is_none_or(|t| t < arrival_time) {
                *busy_until = Some(arrival_time);
            }
        }

        to.deliver(frame, delay);
    }
}
