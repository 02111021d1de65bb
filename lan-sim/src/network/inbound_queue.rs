use crate::network::frame::Frame;
use parking_lot::Mutex;
use std::collections::BinaryHeap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;
use tokio::time::{Instant, Sleep};

/// Frames travelling towards a port, released in order of arrival time
pub struct InboundQueue {
    queue: BinaryHeap<InTransitFrame>,
    notify_new_frames: Vec<Waker>,
}

impl InboundQueue {
    pub(crate) fn new() -> Self {
        Self {
            queue: BinaryHeap::new(),
            notify_new_frames: Vec::new(),
        }
    }

    pub(crate) fn send(&mut self, frame: Frame, delay: Duration) {
        self.queue.push(InTransitFrame {
            frame,
            arrival_time: Instant::now() + delay,
        });

        for waker in self.notify_new_frames.drain(..) {
            waker.wake();
        }
    }

    pub(crate) fn clear(&mut self) {
        self.queue.clear();
    }

    pub(crate) fn receive(this: Arc<Mutex<Self>>, max_frames: usize) -> NextFrameDelivery {
        NextFrameDelivery {
            sleep: None,
            queue: this,
            max_frames,
        }
    }

    fn register_waker(&mut self, waker: &Waker) {
        if !self.notify_new_frames.iter().any(|w| w.will_wake(waker)) {
            self.notify_new_frames.push(waker.clone());
        }
    }
}

pub struct NextFrameDelivery {
    sleep: Option<Pin<Box<Sleep>>>,
    queue: Arc<Mutex<InboundQueue>>,
    max_frames: usize,
}

impl Future for NextFrameDelivery {
    type Output = Vec<Frame>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut delivered = Vec::new();
        loop {
            if delivered.len() >= this.max_frames {
                break;
            }

            let mut queue = this.queue.lock();
            let Some(next_arrival_time) = queue.queue.peek().map(|next| next.arrival_time) else {
                // No frames in transit, so nothing to do
                break;
            };

            if next_arrival_time <= Instant::now() {
                if let Some(next) = queue.queue.pop() {
                    delivered.push(next.frame);
                }
                continue;
            }

            // Return what we have found so far, so the reader can make progress
            if !delivered.is_empty() {
                break;
            }

            // A frame sent after we started sleeping might arrive earlier, so the sleep is
            // re-armed for the current head of the queue
            match &mut this.sleep {
                Some(sleep) if sleep.deadline() == next_arrival_time => {}
                Some(sleep) => sleep.as_mut().reset(next_arrival_time),
                None => this.sleep = Some(Box::pin(tokio::time::sleep_until(next_arrival_time))),
            }

            let Some(sleep) = &mut this.sleep else {
                unreachable!("sleep was just armed");
            };
            if sleep.as_mut().poll(cx).is_pending() {
                queue.register_waker(cx.waker());
                return Poll::Pending;
            }

            // The sleep elapsed, so the next frame can be delivered in the next iteration
            this.sleep = None;
        }

        if delivered.is_empty() {
            this.queue.lock().register_waker(cx.waker());
            Poll::Pending
        } else {
            Poll::Ready(delivered)
        }
    }
}

// In transit frames, sorted by arrival time
struct InTransitFrame {
    frame: Frame,
    arrival_time: Instant,
}

impl Eq for InTransitFrame {}

impl PartialEq<Self> for InTransitFrame {
    fn eq(&self, other: &Self) -> bool {
        self.arrival_time == other.arrival_time && self.frame.number == other.frame.number
    }
}

impl PartialOrd<Self> for InTransitFrame {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InTransitFrame {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Note: the order is reversed, so the "max" frame will be the next one to be delivered
        other
            .arrival_time
            .cmp(&self.arrival_time)
            .then(other.frame.number.cmp(&self.frame.number))
    }
}
