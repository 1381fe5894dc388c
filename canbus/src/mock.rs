//! A scriptable in-memory bus used by the protocol tests.

use std::collections::VecDeque;
use std::time::Duration;

use crate::{CanBus, Error, Frame};

/// Synthesizes zero or more reply frames for each sent frame, playing the
/// role of the devices on the bus.
pub type Responder = Box<dyn FnMut(&Frame) -> Vec<Frame> + Send>;

/// A bus double: records every sent frame, hands out queued inbound frames,
/// and optionally runs a [`Responder`] modelling the far side.
///
/// `recv` on an empty queue sleeps out the full timeout, like a silent bus.
#[derive(Default)]
pub struct MockBus {
    /// Every frame sent through the bus, in order.
    pub sent: Vec<Frame>,
    inbound: VecDeque<Frame>,
    responder: Option<Responder>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder: Some(responder),
            ..Self::default()
        }
    }

    /// Queue a frame as if it had arrived from the bus.
    pub fn push_inbound(&mut self, frame: Frame) {
        self.inbound.push_back(frame);
    }
}

impl CanBus for MockBus {
    fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        self.sent.push(*frame);
        if let Some(responder) = self.responder.as_mut() {
            for reply in responder(frame) {
                self.inbound.push_back(reply);
            }
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, Error> {
        match self.inbound.pop_front() {
            Some(frame) => Ok(Some(frame)),
            None => {
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responder_feeds_the_inbound_queue() {
        let mut bus = MockBus::with_responder(Box::new(|frame| {
            vec![Frame::new(frame.id() | 1, frame.data()).unwrap()]
        }));
        bus.send(&Frame::new(0x100, &[0xAA]).unwrap()).unwrap();
        let reply = bus.recv(Duration::from_millis(1)).unwrap().unwrap();
        assert_eq!(reply.id(), 0x101);
        assert_eq!(reply.data(), &[0xAA]);
    }

    #[test]
    fn empty_queue_sleeps_out_the_timeout() {
        let mut bus = MockBus::new();
        let start = std::time::Instant::now();
        assert!(bus.recv(Duration::from_millis(20)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
