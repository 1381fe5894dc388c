//! SocketCAN backend with a background listener thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use socketcan::{
    CanFilter, CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Id, Socket, SocketOptions,
};
use tracing::{trace, warn};

use crate::{CanBus, Error, Filter, Frame};

// How often the listener wakes up to check for shutdown.
const LISTENER_POLL: Duration = Duration::from_millis(50);

/// A SocketCAN interface (e.g. `can0`) with buffered reception.
///
/// Two kernel sockets are opened on the same interface: one for transmission
/// and one, carrying the acceptance filter, drained by a listener thread into
/// an unbounded channel. The listener runs until the bus is dropped.
pub struct SocketCan {
    tx: CanSocket,
    inbound: Receiver<Frame>,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
}

impl SocketCan {
    /// Open `interface` with an optional acceptance filter on the receive
    /// side.
    pub fn open(interface: &str, filter: Option<Filter>) -> Result<Self, Error> {
        let tx = CanSocket::open(interface)?;
        let rx = CanSocket::open(interface)?;
        if let Some(f) = filter {
            rx.set_filters(&[CanFilter::new(f.id, f.mask)])?;
        }

        let (sender, inbound) = mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let listener = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    match rx.read_frame_timeout(LISTENER_POLL) {
                        Ok(raw) => {
                            let Some(frame) = convert(&raw) else { continue };
                            trace!("recv id {:#x}: {:02x?}", frame.id(), frame.data());
                            if sender.send(frame).is_err() {
                                break;
                            }
                        }
                        Err(e) if would_block(&e) => continue,
                        Err(e) => {
                            warn!("CAN listener stopped: {e}");
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            tx,
            inbound,
            stop,
            listener: Some(listener),
        })
    }
}

impl CanBus for SocketCan {
    fn send(&mut self, frame: &Frame) -> Result<(), Error> {
        let id = ExtendedId::new(frame.id()).ok_or(Error::InvalidId(frame.id()))?;
        let raw = CanFrame::new(id, frame.data()).ok_or(Error::Oversize(frame.data().len()))?;
        trace!("send id {:#x}: {:02x?}", frame.id(), frame.data());
        self.tx.write_frame(&raw)?;
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Frame>, Error> {
        match self.inbound.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }
}

impl Drop for SocketCan {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

fn would_block(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

fn convert(raw: &CanFrame) -> Option<Frame> {
    if !matches!(raw, CanFrame::Data(_)) {
        return None;
    }
    let id = match raw.id() {
        Id::Extended(id) => id.as_raw(),
        // The board protocols only ever use extended identifiers.
        Id::Standard(_) => return None,
    };
    Frame::new(id, raw.data()).ok()
}
