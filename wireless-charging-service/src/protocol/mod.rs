//! Request/response transport to the transmitter
//!
//! At most one request is pending at a time. A second request fails with
//! [`Error::Busy`] instead of replacing the pending one. Each request carries a unique
//! id so that a completion arriving after its caller gave up is ignored.
use core::cell::Cell;
use core::future::Future;
use core::sync::atomic::{AtomicUsize, Ordering};

use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::signal::Signal;
use embassy_time::{with_timeout, Duration, Timer};
use embedded_services::power::wireless::Error;
use embedded_services::{debug, trace, warn};

pub mod message;

pub use message::{Ack, Command, Frame, Inbound, Message, Response};

/// Physical link used to send frames
pub trait Link {
    /// Write a frame
    fn write(&self, frame: &Frame) -> impl Future<Output = Result<(), Error>>;
    /// Returns true while the receiver is online
    fn online(&self) -> bool;
}

/// How long to wait for an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Wait {
    /// Send and return immediately
    NoWait,
    /// Wait for the acknowledgement up to the given time
    Timeout(Duration),
    /// Return immediately and resend in the background until acknowledged
    Resend,
}

/// Unique id of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RequestId(usize);

#[derive(Debug, Clone, Copy)]
struct Pending {
    id: RequestId,
    cmd: Command,
    expected: Ack,
    frame: Frame,
    resend: bool,
    attempts: u8,
}

/// Result of dispatching an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Dispatched {
    /// Decoded frame
    pub inbound: Inbound,
    /// The frame completed the pending request
    pub completed: Option<Command>,
}

struct PendingGuard<'a> {
    transport: &'a Transport,
    id: RequestId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.transport.release(self.id);
    }
}

/// Transport state
pub struct Transport {
    pending: BlockingMutex<NoopRawMutex, Cell<Option<Pending>>>,
    response: Signal<NoopRawMutex, (RequestId, Result<Response, Error>)>,
    resend_kick: Signal<NoopRawMutex, RequestId>,
    next_request_id: AtomicUsize,
    resend_interval: Duration,
    resend_max: u8,
}

impl Transport {
    /// Create a new transport
    pub fn new(resend_interval: Duration, resend_max: u8) -> Self {
        Self {
            pending: BlockingMutex::new(Cell::new(None)),
            response: Signal::new(),
            resend_kick: Signal::new(),
            next_request_id: AtomicUsize::new(0),
            resend_interval,
            resend_max,
        }
    }

    fn get_next_request_id(&self) -> RequestId {
        RequestId(self.next_request_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Returns true if a request is waiting for its acknowledgement
    pub fn is_pending(&self) -> bool {
        self.pending.lock(|p| p.get().is_some())
    }

    /// Command of the pending request
    pub fn pending_command(&self) -> Option<Command> {
        self.pending.lock(|p| p.get().map(|p| p.cmd))
    }

    /// Claim the pending slot, fails if it is taken
    fn claim(&self, pending: Pending) -> Result<(), Error> {
        self.pending.lock(|p| {
            if p.get().is_some() {
                return Err(Error::Busy);
            }
            p.set(Some(pending));
            Ok(())
        })
    }

    /// Release the pending slot if it still belongs to `id`
    fn release(&self, id: RequestId) -> Option<Pending> {
        self.pending.lock(|p| match p.get() {
            Some(pending) if pending.id == id => p.take(),
            _ => None,
        })
    }

    /// Send a message
    ///
    /// Returns the response for [`Wait::Timeout`], `None` for the other modes.
    pub async fn send(&self, link: &impl Link, msg: Message, wait: Wait) -> Result<Option<Response>, Error> {
        if !link.online() {
            return Err(Error::Offline);
        }

        let frame = msg.encode();
        let expected = match (msg.cmd.ack(), wait) {
            (Some(ack), Wait::Timeout(_) | Wait::Resend) => ack,
            _ => {
                // Nothing to correlate, but never interleave with a pending request
                if self.is_pending() {
                    return Err(Error::Busy);
                }
                trace!("Sending {:?} without waiting", msg.cmd);
                link.write(&frame).await?;
                return Ok(None);
            }
        };

        let id = self.get_next_request_id();
        self.claim(Pending {
            id,
            cmd: msg.cmd,
            expected,
            frame,
            resend: wait == Wait::Resend,
            attempts: 0,
        })?;
        // Releases the slot on every exit, including the caller dropping this future
        let guard = PendingGuard { transport: self, id };
        self.response.reset();

        link.write(&frame).await?;

        let timeout = match wait {
            Wait::Timeout(timeout) => timeout,
            _ => {
                core::mem::forget(guard);
                self.resend_kick.signal(id);
                return Ok(None);
            }
        };

        let result = with_timeout(timeout, async {
            loop {
                let (response_id, response) = self.response.wait().await;
                if response_id == id {
                    return response;
                }
                debug!("Ignoring completion of request {}", response_id.0);
            }
        })
        .await;

        match result {
            Ok(response) => response.map(Some),
            Err(_) => {
                warn!("{:?} timed out", msg.cmd);
                Err(Error::Timeout)
            }
        }
    }

    /// Decode an inbound frame and complete the pending request if it matches
    ///
    /// Returns `None` for frames that fail to decode, those are dropped and the pending
    /// request keeps waiting.
    pub fn dispatch(&self, frame: &[u8; 6]) -> Option<Dispatched> {
        let inbound = match Inbound::decode(frame) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping frame: {:?}", e);
                return None;
            }
        };

        let completed = inbound.ack().and_then(|(ack, data)| {
            let pending = self.pending.lock(|p| match p.get() {
                Some(pending) if pending.expected == ack => p.take(),
                _ => None,
            })?;
            self.response.signal((pending.id, Ok(Response { ack, data })));
            Some(pending.cmd)
        });

        Some(Dispatched { inbound, completed })
    }

    /// Drop the pending request and release its caller
    pub fn cancel(&self) {
        if let Some(pending) = self.pending.lock(|p| p.take()) {
            debug!("Cancelling {:?}", pending.cmd);
            self.response.signal((pending.id, Err(Error::Cancelled)));
        }
    }

    /// Drop a pending [`Wait::Resend`] request for `cmd`
    ///
    /// Returns true if a request was dropped. Requests with a waiting caller are left alone.
    pub fn abandon(&self, cmd: Command) -> bool {
        self.pending.lock(|p| match p.get() {
            Some(pending) if pending.cmd == cmd && pending.resend => {
                debug!("Abandoning {:?}", cmd);
                p.set(None);
                true
            }
            _ => false,
        })
    }

    /// Background resend loop for [`Wait::Resend`] requests
    pub async fn run_resend(&self, link: &impl Link) {
        loop {
            let id = self.resend_kick.wait().await;
            loop {
                Timer::after(self.resend_interval).await;

                let Some(pending) = self.pending.lock(|p| p.get()) else {
                    break;
                };
                if pending.id != id || !pending.resend {
                    break;
                }
                if !link.online() {
                    self.cancel();
                    break;
                }
                if pending.attempts >= self.resend_max {
                    warn!("{:?} not acknowledged after {} resends", pending.cmd, pending.attempts);
                    self.release(id);
                    break;
                }

                self.pending.lock(|p| {
                    p.set(Some(Pending {
                        attempts: pending.attempts + 1,
                        ..pending
                    }))
                });
                trace!("Resending {:?}", pending.cmd);
                if link.write(&pending.frame).await.is_err() {
                    warn!("Resend of {:?} failed", pending.cmd);
                }
            }
        }
    }
}
