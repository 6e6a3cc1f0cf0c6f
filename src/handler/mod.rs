//! The uniform transport contract every protocol translator implements,
//! plus the tagged dispatch over the eight concrete kinds.

pub mod generator;
pub mod http;
pub mod knx;
pub mod modbus;
pub mod mqtt;
pub mod port;
pub mod storage;
pub mod tcp;

use std::time::Duration;

use crate::epoll::{Epoll, Token};
use crate::error::{HandlerError, ValidationError};
use crate::event::Events;
use crate::item::Items;

/// Current externally-observable state of a handler, sampled by its link
/// after every `receive`/`send` round.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerState {
    pub operational: bool,
    pub error_counter: u64,
}

/// Readiness a handler wants reported on the next wait. `None` means the
/// handler has no file descriptor to watch this tick (e.g. waiting out a
/// reconnect backoff) and should be polled again after its timeout hint.
pub struct WaitRequest {
    pub timeout_ms: Option<u64>,
}

impl WaitRequest {
    pub fn after(duration: Duration) -> WaitRequest {
        WaitRequest { timeout_ms: Some(duration.as_millis() as u64) }
    }

    pub fn no_bound() -> WaitRequest {
        WaitRequest { timeout_ms: None }
    }

    pub fn immediate() -> WaitRequest {
        WaitRequest { timeout_ms: Some(0) }
    }
}

/// Every transport handler satisfies this contract. A handler owns its
/// sockets and protocol state machine exclusively; between ticks it is
/// inert and touched only through these five operations.
pub trait HandlerIf {
    /// One-shot at startup. May mutate `readable`/`writable`/`responsive` on
    /// items it owns. Must fail if a binding refers to a missing or
    /// type-incompatible item.
    fn validate(&mut self, items: &mut Items) -> Result<(), ValidationError>;

    /// Pure accessor; the owning link compares this against the previous
    /// sample to decide whether to synthesise an operational STATE_IND.
    fn state(&self) -> HandlerState;

    /// Registers this handler's file descriptor(s) (if any) on `epoll`
    /// under `token`, and returns a timeout hint for the next wait.
    fn collect_wait(&mut self, epoll: &Epoll, token: Token) -> Result<WaitRequest, HandlerError>;

    /// Idempotent when no I/O is ready: returns an empty `Events` rather
    /// than blocking.
    fn receive(&mut self, items: &Items) -> Events;

    /// May return events to be delivered on the link's next `receive`
    /// (a storage handler echoes a persisted WRITE_REQ back as STATE_IND).
    fn send(&mut self, items: &Items, events: &Events) -> Events;
}
