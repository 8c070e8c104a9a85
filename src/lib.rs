//! Device-side ISO/IEC 14908-1 (LON) protocol-stack core.
//!
//! A peer node on a multi-domain control network: it originates and
//! consumes application datagrams, keeps a persistent configuration
//! identity, and talks to the wire through a serial USB network
//! interface.  The crate is a cooperatively scheduled pipeline: the host
//! constructs a [`Stack`] and calls [`Stack::service`] on every tick;
//! nothing inside blocks, sleeps, or spawns.
//!
//! Platform services are injected behind traits: a millisecond
//! [`time::Clock`], one or more [`drivers::link::LinkPort`]s, and a
//! [`node::persist::PersistentStore`] for the configuration image.

#![no_std]
#![warn(rust_2018_idioms)]

extern crate alloc;
#[cfg(test)]
extern crate std;

mod collections;
mod config;
mod entropy;
mod stack;
mod stats;

pub mod drivers;
pub mod net;
pub mod node;
pub mod time;
pub mod transport;

pub use crate::config::MAX_APDU_SIZE;
pub use crate::stack::{ServiceLed, Stack, StackConfig, SubmitError};
pub use crate::stats::{Stat, Statistics, SystemError};
pub use crate::transport::{AltKey, AppEvent, CompletionEvent, IncomingMessage, ResponseParam,
	SendAddress, SendDomain, SendRequest, SendTimers, Service};
