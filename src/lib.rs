//! An event bus that bridges values observed in, and commands directed
//! toward, heterogeneous field-level protocols (KNX, MQTT, Modbus/TCP,
//! serial lines, HTTP, raw TCP, on-disk storage, synthetic generators) by
//! normalising every exchange into a small typed event vocabulary and
//! routing those events between pluggable transport handlers.
//!
//! The crate is organised bottom-up, in the same dependency order the
//! engine assembles at startup:
//!
//! - [`value`] / [`unit`] — the tagged [`value::Value`] every event carries,
//!   and the closed unit-conversion table it can express numbers in.
//! - [`item`] — the typed, policy-bearing state cell ([`item::Item`]) every
//!   event refers to: send-suppression gates, bounded history, polling
//!   clock.
//! - [`event`] — the immutable `(origin, item, type, value)` record that
//!   flows between links and the engine.
//! - [`handler`] — the uniform transport contract (`HandlerIf`) and the
//!   eight concrete protocol translators.
//! - [`link`] — wraps one handler with the generic value-coercion pipeline
//!   (ownership, type, unit, pattern, OBIS, JSON-pointer, mapping) and
//!   operational-health reporting.
//! - [`engine`] — the single-threaded cooperative dispatch loop tying it
//!   all together.
//! - [`config`] — the on-disk JSON configuration these are all built from.
//! - [`epoll`] / [`sys`] / [`awakener`] — the readiness-driven wait
//!   primitive the engine multiplexes handlers through.

#[macro_use]
mod macros;

pub mod awakener;
pub mod config;
pub mod engine;
pub mod epoll;
pub mod error;
pub mod event;
pub mod handler;
pub mod item;
pub mod link;
pub mod sml;
mod sys;
pub mod unit;
pub mod value;

pub use config::Config;
pub use engine::Engine;
