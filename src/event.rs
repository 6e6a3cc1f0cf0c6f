//! The event vocabulary that flows between links and the engine.

use std::fmt;

use crate::value::Value;

/// Reserved origin id for events synthesised by the engine itself (polling,
/// send-on-timer, WRITE_REQ→READ_REQ follow-ups, operational reporting).
pub const CONTROL_LINK_ID: &str = "controlLinkId";

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EventType {
    /// A reported state: "the item now has this value".
    StateInd,
    /// A request to change an item's value.
    WriteReq,
    /// A request to re-read an item's current value. Always carries VOID.
    ReadReq,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::StateInd => "STATE_IND",
            EventType::WriteReq => "WRITE_REQ",
            EventType::ReadReq => "READ_REQ",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable `(origin, item, type, value)` record. Transient: created by
/// handlers or the engine, consumed within one tick, then discarded.
#[derive(Clone, Debug, PartialEq)]
pub struct Event {
    origin_link_id: String,
    item_id: String,
    event_type: EventType,
    value: Value,
}

impl Event {
    pub fn new(origin_link_id: impl Into<String>, item_id: impl Into<String>, event_type: EventType, value: Value) -> Event {
        Event {
            origin_link_id: origin_link_id.into(),
            item_id: item_id.into(),
            event_type,
            value,
        }
    }

    pub fn read_req(origin_link_id: impl Into<String>, item_id: impl Into<String>) -> Event {
        Event::new(origin_link_id, item_id, EventType::ReadReq, Value::new_void())
    }

    pub fn origin_id(&self) -> &str {
        &self.origin_link_id
    }

    pub fn item_id(&self) -> &str {
        &self.item_id
    }

    pub fn event_type(&self) -> EventType {
        self.event_type
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn with_value(mut self, value: Value) -> Event {
        self.value = value;
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.event_type == EventType::ReadReq {
            write!(f, "{} from {} for {}", self.event_type, self.origin_link_id, self.item_id)
        } else {
            write!(
                f,
                "{} from {} for {}: {} [{}]",
                self.event_type,
                self.origin_link_id,
                self.item_id,
                self.value,
                self.value.value_type().map(|vt| vt.as_str()).unwrap_or("NULL")
            )
        }
    }
}

pub type Events = Vec<Event>;
