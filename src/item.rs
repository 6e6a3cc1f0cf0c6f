//! The typed state cell every event refers to: [`Item`], plus its
//! send-suppression gates, bounded history and polling clock.

use std::collections::VecDeque;
use std::time::Duration;

use indexmap::IndexMap;

use crate::event::CONTROL_LINK_ID;
use crate::unit::{Unit, UnitType};
use crate::value::{Number, TimePoint, Value, ValueType, ValueTypes};

#[derive(Clone, Copy, Debug, Default)]
pub struct SendOnTimer {
    pub active: bool,
    pub interval: Duration,
}

#[derive(Clone, Copy, Debug)]
pub struct SendOnChange {
    pub active: bool,
    pub abs_variation: Number,
    pub rel_variation: Number,
    pub minimum: Number,
    pub maximum: Number,
}

impl Default for SendOnChange {
    fn default() -> Self {
        SendOnChange {
            active: false,
            abs_variation: 0.0,
            rel_variation: 0.0,
            minimum: Number::NEG_INFINITY,
            maximum: Number::INFINITY,
        }
    }
}

/// A single historized numeric sample.
#[derive(Clone, Copy, Debug)]
struct Sample {
    time: TimePoint,
    number: Number,
}

#[derive(Debug)]
pub struct Item {
    id: String,
    owner_id: String,
    value_types: ValueTypes,
    unit: Unit,
    readable: bool,
    writable: bool,
    responsive: bool,
    polling_interval: Duration,
    send_on_timer: SendOnTimer,
    send_on_change: SendOnChange,
    history_period: Duration,

    last_value: Value,
    last_send_value: Value,
    last_send_time: TimePoint,
    last_polling_time: TimePoint,
    history: VecDeque<Sample>,
}

impl Item {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        owner_id: impl Into<String>,
        value_types: ValueTypes,
        unit: Unit,
        readable: bool,
        writable: bool,
        responsive: bool,
        polling_interval: Duration,
        send_on_timer: SendOnTimer,
        send_on_change: SendOnChange,
        history_period: Duration,
    ) -> Item {
        Item {
            id: id.into(),
            owner_id: owner_id.into(),
            value_types,
            unit,
            readable,
            writable,
            responsive,
            polling_interval,
            send_on_timer,
            send_on_change,
            history_period,
            last_value: Value::Null,
            last_send_value: Value::Null,
            last_send_time: TimePoint(0),
            last_polling_time: TimePoint(0),
            history: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }

    pub fn has_value_type(&self, vt: ValueType) -> bool {
        self.value_types.contains(vt)
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn set_readable(&mut self, readable: bool) {
        self.readable = readable;
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn set_writable(&mut self, writable: bool) {
        self.writable = writable;
    }

    pub fn is_responsive(&self) -> bool {
        self.responsive
    }

    pub fn set_responsive(&mut self, responsive: bool) {
        self.responsive = responsive;
    }

    pub fn is_polling_enabled(&self) -> bool {
        self.polling_interval > Duration::ZERO
    }

    pub fn is_send_on_change_active(&self) -> bool {
        self.send_on_change.active
    }

    pub fn last_value(&self) -> &Value {
        &self.last_value
    }

    pub fn last_send_value(&self) -> &Value {
        &self.last_send_value
    }

    pub fn set_last_send_value(&mut self, value: Value) {
        self.last_value = value.clone();
        self.last_send_value = value;
    }

    pub fn set_last_send_time(&mut self, now: TimePoint) {
        self.last_send_time = now;
    }

    /// §4.1 — true iff `send_on_change` is inactive, or the new value
    /// differs from `last_value` by enough to matter.
    pub fn is_send_on_change_required(&self, value: &Value) -> bool {
        if !self.send_on_change.active {
            return true;
        }
        if &self.last_value == value {
            return false;
        }
        if let (Value::Number(old, _), Some(n)) = (&self.last_value, value.as_number()) {
            let p = &self.send_on_change;
            if n >= p.minimum
                && n <= p.maximum
                && n >= old * (1.0 - p.rel_variation / 100.0) - p.abs_variation
                && n <= old * (1.0 + p.rel_variation / 100.0) + p.abs_variation
            {
                return false;
            }
        }
        true
    }

    /// §4.1 — true iff the send-on-timer gate fires.
    pub fn is_send_on_timer_required(&self, now: TimePoint) -> bool {
        self.send_on_timer.active
            && !self.last_value.is_null()
            && self.last_send_time.0 + self.send_on_timer.interval.as_secs() as i64 <= now.0
    }

    pub fn is_polling_required(&self, now: TimePoint) -> bool {
        debug_assert!(self.is_polling_enabled());
        self.last_polling_time.0 + self.polling_interval.as_secs() as i64 <= now.0
    }

    /// Desynchronises polls of distinct items by offsetting the initial
    /// `last_polling_time` into the past by a random fraction of the
    /// interval.
    pub fn init_polling(&mut self, now: TimePoint) {
        debug_assert!(self.is_polling_enabled());
        let span = self.polling_interval.as_secs().max(1);
        let offset = fastrand::u64(0..span);
        self.last_polling_time = TimePoint(now.0 - offset as i64);
    }

    pub fn polling_done(&mut self, now: TimePoint) {
        self.last_polling_time = now;
    }

    /// §4.1 — appends `(now, n)` on every accepted numeric STATE_IND and
    /// drops samples older than `now - history_period`.
    pub fn add_to_history(&mut self, now: TimePoint, value: &Value) {
        if self.history_period.is_zero() {
            return;
        }
        if let Some(n) = value.as_number() {
            self.history.push_back(Sample { time: now, number: n });
        }
        let cutoff = now.0 - self.history_period.as_secs() as i64;
        while matches!(self.history.front(), Some(s) if s.time.0 < cutoff) {
            self.history.pop_front();
        }
    }

    pub fn calc_min_from_history(&self, start: TimePoint) -> Value {
        let Some(mut number) = self.last_value.as_number() else {
            return Value::new_undefined();
        };
        for sample in self.history.iter().rev().take_while(|s| s.time >= start) {
            if sample.number < number {
                number = sample.number;
            }
        }
        Value::new_number(number)
    }

    pub fn calc_max_from_history(&self, start: TimePoint) -> Value {
        let Some(mut number) = self.last_value.as_number() else {
            return Value::new_undefined();
        };
        for sample in self.history.iter().rev().take_while(|s| s.time >= start) {
            if sample.number > number {
                number = sample.number;
            }
        }
        Value::new_number(number)
    }

    pub fn validate_owner_id(&self, owner_id: &str) -> Result<(), String> {
        if self.owner_id != owner_id {
            return Err(format!("item {} must be owned by link {owner_id}", self.id));
        }
        Ok(())
    }

    pub fn validate_readable(&self, readable: bool) -> Result<(), String> {
        if self.readable != readable {
            return Err(format!(
                "item {} must {}be readable",
                self.id,
                if readable { "" } else { "not " }
            ));
        }
        Ok(())
    }

    pub fn validate_writable(&self, writable: bool) -> Result<(), String> {
        if self.writable != writable {
            return Err(format!(
                "item {} must {}be writable",
                self.id,
                if writable { "" } else { "not " }
            ));
        }
        Ok(())
    }

    pub fn validate_responsive(&self, responsive: bool) -> Result<(), String> {
        if self.responsive != responsive {
            return Err(format!(
                "item {} must {}be responsive",
                self.id,
                if responsive { "" } else { "not " }
            ));
        }
        Ok(())
    }

    pub fn validate_polling_enabled(&self, enabled: bool) -> Result<(), String> {
        if self.is_polling_enabled() != enabled {
            return Err(format!(
                "item {} must {}be polled",
                self.id,
                if enabled { "" } else { "not " }
            ));
        }
        Ok(())
    }

    pub fn validate_history(&self) -> Result<(), String> {
        if self.history_period.is_zero() {
            return Err(format!("item {} must be historized", self.id));
        }
        Ok(())
    }

    pub fn validate_value_type(&self, vt: ValueType) -> Result<(), String> {
        if !self.has_value_type(vt) {
            return Err(format!("item {} must have value type {vt}", self.id));
        }
        Ok(())
    }

    pub fn validate_value_type_not(&self, vt: ValueType) -> Result<(), String> {
        if self.has_value_type(vt) {
            return Err(format!("item {} must not have value type {vt}", self.id));
        }
        Ok(())
    }

    pub fn validate_unit_type(&self, unit_type: UnitType) -> Result<(), String> {
        if self.unit.unit_type() != unit_type || unit_type == UnitType::Unknown {
            return Err(format!("item {} must have unit type {unit_type}", self.id));
        }
        Ok(())
    }
}

/// The id of the reserved "owner" used by engine-synthesised items/events.
pub fn is_control_owned(owner_id: &str) -> bool {
    owner_id == CONTROL_LINK_ID
}

/// All items, keyed by id, in declaration order (the order links iterate
/// them in matters for deterministic logging and tests).
pub type Items = IndexMap<String, Item>;

pub fn validate_item<'a>(items: &'a Items, item_id: &str) -> Result<&'a Item, String> {
    items.get(item_id).ok_or_else(|| format!("item {item_id} referenced but not defined"))
}

pub fn validate_item_mut<'a>(items: &'a mut Items, item_id: &str) -> Result<&'a mut Item, String> {
    items
        .get_mut(item_id)
        .ok_or_else(|| format!("item {item_id} referenced but not defined"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item_with_change_gate() -> Item {
        let mut item = Item::new(
            "temp",
            CONTROL_LINK_ID,
            ValueTypes::parse("NUMBER").unwrap(),
            Unit::Celsius,
            true,
            false,
            false,
            Duration::ZERO,
            SendOnTimer::default(),
            SendOnChange {
                active: true,
                abs_variation: 0.5,
                rel_variation: 0.0,
                minimum: Number::NEG_INFINITY,
                maximum: Number::INFINITY,
            },
            Duration::from_secs(3600),
        );
        item.set_last_send_value(Value::new_number(20.0));
        item
    }

    #[test]
    fn suppresses_small_variation() {
        let item = item_with_change_gate();
        assert!(!item.is_send_on_change_required(&Value::new_number(20.3)));
    }

    #[test]
    fn forwards_large_variation() {
        let item = item_with_change_gate();
        assert!(item.is_send_on_change_required(&Value::new_number(20.6)));
    }

    #[test]
    fn inactive_gate_always_requires_send() {
        let mut item = item_with_change_gate();
        item.send_on_change.active = false;
        assert!(item.is_send_on_change_required(&Value::new_number(20.0000001)));
    }

    #[test]
    fn history_drops_old_samples() {
        let mut item = item_with_change_gate();
        item.add_to_history(TimePoint(0), &Value::new_number(10.0));
        item.add_to_history(TimePoint(1000), &Value::new_number(20.0));
        item.add_to_history(TimePoint(4000), &Value::new_number(30.0));
        assert_eq!(item.history.len(), 2);
    }

    #[test]
    fn polling_phase_is_within_interval() {
        let mut item = Item::new(
            "poll",
            CONTROL_LINK_ID,
            ValueTypes::parse("NUMBER").unwrap(),
            Unit::Unknown,
            true,
            false,
            false,
            Duration::from_secs(60),
            SendOnTimer::default(),
            SendOnChange::default(),
            Duration::ZERO,
        );
        let now = TimePoint(100_000);
        item.init_polling(now);
        assert!(item.last_polling_time.0 <= now.0);
        assert!(item.last_polling_time.0 > now.0 - 60);
    }
}
