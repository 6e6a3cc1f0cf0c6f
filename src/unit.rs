//! Units and the closed conversion table between units that share a type.

use std::fmt;

use crate::value::Number;

/// The dimension a [`Unit`] belongs to. Two units convert between each
/// other iff they share a non-[`UnitType::Unknown`] type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum UnitType {
    Unknown,
    Period,
    Speed,
    Temperature,
    Illuminance,
    Current,
    Energy,
    Power,
    Volume,
    Voltage,
}

impl UnitType {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitType::Unknown => "UNKNOWN",
            UnitType::Period => "PERIOD",
            UnitType::Speed => "SPEED",
            UnitType::Temperature => "TEMPERATURE",
            UnitType::Illuminance => "ILLUMINANCE",
            UnitType::Current => "CURRENT",
            UnitType::Energy => "ENERGY",
            UnitType::Power => "POWER",
            UnitType::Volume => "VOLUME",
            UnitType::Voltage => "VOLTAGE",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete unit symbol. Conversion between units of the same
/// [`UnitType`] is a closed rational/affine table (see [`Unit::to_base`]
/// and [`Unit::from_base`]); the "base" unit per type is an implementation
/// detail, not part of the public contract.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Unit {
    Unknown,
    Percent,
    Second,
    Minute,
    Hour,
    MeterPerSecond,
    KilometerPerHour,
    MilesPerHour,
    Celsius,
    Fahrenheit,
    Lux,
    Kilolux,
    Milliampere,
    Ampere,
    Watt,
    Kilowatt,
    WattHour,
    KilowattHour,
    CubicMeter,
    LiterPerMinute,
    Millivolt,
    Volt,
    Millimeter,
    GramPerCubicMeter,
    Degree,
    Euro,
}

impl Unit {
    pub fn unit_type(self) -> UnitType {
        use Unit::*;
        match self {
            Unknown | Percent | LiterPerMinute | Millimeter | GramPerCubicMeter | Degree | Euro => {
                UnitType::Unknown
            }
            Second | Minute | Hour => UnitType::Period,
            MeterPerSecond | KilometerPerHour | MilesPerHour => UnitType::Speed,
            Celsius | Fahrenheit => UnitType::Temperature,
            Lux | Kilolux => UnitType::Illuminance,
            Milliampere | Ampere => UnitType::Current,
            Watt | Kilowatt => UnitType::Power,
            WattHour | KilowattHour => UnitType::Energy,
            CubicMeter => UnitType::Volume,
            Millivolt | Volt => UnitType::Voltage,
        }
    }

    /// Converts `n`, expressed in this unit's type's base unit, into `self`.
    fn from_base(self, base: Number) -> Number {
        use Unit::*;
        match self {
            Second | MeterPerSecond | Celsius | Lux | Milliampere | Watt | WattHour | CubicMeter
            | Millivolt | Unknown | Percent | LiterPerMinute | Millimeter | GramPerCubicMeter | Degree
            | Euro => base,
            Minute => base / 60.0,
            Hour => base / 3600.0,
            KilometerPerHour => base * 3.6,
            MilesPerHour => base * 2.236_936_3,
            Fahrenheit => base * 9.0 / 5.0 + 32.0,
            Kilolux => base / 1000.0,
            Ampere => base / 1000.0,
            Kilowatt => base / 1000.0,
            KilowattHour => base / 1000.0,
            Volt => base / 1000.0,
        }
    }

    /// Converts `n`, expressed in `self`, into this unit's type's base unit.
    fn to_base(self, n: Number) -> Number {
        use Unit::*;
        match self {
            Second | MeterPerSecond | Celsius | Lux | Milliampere | Watt | WattHour | CubicMeter
            | Millivolt | Unknown | Percent | LiterPerMinute | Millimeter | GramPerCubicMeter | Degree
            | Euro => n,
            Minute => n * 60.0,
            Hour => n * 3600.0,
            KilometerPerHour => n / 3.6,
            MilesPerHour => n / 2.236_936_3,
            Fahrenheit => (n - 32.0) * 5.0 / 9.0,
            Kilolux => n * 1000.0,
            Ampere => n * 1000.0,
            Kilowatt => n * 1000.0,
            KilowattHour => n * 1000.0,
            Volt => n * 1000.0,
        }
    }

    pub fn can_convert_to(self, target: Unit) -> bool {
        self == target || (self.unit_type() == target.unit_type() && self.unit_type() != UnitType::Unknown)
    }

    /// Converts `n` (in `self`) to `target`, or `None` if the two units do
    /// not share a convertible type.
    pub fn convert_to(self, n: Number, target: Unit) -> Option<Number> {
        if self == target {
            return Some(n);
        }
        if !self.can_convert_to(target) {
            return None;
        }
        Some(target.from_base(self.to_base(n)))
    }

    pub fn as_str(self) -> &'static str {
        use Unit::*;
        match self {
            Unknown => "",
            Percent => "%",
            Second => "s",
            Minute => "min",
            Hour => "h",
            MeterPerSecond => "m/s",
            KilometerPerHour => "km/h",
            MilesPerHour => "mph",
            Celsius => "°C",
            Fahrenheit => "°F",
            Lux => "lx",
            Kilolux => "klx",
            Milliampere => "mA",
            Ampere => "A",
            Watt => "W",
            Kilowatt => "kW",
            WattHour => "Wh",
            KilowattHour => "kWh",
            CubicMeter => "m³",
            LiterPerMinute => "l/min",
            Millivolt => "mV",
            Volt => "V",
            Millimeter => "mm",
            GramPerCubicMeter => "g/m³",
            Degree => "°",
            Euro => "€",
        }
    }

    pub fn format(self, n: Number) -> String {
        if matches!(self, Unit::Unknown) {
            format!("{n}")
        } else {
            format!("{n} {}", self.as_str())
        }
    }

    pub fn from_name(name: &str) -> Option<Unit> {
        use Unit::*;
        Some(match name {
            "UNKNOWN" | "" => Unknown,
            "PERCENT" => Percent,
            "SECOND" => Second,
            "MINUTE" => Minute,
            "HOUR" => Hour,
            "METER_PER_SECOND" => MeterPerSecond,
            "KILOMETER_PER_HOUR" => KilometerPerHour,
            "MILES_PER_HOUR" => MilesPerHour,
            "CELSIUS" => Celsius,
            "FAHRENHEIT" => Fahrenheit,
            "LUX" => Lux,
            "KILOLUX" => Kilolux,
            "MILLIAMPERE" => Milliampere,
            "AMPERE" => Ampere,
            "WATT" => Watt,
            "KILOWATT" => Kilowatt,
            "WATTHOUR" => WattHour,
            "KILOWATTHOUR" => KilowattHour,
            "CUBICMETER" => CubicMeter,
            "LITER_PER_MINUTE" => LiterPerMinute,
            "MILLIVOLT" => Millivolt,
            "VOLT" => Volt,
            "MILLIMETER" => Millimeter,
            "GRAM_PER_CUBICMETER" => GramPerCubicMeter,
            "DEGREE" => Degree,
            "EURO" => Euro,
            _ => return None,
        })
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: Number, b: Number) {
        assert!((a - b).abs() < 1e-9, "{a} != {b}");
    }

    #[test]
    fn celsius_fahrenheit_round_trip() {
        let f = Unit::Celsius.convert_to(100.0, Unit::Fahrenheit).unwrap();
        approx_eq(f, 212.0);
        let c = Unit::Fahrenheit.convert_to(f, Unit::Celsius).unwrap();
        approx_eq(c, 100.0);
    }

    #[test]
    fn watthour_kilowatthour() {
        let kwh = Unit::WattHour.convert_to(1500.0, Unit::KilowattHour).unwrap();
        approx_eq(kwh, 1.5);
    }

    #[test]
    fn speed_chain() {
        let kmh = Unit::MeterPerSecond.convert_to(10.0, Unit::KilometerPerHour).unwrap();
        approx_eq(kmh, 36.0);
        let mph = Unit::KilometerPerHour.convert_to(kmh, Unit::MilesPerHour).unwrap();
        let direct_mph = Unit::MeterPerSecond.convert_to(10.0, Unit::MilesPerHour).unwrap();
        approx_eq(mph, direct_mph);
    }

    #[test]
    fn lux_kilolux() {
        approx_eq(Unit::Lux.convert_to(2500.0, Unit::Kilolux).unwrap(), 2.5);
    }

    #[test]
    fn current_and_voltage() {
        approx_eq(Unit::Milliampere.convert_to(1500.0, Unit::Ampere).unwrap(), 1.5);
        approx_eq(Unit::Millivolt.convert_to(1500.0, Unit::Volt).unwrap(), 1.5);
    }

    #[test]
    fn incompatible_types_do_not_convert() {
        assert!(Unit::Watt.convert_to(1.0, Unit::Celsius).is_none());
        assert!(!Unit::Watt.can_convert_to(Unit::Celsius));
    }

    #[test]
    fn unknown_unit_is_identity_only() {
        assert_eq!(Unit::Unknown.convert_to(5.0, Unit::Unknown), Some(5.0));
        assert!(Unit::Unknown.convert_to(5.0, Unit::Percent).is_none());
    }
}
