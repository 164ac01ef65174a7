//! Unit-tagged exact time values.

use crate::rational::Rational;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Sub};

/// Unit a [`Time`] amount is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "lowercase"))]
pub enum TimeUnit {
    Nanoseconds,
    Microseconds,
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    /// Number of this unit in one second.
    pub fn per_second(self) -> i64 {
        match self {
            Self::Nanoseconds => 1_000_000_000,
            Self::Microseconds => 1_000_000,
            Self::Milliseconds => 1_000,
            Self::Seconds => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Nanoseconds => "ns",
            Self::Microseconds => "us",
            Self::Milliseconds => "ms",
            Self::Seconds => "s",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exact amount of time in a given unit.
///
/// Two times are equal when they denote the same instant, whatever their
/// units: `1000 ms == 1 s`.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Time {
    amount: Rational,
    unit: TimeUnit,
}

impl Time {
    pub const ZERO: Time = Time {
        amount: Rational::ZERO,
        unit: TimeUnit::Seconds,
    };

    pub fn new(amount: impl Into<Rational>, unit: TimeUnit) -> Self {
        Self {
            amount: amount.into(),
            unit,
        }
    }

    pub fn from_seconds(seconds: Rational) -> Self {
        Self::new(seconds, TimeUnit::Seconds)
    }

    /// A tick count in a timescale given as seconds per tick.
    pub fn from_ticks(ticks: i64, timescale: Rational) -> Self {
        Self::from_seconds(Rational::from_integer(ticks) * timescale)
    }

    pub fn amount(&self) -> Rational {
        self.amount
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// The same time expressed in `unit`, without loss.
    pub fn get(&self, unit: TimeUnit) -> Rational {
        if unit == self.unit {
            return self.amount;
        }
        self.amount * Rational::new(unit.per_second(), self.unit.per_second())
    }

    pub fn seconds(&self) -> Rational {
        self.get(TimeUnit::Seconds)
    }

    /// Round to the nearest tick of a timescale given as seconds per tick.
    pub fn ticks(&self, timescale: Rational) -> i64 {
        match timescale.recip() {
            Some(rate) => (self.seconds() * rate).round(),
            None => 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn max(self, other: Time) -> Time {
        if other > self {
            other
        } else {
            self
        }
    }

    fn finer_unit(a: TimeUnit, b: TimeUnit) -> TimeUnit {
        if a.per_second() >= b.per_second() {
            a
        } else {
            b
        }
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::ZERO
    }
}

impl PartialEq for Time {
    fn eq(&self, other: &Self) -> bool {
        self.seconds() == other.seconds()
    }
}

impl Eq for Time {}

impl Hash for Time {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.seconds().hash(state);
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds().cmp(&other.seconds())
    }
}

impl Add for Time {
    type Output = Time;

    fn add(self, rhs: Time) -> Time {
        let unit = Self::finer_unit(self.unit, rhs.unit);
        Time::new(self.get(unit) + rhs.get(unit), unit)
    }
}

impl Sub for Time {
    type Output = Time;

    fn sub(self, rhs: Time) -> Time {
        let unit = Self::finer_unit(self.unit, rhs.unit);
        Time::new(self.get(unit) - rhs.get(unit), unit)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit)
    }
}
