use std::{
    fmt::{Display, Formatter},
    ops::{Add, Sub},
};

/// Rational media timestamp: `value / timescale` seconds.
///
/// A timescale of zero or less marks the time as not numeric (unknown).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MediaTime {
    pub value: i64,
    pub timescale: i32,
}

impl MediaTime {
    pub const ZERO: MediaTime = MediaTime {
        value: 0,
        timescale: 1,
    };

    pub const INVALID: MediaTime = MediaTime {
        value: 0,
        timescale: 0,
    };

    pub fn new(value: i64, timescale: i32) -> Self {
        Self { value, timescale }
    }

    /// Build from a timestamp expressed in a `num/den` time base (e.g. an FFmpeg stream time base).
    pub fn from_time_base(ts: i64, num: i32, den: i32) -> Self {
        if den <= 0 {
            return Self::INVALID;
        }
        Self::new(ts.saturating_mul(num as i64), den)
    }

    pub fn is_numeric(&self) -> bool {
        self.timescale > 0
    }

    pub fn seconds(&self) -> f64 {
        if !self.is_numeric() {
            return f64::NAN;
        }
        self.value as f64 / self.timescale as f64
    }

    /// Convert to another timescale, rounding toward zero.
    pub fn rescale(&self, timescale: i32) -> Self {
        if !self.is_numeric() || timescale <= 0 {
            return Self::INVALID;
        }
        if timescale == self.timescale {
            return *self;
        }
        let value = self.value as i128 * timescale as i128 / self.timescale as i128;
        Self::new(clamp_i64(value), timescale)
    }

    fn combine(self, rhs: Self, op: fn(i128, i128) -> i128) -> Self {
        if !self.is_numeric() || !rhs.is_numeric() {
            return Self::INVALID;
        }
        if self.timescale == rhs.timescale {
            return Self::new(
                clamp_i64(op(self.value as i128, rhs.value as i128)),
                self.timescale,
            );
        }
        let a = self.timescale as i128;
        let b = rhs.timescale as i128;
        let lcm = a / gcd(a, b) * b;
        match i32::try_from(lcm) {
            Ok(timescale) => Self::new(
                clamp_i64(op(self.value as i128 * (lcm / a), rhs.value as i128 * (lcm / b))),
                timescale,
            ),
            Err(_) => {
                // lcm overflows i32, fall back to the finer of the two timescales
                let timescale = self.timescale.max(rhs.timescale);
                let lhs = self.rescale(timescale).value as i128;
                let rhs = rhs.rescale(timescale).value as i128;
                Self::new(clamp_i64(op(lhs, rhs)), timescale)
            }
        }
    }
}

impl Default for MediaTime {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Add for MediaTime {
    type Output = MediaTime;

    fn add(self, rhs: Self) -> Self::Output {
        self.combine(rhs, |a, b| a + b)
    }
}

impl Sub for MediaTime {
    type Output = MediaTime;

    fn sub(self, rhs: Self) -> Self::Output {
        self.combine(rhs, |a, b| a - b)
    }
}

impl Display for MediaTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_numeric() {
            write!(f, "{}/{} ({:.3}s)", self.value, self.timescale, self.seconds())
        } else {
            write!(f, "invalid")
        }
    }
}

fn gcd(mut a: i128, mut b: i128) -> i128 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a.abs().max(1)
}

fn clamp_i64(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimeRange {
    pub start: MediaTime,
    pub duration: MediaTime,
}

impl TimeRange {
    pub fn new(start: MediaTime, duration: MediaTime) -> Self {
        Self { start, duration }
    }

    /// Fraction (0.0 ..= 1.0) of the range covered once the sample at `pts` has been written.
    ///
    /// A non-numeric `sample_duration` is ignored; a range without a positive duration counts as done.
    pub fn progress_of(&self, pts: MediaTime, sample_duration: Option<MediaTime>) -> f64 {
        let total = self.duration.seconds();
        if total.is_nan() || total <= 0.0 {
            return 1.0;
        }
        let mut progress_time = pts - self.start;
        if let Some(d) = sample_duration.filter(MediaTime::is_numeric) {
            progress_time = progress_time + d;
        }
        let fraction = progress_time.seconds() / total;
        if fraction.is_nan() {
            return 0.0;
        }
        fraction.clamp(0.0, 1.0)
    }
}
