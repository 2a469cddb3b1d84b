//! Rational time bases and timestamp arithmetic.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Internal time unit: microseconds.
pub const TIME_BASE: i64 = 1_000_000;
pub const TIME_BASE_Q: Rational = Rational { num: 1, den: TIME_BASE as i32 };

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rounding {
    /// Toward zero
    Zero,
    /// Away from zero
    Inf,
    /// Toward -infinity
    Down,
    /// Toward +infinity
    Up,
    /// Nearest, halfway away from zero
    NearInf,
}

impl Rational {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num != 0 && self.den != 0
    }

    pub fn to_f64(&self) -> f64 {
        if self.den == 0 {
            return 0.0;
        }
        self.num as f64 / self.den as f64
    }

    pub fn invert(&self) -> Self {
        Self { num: self.den, den: self.num }
    }

    /// Reduces `num/den` to the closest fraction with both terms <= `max`.
    /// The flag is true when the reduction was exact.
    pub fn reduce(num: i64, den: i64, max: i64) -> (Self, bool) {
        let (r, exact) = reduce_i64(num, den, max);
        (
            Self {
                num: r.0.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
                den: r.1.clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            },
            exact,
        )
    }

    /// Closest rational to a floating point value.
    pub fn from_f64(value: f64, max: i32) -> Self {
        if value.is_nan() {
            return Self::new(0, 0);
        }
        if value.is_infinite() {
            return Self::new(if value < 0.0 { -1 } else { 1 }, 0);
        }
        let exponent = ((value.abs() + 1e-20).log2() as i32).max(0);
        let den = 1i64 << (61 - exponent).clamp(0, 61);
        let (r, _) = Self::reduce((value * den as f64 + 0.5).floor() as i64, den, max as i64);
        if (r.num == 0 || r.den == 0) && value != 0.0 {
            let (r2, _) = Self::reduce((value * den as f64 + 0.5).floor() as i64, den, i32::MAX as i64);
            return r2;
        }
        r
    }
}

pub(crate) fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.abs()
}

fn reduce_i64(num: i64, den: i64, max: i64) -> ((i64, i64), bool) {
    let sign = (num < 0) != (den < 0);
    let mut num = num.unsigned_abs() as i128;
    let mut den = den.unsigned_abs() as i128;
    let max = max as i128;
    let g = gcd(num as i64, den as i64) as i128;
    if g != 0 {
        num /= g;
        den /= g;
    }

    let mut a0: (i128, i128) = (0, 1);
    let mut a1: (i128, i128) = (1, 0);
    if num <= max && den <= max {
        a1 = (num, den);
        den = 0;
    }

    while den != 0 {
        let mut x = num / den;
        let next_den = num - den * x;
        let a2 = (x * a1.0 + a0.0, x * a1.1 + a0.1);

        if a2.0 > max || a2.1 > max {
            if a1.0 != 0 {
                x = (max - a0.0) / a1.0;
            }
            if a1.1 != 0 {
                x = x.min((max - a0.1) / a1.1);
            }
            if den * (2 * x * a1.1 + a0.1) > num * a1.1 {
                a1 = (x * a1.0 + a0.0, x * a1.1 + a0.1);
            }
            break;
        }

        a0 = a1;
        a1 = a2;
        num = den;
        den = next_den;
    }

    let n = if sign { -a1.0 } else { a1.0 };
    ((n as i64, a1.1 as i64), den == 0)
}

/// `a * b / c` with the requested rounding, computed without overflow.
pub fn rescale_rnd(a: i64, b: i64, c: i64, rnd: Rounding) -> i64 {
    if c <= 0 || b < 0 {
        return i64::MIN;
    }
    if a < 0 {
        let flipped = match rnd {
            Rounding::Down => Rounding::Up,
            Rounding::Up => Rounding::Down,
            other => other,
        };
        let pos = rescale_rnd(a.saturating_neg().max(-i64::MAX), b, c, flipped);
        return pos.saturating_neg();
    }

    let c128 = c as i128;
    let r: i128 = match rnd {
        Rounding::NearInf => c128 / 2,
        Rounding::Inf | Rounding::Up => c128 - 1,
        Rounding::Zero | Rounding::Down => 0,
    };
    let v = (a as i128 * b as i128 + r) / c128;
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// As [`rescale_rnd`], but `i64::MIN` and `i64::MAX` pass through unchanged.
pub fn rescale_rnd_pass_minmax(a: i64, b: i64, c: i64, rnd: Rounding) -> i64 {
    if a == i64::MIN || a == i64::MAX {
        return a;
    }
    rescale_rnd(a, b, c, rnd)
}

pub fn rescale(a: i64, b: i64, c: i64) -> i64 {
    rescale_rnd(a, b, c, Rounding::NearInf)
}

/// Converts `a` from time base `bq` to time base `cq`.
pub fn rescale_q(a: i64, bq: Rational, cq: Rational) -> i64 {
    rescale_q_rnd(a, bq, cq, Rounding::NearInf)
}

pub fn rescale_q_rnd(a: i64, bq: Rational, cq: Rational, rnd: Rounding) -> i64 {
    let b = bq.num as i64 * cq.den as i64;
    let c = cq.num as i64 * bq.den as i64;
    rescale_rnd(a, b, c, rnd)
}

/// Orders two timestamps expressed in different time bases.
pub fn compare_ts(ts_a: i64, tb_a: Rational, ts_b: i64, tb_b: Rational) -> Ordering {
    let lhs = ts_a as i128 * tb_a.num as i128 * tb_b.den as i128;
    let rhs = ts_b as i128 * tb_b.num as i128 * tb_a.den as i128;
    lhs.cmp(&rhs)
}

/// Adds `inc` units of `inc_tb` to `ts` (in `ts_tb`) so that repeated
/// additions do not accumulate rounding error.
pub fn add_stable(ts_tb: Rational, ts: i64, inc_tb: Rational, inc: i64) -> i64 {
    let m = inc_tb.num as i128 * inc as i128 * ts_tb.den as i128;
    let d = inc_tb.den as i128 * ts_tb.num as i128;
    if d == 0 {
        return ts;
    }
    if m % d == 0 {
        let step = m / d;
        if let Some(sum) = i64::try_from(step).ok().and_then(|s| ts.checked_add(s)) {
            return sum;
        }
    }
    if m < d {
        return ts;
    }
    let old = rescale_q(ts, ts_tb, inc_tb);
    let old_ts = rescale_q(old, inc_tb, ts_tb);
    rescale_q(old + inc, inc_tb, ts_tb).wrapping_add(ts - old_ts)
}

/// Signed distance `a - b` modulo `modulus` (a power of two), folded into
/// `(-modulus/2, modulus/2]`.
pub fn compare_mod(a: u64, b: u64, modulus: u64) -> i64 {
    let mut c = a.wrapping_sub(b) & modulus.wrapping_sub(1);
    if c > (modulus >> 1) {
        c = c.wrapping_sub(modulus);
    }
    c as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rescale_rounds_to_nearest() {
        assert_eq!(rescale(3, 1, 2), 2);
        assert_eq!(rescale(-3, 1, 2), -2);
        assert_eq!(rescale_rnd(3, 1, 2, Rounding::Down), 1);
        assert_eq!(rescale_rnd(-3, 1, 2, Rounding::Down), -2);
        assert_eq!(rescale_rnd(3, 1, 2, Rounding::Up), 2);
    }

    #[test]
    fn rescale_q_converts_90khz_to_microseconds() {
        let ts90 = Rational::new(1, 90_000);
        assert_eq!(rescale_q(90_000, ts90, TIME_BASE_Q), 1_000_000);
        assert_eq!(rescale_q(1_000_000, TIME_BASE_Q, ts90), 90_000);
    }

    #[test]
    fn compare_ts_across_bases() {
        let ms = Rational::new(1, 1000);
        let ts90 = Rational::new(1, 90_000);
        assert_eq!(compare_ts(1, ms, 90, ts90), Ordering::Equal);
        assert_eq!(compare_ts(2, ms, 90, ts90), Ordering::Greater);
    }

    #[test]
    fn compare_mod_wraps() {
        let m = 1u64 << 33;
        assert_eq!(compare_mod(5, m - 5, m), 10);
        assert_eq!(compare_mod(m - 5, 5, m), -10);
    }

    #[test]
    fn add_stable_does_not_drift() {
        let tb = Rational::new(1, 90_000);
        let ntsc = Rational::new(1001, 30_000);
        let mut ts = 0;
        for _ in 0..30_000 {
            ts = add_stable(tb, ts, ntsc, 1);
        }
        assert_eq!(ts, 1001 * 90_000);

        let ms = Rational::new(1, 1000);
        assert_eq!(add_stable(ms, 10, Rational::new(1, 25), 1), 50);
    }

    #[test]
    fn reduce_limits_terms() {
        let (r, exact) = Rational::reduce(30000, 1001, 60000);
        assert_eq!(r, Rational::new(30000, 1001));
        assert!(exact);

        let (r, exact) = Rational::reduce(1_000_001, 1_000_000, 1000);
        assert_eq!(r, Rational::new(1, 1));
        assert!(!exact);
    }

    #[test]
    fn from_f64_recovers_simple_fractions() {
        assert_eq!(Rational::from_f64(25.0, 1000), Rational::new(25, 1));
        assert_eq!(Rational::from_f64(0.5, 1000), Rational::new(1, 2));
    }
}
