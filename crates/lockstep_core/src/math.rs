//! Fixed-point math utilities for deterministic simulation.
//!
//! All authoritative simulation math runs on [`Fixed`], a plain `i64` scaled
//! by [`RESOLUTION`]. Floating-point operations can produce different results
//! on different CPUs, compilers and optimisation levels, so floats only ever
//! appear at the presentation boundary ([`to_fixed`] / [`from_fixed`]).
//!
//! Interpolation blend factors use the `fixed` crate's [`Blend`] type so that
//! even presentation-side blending stays bit-reproducible.

use std::fmt;
use std::ops::{Add, AddAssign, Neg, Sub, SubAssign};

use fixed::types::{I32F32, I64F64};
use serde::{Deserialize, Serialize};

/// Raw units per `1.0`.
pub const RESOLUTION: i64 = 10_000;

/// Largest absolute raw coordinate a command may carry or an entity may
/// occupy. Sums and differences of in-world points cannot overflow `i64`.
pub const WORLD_LIMIT: Fixed = Fixed(1 << 48);

/// Blend factor for presentation-only interpolation, always in `[0, 1]`.
pub type Blend = I32F32;

/// Fixed-point scalar: an integer number of `1 / RESOLUTION` units.
///
/// Serialized as the raw integer so replays and peer messages carry the
/// exact value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Fixed(i64);

impl Fixed {
    /// Zero.
    pub const ZERO: Self = Self(0);
    /// One whole unit.
    pub const ONE: Self = Self(RESOLUTION);

    /// Wrap a raw fixed-point value.
    #[must_use]
    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    /// Whole units.
    #[must_use]
    pub const fn from_int(units: i64) -> Self {
        Self(units * RESOLUTION)
    }

    /// The raw integer representation.
    #[must_use]
    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Absolute value.
    #[must_use]
    pub const fn abs(self) -> Self {
        Self(self.0.abs())
    }

    /// Addition, `None` on overflow.
    #[must_use]
    pub const fn checked_add(self, rhs: Self) -> Option<Self> {
        match self.0.checked_add(rhs.0) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Subtraction, `None` on overflow.
    #[must_use]
    pub const fn checked_sub(self, rhs: Self) -> Option<Self> {
        match self.0.checked_sub(rhs.0) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }
}

impl fmt::Display for Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        let res = RESOLUTION as u64;
        write!(f, "{sign}{}.{:04}", abs / res, abs % res)
    }
}

impl Add for Fixed {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Fixed {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl Neg for Fixed {
    type Output = Self;

    fn neg(self) -> Self::Output {
        Self(-self.0)
    }
}

impl AddAssign for Fixed {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Fixed {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// Convert a presentation value into the fixed domain (truncating).
#[must_use]
pub fn to_fixed(value: f64) -> Fixed {
    Fixed((value * RESOLUTION as f64) as i64)
}

/// Convert a fixed value into a presentation value.
#[must_use]
pub fn from_fixed(value: Fixed) -> f64 {
    value.0 as f64 / RESOLUTION as f64
}

/// Euclidean distance between two points, computed entirely in integers.
#[must_use]
pub fn distance(ax: Fixed, ay: Fixed, bx: Fixed, by: Fixed) -> Fixed {
    let dx = i128::from(ax.0) - i128::from(bx.0);
    let dy = i128::from(ay.0) - i128::from(by.0);
    let sum = dx.saturating_mul(dx).saturating_add(dy.saturating_mul(dy));
    let root = isqrt(sum.unsigned_abs());
    Fixed(i64::try_from(root).unwrap_or(i64::MAX))
}

/// Floor of the square root of `n` (Newton's method from above).
#[must_use]
pub fn isqrt(n: u128) -> u128 {
    if n < 2 {
        return n;
    }

    let shift = (128 - n.leading_zeros()).div_ceil(2);
    let mut x = 1u128 << shift;
    loop {
        let y = (x + n / x) / 2;
        if y >= x {
            return x;
        }
        x = y;
    }
}

/// Fixed-point 2D vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Vec2Fixed {
    /// X coordinate.
    pub x: Fixed,
    /// Y coordinate.
    pub y: Fixed,
}

impl Vec2Fixed {
    /// Zero vector.
    pub const ZERO: Self = Self {
        x: Fixed::ZERO,
        y: Fixed::ZERO,
    };

    /// Create a new fixed-point vector.
    #[must_use]
    pub const fn new(x: Fixed, y: Fixed) -> Self {
        Self { x, y }
    }

    /// Create a vector from raw fixed-point components.
    #[must_use]
    pub const fn from_raw(x: i64, y: i64) -> Self {
        Self {
            x: Fixed::from_raw(x),
            y: Fixed::from_raw(y),
        }
    }

    /// Whether both coordinates lie within [`WORLD_LIMIT`].
    #[must_use]
    pub const fn in_world(self) -> bool {
        self.x.0.unsigned_abs() <= WORLD_LIMIT.0.unsigned_abs()
            && self.y.0.unsigned_abs() <= WORLD_LIMIT.0.unsigned_abs()
    }

    /// Component-wise addition, `None` on overflow.
    #[must_use]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        Some(Self::new(self.x.checked_add(rhs.x)?, self.y.checked_add(rhs.y)?))
    }

    /// Component-wise subtraction, `None` on overflow.
    #[must_use]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        Some(Self::new(self.x.checked_sub(rhs.x)?, self.y.checked_sub(rhs.y)?))
    }

    /// Distance to another point.
    #[must_use]
    pub fn distance(self, other: Self) -> Fixed {
        distance(self.x, self.y, other.x, other.y)
    }

    /// Dot product in raw units, widened so it cannot overflow.
    #[must_use]
    pub fn dot_wide(self, other: Self) -> i128 {
        i128::from(self.x.raw()) * i128::from(other.x.raw())
            + i128::from(self.y.raw()) * i128::from(other.y.raw())
    }

    /// Component-wise minimum.
    #[must_use]
    pub fn min(self, other: Self) -> Self {
        Self::new(self.x.min(other.x), self.y.min(other.y))
    }

    /// Component-wise maximum.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self::new(self.x.max(other.x), self.y.max(other.y))
    }

    /// Blend from `older` (t = 0) to `newer` (t = 1).
    #[must_use]
    pub fn blend(newer: Self, older: Self, t: Blend) -> Self {
        Self::new(lerp(newer.x, older.x, t), lerp(newer.y, older.y, t))
    }
}

impl fmt::Display for Vec2Fixed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.x, self.y)
    }
}

impl Add for Vec2Fixed {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
}

impl Sub for Vec2Fixed {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

/// Blend factor for `elapsed_ms` into a turn of `turn_ms`, clamped to `[0, 1]`.
///
/// A zero-length turn is always fully blended.
#[must_use]
pub fn blend_factor(elapsed_ms: u64, turn_ms: u32) -> Blend {
    let one = Blend::from_num(1);
    if turn_ms == 0 {
        return one;
    }
    let elapsed = Blend::saturating_from_num(elapsed_ms);
    // Turns longer than `Blend::MAX` ms blend as if they were that long.
    let turn = Blend::saturating_from_num(turn_ms);
    elapsed.saturating_div(turn).clamp(Blend::ZERO, one)
}

fn lerp(newer: Fixed, older: Fixed, t: Blend) -> Fixed {
    let diff = I64F64::from_num(newer.0) - I64F64::from_num(older.0);
    let step = diff.saturating_mul(I64F64::from_num(t));
    Fixed(older.0.saturating_add(step.saturating_to_num::<i64>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_pythagorean() {
        let d = distance(
            Fixed::from_int(3),
            Fixed::ZERO,
            Fixed::ZERO,
            Fixed::from_int(4),
        );
        assert_eq!(d, Fixed::from_int(5));
    }

    #[test]
    fn test_distance_large_coordinates_do_not_overflow() {
        let far = Fixed::from_raw(i64::MAX / 4);
        let d = distance(far, far, -far, -far);
        assert!(d > far);
    }

    #[test]
    fn test_isqrt_floors() {
        assert_eq!(isqrt(0), 0);
        assert_eq!(isqrt(1), 1);
        assert_eq!(isqrt(15), 3);
        assert_eq!(isqrt(16), 4);
        assert_eq!(isqrt(17), 4);
        assert_eq!(isqrt(u128::from(u64::MAX) * u128::from(u64::MAX)), u128::from(u64::MAX));
    }

    #[test]
    fn test_boundary_conversions() {
        assert_eq!(to_fixed(1.5), Fixed::from_raw(15_000));
        assert!((from_fixed(Fixed::from_raw(-25_000)) + 2.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_display() {
        assert_eq!(Fixed::from_raw(125_423_056).to_string(), "12542.3056");
        assert_eq!(Fixed::from_raw(-5).to_string(), "-0.0005");
        assert_eq!(Vec2Fixed::from_raw(10_000, -5).to_string(), "1.0000/-0.0005");
    }

    #[test]
    fn test_blend_factor_clamps() {
        assert_eq!(blend_factor(0, 100), Blend::ZERO);
        assert_eq!(blend_factor(50, 100), Blend::from_num(0.5));
        assert_eq!(blend_factor(500, 100), Blend::from_num(1));
        assert_eq!(blend_factor(10, 0), Blend::from_num(1));
        assert_eq!(blend_factor(0, u32::MAX), Blend::ZERO);
        assert_eq!(blend_factor(u64::MAX, u32::MAX), Blend::from_num(1));
    }

    #[test]
    fn test_vec2_blend() {
        let older = Vec2Fixed::ZERO;
        let newer = Vec2Fixed::new(Fixed::from_int(10), Fixed::from_int(-20));
        let mid = Vec2Fixed::blend(newer, older, Blend::from_num(0.5));
        assert_eq!(mid, Vec2Fixed::new(Fixed::from_int(5), Fixed::from_int(-10)));
        assert_eq!(Vec2Fixed::blend(newer, older, Blend::ZERO), older);
        assert_eq!(Vec2Fixed::blend(newer, older, Blend::from_num(1)), newer);
    }

    #[test]
    fn test_checked_ops_and_world_bounds() {
        let max = Fixed::from_raw(i64::MAX);
        assert_eq!(max.checked_add(Fixed::ONE), None);
        assert_eq!(Fixed::from_raw(i64::MIN).checked_sub(Fixed::ONE), None);
        assert_eq!(Fixed::ONE.checked_sub(Fixed::ONE), Some(Fixed::ZERO));

        let edge = Vec2Fixed::new(WORLD_LIMIT, -WORLD_LIMIT);
        assert!(edge.in_world());
        assert!(!Vec2Fixed::new(WORLD_LIMIT + Fixed::from_raw(1), Fixed::ZERO).in_world());
        assert!(!Vec2Fixed::new(Fixed::ZERO, Fixed::from_raw(i64::MIN)).in_world());
        assert_eq!(Vec2Fixed::new(max, Fixed::ZERO).checked_add(edge), None);
    }
}
