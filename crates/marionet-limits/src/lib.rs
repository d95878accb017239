//! Per-joint rotation limits.
//!
//! Every limit is a pure transform on a candidate local rotation: given the
//! joint's rotation relative to its *default local rotation* (captured at
//! [`RotationLimit::initiate`] time), [`RotationLimit::limit_rotation`]
//! returns the clamped rotation. [`RotationLimit::apply`] wires that contract
//! to a bone in a [`TransformTree`], writing back only when the clamp changed
//! something so callers know whether to re-propagate positions.
//!
//! Variants are a tagged enum dispatched through one function rather than a
//! class family:
//!
//! - [`LimitKind::None`]: unconstrained pass-through.
//! - [`LimitKind::Angle`]: independent swing cone and twist clamp.
//! - [`LimitKind::Hinge`]: 1-DOF about the limit axis with continuous,
//!   additive angle accumulation (no wrapping, no sign flips).
//! - [`LimitKind::Polygonal`]: swing confined to a spherical polygon
//!   (reach cone) with nearest-edge projection outside it.
//! - [`LimitKind::Spline`]: swing limit sampled from a periodic curve over
//!   the swing azimuth; smoother but less exact than the polygon.

pub mod limit;
pub mod polygon;
pub mod spline;

pub use limit::{LimitKind, RotationLimit};
pub use spline::SplineSample;
