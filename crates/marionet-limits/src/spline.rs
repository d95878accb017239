//! Periodic swing-limit curve.
//!
//! Maps the azimuth of the swing direction around the limit axis to a
//! maximum swing angle, interpolated with a closed Catmull-Rom spline over
//! the user's samples.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use marionet_core::math::{orthogonal, SQR_EPSILON};

/// One control point of the limit curve. Both angles in degrees; `azimuth`
/// in `[0, 360)` measured around the limit axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SplineSample {
    pub azimuth: f32,
    pub limit: f32,
}

impl SplineSample {
    pub const fn new(azimuth: f32, limit: f32) -> Self {
        Self { azimuth, limit }
    }
}

/// Sample the swing limit (degrees) for the azimuth of `rotation * axis`.
///
/// Samples must be sorted by azimuth (the limit's `initiate` does this).
/// Fewer than 2 samples degrade gracefully: one sample is a constant limit,
/// none means unconstrained (180 degrees).
pub fn sample_limit(
    rotation: UnitQuaternion<f32>,
    axis: Vector3<f32>,
    samples: &[SplineSample],
) -> f32 {
    match samples.len() {
        0 => return 180.0,
        1 => return samples[0].limit,
        _ => {}
    }
    if axis.norm_squared() < SQR_EPSILON {
        return 180.0;
    }

    let axis_n = axis.normalize();
    let u = orthogonal(axis_n).normalize();
    let v = axis_n.cross(&u);

    let direction = rotation * axis_n;
    let planar = direction - axis_n * axis_n.dot(&direction);
    if planar.norm_squared() < SQR_EPSILON {
        // No swing; any limit holds
        return samples[0].limit;
    }

    let mut azimuth = planar.dot(&v).atan2(planar.dot(&u)).to_degrees();
    if azimuth < 0.0 {
        azimuth += 360.0;
    }

    evaluate(samples, azimuth)
}

/// Closed Catmull-Rom evaluation over sorted samples at `azimuth` degrees.
fn evaluate(samples: &[SplineSample], azimuth: f32) -> f32 {
    let n = samples.len();

    // Find the segment [k, k+1] containing the azimuth, wrapping around.
    let mut k = n - 1;
    for i in 0..n {
        if samples[i].azimuth > azimuth {
            k = (i + n - 1) % n;
            break;
        }
    }

    let a0 = samples[k].azimuth;
    let mut a1 = samples[(k + 1) % n].azimuth;
    let mut az = azimuth;
    if a1 <= a0 {
        // Wrapped segment
        a1 += 360.0;
        if az < a0 {
            az += 360.0;
        }
    }
    let span = a1 - a0;
    let t = if span <= f32::EPSILON { 0.0 } else { ((az - a0) / span).clamp(0.0, 1.0) };

    let p0 = samples[(k + n - 1) % n].limit;
    let p1 = samples[k].limit;
    let p2 = samples[(k + 1) % n].limit;
    let p3 = samples[(k + 2) % n].limit;

    catmull_rom(p0, p1, p2, p3, t)
}

fn catmull_rom(p0: f32, p1: f32, p2: f32, p3: f32, t: f32) -> f32 {
    let t2 = t * t;
    let t3 = t2 * t;
    0.5 * ((2.0 * p1)
        + (-p0 + p2) * t
        + (2.0 * p0 - 5.0 * p1 + 4.0 * p2 - p3) * t2
        + (-p0 + 3.0 * p1 - 3.0 * p2 + p3) * t3)
}
