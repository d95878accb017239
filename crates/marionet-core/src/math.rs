//! Rotation and direction helpers shared by every solver.
//!
//! All functions are degenerate-safe: zero-length or antiparallel inputs
//! resolve to identity rotations or deterministic fallback axes instead of
//! NaN. Angles are in radians unless a name says otherwise.

use nalgebra::{Unit, UnitQuaternion, Vector3};

/// Squared-length threshold below which a vector counts as zero.
pub const SQR_EPSILON: f32 = 1e-12;

/// A deterministic vector orthogonal to `v`.
///
/// Crosses with the world axis least aligned with `v` so the result is never
/// degenerate for a non-zero input.
pub fn orthogonal(v: Vector3<f32>) -> Vector3<f32> {
    let candidate = if v.x.abs() < v.y.abs().min(v.z.abs()) {
        Vector3::x()
    } else if v.y.abs() < v.z.abs() {
        Vector3::y()
    } else {
        Vector3::z()
    };
    let ortho = v.cross(&candidate);
    if ortho.norm_squared() < SQR_EPSILON {
        // v was zero
        return Vector3::x();
    }
    ortho
}

/// The shortest rotation taking direction `from` to direction `to`.
///
/// Identity for zero inputs; a 180 degree turn about a deterministic
/// orthogonal axis for antiparallel inputs.
pub fn from_to_rotation(from: Vector3<f32>, to: Vector3<f32>) -> UnitQuaternion<f32> {
    if from.norm_squared() < SQR_EPSILON || to.norm_squared() < SQR_EPSILON {
        return UnitQuaternion::identity();
    }
    UnitQuaternion::rotation_between(&from, &to).unwrap_or_else(|| {
        let axis = Unit::new_normalize(orthogonal(from));
        UnitQuaternion::from_axis_angle(&axis, std::f32::consts::PI)
    })
}

/// A rotation whose local Z axis points along `forward` with Y toward `up`.
///
/// Falls back to a deterministic up vector when `forward` and `up` are
/// collinear, and to identity when `forward` is zero.
pub fn look_rotation(forward: Vector3<f32>, up: Vector3<f32>) -> UnitQuaternion<f32> {
    if forward.norm_squared() < SQR_EPSILON {
        return UnitQuaternion::identity();
    }
    let up = if forward.cross(&up).norm_squared() < SQR_EPSILON {
        orthogonal(forward)
    } else {
        up
    };
    UnitQuaternion::face_towards(&forward, &up)
}

/// Antipodal-safe spherical interpolation.
pub fn slerp(
    from: UnitQuaternion<f32>,
    to: UnitQuaternion<f32>,
    t: f32,
) -> UnitQuaternion<f32> {
    from.try_slerp(&to, t, 1.0e-6).unwrap_or_else(|| from.nlerp(&to, t))
}

/// Rotate `from` toward `to` without exceeding `max_angle` radians.
pub fn rotate_towards(
    from: UnitQuaternion<f32>,
    to: UnitQuaternion<f32>,
    max_angle: f32,
) -> UnitQuaternion<f32> {
    let angle = from.angle_to(&to);
    if angle <= max_angle || angle < 1.0e-7 {
        return to;
    }
    slerp(from, to, (max_angle / angle).clamp(0.0, 1.0))
}

/// The rotation from `from` to `to` re-expressed around a fixed `axis`.
///
/// Takes the free from-to rotation's angle, flips its sign if the free axis
/// opposes `axis`, and applies that angle about `axis`.
pub fn from_to_around_axis(
    from: Vector3<f32>,
    to: Vector3<f32>,
    axis: Vector3<f32>,
) -> UnitQuaternion<f32> {
    if axis.norm_squared() < SQR_EPSILON {
        return UnitQuaternion::identity();
    }
    let free = from_to_rotation(from, to);
    let Some(free_axis) = free.axis() else {
        return UnitQuaternion::identity();
    };
    let mut angle = free.angle();
    if free_axis.dot(&axis) < 0.0 {
        angle = -angle;
    }
    UnitQuaternion::from_axis_angle(&Unit::new_normalize(axis), angle)
}

/// Gram-Schmidt orthonormalization of `tangent` against `normal`.
///
/// Both vectors come out unit length; a tangent parallel to the normal is
/// replaced by a deterministic orthogonal direction.
pub fn ortho_normalize(normal: &mut Vector3<f32>, tangent: &mut Vector3<f32>) {
    if normal.norm_squared() < SQR_EPSILON {
        *normal = Vector3::z();
    }
    *normal = normal.normalize();
    *tangent -= *normal * normal.dot(tangent);
    if tangent.norm_squared() < SQR_EPSILON {
        *tangent = orthogonal(*normal);
    }
    *tangent = tangent.normalize();
}

/// Split `rotation` into swing and twist about `twist_axis`.
///
/// Returns `(swing, twist)` with `rotation == swing * twist`; twist is the
/// component about the axis, swing tilts the axis itself.
pub fn swing_twist(
    rotation: UnitQuaternion<f32>,
    twist_axis: Vector3<f32>,
) -> (UnitQuaternion<f32>, UnitQuaternion<f32>) {
    if twist_axis.norm_squared() < SQR_EPSILON {
        return (rotation, UnitQuaternion::identity());
    }
    let axis = twist_axis.normalize();
    let projected = axis * rotation.vector().dot(&axis);
    let twist = nalgebra::Quaternion::new(
        rotation.scalar(),
        projected.x,
        projected.y,
        projected.z,
    );
    if twist.norm_squared() < SQR_EPSILON {
        // 180 degree swing orthogonal to the axis
        return (rotation, UnitQuaternion::identity());
    }
    let twist = UnitQuaternion::from_quaternion(twist);
    (rotation * twist.inverse(), twist)
}

/// The signed rotation angle of `rotation` about `axis`, in radians.
///
/// Assumes `rotation` is (close to) a pure rotation about `axis`; wrapped to
/// `[-pi, pi]`.
pub fn signed_angle_about(rotation: UnitQuaternion<f32>, axis: Vector3<f32>) -> f32 {
    if axis.norm_squared() < SQR_EPSILON {
        return 0.0;
    }
    let axis = axis.normalize();
    2.0 * rotation.vector().dot(&axis).atan2(rotation.scalar())
}

/// Spherical interpolation between two directions, preserving magnitude lerp.
pub fn direction_slerp(from: Vector3<f32>, to: Vector3<f32>, t: f32) -> Vector3<f32> {
    let t = t.clamp(0.0, 1.0);
    let rotation = from_to_rotation(from, to);
    let partial = slerp(UnitQuaternion::identity(), rotation, t);
    let magnitude = from.norm() * (1.0 - t) + to.norm() * t;
    let direction = partial * from;
    if direction.norm_squared() < SQR_EPSILON {
        return to * t;
    }
    direction.normalize() * magnitude
}

/// Clamp `direction` into a cone around `normal_direction`.
///
/// `clamp_weight` 0 leaves the direction free, 1 snaps it onto the normal;
/// between the two the allowed deviation narrows linearly, smoothed by
/// `smoothing` sine passes. Returns the clamped direction and whether a
/// change occurred.
pub fn clamp_direction(
    direction: Vector3<f32>,
    normal_direction: Vector3<f32>,
    clamp_weight: f32,
    smoothing: u32,
) -> (Vector3<f32>, bool) {
    if clamp_weight <= 0.0 {
        return (direction, false);
    }
    if clamp_weight >= 1.0 {
        return (normal_direction, true);
    }

    let angle = direction.angle(&normal_direction);
    let dot = 1.0 - angle / std::f32::consts::PI;
    if dot > clamp_weight {
        return (direction, false);
    }

    let target_clamp_mlp = (1.0 - (clamp_weight - dot) / (1.0 - dot)).clamp(0.0, 1.0);
    let mut clamp_mlp = (dot / clamp_weight).clamp(0.0, 1.0);
    for _ in 0..smoothing {
        clamp_mlp = (clamp_mlp * std::f32::consts::FRAC_PI_2).sin();
    }

    (
        direction_slerp(normal_direction, direction, clamp_mlp * target_clamp_mlp),
        true,
    )
}

/// Approximate quaternion equality, sign-insensitive.
pub fn quat_approx_eq(a: UnitQuaternion<f32>, b: UnitQuaternion<f32>, epsilon: f32) -> bool {
    let direct = (a.coords - b.coords).norm_squared();
    let flipped = (a.coords + b.coords).norm_squared();
    direct.min(flipped) < epsilon * epsilon
}
