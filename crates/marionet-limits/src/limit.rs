//! The limit family and its default-local-space application contract.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::math::{
    from_to_rotation, ortho_normalize, orthogonal, quat_approx_eq, rotate_towards,
    signed_angle_about, SQR_EPSILON,
};
use marionet_core::{warning, BoneId, TransformTree};

use crate::polygon::clamp_to_polygon;
use crate::spline::{sample_limit, SplineSample};

/// Limit variant and its parameters. Angles are degrees, matching how rig
/// authors specify joints.
#[derive(Debug, Clone)]
pub enum LimitKind {
    /// No constraint; the candidate rotation passes through unchanged.
    None,
    /// Swing cone of `limit` degrees around the axis plus a separate twist
    /// clamp of `twist_limit` degrees about it.
    Angle { limit: f32, twist_limit: f32 },
    /// Single degree of freedom about the axis. The accumulated angle is
    /// continuous: it may exceed +-360 degrees if `min`/`max` allow, and a
    /// candidate crossing the 180 boundary never flips sign. `use_limits`
    /// false keeps the 1-DOF reduction but skips the min/max clamp.
    Hinge {
        min: f32,
        max: f32,
        use_limits: bool,
        last_angle: f32,
    },
    /// Swing direction confined to the convex spherical polygon spanned by
    /// `points` (unit directions, at least 3), twist clamped separately.
    Polygonal {
        points: Vec<Vector3<f32>>,
        twist_limit: f32,
    },
    /// Swing limit as a periodic function of the swing azimuth, sampled from
    /// `samples`, twist clamped separately.
    Spline {
        samples: Vec<SplineSample>,
        twist_limit: f32,
    },
}

/// A per-joint rotation limit operating in the joint's default local
/// rotation space.
#[derive(Debug, Clone)]
pub struct RotationLimit {
    /// Main rotation axis of the joint, in the joint's default local space.
    pub axis: Vector3<f32>,
    pub kind: LimitKind,
    default_local_rotation: UnitQuaternion<f32>,
    initiated: bool,
}

impl RotationLimit {
    pub fn new(axis: Vector3<f32>, kind: LimitKind) -> Self {
        Self {
            axis,
            kind,
            default_local_rotation: UnitQuaternion::identity(),
            initiated: false,
        }
    }

    /// Unconstrained limit; useful as a placeholder that keeps the joint in
    /// the constraint system without restricting it.
    pub fn free(axis: Vector3<f32>) -> Self {
        Self::new(axis, LimitKind::None)
    }

    /// Swing/twist limit in degrees.
    pub fn angle(axis: Vector3<f32>, limit: f32, twist_limit: f32) -> Self {
        Self::new(axis, LimitKind::Angle { limit, twist_limit })
    }

    /// Hinge limit in degrees.
    pub fn hinge(axis: Vector3<f32>, min: f32, max: f32) -> Self {
        Self::new(
            axis,
            LimitKind::Hinge {
                min,
                max,
                use_limits: true,
                last_angle: 0.0,
            },
        )
    }

    /// Reach-cone limit from unit directions in default local space.
    pub fn polygonal(axis: Vector3<f32>, points: Vec<Vector3<f32>>, twist_limit: f32) -> Self {
        Self::new(axis, LimitKind::Polygonal { points, twist_limit })
    }

    /// Spline limit from `(azimuth, limit)` samples in degrees.
    pub fn spline(axis: Vector3<f32>, samples: Vec<SplineSample>, twist_limit: f32) -> Self {
        Self::new(axis, LimitKind::Spline { samples, twist_limit })
    }

    /// Capture the joint's default local rotation as the reference frame.
    ///
    /// Must be called once, from the rest pose, before `apply`; limits are
    /// expressed relative to this frame so they are independent of the world
    /// orientation convention.
    pub fn initiate(&mut self, tree: &TransformTree, bone: BoneId) {
        self.set_default_local_rotation(tree.local_rotation(bone));
        if let LimitKind::Polygonal { points, .. } = &mut self.kind {
            for p in points.iter_mut() {
                if p.norm_squared() > SQR_EPSILON {
                    *p = p.normalize();
                }
            }
        }
        if let LimitKind::Spline { samples, .. } = &mut self.kind {
            samples.sort_by(|a, b| a.azimuth.total_cmp(&b.azimuth));
        }
    }

    /// Set the reference frame directly (used by solvers that own the rest
    /// pose capture).
    pub fn set_default_local_rotation(&mut self, rotation: UnitQuaternion<f32>) {
        self.default_local_rotation = rotation;
        self.initiated = true;
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated
    }

    pub fn default_local_rotation(&self) -> UnitQuaternion<f32> {
        self.default_local_rotation
    }

    /// Clamp a candidate rotation expressed relative to the default local
    /// rotation.
    pub fn limit_rotation(&mut self, rotation: UnitQuaternion<f32>) -> UnitQuaternion<f32> {
        let axis = self.axis;
        match &mut self.kind {
            LimitKind::None => rotation,
            LimitKind::Angle { limit, twist_limit } => {
                let swung = limit_swing(rotation, axis, limit.to_radians());
                limit_twist(swung, axis, orthogonal(axis), twist_limit.to_radians())
            }
            LimitKind::Hinge {
                min,
                max,
                use_limits,
                last_angle,
            } => limit_hinge(rotation, axis, *min, *max, *use_limits, last_angle),
            LimitKind::Polygonal { points, twist_limit } => {
                let clamped = clamp_to_polygon(rotation, axis, points);
                limit_twist(clamped, axis, orthogonal(axis), twist_limit.to_radians())
            }
            LimitKind::Spline { samples, twist_limit } => {
                let limit = sample_limit(rotation, axis, samples);
                let swung = limit_swing(rotation, axis, limit.to_radians());
                limit_twist(swung, axis, orthogonal(axis), twist_limit.to_radians())
            }
        }
    }

    /// Read the bone's current local rotation, clamp it and write back if it
    /// changed. Returns whether a change occurred so callers know to
    /// re-propagate positions along the chain.
    pub fn apply(&mut self, tree: &mut TransformTree, bone: BoneId) -> bool {
        if !self.initiated {
            warning::log("Rotation limit applied before initiation, skipping.");
            return false;
        }

        let local = tree.local_rotation(bone);
        let relative = self.default_local_rotation.inverse() * local;
        let limited = self.limit_rotation(relative);
        if quat_approx_eq(limited, relative, 1.0e-6) {
            return false;
        }

        tree.set_local_rotation(bone, self.default_local_rotation * limited);
        true
    }
}

/// Clamp the swing of `axis` under `rotation` to `limit` radians.
pub(crate) fn limit_swing(
    rotation: UnitQuaternion<f32>,
    axis: Vector3<f32>,
    limit: f32,
) -> UnitQuaternion<f32> {
    if axis.norm_squared() < SQR_EPSILON || limit >= std::f32::consts::PI {
        return rotation;
    }
    if quat_approx_eq(rotation, UnitQuaternion::identity(), 1.0e-7) {
        return rotation;
    }

    let swung = rotation * axis;
    let swing = from_to_rotation(axis, swung);
    let limited_swing = rotate_towards(UnitQuaternion::identity(), swing, limit);
    let to_limits = from_to_rotation(swung, limited_swing * axis);
    to_limits * rotation
}

/// Clamp the twist component of `rotation` about `axis` to `twist_limit`
/// radians, measured against `ortho_axis`.
pub(crate) fn limit_twist(
    rotation: UnitQuaternion<f32>,
    axis: Vector3<f32>,
    ortho_axis: Vector3<f32>,
    twist_limit: f32,
) -> UnitQuaternion<f32> {
    let twist_limit = twist_limit.clamp(0.0, std::f32::consts::PI);
    if twist_limit >= std::f32::consts::PI {
        return rotation;
    }

    let mut normal = rotation * axis;
    let mut ortho = ortho_axis;
    ortho_normalize(&mut normal, &mut ortho);

    let mut rotated_ortho = rotation * ortho_axis;
    let mut normal2 = normal;
    ortho_normalize(&mut normal2, &mut rotated_ortho);

    // Zero-twist reference rotation
    let zero_twist = from_to_rotation(rotated_ortho, ortho) * rotation;
    if twist_limit <= 0.0 {
        return zero_twist;
    }
    rotate_towards(zero_twist, rotation, twist_limit)
}

/// Reduce `rotation` to a pure rotation about `axis` and clamp the
/// accumulated, continuous angle.
fn limit_hinge(
    rotation: UnitQuaternion<f32>,
    axis: Vector3<f32>,
    min: f32,
    max: f32,
    use_limits: bool,
    last_angle: &mut f32,
) -> UnitQuaternion<f32> {
    if axis.norm_squared() < SQR_EPSILON {
        return rotation;
    }
    let axis_n = nalgebra::Unit::new_normalize(axis);

    // Project onto the hinge axis (1-DOF reduction)
    let free = from_to_rotation(rotation * axis, axis) * rotation;
    if !use_limits {
        return free;
    }
    if min == 0.0 && max == 0.0 {
        *last_angle = 0.0;
        return UnitQuaternion::identity();
    }

    // Additive tracking: accumulate the wrapped delta from the last applied
    // angle so the hinge can exceed +-360 degrees without flipping.
    let free_angle = signed_angle_about(free, axis).to_degrees();
    let delta = wrap_degrees(free_angle - wrap_degrees(*last_angle));
    *last_angle = (*last_angle + delta).clamp(min, max);

    UnitQuaternion::from_axis_angle(&axis_n, last_angle.to_radians())
}

fn wrap_degrees(angle: f32) -> f32 {
    let mut a = angle % 360.0;
    if a > 180.0 {
        a -= 360.0;
    } else if a < -180.0 {
        a += 360.0;
    }
    a
}
