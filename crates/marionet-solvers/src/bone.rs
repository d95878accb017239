//! A single joint in a heuristic solver chain.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::math::{from_to_rotation, slerp};
use marionet_core::{BoneId, TransformTree};
use marionet_limits::RotationLimit;

/// One bone of a chain: a transform reference plus the cached rest data the
/// solvers need between frames.
#[derive(Debug, Clone)]
pub struct Bone {
    /// The joint transform this bone drives.
    pub bone: BoneId,
    /// Blend factor in `[0, 1]`; CCD scales its per-bone rotation by it.
    pub weight: f32,
    /// Distance to the next bone, 0 for the last bone of a chain.
    pub length: f32,
    /// Local axis pointing at the next bone, captured at initiation.
    pub axis: Vector3<f32>,
    /// Scratch world position used while iterating.
    pub solver_position: Vector3<f32>,
    /// Rest local position, used to re-seat bones after position passes.
    pub default_local_position: Vector3<f32>,
    pub rotation_limit: Option<RotationLimit>,
}

impl Bone {
    pub fn new(bone: BoneId) -> Self {
        Self {
            bone,
            weight: 1.0,
            length: 0.0,
            axis: -Vector3::x(),
            solver_position: Vector3::zeros(),
            default_local_position: Vector3::zeros(),
            rotation_limit: None,
        }
    }

    pub fn with_limit(bone: BoneId, limit: RotationLimit) -> Self {
        let mut b = Self::new(bone);
        b.rotation_limit = Some(limit);
        b
    }

    /// Rotate the bone so its captured axis points at `target`.
    pub fn swing(&self, tree: &mut TransformTree, target: Vector3<f32>, weight: f32) {
        swing_bone(tree, self.bone, self.axis, target, weight);
    }
}

/// Rotate `bone` so `axis` (local space) points at the world-space `target`.
pub fn swing_bone(
    tree: &mut TransformTree,
    bone: BoneId,
    axis: Vector3<f32>,
    target: Vector3<f32>,
    weight: f32,
) {
    if weight <= 0.0 {
        return;
    }
    let position = tree.position(bone);
    let rotation = tree.rotation(bone);
    let r = from_to_rotation(rotation * axis, target - position);
    if weight >= 1.0 {
        tree.set_rotation(bone, r * rotation);
    } else {
        tree.set_rotation(bone, slerp(UnitQuaternion::identity(), r, weight) * rotation);
    }
}
