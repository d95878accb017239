//! Limb solver: the trigonometric solve plus bend-direction policy.
//!
//! A 2-segment limb's bend plane is ambiguous whenever the effector rotation
//! alone does not disambiguate it. [`BendModifier`] selects the strategy
//! that resolves it; the strategies are alternatives behind an enum, not
//! subclasses.

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use marionet_core::math::{slerp, SQR_EPSILON};
use marionet_core::{warning, BoneId, TransformTree};

use crate::trigonometric::TrigonometricSolver;

/// Which limb of a biped this is; used by the natural-arm heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Bend-plane resolution policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BendModifier {
    /// Maintain the bend plane of the animated pose.
    Animation,
    /// Rotate the bend plane with the target rotation.
    Target,
    /// Rotate the bend plane with the parent bone of the limb.
    Parent,
    /// Biomechanical "natural arm" pole: the elbow points down for low
    /// targets and swings back as the target rises.
    Arm,
}

/// Three-joint limb solver with bend modifiers and rotation maintenance.
#[derive(Debug)]
pub struct LimbSolver {
    pub trig: TrigonometricSolver,
    pub side: Side,
    pub bend_modifier: BendModifier,
    /// Blend between the animated bend plane and the modifier's plane.
    pub bend_modifier_weight: f32,
    /// Preserves the last bone's animated world rotation after solving.
    pub maintain_rotation_weight: f32,
    default_target_rotation: UnitQuaternion<f32>,
    parent_default_rotation: UnitQuaternion<f32>,
    default_bend_normal: Vector3<f32>,
    initiated: bool,
}

impl LimbSolver {
    pub fn new(bone1: BoneId, bone2: BoneId, bone3: BoneId, side: Side) -> Self {
        Self {
            trig: TrigonometricSolver::new(bone1, bone2, bone3),
            side,
            bend_modifier: BendModifier::Animation,
            bend_modifier_weight: 1.0,
            maintain_rotation_weight: 0.0,
            default_target_rotation: UnitQuaternion::identity(),
            parent_default_rotation: UnitQuaternion::identity(),
            default_bend_normal: Vector3::x(),
            initiated: false,
        }
    }

    pub fn is_valid(&self, tree: &TransformTree, log: bool) -> bool {
        self.trig.is_valid(tree, log)
    }

    /// Capture the rest pose. Must be called before `update`.
    pub fn initiate(&mut self, tree: &TransformTree) {
        self.trig.initiate(tree);
        self.default_target_rotation = tree.rotation(self.trig.bone3.bone);
        self.default_bend_normal = self.trig.bend_normal;
        if let Some(parent) = tree.parent(self.trig.bone1.bone) {
            self.parent_default_rotation = tree.rotation(parent);
        }
        self.initiated = true;
    }

    /// Run one solve: resolve the bend plane, then the trigonometric solve,
    /// then optionally restore the end bone's animated rotation.
    pub fn update(&mut self, tree: &mut TransformTree) {
        if !self.initiated {
            warning::log("Trying to update an uninitiated limb solver.");
            return;
        }
        self.bend_modifier_weight = self.bend_modifier_weight.clamp(0.0, 1.0);
        self.maintain_rotation_weight = self.maintain_rotation_weight.clamp(0.0, 1.0);

        let p1 = tree.position(self.trig.bone1.bone);
        let p2 = tree.position(self.trig.bone2.bone);
        let p3 = tree.position(self.trig.bone3.bone);
        let animated_normal = (p2 - p1).cross(&(p3 - p2));
        let animated_rotation = tree.rotation(self.trig.bone3.bone);

        let modified = self.modified_normal(tree, animated_normal, p1);
        let normal = if self.bend_modifier_weight >= 1.0 {
            modified
        } else {
            animated_normal.lerp(&modified, self.bend_modifier_weight)
        };
        if normal.norm_squared() > SQR_EPSILON {
            self.trig.bend_normal = normal;
        }

        self.trig.update(tree);

        if self.maintain_rotation_weight > 0.0 {
            let solved = tree.rotation(self.trig.bone3.bone);
            tree.set_rotation(
                self.trig.bone3.bone,
                slerp(solved, animated_rotation, self.maintain_rotation_weight),
            );
        }
    }

    fn modified_normal(
        &self,
        tree: &TransformTree,
        animated_normal: Vector3<f32>,
        p1: Vector3<f32>,
    ) -> Vector3<f32> {
        match self.bend_modifier {
            BendModifier::Animation => animated_normal,
            BendModifier::Target => {
                // Rotate the rest plane by the delta between the target
                // rotation and the captured rest rotation
                let delta = self.trig.ik_rotation * self.default_target_rotation.inverse();
                delta * self.default_bend_normal
            }
            BendModifier::Parent => match tree.parent(self.trig.bone1.bone) {
                Some(parent) => {
                    let delta = tree.rotation(parent) * self.parent_default_rotation.inverse();
                    delta * self.default_bend_normal
                }
                None => animated_normal,
            },
            BendModifier::Arm => self.arm_normal(tree, animated_normal, p1),
        }
    }

    /// Natural arm pole: in the space of the limb's parent, blend the elbow
    /// pole from straight down (low targets) toward backward (high targets)
    /// and derive the bend normal from target direction x pole.
    fn arm_normal(
        &self,
        tree: &TransformTree,
        animated_normal: Vector3<f32>,
        p1: Vector3<f32>,
    ) -> Vector3<f32> {
        let parent_rotation = match tree.parent(self.trig.bone1.bone) {
            Some(parent) => tree.rotation(parent),
            None => UnitQuaternion::identity(),
        };

        let to_target = parent_rotation.inverse() * (self.trig.ik_position - p1);
        if to_target.norm_squared() < SQR_EPSILON {
            return animated_normal;
        }
        let direction = to_target.normalize();

        // 0 at chest height and below, 1 overhead
        let raise = (direction.y).clamp(0.0, 1.0);
        let pole = Vector3::new(0.0, -1.0, 0.0).lerp(&Vector3::new(0.0, 0.0, -1.0), raise);

        // normal = pole x direction puts the elbow on the pole side
        let mut normal = pole.cross(&direction);
        if let Side::Right = self.side {
            normal = -normal;
        }
        if normal.norm_squared() < SQR_EPSILON {
            return animated_normal;
        }
        parent_rotation * normal
    }
}
