//! Shared iteration harness for the heuristic chain solvers.
//!
//! CCD and FABRIK own a [`HeuristicChain`] for everything they have in
//! common: the bone list, the target and its weight, tolerance-based early
//! exit, the max-iteration cap, the rotation-limit toggle and the
//! singularity-offset perturbation that keeps a collinear target from
//! producing an indeterminate bend direction.

use nalgebra::Vector3;

use marionet_core::math::SQR_EPSILON;
use marionet_core::{warning, BoneId, TransformTree, ValidationError};
use marionet_limits::LimitKind;

use crate::bone::Bone;

/// Shared state of a single-chain heuristic solver.
#[derive(Debug, Clone)]
pub struct HeuristicChain {
    /// The chain, base first, end-effector last.
    pub bones: Vec<Bone>,
    /// World-space position target.
    pub ik_position: Vector3<f32>,
    /// Solver weight in `[0, 1]`; 0 leaves the pose untouched.
    pub ik_position_weight: f32,
    /// Minimum end-effector movement between iterations before stopping
    /// early. 0 disables the early exit.
    pub tolerance: f32,
    pub max_iterations: usize,
    /// Whether rotation limits are consulted each iteration. Cheaper off,
    /// more accurate on since limits change reachability.
    pub use_rotation_limits: bool,
    pub(crate) root: BoneId,
    pub(crate) chain_length: f32,
    pub(crate) last_local_direction: Vector3<f32>,
    pub(crate) initiated: bool,
}

impl HeuristicChain {
    pub fn new(bones: impl IntoIterator<Item = BoneId>) -> Self {
        Self {
            bones: bones.into_iter().map(Bone::new).collect(),
            ik_position: Vector3::zeros(),
            ik_position_weight: 1.0,
            tolerance: 0.0,
            max_iterations: 4,
            use_rotation_limits: true,
            root: BoneId(0),
            chain_length: 0.0,
            last_local_direction: Vector3::zeros(),
            initiated: false,
        }
    }

    /// Replace the chain. The solver must be re-initiated afterwards; bone
    /// hierarchy changes are never observed implicitly.
    pub fn set_chain(&mut self, bones: impl IntoIterator<Item = BoneId>) {
        self.bones = bones.into_iter().map(Bone::new).collect();
        self.initiated = false;
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated
    }

    /// Total rest length of the chain.
    pub fn chain_length(&self) -> f32 {
        self.chain_length
    }

    /// Structural pre-flight check. Never panics.
    pub(crate) fn validate(
        &self,
        tree: &TransformTree,
        allow_zero_length: bool,
    ) -> Result<(), ValidationError> {
        if self.bones.is_empty() {
            return Err(ValidationError::NoBones);
        }
        if self.bones.len() < 2 {
            return Err(ValidationError::ChainTooShort {
                min: 2,
                got: self.bones.len(),
            });
        }
        for bone in &self.bones {
            if !tree.contains(bone.bone) {
                return Err(ValidationError::NodeOutsideSolver);
            }
        }
        for i in 0..self.bones.len() {
            for j in (i + 1)..self.bones.len() {
                if self.bones[i].bone == self.bones[j].bone {
                    return Err(ValidationError::DuplicateBone);
                }
            }
        }
        if !allow_zero_length {
            for i in 0..self.bones.len() - 1 {
                let a = tree.position(self.bones[i].bone);
                let b = tree.position(self.bones[i + 1].bone);
                if (a - b).norm_squared() < SQR_EPSILON {
                    return Err(ValidationError::ZeroLengthBone { index: i });
                }
            }
        }
        Ok(())
    }

    pub(crate) fn log_invalid(&self, err: ValidationError) {
        warning::log(&format!("Chain solver is not valid: {err}"));
    }

    /// Capture rest lengths, swing axes and default local positions, and
    /// initiate rotation limits against the current (rest) pose.
    pub(crate) fn initiate_bones(&mut self, tree: &TransformTree, root: BoneId) {
        self.root = root;
        self.chain_length = 0.0;
        let count = self.bones.len();
        let first_position = tree.position(self.bones[0].bone);
        let last_position = tree.position(self.bones[count - 1].bone);

        for i in 0..count {
            let id = self.bones[i].bone;
            let position = tree.position(id);
            let rotation = tree.rotation(id);

            if i < count - 1 {
                let to_next = tree.position(self.bones[i + 1].bone) - position;
                self.bones[i].length = to_next.norm();
                self.chain_length += self.bones[i].length;
                self.bones[i].axis = rotation.inverse() * to_next;
            } else {
                self.bones[i].length = 0.0;
                self.bones[i].axis = rotation.inverse() * (last_position - first_position);
            }

            self.bones[i].solver_position = position;
            self.bones[i].default_local_position = tree.local_position(id);

            if let Some(limit) = self.bones[i].rotation_limit.as_mut() {
                limit.initiate(tree, id);
            }
        }
        self.initiated = true;
    }

    /// End-effector direction in root space, from explicit end positions.
    pub(crate) fn local_direction_between(
        &self,
        tree: &TransformTree,
        first: Vector3<f32>,
        last: Vector3<f32>,
    ) -> Vector3<f32> {
        tree.rotation(self.root).inverse() * (last - first)
    }

    /// End-effector direction in root space from the transform positions.
    pub(crate) fn local_direction(&self, tree: &TransformTree) -> Vector3<f32> {
        let first = tree.position(self.bones[0].bone);
        let last = tree.position(self.bones[self.bones.len() - 1].bone);
        self.local_direction_between(tree, first, last)
    }

    /// Squared movement of the local direction since the last iteration.
    pub(crate) fn position_offset_sq(&self, local_direction: Vector3<f32>) -> f32 {
        (local_direction - self.last_local_direction).norm_squared()
    }

    /// Deterministic perpendicular nudge applied to the target on the first
    /// iteration when the chain is fully stretched straight at it.
    ///
    /// Without this the bend direction is indeterminate and the solvers can
    /// produce NaN or stall. When the second-to-last bone carries a hinge
    /// limit the offset follows the hinge axis so the nudge is not fought by
    /// the limit.
    pub(crate) fn singularity_offset(&self, tree: &TransformTree) -> Vector3<f32> {
        if !self.singularity_detected(tree) {
            return Vector3::zeros();
        }

        let count = self.bones.len();
        let first = tree.position(self.bones[0].bone);
        let ik_direction = (self.ik_position - first).normalize();
        let mut secondary = Vector3::new(ik_direction.y, ik_direction.z, ik_direction.x);

        let clamped = &self.bones[count - 2];
        if self.use_rotation_limits {
            if let Some(limit) = &clamped.rotation_limit {
                if matches!(limit.kind, LimitKind::Hinge { .. }) {
                    secondary = tree.rotation(clamped.bone) * limit.axis;
                }
            }
        }

        ik_direction.cross(&secondary) * clamped.length * 0.5
    }

    fn singularity_detected(&self, tree: &TransformTree) -> bool {
        if !self.initiated || self.bones.len() < 2 {
            return false;
        }
        let count = self.bones.len();
        let first = tree.position(self.bones[0].bone);
        let last = tree.position(self.bones[count - 1].bone);

        let to_last = last - first;
        let to_target = self.ik_position - first;
        let to_last_distance = to_last.norm();
        let to_target_distance = to_target.norm();

        if to_last_distance < to_target_distance {
            return false;
        }
        // Only a fully stretched chain is singular
        if to_last_distance < self.chain_length - self.bones[count - 2].length * 0.1 {
            return false;
        }
        if to_last_distance == 0.0 || to_target_distance == 0.0 {
            return false;
        }

        let dot = (to_last / to_last_distance).dot(&(to_target / to_target_distance));
        dot >= 0.999
    }
}
