//! Cyclic Coordinate Descent.
//!
//! Rotates bones one at a time from the one nearest the end-effector back to
//! the base, each time aligning the (bone, end-effector) direction with the
//! (bone, target) direction. Bones only ever rotate, so bone lengths are
//! invariant by construction.

use nalgebra::Vector3;

use marionet_core::math::{from_to_rotation, slerp, SQR_EPSILON};
use marionet_core::{warning, BoneId, TransformTree};

use crate::heuristic::HeuristicChain;

/// CCD chain solver.
#[derive(Debug, Clone)]
pub struct CcdSolver {
    pub chain: HeuristicChain,
}

impl CcdSolver {
    pub fn new(bones: impl IntoIterator<Item = BoneId>) -> Self {
        Self {
            chain: HeuristicChain::new(bones),
        }
    }

    /// Non-throwing structural pre-flight check; logs through the warning
    /// channel when `log` is set.
    pub fn is_valid(&self, tree: &TransformTree, log: bool) -> bool {
        match self.chain.validate(tree, true) {
            Ok(()) => true,
            Err(err) => {
                if log {
                    self.chain.log_invalid(err);
                }
                false
            }
        }
    }

    /// Capture the rest pose. Must be called before `update`.
    pub fn initiate(&mut self, tree: &TransformTree, root: BoneId) {
        let last = self.chain.bones[self.chain.bones.len() - 1].bone;
        self.chain.ik_position = tree.position(last);
        self.chain.initiate_bones(tree, root);
    }

    /// CCD tends to overemphasise the rotations of the bones closer to the
    /// target position. Fading bone weight out toward the base compensates.
    pub fn fade_out_bone_weights(&mut self) {
        let count = self.chain.bones.len();
        if count < 2 {
            return;
        }
        self.chain.bones[0].weight = 1.0;
        let step = 1.0 / (count - 1) as f32;
        for i in 1..count {
            self.chain.bones[i].weight = step * (count - 1 - i) as f32;
        }
    }

    /// Run one solve toward `ik_position`.
    pub fn update(&mut self, tree: &mut TransformTree) {
        if !self.chain.initiated {
            warning::log("Trying to update an uninitiated CCD solver.");
            return;
        }
        if self.chain.ik_position_weight <= 0.0 {
            return;
        }
        self.chain.ik_position_weight = self.chain.ik_position_weight.clamp(0.0, 1.0);

        let singularity_offset = if self.chain.max_iterations > 1 {
            self.chain.singularity_offset(tree)
        } else {
            Vector3::zeros()
        };
        let perturbed = singularity_offset.norm_squared() > SQR_EPSILON;

        for iteration in 0..self.chain.max_iterations {
            if !perturbed
                && iteration >= 1
                && self.chain.tolerance > 0.0
                && self.chain.position_offset_sq(self.chain.local_direction(tree))
                    < self.chain.tolerance * self.chain.tolerance
            {
                break;
            }
            self.chain.last_local_direction = self.chain.local_direction(tree);

            let target = if iteration == 0 {
                self.chain.ik_position + singularity_offset
            } else {
                self.chain.ik_position
            };
            self.solve(tree, target);
        }

        self.chain.last_local_direction = self.chain.local_direction(tree);
    }

    fn solve(&mut self, tree: &mut TransformTree, target_position: Vector3<f32>) {
        let count = self.chain.bones.len();
        let last = self.chain.bones[count - 1].bone;

        for i in (0..count - 1).rev() {
            let id = self.chain.bones[i].bone;
            let position = tree.position(id);
            let to_last_bone = tree.position(last) - position;
            let to_target = target_position - position;

            // Rotation that directs the end-effector at the target
            let rotation = tree.rotation(id);
            let target_rotation = from_to_rotation(to_last_bone, to_target) * rotation;

            if self.chain.bones[i].weight >= 1.0 && self.chain.ik_position_weight >= 1.0 {
                tree.set_rotation(id, target_rotation);
            } else {
                tree.set_rotation(
                    id,
                    slerp(
                        rotation,
                        target_rotation,
                        self.chain.bones[i].weight * self.chain.ik_position_weight,
                    ),
                );
            }

            // Constraints are applied immediately so the next bone inward
            // reacts to the clamped pose
            if self.chain.use_rotation_limits {
                if let Some(limit) = self.chain.bones[i].rotation_limit.as_mut() {
                    limit.apply(tree, id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use marionet_core::math::quat_approx_eq;
    use marionet_limits::RotationLimit;
    use marionet_test_utils::straight_chain;

    fn reach_error(solver: &CcdSolver, tree: &TransformTree) -> f32 {
        let last = solver.chain.bones[solver.chain.bones.len() - 1].bone;
        (tree.position(last) - solver.chain.ik_position).norm()
    }

    #[test]
    fn converges_to_reachable_target() {
        let (mut tree, bones) = straight_chain(4, 1.0);
        let mut solver = CcdSolver::new(bones.clone());
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(1.5, 1.0, 0.5);
        solver.chain.max_iterations = 32;
        solver.update(&mut tree);

        assert!(reach_error(&solver, &tree) < 1e-2, "error {}", reach_error(&solver, &tree));
    }

    #[test]
    fn unreachable_target_fully_extends_chain() {
        // 5 bones, 4 segments of length 1; target at distance 10
        let (mut tree, bones) = straight_chain(5, 1.0);
        let mut solver = CcdSolver::new(bones.clone());
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(10.0, 3.0, 0.0).normalize() * 10.0;
        solver.chain.max_iterations = 50;
        solver.update(&mut tree);

        let base = tree.position(bones[0]);
        let end = tree.position(bones[4]);
        assert_relative_eq!((end - base).norm(), 4.0, epsilon = 1e-3);

        // Chain points toward the target
        let to_end = (end - base).normalize();
        let to_target = (solver.chain.ik_position - base).normalize();
        assert!(to_end.dot(&to_target) > 0.999);
    }

    #[test]
    fn length_invariance() {
        let (mut tree, bones) = straight_chain(4, 1.0);
        let mut solver = CcdSolver::new(bones.clone());
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(0.7, -1.2, 0.4);
        solver.chain.max_iterations = 17;
        solver.update(&mut tree);

        for i in 0..bones.len() - 1 {
            let d = (tree.position(bones[i]) - tree.position(bones[i + 1])).norm();
            assert_relative_eq!(d, 1.0, epsilon = 1e-4);
        }
    }

    #[test]
    fn convergence_is_monotonic_in_iterations() {
        let target = Vector3::new(1.2, 1.8, -0.3);
        let mut previous = f32::MAX;

        for iterations in [1usize, 2, 4, 8, 16] {
            let (mut tree, bones) = straight_chain(4, 1.0);
            let mut solver = CcdSolver::new(bones.clone());
            solver.initiate(&tree, bones[0]);
            solver.chain.ik_position = target;
            solver.chain.tolerance = 0.0;
            solver.chain.max_iterations = iterations;
            solver.update(&mut tree);

            let error = reach_error(&solver, &tree);
            assert!(
                error <= previous + 1e-5,
                "error {error} at {iterations} iterations exceeds {previous}"
            );
            previous = error;
        }
    }

    #[test]
    fn zero_weight_is_noop() {
        let (mut tree, bones) = straight_chain(4, 1.0);
        let mut solver = CcdSolver::new(bones.clone());
        solver.initiate(&tree, bones[0]);

        let before: Vec<_> = bones.iter().map(|&b| tree.rotation(b)).collect();
        solver.chain.ik_position = Vector3::new(2.0, 0.0, 0.0);
        solver.chain.ik_position_weight = 0.0;
        solver.update(&mut tree);

        for (i, &b) in bones.iter().enumerate() {
            assert!(quat_approx_eq(tree.rotation(b), before[i], 1e-6));
        }
    }

    #[test]
    fn collinear_target_does_not_produce_nan() {
        let (mut tree, bones) = straight_chain(4, 1.0);
        let mut solver = CcdSolver::new(bones.clone());
        solver.initiate(&tree, bones[0]);

        // Target straight along the extended chain, inside reach
        solver.chain.ik_position = Vector3::new(0.0, 2.0, 0.0);
        solver.chain.max_iterations = 50;
        solver.update(&mut tree);

        let end = tree.position(bones[3]);
        assert!(end.iter().all(|v| v.is_finite()));
        assert!(reach_error(&solver, &tree) < 1e-2);
    }

    #[test]
    fn fade_out_bone_weights_ramps_linearly() {
        let (tree, bones) = straight_chain(4, 1.0);
        let _ = tree;
        let mut solver = CcdSolver::new(bones);
        solver.fade_out_bone_weights();

        let weights: Vec<f32> = solver.chain.bones.iter().map(|b| b.weight).collect();
        assert_relative_eq!(weights[0], 1.0);
        assert_relative_eq!(weights[1], 2.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(weights[2], 1.0 / 3.0, epsilon = 1e-6);
        assert_relative_eq!(weights[3], 0.0);
    }

    #[test]
    fn rotation_limit_is_respected() {
        let (mut tree, bones) = straight_chain(3, 1.0);
        let mut solver = CcdSolver::new(bones.clone());
        // Tight swing cone on the middle bone
        solver.chain.bones[1].rotation_limit =
            Some(RotationLimit::angle(Vector3::y(), 10.0, 180.0));
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(1.5, 0.5, 0.0);
        solver.chain.max_iterations = 30;
        solver.update(&mut tree);

        let local = tree.local_rotation(bones[1]);
        let swing = (local * Vector3::y()).angle(&Vector3::y()).to_degrees();
        assert!(swing <= 10.0 + 0.1, "swing {swing}");
    }
}
