//! Forward-And-Backward-Reaching IK.
//!
//! Based on "FABRIK: A fast, iterative solver for the inverse kinematics
//! problem" (Aristidou & Lasenby). Each iteration reaches forward from the
//! end-effector to the base, then backward from the base out, re-seating
//! every joint at its cached bone length.
//!
//! With rotation limits enabled the passes work on transforms directly:
//! the forward pass clamps each bone as soon as it is positioned and then
//! rigidly re-rotates the remaining sub-chain so the end-effector keeps its
//! reached position (limit-then-compensate); the backward pass swings each
//! bone at its solved joint position and clamps in place. Without limits the
//! passes move only scratch solver positions and the transforms are mapped
//! once at the end.

use nalgebra::Vector3;

use marionet_core::math::{from_to_rotation, SQR_EPSILON};
use marionet_core::{warning, BoneId, TransformTree};

use crate::bone::swing_bone;
use crate::heuristic::HeuristicChain;

/// Reposition `pos1` at `length` from `pos2`, along their current line.
///
/// Interpolation is scaled by `length / distance` rather than renormalized,
/// which is cheaper and stable when the positions nearly coincide; exactly
/// coincident positions are left where they are.
pub fn solve_joint(pos1: Vector3<f32>, pos2: Vector3<f32>, length: f32) -> Vector3<f32> {
    let distance = (pos1 - pos2).norm();
    if distance < 1.0e-9 {
        return pos1;
    }
    let d = length / distance;
    (1.0 - d) * pos2 + d * pos1
}

/// FABRIK chain solver.
#[derive(Debug, Clone)]
pub struct FabrikSolver {
    pub chain: HeuristicChain,
    /// Recompute bone lengths from the animated pose every pre-solve.
    /// Required when the rig is non-rigidly animated (stretchy bones);
    /// costs a recalculation pass. When off, bones are re-pinned to their
    /// default local positions instead.
    pub update_bone_lengths: bool,
    limited_bones: Vec<bool>,
}

impl FabrikSolver {
    pub fn new(bones: impl IntoIterator<Item = BoneId>) -> Self {
        Self {
            chain: HeuristicChain::new(bones),
            update_bone_lengths: false,
            limited_bones: Vec::new(),
        }
    }

    /// Non-throwing structural pre-flight check. FABRIK cannot work with
    /// zero-length bones, so those are rejected here.
    pub fn is_valid(&self, tree: &TransformTree, log: bool) -> bool {
        match self.chain.validate(tree, false) {
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
        for bone in &mut self.chain.bones {
            bone.solver_position = tree.position(bone.bone);
        }
        self.limited_bones = vec![false; self.chain.bones.len()];
        self.chain.initiate_bones(tree, root);
    }

    /// Run one solve toward `ik_position`.
    pub fn update(&mut self, tree: &mut TransformTree) {
        if !self.chain.initiated {
            warning::log("Trying to update an uninitiated FABRIK solver.");
            return;
        }
        if self.chain.ik_position_weight <= 0.0 {
            return;
        }
        self.chain.ik_position_weight = self.chain.ik_position_weight.clamp(0.0, 1.0);

        self.pre_solve(tree);

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
                && self.chain.position_offset_sq(self.solver_local_direction(tree))
                    < self.chain.tolerance * self.chain.tolerance
            {
                break;
            }
            self.chain.last_local_direction = self.solver_local_direction(tree);

            let target = if iteration == 0 {
                self.chain.ik_position + singularity_offset
            } else {
                self.chain.ik_position
            };
            let first_position = tree.position(self.chain.bones[0].bone);
            self.forward_reach(tree, target);
            self.backward_reach(tree, first_position);
        }

        self.post_solve(tree);
    }

    /// Solving stage 1 only, for tree composition: forward reach toward
    /// `position` after re-reading the pose.
    pub fn solve_forward(&mut self, tree: &mut TransformTree, position: Vector3<f32>) {
        if !self.chain.initiated {
            if !warning::logged() {
                warning::log("Trying to solve an uninitiated FABRIK chain.");
            }
            return;
        }
        self.pre_solve(tree);
        self.forward_reach(tree, position);
    }

    /// Solving stage 2 only, for tree composition: backward reach from
    /// `position`, then map the results back onto the transforms.
    pub fn solve_backward(&mut self, tree: &mut TransformTree, position: Vector3<f32>) {
        if !self.chain.initiated {
            if !warning::logged() {
                warning::log("Trying to solve an uninitiated FABRIK chain.");
            }
            return;
        }
        self.backward_reach(tree, position);
        self.post_solve(tree);
    }

    /// End-effector direction in root space from solver positions, which
    /// are current in both the limited and unlimited code paths.
    fn solver_local_direction(&self, tree: &TransformTree) -> Vector3<f32> {
        let first = self.chain.bones[0].solver_position;
        let last = self.chain.bones[self.chain.bones.len() - 1].solver_position;
        self.chain.local_direction_between(tree, first, last)
    }

    /// Refresh solver positions from the animated pose; either recompute
    /// lengths (stretchy rigs) or re-pin bones to their default local
    /// positions.
    fn pre_solve(&mut self, tree: &mut TransformTree) {
        let count = self.chain.bones.len();
        if self.update_bone_lengths {
            self.chain.chain_length = 0.0;
        }

        for i in 0..count {
            let id = self.chain.bones[i].bone;
            self.chain.bones[i].solver_position = tree.position(id);

            if self.update_bone_lengths {
                if i < count - 1 {
                    let next = tree.position(self.chain.bones[i + 1].bone);
                    self.chain.bones[i].length = (tree.position(id) - next).norm();
                    self.chain.chain_length += self.chain.bones[i].length;
                }
                self.chain.bones[i].default_local_position = tree.local_position(id);
            } else if i > 0 {
                tree.set_local_position(id, self.chain.bones[i].default_local_position);
            }
        }
    }

    fn post_solve(&mut self, tree: &mut TransformTree) {
        // Rotating bones to match the solver positions; with limits active
        // the passes already wrote the transforms.
        if !self.chain.use_rotation_limits {
            self.map_to_solver_positions(tree);
        }
        self.chain.last_local_direction = self.solver_local_direction(tree);
    }

    // ---- stage 1 ----

    fn forward_reach(&mut self, tree: &mut TransformTree, position: Vector3<f32>) {
        let count = self.chain.bones.len();
        let w = self.chain.ik_position_weight;

        let last = self.chain.bones[count - 1].solver_position;
        self.chain.bones[count - 1].solver_position = last + (position - last) * w;

        self.limited_bones.fill(false);

        for i in (0..count - 1).rev() {
            self.chain.bones[i].solver_position = solve_joint(
                self.chain.bones[i].solver_position,
                self.chain.bones[i + 1].solver_position,
                self.chain.bones[i].length,
            );
            self.limit_forward(tree, i + 1, i);
        }
        self.limit_forward(tree, 0, 0);
    }

    /// Apply `limit_bone`'s rotation limit during the forward pass.
    ///
    /// The sub-chain from `rotate_bone` down is first written to the
    /// transforms; after the clamp the sub-chain is rigidly re-rotated and
    /// translated so the end-effector keeps the position it had reached,
    /// trading a small loss of reach for constraint satisfaction without an
    /// extra pass.
    fn limit_forward(&mut self, tree: &mut TransformTree, limit_bone: usize, rotate_bone: usize) {
        if !self.chain.use_rotation_limits {
            return;
        }
        if self.chain.bones[limit_bone].rotation_limit.is_none() {
            return;
        }

        let count = self.chain.bones.len();
        let last_id = self.chain.bones[count - 1].bone;

        // Move this bone and its solved children onto the solver positions
        for b in rotate_bone..count {
            if self.limited_bones[b] {
                break;
            }
            tree.set_position(self.chain.bones[b].bone, self.chain.bones[b].solver_position);
            if b < count - 1 {
                let swing_target = self.chain.bones[b + 1].solver_position;
                let (id, axis) = (self.chain.bones[b].bone, self.chain.bones[b].axis);
                swing_bone(tree, id, axis, swing_target, 1.0);
            }
        }

        let last_position = tree.position(last_id);
        let rotate_id = self.chain.bones[rotate_bone].bone;
        let to_last = last_position - tree.position(rotate_id);

        let changed = {
            let id = self.chain.bones[limit_bone].bone;
            match self.chain.bones[limit_bone].rotation_limit.as_mut() {
                Some(limit) => limit.apply(tree, id),
                None => false,
            }
        };

        if changed && rotate_bone < count - 2 {
            // Rigid compensation: restore the end-effector position
            let to_last_limited = tree.position(last_id) - tree.position(rotate_id);
            let from_to = from_to_rotation(to_last_limited, to_last);
            tree.set_rotation(rotate_id, from_to * tree.rotation(rotate_id));

            let drift = last_position - tree.position(last_id);
            tree.translate(rotate_id, drift);
        }

        for b in rotate_bone..count {
            self.chain.bones[b].solver_position = tree.position(self.chain.bones[b].bone);
        }
        self.limited_bones[limit_bone] = true;
    }

    // ---- stage 2 ----

    fn backward_reach(&mut self, tree: &mut TransformTree, position: Vector3<f32>) {
        if self.chain.use_rotation_limits {
            self.backward_reach_limited(tree, position);
        } else {
            self.backward_reach_unlimited(position);
        }
    }

    fn backward_reach_unlimited(&mut self, position: Vector3<f32>) {
        let count = self.chain.bones.len();
        self.chain.bones[0].solver_position = position;

        for i in 1..count {
            self.chain.bones[i].solver_position = solve_joint(
                self.chain.bones[i].solver_position,
                self.chain.bones[i - 1].solver_position,
                self.chain.bones[i - 1].length,
            );
        }
    }

    fn backward_reach_limited(&mut self, tree: &mut TransformTree, position: Vector3<f32>) {
        let count = self.chain.bones.len();
        tree.set_position(self.chain.bones[0].bone, position);

        for i in 0..count - 1 {
            // Swing at the solved joint position, clamp in place, re-seat
            // the next bone at its rest local offset
            let target = solve_joint(
                self.chain.bones[i + 1].solver_position,
                tree.position(self.chain.bones[i].bone),
                self.chain.bones[i].length,
            );
            let (id, axis) = (self.chain.bones[i].bone, self.chain.bones[i].axis);
            swing_bone(tree, id, axis, target, 1.0);

            if let Some(limit) = self.chain.bones[i].rotation_limit.as_mut() {
                limit.apply(tree, id);
            }

            let next_id = self.chain.bones[i + 1].bone;
            let next_default = self.chain.bones[i + 1].default_local_position;
            tree.set_local_position(next_id, next_default);
        }

        for i in 0..count {
            self.chain.bones[i].solver_position = tree.position(self.chain.bones[i].bone);
        }
    }

    /// Swing bone transforms onto the solver positions, preserving the
    /// default local position of every bone but the base.
    fn map_to_solver_positions(&mut self, tree: &mut TransformTree) {
        let count = self.chain.bones.len();
        tree.set_position(self.chain.bones[0].bone, self.chain.bones[0].solver_position);

        for i in 0..count - 1 {
            if i > 0 {
                let id = self.chain.bones[i].bone;
                tree.set_local_position(id, self.chain.bones[i].default_local_position);
            }
            let swing_target = self.chain.bones[i + 1].solver_position;
            let (id, axis) = (self.chain.bones[i].bone, self.chain.bones[i].axis);
            swing_bone(tree, id, axis, swing_target, 1.0);
        }

        if count > 1 {
            let id = self.chain.bones[count - 1].bone;
            tree.set_local_position(id, self.chain.bones[count - 1].default_local_position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use marionet_core::math::quat_approx_eq;
    use marionet_limits::{LimitKind, RotationLimit};
    use marionet_test_utils::straight_chain;

    fn reach_error(solver: &FabrikSolver, tree: &TransformTree) -> f32 {
        let last = solver.chain.bones[solver.chain.bones.len() - 1].bone;
        (tree.position(last) - solver.chain.ik_position).norm()
    }

    #[test]
    fn solve_joint_preserves_length() {
        let p = solve_joint(
            Vector3::new(3.0, 0.5, -1.0),
            Vector3::new(0.0, 0.0, 0.0),
            2.0,
        );
        assert_relative_eq!(p.norm(), 2.0, epsilon = 1e-5);
    }

    #[test]
    fn solve_joint_coincident_positions_no_nan() {
        let p = solve_joint(Vector3::zeros(), Vector3::zeros(), 1.0);
        assert!(p.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn converges_to_reachable_target() {
        let (mut tree, bones) = straight_chain(4, 1.0);
        let mut solver = FabrikSolver::new(bones.clone());
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(1.0, 1.5, 0.7);
        solver.chain.max_iterations = 32;
        solver.update(&mut tree);

        assert!(reach_error(&solver, &tree) < 1e-3, "error {}", reach_error(&solver, &tree));
    }

    #[test]
    fn length_invariance_without_limits() {
        let (mut tree, bones) = straight_chain(5, 0.8);
        let mut solver = FabrikSolver::new(bones.clone());
        solver.chain.use_rotation_limits = false;
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(-1.0, 1.3, 0.6);
        solver.chain.max_iterations = 11;
        solver.update(&mut tree);

        for i in 0..bones.len() - 1 {
            let d = (tree.position(bones[i]) - tree.position(bones[i + 1])).norm();
            assert_relative_eq!(d, 0.8, epsilon = 1e-4);
        }
    }

    #[test]
    fn length_invariance_with_limits() {
        let (mut tree, bones) = straight_chain(4, 1.0);
        let mut solver = FabrikSolver::new(bones.clone());
        solver.chain.bones[1].rotation_limit =
            Some(RotationLimit::angle(Vector3::y(), 60.0, 180.0));
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(1.4, 0.8, -0.5);
        solver.chain.max_iterations = 16;
        solver.update(&mut tree);

        for i in 0..bones.len() - 1 {
            let d = (tree.position(bones[i]) - tree.position(bones[i + 1])).norm();
            assert_relative_eq!(d, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn unreachable_target_fully_extends() {
        let (mut tree, bones) = straight_chain(4, 1.0);
        let mut solver = FabrikSolver::new(bones.clone());
        solver.chain.use_rotation_limits = false;
        solver.initiate(&tree, bones[0]);

        solver.chain.ik_position = Vector3::new(5.0, 5.0, 0.0);
        solver.chain.max_iterations = 20;
        solver.update(&mut tree);

        let base = tree.position(bones[0]);
        let end = tree.position(bones[3]);
        assert_relative_eq!((end - base).norm(), 3.0, epsilon = 1e-3);
    }

    #[test]
    fn convergence_is_monotonic_in_iterations() {
        let target = Vector3::new(1.1, 2.0, -0.4);
        let mut previous = f32::MAX;

        for iterations in [1usize, 2, 4, 8] {
            let (mut tree, bones) = straight_chain(4, 1.0);
            let mut solver = FabrikSolver::new(bones.clone());
            solver.chain.use_rotation_limits = false;
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
        let mut solver = FabrikSolver::new(bones.clone());
        solver.initiate(&tree, bones[0]);

        let before_rot: Vec<_> = bones.iter().map(|&b| tree.rotation(b)).collect();
        let before_pos: Vec<_> = bones.iter().map(|&b| tree.position(b)).collect();

        solver.chain.ik_position = Vector3::new(2.0, 0.5, 0.0);
        solver.chain.ik_position_weight = 0.0;
        solver.update(&mut tree);

        for (i, &b) in bones.iter().enumerate() {
            assert!(quat_approx_eq(tree.rotation(b), before_rot[i], 1e-6));
            assert_relative_eq!((tree.position(b) - before_pos[i]).norm(), 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn hinge_limit_clamps_bend() {
        // 3 bones along +Y; the middle joint is a 90 degree hinge about Z.
        // The target asks for a ~150 degree bend.
        let (mut tree, bones) = straight_chain(3, 1.0);
        let mut solver = FabrikSolver::new(bones.clone());
        solver.chain.bones[1].rotation_limit =
            Some(RotationLimit::hinge(Vector3::z(), 0.0, 90.0));
        solver.initiate(&tree, bones[0]);

        // End of second segment rotated 150 degrees about Z at the middle
        // joint: well beyond the hinge range
        let joint = Vector3::new(0.0, 1.0, 0.0);
        let bent = nalgebra::UnitQuaternion::from_axis_angle(
            &Vector3::z_axis(),
            150.0f32.to_radians(),
        ) * Vector3::y();
        solver.chain.ik_position = joint + bent;
        solver.chain.max_iterations = 30;
        solver.update(&mut tree);

        // The hinge stopped at 90 degrees
        let Some(limit) = &solver.chain.bones[1].rotation_limit else {
            panic!("limit missing");
        };
        let LimitKind::Hinge { last_angle, .. } = limit.kind else {
            panic!("expected hinge");
        };
        assert!(last_angle <= 90.0 + 1e-2, "hinge angle {last_angle}");
        assert!(last_angle >= 89.0, "hinge should saturate, got {last_angle}");

        // And the end-effector is correspondingly short of the target
        assert!(reach_error(&solver, &tree) > 0.1);
    }

    #[test]
    fn update_bone_lengths_follows_stretched_rig() {
        let (mut tree, bones) = straight_chain(3, 1.0);
        let mut solver = FabrikSolver::new(bones.clone());
        solver.update_bone_lengths = true;
        solver.initiate(&tree, bones[0]);

        // The rig stretches: segment 0 becomes 2 long
        tree.set_local_position(bones[1], Vector3::new(0.0, 2.0, 0.0));

        solver.chain.ik_position = Vector3::new(1.5, 2.0, 0.0);
        solver.chain.max_iterations = 16;
        solver.update(&mut tree);

        assert_relative_eq!(solver.chain.bones[0].length, 2.0, epsilon = 1e-5);
        let d = (tree.position(bones[0]) - tree.position(bones[1])).norm();
        assert_relative_eq!(d, 2.0, epsilon = 1e-3);
    }

    #[test]
    fn solve_forward_without_initiate_warns_and_noops() {
        let (mut tree, bones) = straight_chain(3, 1.0);
        let mut solver = FabrikSolver::new(bones.clone());
        let before = tree.position(bones[2]);
        solver.solve_forward(&mut tree, Vector3::new(1.0, 1.0, 1.0));
        assert_relative_eq!((tree.position(bones[2]) - before).norm(), 0.0);
    }
}
