//! The full-body solver: orchestration of the chain tree, effectors, child
//! constraints and bend constraints.
//!
//! Per-update sequence (the ordering is part of the contract):
//!
//! 1. Effector pre-solve (weights, input sanity, additive offsets into
//!    node offsets), then pose read (chains capture animated positions plus
//!    offsets, refresh lengths and constraint nominal distances).
//! 2. Effector position application.
//! 3. Reach pass (3-node chains, post-order).
//! 4. Trigonometric pre-pass (post-order) to remove slack before iterating.
//! 5. `iterations` rounds of constraint-coupled FABRIK stage 1 (post-order)
//!    and stage 2 (pre-order, with constraint-system settles).
//! 6. Pre-bend hook, then the bend-constraint pass.
//! 7. Write-back: solved node positions stay exposed for the mapping layer,
//!    effector offsets and node offsets are reset, post-update hook runs.

use nalgebra::Vector3;

use marionet_core::{warning, BoneId, TransformTree, ValidationError};

use crate::bend::BendConstraint;
use crate::chain::{self, FbikChain};
use crate::effector::Effector;
use crate::node::NodeRef;

type TreeHook = Box<dyn FnMut(&mut TransformTree) + Send>;
type BendHook = Box<dyn FnMut(&mut [BendConstraint]) + Send>;
type PostHook = Box<dyn FnMut() + Send>;

/// Multi-effector solver over a tree of node chains.
///
/// Chain index 0 is the root of the tree.
pub struct FullBodySolver {
    /// FABRIK stage-1/stage-2 rounds per update.
    pub iterations: usize,
    /// Master solver weight; 0 skips solving entirely (after resetting
    /// transient offsets).
    pub ik_position_weight: f32,
    pub chains: Vec<FbikChain>,
    pub effectors: Vec<Effector>,
    pub bend_constraints: Vec<BendConstraint>,
    /// Runs before the pose is read; external code may still adjust the
    /// animated pose here.
    pub on_pre_read: Option<TreeHook>,
    /// Runs immediately before the bend-constraint pass, so an injected
    /// bend-goal direction is consumed by the same update.
    pub on_pre_bend: Option<BendHook>,
    /// Runs after write-back and offset reset.
    pub on_post_update: Option<PostHook>,
    root: BoneId,
    initiated: bool,
}

impl FullBodySolver {
    pub fn new(chains: Vec<FbikChain>) -> Self {
        Self {
            iterations: 4,
            ik_position_weight: 1.0,
            chains,
            effectors: Vec::new(),
            bend_constraints: Vec::new(),
            on_pre_read: None,
            on_pre_bend: None,
            on_post_update: None,
            root: BoneId(0),
            initiated: false,
        }
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated
    }

    /// The node a bone maps to, if any chain owns it.
    pub fn find_node(&self, bone: BoneId) -> Option<NodeRef> {
        for (c, chain) in self.chains.iter().enumerate() {
            for (n, node) in chain.nodes.iter().enumerate() {
                if node.bone == bone {
                    return Some(NodeRef::new(c, n));
                }
            }
        }
        None
    }

    /// Solved world-space position of a node, for the mapping layer.
    pub fn node_position(&self, node: NodeRef) -> Vector3<f32> {
        self.chains[node.chain].nodes[node.node].solver_position
    }

    /// Non-throwing structural pre-flight check.
    pub fn is_valid(&self, tree: &TransformTree, log: bool) -> bool {
        match self.validate(tree) {
            Ok(()) => true,
            Err(err) => {
                if log {
                    warning::log(&format!("Full body solver is not valid: {err}"));
                }
                false
            }
        }
    }

    fn validate(&self, tree: &TransformTree) -> Result<(), ValidationError> {
        if self.chains.is_empty() {
            return Err(ValidationError::NoChains);
        }

        let mut seen = Vec::new();
        for chain in &self.chains {
            if chain.nodes.is_empty() {
                return Err(ValidationError::NoBones);
            }
            for node in &chain.nodes {
                if !tree.contains(node.bone) {
                    return Err(ValidationError::NodeOutsideSolver);
                }
                if seen.contains(&node.bone) {
                    return Err(ValidationError::DuplicateBone);
                }
                seen.push(node.bone);
            }
            for &child in &chain.children {
                if child >= self.chains.len() {
                    return Err(ValidationError::ChildIndexOutOfRange {
                        index: child,
                        count: self.chains.len(),
                    });
                }
            }
        }

        // Every chain must hang off the root chain
        let mut reachable = vec![false; self.chains.len()];
        mark_reachable(&self.chains, 0, &mut reachable);
        if reachable.iter().any(|r| !r) {
            return Err(ValidationError::DisconnectedChain);
        }

        for effector in &self.effectors {
            if !self.contains_node(effector.node) {
                return Err(ValidationError::NodeOutsideSolver);
            }
            for &child in &effector.child_nodes {
                if !self.contains_node(child) {
                    return Err(ValidationError::NodeOutsideSolver);
                }
            }
        }
        for constraint in &self.bend_constraints {
            for node in [constraint.node1, constraint.node2, constraint.node3] {
                if !self.contains_node(node) {
                    return Err(ValidationError::NodeOutsideSolver);
                }
            }
        }
        Ok(())
    }

    fn contains_node(&self, node: NodeRef) -> bool {
        node.chain < self.chains.len() && node.node < self.chains[node.chain].nodes.len()
    }

    /// Capture the rest pose of chains, effectors and bend constraints.
    /// Must be called once before `update`, and again after structural
    /// changes (the solver never observes hierarchy changes implicitly).
    pub fn initiate(&mut self, tree: &TransformTree, root: BoneId) {
        self.root = root;
        chain::initiate(&mut self.chains, tree);
        for effector in &mut self.effectors {
            effector.initiate(&self.chains, tree);
        }
        for constraint in &mut self.bend_constraints {
            constraint.initiate(&self.chains, tree);
        }
        self.initiated = true;
    }

    /// Run one solve against the current animated pose.
    pub fn update(&mut self, tree: &mut TransformTree) {
        if !self.initiated {
            warning::log("Trying to update an uninitiated full body solver.");
            return;
        }
        if self.chains.is_empty() {
            return;
        }
        self.ik_position_weight = self.ik_position_weight.clamp(0.0, 1.0);

        if self.ik_position_weight <= 0.0 {
            // Fail-safe no-op that still honors the offset-reset contract
            for effector in &mut self.effectors {
                effector.on_post_write();
            }
            self.reset_node_offsets();
            return;
        }

        if let Some(hook) = self.on_pre_read.as_mut() {
            hook(tree);
        }

        // 1. Effector weights and offsets, then pose read
        for effector in &mut self.effectors {
            effector.on_pre_solve(&mut self.chains, tree, self.ik_position_weight);
        }
        chain::read_pose(&mut self.chains, tree);

        // 2. Effector position application
        for effector in &mut self.effectors {
            effector.update(&mut self.chains, tree);
        }

        // 3. Reach pass
        chain::reach(&mut self.chains, 0);

        // 4. Trigonometric pre-pass
        chain::solve_trigonometric(&mut self.chains, 0);

        // 5. Constraint-coupled FABRIK rounds. Stage 2 always restarts from
        // the root anchor (the effector-weighted root position), otherwise
        // the root chain would migrate toward its children's centroid.
        let root_anchor = self.chains[0].nodes[0].solver_position;
        for _ in 0..self.iterations {
            chain::stage1(&mut self.chains, 0);
            chain::stage2(&mut self.chains, 0, root_anchor, self.iterations);
        }

        // 6. Bend pass; end-effector plane deltas feed the constraints
        for constraint in self.bend_constraints.iter_mut() {
            if let Some(effector) = self
                .effectors
                .iter()
                .find(|e| e.is_end_effector() && e.node == constraint.node3)
            {
                constraint.rotation_offset = effector.plane_rotation_offset;
            }
        }
        if let Some(hook) = self.on_pre_bend.as_mut() {
            hook(&mut self.bend_constraints);
        }
        for constraint in self.bend_constraints.iter_mut() {
            constraint.solve(&mut self.chains, tree);
        }

        // 7. Write-back contract: offsets are consumed exactly once
        for effector in &mut self.effectors {
            effector.on_post_write();
        }
        self.reset_node_offsets();

        if let Some(hook) = self.on_post_update.as_mut() {
            hook();
        }
    }

    fn reset_node_offsets(&mut self) {
        for chain in &mut self.chains {
            for node in &mut chain.nodes {
                node.offset = Vector3::zeros();
            }
        }
    }
}

fn mark_reachable(chains: &[FbikChain], index: usize, reachable: &mut [bool]) {
    if reachable[index] {
        return;
    }
    reachable[index] = true;
    for &child in &chains[index].children {
        if child < chains.len() {
            mark_reachable(chains, child, reachable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use marionet_test_utils::{biped_skeleton, BipedSkeleton};

    fn arm_tree_solver(skeleton: &BipedSkeleton) -> FullBodySolver {
        // Body root plus both arms, enough to exercise constraints
        let body = FbikChain::with_children(vec![skeleton.pelvis], vec![1, 2]);
        let left = FbikChain::new(vec![
            skeleton.left_upper_arm,
            skeleton.left_forearm,
            skeleton.left_hand,
        ]);
        let right = FbikChain::new(vec![
            skeleton.right_upper_arm,
            skeleton.right_forearm,
            skeleton.right_hand,
        ]);
        let mut solver = FullBodySolver::new(vec![body, left, right]);
        solver.chains[0].child_constraints.push(crate::chain::ChildConstraint::new(
            NodeRef::new(1, 0),
            NodeRef::new(2, 0),
        ));

        let mut hand = Effector::end_effector(
            NodeRef::new(1, 2),
            [NodeRef::new(1, 0), NodeRef::new(2, 0), NodeRef::new(0, 0)],
        );
        hand.effect_child_nodes = false;
        solver.effectors.push(hand);

        solver
            .bend_constraints
            .push(BendConstraint::new(NodeRef::new(1, 0), NodeRef::new(1, 1), NodeRef::new(1, 2)));
        solver
    }

    #[test]
    fn validates_structure() {
        let (tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        assert!(solver.is_valid(&tree, false));

        // Out-of-range child index
        solver.chains[0].children.push(9);
        assert!(!solver.is_valid(&tree, false));
        solver.chains[0].children.pop();

        // Disconnected chain
        solver.chains[0].children.truncate(1);
        assert!(!solver.is_valid(&tree, false));
    }

    #[test]
    fn effector_pulls_hand_to_target() {
        let (mut tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        solver.initiate(&tree, skeleton.pelvis);

        let target = Vector3::new(-0.5, 1.2, 0.3);
        solver.effectors[0].position = target;
        solver.effectors[0].position_weight = 1.0;
        solver.update(&mut tree);

        let hand = solver.node_position(NodeRef::new(1, 2));
        assert!((hand - target).norm() < 2.0e-2, "error {}", (hand - target).norm());
    }

    #[test]
    fn limb_segment_lengths_survive_the_solve() {
        let (mut tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        solver.initiate(&tree, skeleton.pelvis);

        solver.effectors[0].position = Vector3::new(-0.4, 0.9, 0.2);
        solver.effectors[0].position_weight = 1.0;
        solver.update(&mut tree);

        let upper = (solver.node_position(NodeRef::new(1, 0))
            - solver.node_position(NodeRef::new(1, 1)))
        .norm();
        let lower = (solver.node_position(NodeRef::new(1, 1))
            - solver.node_position(NodeRef::new(1, 2)))
        .norm();
        assert_relative_eq!(upper, 0.4, epsilon = 1e-2);
        assert_relative_eq!(lower, 0.4, epsilon = 1e-2);
    }

    #[test]
    fn zero_weight_update_resets_offsets_and_moves_nothing() {
        let (mut tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        solver.initiate(&tree, skeleton.pelvis);

        solver.ik_position_weight = 0.0;
        solver.effectors[0].position_offset = Vector3::new(1.0, 0.0, 0.0);
        let before = solver.node_position(NodeRef::new(1, 2));
        solver.update(&mut tree);

        assert_relative_eq!(solver.effectors[0].position_offset.norm(), 0.0);
        assert_relative_eq!((solver.node_position(NodeRef::new(1, 2)) - before).norm(), 0.0);
    }

    #[test]
    fn additive_offset_is_not_compounded_across_frames() {
        let (mut tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        solver.initiate(&tree, skeleton.pelvis);
        solver.effectors[0].position_weight = 0.0;

        let nudge = Vector3::new(0.05, 0.0, 0.0);
        let animated = tree.position(skeleton.left_hand);

        // Frame 1
        solver.effectors[0].position_offset += nudge;
        solver.update(&mut tree);
        let frame1 = solver.node_position(NodeRef::new(1, 2));

        // Frame 2, same additive usage; the displacement stays one frame's
        // worth because the solver consumed and reset the offset
        solver.effectors[0].position_offset += nudge;
        solver.update(&mut tree);
        let frame2 = solver.node_position(NodeRef::new(1, 2));

        let d1 = (frame1 - animated).x;
        let d2 = (frame2 - animated).x;
        assert!(d1 > 0.02, "offset had no effect: {d1}");
        assert!((d2 - d1).abs() < 0.02, "offset compounded: {d1} then {d2}");
    }

    #[test]
    fn shoulder_constraint_keeps_arm_roots_apart() {
        let (mut tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        solver.initiate(&tree, skeleton.pelvis);

        let rest_distance = (tree.position(skeleton.left_upper_arm)
            - tree.position(skeleton.right_upper_arm))
        .norm();

        // Drag the left hand far across the body
        solver.effectors[0].position = Vector3::new(0.8, 1.5, 0.0);
        solver.effectors[0].position_weight = 1.0;
        solver.update(&mut tree);

        let solved_distance = (solver.node_position(NodeRef::new(1, 0))
            - solver.node_position(NodeRef::new(2, 0)))
        .norm();
        // The rigid child constraint holds the shoulders near nominal
        assert!(
            (solved_distance - rest_distance).abs() < 0.1,
            "shoulders drifted: {solved_distance} vs {rest_distance}"
        );
    }

    #[test]
    fn hooks_fire_in_order() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let (mut tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        solver.initiate(&tree, skeleton.pelvis);

        let counter = Arc::new(AtomicUsize::new(0));
        let (c1, c2, c3) = (counter.clone(), counter.clone(), counter.clone());

        solver.on_pre_read = Some(Box::new(move |_| {
            assert_eq!(c1.fetch_add(1, Ordering::SeqCst), 0);
        }));
        solver.on_pre_bend = Some(Box::new(move |constraints| {
            assert_eq!(c2.fetch_add(1, Ordering::SeqCst), 1);
            // The injected bend goal is consumed by this very update
            constraints[0].weight = 1.0;
            constraints[0].direction = nalgebra::Vector3::z();
        }));
        solver.on_post_update = Some(Box::new(move || {
            assert_eq!(c3.fetch_add(1, Ordering::SeqCst), 2);
        }));

        solver.effectors[0].position = Vector3::new(-0.5, 1.0, 0.1);
        solver.effectors[0].position_weight = 1.0;
        solver.update(&mut tree);
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        // The pre-bend injection steered the elbow toward +Z
        let elbow = solver.node_position(NodeRef::new(1, 1));
        let shoulder = solver.node_position(NodeRef::new(1, 0));
        assert!((elbow - shoulder).z > 0.0, "bend goal ignored");
    }

    #[test]
    fn update_before_initiate_is_a_warned_noop() {
        let (mut tree, skeleton) = biped_skeleton();
        let mut solver = arm_tree_solver(&skeleton);
        let before = tree.position(skeleton.left_hand);
        solver.update(&mut tree);
        assert_relative_eq!((tree.position(skeleton.left_hand) - before).norm(), 0.0);
    }

    #[test]
    fn find_node_maps_bones_to_refs() {
        let (_, skeleton) = biped_skeleton();
        let solver = arm_tree_solver(&skeleton);
        assert_eq!(solver.find_node(skeleton.left_forearm), Some(NodeRef::new(1, 1)));
        assert_eq!(solver.find_node(skeleton.left_foot), None);
    }
}
