//! Biped rig builder.
//!
//! Wires the standard humanoid chain tree for [`FullBodySolver`]: a body
//! root chain with the four limb chains as children, rigid child
//! constraints keeping shoulders and hips at their animated spacing, the
//! nine standard effectors and a bend constraint per limb.

use marionet_core::{BoneId, TransformTree};
use serde::{Deserialize, Serialize};

use crate::bend::BendConstraint;
use crate::chain::{ChildConstraint, FbikChain};
use crate::effector::Effector;
use crate::node::NodeRef;
use crate::solver::FullBodySolver;

/// Bone references of a humanoid rig.
#[derive(Debug, Clone, Copy)]
pub struct BipedReferences {
    pub pelvis: BoneId,
    pub left_upper_arm: BoneId,
    pub left_forearm: BoneId,
    pub left_hand: BoneId,
    pub right_upper_arm: BoneId,
    pub right_forearm: BoneId,
    pub right_hand: BoneId,
    pub left_thigh: BoneId,
    pub left_calf: BoneId,
    pub left_foot: BoneId,
    pub right_thigh: BoneId,
    pub right_calf: BoneId,
    pub right_foot: BoneId,
}

/// Chains of the biped tree, by index into `solver.chains`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BipedChain {
    Body = 0,
    LeftArm = 1,
    RightArm = 2,
    LeftLeg = 3,
    RightLeg = 4,
}

/// Effectors of the biped, by index into `solver.effectors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BipedEffector {
    Body = 0,
    LeftShoulder = 1,
    RightShoulder = 2,
    LeftThigh = 3,
    RightThigh = 4,
    LeftHand = 5,
    RightHand = 6,
    LeftFoot = 7,
    RightFoot = 8,
}

/// Extra extension allowance of the limb chains.
const DEFAULT_LIMB_REACH: f32 = 0.05;

/// A [`FullBodySolver`] configured as a humanoid.
pub struct BipedRig {
    pub solver: FullBodySolver,
}

impl BipedRig {
    pub fn new(refs: &BipedReferences) -> Self {
        let body = FbikChain::with_children(vec![refs.pelvis], vec![1, 2, 3, 4]);
        let left_arm =
            FbikChain::new(vec![refs.left_upper_arm, refs.left_forearm, refs.left_hand]);
        let right_arm =
            FbikChain::new(vec![refs.right_upper_arm, refs.right_forearm, refs.right_hand]);
        let left_leg = FbikChain::new(vec![refs.left_thigh, refs.left_calf, refs.left_foot]);
        let right_leg = FbikChain::new(vec![refs.right_thigh, refs.right_calf, refs.right_foot]);

        let mut solver =
            FullBodySolver::new(vec![body, left_arm, right_arm, left_leg, right_leg]);

        for chain in [
            BipedChain::LeftArm,
            BipedChain::RightArm,
            BipedChain::LeftLeg,
            BipedChain::RightLeg,
        ] {
            solver.chains[chain as usize].reach = DEFAULT_LIMB_REACH;
        }

        // Shoulders and hips hold their animated spacing
        solver.chains[0].child_constraints = vec![
            ChildConstraint::new(NodeRef::new(1, 0), NodeRef::new(2, 0)),
            ChildConstraint::new(NodeRef::new(3, 0), NodeRef::new(4, 0)),
        ];

        let body_node = NodeRef::new(0, 0);
        let left_shoulder = NodeRef::new(1, 0);
        let right_shoulder = NodeRef::new(2, 0);
        let left_hip = NodeRef::new(3, 0);
        let right_hip = NodeRef::new(4, 0);

        // Body effector carries the thighs rigidly
        solver.effectors = vec![
            Effector::with_child_nodes(body_node, vec![left_hip, right_hip]),
            Effector::new(left_shoulder),
            Effector::new(right_shoulder),
            Effector::new(left_hip),
            Effector::new(right_hip),
            Effector::end_effector(
                NodeRef::new(1, 2),
                [left_shoulder, right_shoulder, body_node],
            ),
            Effector::end_effector(
                NodeRef::new(2, 2),
                [right_shoulder, left_shoulder, body_node],
            ),
            Effector::end_effector(NodeRef::new(3, 2), [left_hip, right_hip, body_node]),
            Effector::end_effector(NodeRef::new(4, 2), [right_hip, left_hip, body_node]),
        ];

        solver.bend_constraints = (1..=4)
            .map(|c| {
                BendConstraint::new(NodeRef::new(c, 0), NodeRef::new(c, 1), NodeRef::new(c, 2))
            })
            .collect();

        Self { solver }
    }

    pub fn is_valid(&self, tree: &TransformTree, log: bool) -> bool {
        self.solver.is_valid(tree, log)
    }

    /// Capture the rest pose. Must be called once before `update`.
    pub fn initiate(&mut self, tree: &TransformTree, refs: &BipedReferences) {
        self.solver.initiate(tree, refs.pelvis);
    }

    /// Run one solve against the current animated pose.
    pub fn update(&mut self, tree: &mut TransformTree) {
        self.solver.update(tree);
    }

    pub fn effector(&self, effector: BipedEffector) -> &Effector {
        &self.solver.effectors[effector as usize]
    }

    pub fn effector_mut(&mut self, effector: BipedEffector) -> &mut Effector {
        &mut self.solver.effectors[effector as usize]
    }

    pub fn chain(&self, chain: BipedChain) -> &FbikChain {
        &self.solver.chains[chain as usize]
    }

    pub fn chain_mut(&mut self, chain: BipedChain) -> &mut FbikChain {
        &mut self.solver.chains[chain as usize]
    }

    /// The bend constraint of a limb chain; panics for `BipedChain::Body`.
    pub fn bend_constraint_mut(&mut self, chain: BipedChain) -> &mut BendConstraint {
        assert!(chain != BipedChain::Body, "the body chain has no bend constraint");
        &mut self.solver.bend_constraints[chain as usize - 1]
    }
}
