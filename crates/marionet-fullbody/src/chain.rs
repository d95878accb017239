//! The full-body solver's chain tree.
//!
//! Chains hold 1-3 nodes and are stored in one flat array; tree structure
//! is expressed as child indices. The recursive passes are free functions
//! over `(&mut [FbikChain], index)` so a chain can read and write sibling
//! and child chains without ownership cycles. Stage 1 recursion is
//! post-order (children before parent), stage 2 pre-order; that ordering is
//! a correctness requirement of the algorithm, not an optimization.

use nalgebra::Vector3;

use marionet_core::math::{look_rotation, SQR_EPSILON};
use marionet_core::{BoneId, TransformTree};
use marionet_solvers::solve_joint;
use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeRef};

/// Smoothing applied to the reach delta, trading accuracy for smoother
/// onset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReachSmoothing {
    #[default]
    None,
    Exponential,
    Cubic,
}

/// Linear distance constraint between the roots of two sibling chains,
/// e.g. keeping the upper arms a shoulder-width apart.
#[derive(Debug, Clone)]
pub struct ChildConstraint {
    pub node1: NodeRef,
    pub node2: NodeRef,
    /// Resistance to compressing below the nominal distance; >= 1 disables
    /// the push response.
    pub push_elasticity: f32,
    /// Resistance to stretching beyond the nominal distance.
    pub pull_elasticity: f32,
    nominal_distance: f32,
}

impl ChildConstraint {
    pub fn new(node1: NodeRef, node2: NodeRef) -> Self {
        Self {
            node1,
            node2,
            push_elasticity: 0.0,
            pull_elasticity: 0.0,
            nominal_distance: 0.0,
        }
    }

    /// The constraint is rigid if both elasticities are 0.
    pub fn is_rigid(&self) -> bool {
        self.push_elasticity <= 0.0 && self.pull_elasticity <= 0.0
    }

    /// Nominal (animated) distance captured at the last pose read.
    pub fn nominal_distance(&self) -> f32 {
        self.nominal_distance
    }

    /// Re-capture the nominal distance from the animated pose; it may change
    /// every frame under animation.
    fn pre_solve(&mut self, distance: f32) {
        self.nominal_distance = distance;
    }

    /// Elasticity-weighted restoration of the nominal distance, with the
    /// force split between the two nodes by `pull`.
    fn solve(&self, chains: &mut [FbikChain], pull: f32) {
        if self.push_elasticity >= 1.0 && self.pull_elasticity >= 1.0 {
            return;
        }

        let p1 = node_position(chains, self.node1);
        let p2 = node_position(chains, self.node2);
        let distance = (p1 - p2).norm();
        if distance < 1.0e-9 {
            return;
        }

        let elasticity = if distance > self.nominal_distance {
            self.pull_elasticity
        } else {
            self.push_elasticity
        };

        let mut force = 1.0 - elasticity.clamp(0.0, 1.0);
        force *= 1.0 - self.nominal_distance / distance;
        if force == 0.0 {
            return;
        }

        let offset = (p2 - p1) * force;
        set_node_position(chains, self.node1, p1 + offset * pull);
        set_node_position(chains, self.node2, p2 - offset * (1.0 - pull));
    }
}

/// A chain of 1-3 nodes in the full-body tree.
#[derive(Debug, Clone)]
pub struct FbikChain {
    /// Resistance to being dragged toward child chains; 1 ignores them.
    pub pin: f32,
    /// How strongly this chain drags its parent.
    pub pull: f32,
    /// Extra extension allowance for 3-node limb chains, as a fraction of
    /// limb length.
    pub reach: f32,
    pub reach_smoothing: ReachSmoothing,
    pub nodes: Vec<Node>,
    /// Child chain indices in the solver's flat chain array.
    pub children: Vec<usize>,
    pub child_constraints: Vec<ChildConstraint>,
    /// Distance from this chain's first node to the parent chain's last
    /// node, refreshed on every pose read.
    pub(crate) root_length: f32,
    pub(crate) initiated: bool,
}

impl FbikChain {
    pub fn new(bones: impl IntoIterator<Item = BoneId>) -> Self {
        Self {
            pin: 0.0,
            pull: 1.0,
            reach: 0.0,
            reach_smoothing: ReachSmoothing::None,
            nodes: bones.into_iter().map(Node::new).collect(),
            children: Vec::new(),
            child_constraints: Vec::new(),
            root_length: 0.0,
            initiated: false,
        }
    }

    pub fn with_children(bones: impl IntoIterator<Item = BoneId>, children: Vec<usize>) -> Self {
        let mut chain = Self::new(bones);
        chain.children = children;
        chain
    }

    /// FABRIK forward reach over this chain's solver positions.
    pub(crate) fn forward_reach(&mut self, position: Vector3<f32>) {
        let count = self.nodes.len();
        self.nodes[count - 1].solver_position = position;

        for i in (0..count.saturating_sub(1)).rev() {
            self.nodes[i].solver_position = solve_joint(
                self.nodes[i].solver_position,
                self.nodes[i + 1].solver_position,
                self.nodes[i].length,
            );
        }
    }

    /// FABRIK backward reach; a chain hanging off a parent is first
    /// re-seated at `root_length` from the handed-down position.
    pub(crate) fn backward_reach(&mut self, position: Vector3<f32>) {
        let mut position = position;
        if self.root_length > 0.0 {
            position = solve_joint(self.nodes[0].solver_position, position, self.root_length);
        }
        self.nodes[0].solver_position = position;

        for i in 1..self.nodes.len() {
            self.nodes[i].solver_position = solve_joint(
                self.nodes[i].solver_position,
                self.nodes[i - 1].solver_position,
                self.nodes[i - 1].length,
            );
        }
    }
}

pub(crate) fn node_position(chains: &[FbikChain], r: NodeRef) -> Vector3<f32> {
    chains[r.chain].nodes[r.node].solver_position
}

pub(crate) fn set_node_position(chains: &mut [FbikChain], r: NodeRef, position: Vector3<f32>) {
    chains[r.chain].nodes[r.node].solver_position = position;
}

/// Initiate every chain from the rest pose: solver positions, segment
/// lengths, child root lengths and constraint nominal distances.
pub(crate) fn initiate(chains: &mut [FbikChain], tree: &TransformTree) {
    for index in 0..chains.len() {
        refresh_geometry(chains, index, tree, false);
        chains[index].initiated = true;
    }
}

/// Per-frame pose read: animated positions plus node offsets become the
/// starting solver positions, lengths are refreshed (the animated pose may
/// have changed them), and child constraints capture nominal distances.
pub(crate) fn read_pose(chains: &mut [FbikChain], tree: &TransformTree) {
    for index in 0..chains.len() {
        if chains[index].initiated {
            refresh_geometry(chains, index, tree, true);
        }
    }
}

fn refresh_geometry(
    chains: &mut [FbikChain],
    index: usize,
    tree: &TransformTree,
    with_offsets: bool,
) {
    let count = chains[index].nodes.len();

    for i in 0..count {
        let node = &chains[index].nodes[i];
        let animated = tree.position(node.bone);
        let offset = if with_offsets { node.offset } else { Vector3::zeros() };
        chains[index].nodes[i].solver_position = animated + offset;
    }

    for i in 0..count.saturating_sub(1) {
        let a = tree.position(chains[index].nodes[i].bone);
        let b = tree.position(chains[index].nodes[i + 1].bone);
        chains[index].nodes[i].length = (a - b).norm();
    }

    let last = tree.position(chains[index].nodes[count - 1].bone);
    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        let child_root = tree.position(chains[child].nodes[0].bone);
        chains[child].root_length = (child_root - last).norm();
    }

    for c in 0..chains[index].child_constraints.len() {
        let (b1, b2) = {
            let constraint = &chains[index].child_constraints[c];
            (
                chains[constraint.node1.chain].nodes[constraint.node1.node].bone,
                chains[constraint.node2.chain].nodes[constraint.node2.node].bone,
            )
        };
        let distance = (tree.position(b1) - tree.position(b2)).norm();
        chains[index].child_constraints[c].pre_solve(distance);
    }
}

/// Reach pass, post-order: 3-node chains whose end effector wants extra
/// stretch get their base/end nudged outward by up to `reach` of the limb
/// length.
pub(crate) fn reach(chains: &mut [FbikChain], index: usize) {
    if !chains[index].initiated {
        return;
    }
    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        reach(chains, child);
    }

    if chains[index].nodes.len() != 3 {
        return;
    }

    let r = chains[index].reach * chains[index].nodes[2].effector_position_weight.clamp(0.0, 1.0);
    if r <= 0.0 {
        return;
    }

    let limb_length = chains[index].nodes[0].length + chains[index].nodes[1].length;
    let limb_direction =
        chains[index].nodes[2].solver_position - chains[index].nodes[0].solver_position;
    if limb_direction.norm_squared() < SQR_EPSILON {
        return;
    }
    let current_length = limb_direction.norm();

    let straight = (limb_direction / current_length) * limb_length;

    let mut delta = current_length / limb_length;
    delta = delta.clamp(1.0 - r, 1.0 + r);
    delta -= 1.0;
    delta = (delta + r).clamp(-1.0, 1.0);

    match chains[index].reach_smoothing {
        ReachSmoothing::None => {}
        ReachSmoothing::Exponential => delta *= delta,
        ReachSmoothing::Cubic => delta *= delta * delta,
    }

    let offset = straight * delta.clamp(0.0, current_length);
    let base_weight = 1.0 - chains[index].nodes[0].effector_position_weight;
    chains[index].nodes[0].solver_position += offset * base_weight;
    chains[index].nodes[2].solver_position += offset;
}

/// Trigonometric pre-pass, post-order: place the bend node of every 3-node
/// chain analytically to relieve tension before the iterative passes.
pub(crate) fn solve_trigonometric(chains: &mut [FbikChain], index: usize) {
    if !chains[index].initiated {
        return;
    }
    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        solve_trigonometric(chains, child);
    }

    if chains[index].nodes.len() != 3 {
        return;
    }

    let limb_length = chains[index].nodes[0].length + chains[index].nodes[1].length;
    let limb_direction =
        chains[index].nodes[2].solver_position - chains[index].nodes[0].solver_position;
    if limb_direction.norm_squared() < SQR_EPSILON {
        return;
    }

    let limb_mag = limb_direction.norm();
    let max_mag = limb_mag.min(limb_length * 0.999);
    let direction = (limb_direction / limb_mag) * max_mag;

    let bend = bend_direction(
        direction,
        max_mag,
        chains[index].nodes[0].length,
        chains[index].nodes[1].length,
    );
    chains[index].nodes[1].solver_position = chains[index].nodes[0].solver_position + bend;
}

/// Law-of-cosines bend offset oriented by a deterministic look frame.
fn bend_direction(direction: Vector3<f32>, magnitude: f32, len1: f32, len2: f32) -> Vector3<f32> {
    let sqr1 = len1 * len1;
    let sqr2 = len2 * len2;

    let x = (magnitude * magnitude + sqr1 - sqr2) / (2.0 * magnitude);
    let y = (sqr1 - x * x).max(0.0).sqrt();

    look_rotation(direction, Vector3::y()) * Vector3::new(0.0, y, x)
}

/// Stage 1 of the constraint-coupled FABRIK pass, post-order.
pub(crate) fn stage1(chains: &mut [FbikChain], index: usize) {
    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        stage1(chains, child);
    }

    // Leaf chains reach straight for their (effector-weighted) end position
    if chains[index].children.is_empty() {
        let target = {
            let nodes = &chains[index].nodes;
            nodes[nodes.len() - 1].solver_position
        };
        chains[index].forward_reach(target);
        return;
    }

    let last = {
        let nodes = &chains[index].nodes;
        nodes[nodes.len() - 1].solver_position
    };

    let mut pull_parent_sum = 0.0;
    for k in 0..chains[index].children.len() {
        pull_parent_sum += chains[chains[index].children[k]].pull;
    }

    // Settle sibling constraints before aiming at the children
    solve_child_constraints(chains, index);

    let mut centroid = last;
    if pull_parent_sum > 0.0 {
        let divisor = pull_parent_sum.max(1.0);
        for k in 0..chains[index].children.len() {
            let child = chains[index].children[k];
            let mut child_position = chains[child].nodes[0].solver_position;
            if chains[child].root_length > 0.0 {
                child_position = solve_joint(last, child_position, chains[child].root_length);
            }
            centroid += (child_position - last) * (chains[child].pull / divisor);
        }
    }

    let pin = chains[index].pin.clamp(0.0, 1.0);
    let target = centroid + (last - centroid) * pin;
    chains[index].forward_reach(target);
}

/// Stage 2 of the constraint-coupled FABRIK pass, pre-order, with up to 4
/// constraint-system settles after each backward reach.
pub(crate) fn stage2(
    chains: &mut [FbikChain],
    index: usize,
    position: Vector3<f32>,
    iterations: usize,
) {
    chains[index].backward_reach(position);

    for _ in 0..iterations.min(4) {
        solve_constraint_systems(chains, index);
    }

    let last = {
        let nodes = &chains[index].nodes;
        nodes[nodes.len() - 1].solver_position
    };
    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        stage2(chains, child, last, iterations);
    }
}

/// Settle child constraints and child-chain root distances so shoulders and
/// hips neither drift apart nor pass through each other.
pub(crate) fn solve_constraint_systems(chains: &mut [FbikChain], index: usize) {
    if chains[index].child_constraints.is_empty() {
        return;
    }

    solve_child_constraints(chains, index);

    let last_index = chains[index].nodes.len() - 1;
    let mut pull_sum = chains[index].nodes[last_index].effector_position_weight;
    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        pull_sum += chains[child].nodes[0].effector_position_weight * chains[child].pull;
    }
    let divisor = pull_sum.max(1.0);

    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        let cross_fade =
            (chains[child].nodes[0].effector_position_weight * chains[child].pull) / divisor;
        let root_length = chains[child].root_length;
        solve_linear_constraint(
            chains,
            NodeRef::new(index, last_index),
            NodeRef::new(child, 0),
            cross_fade,
            root_length,
        );
    }
}

fn solve_child_constraints(chains: &mut [FbikChain], index: usize) {
    for c in 0..chains[index].child_constraints.len() {
        let (constraint, cross_fade) = {
            let constraint = chains[index].child_constraints[c].clone();
            let cross_fade = if constraint.is_rigid() {
                // Rigid constraints split the correction by relative pull;
                // equal (or both zero) pulls mean an even 0.5/0.5 split
                let pull1 = chains[constraint.node1.chain].pull;
                let pull2 = chains[constraint.node2.chain].pull;
                0.5 + (pull1 - pull2) * 0.5
            } else {
                0.5
            };
            (constraint, cross_fade)
        };
        constraint.solve(chains, 1.0 - cross_fade);
    }
}

/// Restore `distance` between two nodes, splitting the correction by
/// `cross_fade`.
fn solve_linear_constraint(
    chains: &mut [FbikChain],
    node1: NodeRef,
    node2: NodeRef,
    cross_fade: f32,
    distance: f32,
) {
    let p1 = node_position(chains, node1);
    let p2 = node_position(chains, node2);
    let current = (p1 - p2).norm();
    if current < 1.0e-9 {
        return;
    }

    let force = 1.0 - distance / current;
    if force == 0.0 {
        return;
    }

    let offset = (p2 - p1) * force;
    set_node_position(chains, node1, p1 + offset * cross_fade);
    set_node_position(chains, node2, p2 - offset * (1.0 - cross_fade));
}
