//! Effectors: world-space targets pulling nodes of the chain tree.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::math::{look_rotation, slerp};
use marionet_core::{warning, TransformTree};

use crate::chain::FbikChain;
use crate::node::NodeRef;

/// Additive offsets larger than this are assumed to be runaway accumulation
/// from a caller adding to `position_offset` without letting the solver
/// reset it.
const RUNAWAY_OFFSET_SQR: f32 = 1.0e10;

/// A world-space position/rotation target with independent weights, pulling
/// one node of the full-body tree.
#[derive(Debug)]
pub struct Effector {
    /// The node this effector drives.
    pub node: NodeRef,
    /// Target position in world space.
    pub position: Vector3<f32>,
    /// Target rotation in world space.
    pub rotation: UnitQuaternion<f32>,
    pub position_weight: f32,
    pub rotation_weight: f32,
    /// Additive world-space offset. Callers compose forces by adding (never
    /// setting) during a frame; the solver resets it to zero after every
    /// completed write-back.
    pub position_offset: Vector3<f32>,
    /// If false, `child_nodes` are ignored.
    pub effect_child_nodes: bool,
    /// Keeps an end-effector's node riding along with the plane spanned by
    /// the three plane nodes when not fully pinned.
    pub maintain_relative_position_weight: f32,
    /// Nodes moved rigidly with this effector (e.g. thighs with the body).
    pub child_nodes: Vec<NodeRef>,
    /// Rotation delta between the solved and animated reference planes,
    /// produced during the solve for bend constraints to consume.
    pub plane_rotation_offset: UnitQuaternion<f32>,
    plane_nodes: Option<[NodeRef; 3]>,
    pos_w: f32,
    rot_w: f32,
    local_positions: Vec<Vector3<f32>>,
    animated_plane_rotation: UnitQuaternion<f32>,
}

impl Effector {
    pub fn new(node: NodeRef) -> Self {
        Self {
            node,
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            position_weight: 0.0,
            rotation_weight: 0.0,
            position_offset: Vector3::zeros(),
            effect_child_nodes: true,
            maintain_relative_position_weight: 0.0,
            child_nodes: Vec::new(),
            plane_rotation_offset: UnitQuaternion::identity(),
            plane_nodes: None,
            pos_w: 0.0,
            rot_w: 0.0,
            local_positions: Vec::new(),
            animated_plane_rotation: UnitQuaternion::identity(),
        }
    }

    /// An end-effector: the last node of a limb chain, with three reference
    /// nodes spanning its parent plane.
    pub fn end_effector(node: NodeRef, plane_nodes: [NodeRef; 3]) -> Self {
        let mut effector = Self::new(node);
        effector.plane_nodes = Some(plane_nodes);
        effector
    }

    pub fn with_child_nodes(node: NodeRef, child_nodes: Vec<NodeRef>) -> Self {
        let mut effector = Self::new(node);
        effector.child_nodes = child_nodes;
        effector
    }

    /// Whether this is the last effector of a node chain.
    pub fn is_end_effector(&self) -> bool {
        self.plane_nodes.is_some()
    }

    /// Pin the effector to the current animated pose of its bone.
    pub fn pin_to_bone(
        &mut self,
        chains: &[FbikChain],
        tree: &TransformTree,
        position_weight: f32,
        rotation_weight: f32,
    ) {
        let bone = chains[self.node.chain].nodes[self.node.node].bone;
        self.position = tree.position(bone);
        self.position_weight = position_weight.clamp(0.0, 1.0);
        self.rotation = tree.rotation(bone);
        self.rotation_weight = rotation_weight.clamp(0.0, 1.0);
    }

    /// Capture targets from the rest pose and size internal buffers.
    pub(crate) fn initiate(&mut self, chains: &[FbikChain], tree: &TransformTree) {
        let bone = chains[self.node.chain].nodes[self.node.node].bone;
        self.position = tree.position(bone);
        self.rotation = tree.rotation(bone);
        self.local_positions = vec![Vector3::zeros(); self.child_nodes.len()];
    }

    /// Compute combined weights, sanity-check caller input and apply the
    /// additive offset into the node (and child node) offsets.
    pub(crate) fn on_pre_solve(
        &mut self,
        chains: &mut [FbikChain],
        tree: &TransformTree,
        solver_weight: f32,
    ) {
        self.position_weight = self.position_weight.clamp(0.0, 1.0);
        self.rotation_weight = self.rotation_weight.clamp(0.0, 1.0);
        self.maintain_relative_position_weight =
            self.maintain_relative_position_weight.clamp(0.0, 1.0);

        if self.local_positions.len() != self.child_nodes.len() {
            self.local_positions.resize(self.child_nodes.len(), Vector3::zeros());
        }

        // Squared solver weight biases smoothly toward full influence
        self.pos_w = self.position_weight * solver_weight * solver_weight;
        self.rot_w = self.rotation_weight * solver_weight;

        {
            let node = &mut chains[self.node.chain].nodes[self.node.node];
            node.effector_position_weight = self.pos_w;
            node.effector_rotation_weight = self.rot_w;
            node.solver_rotation = self.rotation;
        }

        // Defensive caller-input checks: warn once, continue with the safest
        // fallback instead of letting NaN reach the pose
        if !self.position_offset.iter().all(|v| v.is_finite()) {
            warning::log("Effector position_offset contains NaN or Inf, ignoring it this frame.");
            self.position_offset = Vector3::zeros();
        }
        if self.position_offset.norm_squared() > RUNAWAY_OFFSET_SQR {
            warning::log(
                "Extremely large additive effector position_offset; make sure you are not \
                 accumulating into it every frame. Ignoring it this frame.",
            );
            self.position_offset = Vector3::zeros();
        }

        let node_bone = chains[self.node.chain].nodes[self.node.node].bone;
        chains[self.node.chain].nodes[self.node.node].offset += self.position_offset;

        if self.effect_child_nodes {
            let node_position = tree.position(node_bone);
            for (i, &child) in self.child_nodes.iter().enumerate() {
                let child_bone = chains[child.chain].nodes[child.node].bone;
                self.local_positions[i] = tree.position(child_bone) - node_position;
                chains[child.chain].nodes[child.node].offset += self.position_offset;
            }
        }

        if let Some(plane) = self.plane_nodes {
            if self.maintain_relative_position_weight > 0.0 {
                let p1 = tree.position(chains[plane[0].chain].nodes[plane[0].node].bone);
                let p2 = tree.position(chains[plane[1].chain].nodes[plane[1].node].bone);
                let p3 = tree.position(chains[plane[2].chain].nodes[plane[2].node].bone);
                self.animated_plane_rotation = look_rotation(p2 - p1, p3 - p1);
            }
        }
    }

    /// Pull the node's solver position toward the target.
    pub(crate) fn update(&mut self, chains: &mut [FbikChain], tree: &TransformTree) {
        if !self.position.iter().all(|v| v.is_finite()) {
            warning::log("Effector position contains NaN or Inf, pinning to the bone this frame.");
            let bone = chains[self.node.chain].nodes[self.node.node].bone;
            self.position = tree.position(bone);
        }

        let start = self.start_position(chains, tree);
        let node = &mut chains[self.node.chain].nodes[self.node.node];
        node.solver_position = start + (self.position - start) * self.pos_w;
        let node_position = node.solver_position;

        if !self.effect_child_nodes {
            return;
        }
        for (i, &child) in self.child_nodes.iter().enumerate() {
            let child_node = &mut chains[child.chain].nodes[child.node];
            let carried = node_position + self.local_positions[i];
            child_node.solver_position +=
                (carried - child_node.solver_position) * self.pos_w;
        }
    }

    /// Caller contract: the additive offset is consumed exactly once per
    /// completed solve.
    pub(crate) fn on_post_write(&mut self) {
        self.position_offset = Vector3::zeros();
    }

    /// The position the solve starts pulling from.
    ///
    /// Non-end-effectors are always free (their current solver position).
    /// End-effectors start from the animated position, optionally blended
    /// with a reconstruction that rides the plane nodes' rotation so the
    /// effector follows body movement when not fully pinned.
    fn start_position(&mut self, chains: &[FbikChain], tree: &TransformTree) -> Vector3<f32> {
        self.plane_rotation_offset = UnitQuaternion::identity();

        let node = &chains[self.node.chain].nodes[self.node.node];
        let Some(plane) = self.plane_nodes else {
            return node.solver_position;
        };

        let animated = tree.position(node.bone) + node.offset;
        if self.maintain_relative_position_weight <= 0.0 {
            return animated;
        }

        let plane1_bone = chains[plane[0].chain].nodes[plane[0].node].bone;
        let direction = tree.position(node.bone) - tree.position(plane1_bone);

        let solver_plane = self.solver_plane_rotation(chains, plane);
        self.plane_rotation_offset = solver_plane * self.animated_plane_rotation.inverse();

        let ridden = crate::chain::node_position(chains, plane[0])
            + self.plane_rotation_offset * direction;

        self.plane_rotation_offset =
            slerp(self.plane_rotation_offset, UnitQuaternion::identity(), self.pos_w);
        self.plane_rotation_offset = slerp(
            self.plane_rotation_offset,
            UnitQuaternion::identity(),
            1.0 - self.maintain_relative_position_weight,
        );

        let target = ridden + node.offset;
        animated + (target - animated) * self.maintain_relative_position_weight
    }

    fn solver_plane_rotation(
        &self,
        chains: &[FbikChain],
        plane: [NodeRef; 3],
    ) -> UnitQuaternion<f32> {
        let p1 = crate::chain::node_position(chains, plane[0]);
        let p2 = crate::chain::node_position(chains, plane[1]);
        let p3 = crate::chain::node_position(chains, plane[2]);
        look_rotation(p2 - p1, p3 - p1)
    }
}
