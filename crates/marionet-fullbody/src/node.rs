//! Nodes of the full-body chain tree.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::BoneId;

/// Address of a node inside a solver's flat chain array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRef {
    pub chain: usize,
    pub node: usize,
}

impl NodeRef {
    pub const fn new(chain: usize, node: usize) -> Self {
        Self { chain, node }
    }
}

/// One joint of a full-body chain.
///
/// `solver_position` and `offset` are scratch state owned by the solver
/// during its update; `offset` is reset to zero after every write-back.
/// The effector weights are derived from the owning effector and recomputed
/// every solve.
#[derive(Debug, Clone)]
pub struct Node {
    pub bone: BoneId,
    /// Distance to the next node in the chain, 0 for the last one.
    pub length: f32,
    pub solver_position: Vector3<f32>,
    pub solver_rotation: UnitQuaternion<f32>,
    /// Transient per-frame positional nudge, applied on pose read.
    pub offset: Vector3<f32>,
    pub effector_position_weight: f32,
    pub effector_rotation_weight: f32,
}

impl Node {
    pub fn new(bone: BoneId) -> Self {
        Self {
            bone,
            length: 0.0,
            solver_position: Vector3::zeros(),
            solver_rotation: UnitQuaternion::identity(),
            offset: Vector3::zeros(),
            effector_position_weight: 0.0,
            effector_rotation_weight: 0.0,
        }
    }
}
