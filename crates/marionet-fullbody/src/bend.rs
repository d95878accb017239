//! Bend constraints for 3-node limb chains.
//!
//! A 2-segment limb solved purely by position passes has an ambiguous bend
//! plane. The constraint re-derives the desired plane each solve from the
//! animated pose rotated by the solved limb delta, optionally blended toward
//! an explicit override direction and toward the effector's rotation-driven
//! plane, then swings the middle node into it around the limb axis,
//! preserving both segment lengths. The ~180 degree opposite-direction case
//! is a known singularity, mitigated only by plane continuity.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::math::{
    clamp_direction, from_to_around_axis, from_to_rotation, ortho_normalize, SQR_EPSILON,
};
use marionet_core::TransformTree;

use crate::chain::{node_position, set_node_position, FbikChain};
use crate::node::NodeRef;

/// Fixes the bend direction of one 3-node chain.
#[derive(Debug, Clone)]
pub struct BendConstraint {
    pub node1: NodeRef,
    pub node2: NodeRef,
    pub node3: NodeRef,
    /// Explicit bend direction override in world space; fully applied at
    /// `weight` 1, enabling direct bend-goal manipulation independent of
    /// effector rotation.
    pub direction: Vector3<f32>,
    /// Rotation applied to the resolved plane, fed by the end-effector's
    /// solved-vs-animated plane delta.
    pub rotation_offset: UnitQuaternion<f32>,
    pub weight: f32,
    default_local_direction: Vector3<f32>,
    default_child_direction: Vector3<f32>,
    initiated: bool,
}

impl BendConstraint {
    pub fn new(node1: NodeRef, node2: NodeRef, node3: NodeRef) -> Self {
        Self {
            node1,
            node2,
            node3,
            direction: Vector3::x(),
            rotation_offset: UnitQuaternion::identity(),
            weight: 0.0,
            default_local_direction: Vector3::zeros(),
            default_child_direction: Vector3::zeros(),
            initiated: false,
        }
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated
    }

    /// Capture the rest bend direction (orthogonal to the limb) and the
    /// rest plane normal in the first/last bones' local spaces.
    pub(crate) fn initiate(&mut self, chains: &[FbikChain], tree: &TransformTree) {
        let b1 = chains[self.node1.chain].nodes[self.node1.node].bone;
        let b2 = chains[self.node2.chain].nodes[self.node2.node].bone;
        let b3 = chains[self.node3.chain].nodes[self.node3.node].bone;

        let p1 = tree.position(b1);
        let p2 = tree.position(b2);
        let p3 = tree.position(b3);

        // Default bend direction orthogonal to the limb, then to the first
        // segment
        let mut direction = ortho_to(p3 - p1, p2 - p1);
        direction = ortho_to(p2 - p1, direction);
        self.direction = direction;

        self.default_local_direction = tree.rotation(b1).inverse() * direction;

        let limb = p3 - p1;
        let default_normal = if limb.norm_squared() > SQR_EPSILON {
            limb.normalize().cross(&direction)
        } else {
            Vector3::z()
        };
        self.default_child_direction = tree.rotation(b3).inverse() * default_normal;

        self.initiated = true;
    }

    /// Reposition the middle node into the resolved bend plane.
    pub(crate) fn solve(&mut self, chains: &mut [FbikChain], tree: &TransformTree) {
        if !self.initiated {
            return;
        }
        self.weight = self.weight.clamp(0.0, 1.0);

        let p1 = node_position(chains, self.node1);
        let p2 = node_position(chains, self.node2);
        let p3 = node_position(chains, self.node3);

        let limb = p3 - p1;
        if limb.norm_squared() < SQR_EPSILON {
            return;
        }

        let dir = self.resolve_direction(chains, tree);

        // Both tangents ortho-normalized to the limb axis
        let direction_tangent = self.ortho_to_limb(limb, self.rotation_offset * self.ortho_to_limb(limb, dir));
        let node2_tangent = self.ortho_to_limb(limb, p2 - p1);

        let from_to = from_to_around_axis(node2_tangent, direction_tangent, limb.normalize());

        let to2 = p2 - p1;
        set_node_position(chains, self.node2, p1 + from_to * to2);
    }

    /// The desired bend direction before plane projection.
    fn resolve_direction(&self, chains: &[FbikChain], tree: &TransformTree) -> Vector3<f32> {
        let normalized_override = if self.direction.norm_squared() > SQR_EPSILON {
            self.direction.normalize()
        } else {
            self.direction
        };
        if self.weight >= 1.0 {
            return normalized_override;
        }

        let b1 = chains[self.node1.chain].nodes[self.node1.node].bone;
        let b2 = chains[self.node2.chain].nodes[self.node2.node].bone;
        let b3 = chains[self.node3.chain].nodes[self.node3.node].bone;

        let p1 = node_position(chains, self.node1);
        let p3 = node_position(chains, self.node3);

        // Animated bend direction rotated by the animated-to-solved limb
        // delta
        let f = from_to_rotation(
            tree.position(b3) - tree.position(b1),
            p3 - p1,
        );
        let mut dir = f * (tree.position(b2) - tree.position(b1));

        // Effector rotation resolves the plane when it carries weight
        let node3 = &chains[self.node3.chain].nodes[self.node3.node];
        if node3.effector_rotation_weight > 0.0 {
            let effector_direction =
                -(p3 - p1).cross(&(node3.solver_rotation * self.default_child_direction));
            dir += (effector_direction - dir) * node3.effector_rotation_weight;
        }

        dir + (normalized_override - dir) * self.weight
    }

    fn ortho_to_limb(&self, limb: Vector3<f32>, tangent: Vector3<f32>) -> Vector3<f32> {
        let mut normal = limb;
        let mut tangent = tangent;
        ortho_normalize(&mut normal, &mut tangent);
        tangent
    }

    /// Clamp the lower segment against folding past the bend plane's
    /// anti-normal; operates on the bone transforms after mapping.
    pub fn limit_bend(&self, tree: &mut TransformTree, chains: &[FbikChain], solver_weight: f32) {
        if !self.initiated {
            return;
        }

        let b1 = chains[self.node1.chain].nodes[self.node1.node].bone;
        let b2 = chains[self.node2.chain].nodes[self.node2.node].bone;
        let b3 = chains[self.node3.chain].nodes[self.node3.node].bone;

        let normal_direction = tree.rotation(b1) * -self.default_local_direction;
        let axis2 = tree.position(b3) - tree.position(b2);

        let (clamped, changed) =
            clamp_direction(axis2, normal_direction, 0.505 * solver_weight, 0);
        if !changed {
            return;
        }

        let bone3_rotation = tree.rotation(b3);
        let f = from_to_rotation(axis2, clamped);
        let r2 = tree.rotation(b2);
        tree.set_rotation(b2, f * r2);
        tree.set_rotation(b3, bone3_rotation);
    }
}

/// Component of `tangent` orthogonal to `normal`, unit length.
fn ortho_to(normal: Vector3<f32>, tangent: Vector3<f32>) -> Vector3<f32> {
    let mut normal = normal;
    let mut tangent = tangent;
    ortho_normalize(&mut normal, &mut tangent);
    tangent
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use marionet_test_utils::straight_chain_along;

    fn bent_limb() -> (TransformTree, Vec<FbikChain>, BendConstraint) {
        // Limb along +Z, elbow bent toward +Y
        let (mut tree, bones) = straight_chain_along(3, 1.0, Vector3::z());
        tree.set_local_position(bones[1], Vector3::new(0.0, 0.3, 1.0).normalize());
        tree.set_local_position(
            bones[2],
            Vector3::new(0.0, -0.3, 1.0).normalize(),
        );
        let mut chains = vec![FbikChain::new(bones)];
        crate::chain::initiate(&mut chains, &tree);
        let mut constraint = BendConstraint::new(
            NodeRef::new(0, 0),
            NodeRef::new(0, 1),
            NodeRef::new(0, 2),
        );
        constraint.initiate(&chains, &tree);
        (tree, chains, constraint)
    }

    #[test]
    fn initiate_direction_is_orthogonal_to_first_segment() {
        let (_, chains, constraint) = bent_limb();
        let segment = node_position(&chains, constraint.node2)
            - node_position(&chains, constraint.node1);
        assert_relative_eq!(
            constraint.direction.dot(&segment.normalize()),
            0.0,
            epsilon = 1e-5
        );
        assert_relative_eq!(constraint.direction.norm(), 1.0, epsilon = 1e-5);
        // Elbow bends toward +Y, so the rest direction points mostly up
        assert!(constraint.direction.y > 0.9);
    }

    #[test]
    fn full_weight_override_moves_bend_into_requested_plane() {
        let (tree, mut chains, mut constraint) = bent_limb();
        constraint.weight = 1.0;
        constraint.direction = Vector3::x();

        constraint.solve(&mut chains, &tree);

        let p1 = node_position(&chains, constraint.node1);
        let p2 = node_position(&chains, constraint.node2);
        let offset = p2 - p1;
        // Bend now points toward +X instead of +Y
        assert!(offset.x > 0.1, "bend at {offset:?}");
        assert!(offset.y.abs() < 1e-3);
    }

    #[test]
    fn solve_preserves_segment_lengths() {
        let (tree, mut chains, mut constraint) = bent_limb();
        constraint.weight = 1.0;
        constraint.direction = Vector3::new(1.0, 1.0, 0.0);

        let l1 = (node_position(&chains, constraint.node2)
            - node_position(&chains, constraint.node1))
        .norm();
        let l2 = (node_position(&chains, constraint.node3)
            - node_position(&chains, constraint.node2))
        .norm();

        constraint.solve(&mut chains, &tree);

        let l1_after = (node_position(&chains, constraint.node2)
            - node_position(&chains, constraint.node1))
        .norm();
        let l2_after = (node_position(&chains, constraint.node3)
            - node_position(&chains, constraint.node2))
        .norm();
        assert_relative_eq!(l1, l1_after, epsilon = 1e-4);
        assert_relative_eq!(l2, l2_after, epsilon = 1e-4);
    }

    #[test]
    fn zero_weight_follows_animated_plane() {
        let (tree, mut chains, mut constraint) = bent_limb();
        constraint.weight = 0.0;

        // The solved pose equals the animated pose, so solving must not
        // move the bend node
        let before = node_position(&chains, constraint.node2);
        constraint.solve(&mut chains, &tree);
        let after = node_position(&chains, constraint.node2);
        assert_relative_eq!((after - before).norm(), 0.0, epsilon = 1e-4);
    }

    #[test]
    fn effector_rotation_steers_the_plane() {
        let (tree, mut chains, mut constraint) = bent_limb();
        constraint.weight = 0.0;

        // Roll the end node's target rotation a quarter turn about the limb
        // axis (+Z) with full rotation weight
        chains[0].nodes[2].effector_rotation_weight = 1.0;
        chains[0].nodes[2].solver_rotation =
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), std::f32::consts::FRAC_PI_2);

        constraint.solve(&mut chains, &tree);

        let p1 = node_position(&chains, constraint.node1);
        let p2 = node_position(&chains, constraint.node2);
        let offset = p2 - p1;
        // The bend rolled away from pure +Y
        assert!(offset.y < 0.9 * offset.norm(), "bend did not roll: {offset:?}");
    }

    #[test]
    fn limit_bend_stops_overfolding() {
        let (mut tree, chains, constraint) = bent_limb();

        // Fold the lower segment back past the anti-normal direction
        let b2 = chains[0].nodes[1].bone;
        tree.set_rotation(
            b2,
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 3.1),
        );

        let before = tree.position(chains[0].nodes[2].bone) - tree.position(b2);
        constraint.limit_bend(&mut tree, &chains, 1.0);
        let after = tree.position(chains[0].nodes[2].bone) - tree.position(b2);

        let normal_direction = tree.rotation(chains[0].nodes[0].bone)
            * -constraint.default_local_direction;
        // The clamped axis moved toward the allowed cone
        assert!(
            after.angle(&normal_direction) < before.angle(&normal_direction) - 1e-3,
            "limit did not engage"
        );
    }
}
