//! Closed-form two-bone (three-joint) IK.
//!
//! Positions the middle joint of a 2-segment limb analytically with the law
//! of cosines: given the target distance and the two fixed segment lengths,
//! the bend joint's offset along and perpendicular to the base-target axis
//! is fully determined up to the choice of bend plane, supplied as
//! `bend_normal`. Degenerate targets are clamped to 99.9% of full reach so
//! the limb never locks rotation-indeterminate straight.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::math::{look_rotation, orthogonal, slerp, SQR_EPSILON};
use marionet_core::{warning, BoneId, TransformTree};

/// One joint of the trigonometric solver with its cached rest data.
#[derive(Debug, Clone)]
pub struct TrigBone {
    pub bone: BoneId,
    /// Squared segment length to the next joint, refreshed pre-solve.
    sqr_mag: f32,
    /// Maps the rest look-at frame back onto the bone's rest rotation.
    target_to_local: UnitQuaternion<f32>,
}

impl TrigBone {
    fn new(bone: BoneId) -> Self {
        Self {
            bone,
            sqr_mag: 0.0,
            target_to_local: UnitQuaternion::identity(),
        }
    }

    /// Capture the rest relationship between this bone's rotation and the
    /// look-at frame toward `child_position` with `bend_normal` up.
    fn initiate(
        &mut self,
        tree: &TransformTree,
        child_position: Vector3<f32>,
        bend_normal: Vector3<f32>,
    ) {
        let position = tree.position(self.bone);
        let default_target = look_rotation(child_position - position, bend_normal);
        self.target_to_local = default_target.inverse() * tree.rotation(self.bone);
    }

    /// The bone rotation that realizes a new look-at frame.
    fn rotation_for(
        &self,
        direction: Vector3<f32>,
        bend_normal: Vector3<f32>,
    ) -> UnitQuaternion<f32> {
        look_rotation(direction, bend_normal) * self.target_to_local
    }
}

/// Analytic 3-joint solver.
#[derive(Debug, Clone)]
pub struct TrigonometricSolver {
    pub bone1: TrigBone,
    pub bone2: TrigBone,
    pub bone3: TrigBone,
    /// World-space position target for the last bone.
    pub ik_position: Vector3<f32>,
    /// World-space rotation target for the last bone.
    pub ik_rotation: UnitQuaternion<f32>,
    pub ik_position_weight: f32,
    pub ik_rotation_weight: f32,
    /// Normal of the bend plane; the middle joint is displaced along
    /// `direction x bend_normal`.
    pub bend_normal: Vector3<f32>,
    initiated: bool,
}

impl TrigonometricSolver {
    pub fn new(bone1: BoneId, bone2: BoneId, bone3: BoneId) -> Self {
        Self {
            bone1: TrigBone::new(bone1),
            bone2: TrigBone::new(bone2),
            bone3: TrigBone::new(bone3),
            ik_position: Vector3::zeros(),
            ik_rotation: UnitQuaternion::identity(),
            ik_position_weight: 1.0,
            ik_rotation_weight: 1.0,
            bend_normal: Vector3::x(),
            initiated: false,
        }
    }

    pub fn is_initiated(&self) -> bool {
        self.initiated
    }

    /// Non-throwing structural pre-flight check.
    pub fn is_valid(&self, tree: &TransformTree, log: bool) -> bool {
        let ids = [self.bone1.bone, self.bone2.bone, self.bone3.bone];
        if ids[0] == ids[1] || ids[1] == ids[2] || ids[0] == ids[2] {
            if log {
                warning::log("Trigonometric solver bones are not distinct.");
            }
            return false;
        }
        for id in ids {
            if !tree.contains(id) {
                if log {
                    warning::log("Trigonometric solver references a bone outside the tree.");
                }
                return false;
            }
        }
        let l1 = (tree.position(ids[1]) - tree.position(ids[0])).norm_squared();
        let l2 = (tree.position(ids[2]) - tree.position(ids[1])).norm_squared();
        if l1 < SQR_EPSILON || l2 < SQR_EPSILON {
            if log {
                warning::log("Trigonometric solver has a zero-length segment.");
            }
            return false;
        }
        true
    }

    /// Capture the rest pose. Picks the current bend plane when the chain
    /// is not straight; otherwise keeps the configured `bend_normal`.
    pub fn initiate(&mut self, tree: &TransformTree) {
        self.ik_position = tree.position(self.bone3.bone);
        self.ik_rotation = tree.rotation(self.bone3.bone);
        self.set_bend_plane_to_current(tree);

        let p2 = tree.position(self.bone2.bone);
        let p3 = tree.position(self.bone3.bone);
        self.bone1.initiate(tree, p2, self.bend_normal);
        self.bone2.initiate(tree, p3, self.bend_normal);

        self.initiated = true;
    }

    /// Use the plane of the current (animated) pose as the bend plane.
    pub fn set_bend_plane_to_current(&mut self, tree: &TransformTree) {
        let p1 = tree.position(self.bone1.bone);
        let p2 = tree.position(self.bone2.bone);
        let p3 = tree.position(self.bone3.bone);
        let normal = (p2 - p1).cross(&(p3 - p2));
        if normal.norm_squared() > SQR_EPSILON {
            self.bend_normal = normal;
        }
    }

    /// Aim the bend plane so the middle joint points toward `goal`.
    pub fn set_bend_goal_position(
        &mut self,
        tree: &TransformTree,
        goal: Vector3<f32>,
        weight: f32,
    ) {
        let p1 = tree.position(self.bone1.bone);
        let normal = (goal - p1).cross(&(self.ik_position - p1));
        if normal.norm_squared() > SQR_EPSILON {
            self.bend_normal = self.bend_normal.lerp(&normal, weight.clamp(0.0, 1.0));
        }
    }

    /// Run one solve.
    pub fn update(&mut self, tree: &mut TransformTree) {
        if !self.initiated {
            warning::log("Trying to update an uninitiated trigonometric solver.");
            return;
        }
        self.ik_position_weight = self.ik_position_weight.clamp(0.0, 1.0);
        self.ik_rotation_weight = self.ik_rotation_weight.clamp(0.0, 1.0);

        if self.ik_position_weight > 0.0 {
            let p1 = tree.position(self.bone1.bone);
            let p2 = tree.position(self.bone2.bone);
            let p3 = tree.position(self.bone3.bone);
            self.bone1.sqr_mag = (p2 - p1).norm_squared();
            self.bone2.sqr_mag = (p3 - p2).norm_squared();

            if self.bend_normal.norm_squared() < SQR_EPSILON {
                warning::log("Trigonometric solver bend normal is zero.");
                self.bend_normal = orthogonal(self.ik_position - p1);
            }

            let weighted_target = p3 + (self.ik_position - p3) * self.ik_position_weight;
            let direction = weighted_target - p1;
            let magnitude = direction.norm();
            if magnitude > 1.0e-6 {
                // Clamp inside the reachable annulus, never fully straight
                let length1 = self.bone1.sqr_mag.sqrt();
                let length2 = self.bone2.sqr_mag.sqrt();
                let clamped = magnitude.min((length1 + length2) * 0.999);
                let direction = direction * (clamped / magnitude);

                let bend = bend_direction(
                    direction,
                    self.bend_normal,
                    self.bone1.sqr_mag,
                    self.bone2.sqr_mag,
                );

                tree.set_rotation(
                    self.bone1.bone,
                    self.bone1.rotation_for(bend, self.bend_normal),
                );
                // bone2's world position moved with bone1
                let p2 = tree.position(self.bone2.bone);
                tree.set_rotation(
                    self.bone2.bone,
                    self.bone2.rotation_for(p1 + direction - p2, self.bend_normal),
                );
            }
        }

        if self.ik_rotation_weight > 0.0 {
            let r3 = tree.rotation(self.bone3.bone);
            tree.set_rotation(
                self.bone3.bone,
                slerp(r3, self.ik_rotation, self.ik_rotation_weight),
            );
        }
    }
}

/// Law-of-cosines offset of the bend joint from the base.
///
/// `direction` is the (already clamped) base-to-target vector; the result
/// has length `sqrt(sqr_mag1)` and lies in the plane with normal
/// `bend_normal`.
fn bend_direction(
    direction: Vector3<f32>,
    bend_normal: Vector3<f32>,
    sqr_mag1: f32,
    sqr_mag2: f32,
) -> Vector3<f32> {
    let magnitude = direction.norm();
    let x = (magnitude * magnitude + sqr_mag1 - sqr_mag2) / (2.0 * magnitude);
    let y = (sqr_mag1 - x * x).max(0.0).sqrt();

    let dir_n = direction / magnitude;
    let mut perp = dir_n.cross(&bend_normal);
    if perp.norm_squared() < SQR_EPSILON {
        perp = orthogonal(dir_n);
    }
    let perp = perp.normalize();

    dir_n * x + perp * y
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use marionet_test_utils::straight_chain_along;

    fn limb() -> (TransformTree, Vec<BoneId>) {
        // Slightly pre-bent out of +Z so the bend plane is defined
        let (mut tree, bones) = straight_chain_along(3, 1.0, Vector3::z());
        tree.set_local_position(bones[1], Vector3::new(0.0, 0.05, 1.0).normalize());
        (tree, bones)
    }

    #[test]
    fn reaches_target_at_1_8_along_z() {
        let (mut tree, bones) = limb();
        let mut solver = TrigonometricSolver::new(bones[0], bones[1], bones[2]);
        solver.initiate(&tree);

        solver.ik_position = Vector3::new(0.0, 0.0, 1.8);
        solver.update(&mut tree);

        // End effector lands at exactly distance 1.8 from the base
        let base = tree.position(bones[0]);
        let end = tree.position(bones[2]);
        assert_relative_eq!((end - base).norm(), 1.8, epsilon = 1e-3);

        // Bend joint close to the base-target line, small lateral offset
        let mid = tree.position(bones[1]);
        let along = (mid - base).dot(&Vector3::z());
        let lateral = (mid - base - Vector3::z() * along).norm();
        assert!(lateral < 0.5, "lateral {lateral}");
        assert!(lateral > 1e-4, "limb should not be perfectly straight");
    }

    #[test]
    fn segment_lengths_preserved() {
        let (mut tree, bones) = limb();
        let mut solver = TrigonometricSolver::new(bones[0], bones[1], bones[2]);
        solver.initiate(&tree);

        solver.ik_position = Vector3::new(0.6, 0.4, 1.1);
        solver.update(&mut tree);

        let d1 = (tree.position(bones[1]) - tree.position(bones[0])).norm();
        let d2 = (tree.position(bones[2]) - tree.position(bones[1])).norm();
        assert_relative_eq!(d1, 1.0, epsilon = 1e-3);
        assert_relative_eq!(d2, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn over_reach_clamps_to_999_permille() {
        let (mut tree, bones) = limb();
        let mut solver = TrigonometricSolver::new(bones[0], bones[1], bones[2]);
        solver.initiate(&tree);

        solver.ik_position = Vector3::new(0.0, 0.0, 10.0);
        solver.update(&mut tree);

        let base = tree.position(bones[0]);
        let end = tree.position(bones[2]);
        assert_relative_eq!((end - base).norm(), 2.0 * 0.999, epsilon = 2e-3);
    }

    #[test]
    fn bend_stays_in_configured_plane() {
        let (mut tree, bones) = limb();
        let mut solver = TrigonometricSolver::new(bones[0], bones[1], bones[2]);
        solver.initiate(&tree);
        solver.bend_normal = Vector3::x();

        solver.ik_position = Vector3::new(0.0, 0.0, 1.2);
        solver.update(&mut tree);

        // Middle joint lies in the plane orthogonal to the bend normal
        let base = tree.position(bones[0]);
        let mid = tree.position(bones[1]);
        assert_relative_eq!((mid - base).dot(&Vector3::x()), 0.0, epsilon = 1e-3);
    }

    #[test]
    fn rotation_weight_blends_end_bone() {
        let (mut tree, bones) = limb();
        let mut solver = TrigonometricSolver::new(bones[0], bones[1], bones[2]);
        solver.initiate(&tree);

        let target_rotation =
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), std::f32::consts::FRAC_PI_2);
        solver.ik_rotation = target_rotation;
        solver.ik_rotation_weight = 1.0;
        solver.ik_position_weight = 0.0;
        solver.update(&mut tree);

        assert!(marionet_core::math::quat_approx_eq(
            tree.rotation(bones[2]),
            target_rotation,
            1e-4
        ));
    }

    #[test]
    fn set_bend_goal_tilts_the_plane() {
        let (mut tree, bones) = limb();
        let mut solver = TrigonometricSolver::new(bones[0], bones[1], bones[2]);
        solver.initiate(&tree);
        solver.ik_position = Vector3::new(0.0, 0.0, 1.5);

        // Goal to the +X side: the middle joint should end up with x > 0
        solver.set_bend_goal_position(&tree, Vector3::new(2.0, 0.0, 0.8), 1.0);
        solver.update(&mut tree);

        let mid = tree.position(bones[1]);
        assert!(mid.x > 0.05, "bend joint x {}", mid.x);
    }

    #[test]
    fn update_before_initiate_is_noop() {
        let (mut tree, bones) = limb();
        let mut solver = TrigonometricSolver::new(bones[0], bones[1], bones[2]);
        let before = tree.position(bones[2]);
        solver.ik_position = Vector3::new(1.0, 1.0, 1.0);
        solver.update(&mut tree);
        assert_relative_eq!((tree.position(bones[2]) - before).norm(), 0.0);
    }
}
