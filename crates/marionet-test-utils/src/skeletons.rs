//! Canned skeletons for solver tests.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::{BoneId, TransformTree};

/// A straight chain of `count` bones spaced `spacing` apart along +Y.
///
/// Returns the tree and the bone handles root-first.
pub fn straight_chain(count: usize, spacing: f32) -> (TransformTree, Vec<BoneId>) {
    straight_chain_along(count, spacing, Vector3::y())
}

/// A straight chain of `count` bones spaced `spacing` apart along `direction`.
pub fn straight_chain_along(
    count: usize,
    spacing: f32,
    direction: Vector3<f32>,
) -> (TransformTree, Vec<BoneId>) {
    assert!(count > 0);
    let step = direction.normalize() * spacing;

    let mut tree = TransformTree::new();
    let mut bones = Vec::with_capacity(count);

    let root = tree.add_root("bone0", Vector3::zeros(), UnitQuaternion::identity());
    bones.push(root);
    for i in 1..count {
        let bone = tree.add_bone(
            format!("bone{i}"),
            bones[i - 1],
            step,
            UnitQuaternion::identity(),
        );
        bones.push(bone);
    }
    (tree, bones)
}

/// Bone handles of [`biped_skeleton`].
#[derive(Debug, Clone, Copy)]
pub struct BipedSkeleton {
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

/// A minimal humanoid: pelvis at (0, 1, 0), arms out to the sides at
/// shoulder height, legs straight down. All limb segments are 0.4 long.
pub fn biped_skeleton() -> (TransformTree, BipedSkeleton) {
    let mut tree = TransformTree::new();
    let identity = UnitQuaternion::identity();

    let pelvis = tree.add_root("pelvis", Vector3::new(0.0, 1.0, 0.0), identity);

    let left_upper_arm =
        tree.add_bone("left_upper_arm", pelvis, Vector3::new(-0.2, 0.5, 0.0), identity);
    let left_forearm =
        tree.add_bone("left_forearm", left_upper_arm, Vector3::new(-0.4, 0.0, 0.0), identity);
    let left_hand =
        tree.add_bone("left_hand", left_forearm, Vector3::new(-0.4, 0.0, 0.0), identity);

    let right_upper_arm =
        tree.add_bone("right_upper_arm", pelvis, Vector3::new(0.2, 0.5, 0.0), identity);
    let right_forearm =
        tree.add_bone("right_forearm", right_upper_arm, Vector3::new(0.4, 0.0, 0.0), identity);
    let right_hand =
        tree.add_bone("right_hand", right_forearm, Vector3::new(0.4, 0.0, 0.0), identity);

    let left_thigh =
        tree.add_bone("left_thigh", pelvis, Vector3::new(-0.15, -0.1, 0.0), identity);
    let left_calf =
        tree.add_bone("left_calf", left_thigh, Vector3::new(0.0, -0.4, 0.0), identity);
    let left_foot =
        tree.add_bone("left_foot", left_calf, Vector3::new(0.0, -0.4, 0.0), identity);

    let right_thigh =
        tree.add_bone("right_thigh", pelvis, Vector3::new(0.15, -0.1, 0.0), identity);
    let right_calf =
        tree.add_bone("right_calf", right_thigh, Vector3::new(0.0, -0.4, 0.0), identity);
    let right_foot =
        tree.add_bone("right_foot", right_calf, Vector3::new(0.0, -0.4, 0.0), identity);

    (
        tree,
        BipedSkeleton {
            pelvis,
            left_upper_arm,
            left_forearm,
            left_hand,
            right_upper_arm,
            right_forearm,
            right_hand,
            left_thigh,
            left_calf,
            left_foot,
            right_thigh,
            right_calf,
            right_foot,
        },
    )
}
