//! Arena-based transform hierarchy.
//!
//! Stands in for the host engine's scene graph: solvers read the animated
//! pose from a [`TransformTree`] before solving and write results back into
//! it. Bones are referenced by [`BoneId`] index, parent links are plain
//! indices, and world transforms are derived on demand by walking the parent
//! chain, so writing a bone implicitly moves its descendants.

use nalgebra::{Isometry3, Point3, Translation3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

/// Handle to a bone in a [`TransformTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BoneId(pub usize);

#[derive(Debug, Clone)]
struct BoneData {
    name: String,
    parent: Option<BoneId>,
    local_position: Vector3<f32>,
    local_rotation: UnitQuaternion<f32>,
}

/// Flat storage of a bone hierarchy with local-space transforms.
///
/// Bones must be added parents-first; `add_bone` panics on a forward
/// reference. All world-space accessors compose isometries up the parent
/// chain, world-space setters solve back into local space.
#[derive(Debug, Clone, Default)]
pub struct TransformTree {
    bones: Vec<BoneData>,
}

impl TransformTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bone with no parent.
    pub fn add_root(
        &mut self,
        name: impl Into<String>,
        position: Vector3<f32>,
        rotation: UnitQuaternion<f32>,
    ) -> BoneId {
        self.bones.push(BoneData {
            name: name.into(),
            parent: None,
            local_position: position,
            local_rotation: rotation,
        });
        BoneId(self.bones.len() - 1)
    }

    /// Add a bone under `parent` with a local-space transform.
    ///
    /// # Panics
    ///
    /// Panics if `parent` has not been added yet.
    pub fn add_bone(
        &mut self,
        name: impl Into<String>,
        parent: BoneId,
        local_position: Vector3<f32>,
        local_rotation: UnitQuaternion<f32>,
    ) -> BoneId {
        assert!(parent.0 < self.bones.len(), "parent bone must exist");
        self.bones.push(BoneData {
            name: name.into(),
            parent: Some(parent),
            local_position,
            local_rotation,
        });
        BoneId(self.bones.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    pub fn contains(&self, bone: BoneId) -> bool {
        bone.0 < self.bones.len()
    }

    pub fn name(&self, bone: BoneId) -> &str {
        &self.bones[bone.0].name
    }

    pub fn parent(&self, bone: BoneId) -> Option<BoneId> {
        self.bones[bone.0].parent
    }

    // ---- local space ----

    pub fn local_position(&self, bone: BoneId) -> Vector3<f32> {
        self.bones[bone.0].local_position
    }

    pub fn local_rotation(&self, bone: BoneId) -> UnitQuaternion<f32> {
        self.bones[bone.0].local_rotation
    }

    pub fn set_local_position(&mut self, bone: BoneId, position: Vector3<f32>) {
        self.bones[bone.0].local_position = position;
    }

    pub fn set_local_rotation(&mut self, bone: BoneId, rotation: UnitQuaternion<f32>) {
        self.bones[bone.0].local_rotation = rotation;
    }

    // ---- world space ----

    /// World-space isometry of `bone`.
    pub fn world_isometry(&self, bone: BoneId) -> Isometry3<f32> {
        let data = &self.bones[bone.0];
        let local = Isometry3::from_parts(
            Translation3::from(data.local_position),
            data.local_rotation,
        );
        match data.parent {
            Some(parent) => self.world_isometry(parent) * local,
            None => local,
        }
    }

    pub fn position(&self, bone: BoneId) -> Vector3<f32> {
        self.world_isometry(bone).translation.vector
    }

    pub fn rotation(&self, bone: BoneId) -> UnitQuaternion<f32> {
        self.world_isometry(bone).rotation
    }

    /// Set the world-space position of `bone`, leaving its rotation alone.
    pub fn set_position(&mut self, bone: BoneId, position: Vector3<f32>) {
        let local = match self.bones[bone.0].parent {
            Some(parent) => self
                .world_isometry(parent)
                .inverse_transform_point(&Point3::from(position))
                .coords,
            None => position,
        };
        self.bones[bone.0].local_position = local;
    }

    /// Set the world-space rotation of `bone`, leaving its position alone.
    pub fn set_rotation(&mut self, bone: BoneId, rotation: UnitQuaternion<f32>) {
        let local = match self.bones[bone.0].parent {
            Some(parent) => self.world_isometry(parent).rotation.inverse() * rotation,
            None => rotation,
        };
        self.bones[bone.0].local_rotation = local;
    }

    /// Translate `bone` in world space.
    pub fn translate(&mut self, bone: BoneId, offset: Vector3<f32>) {
        let position = self.position(bone) + offset;
        self.set_position(bone, position);
    }
}
