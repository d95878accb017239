// marionet-core: Transform arena, rotation math, errors and warnings for marionet IK.

pub mod error;
pub mod math;
pub mod transform;
pub mod warning;

pub use error::{MarionetError, ValidationError};
pub use transform::{BoneId, TransformTree};
