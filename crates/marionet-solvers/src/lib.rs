//! Chain IK solvers.
//!
//! Heuristic solvers ([`CcdSolver`], [`FabrikSolver`]) iterate a single bone
//! chain toward a world-space target; [`FabrikRootSolver`] composes multiple
//! FABRIK chains into a jointly converging tree; [`TrigonometricSolver`] is
//! the closed-form two-bone solve and [`LimbSolver`] wraps it with
//! bend-direction policies.
//!
//! # Architecture
//!
//! ```text
//! TransformTree ──read──► solver state ──iterate──► TransformTree
//! ```
//!
//! Every solver follows the same lifecycle: `initiate` once from the rest
//! pose (captures lengths, axes and default local transforms), `is_valid`
//! as a non-throwing pre-flight check, then `update` once per simulation
//! step. Re-chaining at runtime requires an explicit `set_chain` +
//! `initiate`; hierarchy changes are never observed implicitly.

pub mod bone;
pub mod ccd;
pub mod fabrik;
pub mod fabrik_root;
pub mod heuristic;
pub mod limb;
pub mod trigonometric;

pub use bone::Bone;
pub use ccd::CcdSolver;
pub use fabrik::{solve_joint, FabrikSolver};
pub use fabrik_root::{FabrikRootChain, FabrikRootSolver};
pub use heuristic::HeuristicChain;
pub use limb::{BendModifier, LimbSolver, Side};
pub use trigonometric::TrigonometricSolver;
