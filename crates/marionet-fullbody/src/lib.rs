//! Multi-effector full-body IK.
//!
//! The solver works on a tree of low-resolution node chains (a body chain
//! with limb chains as children) rather than the full skeleton. Effectors
//! pull nodes toward world-space targets, child constraints keep sibling
//! chain roots (shoulders, hips) at their nominal distance, and bend
//! constraints fix the bend plane of each 3-node limb after the positional
//! passes.
//!
//! Solved node positions are exposed for an external mapping layer to copy
//! onto the full-resolution skeleton; this crate never writes limb bone
//! transforms itself.
//!
//! Chain parent/child relationships are indices into the solver's flat
//! chain array ([`NodeRef`] addresses a node as chain index + node index);
//! no chain ever owns a reference to another.

pub mod bend;
pub mod biped;
pub mod chain;
pub mod effector;
pub mod node;
pub mod solver;

pub use bend::BendConstraint;
pub use biped::{BipedChain, BipedEffector, BipedReferences, BipedRig};
pub use chain::{ChildConstraint, FbikChain, ReachSmoothing};
pub use effector::Effector;
pub use node::{Node, NodeRef};
pub use solver::FullBodySolver;
