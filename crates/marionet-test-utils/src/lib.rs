// marionet-test-utils: deterministic RNG and canned skeletons shared by tests.

pub mod rng;
pub mod skeletons;

pub use rng::seeded_rng;
pub use skeletons::{biped_skeleton, straight_chain, straight_chain_along, BipedSkeleton};
