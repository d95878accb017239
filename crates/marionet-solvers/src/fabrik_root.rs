//! Multi-branch FABRIK trees.
//!
//! Composes several [`FabrikSolver`] chains into a tree. Parent/child
//! relationships are plain indices into a flat chain array, never pointers
//! between chains. Stage 1 runs post-order (children solve fully before
//! their parent aims at the pull-weighted centroid of their bases), stage 2
//! runs pre-order (each chain reaches backward from the position its parent
//! hands down). Alternating the two stages for a few rounds is what lets
//! independent branches sharing a structural root converge jointly instead
//! of fighting each other.

use nalgebra::Vector3;

use marionet_core::{warning, BoneId, TransformTree, ValidationError};

use crate::fabrik::FabrikSolver;

/// One branch of the tree: a FABRIK chain plus its coupling weights.
#[derive(Debug, Clone)]
pub struct FabrikRootChain {
    pub solver: FabrikSolver,
    /// How strongly this chain drags its parent toward its own base.
    pub pull: f32,
    /// Resistance to being dragged by child chains; 1 ignores them.
    pub pin: f32,
    /// Indices of child chains in the root solver's flat chain array.
    pub children: Vec<usize>,
}

impl FabrikRootChain {
    pub fn new(solver: FabrikSolver) -> Self {
        Self {
            solver,
            pull: 1.0,
            pin: 1.0,
            children: Vec::new(),
        }
    }

    pub fn with_children(solver: FabrikSolver, children: Vec<usize>) -> Self {
        Self {
            solver,
            pull: 1.0,
            pin: 1.0,
            children,
        }
    }
}

/// IK system for multiple branched FABRIK chains.
#[derive(Debug, Clone)]
pub struct FabrikRootSolver {
    /// Rounds of the stage-1/stage-2 alternation per update.
    pub iterations: usize,
    /// The weight of all chains being pinned to the root position.
    pub root_pin: f32,
    /// Master weight pushed into every chain each update.
    pub ik_position_weight: f32,
    pub chains: Vec<FabrikRootChain>,
    root: BoneId,
    is_root: Vec<bool>,
    zero_weight_applied: bool,
    initiated: bool,
}

impl FabrikRootSolver {
    pub fn new(chains: Vec<FabrikRootChain>) -> Self {
        Self {
            iterations: 4,
            root_pin: 0.0,
            ik_position_weight: 1.0,
            chains,
            root: BoneId(0),
            is_root: Vec::new(),
            zero_weight_applied: false,
            initiated: false,
        }
    }

    /// Non-throwing structural pre-flight check over the whole tree.
    pub fn is_valid(&self, tree: &TransformTree, log: bool) -> bool {
        match self.validate(tree) {
            Ok(()) => true,
            Err(err) => {
                if log {
                    warning::log(&format!("FABRIK root solver is not valid: {err}"));
                }
                false
            }
        }
    }

    fn validate(&self, tree: &TransformTree) -> Result<(), ValidationError> {
        if self.chains.is_empty() {
            return Err(ValidationError::NoChains);
        }
        for chain in &self.chains {
            chain.solver.chain.validate(tree, false)?;
            for &child in &chain.children {
                if child >= self.chains.len() {
                    return Err(ValidationError::ChildIndexOutOfRange {
                        index: child,
                        count: self.chains.len(),
                    });
                }
            }
        }
        // The same bone driven by two chains would be fought over
        let mut seen = Vec::new();
        for chain in &self.chains {
            for bone in &chain.solver.chain.bones {
                if seen.contains(&bone.bone) {
                    return Err(ValidationError::DuplicateBone);
                }
                seen.push(bone.bone);
            }
        }
        Ok(())
    }

    /// Capture the rest pose of every chain. `root` anchors the shared
    /// centroid; usually the common ancestor of all chain bases.
    pub fn initiate(&mut self, tree: &TransformTree, root: BoneId) {
        self.root = root;
        for chain in &mut self.chains {
            let first = chain.solver.chain.bones[0].bone;
            chain.solver.initiate(tree, first);
        }
        self.is_root = (0..self.chains.len())
            .map(|i| self.compute_is_root(i))
            .collect();
        self.initiated = true;
    }

    // A root chain is one no other chain lists as a child.
    fn compute_is_root(&self, index: usize) -> bool {
        !self
            .chains
            .iter()
            .any(|chain| chain.children.contains(&index))
    }

    /// Run one update of the whole tree.
    pub fn update(&mut self, tree: &mut TransformTree) {
        if !self.initiated {
            warning::log("Trying to update an uninitiated FABRIK root solver.");
            return;
        }
        if self.ik_position_weight <= 0.0 && self.zero_weight_applied {
            return;
        }
        self.ik_position_weight = self.ik_position_weight.clamp(0.0, 1.0);

        for chain in &mut self.chains {
            chain.solver.chain.ik_position_weight = self.ik_position_weight;
        }

        if self.ik_position_weight <= 0.0 {
            self.zero_weight_applied = true;
            return;
        }
        self.zero_weight_applied = false;

        for _ in 0..self.iterations {
            // Solve trees from their targets
            for c in 0..self.chains.len() {
                if self.is_root[c] {
                    stage1(&mut self.chains, c, tree);
                }
            }

            let centroid = self.centroid(tree);

            // Start all trees from the centroid
            for c in 0..self.chains.len() {
                if self.is_root[c] {
                    stage2(&mut self.chains, c, tree, centroid);
                }
            }
        }
    }

    /// Pull-weighted centroid of all root chain bases, moderated by
    /// `root_pin`.
    fn centroid(&self, tree: &TransformTree) -> Vector3<f32> {
        let root_position = tree.position(self.root);
        if self.root_pin >= 1.0 {
            return root_position;
        }

        let mut pull_sum = 0.0;
        for (i, chain) in self.chains.iter().enumerate() {
            if self.is_root[i] {
                pull_sum += chain.pull;
            }
        }

        let mut centroid = root_position;
        if pull_sum > 0.0 {
            // Guard the divisor so small pull sums are not amplified
            let divisor = pull_sum.max(1.0);
            for (i, chain) in self.chains.iter().enumerate() {
                if self.is_root[i] {
                    let base = chain.solver.chain.bones[0].solver_position;
                    centroid += (base - root_position) * (chain.pull / divisor);
                }
            }
        }

        centroid + (root_position - centroid) * self.root_pin.clamp(0.0, 1.0)
    }
}

/// Stage 1: post-order forward reaching.
fn stage1(chains: &mut [FabrikRootChain], index: usize, tree: &mut TransformTree) {
    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        stage1(chains, child, tree);
    }

    // Leaf chains reach straight for their own target
    if chains[index].children.is_empty() {
        let target = chains[index].solver.chain.ik_position;
        chains[index].solver.solve_forward(tree, target);
        return;
    }

    let own_target = chains[index].solver.chain.ik_position;

    let mut pull_sum = 0.0;
    for k in 0..chains[index].children.len() {
        pull_sum += chains[chains[index].children[k]].pull;
    }

    let mut centroid = own_target;
    if pull_sum > 0.0 {
        let divisor = pull_sum.max(1.0);
        for k in 0..chains[index].children.len() {
            let child = chains[index].children[k];
            let base = chains[child].solver.chain.bones[0].solver_position;
            centroid += (base - own_target) * (chains[child].pull / divisor);
        }
    }

    let pin = chains[index].pin.clamp(0.0, 1.0);
    let target = centroid + (own_target - centroid) * pin;
    chains[index].solver.solve_forward(tree, target);
}

/// Stage 2: pre-order backward reaching from the parent-provided position.
fn stage2(
    chains: &mut [FabrikRootChain],
    index: usize,
    tree: &mut TransformTree,
    position: Vector3<f32>,
) {
    chains[index].solver.solve_backward(tree, position);

    let last = {
        let bones = &chains[index].solver.chain.bones;
        bones[bones.len() - 1].bone
    };
    let end_position = tree.position(last);

    for k in 0..chains[index].children.len() {
        let child = chains[index].children[k];
        stage2(chains, child, tree, end_position);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    /// A root bone with `branches` chains of `bones_per_chain` bones each
    /// fanning out along +X, +Y, +Z...
    fn fan_tree(branches: usize, bones_per_chain: usize) -> (TransformTree, BoneId, Vec<Vec<BoneId>>) {
        let directions = [Vector3::x(), Vector3::y(), Vector3::z()];
        let mut tree = TransformTree::new();
        let root = tree.add_root("root", Vector3::zeros(), UnitQuaternion::identity());

        let mut all = Vec::new();
        for b in 0..branches {
            let dir = directions[b % 3];
            let mut bones = Vec::new();
            // Chain bases share the root position, like chains hanging off
            // one hub bone
            let first =
                tree.add_bone(format!("b{b}_0"), root, Vector3::zeros(), UnitQuaternion::identity());
            bones.push(first);
            for i in 1..bones_per_chain {
                let bone = tree.add_bone(
                    format!("b{b}_{i}"),
                    bones[i - 1],
                    dir * 0.5,
                    UnitQuaternion::identity(),
                );
                bones.push(bone);
            }
            all.push(bones);
        }
        (tree, root, all)
    }

    fn root_solver(tree: &TransformTree, root: BoneId, chains: &[Vec<BoneId>]) -> FabrikRootSolver {
        let chains = chains
            .iter()
            .map(|bones| FabrikRootChain::new(FabrikSolver::new(bones.clone())))
            .collect();
        let mut solver = FabrikRootSolver::new(chains);
        solver.initiate(tree, root);
        solver
    }

    #[test]
    fn centroid_weighting_ignores_zero_pull_siblings() {
        let (mut tree, root, chains) = fan_tree(2, 3);
        let mut solver = root_solver(&tree, root, &chains);

        solver.chains[0].pull = 1.0;
        solver.chains[1].pull = 0.0;

        // Move both chain bases apart in solver space
        solver.chains[0].solver.chain.bones[0].solver_position = Vector3::new(1.0, 0.0, 0.0);
        solver.chains[1].solver.chain.bones[0].solver_position = Vector3::new(0.0, 9.0, 0.0);

        let centroid = solver.centroid(&tree);
        // Zero-pull sibling contributes nothing: centroid is exactly the
        // pull=1 chain's base
        assert_relative_eq!((centroid - Vector3::new(1.0, 0.0, 0.0)).norm(), 0.0, epsilon = 1e-6);
        let _ = &mut tree;
    }

    #[test]
    fn root_pin_one_pins_centroid_to_root() {
        let (tree, root, chains) = fan_tree(2, 3);
        let mut solver = root_solver(&tree, root, &chains);
        solver.root_pin = 1.0;
        solver.chains[0].solver.chain.bones[0].solver_position = Vector3::new(5.0, 5.0, 5.0);

        let centroid = solver.centroid(&tree);
        assert_relative_eq!((centroid - tree.position(root)).norm(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn two_branches_reach_independent_targets() {
        let (mut tree, root, chains) = fan_tree(2, 4);
        let mut solver = root_solver(&tree, root, &chains);

        let target_a = Vector3::new(1.0, 0.8, 0.0);
        let target_b = Vector3::new(0.3, 1.2, 0.5);
        solver.chains[0].solver.chain.ik_position = target_a;
        solver.chains[1].solver.chain.ik_position = target_b;
        solver.iterations = 8;
        solver.update(&mut tree);

        let end_a = tree.position(*chains[0].last().unwrap());
        let end_b = tree.position(*chains[1].last().unwrap());
        assert!((end_a - target_a).norm() < 0.05, "a error {}", (end_a - target_a).norm());
        assert!((end_b - target_b).norm() < 0.05, "b error {}", (end_b - target_b).norm());
    }

    #[test]
    fn zero_weight_latches_after_one_application() {
        let (mut tree, root, chains) = fan_tree(2, 3);
        let mut solver = root_solver(&tree, root, &chains);

        solver.ik_position_weight = 0.0;
        solver.update(&mut tree);
        assert!(solver.zero_weight_applied);

        // Latched: the second zero-weight update is a no-op
        solver.update(&mut tree);
        assert!(solver.zero_weight_applied);

        // Raising the weight un-latches
        solver.ik_position_weight = 1.0;
        solver.update(&mut tree);
        assert!(!solver.zero_weight_applied);
    }

    #[test]
    fn duplicate_bone_across_chains_is_invalid() {
        let (tree, root, chains) = fan_tree(2, 3);
        let mut shared = chains.clone();
        shared[1][0] = shared[0][0]; // same bone in both chains
        let solver = {
            let chains = shared
                .iter()
                .map(|bones| FabrikRootChain::new(FabrikSolver::new(bones.clone())))
                .collect();
            let mut s = FabrikRootSolver::new(chains);
            s.initiate(&tree, root);
            s
        };
        assert!(!solver.is_valid(&tree, false));
    }

    #[test]
    fn parent_child_chain_tree_solves() {
        // One trunk chain with a child chain hanging off its end
        let mut tree = TransformTree::new();
        let root = tree.add_root("root", Vector3::zeros(), UnitQuaternion::identity());
        let t0 = tree.add_bone("t0", root, Vector3::y() * 0.5, UnitQuaternion::identity());
        let t1 = tree.add_bone("t1", t0, Vector3::y() * 0.5, UnitQuaternion::identity());
        let t2 = tree.add_bone("t2", t1, Vector3::y() * 0.5, UnitQuaternion::identity());
        let c0 = tree.add_bone("c0", t2, Vector3::x() * 0.5, UnitQuaternion::identity());
        let c1 = tree.add_bone("c1", c0, Vector3::x() * 0.5, UnitQuaternion::identity());
        let c2 = tree.add_bone("c2", c1, Vector3::x() * 0.5, UnitQuaternion::identity());

        let trunk = FabrikRootChain::with_children(FabrikSolver::new(vec![t0, t1, t2]), vec![1]);
        let mut branch = FabrikRootChain::new(FabrikSolver::new(vec![c0, c1, c2]));
        branch.pull = 1.0;

        let mut solver = FabrikRootSolver::new(vec![trunk, branch]);
        solver.chains[0].pin = 0.0;
        solver.initiate(&tree, root);

        let target = Vector3::new(1.2, 1.4, 0.0);
        solver.chains[1].solver.chain.ik_position = target;
        solver.iterations = 10;
        solver.update(&mut tree);

        let end = tree.position(c2);
        assert!((end - target).norm() < 0.1, "error {}", (end - target).norm());

        // Bone lengths survive across both chains
        for pair in [[t0, t1], [t1, t2], [c0, c1], [c1, c2]] {
            let d = (tree.position(pair[0]) - tree.position(pair[1])).norm();
            assert_relative_eq!(d, 0.5, epsilon = 1e-3);
        }
    }
}
