//! Per-type constituent geometry of union (composite) particles.
//!
//! Each particle type owns a list of constituents in the body frame and a
//! bounding volume hierarchy over them. Leaf boxes are cubes of half-extent
//! `r_cut_constituent / 2` around each constituent, so two constituents
//! within `r_cut_constituent` of each other always sit in overlapping leaves.
//!
//! Every setter validates its input and rebuilds the affected tree before
//! returning. Device copies are refreshed lazily by [`CompositeShapeIndex::publish`].
//!
//! ```text
//! nodes (pre-order):  0 ──► 1 (leaf) ──► 2 (leaf) ──► end
//!                     │                  ▲
//!                     └── skip of 1 ─────┘
//! ```

use pairjit_core::{PairJitError, Quat, Result, ShapeConfig, Vec3};

const NO_CHILD: u32 = u32::MAX;

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub lower: Vec3,
    pub upper: Vec3,
}

impl Aabb {
    pub fn around(center: Vec3, half: f32) -> Self {
        let h = Vec3::repeat(half);
        Self {
            lower: center - h,
            upper: center + h,
        }
    }

    pub fn merge(&self, other: &Aabb) -> Aabb {
        Aabb {
            lower: self.lower.inf(&other.lower),
            upper: self.upper.sup(&other.upper),
        }
    }

    #[inline]
    pub fn overlaps(&self, other: &Aabb) -> bool {
        (0..3).all(|a| self.lower[a] <= other.upper[a] && other.lower[a] <= self.upper[a])
    }

    pub fn contains_box(&self, other: &Aabb) -> bool {
        (0..3).all(|a| self.lower[a] <= other.lower[a] && other.upper[a] <= self.upper[a])
    }

    pub fn contains_point(&self, p: &Vec3) -> bool {
        (0..3).all(|a| self.lower[a] <= p[a] && p[a] <= self.upper[a])
    }

    /// Box enclosing this box after rotation by `q` and translation by `t`.
    #[inline]
    pub fn transformed(&self, q: &Quat, t: &Vec3) -> Aabb {
        let center = (self.lower + self.upper) * 0.5;
        let half = (self.upper - self.lower) * 0.5;
        let rot = q.to_rotation_matrix();
        let abs = rot.matrix().abs();
        let c = rot * center + t;
        let e = abs * half;
        Aabb {
            lower: c - e,
            upper: c + e,
        }
    }
}

/// Flat hierarchy node, laid out for device upload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BvhNode {
    pub lower: [f32; 3],
    pub upper: [f32; 3],
    /// Index of the next node outside this subtree
    pub skip: u32,
    /// Right child, `u32::MAX` for leaves; the left child is always `self + 1`
    pub right: u32,
    /// First entry of this leaf in the index permutation
    pub leaf_start: u32,
    /// Constituents in this leaf, zero for internal nodes
    pub leaf_count: u32,
}

impl BvhNode {
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.right == NO_CHILD
    }

    #[inline]
    pub fn aabb(&self) -> Aabb {
        Aabb {
            lower: Vec3::from(self.lower),
            upper: Vec3::from(self.upper),
        }
    }
}

/// Bounding volume hierarchy over one type's constituents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShapeTree {
    nodes: Vec<BvhNode>,
    /// Constituent indices, grouped by leaf
    order: Vec<u32>,
}

impl ShapeTree {
    /// Median-split build on the longest centroid axis. Ties keep index
    /// order, so the same input always yields the same tree.
    pub fn build(points: &[Vec3], half_extent: f32, leaf_capacity: usize) -> Self {
        let mut tree = ShapeTree {
            nodes: Vec::with_capacity(2 * points.len() / leaf_capacity.max(1) + 1),
            order: (0..points.len() as u32).collect(),
        };
        if !points.is_empty() {
            let n = points.len();
            tree.build_range(points, half_extent, leaf_capacity.max(1), 0, n);
        }
        tree
    }

    fn build_range(
        &mut self,
        points: &[Vec3],
        half: f32,
        cap: usize,
        start: usize,
        end: usize,
    ) -> u32 {
        let items = &mut self.order[start..end];
        let bounds = items
            .iter()
            .map(|&i| Aabb::around(points[i as usize], half))
            .reduce(|a, b| a.merge(&b))
            .unwrap_or_else(|| Aabb::around(Vec3::zeros(), half));

        let node_idx = self.nodes.len() as u32;
        self.nodes.push(BvhNode {
            lower: bounds.lower.into(),
            upper: bounds.upper.into(),
            skip: 0,
            right: NO_CHILD,
            leaf_start: start as u32,
            leaf_count: (end - start) as u32,
        });

        if end - start > cap {
            let (mut lo, mut hi) = (Vec3::repeat(f32::MAX), Vec3::repeat(f32::MIN));
            for &i in items.iter() {
                lo = lo.inf(&points[i as usize]);
                hi = hi.sup(&points[i as usize]);
            }
            let axis = (hi - lo).imax();
            items.sort_by(|&a, &b| {
                points[a as usize][axis]
                    .total_cmp(&points[b as usize][axis])
                    .then(a.cmp(&b))
            });
            let mid = start + (end - start) / 2;

            self.build_range(points, half, cap, start, mid);
            let right = self.build_range(points, half, cap, mid, end);
            let node = &mut self.nodes[node_idx as usize];
            node.right = right;
            node.leaf_count = 0;
        }

        self.nodes[node_idx as usize].skip = self.nodes.len() as u32;
        node_idx
    }

    pub fn nodes(&self) -> &[BvhNode] {
        &self.nodes
    }

    pub fn order(&self) -> &[u32] {
        &self.order
    }

    pub fn root_bounds(&self) -> Option<Aabb> {
        self.nodes.first().map(BvhNode::aabb)
    }

    /// Constituent indices held by leaf `node`.
    #[inline]
    pub fn leaf_members(&self, node: &BvhNode) -> &[u32] {
        let start = node.leaf_start as usize;
        &self.order[start..start + node.leaf_count as usize]
    }

    /// Stackless walk over every leaf whose transformed box overlaps `query`.
    pub fn for_each_overlapping_leaf(
        &self,
        q: &Quat,
        t: &Vec3,
        query: &Aabb,
        mut visit: impl FnMut(&BvhNode),
    ) {
        let mut cur = 0usize;
        while cur < self.nodes.len() {
            let node = &self.nodes[cur];
            if node.aabb().transformed(q, t).overlaps(query) {
                if node.is_leaf() {
                    visit(node);
                    cur = node.skip as usize;
                } else {
                    cur += 1;
                }
            } else {
                cur = node.skip as usize;
            }
        }
    }

    fn leaves(&self) -> impl Iterator<Item = &BvhNode> {
        self.nodes.iter().filter(|n| n.is_leaf())
    }
}

/// Body-frame constituent attributes of one particle type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Constituents {
    pub positions: Vec<Vec3>,
    pub orientations: Vec<Quat>,
    pub diameters: Vec<f32>,
    pub charges: Vec<f32>,
    pub typeids: Vec<u32>,
}

impl Constituents {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn reset_attributes(&mut self) {
        let n = self.positions.len();
        self.orientations = vec![Quat::identity(); n];
        self.diameters = vec![0.0; n];
        self.charges = vec![0.0; n];
        self.typeids = vec![0; n];
    }

    fn validate(&self) -> Result<()> {
        let n = self.positions.len();
        if self.orientations.len() != n
            || self.diameters.len() != n
            || self.charges.len() != n
            || self.typeids.len() != n
        {
            return Err(PairJitError::config(
                "constituent attribute arrays have different lengths",
            ));
        }
        if let Some(p) = self.positions.iter().find(|p| !p.iter().all(|v| v.is_finite())) {
            return Err(PairJitError::config(format!(
                "non-finite constituent position {:?}",
                p
            )));
        }
        if let Some(d) = self.diameters.iter().find(|d| !(d.is_finite() && **d >= 0.0)) {
            return Err(PairJitError::config(format!(
                "constituent diameter must be finite and non-negative, got {}",
                d
            )));
        }
        if let Some(c) = self.charges.iter().find(|c| !c.is_finite()) {
            return Err(PairJitError::config(format!("non-finite constituent charge {}", c)));
        }
        Ok(())
    }
}

/// Placement hint applied to published constituent arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResidencyHint {
    #[default]
    None,
    /// Arrays are read by every device and rarely written
    ReadMostly,
}

#[derive(Debug, Clone, Default)]
struct TypeShape {
    constituents: Constituents,
    tree: ShapeTree,
    /// Largest constituent distance from the body origin
    extent: f32,
    dirty: bool,
}

/// Constituent geometry and hierarchies for every particle type.
#[derive(Debug, Clone)]
pub struct CompositeShapeIndex {
    types: Vec<TypeShape>,
    r_cut_constituent: f32,
    leaf_capacity: usize,
    hint: ResidencyHint,
    advise_calls: u64,
    rebuilds: u64,
}

impl CompositeShapeIndex {
    pub fn new(n_types: usize, r_cut_constituent: f32, leaf_capacity: usize) -> Result<Self> {
        ShapeConfig {
            r_cut_constituent,
            leaf_capacity,
        }
        .validate()?;
        Ok(Self {
            types: vec![TypeShape::default(); n_types],
            r_cut_constituent,
            leaf_capacity,
            hint: ResidencyHint::ReadMostly,
            advise_calls: 0,
            rebuilds: 0,
        })
    }

    pub fn from_config(n_types: usize, config: &ShapeConfig) -> Result<Self> {
        Self::new(n_types, config.r_cut_constituent, config.leaf_capacity)
    }

    pub fn n_types(&self) -> usize {
        self.types.len()
    }

    pub fn r_cut_constituent(&self) -> f32 {
        self.r_cut_constituent
    }

    /// Replace all constituents of `type_id` at once.
    pub fn set_constituents(&mut self, type_id: usize, constituents: Constituents) -> Result<()> {
        constituents.validate()?;
        let shape = self.shape_mut(type_id)?;
        shape.constituents = constituents;
        self.rebuild(type_id);
        Ok(())
    }

    /// Set body-frame positions. A change in count resets every other
    /// attribute of the type to its default.
    pub fn set_positions(&mut self, type_id: usize, positions: Vec<Vec3>) -> Result<()> {
        if let Some(p) = positions.iter().find(|p| !p.iter().all(|v| v.is_finite())) {
            return Err(PairJitError::config(format!(
                "non-finite constituent position {:?} for type {}",
                p, type_id
            )));
        }
        let shape = self.shape_mut(type_id)?;
        let resized = shape.constituents.positions.len() != positions.len();
        shape.constituents.positions = positions;
        if resized {
            shape.constituents.reset_attributes();
        }
        self.rebuild(type_id);
        Ok(())
    }

    pub fn set_orientations(&mut self, type_id: usize, orientations: Vec<Quat>) -> Result<()> {
        let shape = self.shape_mut(type_id)?;
        check_len(type_id, "orientations", orientations.len(), shape.constituents.len())?;
        shape.constituents.orientations = orientations;
        self.touch(type_id);
        Ok(())
    }

    pub fn set_diameters(&mut self, type_id: usize, diameters: Vec<f32>) -> Result<()> {
        if let Some(d) = diameters.iter().find(|d| !(d.is_finite() && **d >= 0.0)) {
            return Err(PairJitError::config(format!(
                "constituent diameter must be finite and non-negative, got {}",
                d
            )));
        }
        let shape = self.shape_mut(type_id)?;
        check_len(type_id, "diameters", diameters.len(), shape.constituents.len())?;
        shape.constituents.diameters = diameters;
        self.touch(type_id);
        Ok(())
    }

    pub fn set_charges(&mut self, type_id: usize, charges: Vec<f32>) -> Result<()> {
        if let Some(c) = charges.iter().find(|c| !c.is_finite()) {
            return Err(PairJitError::config(format!("non-finite constituent charge {}", c)));
        }
        let shape = self.shape_mut(type_id)?;
        check_len(type_id, "charges", charges.len(), shape.constituents.len())?;
        shape.constituents.charges = charges;
        self.touch(type_id);
        Ok(())
    }

    pub fn set_typeids(&mut self, type_id: usize, typeids: Vec<u32>) -> Result<()> {
        let shape = self.shape_mut(type_id)?;
        check_len(type_id, "typeids", typeids.len(), shape.constituents.len())?;
        shape.constituents.typeids = typeids;
        self.touch(type_id);
        Ok(())
    }

    /// Change the constituent interaction range; every tree is rebuilt.
    pub fn set_r_cut_constituent(&mut self, r_cut: f32) -> Result<()> {
        ShapeConfig {
            r_cut_constituent: r_cut,
            leaf_capacity: self.leaf_capacity,
        }
        .validate()?;
        self.r_cut_constituent = r_cut;
        for type_id in 0..self.types.len() {
            self.rebuild(type_id);
        }
        Ok(())
    }

    pub fn set_residency_hint(&mut self, hint: ResidencyHint) {
        if hint != self.hint {
            self.hint = hint;
            for shape in &mut self.types {
                shape.dirty = true;
            }
        }
    }

    /// Traversal handle for `type_id`.
    pub fn index(&self, type_id: usize) -> Result<ShapeView<'_>> {
        let shape = self.types.get(type_id).ok_or_else(|| {
            PairJitError::config(format!(
                "type {} out of range ({} types)",
                type_id,
                self.types.len()
            ))
        })?;
        Ok(ShapeView {
            constituents: &shape.constituents,
            tree: &shape.tree,
            r_cut: self.r_cut_constituent,
        })
    }

    pub fn constituent_count(&self, type_id: usize) -> usize {
        self.types
            .get(type_id)
            .map(|s| s.constituents.len())
            .unwrap_or(0)
    }

    pub fn root_bounds(&self, type_id: usize) -> Option<Aabb> {
        self.types.get(type_id).and_then(|s| s.tree.root_bounds())
    }

    /// Radius of the sphere around the body origin holding every
    /// constituent of `type_id`, or `None` when the type has none.
    pub fn extent(&self, type_id: usize) -> Option<f32> {
        self.types
            .get(type_id)
            .filter(|s| !s.constituents.is_empty())
            .map(|s| s.extent)
    }

    /// Centre separation beyond which no constituent pair of types `ti`
    /// and `tj` can be within `r_cut_constituent`, whatever the body
    /// orientations.
    pub fn union_range(&self, ti: usize, tj: usize) -> Option<f32> {
        Some(self.r_cut_constituent + self.extent(ti)? + self.extent(tj)?)
    }

    /// Any type has at least one constituent.
    pub fn has_constituents(&self) -> bool {
        self.types.iter().any(|s| !s.constituents.is_empty())
    }

    /// Explicit full rebuild of one type's hierarchy.
    pub fn build_index(&mut self, type_id: usize) -> Result<()> {
        self.shape_mut(type_id)?;
        self.rebuild(type_id);
        Ok(())
    }

    /// Make one type's current geometry visible to devices, applying the
    /// residency hint. Returns false without doing any work when the type
    /// has not changed since it was last published.
    pub fn publish(&mut self, type_id: usize) -> Result<bool> {
        let hint = self.hint;
        let shape = self.shape_mut(type_id)?;
        if !shape.dirty {
            return Ok(false);
        }
        shape.dirty = false;
        let n = shape.constituents.len();
        if hint == ResidencyHint::ReadMostly {
            // positions, orientations, diameters, charges, typeids, tree
            self.advise_calls += 6;
        }
        log::trace!("Published {} constituents of type {}", n, type_id);
        Ok(true)
    }

    /// Publish every changed type; returns how many were refreshed.
    pub fn publish_all(&mut self) -> usize {
        (0..self.types.len())
            .filter(|&t| matches!(self.publish(t), Ok(true)))
            .count()
    }

    pub fn is_published(&self, type_id: usize) -> bool {
        self.types.get(type_id).map(|s| !s.dirty).unwrap_or(false)
    }

    /// Residency advisories issued so far.
    pub fn advise_calls(&self) -> u64 {
        self.advise_calls
    }

    pub fn residency_hint(&self) -> ResidencyHint {
        self.hint
    }

    /// Tree rebuilds performed so far.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    fn shape_mut(&mut self, type_id: usize) -> Result<&mut TypeShape> {
        let n_types = self.types.len();
        self.types.get_mut(type_id).ok_or_else(|| {
            PairJitError::config(format!("type {} out of range ({} types)", type_id, n_types))
        })
    }

    fn touch(&mut self, type_id: usize) {
        self.types[type_id].dirty = true;
    }

    fn rebuild(&mut self, type_id: usize) {
        let half = 0.5 * self.r_cut_constituent;
        let shape = &mut self.types[type_id];
        shape.tree = ShapeTree::build(&shape.constituents.positions, half, self.leaf_capacity);
        shape.extent = shape
            .constituents
            .positions
            .iter()
            .map(|p| p.norm())
            .fold(0.0, f32::max);
        self.rebuilds += 1;
        log::debug!(
            "Rebuilt hierarchy for type {}: {} constituents, {} nodes",
            type_id,
            shape.constituents.len(),
            shape.tree.nodes.len()
        );
        self.touch(type_id);
    }
}

fn check_len(type_id: usize, what: &str, got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(PairJitError::config(format!(
            "type {} has {} constituents but {} {} were given",
            type_id, expected, got, what
        )));
    }
    Ok(())
}

/// Counts from one narrow-phase traversal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NarrowPhaseCounts {
    /// Constituent pairs handed to the kernel
    pub evaluated: u64,
    /// Constituent pairs skipped by the hierarchy or the range check
    pub pruned: u64,
}

impl std::ops::AddAssign for NarrowPhaseCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.evaluated += rhs.evaluated;
        self.pruned += rhs.pruned;
    }
}

/// Read-only view of one type's geometry.
#[derive(Debug, Clone, Copy)]
pub struct ShapeView<'a> {
    pub constituents: &'a Constituents,
    pub tree: &'a ShapeTree,
    r_cut: f32,
}

impl<'a> ShapeView<'a> {
    /// Visit every constituent pair `(a, b)` of bodies `i` (this view, at the
    /// origin with orientation `q_i`) and `j` (`other`, at `dx` with `q_j`)
    /// whose world separation is within `r_cut_constituent`. `visit` gets the
    /// two indices and the separation `r_b - r_a`.
    pub fn for_each_near_pair(
        &self,
        other: &ShapeView<'_>,
        q_i: &Quat,
        q_j: &Quat,
        dx: &Vec3,
        mut visit: impl FnMut(usize, usize, Vec3),
    ) -> NarrowPhaseCounts {
        let total = (self.constituents.len() * other.constituents.len()) as u64;
        let mut counts = NarrowPhaseCounts::default();
        let rcutsq = self.r_cut * self.r_cut;
        let origin = Vec3::zeros();

        for leaf_i in self.tree.leaves() {
            let query = leaf_i.aabb().transformed(q_i, &origin);
            other.tree.for_each_overlapping_leaf(q_j, dx, &query, |leaf_j| {
                for &a in self.tree.leaf_members(leaf_i) {
                    let pa = q_i * self.constituents.positions[a as usize];
                    for &b in other.tree.leaf_members(leaf_j) {
                        let pb = q_j * other.constituents.positions[b as usize] + dx;
                        let d = pb - pa;
                        if d.norm_squared() <= rcutsq {
                            counts.evaluated += 1;
                            visit(a as usize, b as usize, d);
                        }
                    }
                }
            });
        }
        counts.pruned = total - counts.evaluated;
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;
    use std::f32::consts::FRAC_PI_2;

    fn line(n: usize, spacing: f32) -> Vec<Vec3> {
        (0..n).map(|k| Vector3::new(k as f32 * spacing, 0.0, 0.0)).collect()
    }

    #[test]
    fn test_tree_partitions_all_points() {
        let pts = line(11, 0.5);
        let tree = ShapeTree::build(&pts, 0.25, 2);
        let mut seen: Vec<u32> = tree
            .leaves()
            .flat_map(|l| tree.leaf_members(l).iter().copied())
            .collect();
        seen.sort();
        assert_eq!(seen, (0..11).collect::<Vec<_>>());
        assert!(tree.leaves().all(|l| l.leaf_count <= 2));
        assert_eq!(tree.nodes()[0].skip as usize, tree.nodes().len());
    }

    #[test]
    fn test_build_is_deterministic_with_ties() {
        let pts = vec![Vector3::new(0.0, 0.0, 0.0); 9];
        assert_eq!(ShapeTree::build(&pts, 0.5, 2), ShapeTree::build(&pts, 0.5, 2));
    }

    #[test]
    fn test_rotated_box_encloses_rotated_corners() {
        let b = Aabb {
            lower: Vector3::new(0.0, 0.0, 0.0),
            upper: Vector3::new(2.0, 1.0, 0.0),
        };
        let q = Quat::from_axis_angle(&Vector3::z_axis(), FRAC_PI_2);
        let t = b.transformed(&q, &Vector3::zeros());
        assert_relative_eq!(t.lower.x, -1.0, epsilon = 1e-5);
        assert_relative_eq!(t.upper.y, 2.0, epsilon = 1e-5);
    }

    #[test]
    fn test_count_change_resets_attributes() {
        let mut idx = CompositeShapeIndex::new(1, 1.0, 4).unwrap();
        idx.set_positions(0, line(2, 1.0)).unwrap();
        idx.set_charges(0, vec![1.0, -1.0]).unwrap();
        idx.set_positions(0, line(3, 1.0)).unwrap();
        let view = idx.index(0).unwrap();
        assert_eq!(view.constituents.charges, vec![0.0; 3]);
        assert_eq!(view.constituents.orientations.len(), 3);
    }

    #[test]
    fn test_mismatched_attribute_length_rejected() {
        let mut idx = CompositeShapeIndex::new(1, 1.0, 4).unwrap();
        idx.set_positions(0, line(2, 1.0)).unwrap();
        let err = idx.set_diameters(0, vec![1.0]).unwrap_err();
        assert!(matches!(err, PairJitError::Configuration(_)));
        assert!(idx.set_diameters(0, vec![1.0, -0.5]).is_err());
    }

    #[test]
    fn test_near_pairs_match_brute_force() {
        let mut idx = CompositeShapeIndex::new(1, 1.0, 2).unwrap();
        idx.set_positions(0, line(6, 0.7)).unwrap();
        let v = idx.index(0).unwrap();
        let q_i = Quat::from_axis_angle(&Vector3::y_axis(), 0.3);
        let q_j = Quat::from_axis_angle(&Vector3::z_axis(), 1.1);
        let dx = Vector3::new(1.2, 0.4, -0.2);

        let mut found = Vec::new();
        let counts = v.for_each_near_pair(&v, &q_i, &q_j, &dx, |a, b, _| found.push((a, b)));

        let mut expected = Vec::new();
        for a in 0..6 {
            for b in 0..6 {
                let pa = q_i * v.constituents.positions[a];
                let pb = q_j * v.constituents.positions[b] + dx;
                if (pb - pa).norm_squared() <= 1.0 {
                    expected.push((a, b));
                }
            }
        }
        found.sort();
        assert_eq!(found, expected);
        assert_eq!(counts.evaluated + counts.pruned, 36);
    }

    #[test]
    fn test_union_range_covers_both_extents() {
        let mut idx = CompositeShapeIndex::new(3, 1.5, 4).unwrap();
        idx.set_positions(0, vec![Vector3::new(0.3, -0.4, 0.0)]).unwrap();
        idx.set_positions(1, line(3, 1.0)).unwrap();
        assert_relative_eq!(idx.extent(0).unwrap(), 0.5, epsilon = 1e-6);
        assert_relative_eq!(idx.extent(1).unwrap(), 2.0, epsilon = 1e-6);
        assert_relative_eq!(idx.union_range(0, 1).unwrap(), 4.0, epsilon = 1e-6);
        assert!(idx.extent(2).is_none());
        assert!(idx.union_range(0, 2).is_none());
        assert!(idx.union_range(0, 7).is_none());

        idx.set_r_cut_constituent(0.5).unwrap();
        assert_relative_eq!(idx.union_range(1, 1).unwrap(), 4.5, epsilon = 1e-6);
    }

    #[test]
    fn test_publish_all_skips_clean_types() {
        let mut idx = CompositeShapeIndex::new(2, 1.0, 4).unwrap();
        idx.set_positions(0, line(3, 1.0)).unwrap();
        // type 1 was never set, so it is clean
        assert_eq!(idx.publish_all(), 1);
        assert_eq!(idx.publish_all(), 0);
        idx.set_typeids(0, vec![0, 1, 0]).unwrap();
        assert!(!idx.is_published(0));
        assert_eq!(idx.publish_all(), 1);
    }
}
