//! Leaf membership.
//!
//! The spatial hierarchy lives in the host; the remesher maintains only the
//! mapping from faces and vertices to the leaf that owns them, and a dirty
//! mask per leaf so the host knows what to rebuild. Every face has one owner
//! (or [`NO_LEAF`] transiently); a vertex is uniquely owned by one leaf that
//! must also own at least one of its faces.

use anyhow::Result;
use bitflags::bitflags;
use nalgebra::Point3;
use thiserror::Error;
use tracing::warn;

use crate::log::TopoLog;
use crate::mesh::TopoMesh;
use crate::store::{new_map, new_set, FixedMap, FixedSet, FaceRef, VertRef};

pub const NO_LEAF: u32 = u32::MAX;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LeafDirty: u32 {
        const REDRAW = 1 << 0;
        const UPDATE_BB = 1 << 1;
        const UPDATE_NORMALS = 1 << 2;
        const UPDATE_TRIS = 1 << 3;
        const UPDATE_OTHER_VERTS = 1 << 4;
        const REBUILD_NODE_VERTS = 1 << 5;
        const UPDATE_TOPOLOGY = 1 << 6;
    }
}

#[derive(Debug)]
pub struct Leaf {
    pub verts: FixedSet<VertRef>,
    pub faces: FixedSet<FaceRef>,
    pub dirty: LeafDirty,
    pub bmin: Point3<f64>,
    pub bmax: Point3<f64>,
    pub face_limit: usize,
}

#[derive(Debug, Error)]
pub enum MembershipError {
    #[error("face {0:?} claims leaf {1}, but only {2} leaves exist")]
    CorruptFaceLeaf(FaceRef, u32, usize),
    #[error("vertex {0:?} claims leaf {1}, but only {2} leaves exist")]
    CorruptVertLeaf(VertRef, u32, usize),
}

#[derive(Debug, Default)]
pub struct LeafSet {
    leaves: Vec<Leaf>,
    vert_owner: FixedMap<VertRef, u32>,
    face_owner: FixedMap<FaceRef, u32>,
}

impl LeafSet {
    pub fn new() -> Self {
        Self {
            leaves: Vec::new(),
            vert_owner: new_map(),
            face_owner: new_map(),
        }
    }

    pub fn push_leaf(&mut self, bmin: Point3<f64>, bmax: Point3<f64>, face_limit: usize) -> u32 {
        self.leaves.push(Leaf {
            verts: new_set(),
            faces: new_set(),
            dirty: LeafDirty::empty(),
            bmin,
            bmax,
            face_limit,
        });
        (self.leaves.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn leaf(&self, i: u32) -> &Leaf {
        &self.leaves[i as usize]
    }

    pub fn leaf_mut(&mut self, i: u32) -> &mut Leaf {
        &mut self.leaves[i as usize]
    }

    pub fn vert_leaf(&self, v: VertRef) -> u32 {
        self.vert_owner.get(&v).copied().unwrap_or(NO_LEAF)
    }

    pub fn face_leaf(&self, f: FaceRef) -> u32 {
        self.face_owner.get(&f).copied().unwrap_or(NO_LEAF)
    }

    pub fn mark_dirty(&mut self, i: u32, flags: LeafDirty) {
        if i == NO_LEAF {
            return;
        }
        if let Some(leaf) = self.leaves.get_mut(i as usize) {
            leaf.dirty |= flags;
        }
    }

    pub fn assign_face(&mut self, f: FaceRef, leaf: u32) {
        debug_assert!((leaf as usize) < self.leaves.len());
        self.face_owner.insert(f, leaf);
        self.leaves[leaf as usize].faces.insert(f);
    }

    pub fn unassign_face(&mut self, f: FaceRef) {
        if let Some(leaf) = self.face_owner.remove(&f) {
            if let Some(node) = self.leaves.get_mut(leaf as usize) {
                node.faces.remove(&f);
            }
        }
    }

    pub fn assign_vert(&mut self, v: VertRef, leaf: u32) {
        debug_assert!((leaf as usize) < self.leaves.len());
        self.vert_owner.insert(v, leaf);
        self.leaves[leaf as usize].verts.insert(v);
    }

    pub fn unassign_vert(&mut self, v: VertRef) {
        if let Some(leaf) = self.vert_owner.remove(&v) {
            if let Some(node) = self.leaves.get_mut(leaf as usize) {
                node.verts.remove(&v);
            }
        }
    }

    /// The fatal taxonomy entry: an owner index that points outside the
    /// leaf array means the side-table is corrupt.
    pub fn verify_integrity(&self) -> Result<(), MembershipError> {
        let n = self.leaves.len();
        for (&f, &leaf) in &self.face_owner {
            if leaf != NO_LEAF && leaf as usize >= n {
                return Err(MembershipError::CorruptFaceLeaf(f, leaf, n));
            }
        }
        for (&v, &leaf) in &self.vert_owner {
            if leaf != NO_LEAF && leaf as usize >= n {
                return Err(MembershipError::CorruptVertLeaf(v, leaf, n));
            }
        }
        Ok(())
    }

    /// Membership consistency (testable property): every face and vertex
    /// has at most one owner, and the owner tables agree with the per-leaf
    /// sets. A vertex may transiently sit in a leaf none of its faces are
    /// in (a split midpoint adopting an endpoint's leaf); the hierarchy
    /// reassigns those on its next rebuild.
    pub fn validate(&self, _mesh: &TopoMesh) -> Result<()> {
        for (&f, &leaf) in &self.face_owner {
            if leaf as usize >= self.leaves.len() {
                anyhow::bail!("face {:?} owned by missing leaf {}", f, leaf);
            }
            if !self.leaves[leaf as usize].faces.contains(&f) {
                anyhow::bail!("face {:?} not in its owner's face set", f);
            }
        }
        for (li, node) in self.leaves.iter().enumerate() {
            for f in &node.faces {
                if self.face_leaf(*f) != li as u32 {
                    anyhow::bail!("leaf {} holds face {:?} it does not own", li, f);
                }
            }
            for v in &node.verts {
                if self.vert_leaf(*v) != li as u32 {
                    anyhow::bail!("leaf {} holds vertex {:?} it does not own", li, v);
                }
            }
        }
        for (&v, &leaf) in &self.vert_owner {
            if leaf as usize >= self.leaves.len() {
                anyhow::bail!("vertex {:?} owned by missing leaf {}", v, leaf);
            }
            if !self.leaves[leaf as usize].verts.contains(&v) {
                anyhow::bail!("vertex {:?} not in its owner's vert set", v);
            }
        }
        Ok(())
    }
}

/// The host spatial hierarchy, seen from the remesher.
pub trait Hierarchy {
    /// Picks a leaf for a face the membership layer could not place by
    /// adjacency. None means even the hierarchy has nowhere to put it.
    fn insert_face(&mut self, mesh: &TopoMesh, leaves: &LeafSet, f: FaceRef) -> Option<u32>;

    /// Splits `leaf` if it has outgrown its face limit.
    fn ensure_node_limit(&mut self, mesh: &mut TopoMesh, leaves: &mut LeafSet, leaf: u32);

    /// Rebuilds the draw/triangulation caches of `leaf`.
    fn check_tris(&mut self, mesh: &TopoMesh, leaves: &mut LeafSet, leaf: u32);
}

/// A leaf other than `v`'s current owner that holds one of its faces.
pub fn vert_other_leaf_find(mesh: &TopoMesh, leaves: &LeafSet, v: VertRef) -> Option<u32> {
    let current = leaves.vert_leaf(v);
    for f in mesh.vert_faces(v) {
        let leaf = leaves.face_leaf(f);
        if leaf != NO_LEAF && leaf != current {
            return Some(leaf);
        }
    }
    None
}

/// Moves `v` from its current owner into `new_leaf`.
pub fn vert_ownership_transfer(leaves: &mut LeafSet, v: VertRef, new_leaf: u32) {
    let old = leaves.vert_leaf(v);
    leaves.unassign_vert(v);
    leaves.assign_vert(v, new_leaf);
    let dirty = LeafDirty::REDRAW | LeafDirty::UPDATE_BB | LeafDirty::UPDATE_OTHER_VERTS;
    leaves.mark_dirty(old, dirty);
    leaves.mark_dirty(new_leaf, dirty);
}

/// Drops `v` from its owner; the vertex becomes unowned.
pub fn vert_remove(leaves: &mut LeafSet, v: VertRef) {
    let old = leaves.vert_leaf(v);
    leaves.unassign_vert(v);
    leaves.mark_dirty(old, LeafDirty::REDRAW | LeafDirty::UPDATE_OTHER_VERTS);
}

/// Drops `f` from its owner. With `check_verts`, corner vertices that would
/// lose their last owned face in that leaf are transferred elsewhere; if no
/// other leaf has them and `ensure_transfer` is set, they become unowned and
/// the leaf is marked for a vertex rebuild.
pub fn face_remove(
    mesh: &TopoMesh,
    leaves: &mut LeafSet,
    f: FaceRef,
    check_verts: bool,
    ensure_transfer: bool,
) {
    let leaf = leaves.face_leaf(f);
    if leaf == NO_LEAF {
        return;
    }
    leaves.unassign_face(f);
    leaves.mark_dirty(
        leaf,
        LeafDirty::REDRAW
            | LeafDirty::UPDATE_BB
            | LeafDirty::UPDATE_NORMALS
            | LeafDirty::UPDATE_TRIS
            | LeafDirty::UPDATE_TOPOLOGY,
    );

    if !check_verts {
        return;
    }
    for w in mesh.face_verts(f) {
        if leaves.vert_leaf(w) != leaf {
            continue;
        }
        let still_here = mesh
            .vert_faces(w)
            .iter()
            .any(|&other| other != f && leaves.face_leaf(other) == leaf);
        if still_here {
            continue;
        }
        if let Some(other_leaf) = vert_other_leaf_find(mesh, leaves, w) {
            vert_ownership_transfer(leaves, w, other_leaf);
        } else if ensure_transfer {
            vert_remove(leaves, w);
            leaves.mark_dirty(leaf, LeafDirty::REBUILD_NODE_VERTS);
        }
    }
}

/// Places `f` in a leaf: by radial adjacency unless `force_tree_walk`, else
/// by asking the hierarchy. Unowned corner vertices are adopted as well.
pub fn face_add(
    mesh: &TopoMesh,
    leaves: &mut LeafSet,
    hier: &mut dyn Hierarchy,
    f: FaceRef,
    force_tree_walk: bool,
) -> u32 {
    let mut leaf = NO_LEAF;
    if !force_tree_walk {
        'adjacency: for l in mesh.face_loops(f) {
            for lr in mesh.edge_loops(mesh.corner_edge(l)) {
                let other = mesh.corner_face(lr);
                if other == f {
                    continue;
                }
                let candidate = leaves.face_leaf(other);
                if candidate != NO_LEAF {
                    leaf = candidate;
                    break 'adjacency;
                }
            }
        }
    }
    if leaf == NO_LEAF {
        match hier.insert_face(mesh, leaves, f) {
            Some(found) => leaf = found,
            None => {
                warn!(?f, "no leaf found for face during adoption");
                return NO_LEAF;
            }
        }
    }
    leaves.assign_face(f, leaf);
    leaves.mark_dirty(
        leaf,
        LeafDirty::REDRAW
            | LeafDirty::UPDATE_BB
            | LeafDirty::UPDATE_NORMALS
            | LeafDirty::UPDATE_TRIS
            | LeafDirty::UPDATE_TOPOLOGY,
    );
    for w in mesh.face_verts(f) {
        if leaves.vert_leaf(w) == NO_LEAF {
            leaves.assign_vert(w, leaf);
            leaves.mark_dirty(leaf, LeafDirty::UPDATE_OTHER_VERTS);
        }
    }
    leaf
}

/// Creates a vertex directly inside `leaf`, with annotation and origdata
/// initialized for the current stroke.
#[allow(clippy::too_many_arguments)]
pub fn vert_create_in_leaf(
    mesh: &mut TopoMesh,
    annot: &mut crate::annot::VertTable,
    leaves: &mut LeafSet,
    log: &mut dyn TopoLog,
    leaf: u32,
    co: Point3<f64>,
    no: nalgebra::Vector3<f64>,
    example: Option<VertRef>,
    stroke_id: u64,
) -> VertRef {
    let v = mesh.vert_create(log, co, no, example);
    annot.ensure(mesh, v);
    annot.check_origdata(mesh, v, stroke_id);
    if leaf != NO_LEAF {
        leaves.assign_vert(v, leaf);
        leaves.mark_dirty(
            leaf,
            LeafDirty::REDRAW | LeafDirty::UPDATE_BB | LeafDirty::UPDATE_OTHER_VERTS,
        );
    }
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use nalgebra::Vector3;

    struct NeverPlace;
    impl Hierarchy for NeverPlace {
        fn insert_face(&mut self, _: &TopoMesh, _: &LeafSet, _: FaceRef) -> Option<u32> {
            None
        }
        fn ensure_node_limit(&mut self, _: &mut TopoMesh, _: &mut LeafSet, _: u32) {}
        fn check_tris(&mut self, _: &TopoMesh, _: &mut LeafSet, _: u32) {}
    }

    fn two_tris() -> (TopoMesh, Vec<VertRef>, Vec<FaceRef>) {
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let v: Vec<VertRef> = [(0.0, 0.0), (1.0, 0.0), (0.5, 1.0), (1.5, 1.0)]
            .iter()
            .map(|&(x, y)| m.vert_create(&mut log, Point3::new(x, y, 0.0), Vector3::z(), None))
            .collect();
        let f0 = m.face_create(&mut log, [v[0], v[1], v[2]], None, None);
        let f1 = m.face_create(&mut log, [v[1], v[3], v[2]], None, None);
        (m, v, vec![f0, f1])
    }

    #[test]
    fn test_face_remove_transfers_verts() {
        let (m, v, f) = two_tris();
        let mut leaves = LeafSet::new();
        let a = leaves.push_leaf(Point3::origin(), Point3::new(1.0, 1.0, 0.0), 16);
        let b = leaves.push_leaf(Point3::origin(), Point3::new(2.0, 1.0, 0.0), 16);
        leaves.assign_face(f[0], a);
        leaves.assign_face(f[1], b);
        for &vk in &v[..3] {
            leaves.assign_vert(vk, a);
        }
        leaves.assign_vert(v[3], b);

        face_remove(&m, &mut leaves, f[0], true, true);
        // v1 and v2 touch f1 which lives in leaf b
        assert_eq!(leaves.vert_leaf(v[1]), b);
        assert_eq!(leaves.vert_leaf(v[2]), b);
        // v0 has no other face anywhere: unowned, rebuild requested
        assert_eq!(leaves.vert_leaf(v[0]), NO_LEAF);
        assert!(leaves
            .leaf(a)
            .dirty
            .contains(LeafDirty::REBUILD_NODE_VERTS));
    }

    #[test]
    fn test_face_add_adopts_by_adjacency() {
        let (mut m, v, f) = two_tris();
        let mut log = NullLog;
        let mut leaves = LeafSet::new();
        let a = leaves.push_leaf(Point3::origin(), Point3::new(2.0, 1.0, 0.0), 16);
        leaves.assign_face(f[0], a);
        leaves.assign_face(f[1], a);

        let v4 = m.vert_create(&mut log, Point3::new(2.0, 0.0, 0.0), Vector3::z(), None);
        let nf = m.face_create(&mut log, [v[1], v4, v[3]], None, None);
        let mut hier = NeverPlace;
        let got = face_add(&m, &mut leaves, &mut hier, nf, false);
        assert_eq!(got, a);
        assert_eq!(leaves.face_leaf(nf), a);
        // the brand-new vertex was adopted by the same leaf
        assert_eq!(leaves.vert_leaf(v4), a);
        leaves.validate(&m).unwrap();
    }

    #[test]
    fn test_verify_integrity_catches_corruption() {
        let (m, _, f) = two_tris();
        let mut leaves = LeafSet::new();
        let a = leaves.push_leaf(Point3::origin(), Point3::new(2.0, 1.0, 0.0), 16);
        leaves.assign_face(f[0], a);
        leaves.verify_integrity().unwrap();
        // forge a bogus owner
        leaves.face_owner.insert(f[1], 99);
        assert!(leaves.verify_integrity().is_err());
        let _ = m;
    }
}
