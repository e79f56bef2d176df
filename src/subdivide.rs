//! Bulk edge subdivision.
//!
//! Two phases: every pending edge is split at its midpoint (incident
//! triangles become quads/pentagons/hexagons), then each affected face is
//! re-triangulated by cutting the diagonals a fixed pattern table dictates.
//! The table is indexed by the bitmask of which corner slots of the enlarged
//! face hold midpoint vertices, counted from the face's first loop. The
//! table is data: two implementations that share it produce the same output
//! triangulation.

use tracing::warn;

use crate::annot::VertTable;
use crate::leaf::{self, Hierarchy, LeafDirty, LeafSet, NO_LEAF};
use crate::log::{edge_split_log, TopoLog};
use crate::mesh::{HeadFlags, TopoMesh};
use crate::store::{EdgeRef, FaceRef, VertRef};
use crate::triangulate::ensure_vert_triangulated;

/// Diagonals to cut, per midpoint-slot mask. Entries exist for every
/// rotation of the three base patterns (one midpoint, two midpoints, three
/// midpoints); the rest are unreachable and flagged `None`.
///
/// Slot pairs index corners of the enlarged face counted from its first
/// loop. Earlier cuts shrink the face, so later pairs are located by vertex
/// rather than position.
const SPLIT_PATTERNS: [Option<&[(u8, u8)]>; 43] = {
    let mut table: [Option<&[(u8, u8)]>; 43] = [None; 43];
    table[0] = Some(&[]);
    // quad, one midpoint: cut to the opposite corner
    table[1 << 0] = Some(&[(0, 2)]);
    table[1 << 1] = Some(&[(1, 3)]);
    table[1 << 2] = Some(&[(2, 0)]);
    table[1 << 3] = Some(&[(3, 1)]);
    // pentagon, midpoints two slots apart: fan out of the first midpoint
    table[0b00101] = Some(&[(0, 2), (0, 3)]);
    table[0b01010] = Some(&[(1, 3), (1, 4)]);
    table[0b10100] = Some(&[(2, 4), (2, 0)]);
    table[0b01001] = Some(&[(3, 0), (3, 1)]);
    table[0b10010] = Some(&[(4, 1), (4, 2)]);
    // hexagon, all three edges split: the inner triangle
    table[0b101010] = Some(&[(1, 3), (3, 5), (5, 1)]);
    table[0b010101] = Some(&[(0, 2), (2, 4), (4, 0)]);
    table
};

#[derive(Debug, Default, Clone, Copy)]
pub struct SubdivideStats {
    pub edges_split: usize,
    pub faces_cut: usize,
}

/// Splits every pending edge and re-triangulates the fallout.
///
/// `pending` holds endpoint pairs collected from the queue; pairs whose
/// edge or ownership did not survive earlier pops are skipped.
pub fn subdivide_pending(
    mesh: &mut TopoMesh,
    annot: &mut VertTable,
    leaves: &mut LeafSet,
    hier: &mut dyn Hierarchy,
    log: &mut dyn TopoLog,
    pending: &[(VertRef, VertRef)],
    stroke_id: u64,
) -> SubdivideStats {
    let mut stats = SubdivideStats::default();

    // resolve pairs into live edges; host n-gons around the endpoints are
    // triangulated now, before any split makes transient quads of its own
    let mut edges: Vec<EdgeRef> = Vec::with_capacity(pending.len());
    for &(v1, v2) in pending {
        if !mesh.has_vert(v1) || !mesh.has_vert(v2) {
            continue;
        }
        if leaves.vert_leaf(v1) == NO_LEAF || leaves.vert_leaf(v2) == NO_LEAF {
            continue;
        }
        if mesh.edge_exists(v1, v2).is_none() {
            continue;
        }
        ensure_vert_triangulated(mesh, annot, leaves, log, v1);
        ensure_vert_triangulated(mesh, annot, leaves, log, v2);
        if let Some(e) = mesh.edge_exists(v1, v2) {
            edges.push(e);
        }
    }

    // clear stale scratch bits around everything we are about to touch,
    // then tag the pending set
    for &e in &edges {
        for l in mesh.edge_loops(e) {
            let f = mesh.corner_face(l);
            mesh.face_flags_remove(f, HeadFlags::TAG);
            for fl in mesh.face_loops(f) {
                let fv = mesh.corner_vert(fl);
                let fe = mesh.corner_edge(fl);
                mesh.vert_flags_remove(fv, HeadFlags::TAG);
                mesh.edge_flags_remove(fe, HeadFlags::TAG);
            }
        }
        let (v1, v2) = mesh.edge_verts(e);
        mesh.vert_flags_remove(v1, HeadFlags::TAG);
        mesh.vert_flags_remove(v2, HeadFlags::TAG);
    }
    for &e in &edges {
        mesh.edge_flags_insert(e, HeadFlags::TAG);
    }

    // phase 1: mark and midpoint
    let mut affected: Vec<FaceRef> = Vec::new();
    for &e in &edges {
        if !mesh.has_edge(e) || !mesh.edge_flags(e).contains(HeadFlags::TAG) {
            continue;
        }
        let (v1, v2) = mesh.edge_verts(e);
        let (nv, ne) = edge_split_log(mesh, log, e, v1, 0.5);
        mesh.edge_flags_remove(e, HeadFlags::TAG);
        mesh.edge_flags_remove(ne, HeadFlags::TAG);
        mesh.vert_flags_insert(nv, HeadFlags::TAG);
        stats.edges_split += 1;

        annot.ensure(mesh, nv);
        annot.check_origdata(mesh, nv, stroke_id);
        annot.mark_topo_changed(mesh, v1);
        annot.mark_topo_changed(mesh, v2);

        // midpoint ownership: endpoint leaves first, face walk as fallback,
        // the hierarchy itself only at driver time
        let mut owner = leaves.vert_leaf(v1);
        if owner == NO_LEAF {
            owner = leaves.vert_leaf(v2);
        }
        if owner == NO_LEAF {
            for probe in [nv, v1, v2] {
                for f in mesh.vert_faces(probe) {
                    let leaf = leaves.face_leaf(f);
                    if leaf != NO_LEAF {
                        owner = leaf;
                        break;
                    }
                }
                if owner != NO_LEAF {
                    break;
                }
            }
        }
        if owner != NO_LEAF {
            leaves.assign_vert(nv, owner);
            leaves.mark_dirty(
                owner,
                LeafDirty::REDRAW | LeafDirty::UPDATE_BB | LeafDirty::UPDATE_OTHER_VERTS,
            );
        } else {
            warn!(?nv, "split midpoint has no adoptable leaf");
        }

        for f in mesh.vert_faces(nv) {
            if !affected.contains(&f) {
                affected.push(f);
            }
        }
    }

    // phase 2: cut each affected face back into triangles
    for &f in &affected {
        if !mesh.has_face(f) || mesh.face_len(f) == 3 {
            continue;
        }
        let loops = mesh.face_loops(f);
        if loops.len() > 6 {
            warn!(?f, len = loops.len(), "face grew past the pattern table");
            continue;
        }
        let slot_verts: Vec<VertRef> = loops.iter().map(|&l| mesh.corner_vert(l)).collect();
        let mut mask = 0usize;
        for (i, &v) in slot_verts.iter().enumerate() {
            if mesh.vert_flags(v).contains(HeadFlags::TAG) {
                mask |= 1 << i;
            }
        }
        if mask == 0 {
            continue;
        }
        let Some(Some(diagonals)) = SPLIT_PATTERNS.get(mask).copied() else {
            warn!(?f, mask, "midpoint mask outside the pattern table");
            continue;
        };

        let owner = leaves.face_leaf(f);
        let mut parts = vec![f];
        for &(a, b) in diagonals {
            let va = slot_verts[a as usize];
            let vb = slot_verts[b as usize];
            // earlier diagonals replaced f with a ring of parts; cut the
            // one still holding both corners
            let mut cut = None;
            for &p in &parts {
                if let Some((f2, _)) = mesh.face_split(log, p, va, vb) {
                    cut = Some(f2);
                    break;
                }
            }
            match cut {
                Some(f2) => parts.push(f2),
                None => warn!(?f, ?va, ?vb, "pattern diagonal found no face to cut"),
            }
        }
        stats.faces_cut += 1;

        for &p in parts.iter().skip(1) {
            if owner != NO_LEAF {
                leaves.assign_face(p, owner);
                leaves.mark_dirty(
                    owner,
                    LeafDirty::REDRAW
                        | LeafDirty::UPDATE_BB
                        | LeafDirty::UPDATE_NORMALS
                        | LeafDirty::UPDATE_TRIS
                        | LeafDirty::UPDATE_TOPOLOGY,
                );
            } else {
                leaf::face_add(mesh, leaves, hier, p, true);
            }
        }
        if owner != NO_LEAF {
            leaves.mark_dirty(
                owner,
                LeafDirty::REDRAW
                    | LeafDirty::UPDATE_NORMALS
                    | LeafDirty::UPDATE_TRIS
                    | LeafDirty::UPDATE_TOPOLOGY,
            );
        }
        for &p in &parts {
            for v in mesh.face_verts(p) {
                annot.mark_topo_changed(mesh, v);
            }
        }
    }

    // drop the midpoint scratch marks
    for &f in &affected {
        if !mesh.has_face(f) {
            continue;
        }
        for l in mesh.face_loops(f) {
            mesh.vert_flags_remove(mesh.corner_vert(l), HeadFlags::TAG);
            mesh.edge_flags_remove(mesh.corner_edge(l), HeadFlags::TAG);
        }
        mesh.face_flags_remove(f, HeadFlags::TAG);
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use nalgebra::{Point3, Vector3};

    struct NeverPlace;
    impl Hierarchy for NeverPlace {
        fn insert_face(&mut self, _: &TopoMesh, _: &LeafSet, _: FaceRef) -> Option<u32> {
            None
        }
        fn ensure_node_limit(&mut self, _: &mut TopoMesh, _: &mut LeafSet, _: u32) {}
        fn check_tris(&mut self, _: &TopoMesh, _: &mut LeafSet, _: u32) {}
    }

    fn one_tri() -> (TopoMesh, LeafSet, Vec<VertRef>, FaceRef) {
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let v: Vec<VertRef> = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]
            .iter()
            .map(|&(x, y)| m.vert_create(&mut log, Point3::new(x, y, 0.0), Vector3::z(), None))
            .collect();
        let f = m.face_create(&mut log, [v[0], v[1], v[2]], None, None);
        let mut leaves = LeafSet::new();
        let leaf = leaves.push_leaf(
            Point3::new(-1.0, -1.0, -1.0),
            Point3::new(2.0, 2.0, 1.0),
            64,
        );
        leaves.assign_face(f, leaf);
        for &vk in &v {
            leaves.assign_vert(vk, leaf);
        }
        (m, leaves, v, f)
    }

    #[test]
    fn test_pattern_table_shape() {
        // exactly the rotations of the three base patterns are populated
        let populated: Vec<usize> = (0..43).filter(|&i| SPLIT_PATTERNS[i].is_some()).collect();
        assert_eq!(
            populated,
            vec![0, 1, 2, 4, 5, 8, 9, 10, 18, 20, 21, 42]
        );
        for (mask, entry) in SPLIT_PATTERNS.iter().enumerate() {
            if let Some(diags) = entry {
                assert_eq!(diags.len(), mask.count_ones() as usize);
            }
        }
    }

    #[test]
    fn test_split_one_edge() {
        let (mut m, mut leaves, v, _f) = one_tri();
        let mut annot = VertTable::new();
        let mut log = NullLog;
        let mut hier = NeverPlace;
        let stats = subdivide_pending(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut hier,
            &mut log,
            &[(v[0], v[1])],
            1,
        );
        assert_eq!(stats.edges_split, 1);
        assert_eq!(m.face_count(), 2);
        assert_eq!(m.vert_count(), 4);
        m.validate().unwrap();
        leaves.validate(&m).unwrap();
        // no scratch marks survive the pass
        for vk in m.vert_keys() {
            assert!(!m.vert_flags(vk).contains(HeadFlags::TAG));
        }
    }

    #[test]
    fn test_split_all_three_edges() {
        let (mut m, mut leaves, v, _f) = one_tri();
        let mut annot = VertTable::new();
        let mut log = NullLog;
        let mut hier = NeverPlace;
        let stats = subdivide_pending(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut hier,
            &mut log,
            &[(v[0], v[1]), (v[1], v[2]), (v[2], v[0])],
            1,
        );
        assert_eq!(stats.edges_split, 3);
        // the classic 1-to-4 split
        assert_eq!(m.face_count(), 4);
        assert_eq!(m.vert_count(), 6);
        m.validate().unwrap();
        leaves.validate(&m).unwrap();
    }

    #[test]
    fn test_stale_pairs_are_skipped() {
        let (mut m, mut leaves, v, _f) = one_tri();
        let mut annot = VertTable::new();
        let mut log = NullLog;
        let mut hier = NeverPlace;
        let stats = subdivide_pending(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut hier,
            &mut log,
            &[(v[0], v[0]), (v[1], v[1])],
            1,
        );
        assert_eq!(stats.edges_split, 0);
        assert_eq!(m.face_count(), 1);
    }
}
