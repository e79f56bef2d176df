//! Valence cleanup.
//!
//! Interior vertices with three or four edges are dissolved: the vertex and
//! its triangle fan disappear and the hole is re-tessellated with one or two
//! triangles. For the quad case the diagonal whose two triangle normals
//! agree best wins, which keeps the patch as flat as the fan allowed.

use tracing::trace;

use crate::annot::{VertState, VertTable};
use crate::leaf::{self, Hierarchy, LeafDirty, LeafSet, NO_LEAF};
use crate::log::TopoLog;
use crate::mesh::{triangle_normal, HeadFlags, TopoMesh};
use crate::queue::Region;
use crate::store::{FaceRef, LoopRef, VertRef};
use crate::triangulate::ensure_vert_triangulated;

/// Cleanup looks a little past the brush so freshly made low-valence
/// vertices on the rim are caught.
const REGION_MARGIN: f64 = 1.25;

/// Dissolves valence-3/4 interior vertices from the watchlist. Returns how
/// many were removed.
pub fn cleanup_valence(
    mesh: &mut TopoMesh,
    annot: &mut VertTable,
    leaves: &mut LeafSet,
    hier: &mut dyn Hierarchy,
    log: &mut dyn TopoLog,
    watchlist: &[VertRef],
    region: &Region,
    deadline: Option<std::time::Instant>,
) -> usize {
    let mut removed = 0usize;
    for &v in watchlist {
        if let Some(deadline) = deadline {
            if std::time::Instant::now() >= deadline {
                break;
            }
        }
        if !mesh.has_vert(v) || mesh.vert_flags(v).contains(HeadFlags::HIDDEN) {
            continue;
        }
        if !region.vert_in_range_scaled(mesh.vert_co(v), REGION_MARGIN) {
            continue;
        }
        if mesh.disk_first(v).is_none() {
            continue;
        }

        ensure_vert_triangulated(mesh, annot, leaves, log, v);
        annot.check_boundary(mesh, v);
        let valence = annot.valence(mesh, v) as usize;
        if !(3..=4).contains(&valence) {
            continue;
        }
        let flags = annot.ensure(mesh, v).flags;
        if flags.intersects(VertState::ALL_BOUNDARY | VertState::ALL_CORNER) {
            continue;
        }

        if dissolve_vertex(mesh, annot, leaves, hier, log, v, valence) {
            removed += 1;
        }
    }
    removed
}

/// The ordered fan of loops at `v`, walking face to face across the disk.
/// None when the neighbourhood is not a clean interior fan.
fn fan_loops(mesh: &TopoMesh, v: VertRef, valence: usize) -> Option<Vec<LoopRef>> {
    let e0 = mesh.disk_first(v)?;
    let l0 = mesh
        .edge_loops(e0)
        .into_iter()
        .find(|&l| mesh.corner_vert(l) == v)?;

    let mut fan = Vec::with_capacity(valence);
    let mut l = l0;
    for _ in 0..valence {
        fan.push(l);
        // cross the incoming edge of this corner into the next face
        let lp = mesh.corner_prev(l);
        let (a, b) = mesh.edge_loop_pair(mesh.corner_edge(lp))?;
        let twin = if a == lp { b } else { a };
        let l_at_v = if mesh.corner_vert(twin) == v {
            twin
        } else {
            mesh.corner_next(twin)
        };
        if mesh.corner_vert(l_at_v) != v {
            return None;
        }
        l = l_at_v;
    }
    if l != l0 {
        return None;
    }
    Some(fan)
}

fn dissolve_vertex(
    mesh: &mut TopoMesh,
    annot: &mut VertTable,
    leaves: &mut LeafSet,
    hier: &mut dyn Hierarchy,
    log: &mut dyn TopoLog,
    v: VertRef,
    valence: usize,
) -> bool {
    let Some(fan) = fan_loops(mesh, v, valence) else {
        trace!(?v, "fan walk aborted, leaving vertex");
        return false;
    };

    // opposite-edge loops carry the ring vertices and the corner data the
    // replacement triangles copy positionally
    let ls: Vec<LoopRef> = fan.iter().map(|&l| mesh.corner_next(l)).collect();
    let ring: Vec<VertRef> = ls.iter().map(|&l| mesh.corner_vert(l)).collect();
    let fan_faces: Vec<FaceRef> = fan.iter().map(|&l| mesh.corner_face(l)).collect();

    // a clean fan has distinct ring vertices on distinct faces
    for i in 0..ring.len() {
        for j in (i + 1)..ring.len() {
            if ring[i] == ring[j] || fan_faces[i] == fan_faces[j] {
                trace!(?v, "degenerate fan, leaving vertex");
                return false;
            }
        }
    }

    let ring_blocks: Vec<_> = ls.iter().map(|&l| mesh.corner_attrs(l).clone()).collect();
    let (material, face_flags, face_attrs) = {
        let f = fan_faces[0];
        (
            mesh.face_material(f),
            mesh.face_flags(f) & !HeadFlags::TAG,
            mesh.face_attrs(f).clone(),
        )
    };

    let home = leaves.vert_leaf(v);
    leaf::vert_remove(leaves, v);
    for &f in &fan_faces {
        leaf::face_remove(mesh, leaves, f, false, false);
        mesh.face_kill(log, f);
    }

    // re-tessellate the hole
    let tris: Vec<[usize; 3]> = if valence == 3 {
        vec![[0, 1, 2]]
    } else {
        let co = |i: usize| mesh.vert_co(ring[i]);
        let first = triangle_normal(co(0), co(1), co(2))
            .dot(&triangle_normal(co(0), co(2), co(3)));
        let second = triangle_normal(co(1), co(2), co(3))
            .dot(&triangle_normal(co(1), co(3), co(0)));
        if first >= second {
            vec![[0, 1, 2], [0, 2, 3]]
        } else {
            vec![[1, 2, 3], [1, 3, 0]]
        }
    };

    for tri in tris {
        let nf = mesh.face_create(
            log,
            [ring[tri[0]], ring[tri[1]], ring[tri[2]]],
            None,
            None,
        );
        mesh.set_face_material(nf, material);
        mesh.face_flags_insert(nf, face_flags);
        mesh.set_face_attrs(nf, face_attrs.clone());
        for (l, src) in mesh.face_loops(nf).into_iter().zip(tri) {
            mesh.set_corner_attrs(l, ring_blocks[src].clone());
        }
        if home != NO_LEAF {
            leaves.assign_face(nf, home);
            leaves.mark_dirty(
                home,
                LeafDirty::REDRAW
                    | LeafDirty::UPDATE_BB
                    | LeafDirty::UPDATE_NORMALS
                    | LeafDirty::UPDATE_TRIS
                    | LeafDirty::UPDATE_TOPOLOGY,
            );
        } else {
            leaf::face_add(mesh, leaves, hier, nf, true);
        }
        for rv in [ring[tri[0]], ring[tri[1]], ring[tri[2]]] {
            annot.mark_topo_changed(mesh, rv);
        }
    }

    mesh.vert_kill(log, v);
    annot.remove(v);
    true
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

    fn wide_region() -> Region {
        Region {
            center: Point3::origin(),
            radius: 10.0,
            view_normal: None,
            projected: false,
        }
    }

    /// Hub at the origin ringed by `n` triangles.
    fn fan(n: usize) -> (TopoMesh, LeafSet, VertRef, Vec<VertRef>) {
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let hub = m.vert_create(&mut log, Point3::origin(), Vector3::z(), None);
        let ring: Vec<VertRef> = (0..n)
            .map(|i| {
                let a = i as f64 / n as f64 * std::f64::consts::TAU;
                m.vert_create(
                    &mut log,
                    Point3::new(a.cos(), a.sin(), 0.0),
                    Vector3::z(),
                    None,
                )
            })
            .collect();
        let mut leaves = LeafSet::new();
        let leaf = leaves.push_leaf(
            Point3::new(-2.0, -2.0, -1.0),
            Point3::new(2.0, 2.0, 1.0),
            64,
        );
        for i in 0..n {
            let f = m.face_create(&mut log, [hub, ring[i], ring[(i + 1) % n]], None, None);
            leaves.assign_face(f, leaf);
        }
        leaves.assign_vert(hub, leaf);
        for &r in &ring {
            leaves.assign_vert(r, leaf);
        }
        (m, leaves, hub, ring)
    }

    #[test]
    fn test_valence_four_dissolves_to_two_triangles() {
        let (mut m, mut leaves, hub, _ring) = fan(4);
        let mut annot = VertTable::new();
        let mut log = NullLog;
        let mut hier = NeverPlace;
        let n = cleanup_valence(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut hier,
            &mut log,
            &[hub],
            &wide_region(),
            None,
        );
        assert_eq!(n, 1);
        assert!(!m.has_vert(hub));
        assert_eq!(m.face_count(), 2);
        m.validate().unwrap();
        leaves.validate(&m).unwrap();
    }

    #[test]
    fn test_valence_three_dissolves_to_one_triangle() {
        let (mut m, mut leaves, hub, _ring) = fan(3);
        let mut annot = VertTable::new();
        let mut log = NullLog;
        let mut hier = NeverPlace;
        let n = cleanup_valence(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut hier,
            &mut log,
            &[hub],
            &wide_region(),
            None,
        );
        assert_eq!(n, 1);
        assert_eq!(m.face_count(), 1);
        m.validate().unwrap();
    }

    #[test]
    fn test_higher_valence_untouched() {
        let (mut m, mut leaves, hub, _ring) = fan(6);
        let mut annot = VertTable::new();
        let mut log = NullLog;
        let mut hier = NeverPlace;
        let n = cleanup_valence(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut hier,
            &mut log,
            &[hub],
            &wide_region(),
            None,
        );
        assert_eq!(n, 0);
        assert!(m.has_vert(hub));
        assert_eq!(m.face_count(), 6);
    }

    #[test]
    fn test_boundary_vertex_untouched() {
        // a lone triangle: every vertex is boundary, valence 2..3
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let v: Vec<VertRef> = [(0.0, 0.0), (1.0, 0.0), (0.0, 1.0)]
            .iter()
            .map(|&(x, y)| m.vert_create(&mut log, Point3::new(x, y, 0.0), Vector3::z(), None))
            .collect();
        let f = m.face_create(&mut log, [v[0], v[1], v[2]], None, None);
        let mut leaves = LeafSet::new();
        let leaf = leaves.push_leaf(Point3::new(-1.0, -1.0, -1.0), Point3::new(2.0, 2.0, 1.0), 8);
        leaves.assign_face(f, leaf);
        for &vk in &v {
            leaves.assign_vert(vk, leaf);
        }
        let mut annot = VertTable::new();
        let mut hier = NeverPlace;
        let n = cleanup_valence(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut hier,
            &mut log,
            &v,
            &wide_region(),
            None,
        );
        assert_eq!(n, 0);
        assert_eq!(m.face_count(), 1);
    }

    #[test]
    fn test_outside_region_skipped() {
        let (mut m, mut leaves, hub, _ring) = fan(4);
        let mut annot = VertTable::new();
        let mut log = NullLog;
        let mut hier = NeverPlace;
        let far = Region {
            center: Point3::new(100.0, 0.0, 0.0),
            radius: 1.0,
            view_normal: None,
            projected: false,
        };
        let n = cleanup_valence(
            &mut m, &mut annot, &mut leaves, &mut hier, &mut log, &[hub], &far, None,
        );
        assert_eq!(n, 0);
        assert_eq!(m.face_count(), 4);
    }
}
