//! Tangential vertex relaxation.
//!
//! Runs inside the parallel scan, so position writes go through per-axis
//! compare-and-swap retries instead of `&mut` access. Only vertices whose
//! boundary classification is current participate; a worker never
//! reclassifies.

use crate::annot::{VertState, VertTable};
use crate::mesh::{HeadFlags, TopoMesh};
use crate::store::VertRef;

/// How much of the normal component is removed from each neighbour offset.
const TANGENT_PROJECTION: f64 = 0.99;

/// Relaxes `v` toward the average of its same-boundary-class neighbours,
/// projected onto the tangent plane. Safe to call from scan workers.
pub fn smooth_vertex(mesh: &TopoMesh, annot: &VertTable, v: VertRef) {
    let Some(data) = annot.get(v) else {
        return;
    };
    if data.flags.contains(VertState::NEEDS_BOUNDARY) {
        return;
    }
    if data.flags.intersects(VertState::SMOOTH_CORNER) {
        return;
    }
    if mesh.vert_flags(v).contains(HeadFlags::HIDDEN) {
        return;
    }
    let class = data.flags & VertState::SMOOTH_BOUNDARY;

    let co = mesh.vert_co(v);
    let mut acc = nalgebra::Vector3::zeros();
    let mut count = 0usize;
    for e in mesh.vert_edges(v) {
        let v2 = mesh.edge_other_vert(e, v);
        let Some(d2) = annot.get(v2) else {
            continue;
        };
        if d2.flags.contains(VertState::NEEDS_BOUNDARY) {
            continue;
        }
        if (d2.flags & VertState::SMOOTH_BOUNDARY) != class {
            continue;
        }
        acc += mesh.vert_co(v2) - co;
        count += 1;
    }
    if count == 0 {
        return;
    }

    let mut offset = acc / count as f64;
    let no = mesh.vert_no(v);
    offset -= no * no.dot(&offset) * TANGENT_PROJECTION;

    // per-axis CAS: concurrent writers interleave but never lose a write
    let cell = mesh.vert_pos_cell(v);
    for axis in 0..3 {
        let delta = offset[axis];
        loop {
            let cur = cell.load()[axis];
            if cell.compare_exchange_axis(axis, cur, cur + delta) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use approx::relative_eq;
    use nalgebra::{Point3, Vector3};

    #[test]
    fn test_interior_vertex_relaxes_in_plane() {
        // 5x5 flat grid so the center vertex and its neighbours are all
        // interior; nudge the center and smooth it back
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let mut grid = vec![];
        for j in 0..5 {
            for i in 0..5 {
                let (x, y) = if (i, j) == (2, 2) {
                    (2.3, 2.1)
                } else {
                    (i as f64, j as f64)
                };
                grid.push(m.vert_create(&mut log, Point3::new(x, y, 0.0), Vector3::z(), None));
            }
        }
        for j in 0..4 {
            for i in 0..4 {
                let a = grid[j * 5 + i];
                let b = grid[j * 5 + i + 1];
                let c = grid[(j + 1) * 5 + i + 1];
                let d = grid[(j + 1) * 5 + i];
                m.face_create(&mut log, [a, b, c], None, None);
                m.face_create(&mut log, [a, c, d], None, None);
            }
        }
        let mut annot = VertTable::new();
        for v in m.vert_keys() {
            annot.check_boundary(&m, v);
        }
        let hub = grid[2 * 5 + 2];
        smooth_vertex(&m, &annot, hub);
        let co = m.vert_co(hub);
        // disk neighbours average to (2, 2); one full step lands there
        assert!(relative_eq!(co.x, 2.0, epsilon = 1e-9));
        assert!(relative_eq!(co.y, 2.0, epsilon = 1e-9));
        assert!(relative_eq!(co.z, 0.0, epsilon = 1e-9));
    }

    #[test]
    fn test_boundary_vertex_ignores_interior_neighbours() {
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let v: Vec<VertRef> = [(0.0, 0.0), (1.0, 0.0), (0.5, 1.0)]
            .iter()
            .map(|&(x, y)| m.vert_create(&mut log, Point3::new(x, y, 0.0), Vector3::z(), None))
            .collect();
        m.face_create(&mut log, [v[0], v[1], v[2]], None, None);
        let mut annot = VertTable::new();
        for &vk in &v {
            annot.check_boundary(&m, vk);
        }
        // every vertex of a lone triangle is a boundary corner: untouched
        let before = m.vert_co(v[0]);
        smooth_vertex(&m, &annot, v[0]);
        assert_eq!(m.vert_co(v[0]), before);
    }

    #[test]
    fn test_stale_classification_skips() {
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let a = m.vert_create(&mut log, Point3::origin(), Vector3::z(), None);
        let mut annot = VertTable::new();
        annot.ensure(&m, a);
        let before = m.vert_co(a);
        smooth_vertex(&m, &annot, a);
        assert_eq!(m.vert_co(a), before);
    }
}
