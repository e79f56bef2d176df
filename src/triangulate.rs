//! N-gon triangulation.
//!
//! The remesher itself only ever makes triangles, but host data (and faces
//! mid-split) can be n-gons. Fans are flattened onto the face plane and ear
//! clipped; the resulting triangles take over the n-gon's leaf, attributes
//! and corner data positionally.

use earcut::Earcut;
use nalgebra::Vector3;
use tracing::warn;

use crate::annot::VertTable;
use crate::leaf::{self, LeafDirty, LeafSet, NO_LEAF};
use crate::log::TopoLog;
use crate::mesh::TopoMesh;
use crate::store::{FaceRef, VertRef};

/// A reusable polygon triangulator.
pub struct Triangulator {
    earcut: Option<Earcut<f64>>,
}

impl Triangulator {
    pub fn new() -> Self {
        Triangulator { earcut: None }
    }

    /// Triangulates the boundary of `f` (no holes) in the plane orthogonal
    /// to its normal. Returns index triples into the face's corner order.
    pub fn face_triangles(&mut self, mesh: &TopoMesh, f: FaceRef) -> Vec<(usize, usize, usize)> {
        // lazily initialize the ear clipper
        if self.earcut.is_none() {
            self.earcut = Some(Earcut::new());
        }
        let earcut = self.earcut.as_mut().expect("just initialized");

        let verts = mesh.face_verts(f);
        let no = mesh.face_no(f);
        let centroid = mesh.face_centroid(f);

        // build a tangent basis so the projection keeps the winding
        let axis = if no.x.abs() < no.y.abs() && no.x.abs() < no.z.abs() {
            Vector3::x()
        } else if no.y.abs() < no.z.abs() {
            Vector3::y()
        } else {
            Vector3::z()
        };
        let u = no.cross(&axis).normalize();
        let w = no.cross(&u);

        let flat: Vec<[f64; 2]> = verts
            .iter()
            .map(|&v| {
                let d = mesh.vert_co(v) - centroid;
                [d.dot(&u), d.dot(&w)]
            })
            .collect();

        let holes: Vec<usize> = vec![];
        let mut result: Vec<usize> = vec![];
        earcut.earcut(flat, &holes, &mut result);

        result
            .chunks_exact(3)
            .map(|chunk| (chunk[0], chunk[1], chunk[2]))
            .collect()
    }
}

impl Default for Triangulator {
    fn default() -> Self {
        Self::new()
    }
}

/// Replaces the n-gon `f` with triangles. Returns the replacement faces, or
/// an empty list when `f` was already a triangle.
pub fn triangulate_face(
    mesh: &mut TopoMesh,
    annot: &mut VertTable,
    leaves: &mut LeafSet,
    log: &mut dyn TopoLog,
    f: FaceRef,
) -> Vec<FaceRef> {
    if mesh.face_len(f) <= 3 {
        return Vec::new();
    }
    let mut tri = Triangulator::new();
    let triples = tri.face_triangles(mesh, f);
    if triples.is_empty() {
        warn!(?f, "ear clipping produced no triangles, leaving n-gon");
        return Vec::new();
    }

    let verts = mesh.face_verts(f);
    let corner_blocks: Vec<_> = mesh
        .face_loops(f)
        .iter()
        .map(|&l| mesh.corner_attrs(l).clone())
        .collect();
    let leaf = leaves.face_leaf(f);

    let mut out = Vec::with_capacity(triples.len());
    for &(a, b, c) in &triples {
        let nf = mesh.face_create(log, [verts[a], verts[b], verts[c]], None, Some(f));
        for (l, src) in mesh.face_loops(nf).into_iter().zip([a, b, c]) {
            mesh.set_corner_attrs(l, corner_blocks[src].clone());
        }
        out.push(nf);
    }

    leaf::face_remove(mesh, leaves, f, false, false);
    mesh.face_kill(log, f);

    for &nf in &out {
        if leaf != NO_LEAF {
            leaves.assign_face(nf, leaf);
            leaves.mark_dirty(
                leaf,
                LeafDirty::REDRAW | LeafDirty::UPDATE_NORMALS | LeafDirty::UPDATE_TRIS,
            );
        }
        for v in mesh.face_verts(nf) {
            annot.mark_topo_changed(mesh, v);
        }
    }
    out
}

/// Makes sure every face around `v` is a triangle.
pub fn ensure_vert_triangulated(
    mesh: &mut TopoMesh,
    annot: &mut VertTable,
    leaves: &mut LeafSet,
    log: &mut dyn TopoLog,
    v: VertRef,
) {
    loop {
        let Some(ngon) = mesh
            .vert_faces(v)
            .into_iter()
            .find(|&f| mesh.face_len(f) > 3)
        else {
            break;
        };
        triangulate_face(mesh, annot, leaves, log, ngon);
    }
    let data = annot.ensure(mesh, v);
    data.flags &= !crate::annot::VertState::NEEDS_TRIANGULATE;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use nalgebra::Point3;

    #[test]
    fn test_quad_triangulation() {
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let v: Vec<VertRef> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .map(|&(x, y)| m.vert_create(&mut log, Point3::new(x, y, 0.0), Vector3::z(), None))
            .collect();
        // build a quad by splitting one edge of a triangle and checking the
        // fan helper turns it back into triangles
        let f = m.face_create(&mut log, [v[0], v[1], v[2]], None, None);
        let e = m.edge_exists(v[0], v[1]).unwrap();
        let (nv, _) = m.edge_split(e, v[0], 0.5);
        assert_eq!(m.face_len(f), 4);

        let mut annot = VertTable::new();
        let mut leaves = LeafSet::new();
        let leaf = leaves.push_leaf(Point3::origin(), Point3::new(1.0, 1.0, 0.0), 16);
        leaves.assign_face(f, leaf);
        ensure_vert_triangulated(&mut m, &mut annot, &mut leaves, &mut log, nv);

        assert_eq!(m.face_count(), 2);
        m.validate().unwrap();
        for fk in m.face_keys() {
            assert_eq!(leaves.face_leaf(fk), leaf);
        }
        let _ = v[3];
    }
}
