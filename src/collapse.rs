//! Short-edge collapse.
//!
//! Candidates come out of the queue shortest-first; every pop revalidates
//! against the current mesh because earlier collapses invalidate
//! neighbours. A redirection map tracks where deleted vertices went so
//! stale queue entries can chase their survivor.

use std::time::Instant;

use tracing::{debug, trace};

use crate::annot::{VertState, VertTable};
use crate::attrib;
use crate::leaf::{self, LeafDirty, LeafSet, NO_LEAF};
use crate::log::TopoLog;
use crate::mesh::{HeadFlags, TopoMesh};
use crate::queue::{EdgeQueue, QueueMode};
use crate::store::{new_map, EdgeRef, FaceRef, FixedMap, VertRef};
use crate::triangulate::ensure_vert_triangulated;

/// Where collapsed vertices went: another vertex, or gone entirely.
/// Chains stay short because every key is killed as it is inserted.
pub type DeletedChain = FixedMap<VertRef, Option<VertRef>>;

/// Follows redirections until a live vertex (or nothing) remains.
fn resolve(chain: &DeletedChain, mut v: VertRef) -> Option<VertRef> {
    loop {
        match chain.get(&v) {
            None => return Some(v),
            Some(None) => return None,
            Some(Some(next)) => v = *next,
        }
    }
}

pub struct CollapseParams<'a> {
    pub mask_cb: Option<&'a (dyn Fn(VertRef) -> f64 + Sync)>,
    pub stroke_id: u64,
    pub max_steps: usize,
    pub deadline: Option<Instant>,
}

impl CollapseParams<'_> {
    fn mask_value(&self, mesh: &TopoMesh, v: VertRef) -> f64 {
        match self.mask_cb {
            Some(cb) => cb(v),
            None => mesh.vert_mask(v),
        }
    }

    fn mask_weight(&self, v1: VertRef, v2: VertRef) -> f64 {
        match self.mask_cb {
            Some(cb) => 0.5 * (cb(v1) + cb(v2)),
            None => 1.0,
        }
    }
}

/// Drains the short-edge queue. Returns the number of collapses performed.
pub fn collapse_short_edges(
    mesh: &mut TopoMesh,
    annot: &mut VertTable,
    leaves: &mut LeafSet,
    log: &mut dyn TopoLog,
    q: &mut EdgeQueue,
    params: &CollapseParams,
) -> usize {
    debug_assert_eq!(q.mode, QueueMode::Collapse);
    let limit_sq = q.limit_len * q.limit_len;
    let mut chain: DeletedChain = new_map();
    let mut steps = 0usize;

    while let Some((a0, b0)) = q.pop_pair() {
        if steps >= params.max_steps {
            debug!(steps, "collapse budget exhausted");
            break;
        }
        if let Some(deadline) = params.deadline {
            if Instant::now() >= deadline {
                debug!(steps, "collapse time budget exhausted");
                break;
            }
        }

        // chase both endpoints through earlier collapses
        let (Some(v1), Some(v2)) = (resolve(&chain, a0), resolve(&chain, b0)) else {
            continue;
        };
        if v1 == v2 || !mesh.has_vert(v1) || !mesh.has_vert(v2) {
            continue;
        }
        let Some(e) = mesh.edge_exists(v1, v2) else {
            continue;
        };
        if leaves.vert_leaf(v1) == NO_LEAF || leaves.vert_leaf(v2) == NO_LEAF {
            continue;
        }
        if mesh.edge_flags(e).contains(HeadFlags::HIDDEN)
            || mesh.vert_flags(v1).contains(HeadFlags::HIDDEN)
            || mesh.vert_flags(v2).contains(HeadFlags::HIDDEN)
        {
            continue;
        }

        // the neighbourhood may have grown since the scan
        let w = params.mask_weight(v1, v2);
        if w == 0.0 {
            continue;
        }
        if mesh.edge_len_sq(e) * w * w >= limit_sq {
            continue;
        }
        if mesh.edge_loop_pair(e).is_none() {
            trace!(?e, "skipping non-manifold collapse candidate");
            continue;
        }

        // boundary compatibility: never drag a boundary onto the interior,
        // never touch corners
        annot.check_boundary(mesh, v1);
        annot.check_boundary(mesh, v2);
        let f1 = annot.ensure(mesh, v1).flags;
        let f2 = annot.ensure(mesh, v2).flags;
        if (f1 & VertState::ALL_BOUNDARY) != (f2 & VertState::ALL_BOUNDARY) {
            continue;
        }
        if (f1 | f2).intersects(VertState::ALL_CORNER) {
            continue;
        }

        if collapse_edge(mesh, annot, leaves, log, &mut chain, e, v1, v2, params) {
            steps += 1;
        }
    }

    debug!(collapsed = steps, "collapse pass done");
    steps
}

/// Collapses `e`, folding the masked-out endpoint into the survivor.
#[allow(clippy::too_many_arguments)]
fn collapse_edge(
    mesh: &mut TopoMesh,
    annot: &mut VertTable,
    leaves: &mut LeafSet,
    log: &mut dyn TopoLog,
    chain: &mut DeletedChain,
    e: EdgeRef,
    v1: VertRef,
    v2: VertRef,
    params: &CollapseParams,
) -> bool {
    ensure_vert_triangulated(mesh, annot, leaves, log, v1);
    ensure_vert_triangulated(mesh, annot, leaves, log, v2);
    if !mesh.has_edge(e) {
        return false;
    }

    annot.check_origdata(mesh, v1, params.stroke_id);
    annot.check_origdata(mesh, v2, params.stroke_id);

    // a seam edge may only collapse if the chain continues on both sides
    if mesh.edge_flags(e).contains(HeadFlags::SEAM) {
        for v in [v1, v2] {
            let other_seams = mesh
                .vert_edges(v)
                .into_iter()
                .filter(|&o| o != e && mesh.edge_flags(o).contains(HeadFlags::SEAM))
                .count();
            if other_seams == 0 {
                trace!(?e, "collapse would truncate a seam chain");
                return false;
            }
        }
    }

    // survivor choice is mask-biased; ties keep the second endpoint
    let (v_del, v_conn) = if params.mask_value(mesh, v1) > params.mask_value(mesh, v2) {
        (v2, v1)
    } else {
        (v1, v2)
    };

    // blend the survivor's vertex data from both endpoints
    let blended = attrib::interp_equal(
        mesh.vert_layout,
        &[mesh.vert_attrs(v_del), mesh.vert_attrs(v_conn)],
    );
    mesh.set_vert_attrs(v_conn, blended);

    leaf::vert_remove(leaves, v_del);

    // faces on the edge die; their other two edges merge flag-wise
    for l in mesh.edge_loops(e) {
        let f = mesh.corner_face(l);
        let ea = mesh.corner_edge(mesh.corner_next(l));
        let eb = mesh.corner_edge(mesh.corner_prev(l));
        let combined =
            (mesh.edge_flags(ea) | mesh.edge_flags(eb)) & !(HeadFlags::HIDDEN | HeadFlags::TAG);
        mesh.edge_flags_insert(ea, combined);
        mesh.edge_flags_insert(eb, combined);
        for v in mesh.face_verts(f) {
            annot.mark_topo_changed(mesh, v);
        }
        leaf::face_remove(mesh, leaves, f, false, false);
        mesh.face_kill(log, f);
    }
    mesh.edge_kill(log, e);

    // rewrite the remaining fan of v_del onto v_conn
    let mut kill_faces: Vec<FaceRef> = Vec::new();
    let mut swaps: Vec<(EdgeRef, EdgeRef)> = Vec::new();
    for l in mesh.vert_loops(v_del) {
        let f = mesh.corner_face(l);
        if !kill_faces.contains(&f) {
            kill_faces.push(f);
        }
        let la = mesh.corner_next(l);
        let lb = mesh.corner_prev(l);
        let a = mesh.corner_vert(la);
        let b = mesh.corner_vert(lb);
        if a == v_conn || b == v_conn {
            continue;
        }
        if let Some(dup) = mesh.face_exists_tri_from_loop_vert(la, v_conn) {
            // creating the rewrite would duplicate this face; drop it too
            if !kill_faces.contains(&dup) {
                kill_faces.push(dup);
            }
            continue;
        }

        let old_leaf = leaves.face_leaf(f);
        let corner_blocks = [
            mesh.corner_attrs(l).clone(),
            mesh.corner_attrs(la).clone(),
            mesh.corner_attrs(lb).clone(),
        ];
        let nf = mesh.face_create(log, [v_conn, a, b], None, Some(f));
        for (nl, block) in mesh.face_loops(nf).into_iter().zip(corner_blocks) {
            mesh.set_corner_attrs(nl, block);
        }
        // crease/seam data rides the edge attribute blocks
        for (vd, vo) in [(v_del, a), (v_del, b)] {
            if let (Some(old_e), Some(new_e)) =
                (mesh.edge_exists(vd, vo), mesh.edge_exists(v_conn, vo))
            {
                swaps.push((old_e, new_e));
                let fl = mesh.edge_flags(old_e) & (HeadFlags::SEAM | HeadFlags::SHARP);
                mesh.edge_flags_insert(new_e, fl);
            }
        }
        if old_leaf != NO_LEAF {
            leaves.assign_face(nf, old_leaf);
            leaves.mark_dirty(
                old_leaf,
                LeafDirty::REDRAW
                    | LeafDirty::UPDATE_BB
                    | LeafDirty::UPDATE_NORMALS
                    | LeafDirty::UPDATE_TRIS
                    | LeafDirty::UPDATE_TOPOLOGY,
            );
        }
        for v in [v_conn, a, b] {
            annot.mark_topo_changed(mesh, v);
        }
    }
    for (old_e, new_e) in swaps {
        if mesh.has_edge(old_e) && mesh.has_edge(new_e) {
            let mut a = mesh.edge_attrs(old_e).clone();
            let mut b = mesh.edge_attrs(new_e).clone();
            attrib::swap(&mut a, &mut b);
            mesh.set_edge_attrs(old_e, a);
            mesh.set_edge_attrs(new_e, b);
        }
    }

    // snap corner data: one blend across both rings, written everywhere,
    // so the collapse leaves no attribute seams
    let ring: Vec<_> = mesh
        .vert_loops(v_del)
        .into_iter()
        .chain(mesh.vert_loops(v_conn))
        .collect();
    if !ring.is_empty() {
        let blocks: Vec<&attrib::AttrBlock> =
            ring.iter().map(|&l| mesh.corner_attrs(l)).collect();
        let snapped = attrib::interp_equal(mesh.loop_layout, &blocks);
        for &l in &ring {
            mesh.set_corner_attrs(l, snapped.clone());
        }
    }

    // drop the old fan, wire edges and orphans
    for f in kill_faces {
        if !mesh.has_face(f) {
            continue;
        }
        let f_edges: Vec<EdgeRef> = mesh
            .face_loops(f)
            .into_iter()
            .map(|l| mesh.corner_edge(l))
            .collect();
        let f_verts = mesh.face_verts(f);
        leaf::face_remove(mesh, leaves, f, false, false);
        mesh.face_kill(log, f);
        for fe in f_edges {
            if mesh.has_edge(fe) && mesh.edge_is_wire(fe) {
                mesh.edge_kill(log, fe);
            }
        }
        for fv in f_verts {
            if fv == v_del || !mesh.has_vert(fv) {
                continue;
            }
            if mesh.vert_edges(fv).is_empty() {
                leaf::vert_remove(leaves, fv);
                chain.insert(fv, None);
                mesh.vert_kill(log, fv);
                annot.remove(fv);
            }
        }
    }

    // settle the survivor halfway and mix the normals
    if mesh.has_vert(v_conn) {
        let old_co = mesh.vert_co(v_conn);
        log.vert_modified(v_conn, old_co);
        let mid = nalgebra::Point3::from((old_co.coords + mesh.vert_co(v_del).coords) * 0.5);
        mesh.set_vert_co(v_conn, mid);
        let no = (mesh.vert_no(v_conn) + mesh.vert_no(v_del))
            .try_normalize(1.0e-30)
            .unwrap_or_else(|| mesh.vert_no(v_conn));
        mesh.set_vert_no(v_conn, no);

        annot.mark_topo_changed(mesh, v_conn);
        for ve in mesh.vert_edges(v_conn) {
            let other = mesh.edge_other_vert(ve, v_conn);
            annot.mark_topo_changed(mesh, other);
        }
        for f in mesh.vert_faces(v_conn) {
            mesh.face_normal_update(f);
            let leaf = leaves.face_leaf(f);
            leaves.mark_dirty(
                leaf,
                LeafDirty::REDRAW
                    | LeafDirty::UPDATE_BB
                    | LeafDirty::UPDATE_NORMALS
                    | LeafDirty::UPDATE_TRIS,
            );
        }
        chain.insert(v_del, Some(v_conn));
    } else {
        chain.insert(v_del, None);
    }

    if mesh.has_vert(v_del) {
        mesh.vert_kill(log, v_del);
    }
    annot.remove(v_del);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{build_queue, Region, ScanParams};
    use nalgebra::{Point3, Vector3};

    fn collapse_params(max_steps: usize) -> CollapseParams<'static> {
        CollapseParams {
            mask_cb: None,
            stroke_id: 1,
            max_steps,
            deadline: None,
        }
    }

    /// 2x2 quad sheet triangulated along one diagonal.
    fn quad_sheet() -> (TopoMesh, LeafSet, Vec<VertRef>) {
        let mut m = TopoMesh::default();
        let mut log = crate::log::NullLog;
        let v: Vec<VertRef> = [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)]
            .iter()
            .map(|&(x, y)| m.vert_create(&mut log, Point3::new(x, y, 0.0), Vector3::z(), None))
            .collect();
        let f0 = m.face_create(&mut log, [v[0], v[1], v[2]], None, None);
        let f1 = m.face_create(&mut log, [v[0], v[2], v[3]], None, None);
        let mut leaves = LeafSet::new();
        let leaf = leaves.push_leaf(
            Point3::new(-1.0, -1.0, -1.0),
            Point3::new(2.0, 2.0, 1.0),
            64,
        );
        leaves.assign_face(f0, leaf);
        leaves.assign_face(f1, leaf);
        for &vk in &v {
            leaves.assign_vert(vk, leaf);
        }
        (m, leaves, v)
    }

    fn short_queue(
        mesh: &TopoMesh,
        annot: &mut VertTable,
        leaves: &LeafSet,
        min_len: f64,
    ) -> EdgeQueue {
        let params = ScanParams {
            mode: QueueMode::Collapse,
            region: Region {
                center: Point3::new(0.5, 0.5, 0.0),
                radius: 10.0,
                view_normal: None,
                projected: false,
            },
            limit_len: min_len,
            base_len: min_len,
            use_frontface: false,
            mask_cb: None,
            seed: 42,
            smooth: false,
        };
        build_queue(mesh, annot, leaves, &params).0
    }

    #[test]
    fn test_collapse_diagonal_of_sheet() {
        let (mut m, mut leaves, _v) = quad_sheet();
        let mut annot = VertTable::new();
        let mut q = short_queue(&m, &mut annot, &leaves, 2.0);
        assert!(!q.is_empty());
        let mut log = crate::log::NullLog;
        let n = collapse_short_edges(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut log,
            &mut q,
            &collapse_params(100),
        );
        // the diagonal is the only manifold edge; its collapse consumes both
        // faces, leaving the merged vertex plus the far corners on wire
        assert_eq!(n, 1);
        assert_eq!(m.face_count(), 0);
        assert_eq!(m.vert_count(), 3);
        m.validate().unwrap();
    }

    #[test]
    fn test_budget_limits_steps() {
        let (mut m, mut leaves, _v) = quad_sheet();
        let mut annot = VertTable::new();
        let mut q = short_queue(&m, &mut annot, &leaves, 2.0);
        let mut log = crate::log::NullLog;
        let n = collapse_short_edges(
            &mut m,
            &mut annot,
            &mut leaves,
            &mut log,
            &mut q,
            &collapse_params(0),
        );
        assert_eq!(n, 0);
        assert_eq!(m.face_count(), 2);
    }

    #[test]
    fn test_mask_chooses_survivor() {
        let (mut m, mut leaves, v) = quad_sheet();
        let mut annot = VertTable::new();
        let mut q = short_queue(&m, &mut annot, &leaves, 2.0);
        let mut log = crate::log::NullLog;
        let protect = v[0];
        let mask = move |vk: VertRef| if vk == protect { 1.0 } else { 0.5 };
        let params = CollapseParams {
            mask_cb: Some(&mask),
            stroke_id: 1,
            max_steps: 100,
            deadline: None,
        };
        collapse_short_edges(&mut m, &mut annot, &mut leaves, &mut log, &mut q, &params);
        // v0 carries the higher mask, so it survives the diagonal collapse
        assert!(m.has_vert(v[0]));
        assert!(!m.has_vert(v[2]));
    }

    #[test]
    fn test_deleted_chain_resolution() {
        let mut chain: DeletedChain = new_map();
        let v = |i| {
            use crate::store::ElemKey;
            VertRef::new(i)
        };
        chain.insert(v(1), Some(v(2)));
        chain.insert(v(2), Some(v(3)));
        chain.insert(v(4), None);
        assert_eq!(resolve(&chain, v(1)), Some(v(3)));
        assert_eq!(resolve(&chain, v(3)), Some(v(3)));
        assert_eq!(resolve(&chain, v(4)), None);
    }
}
