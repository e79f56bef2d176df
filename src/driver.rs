//! The remesh driver.
//!
//! One `update_topology` call runs collapse, subdivide and cleanup (any
//! subset) against a query region, then settles leaf bookkeeping. Mutation
//! is single-threaded; only the queue scans fan out.

use std::time::{Duration, Instant};

use anyhow::Result;
use bitflags::bitflags;
use nalgebra::{Point3, Vector3};
use tracing::{debug, trace};

use crate::annot::{VertState, VertTable};
use crate::attrib::AttrLayout;
use crate::cleanup::cleanup_valence;
use crate::collapse::{collapse_short_edges, CollapseParams};
use crate::leaf::{self, Hierarchy, LeafDirty, LeafSet, NO_LEAF};
use crate::log::TopoLog;
use crate::mesh::TopoMesh;
use crate::queue::{build_queue, QueueMode, Region, ScanParams};
use crate::store::{EdgeRef, FaceRef, VertRef};
use crate::subdivide::subdivide_pending;

bitflags! {
    /// What a remesh call is allowed to do.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Mode: u32 {
        const COLLAPSE = 1 << 0;
        const SUBDIVIDE = 1 << 1;
        const CLEANUP = 1 << 2;
    }
}

/// Inputs of one `update_topology` call.
pub struct RemeshParams<'a> {
    pub center: Point3<f64>,
    pub radius: f64,
    pub view_normal: Option<Vector3<f64>>,
    pub mode: Mode,
    /// Edges shorter than this (mask-weighted) collapse.
    pub min_len: f64,
    /// Edges longer than this (mask-weighted) subdivide.
    pub max_len: f64,
    pub use_frontface: bool,
    pub use_projected: bool,
    /// Mirror axis of the host tool; recorded, not acted on.
    pub sym_axis: Option<u8>,
    /// Allow the hierarchy to split overgrown leaves at the end.
    pub update_hierarchy: bool,
    pub mask_cb: Option<&'a (dyn Fn(VertRef) -> f64 + Sync)>,
    pub stroke_id: u64,
    /// Seed for the stochastic smoothing dilution.
    pub seed: u64,
    /// Run the tangential relaxation inside the scans. Positions smoothed
    /// this way are restored through origdata, not the event log.
    pub smooth: bool,
    /// Coarse wall-clock budget; phases stop popping once it is spent.
    pub time_limit: Option<Duration>,
}

impl Default for RemeshParams<'_> {
    fn default() -> Self {
        Self {
            center: Point3::origin(),
            radius: 0.0,
            view_normal: None,
            mode: Mode::empty(),
            min_len: 0.0,
            max_len: f64::INFINITY,
            use_frontface: false,
            use_projected: false,
            sym_axis: None,
            update_hierarchy: true,
            mask_cb: None,
            stroke_id: 0,
            seed: 0,
            smooth: true,
            time_limit: None,
        }
    }
}

impl RemeshParams<'_> {
    fn region(&self) -> Region {
        Region {
            center: self.center,
            radius: self.radius,
            view_normal: self.view_normal,
            projected: self.use_projected,
        }
    }
}

/// Everything the remesher owns between calls.
#[derive(Debug, Default)]
pub struct RemeshContext {
    pub mesh: TopoMesh,
    pub annot: VertTable,
    pub leaves: LeafSet,
}

impl RemeshContext {
    pub fn new(
        vert_layout: AttrLayout,
        edge_layout: AttrLayout,
        face_layout: AttrLayout,
        loop_layout: AttrLayout,
    ) -> Self {
        Self {
            mesh: TopoMesh::new(vert_layout, edge_layout, face_layout, loop_layout),
            annot: VertTable::new(),
            leaves: LeafSet::new(),
        }
    }

    // ------------------------------------------------------------------
    // host-facing element operations (C1 + C3 kept in step)

    /// Creates a vertex, placing it into `target_leaf` or the first leaf
    /// whose box contains it.
    pub fn vert_create(
        &mut self,
        log: &mut dyn TopoLog,
        co: Point3<f64>,
        no: Vector3<f64>,
        target_leaf: Option<u32>,
        example: Option<VertRef>,
        stroke_id: u64,
    ) -> VertRef {
        let leaf = target_leaf.unwrap_or_else(|| {
            (0..self.leaves.len() as u32)
                .find(|&li| {
                    let node = self.leaves.leaf(li);
                    (0..3).all(|i| co[i] >= node.bmin[i] && co[i] <= node.bmax[i])
                })
                .unwrap_or(NO_LEAF)
        });
        leaf::vert_create_in_leaf(
            &mut self.mesh,
            &mut self.annot,
            &mut self.leaves,
            log,
            leaf,
            co,
            no,
            example,
            stroke_id,
        )
    }

    /// Creates a triangle and assigns it to a leaf by adjacency.
    pub fn face_create(
        &mut self,
        hier: &mut dyn Hierarchy,
        log: &mut dyn TopoLog,
        v: [VertRef; 3],
        e: Option<[EdgeRef; 3]>,
        example: Option<FaceRef>,
    ) -> FaceRef {
        let f = self.mesh.face_create(log, v, e, example);
        leaf::face_add(&self.mesh, &mut self.leaves, hier, f, false);
        for vk in v {
            self.annot.mark_topo_changed(&self.mesh, vk);
        }
        f
    }

    /// Removes a face from membership and the mesh.
    pub fn face_remove(&mut self, log: &mut dyn TopoLog, f: FaceRef) {
        for vk in self.mesh.face_verts(f) {
            self.annot.mark_topo_changed(&self.mesh, vk);
        }
        leaf::face_remove(&self.mesh, &mut self.leaves, f, true, true);
        self.mesh.face_kill(log, f);
    }

    /// Removes a vertex (and whatever still hangs off it).
    pub fn vert_remove(&mut self, log: &mut dyn TopoLog, v: VertRef) {
        for e in self.mesh.vert_edges(v) {
            let other = self.mesh.edge_other_vert(e, v);
            self.annot.mark_topo_changed(&self.mesh, other);
        }
        for f in self.mesh.vert_faces(v) {
            leaf::face_remove(&self.mesh, &mut self.leaves, f, true, true);
        }
        leaf::vert_remove(&mut self.leaves, v);
        self.annot.remove(v);
        self.mesh.vert_kill(log, v);
    }

    /// Re-homes a face, optionally forcing a full hierarchy walk.
    pub fn face_add(
        &mut self,
        hier: &mut dyn Hierarchy,
        f: FaceRef,
        force_tree_walk: bool,
    ) -> u32 {
        leaf::face_add(&self.mesh, &mut self.leaves, hier, f, force_tree_walk)
    }
}

/// Runs one remesh pass over the region. Returns whether topology changed.
pub fn update_topology(
    cx: &mut RemeshContext,
    hier: &mut dyn Hierarchy,
    log: &mut dyn TopoLog,
    params: &RemeshParams,
) -> Result<bool> {
    cx.leaves.verify_integrity()?;

    let region = params.region();
    let deadline = params.time_limit.map(|d| Instant::now() + d);
    let mut watchlist: Vec<VertRef> = Vec::new();
    let mut modified = false;

    trace!(
        mode = ?params.mode,
        radius = params.radius,
        sym_axis = ?params.sym_axis,
        "update_topology"
    );

    if params.mode.contains(Mode::COLLAPSE) && params.min_len > 0.0 {
        log.entry_open("collapse");
        let scan = ScanParams {
            mode: QueueMode::Collapse,
            region,
            limit_len: params.min_len,
            base_len: params.min_len,
            use_frontface: params.use_frontface,
            mask_cb: params.mask_cb,
            seed: params.seed,
            smooth: params.smooth,
        };
        let (mut q, watched) = build_queue(&cx.mesh, &mut cx.annot, &cx.leaves, &scan);
        watchlist.extend(watched);

        let max_steps = collapse_budget(params, &q.stats);
        let collapse = CollapseParams {
            mask_cb: params.mask_cb,
            stroke_id: params.stroke_id,
            max_steps,
            deadline,
        };
        let n = collapse_short_edges(
            &mut cx.mesh,
            &mut cx.annot,
            &mut cx.leaves,
            log,
            &mut q,
            &collapse,
        );
        modified |= n > 0;
    }

    if params.mode.contains(Mode::SUBDIVIDE) && params.max_len.is_finite() {
        log.entry_open("subdivide");
        let scan = ScanParams {
            mode: QueueMode::Subdivide,
            region,
            limit_len: params.max_len,
            base_len: params.max_len,
            use_frontface: params.use_frontface,
            mask_cb: params.mask_cb,
            seed: params.seed.wrapping_add(1),
            smooth: params.smooth,
        };
        let (mut q, watched) = build_queue(&cx.mesh, &mut cx.annot, &cx.leaves, &scan);
        watchlist.extend(watched);

        // mutate from a drained buffer so one split cannot reshuffle the
        // priorities of its queued neighbours
        let budget = subdivide_budget(params);
        let mut pending = Vec::new();
        while pending.len() < budget {
            let Some((v1, v2)) = q.pop_pair() else {
                break;
            };
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    break;
                }
            }
            if !cx.mesh.has_vert(v1) || !cx.mesh.has_vert(v2) {
                continue;
            }
            if cx.leaves.vert_leaf(v1) == NO_LEAF || cx.leaves.vert_leaf(v2) == NO_LEAF {
                continue;
            }
            if cx.mesh.edge_exists(v1, v2).is_none() {
                continue;
            }
            pending.push((v1, v2));
        }
        let stats = subdivide_pending(
            &mut cx.mesh,
            &mut cx.annot,
            &mut cx.leaves,
            hier,
            log,
            &pending,
            params.stroke_id,
        );
        modified |= stats.edges_split > 0;
    }

    if params.mode.contains(Mode::CLEANUP) && !params.mode.contains(Mode::SUBDIVIDE) {
        // no scan ran to feed the watchlist; walk the in-range leaves
        for li in 0..cx.leaves.len() as u32 {
            let node = cx.leaves.leaf(li);
            if !region.leaf_in_range(node.bmin, node.bmax) {
                continue;
            }
            let mut verts: Vec<VertRef> = node.verts.iter().copied().collect();
            verts.sort();
            for v in verts {
                if !cx.mesh.has_vert(v) || !region.vert_in_range(cx.mesh.vert_co(v)) {
                    continue;
                }
                if cx.annot.valence(&cx.mesh, v) >= 5 {
                    continue;
                }
                let data = cx.annot.ensure(&cx.mesh, v);
                if data.flags.contains(VertState::VALENCE_SCRATCH) {
                    continue;
                }
                data.flags |= VertState::VALENCE_SCRATCH;
                watchlist.push(v);
            }
        }
    }

    for &v in &watchlist {
        if let Some(data) = cx.annot.get_mut(v) {
            data.flags &= !VertState::VALENCE_SCRATCH;
        }
    }

    if params.mode.contains(Mode::CLEANUP) {
        log.entry_open("cleanup");
        let n = cleanup_valence(
            &mut cx.mesh,
            &mut cx.annot,
            &mut cx.leaves,
            hier,
            log,
            &watchlist,
            &region,
            deadline,
        );
        modified |= n > 0;
    }

    if modified {
        for li in 0..cx.leaves.len() as u32 {
            if cx.leaves.leaf(li).dirty.contains(LeafDirty::UPDATE_TOPOLOGY) {
                cx.leaves.leaf_mut(li).dirty &= !LeafDirty::UPDATE_TOPOLOGY;
                if params.update_hierarchy {
                    hier.ensure_node_limit(&mut cx.mesh, &mut cx.leaves, li);
                }
            }
        }
    }
    for li in 0..cx.leaves.len() as u32 {
        if cx.leaves.leaf(li).dirty.contains(LeafDirty::UPDATE_TRIS) {
            hier.check_tris(&cx.mesh, &mut cx.leaves, li);
            cx.leaves.leaf_mut(li).dirty &= !LeafDirty::UPDATE_TRIS;
        }
    }

    if cfg!(debug_assertions) && modified {
        cx.mesh.validate()?;
        cx.leaves.validate(&cx.mesh)?;
    }

    debug!(modified, "update_topology done");
    Ok(modified)
}

/// Steps allowed for one collapse phase. A queue full of pathologically
/// short edges is throttled so a single call cannot stall the stroke.
fn collapse_budget(params: &RemeshParams, stats: &crate::queue::QueueStats) -> usize {
    let base = (params.radius / params.min_len).powi(2) * std::f64::consts::PI;
    let mut scale = 1.0;
    if stats.count > 0 {
        let mid = 0.5 * params.min_len + 0.5 * stats.len_max;
        if mid > 0.0 {
            scale = (stats.avg() / mid).clamp(0.25, 5.0);
        }
    }
    (base * scale).ceil().max(0.0) as usize
}

fn subdivide_budget(params: &RemeshParams) -> usize {
    if params.max_len <= 0.0 {
        return 0;
    }
    ((params.radius / params.max_len).powi(2) * std::f64::consts::PI)
        .ceil()
        .max(0.0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::QueueStats;

    #[test]
    fn test_budgets_scale_with_radius() {
        let mut params = RemeshParams {
            radius: 10.0,
            min_len: 0.5,
            max_len: 1.0,
            ..Default::default()
        };
        let small = subdivide_budget(&params);
        params.radius = 20.0;
        assert!(subdivide_budget(&params) > small);
    }

    #[test]
    fn test_collapse_budget_throttles_skinny_queues() {
        let params = RemeshParams {
            radius: 10.0,
            min_len: 1.0,
            max_len: 2.0,
            ..Default::default()
        };
        let healthy = QueueStats {
            count: 100,
            len_sum: 95.0,
            len_min: 0.5,
            len_max: 1.0,
        };
        let skinny = QueueStats {
            count: 100,
            len_sum: 1.0,
            len_min: 0.005,
            len_max: 1.0,
        };
        assert!(collapse_budget(&params, &skinny) < collapse_budget(&params, &healthy));
    }
}
