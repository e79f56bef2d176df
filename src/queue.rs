//! Edge candidate queues.
//!
//! Queue construction is two-phase: a parallel scan over in-range leaves
//! fills per-thread scratch buffers (workers never mutate topology), then a
//! single-threaded merge dedupes the scratch and feeds the priority heap.
//! Candidates store the vertex pair rather than the edge, so entries whose
//! edge died under them are skipped at pop time.

use std::collections::BinaryHeap;

use itertools::Itertools;
use nalgebra::{Point3, Vector3};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::debug;

use crate::annot::{VertState, VertTable};
use crate::leaf::{LeafSet, NO_LEAF};
use crate::mesh::{HeadFlags, TopoMesh};
use crate::smooth;
use crate::store::{new_set, EdgeRef, FixedSet, LoopRef, VertRef};

/// Neighbour edges join the recursive expansion when they exceed the
/// current edge's length by this factor.
pub const EVEN_EDGELEN_FACTOR: f64 = 1.2;
/// The recursion-base length scales by this per generation.
pub const EVEN_GENERATION_SCALE: f64 = 1.6;
/// Depth past which the expansion starts honouring the front-face cull.
pub const DEPTH_START: u32 = 5;
/// Chance that a scanned vertex gets one relaxation step.
const SMOOTH_PROBABILITY: f64 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Subdivide,
    Collapse,
}

/// The query region: a sphere, or a disk projected along the view normal.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub center: Point3<f64>,
    pub radius: f64,
    pub view_normal: Option<Vector3<f64>>,
    pub projected: bool,
}

impl Region {
    pub fn radius_sq(&self) -> f64 {
        self.radius * self.radius
    }

    fn dist_sq(&self, p: Point3<f64>) -> f64 {
        let mut d = p - self.center;
        if self.projected {
            if let Some(n) = self.view_normal {
                d -= n * n.dot(&d);
            }
        }
        d.norm_squared()
    }

    pub fn vert_in_range(&self, co: Point3<f64>) -> bool {
        self.dist_sq(co) <= self.radius_sq()
    }

    /// Range test with a widened radius, for the cleanup pass margin.
    pub fn vert_in_range_scaled(&self, co: Point3<f64>, factor: f64) -> bool {
        self.dist_sq(co) <= self.radius_sq() * factor * factor
    }

    /// Cheap sphere test: nearest of corners, edge midpoints and centroid.
    /// The projected variant uses the exact closest point on the flattened
    /// triangle.
    pub fn tri_in_range(&self, tri: [Point3<f64>; 3]) -> bool {
        if self.projected {
            if let Some(n) = self.view_normal {
                let proj = |p: Point3<f64>| {
                    let d = p - self.center;
                    self.center + (d - n * n.dot(&d))
                };
                let close = closest_point_triangle(
                    self.center,
                    proj(tri[0]),
                    proj(tri[1]),
                    proj(tri[2]),
                );
                return (close - self.center).norm_squared() <= self.radius_sq();
            }
        }
        let [a, b, c] = tri;
        let mid = |p: Point3<f64>, q: Point3<f64>| Point3::from((p.coords + q.coords) * 0.5);
        let centroid = Point3::from((a.coords + b.coords + c.coords) / 3.0);
        let samples = [a, b, c, mid(a, b), mid(b, c), mid(c, a), centroid];
        samples
            .iter()
            .any(|&p| (p - self.center).norm_squared() <= self.radius_sq())
    }

    /// AABB prefilter for leaves.
    pub fn leaf_in_range(&self, bmin: Point3<f64>, bmax: Point3<f64>) -> bool {
        let clamped = Point3::new(
            self.center.x.clamp(bmin.x, bmax.x),
            self.center.y.clamp(bmin.y, bmax.y),
            self.center.z.clamp(bmin.z, bmax.z),
        );
        self.dist_sq(clamped) <= self.radius_sq()
    }
}

/// Closest point on triangle `abc` to `p` (standard Voronoi-region walk).
pub fn closest_point_triangle(
    p: Point3<f64>,
    a: Point3<f64>,
    b: Point3<f64>,
    c: Point3<f64>,
) -> Point3<f64> {
    let ab = b - a;
    let ac = c - a;
    let ap = p - a;
    let d1 = ab.dot(&ap);
    let d2 = ac.dot(&ap);
    if d1 <= 0.0 && d2 <= 0.0 {
        return a;
    }

    let bp = p - b;
    let d3 = ab.dot(&bp);
    let d4 = ac.dot(&bp);
    if d3 >= 0.0 && d4 <= d3 {
        return b;
    }

    let vc = d1 * d4 - d3 * d2;
    if vc <= 0.0 && d1 >= 0.0 && d3 <= 0.0 {
        let v = d1 / (d1 - d3);
        return a + ab * v;
    }

    let cp = p - c;
    let d5 = ab.dot(&cp);
    let d6 = ac.dot(&cp);
    if d6 >= 0.0 && d5 <= d6 {
        return c;
    }

    let vb = d5 * d2 - d1 * d6;
    if vb <= 0.0 && d2 >= 0.0 && d6 <= 0.0 {
        let w = d2 / (d2 - d6);
        return a + ac * w;
    }

    let va = d3 * d6 - d5 * d4;
    if va <= 0.0 && (d4 - d3) >= 0.0 && (d5 - d6) >= 0.0 {
        let w = (d4 - d3) / ((d4 - d3) + (d5 - d6));
        return b + (c - b) * w;
    }

    let denom = 1.0 / (va + vb + vc);
    let v = vb * denom;
    let w = vc * denom;
    a + ab * v + ac * w
}

/// A queued edge, identified by its endpoints so stale entries fail softly.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    prio: f64,
    v1: VertRef,
    v2: VertRef,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for Candidate {}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // ties break on the vertex pair so pops are reproducible
        self.prio
            .total_cmp(&other.prio)
            .then_with(|| self.v1.cmp(&other.v1))
            .then_with(|| self.v2.cmp(&other.v2))
    }
}

/// Edge length statistics gathered while the queue is built.
#[derive(Debug, Clone, Copy)]
pub struct QueueStats {
    pub count: usize,
    pub len_sum: f64,
    pub len_min: f64,
    pub len_max: f64,
}

impl Default for QueueStats {
    fn default() -> Self {
        Self {
            count: 0,
            len_sum: 0.0,
            len_min: f64::INFINITY,
            len_max: 0.0,
        }
    }
}

impl QueueStats {
    fn push(&mut self, len: f64) {
        self.count += 1;
        self.len_sum += len;
        self.len_min = self.len_min.min(len);
        self.len_max = self.len_max.max(len);
    }

    fn merge(&mut self, other: &QueueStats) {
        self.count += other.count;
        self.len_sum += other.len_sum;
        self.len_min = self.len_min.min(other.len_min);
        self.len_max = self.len_max.max(other.len_max);
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.len_sum / self.count as f64
        }
    }
}

pub struct EdgeQueue {
    heap: BinaryHeap<Candidate>,
    pub mode: QueueMode,
    pub region: Region,
    pub limit_len: f64,
    pub base_len: f64,
    pub stats: QueueStats,
}

impl EdgeQueue {
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Best remaining candidate: longest weighted edge for subdivide,
    /// shortest for collapse.
    pub fn pop_pair(&mut self) -> Option<(VertRef, VertRef)> {
        self.heap.pop().map(|c| (c.v1, c.v2))
    }
}

/// Immutable inputs of one scan.
pub struct ScanParams<'a> {
    pub mode: QueueMode,
    pub region: Region,
    /// Threshold edge length for this queue (upper bound for subdivide,
    /// lower bound for collapse).
    pub limit_len: f64,
    /// Base length of the even-subdivision recursion.
    pub base_len: f64,
    pub use_frontface: bool,
    pub mask_cb: Option<&'a (dyn Fn(VertRef) -> f64 + Sync)>,
    pub seed: u64,
    pub smooth: bool,
}

impl ScanParams<'_> {
    fn mask_weight(&self, v1: VertRef, v2: VertRef) -> f64 {
        match self.mask_cb {
            Some(cb) => 0.5 * (cb(v1) + cb(v2)),
            None => 1.0,
        }
    }
}

/// Per-worker scratch output.
struct LeafScan {
    edges: Vec<(VertRef, VertRef, f64)>,
    low_valence: Vec<VertRef>,
    stats: QueueStats,
}

/// Builds the queue for one remesh phase. Returns the queue plus the
/// vertices added to the valence watchlist.
pub fn build_queue(
    mesh: &TopoMesh,
    annot: &mut VertTable,
    leaves: &LeafSet,
    params: &ScanParams,
) -> (EdgeQueue, Vec<VertRef>) {
    let leaf_ids: Vec<u32> = (0..leaves.len() as u32)
        .filter(|&li| {
            let leaf = leaves.leaf(li);
            !leaf.faces.is_empty() && params.region.leaf_in_range(leaf.bmin, leaf.bmax)
        })
        .collect();

    // phase A: read-only workers, one leaf each
    let scans: Vec<LeafScan> = {
        let annot_view: &VertTable = annot;
        leaf_ids
            .par_iter()
            .map(|&li| scan_leaf(mesh, annot_view, leaves, li, params))
            .collect()
    };

    // phase B: merge in leaf order
    let mut q = EdgeQueue {
        heap: BinaryHeap::new(),
        mode: params.mode,
        region: params.region,
        limit_len: params.limit_len,
        base_len: params.base_len,
        stats: QueueStats::default(),
    };
    let mut seen_pairs: FixedSet<(VertRef, VertRef)> = new_set();
    let mut watchlist = Vec::new();
    for scan in &scans {
        q.stats.merge(&scan.stats);
        for &(v1, v2, prio) in &scan.edges {
            let pair = if v1 <= v2 { (v1, v2) } else { (v2, v1) };
            if seen_pairs.insert(pair) {
                q.heap.push(Candidate { prio, v1, v2 });
            }
        }
        for &v in &scan.low_valence {
            if !mesh.has_vert(v) {
                continue;
            }
            let valence = annot.valence(mesh, v);
            annot.check_boundary(mesh, v);
            if valence >= 5 {
                continue;
            }
            let data = annot.ensure(mesh, v);
            if data.flags.contains(VertState::VALENCE_SCRATCH) {
                continue;
            }
            data.flags |= VertState::VALENCE_SCRATCH;
            watchlist.push(v);
        }
    }
    debug!(
        mode = ?params.mode,
        candidates = q.len(),
        avg_len = q.stats.avg(),
        "edge queue built"
    );
    (q, watchlist)
}

fn scan_leaf(
    mesh: &TopoMesh,
    annot: &VertTable,
    leaves: &LeafSet,
    li: u32,
    params: &ScanParams,
) -> LeafScan {
    let mut out = LeafScan {
        edges: Vec::new(),
        low_valence: Vec::new(),
        stats: QueueStats::default(),
    };
    // stands in for the shared scratch tag bit: workers only dedupe their
    // own pushes, the merge dedupes globally
    let mut seen: FixedSet<EdgeRef> = new_set();
    let mut seen_verts: FixedSet<VertRef> = new_set();
    let mut rng = SmallRng::seed_from_u64(
        params.seed ^ (li as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15),
    );

    let faces: Vec<_> = leaves.leaf(li).faces.iter().copied().sorted().collect();

    for f in faces {
        if !mesh.has_face(f) || mesh.face_len(f) != 3 {
            continue;
        }
        if mesh.face_flags(f).contains(HeadFlags::HIDDEN) {
            continue;
        }
        let vs = mesh.face_verts(f);
        let cos = [
            mesh.vert_co(vs[0]),
            mesh.vert_co(vs[1]),
            mesh.vert_co(vs[2]),
        ];
        if !params.region.tri_in_range(cos) {
            continue;
        }
        if params.use_frontface {
            if let Some(vn) = params.region.view_normal {
                if mesh.face_no(f).dot(&vn) < 0.0 {
                    continue;
                }
            }
        }

        for (i, l) in mesh.face_loops(f).into_iter().enumerate() {
            let e = mesh.corner_edge(l);
            let (v1, v2) = mesh.edge_verts(e);
            let w = params.mask_weight(v1, v2);
            if params.mode == QueueMode::Collapse && w == 0.0 {
                continue;
            }
            let len_sq = mesh.edge_len_sq(e);
            let limit_sq = params.limit_len * params.limit_len;
            let qualified = match params.mode {
                QueueMode::Subdivide => len_sq * w * w > limit_sq,
                QueueMode::Collapse => len_sq * w * w < limit_sq,
            };
            if qualified {
                edge_add_recursive(
                    mesh,
                    params,
                    &mut out,
                    &mut seen,
                    l,
                    len_sq * w * w,
                    params.base_len,
                    0,
                );
            }

            // opportunistic relaxation while the cache is warm
            let v = vs[i];
            if params.smooth
                && params.region.vert_in_range(cos[i])
                && rng.random::<f64>() < SMOOTH_PROBABILITY
            {
                smooth::smooth_vertex(mesh, annot, v);
            }

            if seen_verts.insert(v) {
                let low = match annot.get(v) {
                    Some(d) => d.flags.contains(VertState::NEEDS_VALENCE) || d.valence < 5,
                    None => true,
                };
                if low && params.region.vert_in_range(cos[i]) {
                    out.low_valence.push(v);
                }
            }
        }
    }
    out
}

/// Even-subdivision expansion: a qualifying edge drags in radial-adjacent
/// edges whose weighted length clears both the relative factor and the
/// generation-scaled base length.
#[allow(clippy::too_many_arguments)]
fn edge_add_recursive(
    mesh: &TopoMesh,
    params: &ScanParams,
    out: &mut LeafScan,
    seen: &mut FixedSet<EdgeRef>,
    l_edge: LoopRef,
    len_sq_w: f64,
    limit_len: f64,
    depth: u32,
) {
    let e = mesh.corner_edge(l_edge);
    if !seen.insert(e) {
        return;
    }
    if depth > DEPTH_START && params.use_frontface {
        if let Some(vn) = params.region.view_normal {
            if mesh.face_no(mesh.corner_face(l_edge)).dot(&vn) < 0.0 {
                return;
            }
        }
    }

    let (v1, v2) = mesh.edge_verts(e);
    let prio = match params.mode {
        QueueMode::Subdivide => len_sq_w,
        QueueMode::Collapse => {
            let w = params.mask_weight(v1, v2);
            if w == 0.0 {
                return;
            }
            -(mesh.edge_len_sq(e) / (w * w))
        }
    };
    out.edges.push((v1, v2, prio));
    out.stats.push(mesh.edge_len_sq(e).sqrt());

    let (limit_next, len_sq_cmp) = match params.mode {
        QueueMode::Subdivide => (
            limit_len * EVEN_GENERATION_SCALE,
            len_sq_w * EVEN_EDGELEN_FACTOR,
        ),
        QueueMode::Collapse => (
            limit_len / EVEN_GENERATION_SCALE,
            len_sq_w * EVEN_EDGELEN_FACTOR,
        ),
    };
    let limit_sq = limit_next * limit_next;

    for l_iter in mesh.edge_loops(e) {
        for l_adj in [mesh.corner_next(l_iter), mesh.corner_prev(l_iter)] {
            let e_other = mesh.corner_edge(l_adj);
            if seen.contains(&e_other) {
                continue;
            }
            let (a, b) = mesh.edge_verts(e_other);
            let w = params.mask_weight(a, b);
            if params.mode == QueueMode::Collapse && w == 0.0 {
                continue;
            }
            let w_len = mesh.edge_len_sq(e_other) * w * w;
            let expand = match params.mode {
                QueueMode::Subdivide => w_len > len_sq_cmp.max(limit_sq),
                QueueMode::Collapse => w_len < len_sq_cmp.min(limit_sq),
            };
            if expand {
                edge_add_recursive(mesh, params, out, seen, l_adj, w_len, limit_next, depth + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ElemKey;
    use approx::relative_eq;

    #[test]
    fn test_closest_point_triangle_regions() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(2.0, 0.0, 0.0);
        let c = Point3::new(0.0, 2.0, 0.0);
        // inside projects straight down
        let p = closest_point_triangle(Point3::new(0.5, 0.5, 3.0), a, b, c);
        assert!(relative_eq!(p, Point3::new(0.5, 0.5, 0.0), epsilon = 1e-12));
        // corner region
        let p = closest_point_triangle(Point3::new(-1.0, -1.0, 0.0), a, b, c);
        assert!(relative_eq!(p, a, epsilon = 1e-12));
        // edge region
        let p = closest_point_triangle(Point3::new(1.0, -1.0, 0.0), a, b, c);
        assert!(relative_eq!(p, Point3::new(1.0, 0.0, 0.0), epsilon = 1e-12));
    }

    #[test]
    fn test_region_sphere() {
        let r = Region {
            center: Point3::origin(),
            radius: 1.0,
            view_normal: None,
            projected: false,
        };
        assert!(r.vert_in_range(Point3::new(0.5, 0.0, 0.0)));
        assert!(!r.vert_in_range(Point3::new(1.5, 0.0, 0.0)));
        assert!(r.vert_in_range_scaled(Point3::new(1.2, 0.0, 0.0), 1.25));
        let near = [
            Point3::new(0.9, 0.0, 0.0),
            Point3::new(5.0, 0.0, 0.0),
            Point3::new(5.0, 1.0, 0.0),
        ];
        assert!(r.tri_in_range(near));
    }

    #[test]
    fn test_region_projected_ignores_depth() {
        let r = Region {
            center: Point3::origin(),
            radius: 1.0,
            view_normal: Some(Vector3::z()),
            projected: true,
        };
        // far along the view axis but inside the projected disk
        assert!(r.vert_in_range(Point3::new(0.2, 0.2, 50.0)));
        assert!(!r.vert_in_range(Point3::new(2.0, 0.0, 0.0)));
    }

    #[test]
    fn test_candidate_ordering() {
        let mut heap = BinaryHeap::new();
        let v = |i| VertRef::new(i);
        heap.push(Candidate {
            prio: 1.0,
            v1: v(0),
            v2: v(1),
        });
        heap.push(Candidate {
            prio: 4.0,
            v1: v(2),
            v2: v(3),
        });
        heap.push(Candidate {
            prio: 2.0,
            v1: v(4),
            v2: v(5),
        });
        let order: Vec<f64> = std::iter::from_fn(|| heap.pop()).map(|c| c.prio).collect();
        assert_eq!(order, vec![4.0, 2.0, 1.0]);
    }
}
