//! Topological triangle mesh.
//!
//! Vertices, edges, faces and loops are linked the way a half-edge kernel
//! links them: every edge carries a doubly linked *disk cycle* per endpoint
//! (all edges around that vertex) and a *radial cycle* of loops (all face
//! corners using that edge). Faces point at one loop of their corner cycle.
//!
//! Structural mutations report themselves to a [`TopoLog`]: removals before
//! the change, additions as soon as the new key exists.

use anyhow::{anyhow, Result};
use bitflags::bitflags;
use nalgebra::{Point3, Vector3};

use crate::attrib::{self, AttrBlock, AttrLayout};
use crate::log::TopoLog;
use crate::store::{EdgeRef, ElemKey, FaceRef, LoopRef, Storage, VertRef};

bitflags! {
    /// Head flags shared by all element kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeadFlags: u32 {
        /// Hidden by the host; never scanned or mutated.
        const HIDDEN = 1 << 0;
        /// UV seam marker on edges.
        const SEAM = 1 << 1;
        /// Sharp/crease marker on edges.
        const SHARP = 1 << 2;
        /// Scratch bit, meaning owned by whichever pass set it.
        const TAG = 1 << 3;
        /// First host-owned bit.
        const USER = 1 << 4;
    }
}

/// Vertex position held as three `f64` bit cells so scan workers may CAS
/// positions while the rest of the mesh stays read-only.
#[derive(Debug, Default)]
pub struct AtomicPos {
    cells: [std::sync::atomic::AtomicU64; 3],
}

impl AtomicPos {
    fn new(p: Point3<f64>) -> Self {
        use std::sync::atomic::AtomicU64;
        Self {
            cells: [
                AtomicU64::new(p.x.to_bits()),
                AtomicU64::new(p.y.to_bits()),
                AtomicU64::new(p.z.to_bits()),
            ],
        }
    }

    pub fn load(&self) -> Point3<f64> {
        use std::sync::atomic::Ordering::Relaxed;
        Point3::new(
            f64::from_bits(self.cells[0].load(Relaxed)),
            f64::from_bits(self.cells[1].load(Relaxed)),
            f64::from_bits(self.cells[2].load(Relaxed)),
        )
    }

    pub fn store(&self, p: Point3<f64>) {
        use std::sync::atomic::Ordering::Relaxed;
        self.cells[0].store(p.x.to_bits(), Relaxed);
        self.cells[1].store(p.y.to_bits(), Relaxed);
        self.cells[2].store(p.z.to_bits(), Relaxed);
    }

    /// CAS one coordinate. Returns false when another writer got there
    /// first; the caller reloads and retries.
    pub fn compare_exchange_axis(&self, axis: usize, old: f64, new: f64) -> bool {
        use std::sync::atomic::Ordering::Relaxed;
        self.cells[axis]
            .compare_exchange(old.to_bits(), new.to_bits(), Relaxed, Relaxed)
            .is_ok()
    }
}

/// Per-endpoint links of the disk cycle.
#[derive(Debug, Clone, Copy)]
pub(crate) struct DiskLink {
    prev: EdgeRef,
    next: EdgeRef,
}

impl Default for DiskLink {
    fn default() -> Self {
        Self {
            prev: EdgeRef::INVALID,
            next: EdgeRef::INVALID,
        }
    }
}

#[derive(Debug)]
pub struct Vertex {
    pub(crate) co: AtomicPos,
    pub(crate) no: Vector3<f64>,
    pub(crate) flags: HeadFlags,
    pub(crate) attrs: AttrBlock,
    pub(crate) edge: Option<EdgeRef>,
}

#[derive(Debug)]
pub struct Edge {
    pub(crate) v1: VertRef,
    pub(crate) v2: VertRef,
    pub(crate) l: Option<LoopRef>,
    pub(crate) d1: DiskLink,
    pub(crate) d2: DiskLink,
    pub(crate) flags: HeadFlags,
    pub(crate) attrs: AttrBlock,
}

/// A face corner.
#[derive(Debug)]
pub struct Loop {
    pub(crate) v: VertRef,
    pub(crate) e: EdgeRef,
    pub(crate) f: FaceRef,
    pub(crate) next: LoopRef,
    pub(crate) prev: LoopRef,
    pub(crate) radial_next: LoopRef,
    pub(crate) radial_prev: LoopRef,
    pub(crate) attrs: AttrBlock,
}

#[derive(Debug)]
pub struct Face {
    pub(crate) l_first: LoopRef,
    pub(crate) len: usize,
    pub(crate) no: Vector3<f64>,
    pub(crate) material: u16,
    pub(crate) flags: HeadFlags,
    pub(crate) attrs: AttrBlock,
}

#[derive(Debug, Default)]
pub struct TopoMesh {
    verts: Storage<VertRef, Vertex>,
    edges: Storage<EdgeRef, Edge>,
    faces: Storage<FaceRef, Face>,
    loops: Storage<LoopRef, Loop>,

    pub vert_layout: AttrLayout,
    pub edge_layout: AttrLayout,
    pub face_layout: AttrLayout,
    pub loop_layout: AttrLayout,

    /// Lane of the vertex attribute block holding the sculpt mask, if the
    /// host stores one.
    pub mask_lane: Option<usize>,
}

impl TopoMesh {
    pub fn new(
        vert_layout: AttrLayout,
        edge_layout: AttrLayout,
        face_layout: AttrLayout,
        loop_layout: AttrLayout,
    ) -> Self {
        Self {
            vert_layout,
            edge_layout,
            face_layout,
            loop_layout,
            ..Default::default()
        }
    }

    // ------------------------------------------------------------------
    // element access

    pub(crate) fn vert(&self, v: VertRef) -> &Vertex {
        self.verts.get(v).expect("stale vertex ref")
    }

    pub(crate) fn vert_mut(&mut self, v: VertRef) -> &mut Vertex {
        self.verts.get_mut(v).expect("stale vertex ref")
    }

    pub(crate) fn edge(&self, e: EdgeRef) -> &Edge {
        self.edges.get(e).expect("stale edge ref")
    }

    pub(crate) fn edge_mut(&mut self, e: EdgeRef) -> &mut Edge {
        self.edges.get_mut(e).expect("stale edge ref")
    }

    pub(crate) fn face(&self, f: FaceRef) -> &Face {
        self.faces.get(f).expect("stale face ref")
    }

    pub(crate) fn face_mut(&mut self, f: FaceRef) -> &mut Face {
        self.faces.get_mut(f).expect("stale face ref")
    }

    pub(crate) fn corner(&self, l: LoopRef) -> &Loop {
        self.loops.get(l).expect("stale loop ref")
    }

    pub(crate) fn corner_mut(&mut self, l: LoopRef) -> &mut Loop {
        self.loops.get_mut(l).expect("stale loop ref")
    }

    pub fn vert_count(&self) -> usize {
        self.verts.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn face_count(&self) -> usize {
        self.faces.len()
    }

    pub fn has_vert(&self, v: VertRef) -> bool {
        self.verts.contains(v)
    }

    pub fn has_edge(&self, e: EdgeRef) -> bool {
        self.edges.contains(e)
    }

    pub fn has_face(&self, f: FaceRef) -> bool {
        self.faces.contains(f)
    }

    /// Vertex keys in creation order.
    pub fn vert_keys(&self) -> Vec<VertRef> {
        self.verts.keys_sorted()
    }

    pub fn edge_keys(&self) -> Vec<EdgeRef> {
        self.edges.keys_sorted()
    }

    pub fn face_keys(&self) -> Vec<FaceRef> {
        self.faces.keys_sorted()
    }

    pub fn vert_co(&self, v: VertRef) -> Point3<f64> {
        self.vert(v).co.load()
    }

    pub fn set_vert_co(&mut self, v: VertRef, co: Point3<f64>) {
        self.vert_mut(v).co.store(co);
    }

    /// Shared handle for CAS position writes from scan workers.
    pub(crate) fn vert_pos_cell(&self, v: VertRef) -> &AtomicPos {
        &self.vert(v).co
    }

    pub fn vert_no(&self, v: VertRef) -> Vector3<f64> {
        self.vert(v).no
    }

    pub fn set_vert_no(&mut self, v: VertRef, no: Vector3<f64>) {
        self.vert_mut(v).no = no;
    }

    pub fn vert_flags(&self, v: VertRef) -> HeadFlags {
        self.vert(v).flags
    }

    pub fn vert_flags_insert(&mut self, v: VertRef, fl: HeadFlags) {
        self.vert_mut(v).flags |= fl;
    }

    pub fn vert_flags_remove(&mut self, v: VertRef, fl: HeadFlags) {
        self.vert_mut(v).flags &= !fl;
    }

    pub fn edge_flags(&self, e: EdgeRef) -> HeadFlags {
        self.edge(e).flags
    }

    pub fn edge_flags_insert(&mut self, e: EdgeRef, fl: HeadFlags) {
        self.edge_mut(e).flags |= fl;
    }

    pub fn edge_flags_remove(&mut self, e: EdgeRef, fl: HeadFlags) {
        self.edge_mut(e).flags &= !fl;
    }

    pub fn face_flags(&self, f: FaceRef) -> HeadFlags {
        self.face(f).flags
    }

    pub fn face_flags_insert(&mut self, f: FaceRef, fl: HeadFlags) {
        self.face_mut(f).flags |= fl;
    }

    pub fn face_flags_remove(&mut self, f: FaceRef, fl: HeadFlags) {
        self.face_mut(f).flags &= !fl;
    }

    pub fn face_material(&self, f: FaceRef) -> u16 {
        self.face(f).material
    }

    pub fn set_face_material(&mut self, f: FaceRef, material: u16) {
        self.face_mut(f).material = material;
    }

    pub fn face_no(&self, f: FaceRef) -> Vector3<f64> {
        self.face(f).no
    }

    pub fn face_len(&self, f: FaceRef) -> usize {
        self.face(f).len
    }

    /// The sculpt mask stored on `v`, or 0 when the host keeps none.
    pub fn vert_mask(&self, v: VertRef) -> f64 {
        self.mask_lane
            .and_then(|lane| self.vert(v).attrs.get(lane).copied())
            .unwrap_or(0.0)
    }

    pub fn edge_verts(&self, e: EdgeRef) -> (VertRef, VertRef) {
        let ed = self.edge(e);
        (ed.v1, ed.v2)
    }

    pub fn edge_other_vert(&self, e: EdgeRef, v: VertRef) -> VertRef {
        let ed = self.edge(e);
        if ed.v1 == v {
            ed.v2
        } else {
            debug_assert_eq!(ed.v2, v);
            ed.v1
        }
    }

    pub fn edge_len_sq(&self, e: EdgeRef) -> f64 {
        let (v1, v2) = self.edge_verts(e);
        (self.vert_co(v1) - self.vert_co(v2)).norm_squared()
    }

    pub fn edge_is_wire(&self, e: EdgeRef) -> bool {
        self.edge(e).l.is_none()
    }

    // ------------------------------------------------------------------
    // disk cycle

    fn disk_link_mut(&mut self, e: EdgeRef, v: VertRef) -> &mut DiskLink {
        let ed = self.edge_mut(e);
        if ed.v1 == v {
            &mut ed.d1
        } else {
            debug_assert_eq!(ed.v2, v);
            &mut ed.d2
        }
    }

    fn disk_link(&self, e: EdgeRef, v: VertRef) -> DiskLink {
        let ed = self.edge(e);
        if ed.v1 == v {
            ed.d1
        } else {
            debug_assert_eq!(ed.v2, v);
            ed.d2
        }
    }

    fn disk_edge_append(&mut self, e: EdgeRef, v: VertRef) {
        match self.vert(v).edge {
            None => {
                *self.disk_link_mut(e, v) = DiskLink { prev: e, next: e };
                self.vert_mut(v).edge = Some(e);
            }
            Some(first) => {
                let first_prev = self.disk_link(first, v).prev;
                *self.disk_link_mut(e, v) = DiskLink {
                    prev: first_prev,
                    next: first,
                };
                self.disk_link_mut(first_prev, v).next = e;
                self.disk_link_mut(first, v).prev = e;
            }
        }
    }

    fn disk_edge_remove(&mut self, e: EdgeRef, v: VertRef) {
        let DiskLink { prev, next } = self.disk_link(e, v);
        if next == e {
            self.vert_mut(v).edge = None;
        } else {
            self.disk_link_mut(prev, v).next = next;
            self.disk_link_mut(next, v).prev = prev;
            if self.vert(v).edge == Some(e) {
                self.vert_mut(v).edge = Some(next);
            }
        }
        *self.disk_link_mut(e, v) = DiskLink::default();
    }

    /// First edge of `v`'s disk cycle.
    pub fn disk_first(&self, v: VertRef) -> Option<EdgeRef> {
        self.vert(v).edge
    }

    /// Successor of `e` in `v`'s disk cycle.
    pub fn disk_next(&self, e: EdgeRef, v: VertRef) -> EdgeRef {
        self.disk_link(e, v).next
    }

    pub fn vert_edges(&self, v: VertRef) -> Vec<EdgeRef> {
        let mut out = Vec::new();
        let Some(first) = self.vert(v).edge else {
            return out;
        };
        let mut e = first;
        loop {
            out.push(e);
            e = self.disk_next(e, v);
            if e == first {
                break;
            }
        }
        out
    }

    /// Number of edges incident to `v`, counted from the disk cycle.
    pub fn vert_valence(&self, v: VertRef) -> usize {
        self.vert_edges(v).len()
    }

    /// Loops whose corner sits at `v`.
    pub fn vert_loops(&self, v: VertRef) -> Vec<LoopRef> {
        let mut out = Vec::new();
        for e in self.vert_edges(v) {
            for l in self.edge_loops(e) {
                if self.corner(l).v == v {
                    out.push(l);
                }
            }
        }
        out
    }

    /// Faces incident to `v`, deduplicated, in deterministic order.
    pub fn vert_faces(&self, v: VertRef) -> Vec<FaceRef> {
        let mut out = Vec::new();
        for e in self.vert_edges(v) {
            for l in self.edge_loops(e) {
                let f = self.corner(l).f;
                if !out.contains(&f) {
                    out.push(f);
                }
            }
        }
        out
    }

    // ------------------------------------------------------------------
    // radial cycle

    fn radial_append(&mut self, e: EdgeRef, l: LoopRef) {
        match self.edge(e).l {
            None => {
                self.edge_mut(e).l = Some(l);
                let lp = self.corner_mut(l);
                lp.radial_next = l;
                lp.radial_prev = l;
            }
            Some(head) => {
                let head_prev = self.corner(head).radial_prev;
                {
                    let lp = self.corner_mut(l);
                    lp.radial_next = head;
                    lp.radial_prev = head_prev;
                }
                self.corner_mut(head_prev).radial_next = l;
                self.corner_mut(head).radial_prev = l;
            }
        }
        self.corner_mut(l).e = e;
    }

    fn radial_remove(&mut self, l: LoopRef) {
        let e = self.corner(l).e;
        let rn = self.corner(l).radial_next;
        let rp = self.corner(l).radial_prev;
        if rn == l {
            self.edge_mut(e).l = None;
        } else {
            self.corner_mut(rp).radial_next = rn;
            self.corner_mut(rn).radial_prev = rp;
            if self.edge(e).l == Some(l) {
                self.edge_mut(e).l = Some(rn);
            }
        }
        let lp = self.corner_mut(l);
        lp.radial_next = l;
        lp.radial_prev = l;
    }

    /// All loops in `e`'s radial cycle.
    pub fn edge_loops(&self, e: EdgeRef) -> Vec<LoopRef> {
        let mut out = Vec::new();
        let Some(first) = self.edge(e).l else {
            return out;
        };
        let mut l = first;
        loop {
            out.push(l);
            l = self.corner(l).radial_next;
            if l == first {
                break;
            }
        }
        out
    }

    pub fn radial_count(&self, e: EdgeRef) -> usize {
        self.edge_loops(e).len()
    }

    /// Fast path for the common manifold case: both loops of an edge with
    /// exactly two incident faces.
    pub fn edge_loop_pair(&self, e: EdgeRef) -> Option<(LoopRef, LoopRef)> {
        let l0 = self.edge(e).l?;
        let l1 = self.corner(l0).radial_next;
        if l1 == l0 || self.corner(l1).radial_next != l0 {
            return None;
        }
        Some((l0, l1))
    }

    // ------------------------------------------------------------------
    // lookups

    /// The edge connecting `v1` and `v2`, found by walking `v1`'s disk.
    pub fn edge_exists(&self, v1: VertRef, v2: VertRef) -> Option<EdgeRef> {
        let first = self.vert(v1).edge?;
        let mut e = first;
        loop {
            if self.edge_other_vert(e, v1) == v2 {
                return Some(e);
            }
            e = self.disk_next(e, v1);
            if e == first {
                return None;
            }
        }
    }

    /// Triangle-specialized face lookup, any winding.
    pub fn face_exists_tri(&self, a: VertRef, b: VertRef, c: VertRef) -> Option<FaceRef> {
        let e = self.edge_exists(a, b)?;
        self.face_exists_tri_from_loop_vert(self.edge(e).l?, c)
    }

    /// Walks the radial cycle of `l`'s edge looking for a triangle whose
    /// third vertex is `v_opp`.
    pub fn face_exists_tri_from_loop_vert(&self, l: LoopRef, v_opp: VertRef) -> Option<FaceRef> {
        let e = self.corner(l).e;
        for lw in self.edge_loops(e) {
            let f = self.corner(lw).f;
            if self.face(f).len != 3 {
                continue;
            }
            let third = self.corner(self.corner(lw).next).next;
            if self.corner(third).v == v_opp {
                return Some(f);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // face iteration

    pub fn face_loops(&self, f: FaceRef) -> Vec<LoopRef> {
        let face = self.face(f);
        let mut out = Vec::with_capacity(face.len);
        let mut l = face.l_first;
        loop {
            out.push(l);
            l = self.corner(l).next;
            if l == face.l_first {
                break;
            }
        }
        out
    }

    pub fn face_verts(&self, f: FaceRef) -> Vec<VertRef> {
        self.face_loops(f)
            .into_iter()
            .map(|l| self.corner(l).v)
            .collect()
    }

    pub fn loop_of_vert(&self, f: FaceRef, v: VertRef) -> Option<LoopRef> {
        self.face_loops(f)
            .into_iter()
            .find(|&l| self.corner(l).v == v)
    }

    pub fn corner_vert(&self, l: LoopRef) -> VertRef {
        self.corner(l).v
    }

    pub fn corner_edge(&self, l: LoopRef) -> EdgeRef {
        self.corner(l).e
    }

    pub fn corner_face(&self, l: LoopRef) -> FaceRef {
        self.corner(l).f
    }

    pub fn corner_next(&self, l: LoopRef) -> LoopRef {
        self.corner(l).next
    }

    pub fn corner_prev(&self, l: LoopRef) -> LoopRef {
        self.corner(l).prev
    }

    pub fn corner_radial_next(&self, l: LoopRef) -> LoopRef {
        self.corner(l).radial_next
    }

    pub(crate) fn corner_attrs(&self, l: LoopRef) -> &AttrBlock {
        &self.corner(l).attrs
    }

    pub(crate) fn set_corner_attrs(&mut self, l: LoopRef, attrs: AttrBlock) {
        self.corner_mut(l).attrs = attrs;
    }

    pub(crate) fn vert_attrs(&self, v: VertRef) -> &AttrBlock {
        &self.vert(v).attrs
    }

    pub(crate) fn set_vert_attrs(&mut self, v: VertRef, attrs: AttrBlock) {
        self.vert_mut(v).attrs = attrs;
    }

    pub(crate) fn edge_attrs(&self, e: EdgeRef) -> &AttrBlock {
        &self.edge(e).attrs
    }

    pub(crate) fn set_edge_attrs(&mut self, e: EdgeRef, attrs: AttrBlock) {
        self.edge_mut(e).attrs = attrs;
    }

    pub(crate) fn face_attrs(&self, f: FaceRef) -> &AttrBlock {
        &self.face(f).attrs
    }

    pub(crate) fn set_face_attrs(&mut self, f: FaceRef, attrs: AttrBlock) {
        self.face_mut(f).attrs = attrs;
    }

    // ------------------------------------------------------------------
    // creation

    pub fn vert_create(
        &mut self,
        log: &mut dyn TopoLog,
        co: Point3<f64>,
        no: Vector3<f64>,
        example: Option<VertRef>,
    ) -> VertRef {
        let (flags, attrs) = match example {
            Some(ex) => (self.vert(ex).flags, self.vert(ex).attrs.clone()),
            None => (HeadFlags::empty(), self.vert_layout.alloc()),
        };
        let v = self.verts.insert(Vertex {
            co: AtomicPos::new(co),
            no,
            flags,
            attrs,
            edge: None,
        });
        log.vert_added(v, co);
        v
    }

    /// Returns the edge between `v1` and `v2`, creating it (and logging the
    /// addition) if none exists. The bool reports whether it was created.
    pub fn edge_get_or_create(
        &mut self,
        log: &mut dyn TopoLog,
        v1: VertRef,
        v2: VertRef,
        example: Option<EdgeRef>,
    ) -> (EdgeRef, bool) {
        if let Some(e) = self.edge_exists(v1, v2) {
            return (e, false);
        }
        let (flags, attrs) = match example {
            Some(ex) => (self.edge(ex).flags, self.edge(ex).attrs.clone()),
            None => (HeadFlags::empty(), self.edge_layout.alloc()),
        };
        let e = self.edges.insert(Edge {
            v1,
            v2,
            l: None,
            d1: DiskLink::default(),
            d2: DiskLink::default(),
            flags,
            attrs,
        });
        self.disk_edge_append(e, v1);
        self.disk_edge_append(e, v2);
        log.edge_added(e, v1, v2);
        (e, true)
    }

    /// Creates a triangle. Edges are looked up or created when not given.
    pub fn face_create(
        &mut self,
        log: &mut dyn TopoLog,
        v: [VertRef; 3],
        e: Option<[EdgeRef; 3]>,
        example: Option<FaceRef>,
    ) -> FaceRef {
        let edges = match e {
            Some(e) => e,
            None => [
                self.edge_get_or_create(log, v[0], v[1], None).0,
                self.edge_get_or_create(log, v[1], v[2], None).0,
                self.edge_get_or_create(log, v[2], v[0], None).0,
            ],
        };
        let (material, flags, attrs) = match example {
            Some(ex) => {
                let fa = self.face(ex);
                (fa.material, fa.flags, fa.attrs.clone())
            }
            None => (0, HeadFlags::empty(), self.face_layout.alloc()),
        };
        let no = triangle_normal(self.vert_co(v[0]), self.vert_co(v[1]), self.vert_co(v[2]));
        let f = self.faces.insert(Face {
            l_first: LoopRef::INVALID,
            len: 3,
            no,
            material,
            flags,
            attrs,
        });
        let mut ls = [LoopRef::INVALID; 3];
        for i in 0..3 {
            ls[i] = self.loops.insert(Loop {
                v: v[i],
                e: edges[i],
                f,
                next: LoopRef::INVALID,
                prev: LoopRef::INVALID,
                radial_next: LoopRef::INVALID,
                radial_prev: LoopRef::INVALID,
                attrs: self.loop_layout.alloc(),
            });
        }
        for i in 0..3 {
            let lp = self.corner_mut(ls[i]);
            lp.next = ls[(i + 1) % 3];
            lp.prev = ls[(i + 2) % 3];
        }
        for i in 0..3 {
            self.radial_append(edges[i], ls[i]);
        }
        self.face_mut(f).l_first = ls[0];
        log.face_added(f, &v);
        f
    }

    // ------------------------------------------------------------------
    // destruction

    /// Unlinks and frees a face. Its edges and vertices survive.
    pub fn face_kill(&mut self, log: &mut dyn TopoLog, f: FaceRef) {
        let verts = self.face_verts(f);
        log.face_removed(f, &verts);
        for l in self.face_loops(f) {
            self.radial_remove(l);
            self.loops.remove(l);
        }
        self.faces.remove(f);
    }

    /// Kills `e` and any face still using it.
    pub fn edge_kill(&mut self, log: &mut dyn TopoLog, e: EdgeRef) {
        while let Some(l) = self.edge(e).l {
            let f = self.corner(l).f;
            self.face_kill(log, f);
        }
        let (v1, v2) = self.edge_verts(e);
        log.edge_removed(e, v1, v2);
        self.disk_edge_remove(e, v1);
        self.disk_edge_remove(e, v2);
        self.edges.remove(e);
    }

    /// Kills `v` and everything still attached to it.
    pub fn vert_kill(&mut self, log: &mut dyn TopoLog, v: VertRef) {
        while let Some(e) = self.vert(v).edge {
            self.edge_kill(log, e);
        }
        log.vert_removed(v, self.vert_co(v));
        self.verts.remove(v);
    }

    // ------------------------------------------------------------------
    // split kernels

    /// Splits `e` at parameter `t` from `pivot`, returning the new vertex
    /// and the new edge (the half toward the far endpoint). Every incident
    /// face grows by one corner; callers re-triangulate afterwards.
    ///
    /// Emits no events itself; use [`crate::log::edge_split_log`].
    pub fn edge_split(&mut self, e: EdgeRef, pivot: VertRef, t: f64) -> (VertRef, EdgeRef) {
        let (ev1, ev2) = self.edge_verts(e);
        let v_a = pivot;
        let v_b = if pivot == ev1 { ev2 } else { ev1 };

        let co_a = self.vert_co(v_a);
        let co_b = self.vert_co(v_b);
        let co_new = Point3::from(co_a.coords.lerp(&co_b.coords, t));
        let no_new = (self.vert(v_a).no * (1.0 - t) + self.vert(v_b).no * t)
            .try_normalize(1.0e-30)
            .unwrap_or(self.vert(v_a).no);
        let mut attrs = self.vert_layout.alloc();
        attrib::interp_into(
            &mut attrs,
            &[&self.vert(v_a).attrs, &self.vert(v_b).attrs],
            &[1.0 - t, t],
        );
        let nv = self.verts.insert(Vertex {
            co: AtomicPos::new(co_new),
            no: no_new,
            flags: HeadFlags::empty(),
            attrs,
            edge: None,
        });

        // e becomes (v_a, nv)
        self.disk_edge_remove(e, v_b);
        {
            let ed = self.edge_mut(e);
            if ed.v1 == v_b {
                ed.v1 = nv;
            } else {
                ed.v2 = nv;
            }
        }
        self.disk_edge_append(e, nv);

        // new edge (nv, v_b), same flags and attributes as e
        let (e_flags, e_attrs) = {
            let ed = self.edge(e);
            (ed.flags, ed.attrs.clone())
        };
        let ne = self.edges.insert(Edge {
            v1: nv,
            v2: v_b,
            l: None,
            d1: DiskLink::default(),
            d2: DiskLink::default(),
            flags: e_flags,
            attrs: e_attrs,
        });
        self.disk_edge_append(ne, nv);
        self.disk_edge_append(ne, v_b);

        // splice a corner at nv into every incident face
        for l in self.edge_loops(e) {
            let f = self.corner(l).f;
            let l_next = self.corner(l).next;
            let lv = self.corner(l).v;

            let (w_l, w_next) = if lv == v_a { (1.0 - t, t) } else { (t, 1.0 - t) };
            let mut l_attrs = self.loop_layout.alloc();
            attrib::interp_into(
                &mut l_attrs,
                &[&self.corner(l).attrs, &self.corner(l_next).attrs],
                &[w_l, w_next],
            );

            let lnew_edge = if lv == v_a { ne } else { e };
            let lnew = self.loops.insert(Loop {
                v: nv,
                e: lnew_edge,
                f,
                next: l_next,
                prev: l,
                radial_next: LoopRef::INVALID,
                radial_prev: LoopRef::INVALID,
                attrs: l_attrs,
            });
            self.corner_mut(l_next).prev = lnew;
            self.corner_mut(l).next = lnew;

            if lv == v_a {
                // l still runs v_a -> nv on e; the new corner rides ne
                self.radial_append(ne, lnew);
            } else {
                // l now runs v_b -> nv, so it moves onto ne
                self.radial_remove(l);
                self.radial_append(ne, l);
                self.radial_append(e, lnew);
            }
            self.face_mut(f).len += 1;
        }

        (nv, ne)
    }

    /// Cuts face `f` along the chord `va`-`vb`, producing a second face.
    /// Returns the new face and the chord edge, or None when the chord is
    /// degenerate (missing corners, or already an edge of the face).
    pub fn face_split(
        &mut self,
        log: &mut dyn TopoLog,
        f: FaceRef,
        va: VertRef,
        vb: VertRef,
    ) -> Option<(FaceRef, EdgeRef)> {
        let la = self.loop_of_vert(f, va)?;
        let lb = self.loop_of_vert(f, vb)?;
        if la == lb || self.corner(la).next == lb || self.corner(lb).next == la {
            return None;
        }

        let old_verts = self.face_verts(f);
        log.face_removed(f, &old_verts);

        let (e_diag, _) = self.edge_get_or_create(log, va, vb, None);

        // loops in [la, lb) move to the new face
        let mut n_arc = 0;
        let mut it = la;
        while it != lb {
            n_arc += 1;
            it = self.corner(it).next;
        }
        let old_len = self.face(f).len;

        let (no, material, flags, attrs) = {
            let fa = self.face(f);
            (fa.no, fa.material, fa.flags, fa.attrs.clone())
        };
        let f2 = self.faces.insert(Face {
            l_first: la,
            len: n_arc + 1,
            no,
            material,
            flags,
            attrs,
        });
        let mut it = la;
        while it != lb {
            let next = self.corner(it).next;
            self.corner_mut(it).f = f2;
            it = next;
        }

        let la_prev = self.corner(la).prev;
        let lb_prev = self.corner(lb).prev;

        let l2 = self.loops.insert(Loop {
            v: vb,
            e: e_diag,
            f: f2,
            next: la,
            prev: lb_prev,
            radial_next: LoopRef::INVALID,
            radial_prev: LoopRef::INVALID,
            attrs: self.corner(lb).attrs.clone(),
        });
        self.corner_mut(lb_prev).next = l2;
        self.corner_mut(la).prev = l2;

        let l1 = self.loops.insert(Loop {
            v: va,
            e: e_diag,
            f,
            next: lb,
            prev: la_prev,
            radial_next: LoopRef::INVALID,
            radial_prev: LoopRef::INVALID,
            attrs: self.corner(la).attrs.clone(),
        });
        self.corner_mut(la_prev).next = l1;
        self.corner_mut(lb).prev = l1;

        {
            let fa = self.face_mut(f);
            fa.l_first = lb;
            fa.len = old_len - n_arc + 1;
        }
        self.radial_append(e_diag, l1);
        self.radial_append(e_diag, l2);

        self.face_normal_update(f);
        self.face_normal_update(f2);

        let fv = self.face_verts(f);
        log.face_added(f, &fv);
        let f2v = self.face_verts(f2);
        log.face_added(f2, &f2v);

        Some((f2, e_diag))
    }

    // ------------------------------------------------------------------
    // geometry

    pub fn face_centroid(&self, f: FaceRef) -> Point3<f64> {
        let verts = self.face_verts(f);
        let mut acc = Vector3::zeros();
        for &v in &verts {
            acc += self.vert_co(v).coords;
        }
        Point3::from(acc / verts.len() as f64)
    }

    /// Recomputes the stored face normal (Newell's method, so n-gons that
    /// exist mid-pass stay sane).
    pub fn face_normal_update(&mut self, f: FaceRef) {
        let verts = self.face_verts(f);
        let mut no = Vector3::zeros();
        for i in 0..verts.len() {
            let a = self.vert_co(verts[i]);
            let b = self.vert_co(verts[(i + 1) % verts.len()]);
            no.x += (a.y - b.y) * (a.z + b.z);
            no.y += (a.z - b.z) * (a.x + b.x);
            no.z += (a.x - b.x) * (a.y + b.y);
        }
        self.face_mut(f).no = no.try_normalize(1.0e-30).unwrap_or_else(Vector3::z);
    }

    // ------------------------------------------------------------------
    // validation

    /// Checks the structural invariants a finished remesh call promises:
    /// triangle faces, consistent loop/edge/radial links, no duplicate
    /// triangles, intact disk cycles.
    pub fn validate(&self) -> Result<()> {
        let mut seen_tris = crate::store::new_set();
        for f in self.face_keys() {
            let loops = self.face_loops(f);
            if loops.len() != 3 || self.face(f).len != 3 {
                return Err(anyhow!("face {:?} is not a triangle", f));
            }
            let l0 = self.face(f).l_first;
            let l3 = self.corner(self.corner(self.corner(l0).next).next).next;
            if l3 != l0 {
                return Err(anyhow!("face {:?} corner cycle does not close", f));
            }
            for &l in &loops {
                let lp = self.corner(l);
                if lp.f != f {
                    return Err(anyhow!("loop {:?} points at the wrong face", l));
                }
                let lv = lp.v;
                let nv = self.corner(lp.next).v;
                let (e1, e2) = self.edge_verts(lp.e);
                if !((e1 == lv && e2 == nv) || (e1 == nv && e2 == lv)) {
                    return Err(anyhow!(
                        "loop {:?} edge does not connect its corner to the next corner",
                        l
                    ));
                }
            }
            let vs = self.face_verts(f);
            let rot = (0..3).min_by_key(|&i| vs[i]).unwrap_or(0);
            let canon = (vs[rot], vs[(rot + 1) % 3], vs[(rot + 2) % 3]);
            if !seen_tris.insert(canon) {
                return Err(anyhow!("duplicate triangle {:?}", canon));
            }
        }
        for e in self.edge_keys() {
            if let Some(first) = self.edge(e).l {
                let mut l = first;
                let mut steps = 0usize;
                loop {
                    if self.corner(l).e != e {
                        return Err(anyhow!("radial loop {:?} not on edge {:?}", l, e));
                    }
                    let rn = self.corner(l).radial_next;
                    if self.corner(rn).radial_prev != l {
                        return Err(anyhow!("radial links of edge {:?} disagree", e));
                    }
                    l = rn;
                    steps += 1;
                    if l == first {
                        break;
                    }
                    if steps > self.loops.len() {
                        return Err(anyhow!("radial cycle of edge {:?} does not close", e));
                    }
                }
            }
        }
        for v in self.vert_keys() {
            if let Some(first) = self.vert(v).edge {
                let mut e = first;
                let mut steps = 0usize;
                loop {
                    let (a, b) = self.edge_verts(e);
                    if a != v && b != v {
                        return Err(anyhow!("disk cycle of {:?} visits a foreign edge", v));
                    }
                    e = self.disk_next(e, v);
                    steps += 1;
                    if e == first {
                        break;
                    }
                    if steps > self.edges.len() {
                        return Err(anyhow!("disk cycle of {:?} does not close", v));
                    }
                }
            }
        }
        Ok(())
    }
}

pub fn triangle_normal(a: Point3<f64>, b: Point3<f64>, c: Point3<f64>) -> Vector3<f64> {
    (b - a)
        .cross(&(c - a))
        .try_normalize(1.0e-30)
        .unwrap_or_else(Vector3::z)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::NullLog;
    use approx::relative_eq;

    fn quad_mesh() -> (TopoMesh, [VertRef; 4], [FaceRef; 2]) {
        let mut m = TopoMesh::default();
        let mut log = NullLog;
        let v = [
            m.vert_create(&mut log, Point3::new(0.0, 0.0, 0.0), Vector3::z(), None),
            m.vert_create(&mut log, Point3::new(1.0, 0.0, 0.0), Vector3::z(), None),
            m.vert_create(&mut log, Point3::new(1.0, 1.0, 0.0), Vector3::z(), None),
            m.vert_create(&mut log, Point3::new(0.0, 1.0, 0.0), Vector3::z(), None),
        ];
        let f0 = m.face_create(&mut log, [v[0], v[1], v[2]], None, None);
        let f1 = m.face_create(&mut log, [v[0], v[2], v[3]], None, None);
        (m, v, [f0, f1])
    }

    #[test]
    fn test_disk_and_radial_cycles() {
        let (m, v, _) = quad_mesh();
        assert_eq!(m.vert_valence(v[0]), 3);
        assert_eq!(m.vert_valence(v[1]), 2);
        let diag = m.edge_exists(v[0], v[2]).unwrap();
        assert_eq!(m.radial_count(diag), 2);
        assert!(m.edge_loop_pair(diag).is_some());
        let rim = m.edge_exists(v[0], v[1]).unwrap();
        assert_eq!(m.radial_count(rim), 1);
        assert!(m.edge_loop_pair(rim).is_none());
        m.validate().unwrap();
    }

    #[test]
    fn test_face_exists_tri() {
        let (m, v, f) = quad_mesh();
        assert_eq!(m.face_exists_tri(v[0], v[1], v[2]), Some(f[0]));
        assert_eq!(m.face_exists_tri(v[2], v[0], v[1]), Some(f[0]));
        assert_eq!(m.face_exists_tri(v[1], v[2], v[3]), None);
    }

    #[test]
    fn test_edge_split_grows_faces() {
        let (mut m, v, f) = quad_mesh();
        let diag = m.edge_exists(v[0], v[2]).unwrap();
        let (nv, ne) = m.edge_split(diag, v[0], 0.5);
        assert!(relative_eq!(
            m.vert_co(nv),
            Point3::new(0.5, 0.5, 0.0),
            epsilon = 1e-12
        ));
        assert_eq!(m.face_len(f[0]), 4);
        assert_eq!(m.face_len(f[1]), 4);
        assert_eq!(m.edge_other_vert(diag, v[0]), nv);
        assert_eq!(m.edge_other_vert(ne, nv), v[2]);
        // two halves of the diagonal plus a corner in each quad
        assert_eq!(m.vert_valence(nv), 2);
        assert_eq!(m.radial_count(diag), 2);
        assert_eq!(m.radial_count(ne), 2);
    }

    #[test]
    fn test_face_split_restores_triangles() {
        let (mut m, v, f) = quad_mesh();
        let mut log = NullLog;
        let diag = m.edge_exists(v[0], v[2]).unwrap();
        let (nv, _) = m.edge_split(diag, v[0], 0.5);
        // both quads cut through the midpoint to the far corner
        let (fa, _) = m.face_split(&mut log, f[0], nv, v[1]).unwrap();
        let (fb, _) = m.face_split(&mut log, f[1], nv, v[3]).unwrap();
        for fk in [f[0], f[1], fa, fb] {
            assert_eq!(m.face_len(fk), 3);
        }
        assert_eq!(m.vert_valence(nv), 4);
        m.validate().unwrap();
    }

    #[test]
    fn test_kill_cascade() {
        let (mut m, v, _) = quad_mesh();
        let mut log = NullLog;
        m.vert_kill(&mut log, v[0]);
        assert_eq!(m.face_count(), 0);
        // v1-v2 and v2-v3 survive as wire edges
        assert_eq!(m.edge_count(), 2);
        assert!(m.edge_is_wire(m.edge_exists(v[1], v[2]).unwrap()));
    }

    #[test]
    fn test_edge_get_or_create_is_idempotent() {
        let (mut m, v, _) = quad_mesh();
        let mut log = NullLog;
        let existing = m.edge_exists(v[0], v[1]).unwrap();
        let (e, created) = m.edge_get_or_create(&mut log, v[1], v[0], None);
        assert_eq!(e, existing);
        assert!(!created);
    }
}
