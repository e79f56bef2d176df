//! Vertex annotation side-table.
//!
//! Topology passes invalidate cheaply by setting NEEDS bits; the expensive
//! reclassification runs lazily through [`VertTable::check_boundary`] and
//! [`VertTable::update_valence`] when a consumer actually needs the data.

use bitflags::bitflags;
use nalgebra::{Point3, Vector3};

use crate::mesh::{HeadFlags, TopoMesh};
use crate::store::{new_map, FixedMap, VertRef};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VertState: u32 {
        const NEEDS_VALENCE = 1 << 0;
        const NEEDS_BOUNDARY = 1 << 1;
        const NEEDS_DISK_SORT = 1 << 2;
        const NEEDS_TRIANGULATE = 1 << 3;
        /// Dedupe bit for the valence watchlist.
        const VALENCE_SCRATCH = 1 << 4;

        const BOUNDARY = 1 << 8;
        const FSET_BOUNDARY = 1 << 9;
        const SHARP_BOUNDARY = 1 << 10;
        const SEAM_BOUNDARY = 1 << 11;
        const CORNER = 1 << 12;
        const FSET_CORNER = 1 << 13;
        const SHARP_CORNER = 1 << 14;
        const SEAM_CORNER = 1 << 15;

        const SMOOTH_BOUNDARY = Self::BOUNDARY.bits()
            | Self::FSET_BOUNDARY.bits()
            | Self::SHARP_BOUNDARY.bits();
        const ALL_BOUNDARY = Self::SMOOTH_BOUNDARY.bits() | Self::SEAM_BOUNDARY.bits();
        const SMOOTH_CORNER = Self::CORNER.bits()
            | Self::FSET_CORNER.bits()
            | Self::SHARP_CORNER.bits();
        const ALL_CORNER = Self::SMOOTH_CORNER.bits() | Self::SEAM_CORNER.bits();

        const NEEDS_ANY = Self::NEEDS_VALENCE.bits()
            | Self::NEEDS_BOUNDARY.bits()
            | Self::NEEDS_DISK_SORT.bits();
    }
}

/// Per-vertex bookkeeping.
#[derive(Debug, Clone)]
pub struct VertData {
    /// Snapshot the host restores from on undo, keyed by `stroke_id`.
    pub origco: Point3<f64>,
    pub origno: Vector3<f64>,
    pub origmask: f64,
    pub flags: VertState,
    /// Cached edge count, valid only while NEEDS_VALENCE is clear.
    pub valence: u32,
    pub stroke_id: u64,
}

impl VertData {
    fn fresh(co: Point3<f64>, no: Vector3<f64>, mask: f64) -> Self {
        Self {
            origco: co,
            origno: no,
            origmask: mask,
            flags: VertState::NEEDS_VALENCE
                | VertState::NEEDS_BOUNDARY
                | VertState::NEEDS_DISK_SORT,
            valence: 0,
            stroke_id: u64::MAX,
        }
    }
}

#[derive(Debug, Default)]
pub struct VertTable {
    map: FixedMap<VertRef, VertData>,
}

impl VertTable {
    pub fn new() -> Self {
        Self { map: new_map() }
    }

    pub fn get(&self, v: VertRef) -> Option<&VertData> {
        self.map.get(&v)
    }

    pub fn get_mut(&mut self, v: VertRef) -> Option<&mut VertData> {
        self.map.get_mut(&v)
    }

    pub fn remove(&mut self, v: VertRef) {
        self.map.remove(&v);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Registers `v` if unseen, with every NEEDS bit raised.
    pub fn ensure(&mut self, mesh: &TopoMesh, v: VertRef) -> &mut VertData {
        self.map.entry(v).or_insert_with(|| {
            VertData::fresh(mesh.vert_co(v), mesh.vert_no(v), mesh.vert_mask(v))
        })
    }

    /// Every mutation that reshapes the neighbourhood of `v` calls this.
    pub fn mark_topo_changed(&mut self, mesh: &TopoMesh, v: VertRef) {
        self.ensure(mesh, v).flags |= VertState::NEEDS_ANY;
    }

    /// Recounts incident edges, caching the result.
    pub fn update_valence(&mut self, mesh: &TopoMesh, v: VertRef) -> u32 {
        let valence = mesh.vert_valence(v) as u32;
        let data = self.ensure(mesh, v);
        data.valence = valence;
        data.flags &= !VertState::NEEDS_VALENCE;
        valence
    }

    /// Cached valence, recounting only when stale.
    pub fn valence(&mut self, mesh: &TopoMesh, v: VertRef) -> u32 {
        let data = self.ensure(mesh, v);
        if data.flags.contains(VertState::NEEDS_VALENCE) {
            self.update_valence(mesh, v)
        } else {
            data.valence
        }
    }

    /// Reclassifies the boundary/corner bits of `v` from the current disk
    /// cycle if NEEDS_BOUNDARY is set.
    pub fn check_boundary(&mut self, mesh: &TopoMesh, v: VertRef) {
        if !self
            .ensure(mesh, v)
            .flags
            .contains(VertState::NEEDS_BOUNDARY)
        {
            return;
        }

        let mut mesh_bnd = 0usize;
        let mut seam_bnd = 0usize;
        let mut sharp_bnd = 0usize;
        let mut fset_bnd = 0usize;
        for e in mesh.vert_edges(v) {
            let loops = mesh.edge_loops(e);
            if loops.len() != 2 {
                mesh_bnd += 1;
            }
            let eflags = mesh.edge_flags(e);
            if eflags.contains(HeadFlags::SEAM) {
                seam_bnd += 1;
            }
            if eflags.contains(HeadFlags::SHARP) {
                sharp_bnd += 1;
            }
            if loops.len() == 2 {
                let ma = mesh.face_material(mesh.corner_face(loops[0]));
                let mb = mesh.face_material(mesh.corner_face(loops[1]));
                if ma != mb {
                    fset_bnd += 1;
                }
            }
        }

        let mut flags = VertState::empty();
        if mesh_bnd > 0 {
            flags |= VertState::BOUNDARY;
            if mesh_bnd != 2 {
                flags |= VertState::CORNER;
            }
        }
        if seam_bnd > 0 {
            flags |= VertState::SEAM_BOUNDARY;
            if seam_bnd != 2 {
                flags |= VertState::SEAM_CORNER;
            }
        }
        if sharp_bnd > 0 {
            flags |= VertState::SHARP_BOUNDARY;
            if sharp_bnd != 2 {
                flags |= VertState::SHARP_CORNER;
            }
        }
        if fset_bnd > 0 {
            flags |= VertState::FSET_BOUNDARY;
            if fset_bnd != 2 {
                flags |= VertState::FSET_CORNER;
            }
        }

        let data = self.ensure(mesh, v);
        data.flags &= !(VertState::ALL_BOUNDARY | VertState::ALL_CORNER);
        data.flags |= flags;
        data.flags &= !VertState::NEEDS_BOUNDARY;
    }

    /// Refreshes the origdata snapshot once per stroke. Called before any
    /// user-visible modification.
    pub fn check_origdata(&mut self, mesh: &TopoMesh, v: VertRef, stroke_id: u64) {
        let co = mesh.vert_co(v);
        let no = mesh.vert_no(v);
        let mask = mesh.vert_mask(v);
        let data = self.ensure(mesh, v);
        if data.stroke_id != stroke_id {
            data.origco = co;
            data.origno = no;
            data.origmask = mask;
            data.stroke_id = stroke_id;
        }
    }
}
