//! Undo/redo event emission.
//!
//! The undo log itself lives in the host; the remesher only reports what it
//! did. Removal events are emitted before the structural change and addition
//! events as soon as the new element's key exists, so a linear replay of the
//! event list in reverse restores the state that preceded a call.

use nalgebra::Point3;

use crate::mesh::TopoMesh;
use crate::store::{EdgeRef, FaceRef, VertRef};

/// Sink for topology events. All methods default to no-ops so hosts
/// implement only what they record.
pub trait TopoLog {
    /// Opens a named undo entry; subsequent events belong to it.
    fn entry_open(&mut self, _label: &str) {}

    fn vert_added(&mut self, _v: VertRef, _co: Point3<f64>) {}
    /// Emitted before a position/normal write the host may want to undo.
    fn vert_modified(&mut self, _v: VertRef, _old_co: Point3<f64>) {}
    fn vert_removed(&mut self, _v: VertRef, _co: Point3<f64>) {}

    fn edge_added(&mut self, _e: EdgeRef, _v1: VertRef, _v2: VertRef) {}
    fn edge_removed(&mut self, _e: EdgeRef, _v1: VertRef, _v2: VertRef) {}

    fn face_added(&mut self, _f: FaceRef, _verts: &[VertRef]) {}
    fn face_removed(&mut self, _f: FaceRef, _verts: &[VertRef]) {}

    /// One atomic record for an edge split: `e` was cut at `v_new`, the
    /// half toward `v2` now lives in `e_new`.
    fn edge_split(
        &mut self,
        _e: EdgeRef,
        _e_new: EdgeRef,
        _v_new: VertRef,
        _co: Point3<f64>,
        _v1: VertRef,
        _v2: VertRef,
    ) {
    }
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NullLog;

impl TopoLog for NullLog {}

/// Performs an edge split and records it as a single event.
///
/// `pivot` selects which endpoint keeps the original edge; the split always
/// happens at parameter `t` measured from `pivot`.
pub fn edge_split_log(
    mesh: &mut TopoMesh,
    log: &mut dyn TopoLog,
    e: EdgeRef,
    pivot: VertRef,
    t: f64,
) -> (VertRef, EdgeRef) {
    let (v1, v2) = mesh.edge_verts(e);
    let other = if pivot == v1 { v2 } else { v1 };
    let (v_new, e_new) = mesh.edge_split(e, pivot, t);
    log.edge_split(e, e_new, v_new, mesh.vert_co(v_new), pivot, other);
    (v_new, e_new)
}

/// One recorded event. Owned payloads only, so the record outlives the mesh
/// elements it describes.
#[derive(Debug, Clone, PartialEq)]
pub enum TopoEvent {
    EntryOpen(String),
    VertAdded {
        v: VertRef,
        co: Point3<f64>,
    },
    VertModified {
        v: VertRef,
        old_co: Point3<f64>,
    },
    VertRemoved {
        v: VertRef,
        co: Point3<f64>,
    },
    EdgeAdded {
        e: EdgeRef,
        v1: VertRef,
        v2: VertRef,
    },
    EdgeRemoved {
        e: EdgeRef,
        v1: VertRef,
        v2: VertRef,
    },
    FaceAdded {
        f: FaceRef,
        verts: Vec<VertRef>,
    },
    FaceRemoved {
        f: FaceRef,
        verts: Vec<VertRef>,
    },
    EdgeSplit {
        e: EdgeRef,
        e_new: EdgeRef,
        v_new: VertRef,
        co: Point3<f64>,
        v1: VertRef,
        v2: VertRef,
    },
}

/// Records every event in order. Mostly a test collaborator: replaying the
/// record backwards over a [`Shadow`] of the final mesh reproduces the mesh
/// that existed before the call.
#[derive(Debug, Default)]
pub struct ReplayLog {
    pub events: Vec<TopoEvent>,
}

impl TopoLog for ReplayLog {
    fn entry_open(&mut self, label: &str) {
        self.events.push(TopoEvent::EntryOpen(label.to_string()));
    }
    fn vert_added(&mut self, v: VertRef, co: Point3<f64>) {
        self.events.push(TopoEvent::VertAdded { v, co });
    }
    fn vert_modified(&mut self, v: VertRef, old_co: Point3<f64>) {
        self.events.push(TopoEvent::VertModified { v, old_co });
    }
    fn vert_removed(&mut self, v: VertRef, co: Point3<f64>) {
        self.events.push(TopoEvent::VertRemoved { v, co });
    }
    fn edge_added(&mut self, e: EdgeRef, v1: VertRef, v2: VertRef) {
        self.events.push(TopoEvent::EdgeAdded { e, v1, v2 });
    }
    fn edge_removed(&mut self, e: EdgeRef, v1: VertRef, v2: VertRef) {
        self.events.push(TopoEvent::EdgeRemoved { e, v1, v2 });
    }
    fn face_added(&mut self, f: FaceRef, verts: &[VertRef]) {
        self.events.push(TopoEvent::FaceAdded {
            f,
            verts: verts.to_vec(),
        });
    }
    fn face_removed(&mut self, f: FaceRef, verts: &[VertRef]) {
        self.events.push(TopoEvent::FaceRemoved {
            f,
            verts: verts.to_vec(),
        });
    }
    fn edge_split(
        &mut self,
        e: EdgeRef,
        e_new: EdgeRef,
        v_new: VertRef,
        co: Point3<f64>,
        v1: VertRef,
        v2: VertRef,
    ) {
        self.events.push(TopoEvent::EdgeSplit {
            e,
            e_new,
            v_new,
            co,
            v1,
            v2,
        });
    }
}

/// Positions and face corner lists, the part of mesh state the event stream
/// fully determines.
#[derive(Debug, Clone, PartialEq)]
pub struct Shadow {
    pub verts: std::collections::BTreeMap<VertRef, Point3<f64>>,
    pub faces: std::collections::BTreeMap<FaceRef, Vec<VertRef>>,
}

impl Shadow {
    pub fn of_mesh(mesh: &TopoMesh) -> Self {
        let mut verts = std::collections::BTreeMap::new();
        for v in mesh.vert_keys() {
            verts.insert(v, mesh.vert_co(v));
        }
        let mut faces = std::collections::BTreeMap::new();
        for f in mesh.face_keys() {
            faces.insert(f, mesh.face_verts(f));
        }
        Self { verts, faces }
    }
}

impl ReplayLog {
    /// Applies the recorded events in reverse to `shadow`, turning the
    /// post-call state into the pre-call state.
    pub fn rewind(&self, shadow: &mut Shadow) {
        for ev in self.events.iter().rev() {
            match ev {
                TopoEvent::EntryOpen(_) => {}
                TopoEvent::VertAdded { v, .. } => {
                    shadow.verts.remove(v);
                }
                TopoEvent::VertModified { v, old_co } => {
                    shadow.verts.insert(*v, *old_co);
                }
                TopoEvent::VertRemoved { v, co } => {
                    shadow.verts.insert(*v, *co);
                }
                TopoEvent::EdgeAdded { .. } | TopoEvent::EdgeRemoved { .. } => {}
                TopoEvent::FaceAdded { f, .. } => {
                    shadow.faces.remove(f);
                }
                TopoEvent::FaceRemoved { f, verts } => {
                    shadow.faces.insert(*f, verts.clone());
                }
                TopoEvent::EdgeSplit { v_new, .. } => {
                    // Undoing a split removes the midpoint from every face
                    // it had been spliced into, then drops the vertex.
                    for verts in shadow.faces.values_mut() {
                        verts.retain(|v| v != v_new);
                    }
                    shadow.verts.remove(v_new);
                }
            }
        }
    }
}
