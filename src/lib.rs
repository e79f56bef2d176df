//! Dynamic topology remeshing for interactive sculpting.
//!
//! Given a triangle mesh whose faces live in leaves of a host spatial
//! hierarchy, [`update_topology`] makes edge lengths inside a brush region
//! converge toward a target: long edges split, short edges collapse,
//! valence-3/4 interior vertices dissolve, and positions relax
//! tangentially. The host supplies the hierarchy, the undo log and an
//! optional mask callback; everything else lives here.

pub mod annot;
pub mod attrib;
pub mod cleanup;
pub mod collapse;
pub mod driver;
pub mod leaf;
pub mod log;
pub mod mesh;
pub mod queue;
pub mod smooth;
pub mod store;
pub mod subdivide;
pub mod triangulate;

pub use annot::{VertState, VertTable};
pub use attrib::AttrLayout;
pub use driver::{update_topology, Mode, RemeshContext, RemeshParams};
pub use leaf::{Hierarchy, LeafDirty, LeafSet, NO_LEAF};
pub use log::{NullLog, ReplayLog, Shadow, TopoLog};
pub use mesh::{HeadFlags, TopoMesh};
pub use queue::{Region, QueueMode};
pub use store::{EdgeRef, ElemKey, FaceRef, LoopRef, VertRef};
