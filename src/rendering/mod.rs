pub mod binner;
pub mod depth_buffer;
/// Occluder depth pipeline: vertex transform, triangle binning, and tiled
/// SIMD edge-function rasterization with depth-only output.
pub mod occluder;
pub mod rasterizer;

pub use binner::{BinnedTriangle, TriangleBins};
pub use depth_buffer::{DepthBuffer, DepthView, DEPTH_CLEAR};
pub use occluder::{
    OccluderMesh, OccluderModel, OccluderScene, TransformScratch, Viewport,
};
pub use rasterizer::rasterize_tile_task;
