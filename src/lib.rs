pub mod camera;
pub mod occludee;
pub mod perf;
pub mod pipeline;
/// CPU software occlusion culling: occluders rasterize into a low-resolution
/// reciprocal-depth buffer, occludee AABBs test against it, and the caller
/// skips everything the depth buffer proves hidden.
pub mod rendering;
pub mod simd;
pub mod task;

pub use camera::{Camera, Frustum};
pub use occludee::{AabbPacket, OccludeeSet, PackedFrustum};
pub use perf::{CounterSnapshot, CullingCounters};
pub use pipeline::{ConfigError, CullingConfig, CullingPipeline, FrameInputs};
pub use rendering::{DepthBuffer, OccluderMesh, OccluderModel, OccluderScene, TriangleBins};
pub use simd::{Vec4f, Vec4i};
pub use task::{TaskGraph, TaskPool, TaskSetHandle, INVALID_TASK_SET};
