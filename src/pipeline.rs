//! The per-frame culling pipeline.
//!
//! Owns every frame-scoped buffer (depth, bins, transform scratch, flag
//! arrays) plus the worker pool, and wires the frame task graph:
//!
//! ```text
//!   [A] occludee frustum cull ────────────────┐
//!   [B] occluder frustum cull → [C] transform │
//!         → [D] bin → [E] rasterize ──────────┴→ [F] depth test
//! ```
//!
//! Configuration violations fail at construction; the frame path itself
//! never returns errors (callers watch the counters instead).

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use glam::Mat4;
use thiserror::Error;
use tracing::{debug, warn};

use crate::camera::Frustum;
use crate::occludee::{
    depth_test_task, frustum_cull_task, DepthTestParams, OccludeeSet, PackedFrustum,
};
use crate::perf::{CounterSnapshot, CullingCounters};
use crate::rendering::binner::{bin_triangles_task, TriangleBins};
use crate::rendering::depth_buffer::DepthBuffer;
use crate::rendering::occluder::{transform_task, OccluderScene, TransformScratch, Viewport};
use crate::rendering::rasterizer::rasterize_tile_task;
use crate::task::{TaskGraph, TaskPool};

/// Pipeline configuration. Validated once at construction.
#[derive(Debug, Clone)]
pub struct CullingConfig {
    /// Depth buffer width in pixels; must be even.
    pub width: usize,
    /// Depth buffer height in pixels; must be even.
    pub height: usize,
    /// Tile width; must be even and divide `width`.
    pub tile_width: usize,
    /// Tile height; must be even and divide `height`.
    pub tile_height: usize,
    /// Transform/bin producer task count.
    pub producer_tasks: usize,
    /// Capacity of each (tile, producer) bin.
    pub max_tris_in_bin: usize,
    /// Occludee depth-test task count.
    pub depth_test_tasks: usize,
    /// Squared-pixel screen area below which occludees are culled outright.
    pub occludee_size_threshold: f32,
    /// Worker threads; `None` sizes the pool to hardware threads minus one.
    pub worker_threads: Option<usize>,
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            tile_width: 320,
            tile_height: 90,
            producer_tasks: 4,
            max_tris_in_bin: 1024,
            depth_test_tasks: 4,
            occludee_size_threshold: 0.0,
            worker_threads: None,
        }
    }
}

impl CullingConfig {
    #[inline]
    pub fn tiles_x(&self) -> usize {
        self.width / self.tile_width
    }

    #[inline]
    pub fn tiles_y(&self) -> usize {
        self.height / self.tile_height
    }

    #[inline]
    pub fn tile_count(&self) -> usize {
        self.tiles_x() * self.tiles_y()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.width == 0 || self.height == 0 || self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(ConfigError::BadScreenSize {
                width: self.width,
                height: self.height,
            });
        }
        if self.tile_width == 0
            || self.tile_height == 0
            || self.tile_width % 2 != 0
            || self.tile_height % 2 != 0
        {
            return Err(ConfigError::BadTileSize {
                tile_width: self.tile_width,
                tile_height: self.tile_height,
            });
        }
        if self.width % self.tile_width != 0 || self.height % self.tile_height != 0 {
            return Err(ConfigError::TilesDoNotDivideScreen {
                width: self.width,
                height: self.height,
                tile_width: self.tile_width,
                tile_height: self.tile_height,
            });
        }
        if self.producer_tasks == 0 {
            return Err(ConfigError::NoProducerTasks);
        }
        if self.max_tris_in_bin == 0 {
            return Err(ConfigError::EmptyBins);
        }
        if self.depth_test_tasks == 0 {
            return Err(ConfigError::NoDepthTestTasks);
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("depth buffer dimensions must be even and nonzero, got {width}x{height}")]
    BadScreenSize { width: usize, height: usize },

    #[error("tile dimensions must be even and nonzero, got {tile_width}x{tile_height}")]
    BadTileSize { tile_width: usize, tile_height: usize },

    #[error(
        "tiles of {tile_width}x{tile_height} do not evenly divide the {width}x{height} depth buffer"
    )]
    TilesDoNotDivideScreen {
        width: usize,
        height: usize,
        tile_width: usize,
        tile_height: usize,
    },

    #[error("producer task count must be nonzero")]
    NoProducerTasks,

    #[error("bin capacity must be nonzero")]
    EmptyBins,

    #[error("depth test task count must be nonzero")]
    NoDepthTestTasks,

    #[error("failed to build the worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

/// Per-frame camera inputs.
pub struct FrameInputs {
    pub view: Mat4,
    pub proj: Mat4,
    pub frustum: Frustum,
}

impl FrameInputs {
    /// Build frame inputs with the frustum extracted from proj * view.
    pub fn from_matrices(view: Mat4, proj: Mat4) -> Self {
        let frustum = Frustum::from_view_projection(&(proj * view));
        Self { view, proj, frustum }
    }
}

pub struct CullingPipeline {
    config: CullingConfig,
    pool: TaskPool,
    depth: DepthBuffer,
    bins: TriangleBins,
    scratch: TransformScratch,
    counters: CullingCounters,

    // Frame-scoped flag storage, atomics so tasks share them by reference.
    model_clip: Vec<Mat4>,
    model_in_frustum: Vec<AtomicBool>,
    model_rasterized: Vec<AtomicBool>,
    packet_outside: Vec<AtomicU8>,
    visible_flags: Vec<AtomicBool>,

    // Published results, registration order.
    visible: Vec<bool>,
    rasterized: Vec<bool>,
    num_culled: usize,
}

impl CullingPipeline {
    pub fn new(config: CullingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let workers = config.worker_threads.unwrap_or_else(TaskPool::default_workers);
        let pool = TaskPool::new(workers)?;
        debug!(
            width = config.width,
            height = config.height,
            tiles = config.tile_count(),
            workers = pool.worker_count(),
            "culling pipeline ready"
        );
        let depth = DepthBuffer::new(config.width, config.height);
        let bins = TriangleBins::new(
            config.tiles_x(),
            config.tiles_y(),
            config.producer_tasks,
            config.max_tris_in_bin,
        );
        Ok(Self {
            config,
            pool,
            depth,
            bins,
            scratch: TransformScratch::new(),
            counters: CullingCounters::new(),
            model_clip: Vec::new(),
            model_in_frustum: Vec::new(),
            model_rasterized: Vec::new(),
            packet_outside: Vec::new(),
            visible_flags: Vec::new(),
            num_culled: 0,
            visible: Vec::new(),
            rasterized: Vec::new(),
        })
    }

    #[inline]
    pub fn config(&self) -> &CullingConfig {
        &self.config
    }

    /// Visibility flags, one per registered occludee in registration order.
    #[inline]
    pub fn visible(&self) -> &[bool] {
        &self.visible
    }

    #[inline]
    pub fn is_visible(&self, occludee: usize) -> bool {
        self.visible[occludee]
    }

    /// Whether any triangle of each occluder model survived into the bins
    /// this frame (diagnostic).
    #[inline]
    pub fn occluder_rasterized(&self) -> &[bool] {
        &self.rasterized
    }

    /// Occludees culled this frame (frustum, size, or occlusion).
    #[inline]
    pub fn num_culled(&self) -> usize {
        self.num_culled
    }

    #[inline]
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// The depth buffer as of the last frame (diagnostic).
    #[inline]
    pub fn depth_buffer(&self) -> &DepthBuffer {
        &self.depth
    }

    /// Run the whole culling frame: rasterize `scene` into the depth buffer
    /// and decide visibility for every occludee.
    pub fn render_frame(
        &mut self,
        scene: &OccluderScene,
        occludees: &OccludeeSet,
        inputs: &FrameInputs,
    ) {
        self.counters.reset();
        self.prepare_frame_storage(scene, occludees);
        self.depth.clear();

        let view_proj = inputs.proj * inputs.view;
        for (m, model) in scene.models().iter().enumerate() {
            self.model_clip[m] = view_proj * model.world_transform();
        }

        let viewport = Viewport::new(self.config.width, self.config.height);
        let packed_frustum = PackedFrustum::new(&inputs.frustum);
        let frustum = inputs.frustum;
        let params = DepthTestParams {
            view_proj,
            viewport,
            size_threshold: self.config.occludee_size_threshold,
        };

        let scratch_view = self.scratch.view();
        let bins_view = self.bins.frame_view();
        let depth_view = self.depth.frame_view();

        let model_clip = &self.model_clip;
        let model_in_frustum = &self.model_in_frustum;
        let model_rasterized = &self.model_rasterized;
        let packet_outside = &self.packet_outside;
        let visible_flags = &self.visible_flags;
        let counters = &self.counters;
        let config = &self.config;

        let mut graph = TaskGraph::new(&self.pool);

        let occludee_frustum = graph.create_task_set(
            "occludee frustum cull",
            config.depth_test_tasks,
            &[],
            |task_id, task_count| {
                frustum_cull_task(occludees, &packed_frustum, packet_outside, task_id, task_count);
            },
        );

        let occluder_frustum = graph.create_task_set(
            "occluder frustum cull",
            scene.models().len(),
            &[],
            move |task_id, _| {
                let (min, max) = scene.models()[task_id].world_bounds();
                let inside = frustum.intersects_aabb(min, max);
                model_in_frustum[task_id].store(inside, Ordering::Relaxed);
            },
        );

        let transform = graph.create_task_set(
            "transform occluder vertices",
            config.producer_tasks,
            &[occluder_frustum],
            move |task_id, task_count| {
                transform_task(
                    scene,
                    model_clip,
                    model_in_frustum,
                    &scratch_view,
                    viewport,
                    task_id,
                    task_count,
                );
            },
        );

        let bin = graph.create_task_set(
            "bin triangles",
            config.producer_tasks,
            &[transform],
            move |task_id, task_count| {
                bin_triangles_task(
                    scene,
                    &scratch_view,
                    &bins_view,
                    model_in_frustum,
                    model_rasterized,
                    counters,
                    config.width,
                    config.height,
                    config.tile_width,
                    config.tile_height,
                    task_id,
                    task_count,
                );
            },
        );

        let rasterize = graph.create_task_set(
            "rasterize tile depth",
            config.tile_count(),
            &[bin],
            move |task_id, _| {
                rasterize_tile_task(
                    scene,
                    &scratch_view,
                    &bins_view,
                    &depth_view,
                    config.tile_width,
                    config.tile_height,
                    counters,
                    task_id,
                );
            },
        );

        let depth_test = graph.create_task_set(
            "test occludees",
            config.depth_test_tasks,
            &[occludee_frustum, rasterize],
            move |task_id, task_count| {
                depth_test_task(
                    occludees,
                    packet_outside,
                    visible_flags,
                    &params,
                    &depth_view,
                    counters,
                    task_id,
                    task_count,
                );
            },
        );

        graph.wait_for_set(depth_test);
        for handle in [
            occludee_frustum,
            occluder_frustum,
            transform,
            bin,
            rasterize,
            depth_test,
        ] {
            graph.release_handle(handle);
        }
        drop(graph);

        self.publish_results(scene, occludees);
    }

    fn prepare_frame_storage(&mut self, scene: &OccluderScene, occludees: &OccludeeSet) {
        self.scratch.prepare(scene.total_vertices());

        let models = scene.models().len();
        self.model_clip.resize(models, Mat4::IDENTITY);
        resize_atomic_flags(&mut self.model_in_frustum, models);
        resize_atomic_flags(&mut self.model_rasterized, models);
        for flag in &self.model_rasterized {
            flag.store(false, Ordering::Relaxed);
        }

        let packets = occludees.packet_count();
        while self.packet_outside.len() < packets {
            self.packet_outside.push(AtomicU8::new(0));
        }
        resize_atomic_flags(&mut self.visible_flags, occludees.len());
    }

    fn publish_results(&mut self, scene: &OccluderScene, occludees: &OccludeeSet) {
        self.visible.clear();
        self.visible.extend(
            self.visible_flags[..occludees.len()]
                .iter()
                .map(|flag| flag.load(Ordering::Relaxed)),
        );
        self.rasterized.clear();
        self.rasterized.extend(
            self.model_rasterized[..scene.models().len()]
                .iter()
                .map(|flag| flag.load(Ordering::Relaxed)),
        );
        self.num_culled = self.visible.iter().filter(|&&v| !v).count();

        let watermark = self.bins.frame_view().high_watermark();
        self.counters
            .bin_high_watermark
            .store(watermark as u64, Ordering::Relaxed);

        let dropped = self
            .counters
            .triangles_dropped_bin_full
            .load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(
                dropped,
                capacity = self.config.max_tris_in_bin,
                watermark, "bin overflow dropped occluder triangles; culling is degraded"
            );
        }
    }
}

fn resize_atomic_flags(flags: &mut Vec<AtomicBool>, len: usize) {
    while flags.len() < len {
        flags.push(AtomicBool::new(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(CullingConfig::default().validate().is_ok());
    }

    #[test]
    fn odd_screen_is_rejected() {
        let config = CullingConfig {
            width: 1281,
            ..CullingConfig::default()
        };
        assert!(matches!(
            CullingPipeline::new(config),
            Err(ConfigError::BadScreenSize { .. })
        ));
    }

    #[test]
    fn odd_tile_is_rejected() {
        let config = CullingConfig {
            tile_width: 321,
            ..CullingConfig::default()
        };
        assert!(matches!(
            CullingPipeline::new(config),
            Err(ConfigError::BadTileSize { .. })
        ));
    }

    #[test]
    fn non_dividing_tile_is_rejected() {
        let config = CullingConfig {
            tile_width: 300,
            ..CullingConfig::default()
        };
        assert!(matches!(
            CullingPipeline::new(config),
            Err(ConfigError::TilesDoNotDivideScreen { .. })
        ));
    }

    #[test]
    fn zero_producer_tasks_rejected() {
        let config = CullingConfig {
            producer_tasks: 0,
            ..CullingConfig::default()
        };
        assert!(matches!(
            CullingPipeline::new(config),
            Err(ConfigError::NoProducerTasks)
        ));
    }
}
