//! Screen-space triangle binning.
//!
//! Binner tasks partition the global triangle range (rounded up to the SIMD
//! width) and append surviving triangles to per-(tile, producer) bins. Each
//! producer writes only its own bin slices and each tile task later reads
//! all producer slices, so the 3-D bin indexing needs no synchronization.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::perf::CullingCounters;
use crate::rendering::occluder::{clip_flags, OccluderMesh, OccluderScene, ScratchView};
use crate::simd::Vec4f;

/// Triangles processed per gather group.
pub const SIMD_WIDTH: usize = 4;

/// Largest fixed-point coordinate magnitude the rasterizer accepts. Keeps
/// the edge-constant products (x*y) and the traversal sums inside i32.
/// Triangles beyond it drop, which is the conservative direction.
const FIXED_POINT_BOUND: i32 = 16 * 1024;

/// Descriptor of one binned triangle.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BinnedTriangle {
    pub model: u16,
    pub mesh: u16,
    pub tri: u32,
}

/// Per-(tile, producer) triangle bins with fixed capacity.
pub struct TriangleBins {
    tiles_x: usize,
    tiles_y: usize,
    producers: usize,
    capacity: usize,
    tris: Vec<BinnedTriangle>,
    counts: Vec<u32>,
}

impl TriangleBins {
    pub fn new(tiles_x: usize, tiles_y: usize, producers: usize, capacity: usize) -> Self {
        let bins = tiles_x * tiles_y * producers;
        Self {
            tiles_x,
            tiles_y,
            producers,
            capacity,
            tris: vec![
                BinnedTriangle {
                    model: 0,
                    mesh: 0,
                    tri: 0
                };
                bins * capacity
            ],
            counts: vec![0; bins],
        }
    }

    #[inline]
    pub fn tiles_x(&self) -> usize {
        self.tiles_x
    }

    #[inline]
    pub fn tiles_y(&self) -> usize {
        self.tiles_y
    }

    #[inline]
    pub fn producers(&self) -> usize {
        self.producers
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create the per-frame shared view used by binner and tile tasks.
    pub fn frame_view(&mut self) -> BinsView {
        BinsView {
            tris: self.tris.as_mut_ptr(),
            counts: self.counts.as_mut_ptr(),
            tiles_x: self.tiles_x,
            tiles_y: self.tiles_y,
            producers: self.producers,
            capacity: self.capacity,
        }
    }
}

/// Per-frame view into the triangle bins.
///
/// Producer `p` writes only bin slices `(_, _, p)`; tile tasks read all
/// producers but only after the bin task set completed. The view must not
/// outlive the bins it came from.
#[derive(Copy, Clone)]
pub struct BinsView {
    tris: *mut BinnedTriangle,
    counts: *mut u32,
    tiles_x: usize,
    tiles_y: usize,
    producers: usize,
    capacity: usize,
}

unsafe impl Send for BinsView {}
unsafe impl Sync for BinsView {}

impl BinsView {
    #[inline]
    pub fn producers(&self) -> usize {
        self.producers
    }

    #[inline]
    fn bin_slot(&self, tile_x: usize, tile_y: usize, producer: usize) -> usize {
        debug_assert!(tile_x < self.tiles_x && tile_y < self.tiles_y && producer < self.producers);
        (tile_y * self.tiles_x + tile_x) * self.producers + producer
    }

    /// Zero this producer's bin counts across all tiles (start of its task).
    pub fn reset_producer(&self, producer: usize) {
        for tile_y in 0..self.tiles_y {
            for tile_x in 0..self.tiles_x {
                let slot = self.bin_slot(tile_x, tile_y, producer);
                unsafe { *self.counts.add(slot) = 0 };
            }
        }
    }

    /// Append a triangle; returns false when the bin is full.
    #[inline]
    pub fn push(&self, tile_x: usize, tile_y: usize, producer: usize, tri: BinnedTriangle) -> bool {
        let slot = self.bin_slot(tile_x, tile_y, producer);
        unsafe {
            let count = *self.counts.add(slot) as usize;
            if count >= self.capacity {
                return false;
            }
            *self.tris.add(slot * self.capacity + count) = tri;
            *self.counts.add(slot) = (count + 1) as u32;
        }
        true
    }

    #[inline]
    pub fn count(&self, tile_x: usize, tile_y: usize, producer: usize) -> usize {
        let slot = self.bin_slot(tile_x, tile_y, producer);
        unsafe { *self.counts.add(slot) as usize }
    }

    /// Binned triangles of one (tile, producer) slice.
    #[inline]
    pub fn bin(&self, tile_x: usize, tile_y: usize, producer: usize) -> &[BinnedTriangle] {
        let slot = self.bin_slot(tile_x, tile_y, producer);
        unsafe {
            let count = *self.counts.add(slot) as usize;
            std::slice::from_raw_parts(self.tris.add(slot * self.capacity), count)
        }
    }

    /// Largest bin fill across all (tile, producer) slices.
    pub fn high_watermark(&self) -> u32 {
        let bins = self.tiles_x * self.tiles_y * self.producers;
        let mut max = 0u32;
        for slot in 0..bins {
            max = max.max(unsafe { *self.counts.add(slot) });
        }
        max
    }
}

/// One binner task: bin the global triangle range assigned to `task_id`.
#[allow(clippy::too_many_arguments)]
pub fn bin_triangles_task(
    scene: &OccluderScene,
    scratch: &ScratchView,
    bins: &BinsView,
    model_in_frustum: &[AtomicBool],
    model_rasterized: &[AtomicBool],
    counters: &CullingCounters,
    screen_width: usize,
    screen_height: usize,
    tile_width: usize,
    tile_height: usize,
    task_id: usize,
    task_count: usize,
) {
    bins.reset_producer(task_id);

    let total = scene.total_triangles();
    // Round the per-task range up to the SIMD width so gather groups never
    // straddle a task boundary.
    let mut per_task = (total + task_count - 1) / task_count;
    per_task += (SIMD_WIDTH - per_task % SIMD_WIDTH) % SIMD_WIDTH;
    let start = task_id * per_task;
    let end = (start + per_task).min(total);
    if start >= end {
        return;
    }

    let mut tri_base = 0usize;
    for (m, model) in scene.models().iter().enumerate() {
        let model_tris = model.triangle_count();
        let model_start = start.max(tri_base);
        let model_end = end.min(tri_base + model_tris);
        if model_start < model_end && model_in_frustum[m].load(Ordering::Relaxed) {
            let mut mesh_base = 0usize;
            for (mesh_idx, mesh) in model.meshes().iter().enumerate() {
                let mesh_tris = mesh.triangle_count();
                let s = (model_start - tri_base).max(mesh_base);
                let e = (model_end - tri_base).min(mesh_base + mesh_tris);
                if s < e {
                    bin_mesh_range(BinMeshRange {
                        scene,
                        scratch,
                        bins,
                        model_rasterized,
                        counters,
                        screen_width,
                        screen_height,
                        tile_width,
                        tile_height,
                        producer: task_id,
                        model: m,
                        mesh_idx,
                        mesh,
                        start: s - mesh_base,
                        end: e - mesh_base,
                    });
                }
                mesh_base += mesh_tris;
            }
        }
        tri_base += model_tris;
    }
}

struct BinMeshRange<'a> {
    scene: &'a OccluderScene,
    scratch: &'a ScratchView,
    bins: &'a BinsView,
    model_rasterized: &'a [AtomicBool],
    counters: &'a CullingCounters,
    screen_width: usize,
    screen_height: usize,
    tile_width: usize,
    tile_height: usize,
    producer: usize,
    model: usize,
    mesh_idx: usize,
    mesh: &'a OccluderMesh,
    start: usize,
    end: usize,
}

fn bin_mesh_range(args: BinMeshRange<'_>) {
    let BinMeshRange {
        scene,
        scratch,
        bins,
        model_rasterized,
        counters,
        screen_width,
        screen_height,
        tile_width,
        tile_height,
        producer,
        model,
        mesh_idx,
        mesh,
        start,
        end,
    } = args;

    let vertex_base = scene.vertex_base(model);

    let mut tri = start;
    while tri < end {
        let lanes = (end - tri).min(SIMD_WIDTH);

        // Gather the three transformed vertices of up to four triangles.
        let mut xs = [[0.0f32; 4]; 3];
        let mut ys = [[0.0f32; 4]; 3];
        let mut and_flags = [0xffu8; 4];
        let mut or_flags = [0u8; 4];
        for lane in 0..lanes {
            let indices = mesh.triangle(tri + lane);
            for (v, idx) in indices.into_iter().enumerate() {
                let global = vertex_base + idx as usize;
                let screen = unsafe { scratch.screen_at(global) };
                let flags = unsafe { scratch.flags_at(global) };
                xs[v][lane] = screen.x;
                ys[v][lane] = screen.y;
                and_flags[lane] &= flags;
                or_flags[lane] |= flags;
            }
        }

        // Whole-pixel fixed point, then signed area and screen bbox.
        let fx = [
            Vec4f::from_array(xs[0]).round_to_i32(),
            Vec4f::from_array(xs[1]).round_to_i32(),
            Vec4f::from_array(xs[2]).round_to_i32(),
        ];
        let fy = [
            Vec4f::from_array(ys[0]).round_to_i32(),
            Vec4f::from_array(ys[1]).round_to_i32(),
            Vec4f::from_array(ys[2]).round_to_i32(),
        ];

        let a1 = fy[2] - fy[0];
        let a2 = fy[0] - fy[1];
        let b1 = fx[0] - fx[2];
        let b2 = fx[1] - fx[0];
        let area = (b2 * a1 - b1 * a2).to_array();

        let min_x = fx[0].min(fx[1]).min(fx[2]).to_array();
        let max_x = fx[0].max(fx[1]).max(fx[2]).to_array();
        let min_y = fy[0].min(fy[1]).min(fy[2]).to_array();
        let max_y = fy[0].max(fy[1]).max(fy[2]).to_array();

        for lane in 0..lanes {
            // Dropped if all vertices share an out bit, or any vertex is
            // behind the near plane (conservative: a missed occluder only
            // means less culling).
            if and_flags[lane] != 0 || (or_flags[lane] & clip_flags::NEAR) != 0 {
                CullingCounters::bump(&counters.triangles_rejected_clip);
                continue;
            }
            // A tiny w can throw coordinates far past the guard band where
            // the fixed-point edge setup would overflow; drop those too.
            if min_x[lane] < -FIXED_POINT_BOUND
                || max_x[lane] > FIXED_POINT_BOUND
                || min_y[lane] < -FIXED_POINT_BOUND
                || max_y[lane] > FIXED_POINT_BOUND
            {
                CullingCounters::bump(&counters.triangles_rejected_clip);
                continue;
            }
            // Back-facing or degenerate.
            if area[lane] <= 0 {
                CullingCounters::bump(&counters.triangles_rejected_backface);
                continue;
            }

            let mut x0 = min_x[lane];
            let mut y0 = min_y[lane];
            let mut x1 = max_x[lane];
            let mut y1 = max_y[lane];
            if x1 < 0 || y1 < 0 || x0 >= screen_width as i32 || y0 >= screen_height as i32 {
                CullingCounters::bump(&counters.triangles_rejected_clip);
                continue;
            }
            x0 = x0.max(0);
            y0 = y0.max(0);
            x1 = x1.min(screen_width as i32 - 1);
            y1 = y1.min(screen_height as i32 - 1);

            let tile_x0 = x0 as usize / tile_width;
            let tile_x1 = x1 as usize / tile_width;
            let tile_y0 = y0 as usize / tile_height;
            let tile_y1 = y1 as usize / tile_height;

            let descriptor = BinnedTriangle {
                model: model as u16,
                mesh: mesh_idx as u16,
                tri: (tri + lane) as u32,
            };

            for tile_y in tile_y0..=tile_y1 {
                for tile_x in tile_x0..=tile_x1 {
                    if !bins.push(tile_x, tile_y, producer, descriptor) {
                        CullingCounters::bump(&counters.triangles_dropped_bin_full);
                        debug_assert!(
                            false,
                            "bin overflow at tile ({tile_x}, {tile_y}) producer {producer}"
                        );
                    }
                }
            }

            CullingCounters::bump(&counters.triangles_binned);
            model_rasterized[model].store(true, Ordering::Relaxed);
        }

        tri += lanes;
    }
}
