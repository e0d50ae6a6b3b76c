//! Tile depth rasterizer.
//!
//! One task per screen tile. Each task drains the tile's producer bins four
//! triangles at a time, sets up integer edge functions, and walks the
//! triangle bbox in 2x2 pixel quads, max-merging reciprocal depth into the
//! quad-contiguous depth buffer. Max-merge is commutative and associative,
//! so tiles and triangles can be processed in any order without locks.

use crate::perf::CullingCounters;
use crate::rendering::binner::{BinnedTriangle, BinsView, SIMD_WIDTH};
use crate::rendering::depth_buffer::DepthView;
use crate::rendering::occluder::{OccluderScene, ScratchView};
use crate::simd::{flush_denormals_to_zero, Vec4f, Vec4i};

/// Reads one tile's bins across all producers in order, spanning bin
/// boundaries so gather groups stay full as long as triangles remain.
struct BinCursor<'a> {
    bins: &'a BinsView,
    tile_x: usize,
    tile_y: usize,
    producer: usize,
    offset: usize,
}

impl<'a> BinCursor<'a> {
    fn next(&mut self) -> Option<BinnedTriangle> {
        while self.producer < self.bins.producers() {
            let bin = self.bins.bin(self.tile_x, self.tile_y, self.producer);
            if self.offset < bin.len() {
                let tri = bin[self.offset];
                self.offset += 1;
                return Some(tri);
            }
            self.producer += 1;
            self.offset = 0;
        }
        None
    }
}

/// One rasterize task: draw every triangle binned to tile `tile_index`.
#[allow(clippy::too_many_arguments)]
pub fn rasterize_tile_task(
    scene: &OccluderScene,
    scratch: &ScratchView,
    bins: &BinsView,
    depth: &DepthView,
    tile_width: usize,
    tile_height: usize,
    counters: &CullingCounters,
    tile_index: usize,
) {
    // Depth values near the far plane go denormal; flush them to zero so
    // the quad loop does not hit microcode-assist stalls.
    flush_denormals_to_zero();

    let screen_width = depth.width();
    let tiles_x = screen_width / tile_width;
    let tile_x = tile_index % tiles_x;
    let tile_y = tile_index / tiles_x;

    let tile_start_x = (tile_x * tile_width) as i32;
    let tile_end_x = tile_start_x + tile_width as i32;
    let tile_start_y = (tile_y * tile_height) as i32;
    let tile_end_y = tile_start_y + tile_height as i32;

    // Pixel offsets of a 2x2 quad relative to its origin.
    let col_offset = Vec4i::from_array([0, 1, 0, 1]);
    let row_offset = Vec4i::from_array([0, 0, 1, 1]);

    let mut cursor = BinCursor {
        bins,
        tile_x,
        tile_y,
        producer: 0,
        offset: 0,
    };

    loop {
        // Pull up to four triangles into SoA lanes. Unfilled lanes keep
        // zeroed coordinates and are skipped by the per-lane loop below.
        let mut xs = [[0.0f32; 4]; 3];
        let mut ys = [[0.0f32; 4]; 3];
        let mut ds = [[0.0f32; 4]; 3];
        let mut group = 0usize;
        while group < SIMD_WIDTH {
            let Some(tri) = cursor.next() else { break };
            let model = &scene.models()[tri.model as usize];
            let vertex_base = scene.vertex_base(tri.model as usize);
            let indices = model.meshes()[tri.mesh as usize].triangle(tri.tri as usize);
            for (v, idx) in indices.into_iter().enumerate() {
                let screen = unsafe { scratch.screen_at(vertex_base + idx as usize) };
                xs[v][group] = screen.x;
                ys[v][group] = screen.y;
                ds[v][group] = screen.z;
            }
            group += 1;
        }
        if group == 0 {
            break;
        }
        CullingCounters::add(&counters.triangles_rasterized, group as u64);

        // Fixed point for x and y only; depth stays float.
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

        // Edge functions Fab(x, y) = Ax + By + C with
        // A = ya - yb, B = xb - xa, C = xa*yb - xb*ya.
        let a0 = fy[1] - fy[2];
        let a1 = fy[2] - fy[0];
        let a2 = fy[0] - fy[1];

        let b0 = fx[2] - fx[1];
        let b1 = fx[0] - fx[2];
        let b2 = fx[1] - fx[0];

        let c0 = fx[1] * fy[2] - fx[2] * fy[1];
        let c1 = fx[2] * fy[0] - fx[0] * fy[2];
        let c2 = fx[0] * fy[1] - fx[1] * fy[0];

        let tri_area = b2 * a1 - b1 * a2;
        let one_over_area = Vec4f::splat(1.0) / tri_area.to_f32();

        // Depth plane: depth = Z0 + beta*Z1 + gama*Z2.
        let d0 = Vec4f::from_array(ds[0]);
        let d1 = Vec4f::from_array(ds[1]);
        let d2 = Vec4f::from_array(ds[2]);
        let z0 = d0;
        let z1 = (d1 - d0) * one_over_area;
        let z2 = (d2 - d0) * one_over_area;

        // Triangle bbox intersected with the tile; start snapped down to
        // even for 2x2 quad alignment (tile origins are even).
        let start_x = (fx[0].min(fx[1]).min(fx[2]).max(Vec4i::splat(tile_start_x))
            & Vec4i::splat(!1))
        .to_array();
        let end_x = (fx[0].max(fx[1]).max(fx[2]) + Vec4i::splat(1))
            .min(Vec4i::splat(tile_end_x))
            .to_array();
        let start_y = (fy[0].min(fy[1]).min(fy[2]).max(Vec4i::splat(tile_start_y))
            & Vec4i::splat(!1))
        .to_array();
        let end_y = (fy[0].max(fy[1]).max(fy[2]) + Vec4i::splat(1))
            .min(Vec4i::splat(tile_end_y))
            .to_array();

        let area_arr = tri_area.to_array();
        let a0_arr = a0.to_array();
        let a1_arr = a1.to_array();
        let a2_arr = a2.to_array();
        let b0_arr = b0.to_array();
        let b1_arr = b1.to_array();
        let b2_arr = b2.to_array();
        let c0_arr = c0.to_array();
        let c1_arr = c1.to_array();
        let c2_arr = c2.to_array();
        let z0_arr = z0.to_array();
        let z1_arr = z1.to_array();
        let z2_arr = z2.to_array();

        // The four triangles are set up; rasterize them one at a time.
        for lane in 0..group {
            // Rounding can collapse a thin triangle the binner accepted.
            if area_arr[lane] <= 0 {
                continue;
            }

            let sx = start_x[lane];
            let ex = end_x[lane];
            let sy = start_y[lane];
            let ey = end_y[lane];
            if sx >= ex || sy >= ey {
                continue;
            }

            let zz0 = Vec4f::splat(z0_arr[lane]);
            let zz1 = Vec4f::splat(z1_arr[lane]);
            let zz2 = Vec4f::splat(z2_arr[lane]);

            let aa0 = Vec4i::splat(a0_arr[lane]);
            let aa1 = Vec4i::splat(a1_arr[lane]);
            let aa2 = Vec4i::splat(a2_arr[lane]);
            let bb0 = Vec4i::splat(b0_arr[lane]);
            let bb1 = Vec4i::splat(b1_arr[lane]);
            let bb2 = Vec4i::splat(b2_arr[lane]);
            let cc0 = Vec4i::splat(c0_arr[lane]);
            let cc1 = Vec4i::splat(c1_arr[lane]);
            let cc2 = Vec4i::splat(c2_arr[lane]);

            // Stepping one quad right adds 2A; one quad down adds 2B.
            let aa0_inc = aa0.shl::<1>();
            let aa1_inc = aa1.shl::<1>();
            let aa2_inc = aa2.shl::<1>();
            let bb0_inc = bb0.shl::<1>();
            let bb1_inc = bb1.shl::<1>();
            let bb2_inc = bb2.shl::<1>();

            let col = Vec4i::splat(sx) + col_offset;
            let row = Vec4i::splat(sy) + row_offset;
            let mut sum0_row = aa0 * col + bb0 * row + cc0;
            let mut sum1_row = aa1 * col + bb1 * row + cc1;
            let mut sum2_row = aa2 * col + bb2 * row + cc2;

            let mut row_slot = depth.quad_slot(sx as usize, sy as usize);

            let mut r = sy;
            while r < ey {
                let mut slot = row_slot;
                let mut alpha = sum0_row;
                let mut beta = sum1_row;
                let mut gama = sum2_row;

                let mut c = sx;
                while c < ex {
                    // A lane is inside while all three edge values are
                    // non-negative; the OR collects the sign bits.
                    let mask = alpha | beta | gama;
                    if !mask.is_all_negative() {
                        let mut quad_depth = zz0;
                        quad_depth = quad_depth + beta.to_f32() * zz1;
                        quad_depth = quad_depth + gama.to_f32() * zz2;

                        let previous = unsafe { depth.load_quad(slot) };
                        let merged = quad_depth.max(previous);
                        let merged = Vec4f::select(merged, previous, mask);
                        unsafe { depth.store_quad(slot, merged) };
                    }

                    c += 2;
                    slot += 4;
                    alpha = alpha + aa0_inc;
                    beta = beta + aa1_inc;
                    gama = gama + aa2_inc;
                }

                r += 2;
                row_slot += 2 * screen_width;
                sum0_row = sum0_row + bb0_inc;
                sum1_row = sum1_row + bb1_inc;
                sum2_row = sum2_row + bb2_inc;
            }
        }
    }
}
