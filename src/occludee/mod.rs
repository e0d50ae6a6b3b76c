//! Occludee AABB packets, frustum culling, and the depth-buffer test.
//!
//! Occludees are registered once and laid out in packets of four with a
//! structure-of-arrays layout, so one plane-vs-box test answers four boxes
//! at a time. Per frame, packet frustum culling (graph node A) produces a
//! 4-bit outside mask per packet; the depth-test tasks (node F) consume the
//! masks plus the rasterized depth buffer and write the visibility flags.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use glam::{Mat4, Vec3};

use crate::camera::Frustum;
use crate::perf::CullingCounters;
use crate::rendering::depth_buffer::DepthView;
use crate::rendering::occluder::{Viewport, NEAR_W_EPS};
use crate::simd::Vec4f;

/// Boxes per packet.
pub const PACKET_LANES: usize = 4;

/// Four world-space AABBs in structure-of-arrays layout. Unused trailing
/// lanes stay zero-initialized; their results are never published.
#[derive(Clone)]
pub struct AabbPacket {
    pub center: [[f32; 4]; 3],
    pub half: [[f32; 4]; 3],
}

impl AabbPacket {
    fn zeroed() -> Self {
        Self {
            center: [[0.0; 4]; 3],
            half: [[0.0; 4]; 3],
        }
    }
}

/// Registration-order set of occludee AABBs.
#[derive(Default)]
pub struct OccludeeSet {
    packets: Vec<AabbPacket>,
    count: usize,
}

impl OccludeeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one occludee; returns its index, which is also its slot in
    /// the pipeline's visibility output. Half extents must be non-negative.
    pub fn push(&mut self, center: Vec3, half: Vec3) -> usize {
        debug_assert!(half.x >= 0.0 && half.y >= 0.0 && half.z >= 0.0);
        let idx = self.count;
        let lane = idx % PACKET_LANES;
        if lane == 0 {
            self.packets.push(AabbPacket::zeroed());
        }
        let packet = self.packets.last_mut().expect("packet pushed above");
        packet.center[0][lane] = center.x;
        packet.center[1][lane] = center.y;
        packet.center[2][lane] = center.z;
        packet.half[0][lane] = half.x;
        packet.half[1][lane] = half.y;
        packet.half[2][lane] = half.z;
        self.count += 1;
        idx
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    #[inline]
    pub fn packet_count(&self) -> usize {
        self.packets.len()
    }

    #[inline]
    pub fn packets(&self) -> &[AabbPacket] {
        &self.packets
    }

    /// Center and half extents of occludee `idx`.
    pub fn get(&self, idx: usize) -> (Vec3, Vec3) {
        let packet = &self.packets[idx / PACKET_LANES];
        let lane = idx % PACKET_LANES;
        (
            Vec3::new(
                packet.center[0][lane],
                packet.center[1][lane],
                packet.center[2][lane],
            ),
            Vec3::new(
                packet.half[0][lane],
                packet.half[1][lane],
                packet.half[2][lane],
            ),
        )
    }
}

/// Frustum planes splatted for packet tests: per plane, the broadcast
/// normal, the normal's sign bits (to pick each box's positive corner by
/// XOR), and the broadcast distance.
pub struct PackedFrustum {
    normal: [[Vec4f; 3]; 6],
    normal_sign: [[Vec4f; 3]; 6],
    dist: [Vec4f; 6],
}

impl PackedFrustum {
    pub fn new(frustum: &Frustum) -> Self {
        let sign_mask = Vec4f::sign_bit_mask();
        let mut normal = [[Vec4f::zero(); 3]; 6];
        let mut normal_sign = [[Vec4f::zero(); 3]; 6];
        let mut dist = [Vec4f::zero(); 6];
        for (j, plane) in frustum.planes.iter().enumerate() {
            let components = [plane.x, plane.y, plane.z];
            for axis in 0..3 {
                let n = Vec4f::splat(components[axis]);
                normal[j][axis] = n;
                normal_sign[j][axis] = n & sign_mask;
            }
            dist[j] = Vec4f::splat(plane.w);
        }
        Self {
            normal,
            normal_sign,
            dist,
        }
    }

    /// Test four boxes against all six planes. Returns a 4-bit mask with
    /// bit `lane` set when that box is outside the frustum.
    pub fn cull_packet(&self, packet: &AabbPacket) -> u8 {
        let cx = Vec4f::from_array(packet.center[0]);
        let cy = Vec4f::from_array(packet.center[1]);
        let cz = Vec4f::from_array(packet.center[2]);
        let hx = Vec4f::from_array(packet.half[0]);
        let hy = Vec4f::from_array(packet.half[1]);
        let hz = Vec4f::from_array(packet.half[2]);

        let mut outside = Vec4f::zero();
        for j in 0..6 {
            // Positive corner: sign each half extent to match the plane
            // normal, so the dot product is the maximum over the box.
            let px = cx + (hx ^ self.normal_sign[j][0]);
            let py = cy + (hy ^ self.normal_sign[j][1]);
            let pz = cz + (hz ^ self.normal_sign[j][2]);

            let mut dot = self.dist[j];
            dot = dot + px * self.normal[j][0];
            dot = dot + py * self.normal[j][1];
            dot = dot + pz * self.normal[j][2];

            // Negative distance for the positive corner means the whole box
            // is outside this plane; collect the sign bits across planes.
            outside = outside | dot;
        }
        (outside.movemask() & 0b1111) as u8
    }
}

/// Per-frame constants of the occludee depth test.
#[derive(Copy, Clone)]
pub struct DepthTestParams {
    pub view_proj: Mat4,
    pub viewport: Viewport,
    /// Squared-pixel screen area below which occludees are culled outright.
    pub size_threshold: f32,
}

/// Conservative visibility of one box against the rasterized depth buffer.
///
/// Projects the eight corners; boxes fully behind the near plane are
/// invisible, boxes crossing it are visible (their screen bbox cannot be
/// bounded). Otherwise the box is occluded iff every depth-buffer sample
/// under its screen bbox is nearer than the box's nearest point.
pub fn test_occludee(
    center: Vec3,
    half: Vec3,
    params: &DepthTestParams,
    depth: &DepthView,
    counters: &CullingCounters,
) -> bool {
    CullingCounters::bump(&counters.depth_tests);

    let half_w = params.viewport.half_width();
    let half_h = params.viewport.half_height();

    let mut rect_min_x = f32::INFINITY;
    let mut rect_min_y = f32::INFINITY;
    let mut rect_max_x = f32::NEG_INFINITY;
    let mut rect_max_y = f32::NEG_INFINITY;
    let mut nearest = 0.0f32;
    let mut behind = 0u32;

    for i in 0..8 {
        let corner = Vec3::new(
            if i & 1 != 0 { center.x + half.x } else { center.x - half.x },
            if i & 2 != 0 { center.y + half.y } else { center.y - half.y },
            if i & 4 != 0 { center.z + half.z } else { center.z - half.z },
        );
        let clip = params.view_proj * corner.extend(1.0);
        if clip.w <= NEAR_W_EPS {
            behind += 1;
            continue;
        }
        let recip = 1.0 / clip.w;
        let sx = clip.x * recip * half_w + half_w;
        let sy = half_h - clip.y * recip * half_h;
        rect_min_x = rect_min_x.min(sx);
        rect_min_y = rect_min_y.min(sy);
        rect_max_x = rect_max_x.max(sx);
        rect_max_y = rect_max_y.max(sy);
        nearest = nearest.max(recip);
    }

    if behind == 8 {
        // Fully behind the near plane.
        CullingCounters::bump(&counters.occludees_occluded);
        return false;
    }
    if behind > 0 {
        // Crosses the near plane; the projected bbox is unbounded, so the
        // depth test cannot prove occlusion.
        return true;
    }

    let screen_w = params.viewport.width as i32;
    let screen_h = params.viewport.height as i32;
    let mut x0 = rect_min_x.floor() as i32;
    let mut y0 = rect_min_y.floor() as i32;
    let mut x1 = rect_max_x.ceil() as i32;
    let mut y1 = rect_max_y.ceil() as i32;

    if x1 < 0 || y1 < 0 || x0 >= screen_w || y0 >= screen_h {
        // Entirely off screen on one side.
        CullingCounters::bump(&counters.occludees_occluded);
        return false;
    }
    x0 = x0.max(0);
    y0 = y0.max(0);
    x1 = x1.min(screen_w - 1);
    y1 = y1.min(screen_h - 1);

    let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f32;
    if area < params.size_threshold {
        CullingCounters::bump(&counters.occludees_too_small);
        return false;
    }

    let buffer_min = depth.min_in_rect(x0, y0, x1, y1);
    if buffer_min >= nearest {
        CullingCounters::bump(&counters.occludees_occluded);
        return false;
    }
    true
}

/// One frustum-cull task (graph node A): cull the packet range assigned to
/// `task_id` and store the 4-bit outside masks.
pub fn frustum_cull_task(
    occludees: &OccludeeSet,
    frustum: &PackedFrustum,
    packet_outside: &[AtomicU8],
    task_id: usize,
    task_count: usize,
) {
    let total = occludees.packet_count();
    let per_task = (total + task_count - 1) / task_count;
    let start = task_id * per_task;
    let end = (start + per_task).min(total);
    for packet in start..end {
        let mask = frustum.cull_packet(&occludees.packets()[packet]);
        packet_outside[packet].store(mask, Ordering::Relaxed);
    }
}

/// One depth-test task (graph node F): decide visibility for the occludee
/// index range assigned to `task_id`. Each task writes a disjoint range of
/// the visibility flags.
#[allow(clippy::too_many_arguments)]
pub fn depth_test_task(
    occludees: &OccludeeSet,
    packet_outside: &[AtomicU8],
    visible: &[AtomicBool],
    params: &DepthTestParams,
    depth: &DepthView,
    counters: &CullingCounters,
    task_id: usize,
    task_count: usize,
) {
    let total = occludees.len();
    let per_task = (total + task_count - 1) / task_count;
    let start = task_id * per_task;
    let end = (start + per_task).min(total);

    for idx in start..end {
        let mask = packet_outside[idx / PACKET_LANES].load(Ordering::Relaxed);
        let lane = idx % PACKET_LANES;

        let is_visible = if mask & (1 << lane) != 0 {
            // Outside the frustum; the depth test is never invoked.
            CullingCounters::bump(&counters.occludees_frustum_culled);
            false
        } else {
            let (center, half) = occludees.get(idx);
            test_occludee(center, half, params, depth, counters)
        };

        if is_visible {
            CullingCounters::bump(&counters.occludees_visible);
        }
        visible[idx].store(is_visible, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::Camera;
    use crate::rendering::depth_buffer::DepthBuffer;
    use glam::Vec3;

    #[test]
    fn packet_layout_round_trips() {
        let mut set = OccludeeSet::new();
        for i in 0..6 {
            let idx = set.push(Vec3::splat(i as f32), Vec3::ONE);
            assert_eq!(idx, i);
        }
        assert_eq!(set.len(), 6);
        assert_eq!(set.packet_count(), 2);
        let (center, half) = set.get(5);
        assert_eq!(center, Vec3::splat(5.0));
        assert_eq!(half, Vec3::ONE);
        // Trailing lanes of the last packet stay zeroed.
        assert_eq!(set.packets()[1].half[0][2], 0.0);
        assert_eq!(set.packets()[1].half[0][3], 0.0);
    }

    #[test]
    fn packet_cull_matches_scalar_frustum_test() {
        let mut camera = Camera::new(Vec3::new(1.0, 2.0, -8.0), 16.0 / 9.0);
        camera.look_at(Vec3::ZERO, Vec3::Y);
        let frustum = camera.extract_frustum();
        let packed = PackedFrustum::new(&frustum);

        // A spread of boxes: in front, behind, far left, straddling a plane.
        let boxes = [
            (Vec3::new(0.0, 0.0, 0.0), Vec3::ONE),
            (Vec3::new(0.0, 0.0, -40.0), Vec3::ONE),
            (Vec3::new(-500.0, 0.0, 0.0), Vec3::splat(2.0)),
            (Vec3::new(8.0, 0.0, 0.0), Vec3::splat(6.0)),
            (Vec3::new(0.0, 300.0, 0.0), Vec3::splat(0.5)),
            (Vec3::new(2.0, -1.0, 3.0), Vec3::splat(3.0)),
            (Vec3::new(0.0, 0.0, 2000.0), Vec3::ONE),
            (Vec3::ZERO, Vec3::ZERO),
        ];

        let mut set = OccludeeSet::new();
        for (center, half) in boxes {
            set.push(center, half);
        }

        for (p, packet) in set.packets().iter().enumerate() {
            let mask = packed.cull_packet(packet);
            for lane in 0..PACKET_LANES {
                let idx = p * PACKET_LANES + lane;
                if idx >= boxes.len() {
                    continue;
                }
                let (center, half) = boxes[idx];
                let scalar_inside = frustum.intersects_aabb(center - half, center + half);
                let packet_outside = mask & (1 << lane) != 0;
                assert_eq!(
                    scalar_inside,
                    !packet_outside,
                    "box {idx} disagrees with the scalar frustum test"
                );
            }
        }
    }

    fn test_params(camera: &Camera, width: usize, height: usize) -> DepthTestParams {
        DepthTestParams {
            view_proj: camera.view_projection_matrix(),
            viewport: Viewport::new(width, height),
            size_threshold: 0.0,
        }
    }

    #[test]
    fn box_over_empty_depth_buffer_is_visible() {
        let mut depth = DepthBuffer::new(64, 64);
        let view = depth.frame_view();
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, -5.0), 1.0);
        camera.look_at(Vec3::ZERO, Vec3::Y);
        let params = test_params(&camera, 64, 64);
        let counters = CullingCounters::new();

        assert!(test_occludee(Vec3::ZERO, Vec3::ONE, &params, &view, &counters));
    }

    #[test]
    fn box_behind_filled_buffer_is_occluded() {
        let mut depth = DepthBuffer::new(64, 64);
        let view = depth.frame_view();
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, -5.0), 1.0);
        camera.look_at(Vec3::ZERO, Vec3::Y);
        let params = test_params(&camera, 64, 64);
        let counters = CullingCounters::new();

        // The box at z = 0 sits 5 units from the camera, reciprocal depth
        // 1/5. Fill the whole buffer as if an occluder sat at distance 2.
        for y in (0..64).step_by(2) {
            for x in (0..64).step_by(2) {
                unsafe { view.store_quad(view.quad_slot(x, y), crate::simd::Vec4f::splat(0.5)) };
            }
        }
        assert!(!test_occludee(
            Vec3::ZERO,
            Vec3::splat(0.5),
            &params,
            &view,
            &counters
        ));
        assert_eq!(counters.snapshot().occludees_occluded, 1);
    }

    #[test]
    fn zero_volume_box_never_divides_by_zero() {
        let mut depth = DepthBuffer::new(64, 64);
        let view = depth.frame_view();
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, -5.0), 1.0);
        camera.look_at(Vec3::ZERO, Vec3::Y);
        let params = test_params(&camera, 64, 64);
        let counters = CullingCounters::new();

        assert!(test_occludee(Vec3::ZERO, Vec3::ZERO, &params, &view, &counters));
    }

    #[test]
    fn size_threshold_culls_small_boxes() {
        let mut depth = DepthBuffer::new(64, 64);
        let view = depth.frame_view();
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, -50.0), 1.0);
        camera.look_at(Vec3::ZERO, Vec3::Y);
        let mut params = test_params(&camera, 64, 64);
        params.size_threshold = 10_000.0;
        let counters = CullingCounters::new();

        // Tiny and distant: the projected bbox area is far below threshold.
        assert!(!test_occludee(
            Vec3::ZERO,
            Vec3::splat(0.1),
            &params,
            &view,
            &counters
        ));
        assert_eq!(counters.snapshot().occludees_too_small, 1);
    }

    #[test]
    fn box_behind_camera_is_invisible() {
        let mut depth = DepthBuffer::new(64, 64);
        let view = depth.frame_view();
        let mut camera = Camera::new(Vec3::new(0.0, 0.0, -5.0), 1.0);
        camera.look_at(Vec3::ZERO, Vec3::Y);
        let params = test_params(&camera, 64, 64);
        let counters = CullingCounters::new();

        assert!(!test_occludee(
            Vec3::new(0.0, 0.0, -20.0),
            Vec3::ONE,
            &params,
            &view,
            &counters
        ));
    }
}
