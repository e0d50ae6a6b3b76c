//! Occluder geometry and the per-frame vertex transform.
//!
//! Occluder vertex buffers are immutable after load; only the world
//! transform animates. Every frame the pipeline transforms all occluder
//! vertices into screen space (pixel x/y plus reciprocal depth) and stores
//! them in a flat scratch buffer shared by the binning and rasterization
//! stages. Work is partitioned by global vertex index so a handful of huge
//! occluders cannot starve the other transform tasks.

use std::sync::atomic::{AtomicBool, Ordering};

use glam::{Mat4, Vec3, Vec4};

use crate::simd::Vec4f;

/// Vertices with w at or below this are treated as behind the near plane.
pub(crate) const NEAR_W_EPS: f32 = 0.001;

/// Clip-state bits recorded per transformed vertex. A triangle is dropped
/// at binning when all three vertices share a bit, or when any vertex
/// carries the near bit.
pub mod clip_flags {
    pub const NEAR: u8 = 1 << 0;
    pub const LEFT: u8 = 1 << 1;
    pub const RIGHT: u8 = 1 << 2;
    pub const ABOVE: u8 = 1 << 3;
    pub const BELOW: u8 = 1 << 4;
}

/// Screen mapping shared by the occluder transform and the occludee tests.
#[derive(Copy, Clone, Debug)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width: width as f32,
            height: height as f32,
        }
    }

    #[inline]
    pub fn half_width(&self) -> f32 {
        self.width * 0.5
    }

    #[inline]
    pub fn half_height(&self) -> f32 {
        self.height * 0.5
    }
}

/// One triangle-list mesh of an occluder model.
pub struct OccluderMesh {
    indices: Vec<u32>,
}

impl OccluderMesh {
    pub fn new(indices: Vec<u32>) -> Self {
        debug_assert!(indices.len() % 3 == 0, "index buffer must hold whole triangles");
        Self { indices }
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Vertex indices of triangle `tri`.
    #[inline]
    pub fn triangle(&self, tri: usize) -> [u32; 3] {
        let base = tri * 3;
        [
            self.indices[base],
            self.indices[base + 1],
            self.indices[base + 2],
        ]
    }
}

/// Static occluder asset: positions, meshes, and object-space bounds.
pub struct OccluderModel {
    positions: Vec<Vec3>,
    meshes: Vec<OccluderMesh>,
    world: Mat4,
    bounds_center: Vec3,
    bounds_half: Vec3,
    num_triangles: usize,
}

impl OccluderModel {
    pub fn new(positions: Vec<Vec3>, meshes: Vec<OccluderMesh>) -> Self {
        let (bounds_center, bounds_half) = object_bounds(&positions);
        let num_triangles = meshes.iter().map(OccluderMesh::triangle_count).sum();
        Self {
            positions,
            meshes,
            world: Mat4::IDENTITY,
            bounds_center,
            bounds_half,
            num_triangles,
        }
    }

    pub fn set_world_transform(&mut self, world: Mat4) {
        self.world = world;
    }

    #[inline]
    pub fn world_transform(&self) -> Mat4 {
        self.world
    }

    #[inline]
    pub fn positions(&self) -> &[Vec3] {
        &self.positions
    }

    #[inline]
    pub fn meshes(&self) -> &[OccluderMesh] {
        &self.meshes
    }

    #[inline]
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn triangle_count(&self) -> usize {
        self.num_triangles
    }

    /// World-space AABB of the model under its current transform.
    pub fn world_bounds(&self) -> (Vec3, Vec3) {
        let center = self.world.transform_point3(self.bounds_center);
        let h = self.bounds_half;
        let m = &self.world;
        // Half extents through the absolute value of the rotation/scale part.
        let half = Vec3::new(
            m.x_axis.x.abs() * h.x + m.y_axis.x.abs() * h.y + m.z_axis.x.abs() * h.z,
            m.x_axis.y.abs() * h.x + m.y_axis.y.abs() * h.y + m.z_axis.y.abs() * h.z,
            m.x_axis.z.abs() * h.x + m.y_axis.z.abs() * h.y + m.z_axis.z.abs() * h.z,
        );
        (center - half, center + half)
    }
}

fn object_bounds(positions: &[Vec3]) -> (Vec3, Vec3) {
    if positions.is_empty() {
        return (Vec3::ZERO, Vec3::ZERO);
    }
    let mut min = positions[0];
    let mut max = positions[0];
    for p in positions.iter().skip(1) {
        min = min.min(*p);
        max = max.max(*p);
    }
    ((min + max) * 0.5, (max - min) * 0.5)
}

/// Flattened occluder list with global vertex and triangle offsets. The
/// scene layer produces this once; the pipeline treats it as read-only
/// except for the world transforms.
pub struct OccluderScene {
    models: Vec<OccluderModel>,
    vertex_base: Vec<usize>,
    total_vertices: usize,
    total_triangles: usize,
}

impl OccluderScene {
    pub fn new(models: Vec<OccluderModel>) -> Self {
        assert!(
            models.len() <= u16::MAX as usize,
            "bin descriptors index models with 16 bits"
        );
        let mut vertex_base = Vec::with_capacity(models.len());
        let mut total_vertices = 0usize;
        let mut total_triangles = 0usize;
        for model in &models {
            vertex_base.push(total_vertices);
            total_vertices += model.vertex_count();
            total_triangles += model.triangle_count();
        }
        Self {
            models,
            vertex_base,
            total_vertices,
            total_triangles,
        }
    }

    #[inline]
    pub fn models(&self) -> &[OccluderModel] {
        &self.models
    }

    #[inline]
    pub fn models_mut(&mut self) -> &mut [OccluderModel] {
        &mut self.models
    }

    /// Offset of `model`'s first vertex in the transform scratch buffer.
    #[inline]
    pub fn vertex_base(&self, model: usize) -> usize {
        self.vertex_base[model]
    }

    #[inline]
    pub fn total_vertices(&self) -> usize {
        self.total_vertices
    }

    #[inline]
    pub fn total_triangles(&self) -> usize {
        self.total_triangles
    }
}

/// Frame-scoped transformed-vertex storage, reused every frame.
/// Per vertex: (screen x, screen y, reciprocal depth, clip w) plus the
/// clip-state flags.
pub struct TransformScratch {
    screen: Vec<Vec4>,
    flags: Vec<u8>,
}

impl TransformScratch {
    pub fn new() -> Self {
        Self {
            screen: Vec::new(),
            flags: Vec::new(),
        }
    }

    /// Size the buffers for the scene without shrinking allocations.
    pub fn prepare(&mut self, total_vertices: usize) {
        self.screen.resize(total_vertices, Vec4::ZERO);
        self.flags.resize(total_vertices, 0);
    }

    pub fn view(&mut self) -> ScratchView {
        ScratchView {
            screen: self.screen.as_mut_ptr(),
            flags: self.flags.as_mut_ptr(),
            len: self.screen.len(),
        }
    }
}

impl Default for TransformScratch {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-frame view into the transform scratch.
///
/// Transform tasks write disjoint global vertex ranges; the binner and the
/// rasterizer read only after the transform task set completed, so accesses
/// never alias. The view must not outlive the scratch it came from.
#[derive(Copy, Clone)]
pub struct ScratchView {
    screen: *mut Vec4,
    flags: *mut u8,
    len: usize,
}

unsafe impl Send for ScratchView {}
unsafe impl Sync for ScratchView {}

impl ScratchView {
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// `idx < len`, and no other task writes the same index this frame.
    #[inline]
    pub unsafe fn write(&self, idx: usize, screen: Vec4, flags: u8) {
        debug_assert!(idx < self.len);
        *self.screen.add(idx) = screen;
        *self.flags.add(idx) = flags;
    }

    /// # Safety
    /// `idx < len`, and all writes completed before this frame stage.
    #[inline]
    pub unsafe fn screen_at(&self, idx: usize) -> Vec4 {
        debug_assert!(idx < self.len);
        *self.screen.add(idx)
    }

    /// # Safety
    /// `idx < len`, and all writes completed before this frame stage.
    #[inline]
    pub unsafe fn flags_at(&self, idx: usize) -> u8 {
        debug_assert!(idx < self.len);
        *self.flags.add(idx)
    }
}

/// One transform task: transform the global vertex range assigned to
/// `task_id` across all in-frustum models.
pub fn transform_task(
    scene: &OccluderScene,
    model_clip: &[Mat4],
    model_in_frustum: &[AtomicBool],
    scratch: &ScratchView,
    viewport: Viewport,
    task_id: usize,
    task_count: usize,
) {
    let total = scene.total_vertices();
    let per_task = (total + task_count - 1) / task_count;
    let start = task_id * per_task;
    let end = (start + per_task).min(total);
    if start >= end {
        return;
    }

    for (m, model) in scene.models().iter().enumerate() {
        let base = scene.vertex_base(m);
        let count = model.vertex_count();
        let model_start = start.max(base);
        let model_end = end.min(base + count);
        if model_start >= model_end {
            continue;
        }
        // Culled models keep stale scratch; the binner skips them too, so
        // those entries are never read.
        if !model_in_frustum[m].load(Ordering::Relaxed) {
            continue;
        }
        transform_model_range(
            model,
            &model_clip[m],
            viewport,
            scratch,
            base,
            model_start - base,
            model_end - base,
        );
    }
}

/// Transform vertices `local_start..local_end` of one model into screen
/// space. Four vertices go through the lane math together; the group tail
/// is padded with a repeated vertex and padded lanes are never stored, so
/// results do not depend on where task boundaries fall.
fn transform_model_range(
    model: &OccluderModel,
    model_clip: &Mat4,
    viewport: Viewport,
    scratch: &ScratchView,
    global_base: usize,
    local_start: usize,
    local_end: usize,
) {
    let m = model_clip;

    let m00 = Vec4f::splat(m.x_axis.x);
    let m01 = Vec4f::splat(m.y_axis.x);
    let m02 = Vec4f::splat(m.z_axis.x);
    let m03 = Vec4f::splat(m.w_axis.x);

    let m10 = Vec4f::splat(m.x_axis.y);
    let m11 = Vec4f::splat(m.y_axis.y);
    let m12 = Vec4f::splat(m.z_axis.y);
    let m13 = Vec4f::splat(m.w_axis.y);

    let m30 = Vec4f::splat(m.x_axis.w);
    let m31 = Vec4f::splat(m.y_axis.w);
    let m32 = Vec4f::splat(m.z_axis.w);
    let m33 = Vec4f::splat(m.w_axis.w);

    let half_w = Vec4f::splat(viewport.half_width());
    let half_h = Vec4f::splat(viewport.half_height());

    // Guard band: one extra viewport on every side. Vertices beyond it get
    // clip flags; triangles fully outside one side drop at binning.
    let guard_left = Vec4f::splat(-viewport.width);
    let guard_right = Vec4f::splat(2.0 * viewport.width);
    let guard_above = Vec4f::splat(-viewport.height);
    let guard_below = Vec4f::splat(2.0 * viewport.height);

    let near_eps = Vec4f::splat(NEAR_W_EPS);
    let one = Vec4f::splat(1.0);
    let zero = Vec4f::zero();

    let positions = model.positions();
    let mut i = local_start;
    while i < local_end {
        let lanes = (local_end - i).min(4);

        let mut xs = [0.0f32; 4];
        let mut ys = [0.0f32; 4];
        let mut zs = [0.0f32; 4];
        for lane in 0..4 {
            let p = positions[i + lane.min(lanes - 1)];
            xs[lane] = p.x;
            ys[lane] = p.y;
            zs[lane] = p.z;
        }
        let px = Vec4f::from_array(xs);
        let py = Vec4f::from_array(ys);
        let pz = Vec4f::from_array(zs);

        let cx = px * m00 + py * m01 + pz * m02 + m03;
        let cy = px * m10 + py * m11 + pz * m12 + m13;
        let cw = px * m30 + py * m31 + pz * m32 + m33;

        // Lanes behind the near plane get a zeroed reciprocal so the screen
        // mapping stays finite; the near flag keeps them out of the bins.
        let near = cw.cmp_le(near_eps);
        let recip = Vec4f::select(one / cw, zero, near);

        let sx = cx * recip * half_w + half_w;
        let sy = half_h - cy * recip * half_h;

        let near_bits = near.movemask();
        let left_bits = sx.cmp_lt(guard_left).movemask();
        let right_bits = sx.cmp_gt(guard_right).movemask();
        let above_bits = sy.cmp_lt(guard_above).movemask();
        let below_bits = sy.cmp_gt(guard_below).movemask();

        let sx_arr = sx.to_array();
        let sy_arr = sy.to_array();
        let recip_arr = recip.to_array();
        let cw_arr = cw.to_array();

        for lane in 0..lanes {
            let bit = 1 << lane;
            let mut flags = 0u8;
            if near_bits & bit != 0 {
                flags |= clip_flags::NEAR;
            }
            if left_bits & bit != 0 {
                flags |= clip_flags::LEFT;
            }
            if right_bits & bit != 0 {
                flags |= clip_flags::RIGHT;
            }
            if above_bits & bit != 0 {
                flags |= clip_flags::ABOVE;
            }
            if below_bits & bit != 0 {
                flags |= clip_flags::BELOW;
            }
            let screen = Vec4::new(sx_arr[lane], sy_arr[lane], recip_arr[lane], cw_arr[lane]);
            unsafe { scratch.write(global_base + i + lane, screen, flags) };
        }

        i += lanes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn unit_quad_model() -> OccluderModel {
        let positions = vec![
            Vec3::new(-1.0, -1.0, 0.0),
            Vec3::new(1.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 0.0),
            Vec3::new(-1.0, 1.0, 0.0),
        ];
        let mesh = OccluderMesh::new(vec![0, 1, 2, 0, 2, 3]);
        OccluderModel::new(positions, vec![mesh])
    }

    #[test]
    fn scene_offsets_accumulate() {
        let scene = OccluderScene::new(vec![unit_quad_model(), unit_quad_model()]);
        assert_eq!(scene.total_vertices(), 8);
        assert_eq!(scene.total_triangles(), 4);
        assert_eq!(scene.vertex_base(0), 0);
        assert_eq!(scene.vertex_base(1), 4);
    }

    #[test]
    fn world_bounds_follow_transform() {
        let mut model = unit_quad_model();
        model.set_world_transform(Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)));
        let (min, max) = model.world_bounds();
        assert_eq!(min, Vec3::new(9.0, -1.0, 0.0));
        assert_eq!(max, Vec3::new(11.0, 1.0, 0.0));
    }

    #[test]
    fn transform_projects_to_viewport_center() {
        let scene = OccluderScene::new(vec![unit_quad_model()]);
        let mut scratch = TransformScratch::new();
        scratch.prepare(scene.total_vertices());
        let view = scratch.view();

        // Camera at z = -5 looking towards +Z; the quad spans the view.
        let view_mat = Mat4::look_at_rh(Vec3::new(0.0, 0.0, -5.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(90f32.to_radians(), 1.0, 0.1, 100.0);
        let model_clip = [proj * view_mat];
        let in_frustum = [AtomicBool::new(true)];

        transform_task(
            &scene,
            &model_clip,
            &in_frustum,
            &view,
            Viewport::new(200, 200),
            0,
            1,
        );

        for idx in 0..4 {
            let v = unsafe { view.screen_at(idx) };
            let flags = unsafe { view.flags_at(idx) };
            assert_eq!(flags, 0, "vertex {idx} should be fully inside");
            assert!(v.x > 0.0 && v.x < 200.0, "screen x in range, got {}", v.x);
            assert!(v.y > 0.0 && v.y < 200.0, "screen y in range, got {}", v.y);
            assert!(v.z > 0.0, "reciprocal depth must be positive");
            assert!(v.w > 0.0, "w must be positive in front of the camera");
        }
        // The quad is symmetric around the view axis, so its projected
        // center is the viewport center.
        let center_x = (0..4).map(|i| unsafe { view.screen_at(i) }.x).sum::<f32>() / 4.0;
        let center_y = (0..4).map(|i| unsafe { view.screen_at(i) }.y).sum::<f32>() / 4.0;
        assert!((center_x - 100.0).abs() < 0.01);
        assert!((center_y - 100.0).abs() < 0.01);
    }

    #[test]
    fn vertex_behind_camera_gets_near_flag() {
        let positions = vec![Vec3::new(0.0, 0.0, -10.0)];
        let model = OccluderModel::new(positions, vec![OccluderMesh::new(vec![])]);
        let scene = OccluderScene::new(vec![model]);
        let mut scratch = TransformScratch::new();
        scratch.prepare(1);
        let view = scratch.view();

        // Camera at origin looking towards -Z puts z = -10 in front; look
        // towards +Z instead so the vertex is behind.
        let view_mat = Mat4::look_at_rh(Vec3::ZERO, Vec3::Z, Vec3::Y);
        let proj = Mat4::perspective_rh(70f32.to_radians(), 1.0, 0.1, 100.0);
        let model_clip = [proj * view_mat];
        let in_frustum = [AtomicBool::new(true)];

        transform_task(
            &scene,
            &model_clip,
            &in_frustum,
            &view,
            Viewport::new(320, 180),
            0,
            1,
        );

        let flags = unsafe { view.flags_at(0) };
        assert!(flags & clip_flags::NEAR != 0, "behind vertex must carry the near flag");
        let v = unsafe { view.screen_at(0) };
        assert!(v.x.is_finite() && v.y.is_finite() && v.z.is_finite());
    }

    #[test]
    fn partitioned_transform_matches_single_task() {
        let scene = OccluderScene::new(vec![unit_quad_model(), unit_quad_model()]);
        let view_mat = Mat4::look_at_rh(Vec3::new(0.3, 0.2, -6.0), Vec3::ZERO, Vec3::Y);
        let proj = Mat4::perspective_rh(70f32.to_radians(), 16.0 / 9.0, 0.1, 100.0);
        let vp = proj * view_mat;
        let model_clip = [vp, vp];
        let in_frustum = [AtomicBool::new(true), AtomicBool::new(true)];
        let viewport = Viewport::new(640, 360);

        let mut single = TransformScratch::new();
        single.prepare(scene.total_vertices());
        let single_view = single.view();
        transform_task(&scene, &model_clip, &in_frustum, &single_view, viewport, 0, 1);

        let mut split = TransformScratch::new();
        split.prepare(scene.total_vertices());
        let split_view = split.view();
        for task_id in 0..3 {
            transform_task(&scene, &model_clip, &in_frustum, &split_view, viewport, task_id, 3);
        }

        for idx in 0..scene.total_vertices() {
            let a = unsafe { single_view.screen_at(idx) };
            let b = unsafe { split_view.screen_at(idx) };
            assert_eq!(a, b, "vertex {idx} must not depend on the task split");
        }
    }
}
