//! Display geometry plugins.
//!
//! A [`DisplayModel`] owns the vertex/index buffers and model matrix for
//! one projection. The color path stays geometry-agnostic: it binds the
//! frame's textures and uniform, then hands the pass to the model. New
//! projections implement the trait; nothing else changes.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::render::RenderContext;

/// One vertex: clip-space position and texture coordinate.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct DisplayVertex {
    pub position: [f32; 4],
    pub uv: [f32; 2],
}

impl DisplayVertex {
    pub const LAYOUT: wgpu::VertexBufferLayout<'static> = wgpu::VertexBufferLayout {
        array_stride: std::mem::size_of::<DisplayVertex>() as wgpu::BufferAddress,
        step_mode: wgpu::VertexStepMode::Vertex,
        attributes: &wgpu::vertex_attr_array![0 => Float32x4, 1 => Float32x2],
    };
}

/// Geometry and orientation for one way of presenting a frame.
pub trait DisplayModel: Send {
    fn vertex_buffer(&self) -> &wgpu::Buffer;
    fn index_buffer(&self) -> &wgpu::Buffer;
    fn index_count(&self) -> u32;

    /// Model-view-projection matrix, column-major.
    fn model_matrix(&self) -> [[f32; 4]; 4];

    /// Binds the geometry and issues the draw. The uniform with
    /// [`DisplayModel::model_matrix`] is already bound by the caller.
    fn encode(&self, pass: &mut wgpu::RenderPass<'_>) {
        pass.set_vertex_buffer(0, self.vertex_buffer().slice(..));
        pass.set_index_buffer(self.index_buffer().slice(..), wgpu::IndexFormat::Uint32);
        pass.draw_indexed(0..self.index_count(), 0, 0..1);
    }
}

// =============================================================================
// Flat quad
// =============================================================================

/// Full-viewport flat quad, identity transform.
pub struct PlaneModel {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
}

impl PlaneModel {
    pub fn new(ctx: &RenderContext) -> Self {
        let vertices = [
            DisplayVertex { position: [-1.0, -1.0, 0.0, 1.0], uv: [0.0, 1.0] },
            DisplayVertex { position: [-1.0, 1.0, 0.0, 1.0], uv: [0.0, 0.0] },
            DisplayVertex { position: [1.0, -1.0, 0.0, 1.0], uv: [1.0, 1.0] },
            DisplayVertex { position: [1.0, 1.0, 0.0, 1.0], uv: [1.0, 0.0] },
        ];
        // Two triangles covering the strip order 0,1,2,3
        let indices: [u32; 6] = [0, 1, 2, 2, 1, 3];
        let vertex_buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("plane_vertices"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("plane_indices"),
                contents: bytemuck::cast_slice(&indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        }
    }
}

impl DisplayModel for PlaneModel {
    fn vertex_buffer(&self) -> &wgpu::Buffer {
        &self.vertex_buffer
    }

    fn index_buffer(&self) -> &wgpu::Buffer {
        &self.index_buffer
    }

    fn index_count(&self) -> u32 {
        self.index_count
    }

    fn model_matrix(&self) -> [[f32; 4]; 4] {
        IDENTITY
    }
}

// =============================================================================
// Sphere (360-degree projection)
// =============================================================================

const SPHERE_SLICES: u32 = 200;
const SPHERE_PARALLELS: u32 = SPHERE_SLICES / 2;
const SPHERE_RADIUS: f32 = 3.0;
const SPHERE_FOV: f32 = std::f32::consts::FRAC_PI_3;

/// Inside-out UV sphere for 360-degree content, with drag rotation.
pub struct SphereModel {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
    aspect: f32,
    rotation_x: f32,
    rotation_y: f32,
}

impl SphereModel {
    pub fn new(ctx: &RenderContext, aspect: f32) -> Self {
        let mut vertices = Vec::new();
        let mut indices: Vec<u32> = Vec::new();
        for p in 0..=SPHERE_PARALLELS {
            let theta = std::f32::consts::PI * p as f32 / SPHERE_PARALLELS as f32;
            for s in 0..=SPHERE_SLICES {
                let phi = std::f32::consts::TAU * s as f32 / SPHERE_SLICES as f32;
                vertices.push(DisplayVertex {
                    position: [
                        SPHERE_RADIUS * theta.sin() * phi.cos(),
                        SPHERE_RADIUS * theta.cos(),
                        SPHERE_RADIUS * theta.sin() * phi.sin(),
                        1.0,
                    ],
                    uv: [
                        s as f32 / SPHERE_SLICES as f32,
                        p as f32 / SPHERE_PARALLELS as f32,
                    ],
                });
            }
        }
        let row = SPHERE_SLICES + 1;
        for p in 0..SPHERE_PARALLELS {
            for s in 0..SPHERE_SLICES {
                let a = p * row + s;
                let b = (p + 1) * row + s;
                indices.extend_from_slice(&[a, b, a + 1, a + 1, b, b + 1]);
            }
        }
        let vertex_buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("sphere_vertices"),
                contents: bytemuck::cast_slice(&vertices),
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = ctx
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("sphere_indices"),
                contents: bytemuck::cast_slice(&indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
            aspect,
            rotation_x: 0.0,
            rotation_y: 0.0,
        }
    }

    /// Accumulates a drag or head rotation, in radians.
    ///
    /// Pitch clamps just short of the poles so the view cannot flip.
    pub fn rotate(&mut self, delta_x: f32, delta_y: f32) {
        self.rotation_y += delta_x;
        self.rotation_x = (self.rotation_x + delta_y)
            .clamp(-std::f32::consts::FRAC_PI_2 + 0.01, std::f32::consts::FRAC_PI_2 - 0.01);
    }

    /// Resets the view to the forward orientation.
    pub fn reset(&mut self) {
        self.rotation_x = 0.0;
        self.rotation_y = 0.0;
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }
}

impl DisplayModel for SphereModel {
    fn vertex_buffer(&self) -> &wgpu::Buffer {
        &self.vertex_buffer
    }

    fn index_buffer(&self) -> &wgpu::Buffer {
        &self.index_buffer
    }

    fn index_count(&self) -> u32 {
        self.index_count
    }

    fn model_matrix(&self) -> [[f32; 4]; 4] {
        let projection = perspective(SPHERE_FOV, self.aspect, 0.1, 400.0);
        mat4_mul(
            projection,
            mat4_mul(rotation_x(self.rotation_x), rotation_y(self.rotation_y)),
        )
    }
}

// =============================================================================
// Matrix helpers (column-major)
// =============================================================================

pub const IDENTITY: [[f32; 4]; 4] = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> [[f32; 4]; 4] {
    let f = 1.0 / (fov_y / 2.0).tan();
    let range = near - far;
    [
        [f / aspect, 0.0, 0.0, 0.0],
        [0.0, f, 0.0, 0.0],
        [0.0, 0.0, (near + far) / range, -1.0],
        [0.0, 0.0, 2.0 * near * far / range, 0.0],
    ]
}

fn rotation_x(angle: f32) -> [[f32; 4]; 4] {
    let (s, c) = angle.sin_cos();
    [
        [1.0, 0.0, 0.0, 0.0],
        [0.0, c, s, 0.0],
        [0.0, -s, c, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

fn rotation_y(angle: f32) -> [[f32; 4]; 4] {
    let (s, c) = angle.sin_cos();
    [
        [c, 0.0, -s, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [s, 0.0, c, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]
}

fn mat4_mul(a: [[f32; 4]; 4], b: [[f32; 4]; 4]) -> [[f32; 4]; 4] {
    let mut out = [[0.0f32; 4]; 4];
    for (col, out_col) in out.iter_mut().enumerate() {
        for (row, value) in out_col.iter_mut().enumerate() {
            *value = (0..4).map(|k| a[k][row] * b[col][k]).sum();
        }
    }
    out
}
