// Mesh rendering
//
// A mesh binds a material's reflected shader resources against scene
// state: the vertex descriptor is derived from the reflected vertex
// inputs, uniform buffers are allocated under a packing policy,
// update_shading_properties() writes semantic-derived matrices and
// material property bytes into the mapped buffers each frame, and
// encode_render_command() records the draw.

use std::collections::HashMap;
use std::sync::Arc;

use cgmath::{Matrix4, SquareMatrix};

use utils::log;

use crate::device::buffer::Buffer;
use crate::device::descriptor::{BufferBindingInfo, ShaderBinding, ShaderBindingSetLayout};
use crate::device::encoder::render::RenderCommandEncoder;
use crate::device::pipeline::{
    RenderPipelineColorAttachmentDescriptor, RenderPipelineDescriptor, RenderPipelineState,
    VertexAttributeDescriptor, VertexBufferLayoutDescriptor, VertexDescriptor,
};
use crate::device::shader::{
    PipelineReflection, ShaderBindingLocation, ShaderDataType, ShaderDescriptorType,
    ShaderPushConstantLayout, ShaderResource, ShaderResourceStructMember, ShaderResourceType,
    ShaderStage,
};
use crate::device::types::{IndexType, PrimitiveType, VertexFormat, VertexStepRate};
use crate::device::{CpuCacheMode, GraphicsDevice, StorageMode};
use crate::geometry::Aabb;
use crate::material::{
    Material, MaterialSemantic, SemanticBinding, ShaderUniformSemantic, VertexAttributeSemantic,
};
use crate::scene::SceneState;
use crate::{GraupelError, Result};

/// An attribute inside one vertex buffer.
#[derive(Clone, Debug)]
pub struct VertexAttribute {
    pub semantic: VertexAttributeSemantic,
    pub format: VertexFormat,
    pub offset: u32,
    /// Optional, matched against reflected input names for
    /// user-defined semantics.
    pub name: String,
}

#[derive(Clone)]
pub struct MeshVertexBuffer {
    pub byte_offset: u32,
    pub byte_stride: u32,
    pub vertex_count: u32,
    pub buffer: Arc<Buffer>,
    pub attributes: Vec<VertexAttribute>,
}

/// How init_resources allocates the reflected uniform buffers.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferUsagePolicy {
    /// The caller supplies every buffer.
    UseExternalBufferManually,
    SingleBuffer,
    SingleBufferPerSet,
    SingleBufferPerResource,
}

struct ResourceBinding {
    resource: ShaderResource,
    binding: ShaderBinding,
}

struct ResourceBindingSet {
    index: u32,
    binding_set: Arc<crate::device::descriptor::ShaderBindingSet>,
    resources: Vec<ResourceBinding>,
}

struct PushConstantData {
    layout: ShaderPushConstantLayout,
    data: Vec<u8>,
}

struct BufferResource {
    #[allow(dead_code)]
    name: String,
    buffers: Vec<BufferBindingInfo>,
}

pub struct Mesh {
    pub material: Option<Arc<Material>>,
    pub aabb: Aabb,

    pub vertex_buffers: Vec<MeshVertexBuffer>,

    pub index_buffer: Option<Arc<Buffer>>,
    pub index_buffer_byte_offset: u32,
    pub index_buffer_base_vertex_index: i32,
    pub vertex_start: u32,
    pub index_count: u32,
    pub index_type: IndexType,

    pub primitive_type: PrimitiveType,

    pipeline_state: Option<Arc<RenderPipelineState>>,
    pipeline_reflection: Option<PipelineReflection>,
    resource_bindings: Vec<ResourceBindingSet>,
    push_constants: Vec<PushConstantData>,
    buffer_resources: HashMap<ShaderBindingLocation, BufferResource>,
}

impl Mesh {
    pub fn new() -> Mesh {
        Mesh {
            material: None,
            aabb: Aabb::null(),
            vertex_buffers: Vec::new(),
            index_buffer: None,
            index_buffer_byte_offset: 0,
            index_buffer_base_vertex_index: 0,
            vertex_start: 0,
            index_count: 0,
            index_type: IndexType::UInt32,
            primitive_type: PrimitiveType::Triangle,
            pipeline_state: None,
            pipeline_reflection: None,
            resource_bindings: Vec::new(),
            push_constants: Vec::new(),
            buffer_resources: HashMap::new(),
        }
    }

    pub fn pipeline_reflection(&self) -> Option<&PipelineReflection> {
        self.pipeline_reflection.as_ref()
    }

    /// Derive the vertex layout from the reflected vertex-stage inputs.
    /// User-defined inputs with a name match attributes by name first;
    /// everything else matches by semantic.
    pub fn vertex_descriptor(&self) -> VertexDescriptor {
        let material = match self.material.as_ref() {
            Some(m) => m,
            None => return VertexDescriptor::default(),
        };
        let vertex_function = match material.shader.function(ShaderStage::Vertex) {
            Some(f) => f,
            None => return VertexDescriptor::default(),
        };

        let find_by_semantic = |semantic: VertexAttributeSemantic| {
            for (index, vb) in self.vertex_buffers.iter().enumerate() {
                for attr in vb.attributes.iter() {
                    if attr.semantic == semantic {
                        return Some((index as u32, attr.clone()));
                    }
                }
            }
            None
        };
        let find_by_name = |name: &str| {
            for (index, vb) in self.vertex_buffers.iter().enumerate() {
                for attr in vb.attributes.iter() {
                    if attr.name == name {
                        return Some((index as u32, attr.clone()));
                    }
                }
            }
            None
        };

        let mut attributes = Vec::new();
        for input in vertex_function.stage_input_attributes() {
            if !input.enabled {
                continue;
            }
            let semantic = material
                .shader
                .input_attribute_semantics
                .get(&input.location)
                .copied()
                .unwrap_or(VertexAttributeSemantic::UserDefined);

            let mut found = None;
            if semantic == VertexAttributeSemantic::UserDefined && !input.name.is_empty() {
                found = find_by_name(&input.name);
            }
            if found.is_none() {
                found = find_by_semantic(semantic);
            }

            match found {
                Some((buffer_index, attr)) => attributes.push(VertexAttributeDescriptor {
                    format: attr.format,
                    offset: attr.offset,
                    buffer_index,
                    location: input.location,
                }),
                None => log::error!(
                    "Cannot bind vertex buffer at location: {} (name:{})",
                    input.location,
                    input.name
                ),
            }
        }

        let layouts = self
            .vertex_buffers
            .iter()
            .enumerate()
            .map(|(index, vb)| VertexBufferLayoutDescriptor {
                step: VertexStepRate::Vertex,
                stride: vb.byte_stride,
                buffer_index: index as u32,
            })
            .collect();

        VertexDescriptor {
            attributes,
            layouts,
        }
    }

    /// Build the PSO and reconstruct the binding table from the merged
    /// reflection and the material's shader map.
    pub fn build_pipeline_state(&mut self, device: &Arc<GraphicsDevice>) -> Result<()> {
        let material = match self.material.as_ref() {
            Some(m) => m.clone(),
            None => {
                log::error!("Mesh has no material.");
                return Err(GraupelError::INVALID);
            }
        };

        let vertex_function = match material.shader.function(ShaderStage::Vertex) {
            Some(f) => f.clone(),
            None => {
                log::error!("Material has no vertex function.");
                return Err(GraupelError::INVALID);
            }
        };
        let fragment_function = material.shader.function(ShaderStage::Fragment).cloned();

        let vertex_descriptor = self.vertex_descriptor();
        if vertex_descriptor.attributes.is_empty() || vertex_descriptor.layouts.is_empty() {
            log::error!("Invalid vertex descriptor!");
            return Err(GraupelError::INVALID);
        }

        let pipeline_descriptor = RenderPipelineDescriptor {
            vertex_function: Some(vertex_function),
            fragment_function,
            vertex_descriptor,
            color_attachments: material
                .attachments
                .iter()
                .enumerate()
                .map(|(index, att)| RenderPipelineColorAttachmentDescriptor {
                    index: index as u32,
                    pixel_format: att.format,
                    blend_state: att.blend_state,
                })
                .collect(),
            depth_stencil_attachment_pixel_format: material.depth_format,
            primitive_topology: self.primitive_type,
            triangle_fill_mode: material.triangle_fill_mode,
            rasterization_enabled: true,
        };

        let mut reflection = PipelineReflection::default();
        let pso = device.make_render_pipeline_state(&pipeline_descriptor, Some(&mut reflection))?;

        // rebuild the binding table from the reflection
        let mut resource_bindings: Vec<ResourceBindingSet> = Vec::new();
        let mut grouped: Vec<(u32, Vec<ResourceBinding>)> = Vec::new();
        for res in reflection.resources.iter() {
            let location = ShaderBindingLocation::new(res.set, res.binding, 0);
            let descriptor = match material.shader.descriptor(location, res.stages) {
                Some(d) => d,
                None => {
                    log::error!("Cannot find shader resource descriptor (name:{})", res.name);
                    return Err(GraupelError::INVALID);
                }
            };
            let expected = match descriptor.descriptor_type {
                ShaderDescriptorType::UniformBuffer
                | ShaderDescriptorType::StorageBuffer
                | ShaderDescriptorType::UniformTexelBuffer
                | ShaderDescriptorType::StorageTexelBuffer => ShaderResourceType::Buffer,
                ShaderDescriptorType::Texture | ShaderDescriptorType::StorageTexture => {
                    ShaderResourceType::Texture
                }
                ShaderDescriptorType::TextureSampler => ShaderResourceType::TextureSampler,
                ShaderDescriptorType::Sampler => ShaderResourceType::Sampler,
                ShaderDescriptorType::InputAttachment => ShaderResourceType::Texture,
            };
            if expected != res.resource_type {
                log::error!(
                    "Unable to match shader resource (set:{}, binding:{}, name:\"{}\")",
                    res.set,
                    res.binding,
                    res.name
                );
                return Err(GraupelError::INVALID);
            }

            let binding = ResourceBinding {
                resource: res.clone(),
                binding: ShaderBinding {
                    binding: res.binding,
                    descriptor_type: descriptor.descriptor_type,
                    array_length: descriptor.count,
                },
            };
            match grouped.iter_mut().find(|(set, _)| *set == res.set) {
                Some((_, list)) => list.push(binding),
                None => grouped.push((res.set, vec![binding])),
            }
        }
        grouped.sort_by_key(|(set, _)| *set);

        for (set, mut resources) in grouped {
            resources.sort_by_key(|r| r.binding.binding);
            let layout = ShaderBindingSetLayout {
                bindings: resources.iter().map(|r| r.binding).collect(),
            };
            let binding_set = device.make_shader_binding_set(&layout)?;
            resource_bindings.push(ResourceBindingSet {
                index: set,
                binding_set,
                resources,
            });
        }

        let push_constants = reflection
            .push_constant_layouts
            .iter()
            .map(|layout| PushConstantData {
                layout: layout.clone(),
                data: Vec::new(),
            })
            .collect();

        self.pipeline_state = Some(pso);
        self.pipeline_reflection = Some(reflection);
        self.resource_bindings = resource_bindings;
        self.push_constants = push_constants;
        Ok(())
    }

    /// Allocate backing buffers for every reflected buffer resource
    /// under the given policy. Per resource the backing store holds
    /// `count` elements of `stride` bytes plus one final element of the
    /// declared struct size, aligned to 16.
    pub fn init_resources(
        &mut self,
        device: &Arc<GraphicsDevice>,
        policy: BufferUsagePolicy,
    ) -> Result<()> {
        if self.material.is_none() {
            return Err(GraupelError::INVALID);
        }
        if self.pipeline_state.is_none() {
            self.build_pipeline_state(device)?;
        }

        let align16 = |v: usize| (v + 15) & !15usize;

        struct PendingResource {
            location: ShaderBindingLocation,
            name: String,
            infos: Vec<(u64, u64)>, // (offset, length)
        }

        let collect = |rb: &ResourceBinding, base_offset: &mut usize| -> (PendingResource, usize) {
            let res = &rb.resource;
            let mut infos = Vec::with_capacity(res.count as usize);
            for _ in 0..res.count {
                infos.push((*base_offset as u64, res.buffer.size as u64));
                *base_offset += res.stride as usize;
            }
            let length = align16(*base_offset + res.buffer.size as usize);
            *base_offset = align16(*base_offset);
            (
                PendingResource {
                    location: ShaderBindingLocation::new(res.set, res.binding, 0),
                    name: res.name.clone(),
                    infos,
                },
                length,
            )
        };

        let mut num_buffers_generated = 0usize;
        let mut total_bytes_allocated = 0usize;

        match policy {
            BufferUsagePolicy::SingleBuffer => {
                let mut pending = Vec::new();
                let mut offset = 0usize;
                let mut length = 0usize;
                for bset in self.resource_bindings.iter() {
                    for rb in bset.resources.iter() {
                        if rb.resource.resource_type == ShaderResourceType::Buffer {
                            let (p, l) = collect(rb, &mut offset);
                            length = l;
                            pending.push(p);
                        }
                    }
                }
                if length > 0 {
                    let buffer = device.make_buffer(
                        length,
                        StorageMode::Shared,
                        CpuCacheMode::WriteCombined,
                    )?;
                    num_buffers_generated += 1;
                    total_bytes_allocated += length;
                    for p in pending {
                        self.buffer_resources.insert(
                            p.location,
                            BufferResource {
                                name: p.name,
                                buffers: p
                                    .infos
                                    .iter()
                                    .map(|&(offset, length)| BufferBindingInfo {
                                        buffer: buffer.clone(),
                                        offset,
                                        length,
                                    })
                                    .collect(),
                            },
                        );
                    }
                }
            }
            BufferUsagePolicy::SingleBufferPerSet => {
                for bset in self.resource_bindings.iter() {
                    let mut pending = Vec::new();
                    let mut offset = 0usize;
                    let mut length = 0usize;
                    for rb in bset.resources.iter() {
                        if rb.resource.resource_type == ShaderResourceType::Buffer {
                            let (p, l) = collect(rb, &mut offset);
                            length = l;
                            pending.push(p);
                        }
                    }
                    if length > 0 {
                        let buffer = device.make_buffer(
                            length,
                            StorageMode::Shared,
                            CpuCacheMode::WriteCombined,
                        )?;
                        num_buffers_generated += 1;
                        total_bytes_allocated += length;
                        for p in pending {
                            self.buffer_resources.insert(
                                p.location,
                                BufferResource {
                                    name: p.name,
                                    buffers: p
                                        .infos
                                        .iter()
                                        .map(|&(offset, length)| BufferBindingInfo {
                                            buffer: buffer.clone(),
                                            offset,
                                            length,
                                        })
                                        .collect(),
                                },
                            );
                        }
                    }
                }
            }
            BufferUsagePolicy::SingleBufferPerResource => {
                for bset in self.resource_bindings.iter() {
                    for rb in bset.resources.iter() {
                        if rb.resource.resource_type == ShaderResourceType::Buffer {
                            let mut offset = 0usize;
                            let (p, length) = collect(rb, &mut offset);
                            if length > 0 {
                                let buffer = device.make_buffer(
                                    length,
                                    StorageMode::Shared,
                                    CpuCacheMode::WriteCombined,
                                )?;
                                num_buffers_generated += 1;
                                total_bytes_allocated += length;
                                self.buffer_resources.insert(
                                    p.location,
                                    BufferResource {
                                        name: p.name,
                                        buffers: p
                                            .infos
                                            .iter()
                                            .map(|&(offset, length)| BufferBindingInfo {
                                                buffer: buffer.clone(),
                                                offset,
                                                length,
                                            })
                                            .collect(),
                                    },
                                );
                            }
                        }
                    }
                }
            }
            BufferUsagePolicy::UseExternalBufferManually => {}
        }

        log::debug!(
            "init_resources generated {} buffers, {} bytes.",
            num_buffers_generated,
            total_bytes_allocated
        );
        Ok(())
    }

    /// Register an externally-managed buffer for a resource location
    /// (the UseExternalBufferManually policy).
    pub fn set_buffer_resource(
        &mut self,
        location: ShaderBindingLocation,
        buffers: Vec<BufferBindingInfo>,
    ) {
        self.buffer_resources.insert(
            location,
            BufferResource {
                name: String::new(),
                buffers,
            },
        );
    }

    /// Re-resolve every reflected resource against the material and the
    /// scene state, rewriting mapped uniform buffers and re-recording
    /// texture/sampler bindings. A resource that cannot be resolved
    /// logs a warning and leaves the rest of the frame intact.
    pub fn update_shading_properties(&mut self, scene_state: Option<&SceneState>) {
        let material = match self.material.as_ref() {
            Some(m) => m.clone(),
            None => return,
        };

        for rbs in self.resource_bindings.iter() {
            for rb in rbs.resources.iter() {
                let res = &rb.resource;
                if res.resource_type == ShaderResourceType::Buffer {
                    let location = ShaderBindingLocation::new(res.set, res.binding, 0);
                    let buffer_resource = match self.buffer_resources.get(&location) {
                        Some(b) => b,
                        None => continue,
                    };

                    let valid = (buffer_resource.buffers.len() as u32).min(res.count) as usize;
                    let mut updated: Vec<BufferBindingInfo> = Vec::with_capacity(valid);
                    for (index, info) in buffer_resource.buffers.iter().take(valid).enumerate() {
                        if info.offset + info.length > info.buffer.length() as u64 {
                            log::error!(
                                "Buffer is too small for resource set:{}, binding:{} name:\"{}\"",
                                res.set,
                                res.binding,
                                res.name
                            );
                            updated.clear();
                            break;
                        }
                        let base = info.buffer.contents();
                        if base.is_null() {
                            log::error!(
                                "Failed to map buffer for resource set:{}, binding:{} name:\"{}\"",
                                res.set,
                                res.binding,
                                res.name
                            );
                            continue;
                        }
                        let mapped = unsafe {
                            std::slice::from_raw_parts_mut(
                                base.add(info.offset as usize),
                                info.length as usize,
                            )
                        };
                        let copied = copy_struct_property(
                            &material,
                            scene_state,
                            res.buffer.data_type,
                            res.set,
                            res.binding,
                            0,
                            res.buffer.size,
                            res.stride,
                            index as u32,
                            &res.members,
                            &res.name,
                            mapped,
                        );
                        if copied > 0 {
                            info.buffer.flush();
                        }
                        updated.push(info.clone());
                    }
                    if !updated.is_empty() {
                        rbs.binding_set.set_buffer_array(res.binding, &updated);
                    } else {
                        log::error!(
                            "failed to bind buffer resource set:{}, binding:{} name:\"{}\"",
                            res.set,
                            res.binding,
                            res.name
                        );
                    }
                } else {
                    let location = ShaderBindingLocation::new(res.set, res.binding, 0);
                    let semantic = material
                        .shader
                        .resource_semantics
                        .get(&location)
                        .copied()
                        .unwrap_or(SemanticBinding::Material(MaterialSemantic::UserDefined));

                    // scene-derived textures/samplers are not a thing;
                    // warn like the buffer path would
                    if let SemanticBinding::Uniform(us) = semantic {
                        log::error!(
                            "No textures for shader uniform semantic {:?} (name:\"{}\")",
                            us,
                            res.name
                        );
                    }
                    let ms = match semantic {
                        SemanticBinding::Material(ms) => ms,
                        SemanticBinding::Uniform(_) => MaterialSemantic::UserDefined,
                    };

                    let bound = match res.resource_type {
                        ShaderResourceType::Texture => {
                            bind_material_textures(&material, ms, res, rbs)
                        }
                        ShaderResourceType::Sampler => {
                            bind_material_samplers(&material, ms, res, rbs)
                        }
                        ShaderResourceType::TextureSampler => {
                            let t = bind_material_textures(&material, ms, res, rbs);
                            let s = bind_material_samplers(&material, ms, res, rbs);
                            t.min(s)
                        }
                        ShaderResourceType::Buffer => 0,
                    };
                    if bound == 0 {
                        log::error!(
                            "Failed to bind resource: {} (name: {}, type: {:?})",
                            res.binding,
                            res.name,
                            res.resource_type
                        );
                    }
                }
            }
        }

        // pack push constants per declared layout
        for pc in self.push_constants.iter_mut() {
            if pc.layout.size == 0 {
                continue;
            }
            pc.data.clear();
            pc.data.resize(pc.layout.size as usize, 0);

            let location = ShaderBindingLocation::push_constant(pc.layout.offset);
            let layout = pc.layout.clone();
            copy_struct_property(
                &material,
                scene_state,
                ShaderDataType::Struct,
                location.set,
                location.binding,
                layout.offset,
                layout.size,
                layout.size,
                0,
                &layout.members,
                &layout.name,
                &mut pc.data,
            );
        }
    }

    /// Record the draw: pipeline, fixed-function state from the
    /// material, binding sets, push constants and the draw call. The
    /// vertex count is the minimum across the bound vertex buffers.
    pub fn encode_render_command(
        &self,
        encoder: &mut RenderCommandEncoder,
        num_instances: u32,
        base_instance: u32,
    ) -> bool {
        let (pipeline, material) = match (self.pipeline_state.as_ref(), self.material.as_ref()) {
            (Some(p), Some(m)) if !self.vertex_buffers.is_empty() => (p, m),
            _ => return false,
        };

        encoder.set_render_pipeline_state(pipeline.clone());
        encoder.set_front_facing(material.front_face);
        encoder.set_cull_mode(material.cull_mode);

        for rbs in self.resource_bindings.iter() {
            encoder.set_resource(rbs.index, &rbs.binding_set);
        }

        if !self.push_constants.is_empty() {
            // VUID-vkCmdPushConstants-offset-01796: emit one update
            // covering the union envelope with the stage union
            let mut begin = self.push_constants[0].layout.offset;
            let mut end = begin;
            let mut stages = crate::device::shader::ShaderStageFlags::empty();
            for pc in self.push_constants.iter() {
                begin = begin.min(pc.layout.offset);
                end = end.max(pc.layout.offset + pc.layout.size);
                stages |= pc.layout.stages;
            }
            let buffer_size = (end - begin) as usize;
            if buffer_size > 0 && !stages.is_empty() {
                let mut buffer = vec![0u8; buffer_size];
                for pc in self.push_constants.iter() {
                    if pc.data.len() < pc.layout.size as usize {
                        log::error!(
                            "PushConstant (name:\"{}\", offset:{}, size:{}) data is missing!",
                            pc.layout.name,
                            pc.layout.offset,
                            pc.layout.size
                        );
                        continue;
                    }
                    let dst = (pc.layout.offset - begin) as usize;
                    buffer[dst..dst + pc.layout.size as usize]
                        .copy_from_slice(&pc.data[..pc.layout.size as usize]);
                }
                encoder.push_constant(stages, begin, &buffer);
            }
        }

        for (index, vb) in self.vertex_buffers.iter().enumerate() {
            encoder.set_vertex_buffer(vb.buffer.clone(), vb.byte_offset as u64, index as u32);
        }

        let vertex_count = self
            .vertex_buffers
            .iter()
            .fold(self.vertex_buffers[0].vertex_count, |r, b| {
                r.min(b.vertex_count)
            });
        if vertex_count > 0 {
            if let Some(index_buffer) = self.index_buffer.as_ref() {
                encoder.draw_indexed(
                    self.index_count,
                    self.index_type,
                    index_buffer.clone(),
                    self.index_buffer_byte_offset as u64,
                    num_instances,
                    self.index_buffer_base_vertex_index,
                    base_instance,
                );
            } else if vertex_count > self.vertex_start {
                encoder.draw(
                    self.vertex_start,
                    vertex_count - self.vertex_start,
                    num_instances,
                    base_instance,
                );
            }
        }
        true
    }

    /// Walk a host-visible vertex buffer attribute by attribute. The
    /// handler gets a pointer to each vertex's attribute bytes and may
    /// stop the walk by returning false. Returns false when no buffer
    /// carries the semantic or the buffer is not host visible.
    pub fn enumerate_vertex_buffer_content<F>(
        &self,
        semantic: VertexAttributeSemantic,
        mut handler: F,
    ) -> bool
    where
        F: FnMut(*const u8, VertexFormat, u32) -> bool,
    {
        let mut found: Option<(&MeshVertexBuffer, &VertexAttribute)> = None;
        for vb in self.vertex_buffers.iter() {
            for attr in vb.attributes.iter() {
                if attr.semantic == semantic {
                    found = Some((vb, attr));
                    break;
                }
            }
            if found.is_some() {
                break;
            }
        }
        let (vb, attr) = match found {
            Some(f) => f,
            None => return false,
        };

        let base = vb.buffer.contents();
        if base.is_null() {
            return false;
        }
        let mut ptr = unsafe { base.add(vb.byte_offset as usize + attr.offset as usize) };
        for index in 0..vb.vertex_count {
            if !handler(ptr, attr.format, index) {
                return true;
            }
            ptr = unsafe { ptr.add(vb.byte_stride as usize) };
        }
        true
    }
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

fn bind_material_textures(
    material: &Material,
    semantic: MaterialSemantic,
    resource: &ShaderResource,
    rbs: &ResourceBindingSet,
) -> u32 {
    let mut textures = Vec::new();
    if semantic != MaterialSemantic::UserDefined {
        if let Some(prop) = material.properties.get(&semantic) {
            textures = prop.textures();
        }
    }
    if textures.is_empty() {
        let location = ShaderBindingLocation::new(resource.set, resource.binding, 0);
        if let Some(prop) = material.user_defined_properties.get(&location) {
            textures = prop.textures();
        }
    }
    if textures.is_empty() {
        match material.default_texture.as_ref() {
            Some(t) => textures.push(t.clone()),
            None => log::debug!("no default texture for binding {}", resource.binding),
        }
    }

    if !textures.is_empty() {
        let n = (resource.count as usize).min(textures.len());
        rbs.binding_set
            .set_texture_array(resource.binding, &textures[..n]);
        n as u32
    } else {
        0
    }
}

fn bind_material_samplers(
    material: &Material,
    semantic: MaterialSemantic,
    resource: &ShaderResource,
    rbs: &ResourceBindingSet,
) -> u32 {
    let mut samplers = Vec::new();
    if semantic != MaterialSemantic::UserDefined {
        if let Some(prop) = material.properties.get(&semantic) {
            samplers = prop.samplers();
        }
    }
    if samplers.is_empty() {
        let location = ShaderBindingLocation::new(resource.set, resource.binding, 0);
        if let Some(prop) = material.user_defined_properties.get(&location) {
            samplers = prop.samplers();
        }
    }
    if samplers.is_empty() {
        match material.default_sampler.as_ref() {
            Some(s) => samplers.push(s.clone()),
            None => log::debug!("no default sampler for binding {}", resource.binding),
        }
    }

    if !samplers.is_empty() {
        let n = (resource.count as usize).min(samplers.len());
        rbs.binding_set
            .set_sampler_array(resource.binding, &samplers[..n]);
        n as u32
    } else {
        0
    }
}

// Write a scene-derived matrix for a shader uniform semantic at the
// start of `buffer`. Float4x4 copies the matrix; Float3x3 extracts the
// upper 3x3. Returns the bytes written.
fn bind_shader_uniform_buffer(
    semantic: ShaderUniformSemantic,
    data_type: ShaderDataType,
    scene: &SceneState,
    buffer: &mut [u8],
) -> usize {
    let matrix: Matrix4<f32> = match semantic {
        ShaderUniformSemantic::ModelMatrix => scene.model,
        ShaderUniformSemantic::ViewMatrix => scene.view.matrix4(),
        ShaderUniformSemantic::ProjectionMatrix => scene.projection.matrix,
        ShaderUniformSemantic::ViewProjectionMatrix => {
            scene.projection.matrix * scene.view.matrix4()
        }
        ShaderUniformSemantic::ModelViewProjectionMatrix => {
            scene.projection.matrix * scene.view.matrix4() * scene.model
        }
        ShaderUniformSemantic::InverseModelMatrix => {
            scene.model.invert().unwrap_or_else(Matrix4::identity)
        }
        ShaderUniformSemantic::InverseViewMatrix => scene
            .view
            .matrix4()
            .invert()
            .unwrap_or_else(Matrix4::identity),
        ShaderUniformSemantic::InverseProjectionMatrix => scene
            .projection
            .matrix
            .invert()
            .unwrap_or_else(Matrix4::identity),
        ShaderUniformSemantic::InverseViewProjectionMatrix => {
            (scene.projection.matrix * scene.view.matrix4())
                .invert()
                .unwrap_or_else(Matrix4::identity)
        }
        ShaderUniformSemantic::InverseModelViewProjectionMatrix => {
            (scene.projection.matrix * scene.view.matrix4() * scene.model)
                .invert()
                .unwrap_or_else(Matrix4::identity)
        }
    };

    match data_type {
        ShaderDataType::Float4x4 => {
            let cols: [[f32; 4]; 4] = matrix.into();
            let bytes = unsafe {
                std::slice::from_raw_parts(cols.as_ptr() as *const u8, 64)
            };
            if buffer.len() < bytes.len() {
                return 0;
            }
            buffer[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        }
        ShaderDataType::Float3x3 => {
            let cols: [[f32; 4]; 4] = matrix.into();
            let m3 = [
                [cols[0][0], cols[0][1], cols[0][2]],
                [cols[1][0], cols[1][1], cols[1][2]],
                [cols[2][0], cols[2][1], cols[2][2]],
            ];
            let bytes = unsafe {
                std::slice::from_raw_parts(m3.as_ptr() as *const u8, 36)
            };
            if buffer.len() < bytes.len() {
                return 0;
            }
            buffer[..bytes.len()].copy_from_slice(bytes);
            bytes.len()
        }
        _ => 0,
    }
}

// Copy a material property's bytes at an element offset. Returns the
// bytes written, zero when the property cannot be resolved.
fn bind_material_property(
    material: &Material,
    semantic: MaterialSemantic,
    location: ShaderBindingLocation,
    item_offset: usize,
    buffer: &mut [u8],
) -> usize {
    let mut data: Option<(&[u8], usize, usize)> = None;
    if semantic != MaterialSemantic::UserDefined {
        if let Some(prop) = material.properties.get(&semantic) {
            data = prop.underlying_data();
        }
    }
    if data.map_or(true, |(_, _, count)| count == 0) {
        if let Some(prop) = material.user_defined_properties.get(&location) {
            data = prop.underlying_data();
        }
    }

    if let Some((bytes, elem_size, count)) = data {
        let data_length = count * elem_size;
        if data_length > item_offset {
            let s = (data_length - item_offset).min(buffer.len());
            buffer[..s].copy_from_slice(&bytes[item_offset..item_offset + s]);
            return s;
        }
    }
    0
}

// Resolve one struct member (recursively for nested structs) to a
// shader uniform semantic or a material property and write its bytes.
fn bind_struct_member(
    material: &Material,
    scene_state: Option<&SceneState>,
    member: &ShaderResourceStructMember,
    parent_path: &str,
    struct_array_index: u32,
    set: u32,
    binding: u32,
    offset: u32,
    buffer: &mut [u8],
) -> usize {
    let binding_offset = member.offset + offset;

    let path = if !parent_path.is_empty() && !member.name.is_empty() {
        format!("{}.{}", parent_path, member.name)
    } else {
        member.name.clone()
    };

    if member.data_type == ShaderDataType::Struct {
        let mut copied = 0;
        for m in member.members.iter() {
            let m_offset = m.offset as usize;
            if m_offset >= buffer.len() || m_offset + m.size as usize > buffer.len() {
                continue;
            }
            let s = bind_struct_member(
                material,
                scene_state,
                m,
                &path,
                struct_array_index,
                set,
                binding,
                binding_offset,
                &mut buffer[m_offset..],
            );
            if s == 0 {
                log::debug!(
                    "Unable to bind shader uniform struct element (set:{} binding:{} offset:{}) name:\"{}\"",
                    set,
                    binding,
                    binding_offset,
                    path
                );
            }
            copied = member.offset as usize + s;
        }
        copied
    } else {
        let location = ShaderBindingLocation::new(set, binding, binding_offset);
        let semantic = material.shader.resource_semantics.get(&location).copied();

        let mut copied = 0;
        if let (Some(SemanticBinding::Uniform(us)), Some(scene)) = (semantic, scene_state) {
            copied = bind_shader_uniform_buffer(us, member.data_type, scene, buffer);
        }
        if copied == 0 {
            let ms = match semantic {
                Some(SemanticBinding::Material(ms)) => ms,
                _ => MaterialSemantic::UserDefined,
            };
            let item_offset = (member.count * member.stride * struct_array_index) as usize;
            copied = bind_material_property(material, ms, location, item_offset, buffer);
        }
        if copied == 0 {
            log::debug!(
                "Unable to bind shader uniform (set:{} binding:{} offset:{}), arrayIndex:{}, name:\"{}\"",
                set,
                binding,
                binding_offset,
                struct_array_index,
                path
            );
        }
        copied
    }
}

// Fill one buffer element (or push-constant block) from its reflected
// struct layout. Returns the total bytes written.
fn copy_struct_property(
    material: &Material,
    scene_state: Option<&SceneState>,
    data_type: ShaderDataType,
    set: u32,
    binding: u32,
    offset: u32,
    size: u32,
    stride: u32,
    array_index: u32,
    members: &[ShaderResourceStructMember],
    name: &str,
    buffer: &mut [u8],
) -> usize {
    let mut copied = 0;
    if data_type == ShaderDataType::Struct {
        for member in members.iter() {
            if member.offset < offset {
                continue;
            }
            if member.offset >= offset + size {
                break;
            }
            if member.offset + member.size > offset + size {
                break;
            }

            let path = if !name.is_empty() && !member.name.is_empty() {
                format!("{}.{}", name, member.name)
            } else {
                member.name.clone()
            };

            let d = (member.offset - offset) as usize;
            if member.offset as usize + member.size as usize - offset as usize > buffer.len() {
                log::error!(
                    "Insufficient buffer for shader uniform struct (set:{} binding:{} offset:{}), size:{}, name:\"{}\"",
                    set,
                    binding,
                    member.offset,
                    size,
                    path
                );
                break;
            }

            let s = bind_struct_member(
                material,
                scene_state,
                member,
                name,
                array_index,
                set,
                binding,
                0,
                &mut buffer[d..],
            );
            if s > 0 {
                copied += s;
            } else {
                log::debug!(
                    "Unable to bind shader uniform struct (set:{} binding:{} offset:{}), size:{}, name:\"{}\"",
                    set,
                    binding,
                    member.offset,
                    size,
                    path
                );
            }
        }
    } else {
        let location = ShaderBindingLocation::new(set, binding, offset);
        let semantic = material.shader.resource_semantics.get(&location).copied();

        if let (Some(SemanticBinding::Uniform(us)), Some(scene)) = (semantic, scene_state) {
            copied = bind_shader_uniform_buffer(us, data_type, scene, buffer);
        }
        if copied == 0 {
            let ms = match semantic {
                Some(SemanticBinding::Material(ms)) => ms,
                _ => MaterialSemantic::UserDefined,
            };
            let item_offset = (array_index * stride) as usize;
            copied = bind_material_property(material, ms, location, item_offset, buffer);
        }
        if copied == 0 {
            log::debug!(
                "Unable to bind shader uniform (set:{} binding:{} offset:{}), arrayIndex:{}, name:\"{}\"",
                set,
                binding,
                offset,
                array_index,
                name
            );
        }
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{ProjectionTransform, ViewTransform};
    use cgmath::Vector3;

    fn test_material_with_semantic(
        location: ShaderBindingLocation,
        binding: SemanticBinding,
    ) -> Material {
        let mut material = Material::default();
        material.shader.resource_semantics.insert(location, binding);
        material
    }

    #[test]
    fn model_matrix_semantic_writes_sixty_four_bytes() {
        let scene = SceneState {
            view: ViewTransform::look_at(
                Vector3::new(0.0, 0.0, 5.0),
                Vector3::new(0.0, 0.0, -1.0),
                Vector3::new(0.0, 1.0, 0.0),
            ),
            projection: ProjectionTransform::perspective(1.0, 1.0, 0.1, 100.0),
            model: Matrix4::from_scale(2.0),
        };
        let mut buffer = vec![0u8; 64];
        let written = bind_shader_uniform_buffer(
            ShaderUniformSemantic::ModelMatrix,
            ShaderDataType::Float4x4,
            &scene,
            &mut buffer,
        );
        assert_eq!(written, 64);
        let first = f32::from_ne_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        assert_eq!(first, 2.0);
    }

    #[test]
    fn float3x3_extracts_the_upper_left_block() {
        let scene = SceneState {
            model: Matrix4::from_scale(3.0),
            ..SceneState::default()
        };
        let mut buffer = vec![0u8; 64];
        let written = bind_shader_uniform_buffer(
            ShaderUniformSemantic::ModelMatrix,
            ShaderDataType::Float3x3,
            &scene,
            &mut buffer,
        );
        assert_eq!(written, 36);
        let first = f32::from_ne_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        assert_eq!(first, 3.0);
        // second column starts at float index 3
        let col1 = f32::from_ne_bytes([buffer[16], buffer[17], buffer[18], buffer[19]]);
        assert_eq!(col1, 3.0);
    }

    #[test]
    fn undersized_buffer_refuses_the_matrix() {
        let scene = SceneState::default();
        let mut buffer = vec![0u8; 16];
        let written = bind_shader_uniform_buffer(
            ShaderUniformSemantic::ViewMatrix,
            ShaderDataType::Float4x4,
            &scene,
            &mut buffer,
        );
        assert_eq!(written, 0);
    }

    #[test]
    fn material_property_copy_respects_item_offsets() {
        let mut material = Material::default();
        material.set_property(
            MaterialSemantic::BaseColor,
            MaterialProperty::FloatArray(vec![1.0, 2.0, 3.0, 4.0]),
        );

        let mut buffer = vec![0u8; 8];
        let written = bind_material_property(
            &material,
            MaterialSemantic::BaseColor,
            ShaderBindingLocation::new(0, 0, 0),
            8, // skip the first two floats
            &mut buffer,
        );
        assert_eq!(written, 8);
        let v = f32::from_ne_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        assert_eq!(v, 3.0);
    }

    use crate::material::MaterialProperty;

    #[test]
    fn user_defined_properties_resolve_by_location() {
        let mut material = Material::default();
        let location = ShaderBindingLocation::new(1, 2, 0);
        material.set_user_property(location, MaterialProperty::UInt32Array(vec![0xdeadbeef]));

        let mut buffer = vec![0u8; 4];
        let written = bind_material_property(
            &material,
            MaterialSemantic::UserDefined,
            location,
            0,
            &mut buffer,
        );
        assert_eq!(written, 4);
        assert_eq!(u32::from_ne_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]), 0xdeadbeef);
    }

    #[test]
    fn struct_copy_walks_members_by_offset() {
        let mut material = test_material_with_semantic(
            ShaderBindingLocation::new(0, 0, 0),
            SemanticBinding::Uniform(ShaderUniformSemantic::ModelMatrix),
        );
        material.shader.resource_semantics.insert(
            ShaderBindingLocation::new(0, 0, 64),
            SemanticBinding::Material(MaterialSemantic::BaseColor),
        );
        material.set_property(
            MaterialSemantic::BaseColor,
            MaterialProperty::FloatArray(vec![0.25, 0.5, 0.75, 1.0]),
        );

        let members = vec![
            ShaderResourceStructMember {
                name: "model".into(),
                data_type: ShaderDataType::Float4x4,
                offset: 0,
                size: 64,
                count: 1,
                stride: 64,
                members: Vec::new(),
            },
            ShaderResourceStructMember {
                name: "baseColor".into(),
                data_type: ShaderDataType::Float4,
                offset: 64,
                size: 16,
                count: 1,
                stride: 16,
                members: Vec::new(),
            },
        ];

        let scene = SceneState {
            model: Matrix4::from_scale(4.0),
            ..SceneState::default()
        };
        let mut buffer = vec![0u8; 80];
        let copied = copy_struct_property(
            &material,
            Some(&scene),
            ShaderDataType::Struct,
            0,
            0,
            0,
            80,
            80,
            0,
            &members,
            "params",
            &mut buffer,
        );
        assert!(copied >= 64 + 16);
        let m00 = f32::from_ne_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        assert_eq!(m00, 4.0);
        let color_r = f32::from_ne_bytes([buffer[64], buffer[65], buffer[66], buffer[67]]);
        assert_eq!(color_r, 0.25);
    }
}
