// Shader modules and their reflection data
//
// SPIR-V reflection itself happens outside the engine; callers hand a
// `Shader` over with the descriptor/resource/attribute tables already
// extracted, and this layer owns the VkShaderModule plus the merge
// rules that combine per-stage tables into one pipeline reflection.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use utils::log;

use crate::{GraupelError, Result};

bitflags::bitflags! {
    pub struct ShaderStageFlags: u32 {
        const VERTEX = 1;
        const FRAGMENT = 1 << 1;
        const COMPUTE = 1 << 2;
    }
}

impl ShaderStageFlags {
    pub fn to_vk(self) -> vk::ShaderStageFlags {
        let mut flags = vk::ShaderStageFlags::empty();
        if self.contains(ShaderStageFlags::VERTEX) {
            flags |= vk::ShaderStageFlags::VERTEX;
        }
        if self.contains(ShaderStageFlags::FRAGMENT) {
            flags |= vk::ShaderStageFlags::FRAGMENT;
        }
        if self.contains(ShaderStageFlags::COMPUTE) {
            flags |= vk::ShaderStageFlags::COMPUTE;
        }
        flags
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn flags(self) -> ShaderStageFlags {
        match self {
            ShaderStage::Vertex => ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => ShaderStageFlags::COMPUTE,
        }
    }

    pub fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// Where a shader resource binds: a (set, binding) pair plus a byte
/// offset for struct members. Push constants use a sentinel location.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ShaderBindingLocation {
    pub set: u32,
    pub binding: u32,
    pub offset: u32,
}

impl ShaderBindingLocation {
    pub fn new(set: u32, binding: u32, offset: u32) -> Self {
        Self {
            set,
            binding,
            offset,
        }
    }

    pub fn push_constant(offset: u32) -> Self {
        Self {
            set: u32::MAX,
            binding: u32::MAX,
            offset,
        }
    }

    pub fn is_push_constant(&self) -> bool {
        self.set == u32::MAX && self.binding == u32::MAX
    }
}

/// Descriptor classification as the engine sees it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderDescriptorType {
    UniformBuffer,
    StorageBuffer,
    UniformTexelBuffer,
    StorageTexelBuffer,
    Texture,
    StorageTexture,
    TextureSampler,
    Sampler,
    InputAttachment,
}

impl ShaderDescriptorType {
    pub fn to_vk(self) -> vk::DescriptorType {
        match self {
            ShaderDescriptorType::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            ShaderDescriptorType::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            ShaderDescriptorType::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            ShaderDescriptorType::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            ShaderDescriptorType::Texture => vk::DescriptorType::SAMPLED_IMAGE,
            ShaderDescriptorType::StorageTexture => vk::DescriptorType::STORAGE_IMAGE,
            ShaderDescriptorType::TextureSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            ShaderDescriptorType::Sampler => vk::DescriptorType::SAMPLER,
            ShaderDescriptorType::InputAttachment => vk::DescriptorType::INPUT_ATTACHMENT,
        }
    }
}

/// Scalar/vector/matrix classification of a uniform member.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderDataType {
    None,
    Struct,
    Bool,
    Int,
    UInt,
    Half,
    Float,
    Float2,
    Float3,
    Float4,
    Float2x2,
    Float3x3,
    Float4x4,
}

/// One member of a uniform struct, possibly itself a struct.
#[derive(Clone, Debug, Default)]
pub struct ShaderResourceStructMember {
    pub name: String,
    pub data_type: ShaderDataType,
    pub offset: u32,
    pub size: u32,
    pub count: u32,
    pub stride: u32,
    pub members: Vec<ShaderResourceStructMember>,
}

impl Default for ShaderDataType {
    fn default() -> Self {
        ShaderDataType::None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ShaderResourceType {
    Buffer,
    Texture,
    Sampler,
    TextureSampler,
}

/// Buffer-specific reflection: the declared struct layout.
#[derive(Copy, Clone, Debug, Default)]
pub struct ShaderResourceBuffer {
    pub data_type: ShaderDataType,
    pub alignment: u32,
    pub size: u32,
}

impl Default for ShaderResourceType {
    fn default() -> Self {
        ShaderResourceType::Buffer
    }
}

/// A resource (buffer/texture/sampler) a shader stage declares.
#[derive(Clone, Debug)]
pub struct ShaderResource {
    pub set: u32,
    pub binding: u32,
    pub name: String,
    pub resource_type: ShaderResourceType,
    pub stages: ShaderStageFlags,
    pub count: u32,
    pub stride: u32,
    pub enabled: bool,
    pub buffer: ShaderResourceBuffer,
    pub members: Vec<ShaderResourceStructMember>,
}

/// A vertex-stage input attribute.
#[derive(Clone, Debug)]
pub struct ShaderAttribute {
    pub name: String,
    pub location: u32,
    pub enabled: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ShaderPushConstantLayout {
    pub name: String,
    pub offset: u32,
    pub size: u32,
    pub stages: ShaderStageFlags,
    pub members: Vec<ShaderResourceStructMember>,
}

impl Default for ShaderStageFlags {
    fn default() -> Self {
        ShaderStageFlags::empty()
    }
}

/// Descriptor-set slot a shader declares, as reported by reflection.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ShaderDescriptor {
    pub set: u32,
    pub binding: u32,
    pub count: u32,
    pub descriptor_type: ShaderDescriptorType,
}

/// Compiled SPIR-V plus its reflection tables, supplied by the caller.
#[derive(Clone)]
pub struct Shader {
    pub spirv: Vec<u32>,
    pub stage: ShaderStage,
    /// Sorted by (set, binding); the pipeline layout derivation
    /// depends on this ordering.
    pub descriptors: Vec<ShaderDescriptor>,
    pub resources: Vec<ShaderResource>,
    pub input_attributes: Vec<ShaderAttribute>,
    pub push_constant_layouts: Vec<ShaderPushConstantLayout>,
}

pub struct ShaderModule {
    device: ash::Device,
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
    pub descriptors: Vec<ShaderDescriptor>,
    pub resources: Vec<ShaderResource>,
    pub input_attributes: Vec<ShaderAttribute>,
    pub push_constant_layouts: Vec<ShaderPushConstantLayout>,
}

impl ShaderModule {
    pub(crate) fn new(device: ash::Device, shader: &Shader) -> Result<Arc<ShaderModule>> {
        if shader.spirv.is_empty() {
            log::error!("shader has no SPIR-V code");
            return Err(GraupelError::VALIDATION_FAILED);
        }
        let info = vk::ShaderModuleCreateInfo::builder().code(&shader.spirv);
        let module = unsafe {
            device.create_shader_module(&info, None).map_err(|e| {
                log::error!("vkCreateShaderModule failed: {:?}", e);
                GraupelError::from(e)
            })?
        };

        let mut descriptors = shader.descriptors.clone();
        descriptors.sort_by_key(|d| (d.set, d.binding));

        Ok(Arc::new(ShaderModule {
            device,
            module,
            stage: shader.stage,
            descriptors,
            resources: shader.resources.clone(),
            input_attributes: shader.input_attributes.clone(),
            push_constant_layouts: shader.push_constant_layouts.clone(),
        }))
    }

    /// Bind an entry point of this module.
    pub fn make_function(self: &Arc<Self>, name: &str) -> Result<Arc<ShaderFunction>> {
        let function_name = CString::new(name).map_err(|_| GraupelError::INVALID)?;
        Ok(Arc::new(ShaderFunction {
            module: self.clone(),
            function_name,
        }))
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}

pub struct ShaderFunction {
    pub module: Arc<ShaderModule>,
    pub function_name: CString,
}

impl ShaderFunction {
    pub fn stage(&self) -> ShaderStage {
        self.module.stage
    }

    pub fn stage_input_attributes(&self) -> &[ShaderAttribute] {
        &self.module.input_attributes
    }
}

/// Merged reflection of every stage in a pipeline.
#[derive(Clone, Default)]
pub struct PipelineReflection {
    pub resources: Vec<ShaderResource>,
    pub input_attributes: Vec<ShaderAttribute>,
    pub push_constant_layouts: Vec<ShaderPushConstantLayout>,
}

/// Borrowed reflection tables of a single stage, the unit the merge
/// operates on.
pub struct StageReflection<'a> {
    pub stage: ShaderStage,
    pub resources: &'a [ShaderResource],
    pub input_attributes: &'a [ShaderAttribute],
    pub push_constant_layouts: &'a [ShaderPushConstantLayout],
}

impl<'a> StageReflection<'a> {
    pub fn of(function: &'a ShaderFunction) -> StageReflection<'a> {
        let module = &function.module;
        StageReflection {
            stage: module.stage,
            resources: &module.resources,
            input_attributes: &module.input_attributes,
            push_constant_layouts: &module.push_constant_layouts,
        }
    }
}

impl PipelineReflection {
    /// Merge the per-stage tables. Resources merge by (set, binding)
    /// with their stage masks unioned; a descriptor-type disagreement
    /// between stages fails the merge. Push-constant layouts merge by
    /// exact (offset, size).
    pub fn merge(stages: &[StageReflection]) -> Result<PipelineReflection> {
        let mut reflection = PipelineReflection::default();

        for module in stages {
            if module.stage == ShaderStage::Vertex {
                reflection
                    .input_attributes
                    .extend(module.input_attributes.iter().filter(|a| a.enabled).cloned());
            }
        }

        for module in stages {
            let stage = module.stage.flags();

            for res in module.resources.iter() {
                if !res.enabled {
                    continue;
                }
                let mut exists = false;
                for merged in reflection.resources.iter_mut() {
                    if merged.set == res.set && merged.binding == res.binding {
                        if merged.resource_type != res.resource_type {
                            log::error!(
                                "shader resource type mismatch at set:{} binding:{}",
                                res.set,
                                res.binding
                            );
                            return Err(GraupelError::VALIDATION_FAILED);
                        }
                        merged.stages |= stage;
                        exists = true;
                        break;
                    }
                }
                if !exists {
                    let mut merged = res.clone();
                    merged.stages = stage;
                    reflection.resources.push(merged);
                }
            }

            for layout in module.push_constant_layouts.iter() {
                let mut exists = false;
                for merged in reflection.push_constant_layouts.iter_mut() {
                    if merged.offset == layout.offset && merged.size == layout.size {
                        merged.stages |= stage;
                        exists = true;
                        break;
                    }
                }
                if !exists {
                    let mut merged = layout.clone();
                    merged.stages = stage;
                    reflection.push_constant_layouts.push(merged);
                }
            }
        }

        Ok(reflection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(set: u32, binding: u32, ty: ShaderResourceType) -> ShaderResource {
        ShaderResource {
            set,
            binding,
            name: format!("res_{}_{}", set, binding),
            resource_type: ty,
            stages: ShaderStageFlags::empty(),
            count: 1,
            stride: 0,
            enabled: true,
            buffer: ShaderResourceBuffer::default(),
            members: Vec::new(),
        }
    }

    fn stage_of<'a>(
        stage: ShaderStage,
        resources: &'a [ShaderResource],
        push_constants: &'a [ShaderPushConstantLayout],
    ) -> StageReflection<'a> {
        StageReflection {
            stage,
            resources,
            input_attributes: &[],
            push_constant_layouts: push_constants,
        }
    }

    #[test]
    fn stage_masks_union_on_matching_bindings() {
        let vs_res = vec![resource(0, 0, ShaderResourceType::Buffer)];
        let fs_res = vec![
            resource(0, 0, ShaderResourceType::Buffer),
            resource(0, 1, ShaderResourceType::Texture),
        ];
        let vs = stage_of(ShaderStage::Vertex, &vs_res, &[]);
        let fs = stage_of(ShaderStage::Fragment, &fs_res, &[]);
        let merged = PipelineReflection::merge(&[vs, fs]).unwrap();
        assert_eq!(merged.resources.len(), 2);
        let shared = merged
            .resources
            .iter()
            .find(|r| r.set == 0 && r.binding == 0)
            .unwrap();
        assert!(shared.stages.contains(ShaderStageFlags::VERTEX));
        assert!(shared.stages.contains(ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn type_mismatch_fails_the_merge() {
        let vs_res = vec![resource(0, 0, ShaderResourceType::Buffer)];
        let fs_res = vec![resource(0, 0, ShaderResourceType::Texture)];
        let vs = stage_of(ShaderStage::Vertex, &vs_res, &[]);
        let fs = stage_of(ShaderStage::Fragment, &fs_res, &[]);
        assert!(PipelineReflection::merge(&[vs, fs]).is_err());
    }

    #[test]
    fn push_constants_merge_by_offset_and_size() {
        let pc = |offset, size| ShaderPushConstantLayout {
            name: "pc".into(),
            offset,
            size,
            stages: ShaderStageFlags::empty(),
            members: Vec::new(),
        };
        let vs_pc = vec![pc(0, 16)];
        let fs_pc = vec![pc(0, 16), pc(16, 8)];
        let vs = stage_of(ShaderStage::Vertex, &[], &vs_pc);
        let fs = stage_of(ShaderStage::Fragment, &[], &fs_pc);
        let merged = PipelineReflection::merge(&[vs, fs]).unwrap();
        assert_eq!(merged.push_constant_layouts.len(), 2);
        let first = &merged.push_constant_layouts[0];
        assert!(first.stages.contains(ShaderStageFlags::VERTEX | ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn push_constant_location_sentinel() {
        let loc = ShaderBindingLocation::push_constant(8);
        assert!(loc.is_push_constant());
        assert!(!ShaderBindingLocation::new(0, 0, 8).is_push_constant());
    }
}
