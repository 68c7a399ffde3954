// The Graupel rendering engine
//
// A sparse-voxel rendering engine core: spatial indices (a triangle
// AABB octree and a voxel octree, both with GPU-flattenable forms), a
// Vulkan 1.3 device runtime (memory pools, descriptor chains, command
// encoders, swapchain pacing) and a mesh renderer that reconciles
// reflected shader resources against materials and scene state.

pub mod device;
pub mod dispatch;
pub mod geometry;
pub mod material;
pub mod mesh;
pub mod octree;
pub mod scene;
pub mod voxel;

pub use device::buffer::{Buffer, BufferView};
pub use device::cmdbuffer::{CommandBuffer, CommandQueue, QueueFlags};
pub use device::descriptor::{
    BufferBindingInfo, PoolId, ShaderBinding, ShaderBindingSet, ShaderBindingSetLayout,
};
pub use device::encoder::{
    ComputeCommandEncoder, CopyCommandEncoder, RenderCommandEncoder,
    RenderPassColorAttachmentDescriptor, RenderPassDepthStencilAttachmentDescriptor,
    RenderPassDescriptor,
};
pub use device::image::{
    Image, ImageView, Sampler, SamplerAddressMode, SamplerDescriptor, SamplerFilter,
};
pub use device::instance::Instance;
pub use device::pipeline::{
    ComputePipelineDescriptor, ComputePipelineState, DepthStencilDescriptor, DepthStencilState,
    RenderPipelineColorAttachmentDescriptor, RenderPipelineDescriptor, RenderPipelineState,
    StencilDescriptor, VertexAttributeDescriptor, VertexBufferLayoutDescriptor, VertexDescriptor,
};
pub use device::semaphore::{AutoIncrementTimeline, BinarySemaphore, GpuEvent, TimelineSemaphore};
pub use device::shader::{
    PipelineReflection, Shader, ShaderAttribute, ShaderBindingLocation, ShaderDataType,
    ShaderDescriptor, ShaderDescriptorType, ShaderFunction, ShaderModule,
    ShaderPushConstantLayout, ShaderResource, ShaderResourceStructMember, ShaderStage,
    ShaderStageFlags,
};
pub use device::swapchain::Swapchain;
pub use device::types::{
    BlendFactor, BlendOperation, BlendState, ColorWriteMask, CompareFunction, CullMode,
    DepthClipMode, IndexType, LoadAction, PixelFormat, PrimitiveType, ScissorRect,
    StencilOperation, StoreAction, TriangleFillMode, VertexFormat, VertexStepRate, Viewport,
    Winding,
};
pub use device::{
    CpuCacheMode, GraphicsDevice, StorageMode, TextureDescriptor, TextureType, TextureUsage,
};
pub use dispatch::{DispatchQueue, Dispatcher, TaskHandle};
pub use geometry::{
    Aabb, AffineTransform3, Color, Float16, Plane, ProjectionTransform, Rgba8, Sphere, Triangle,
    ViewTransform,
};
pub use material::{
    Material, MaterialProperty, MaterialShaderFunction, MaterialShaderMap, MaterialSemantic,
    SemanticBinding, ShaderUniformSemantic, VertexAttributeSemantic,
};
pub use mesh::{BufferUsagePolicy, Mesh, MeshVertexBuffer, VertexAttribute};
pub use octree::{AabbOctree, AabbOctreeLayer, LayerNode, LayerNodeValue, RayHitOption};
pub use scene::SceneState;
pub use voxel::{VolumeArray, VolumeNode, Voxel, VoxelModel, VoxelOctree};

use thiserror::Error;

/// Engine-wide error type. Resource construction and validation
/// failures surface here; unrecoverable invariants abort instead.
#[allow(non_camel_case_types)]
#[derive(Debug, Error)]
pub enum GraupelError {
    #[error("Invalid operation or data")]
    INVALID,
    #[error("Index out of range")]
    OUT_OF_RANGE,
    #[error("The swapchain is out of date")]
    OUT_OF_DATE,
    #[error("Presentation failed")]
    PRESENT_FAILED,
    #[error("Could not acquire the next swapchain image")]
    COULD_NOT_ACQUIRE_NEXT_IMAGE,
    #[error("Not all required Vulkan extensions are available")]
    VK_NOT_ALL_EXTENSIONS_AVAILABLE,
    #[error("Resource construction failed")]
    RESOURCE_CREATION_FAILED,
    #[error("Validation failed")]
    VALIDATION_FAILED,
    #[error("Vulkan call failed: {0:?}")]
    VK_ERROR(#[from] ash::vk::Result),
    #[error("io error: {0}")]
    IO(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, GraupelError>;
