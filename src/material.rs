// Materials: semantic tags, properties and the shader map
//
// A material carries semantic-keyed properties (base color, metallic,
// textures, ...) plus location-keyed user properties, and a shader map
// that tells the mesh renderer which engine semantic each reflected
// binding or vertex input corresponds to.

use std::collections::HashMap;
use std::sync::Arc;

use cgmath::{Matrix3, Matrix4, Quaternion, Vector2, Vector3, Vector4};

use crate::device::image::{ImageView, Sampler};
use crate::device::shader::{
    ShaderBindingLocation, ShaderDescriptor, ShaderFunction, ShaderStage, ShaderStageFlags,
};
use crate::device::types::{BlendState, CullMode, PixelFormat, TriangleFillMode, Winding};
use crate::geometry::{Color, Float16};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MaterialSemantic {
    UserDefined,
    BaseColor,
    BaseColorTexture,
    Metallic,
    Roughness,
    MetallicRoughnessTexture,
    NormalScaleFactor,
    NormalTexture,
    OcclusionScale,
    OcclusionTexture,
    EmissiveFactor,
    EmissiveTexture,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ShaderUniformSemantic {
    ModelMatrix,
    ViewMatrix,
    ProjectionMatrix,
    ViewProjectionMatrix,
    ModelViewProjectionMatrix,
    InverseModelMatrix,
    InverseViewMatrix,
    InverseProjectionMatrix,
    InverseViewProjectionMatrix,
    InverseModelViewProjectionMatrix,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum VertexAttributeSemantic {
    UserDefined,
    Position,
    Normal,
    Color,
    TextureCoordinates,
    Tangent,
    Bitangent,
    BlendIndices,
    BlendWeights,
}

/// What a shader binding location means to the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SemanticBinding {
    Material(MaterialSemantic),
    Uniform(ShaderUniformSemantic),
}

#[derive(Clone)]
pub struct CombinedTextureSampler {
    pub texture: Arc<ImageView>,
    pub sampler: Arc<Sampler>,
}

/// A material property value. Numeric variants expose their raw bytes
/// for copying straight into uniform buffers.
#[derive(Clone)]
pub enum MaterialProperty {
    None,
    Buffer(Vec<u8>),
    Int8Array(Vec<i8>),
    UInt8Array(Vec<u8>),
    Int16Array(Vec<i16>),
    UInt16Array(Vec<u16>),
    Int32Array(Vec<i32>),
    UInt32Array(Vec<u32>),
    HalfArray(Vec<Float16>),
    FloatArray(Vec<f32>),
    DoubleArray(Vec<f64>),
    Textures(Vec<Arc<ImageView>>),
    Samplers(Vec<Arc<Sampler>>),
    CombinedTextureSamplers(Vec<CombinedTextureSampler>),
}

impl MaterialProperty {
    /// Raw bytes, element size and element count of a numeric value.
    pub fn underlying_data(&self) -> Option<(&[u8], usize, usize)> {
        unsafe fn bytes_of<T>(v: &[T]) -> &[u8] {
            std::slice::from_raw_parts(v.as_ptr() as *const u8, v.len() * std::mem::size_of::<T>())
        }
        unsafe {
            match self {
                MaterialProperty::Buffer(v) => Some((v.as_slice(), 1, v.len())),
                MaterialProperty::Int8Array(v) => Some((bytes_of(v), 1, v.len())),
                MaterialProperty::UInt8Array(v) => Some((bytes_of(v), 1, v.len())),
                MaterialProperty::Int16Array(v) => Some((bytes_of(v), 2, v.len())),
                MaterialProperty::UInt16Array(v) => Some((bytes_of(v), 2, v.len())),
                MaterialProperty::Int32Array(v) => Some((bytes_of(v), 4, v.len())),
                MaterialProperty::UInt32Array(v) => Some((bytes_of(v), 4, v.len())),
                MaterialProperty::HalfArray(v) => Some((bytes_of(v), 2, v.len())),
                MaterialProperty::FloatArray(v) => Some((bytes_of(v), 4, v.len())),
                MaterialProperty::DoubleArray(v) => Some((bytes_of(v), 8, v.len())),
                _ => None,
            }
        }
    }

    /// Texture list, unwrapping combined texture-samplers.
    pub fn textures(&self) -> Vec<Arc<ImageView>> {
        match self {
            MaterialProperty::Textures(v) => v.clone(),
            MaterialProperty::CombinedTextureSamplers(v) => {
                v.iter().map(|c| c.texture.clone()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Sampler list, unwrapping combined texture-samplers.
    pub fn samplers(&self) -> Vec<Arc<Sampler>> {
        match self {
            MaterialProperty::Samplers(v) => v.clone(),
            MaterialProperty::CombinedTextureSamplers(v) => {
                v.iter().map(|c| c.sampler.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

impl From<f32> for MaterialProperty {
    fn from(v: f32) -> Self {
        MaterialProperty::FloatArray(vec![v])
    }
}

impl From<Vector2<f32>> for MaterialProperty {
    fn from(v: Vector2<f32>) -> Self {
        MaterialProperty::FloatArray(vec![v.x, v.y])
    }
}

impl From<Vector3<f32>> for MaterialProperty {
    fn from(v: Vector3<f32>) -> Self {
        MaterialProperty::FloatArray(vec![v.x, v.y, v.z])
    }
}

impl From<Vector4<f32>> for MaterialProperty {
    fn from(v: Vector4<f32>) -> Self {
        MaterialProperty::FloatArray(vec![v.x, v.y, v.z, v.w])
    }
}

impl From<Color> for MaterialProperty {
    fn from(c: Color) -> Self {
        MaterialProperty::FloatArray(vec![c.r, c.g, c.b, c.a])
    }
}

impl From<Quaternion<f32>> for MaterialProperty {
    fn from(q: Quaternion<f32>) -> Self {
        MaterialProperty::FloatArray(vec![q.v.x, q.v.y, q.v.z, q.s])
    }
}

impl From<Matrix3<f32>> for MaterialProperty {
    fn from(m: Matrix3<f32>) -> Self {
        let c: [[f32; 3]; 3] = m.into();
        MaterialProperty::FloatArray(c.iter().flatten().copied().collect())
    }
}

impl From<Matrix4<f32>> for MaterialProperty {
    fn from(m: Matrix4<f32>) -> Self {
        let c: [[f32; 4]; 4] = m.into();
        MaterialProperty::FloatArray(c.iter().flatten().copied().collect())
    }
}

impl From<Arc<ImageView>> for MaterialProperty {
    fn from(t: Arc<ImageView>) -> Self {
        MaterialProperty::Textures(vec![t])
    }
}

impl From<Arc<Sampler>> for MaterialProperty {
    fn from(s: Arc<Sampler>) -> Self {
        MaterialProperty::Samplers(vec![s])
    }
}

/// One shader stage plus the descriptors it declares, as supplied by
/// the asset pipeline.
#[derive(Clone)]
pub struct MaterialShaderFunction {
    pub function: Arc<ShaderFunction>,
    pub descriptors: Vec<ShaderDescriptor>,
}

#[derive(Clone, Default)]
pub struct MaterialShaderMap {
    pub functions: Vec<MaterialShaderFunction>,
    /// Binding location → engine semantic for buffers and textures.
    pub resource_semantics: HashMap<ShaderBindingLocation, SemanticBinding>,
    /// Vertex input location → attribute semantic.
    pub input_attribute_semantics: HashMap<u32, VertexAttributeSemantic>,
}

impl MaterialShaderMap {
    pub fn function(&self, stage: ShaderStage) -> Option<&Arc<ShaderFunction>> {
        self.functions
            .iter()
            .map(|f| &f.function)
            .find(|f| f.stage() == stage)
    }

    /// Descriptor at a binding location, searched across the stages in
    /// `stages`.
    pub fn descriptor(
        &self,
        location: ShaderBindingLocation,
        stages: ShaderStageFlags,
    ) -> Option<ShaderDescriptor> {
        for fun in self.functions.iter() {
            if !stages.intersects(fun.function.stage().flags()) {
                continue;
            }
            for descriptor in fun.descriptors.iter() {
                if descriptor.set == location.set && descriptor.binding == location.binding {
                    return Some(*descriptor);
                }
            }
        }
        None
    }
}

#[derive(Clone)]
pub struct RenderPassAttachment {
    pub format: PixelFormat,
    pub blend_state: BlendState,
}

pub struct Material {
    pub name: String,
    pub attachments: Vec<RenderPassAttachment>,
    pub depth_format: PixelFormat,
    pub triangle_fill_mode: TriangleFillMode,
    pub cull_mode: CullMode,
    pub front_face: Winding,

    pub properties: HashMap<MaterialSemantic, MaterialProperty>,
    pub user_defined_properties: HashMap<ShaderBindingLocation, MaterialProperty>,

    pub default_texture: Option<Arc<ImageView>>,
    pub default_sampler: Option<Arc<Sampler>>,

    pub shader: MaterialShaderMap,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::new(),
            attachments: vec![RenderPassAttachment {
                format: PixelFormat::RGBA8Unorm,
                blend_state: BlendState::alpha_blend(),
            }],
            depth_format: PixelFormat::Depth24Unorm_stencil8,
            triangle_fill_mode: TriangleFillMode::Fill,
            cull_mode: CullMode::None,
            front_face: Winding::Clockwise,
            properties: HashMap::new(),
            user_defined_properties: HashMap::new(),
            default_texture: None,
            default_sampler: None,
            shader: MaterialShaderMap::default(),
        }
    }
}

impl Material {
    pub fn set_property<P: Into<MaterialProperty>>(&mut self, semantic: MaterialSemantic, value: P) {
        self.properties.insert(semantic, value.into());
    }

    pub fn set_user_property<P: Into<MaterialProperty>>(
        &mut self,
        location: ShaderBindingLocation,
        value: P,
    ) {
        self.user_defined_properties.insert(location, value.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_properties_expose_raw_bytes() {
        let p = MaterialProperty::FloatArray(vec![1.0, 2.0]);
        let (bytes, elem, count) = p.underlying_data().unwrap();
        assert_eq!(elem, 4);
        assert_eq!(count, 2);
        assert_eq!(bytes.len(), 8);
        assert_eq!(&bytes[..4], &1.0f32.to_ne_bytes());

        assert!(MaterialProperty::Textures(Vec::new())
            .underlying_data()
            .is_none());
    }

    #[test]
    fn conversions_flatten_to_floats() {
        let p: MaterialProperty = Vector4::new(1.0, 2.0, 3.0, 4.0).into();
        match p {
            MaterialProperty::FloatArray(v) => assert_eq!(v, vec![1.0, 2.0, 3.0, 4.0]),
            _ => panic!("expected a float array"),
        }

        let m: MaterialProperty = Matrix4::<f32>::from_scale(2.0).into();
        match m {
            MaterialProperty::FloatArray(v) => assert_eq!(v.len(), 16),
            _ => panic!("expected a float array"),
        }
    }
}
