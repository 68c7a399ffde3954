// Engine-facing enums for formats and fixed-function state, plus their
// translations to the Vulkan equivalents.

use ash::vk;

#[allow(non_camel_case_types)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Invalid,
    // 8 bit
    R8Unorm,
    R8Snorm,
    R8Uint,
    R8Sint,
    R8Unorm_srgb,
    // 16 bit
    R16Unorm,
    R16Snorm,
    R16Uint,
    R16Sint,
    R16Float,
    RG8Unorm,
    RG8Snorm,
    RG8Uint,
    RG8Sint,
    RG8Unorm_srgb,
    // 32 bit
    R32Uint,
    R32Sint,
    R32Float,
    RG16Unorm,
    RG16Snorm,
    RG16Uint,
    RG16Sint,
    RG16Float,
    RGBA8Unorm,
    RGBA8Unorm_srgb,
    RGBA8Snorm,
    RGBA8Uint,
    RGBA8Sint,
    BGRA8Unorm,
    BGRA8Unorm_srgb,
    // packed 32 bit
    RGB10A2Unorm,
    RGB10A2Uint,
    RG11B10Float,
    RGB9E5Float,
    // 64 bit
    RG32Uint,
    RG32Sint,
    RG32Float,
    RGBA16Unorm,
    RGBA16Snorm,
    RGBA16Uint,
    RGBA16Sint,
    RGBA16Float,
    // 128 bit
    RGBA32Uint,
    RGBA32Sint,
    RGBA32Float,
    // depth/stencil
    Depth32Float,
    Stencil8,
    Depth24Unorm_stencil8,
    Depth32Float_stencil8,
}

impl PixelFormat {
    /// Total bytes per pixel, in [1, 16].
    pub fn bytes_per_pixel(self) -> u32 {
        use PixelFormat::*;
        match self {
            Invalid => 0,
            R8Unorm | R8Snorm | R8Uint | R8Sint | R8Unorm_srgb | Stencil8 => 1,
            R16Unorm | R16Snorm | R16Uint | R16Sint | R16Float | RG8Unorm | RG8Snorm
            | RG8Uint | RG8Sint | RG8Unorm_srgb => 2,
            R32Uint | R32Sint | R32Float | RG16Unorm | RG16Snorm | RG16Uint | RG16Sint
            | RG16Float | RGBA8Unorm | RGBA8Unorm_srgb | RGBA8Snorm | RGBA8Uint | RGBA8Sint
            | BGRA8Unorm | BGRA8Unorm_srgb | RGB10A2Unorm | RGB10A2Uint | RG11B10Float
            | RGB9E5Float | Depth32Float | Depth24Unorm_stencil8 => 4,
            Depth32Float_stencil8 => 5,
            RG32Uint | RG32Sint | RG32Float | RGBA16Unorm | RGBA16Snorm | RGBA16Uint
            | RGBA16Sint | RGBA16Float => 8,
            RGBA32Uint | RGBA32Sint | RGBA32Float => 16,
        }
    }

    pub fn is_color_format(self) -> bool {
        !matches!(
            self,
            PixelFormat::Invalid
                | PixelFormat::Depth32Float
                | PixelFormat::Stencil8
                | PixelFormat::Depth24Unorm_stencil8
                | PixelFormat::Depth32Float_stencil8
        )
    }

    /// True for every format with a depth aspect, including the
    /// combined depth-stencil formats.
    pub fn is_depth_format(self) -> bool {
        matches!(
            self,
            PixelFormat::Depth32Float
                | PixelFormat::Depth24Unorm_stencil8
                | PixelFormat::Depth32Float_stencil8
        )
    }

    /// True for every format with a stencil aspect, including the
    /// combined depth-stencil formats.
    pub fn is_stencil_format(self) -> bool {
        matches!(
            self,
            PixelFormat::Stencil8
                | PixelFormat::Depth24Unorm_stencil8
                | PixelFormat::Depth32Float_stencil8
        )
    }

    pub fn to_vk(self) -> vk::Format {
        use PixelFormat::*;
        match self {
            Invalid => vk::Format::UNDEFINED,
            R8Unorm => vk::Format::R8_UNORM,
            R8Snorm => vk::Format::R8_SNORM,
            R8Uint => vk::Format::R8_UINT,
            R8Sint => vk::Format::R8_SINT,
            R8Unorm_srgb => vk::Format::R8_SRGB,
            R16Unorm => vk::Format::R16_UNORM,
            R16Snorm => vk::Format::R16_SNORM,
            R16Uint => vk::Format::R16_UINT,
            R16Sint => vk::Format::R16_SINT,
            R16Float => vk::Format::R16_SFLOAT,
            RG8Unorm => vk::Format::R8G8_UNORM,
            RG8Snorm => vk::Format::R8G8_SNORM,
            RG8Uint => vk::Format::R8G8_UINT,
            RG8Sint => vk::Format::R8G8_SINT,
            RG8Unorm_srgb => vk::Format::R8G8_SRGB,
            R32Uint => vk::Format::R32_UINT,
            R32Sint => vk::Format::R32_SINT,
            R32Float => vk::Format::R32_SFLOAT,
            RG16Unorm => vk::Format::R16G16_UNORM,
            RG16Snorm => vk::Format::R16G16_SNORM,
            RG16Uint => vk::Format::R16G16_UINT,
            RG16Sint => vk::Format::R16G16_SINT,
            RG16Float => vk::Format::R16G16_SFLOAT,
            RGBA8Unorm => vk::Format::R8G8B8A8_UNORM,
            RGBA8Unorm_srgb => vk::Format::R8G8B8A8_SRGB,
            RGBA8Snorm => vk::Format::R8G8B8A8_SNORM,
            RGBA8Uint => vk::Format::R8G8B8A8_UINT,
            RGBA8Sint => vk::Format::R8G8B8A8_SINT,
            BGRA8Unorm => vk::Format::B8G8R8A8_UNORM,
            BGRA8Unorm_srgb => vk::Format::B8G8R8A8_SRGB,
            RGB10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
            RGB10A2Uint => vk::Format::A2B10G10R10_UINT_PACK32,
            RG11B10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
            RGB9E5Float => vk::Format::E5B9G9R9_UFLOAT_PACK32,
            RG32Uint => vk::Format::R32G32_UINT,
            RG32Sint => vk::Format::R32G32_SINT,
            RG32Float => vk::Format::R32G32_SFLOAT,
            RGBA16Unorm => vk::Format::R16G16B16A16_UNORM,
            RGBA16Snorm => vk::Format::R16G16B16A16_SNORM,
            RGBA16Uint => vk::Format::R16G16B16A16_UINT,
            RGBA16Sint => vk::Format::R16G16B16A16_SINT,
            RGBA16Float => vk::Format::R16G16B16A16_SFLOAT,
            RGBA32Uint => vk::Format::R32G32B32A32_UINT,
            RGBA32Sint => vk::Format::R32G32B32A32_SINT,
            RGBA32Float => vk::Format::R32G32B32A32_SFLOAT,
            Depth32Float => vk::Format::D32_SFLOAT,
            Stencil8 => vk::Format::S8_UINT,
            Depth24Unorm_stencil8 => vk::Format::D24_UNORM_S8_UINT,
            Depth32Float_stencil8 => vk::Format::D32_SFLOAT_S8_UINT,
        }
    }

    pub fn from_vk(format: vk::Format) -> PixelFormat {
        use PixelFormat::*;
        match format {
            vk::Format::R8_UNORM => R8Unorm,
            vk::Format::R8_SNORM => R8Snorm,
            vk::Format::R8_UINT => R8Uint,
            vk::Format::R8_SINT => R8Sint,
            vk::Format::R8_SRGB => R8Unorm_srgb,
            vk::Format::R16_UNORM => R16Unorm,
            vk::Format::R16_SNORM => R16Snorm,
            vk::Format::R16_UINT => R16Uint,
            vk::Format::R16_SINT => R16Sint,
            vk::Format::R16_SFLOAT => R16Float,
            vk::Format::R8G8_UNORM => RG8Unorm,
            vk::Format::R8G8_SNORM => RG8Snorm,
            vk::Format::R8G8_UINT => RG8Uint,
            vk::Format::R8G8_SINT => RG8Sint,
            vk::Format::R8G8_SRGB => RG8Unorm_srgb,
            vk::Format::R32_UINT => R32Uint,
            vk::Format::R32_SINT => R32Sint,
            vk::Format::R32_SFLOAT => R32Float,
            vk::Format::R16G16_UNORM => RG16Unorm,
            vk::Format::R16G16_SNORM => RG16Snorm,
            vk::Format::R16G16_UINT => RG16Uint,
            vk::Format::R16G16_SINT => RG16Sint,
            vk::Format::R16G16_SFLOAT => RG16Float,
            vk::Format::R8G8B8A8_UNORM => RGBA8Unorm,
            vk::Format::R8G8B8A8_SRGB => RGBA8Unorm_srgb,
            vk::Format::R8G8B8A8_SNORM => RGBA8Snorm,
            vk::Format::R8G8B8A8_UINT => RGBA8Uint,
            vk::Format::R8G8B8A8_SINT => RGBA8Sint,
            vk::Format::B8G8R8A8_UNORM => BGRA8Unorm,
            vk::Format::B8G8R8A8_SRGB => BGRA8Unorm_srgb,
            vk::Format::A2B10G10R10_UNORM_PACK32 => RGB10A2Unorm,
            vk::Format::A2B10G10R10_UINT_PACK32 => RGB10A2Uint,
            vk::Format::B10G11R11_UFLOAT_PACK32 => RG11B10Float,
            vk::Format::E5B9G9R9_UFLOAT_PACK32 => RGB9E5Float,
            vk::Format::R32G32_UINT => RG32Uint,
            vk::Format::R32G32_SINT => RG32Sint,
            vk::Format::R32G32_SFLOAT => RG32Float,
            vk::Format::R16G16B16A16_UNORM => RGBA16Unorm,
            vk::Format::R16G16B16A16_SNORM => RGBA16Snorm,
            vk::Format::R16G16B16A16_UINT => RGBA16Uint,
            vk::Format::R16G16B16A16_SINT => RGBA16Sint,
            vk::Format::R16G16B16A16_SFLOAT => RGBA16Float,
            vk::Format::R32G32B32A32_UINT => RGBA32Uint,
            vk::Format::R32G32B32A32_SINT => RGBA32Sint,
            vk::Format::R32G32B32A32_SFLOAT => RGBA32Float,
            vk::Format::D32_SFLOAT => Depth32Float,
            vk::Format::S8_UINT => Stencil8,
            vk::Format::D24_UNORM_S8_UINT => Depth24Unorm_stencil8,
            vk::Format::D32_SFLOAT_S8_UINT => Depth32Float_stencil8,
            _ => Invalid,
        }
    }

    pub fn all_formats() -> &'static [PixelFormat] {
        use PixelFormat::*;
        &[
            R8Unorm,
            R8Snorm,
            R8Uint,
            R8Sint,
            R8Unorm_srgb,
            R16Unorm,
            R16Snorm,
            R16Uint,
            R16Sint,
            R16Float,
            RG8Unorm,
            RG8Snorm,
            RG8Uint,
            RG8Sint,
            RG8Unorm_srgb,
            R32Uint,
            R32Sint,
            R32Float,
            RG16Unorm,
            RG16Snorm,
            RG16Uint,
            RG16Sint,
            RG16Float,
            RGBA8Unorm,
            RGBA8Unorm_srgb,
            RGBA8Snorm,
            RGBA8Uint,
            RGBA8Sint,
            BGRA8Unorm,
            BGRA8Unorm_srgb,
            RGB10A2Unorm,
            RGB10A2Uint,
            RG11B10Float,
            RGB9E5Float,
            RG32Uint,
            RG32Sint,
            RG32Float,
            RGBA16Unorm,
            RGBA16Snorm,
            RGBA16Uint,
            RGBA16Sint,
            RGBA16Float,
            RGBA32Uint,
            RGBA32Sint,
            RGBA32Float,
            Depth32Float,
            Stencil8,
            Depth24Unorm_stencil8,
            Depth32Float_stencil8,
        ]
    }
}

/// Per-vertex attribute data layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VertexFormat {
    Invalid,
    UChar2,
    UChar4,
    Char2,
    Char4,
    UChar2Normalized,
    UChar4Normalized,
    Char2Normalized,
    Char4Normalized,
    UShort2,
    UShort4,
    Short2,
    Short4,
    UShort2Normalized,
    UShort4Normalized,
    Short2Normalized,
    Short4Normalized,
    Half2,
    Half4,
    Float,
    Float2,
    Float3,
    Float4,
    Int,
    Int2,
    Int3,
    Int4,
    UInt,
    UInt2,
    UInt3,
    UInt4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        use VertexFormat::*;
        match self {
            Invalid => 0,
            UChar2 | Char2 | UChar2Normalized | Char2Normalized => 2,
            UChar4 | Char4 | UChar4Normalized | Char4Normalized | UShort2 | Short2
            | UShort2Normalized | Short2Normalized | Half2 | Float | Int | UInt => 4,
            UShort4 | Short4 | UShort4Normalized | Short4Normalized | Half4 | Float2 | Int2
            | UInt2 => 8,
            Float3 | Int3 | UInt3 => 12,
            Float4 | Int4 | UInt4 => 16,
        }
    }

    pub fn to_vk(self) -> vk::Format {
        use VertexFormat::*;
        match self {
            Invalid => vk::Format::UNDEFINED,
            UChar2 => vk::Format::R8G8_UINT,
            UChar4 => vk::Format::R8G8B8A8_UINT,
            Char2 => vk::Format::R8G8_SINT,
            Char4 => vk::Format::R8G8B8A8_SINT,
            UChar2Normalized => vk::Format::R8G8_UNORM,
            UChar4Normalized => vk::Format::R8G8B8A8_UNORM,
            Char2Normalized => vk::Format::R8G8_SNORM,
            Char4Normalized => vk::Format::R8G8B8A8_SNORM,
            UShort2 => vk::Format::R16G16_UINT,
            UShort4 => vk::Format::R16G16B16A16_UINT,
            Short2 => vk::Format::R16G16_SINT,
            Short4 => vk::Format::R16G16B16A16_SINT,
            UShort2Normalized => vk::Format::R16G16_UNORM,
            UShort4Normalized => vk::Format::R16G16B16A16_UNORM,
            Short2Normalized => vk::Format::R16G16_SNORM,
            Short4Normalized => vk::Format::R16G16B16A16_SNORM,
            Half2 => vk::Format::R16G16_SFLOAT,
            Half4 => vk::Format::R16G16B16A16_SFLOAT,
            Float => vk::Format::R32_SFLOAT,
            Float2 => vk::Format::R32G32_SFLOAT,
            Float3 => vk::Format::R32G32B32_SFLOAT,
            Float4 => vk::Format::R32G32B32A32_SFLOAT,
            Int => vk::Format::R32_SINT,
            Int2 => vk::Format::R32G32_SINT,
            Int3 => vk::Format::R32G32B32_SINT,
            Int4 => vk::Format::R32G32B32A32_SINT,
            UInt => vk::Format::R32_UINT,
            UInt2 => vk::Format::R32G32_UINT,
            UInt3 => vk::Format::R32G32B32_UINT,
            UInt4 => vk::Format::R32G32B32A32_UINT,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexType {
    UInt16,
    UInt32,
}

impl IndexType {
    pub fn to_vk(self) -> vk::IndexType {
        match self {
            IndexType::UInt16 => vk::IndexType::UINT16,
            IndexType::UInt32 => vk::IndexType::UINT32,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PrimitiveType {
    Point,
    Line,
    LineStrip,
    Triangle,
    TriangleStrip,
}

impl PrimitiveType {
    pub fn to_vk(self) -> vk::PrimitiveTopology {
        match self {
            PrimitiveType::Point => vk::PrimitiveTopology::POINT_LIST,
            PrimitiveType::Line => vk::PrimitiveTopology::LINE_LIST,
            PrimitiveType::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
            PrimitiveType::Triangle => vk::PrimitiveTopology::TRIANGLE_LIST,
            PrimitiveType::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VertexStepRate {
    Vertex,
    Instance,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

impl CullMode {
    pub fn to_vk(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Winding {
    Clockwise,
    CounterClockwise,
}

impl Winding {
    pub fn to_vk(self) -> vk::FrontFace {
        match self {
            Winding::Clockwise => vk::FrontFace::CLOCKWISE,
            Winding::CounterClockwise => vk::FrontFace::COUNTER_CLOCKWISE,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TriangleFillMode {
    Fill,
    Lines,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DepthClipMode {
    Clip,
    Clamp,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunction {
    pub fn to_vk(self) -> vk::CompareOp {
        match self {
            CompareFunction::Never => vk::CompareOp::NEVER,
            CompareFunction::Less => vk::CompareOp::LESS,
            CompareFunction::Equal => vk::CompareOp::EQUAL,
            CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
            CompareFunction::Greater => vk::CompareOp::GREATER,
            CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
            CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
            CompareFunction::Always => vk::CompareOp::ALWAYS,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StencilOperation {
    Keep,
    Zero,
    Replace,
    IncrementClamp,
    DecrementClamp,
    Invert,
    IncrementWrap,
    DecrementWrap,
}

impl StencilOperation {
    pub fn to_vk(self) -> vk::StencilOp {
        match self {
            StencilOperation::Keep => vk::StencilOp::KEEP,
            StencilOperation::Zero => vk::StencilOp::ZERO,
            StencilOperation::Replace => vk::StencilOp::REPLACE,
            StencilOperation::IncrementClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
            StencilOperation::DecrementClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
            StencilOperation::Invert => vk::StencilOp::INVERT,
            StencilOperation::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
            StencilOperation::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendFactor {
    Zero,
    One,
    SourceColor,
    OneMinusSourceColor,
    SourceAlpha,
    OneMinusSourceAlpha,
    DestinationColor,
    OneMinusDestinationColor,
    DestinationAlpha,
    OneMinusDestinationAlpha,
    SourceAlphaSaturated,
    BlendColor,
    OneMinusBlendColor,
    BlendAlpha,
    OneMinusBlendAlpha,
}

impl BlendFactor {
    pub fn to_vk(self) -> vk::BlendFactor {
        use BlendFactor::*;
        match self {
            Zero => vk::BlendFactor::ZERO,
            One => vk::BlendFactor::ONE,
            SourceColor => vk::BlendFactor::SRC_COLOR,
            OneMinusSourceColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            SourceAlpha => vk::BlendFactor::SRC_ALPHA,
            OneMinusSourceAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            DestinationColor => vk::BlendFactor::DST_COLOR,
            OneMinusDestinationColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            DestinationAlpha => vk::BlendFactor::DST_ALPHA,
            OneMinusDestinationAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            SourceAlphaSaturated => vk::BlendFactor::SRC_ALPHA_SATURATE,
            BlendColor => vk::BlendFactor::CONSTANT_COLOR,
            OneMinusBlendColor => vk::BlendFactor::ONE_MINUS_CONSTANT_COLOR,
            BlendAlpha => vk::BlendFactor::CONSTANT_ALPHA,
            OneMinusBlendAlpha => vk::BlendFactor::ONE_MINUS_CONSTANT_ALPHA,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOperation {
    pub fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOperation::Add => vk::BlendOp::ADD,
            BlendOperation::Subtract => vk::BlendOp::SUBTRACT,
            BlendOperation::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOperation::Min => vk::BlendOp::MIN,
            BlendOperation::Max => vk::BlendOp::MAX,
        }
    }
}

bitflags::bitflags! {
    pub struct ColorWriteMask: u32 {
        const RED = 1;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = Self::RED.bits | Self::GREEN.bits | Self::BLUE.bits | Self::ALPHA.bits;
    }
}

impl ColorWriteMask {
    pub fn to_vk(self) -> vk::ColorComponentFlags {
        let mut flags = vk::ColorComponentFlags::empty();
        if self.contains(ColorWriteMask::RED) {
            flags |= vk::ColorComponentFlags::R;
        }
        if self.contains(ColorWriteMask::GREEN) {
            flags |= vk::ColorComponentFlags::G;
        }
        if self.contains(ColorWriteMask::BLUE) {
            flags |= vk::ColorComponentFlags::B;
        }
        if self.contains(ColorWriteMask::ALPHA) {
            flags |= vk::ColorComponentFlags::A;
        }
        flags
    }
}

/// Per-attachment blending description.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BlendState {
    pub enabled: bool,
    pub source_rgb_blend_factor: BlendFactor,
    pub source_alpha_blend_factor: BlendFactor,
    pub destination_rgb_blend_factor: BlendFactor,
    pub destination_alpha_blend_factor: BlendFactor,
    pub rgb_blend_operation: BlendOperation,
    pub alpha_blend_operation: BlendOperation,
    pub write_mask: ColorWriteMask,
}

impl BlendState {
    pub fn opaque() -> Self {
        Self {
            enabled: false,
            source_rgb_blend_factor: BlendFactor::One,
            source_alpha_blend_factor: BlendFactor::One,
            destination_rgb_blend_factor: BlendFactor::Zero,
            destination_alpha_blend_factor: BlendFactor::Zero,
            rgb_blend_operation: BlendOperation::Add,
            alpha_blend_operation: BlendOperation::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }

    pub fn alpha_blend() -> Self {
        Self {
            enabled: true,
            source_rgb_blend_factor: BlendFactor::SourceAlpha,
            source_alpha_blend_factor: BlendFactor::One,
            destination_rgb_blend_factor: BlendFactor::OneMinusSourceAlpha,
            destination_alpha_blend_factor: BlendFactor::OneMinusSourceAlpha,
            rgb_blend_operation: BlendOperation::Add,
            alpha_blend_operation: BlendOperation::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }
}

impl Default for BlendState {
    fn default() -> Self {
        Self::opaque()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadAction {
    DontCare,
    Load,
    Clear,
}

impl LoadAction {
    pub fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            LoadAction::DontCare => vk::AttachmentLoadOp::DONT_CARE,
            LoadAction::Load => vk::AttachmentLoadOp::LOAD,
            LoadAction::Clear => vk::AttachmentLoadOp::CLEAR,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreAction {
    DontCare,
    Store,
}

impl StoreAction {
    pub fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            StoreAction::DontCare => vk::AttachmentStoreOp::DONT_CARE,
            StoreAction::Store => vk::AttachmentStoreOp::STORE,
        }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub near_z: f32,
    pub far_z: f32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_format_has_a_positive_byte_size() {
        for &format in PixelFormat::all_formats() {
            let size = format.bytes_per_pixel();
            assert!(size >= 1 && size <= 16, "{:?} -> {}", format, size);
        }
    }

    #[test]
    fn vk_conversion_roundtrips() {
        for &format in PixelFormat::all_formats() {
            assert_eq!(PixelFormat::from_vk(format.to_vk()), format);
        }
    }

    #[test]
    fn combined_formats_have_both_aspects() {
        for format in [
            PixelFormat::Depth24Unorm_stencil8,
            PixelFormat::Depth32Float_stencil8,
        ] {
            assert!(format.is_depth_format());
            assert!(format.is_stencil_format());
            assert!(!format.is_color_format());
        }
        assert!(PixelFormat::Depth32Float.is_depth_format());
        assert!(!PixelFormat::Depth32Float.is_stencil_format());
        assert!(PixelFormat::Stencil8.is_stencil_format());
        assert!(!PixelFormat::Stencil8.is_depth_format());
        assert!(PixelFormat::RGBA8Unorm.is_color_format());
    }
}
