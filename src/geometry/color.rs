// Colors: packed 8-bit RGBA and float components

/// Packed byte color, the layout used by voxels and flat octree nodes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Rgba8 {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Rgba8 {
    pub fn new(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    pub fn value(&self) -> u32 {
        u32::from_le_bytes([self.r, self.g, self.b, self.a])
    }

    pub fn from_value(value: u32) -> Self {
        let [r, g, b, a] = value.to_le_bytes();
        Self { r, g, b, a }
    }
}

impl From<Color> for Rgba8 {
    fn from(c: Color) -> Self {
        let q = |v: f32| (v.max(0.0).min(1.0) * 255.0 + 0.5) as u8;
        Rgba8::new(q(c.r), q(c.g), q(c.b), q(c.a))
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct Color {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl Color {
    pub fn new(r: f32, g: f32, b: f32, a: f32) -> Self {
        Self { r, g, b, a }
    }

    pub fn black() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }

    pub fn white() -> Self {
        Self::new(1.0, 1.0, 1.0, 1.0)
    }

    pub fn transparent() -> Self {
        Self::new(0.0, 0.0, 0.0, 0.0)
    }
}

impl From<Rgba8> for Color {
    fn from(c: Rgba8) -> Self {
        let f = |v: u8| v as f32 / 255.0;
        Color::new(f(c.r), f(c.g), f(c.b), f(c.a))
    }
}
