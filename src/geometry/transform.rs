// Affine transform on 3D coordinates: a linear part plus a translation.
// Application is `linear * p + translation` (column vectors).

use cgmath::{Matrix3, Matrix4, SquareMatrix, Vector3};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct AffineTransform3 {
    pub linear: Matrix3<f32>,
    pub translation: Vector3<f32>,
}

impl Default for AffineTransform3 {
    fn default() -> Self {
        Self::identity()
    }
}

impl AffineTransform3 {
    pub fn identity() -> Self {
        Self {
            linear: Matrix3::identity(),
            translation: Vector3::new(0.0, 0.0, 0.0),
        }
    }

    pub fn new(linear: Matrix3<f32>, translation: Vector3<f32>) -> Self {
        Self {
            linear,
            translation,
        }
    }

    pub fn scaled(&self, scale: Vector3<f32>) -> Self {
        let s = Matrix3::from_diagonal(scale);
        Self {
            linear: s * self.linear,
            translation: s * self.translation,
        }
    }

    pub fn translated(&self, offset: Vector3<f32>) -> Self {
        Self {
            linear: self.linear,
            translation: self.translation + offset,
        }
    }

    /// Inverse transform. A singular linear part falls back to the
    /// identity rotation, which only happens on degenerate inputs the
    /// caller already filtered (zero extents are substituted with 1).
    pub fn inverted(&self) -> Self {
        let inv = self.linear.invert().unwrap_or_else(Matrix3::identity);
        Self {
            linear: inv,
            translation: -(inv * self.translation),
        }
    }

    /// self followed by rhs.
    pub fn concatenating(&self, rhs: &AffineTransform3) -> Self {
        Self {
            linear: rhs.linear * self.linear,
            translation: rhs.linear * self.translation + rhs.translation,
        }
    }

    pub fn apply(&self, p: Vector3<f32>) -> Vector3<f32> {
        self.linear * p + self.translation
    }

    /// The linear part only, for direction vectors.
    pub fn apply_direction(&self, d: Vector3<f32>) -> Vector3<f32> {
        self.linear * d
    }

    pub fn matrix4(&self) -> Matrix4<f32> {
        let m = &self.linear;
        let t = self.translation;
        Matrix4::new(
            m.x.x, m.x.y, m.x.z, 0.0, //
            m.y.x, m.y.y, m.y.z, 0.0, //
            m.z.x, m.z.y, m.z.z, 0.0, //
            t.x, t.y, t.z, 1.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::InnerSpace;

    #[test]
    fn double_inversion_is_identity() {
        let t = AffineTransform3::identity()
            .scaled(Vector3::new(2.0, 4.0, 0.5))
            .translated(Vector3::new(-3.0, 7.0, 1.0));
        let back = t.inverted().inverted();

        let p = Vector3::new(1.5, -2.0, 8.0);
        assert!((t.apply(p) - back.apply(p)).magnitude() < 1e-4);
    }

    #[test]
    fn inverse_round_trips_points() {
        let t = AffineTransform3::identity()
            .scaled(Vector3::new(3.0, 1.0, 2.0))
            .translated(Vector3::new(10.0, 0.0, -5.0));
        let inv = t.inverted();
        let p = Vector3::new(0.25, 0.75, 0.5);
        assert!((inv.apply(t.apply(p)) - p).magnitude() < 1e-5);
    }
}
