// View and projection transforms feeding the shader uniform semantics.
//
// Right-handed by default: the camera looks down -Z in view space.
// Projections map onto Vulkan's [0, 1] clip-space depth range.

use cgmath::{InnerSpace, Matrix, Matrix3, Matrix4, SquareMatrix, Vector3};

/// Rigid camera transform: rotation plus translation.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ViewTransform {
    pub matrix: Matrix3<f32>,
    pub t: Vector3<f32>,
}

impl Default for ViewTransform {
    fn default() -> Self {
        Self {
            matrix: Matrix3::identity(),
            t: Vector3::new(0.0, 0.0, 0.0),
        }
    }
}

impl ViewTransform {
    pub fn new(matrix: Matrix3<f32>, t: Vector3<f32>) -> Self {
        Self { matrix, t }
    }

    /// Look-at constructor. `dir` points at the target.
    pub fn look_at(pos: Vector3<f32>, dir: Vector3<f32>, up: Vector3<f32>) -> Self {
        debug_assert!(dir.magnitude2() > 0.0);
        debug_assert!(up.magnitude2() > 0.0);

        let axis_z = -dir.normalize();
        let axis_x = up.cross(axis_z).normalize();
        let axis_y = axis_z.cross(axis_x).normalize();

        // rotation with the camera axes as rows
        let matrix = Matrix3::from_cols(axis_x, axis_y, axis_z).transpose();
        let t = Vector3::new(-axis_x.dot(pos), -axis_y.dot(pos), -axis_z.dot(pos));
        Self { matrix, t }
    }

    pub fn matrix3(&self) -> Matrix3<f32> {
        self.matrix
    }

    pub fn matrix4(&self) -> Matrix4<f32> {
        let m = &self.matrix;
        Matrix4::new(
            m.x.x, m.x.y, m.x.z, 0.0, //
            m.y.x, m.y.y, m.y.z, 0.0, //
            m.z.x, m.z.y, m.z.z, 0.0, //
            self.t.x, self.t.y, self.t.z, 1.0,
        )
    }

    pub fn direction(&self) -> Vector3<f32> {
        // third row of the rotation is the view-space Z axis
        (-Vector3::new(self.matrix.x.z, self.matrix.y.z, self.matrix.z.z)).normalize()
    }

    pub fn position(&self) -> Vector3<f32> {
        let inv = self.matrix.invert().unwrap_or_else(Matrix3::identity);
        inv * -self.t
    }
}

/// Projective transform; `matrix[3][3] == 0` marks a perspective one.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ProjectionTransform {
    pub matrix: Matrix4<f32>,
}

impl ProjectionTransform {
    pub fn new(matrix: Matrix4<f32>) -> Self {
        Self { matrix }
    }

    pub fn is_perspective(&self) -> bool {
        self.matrix.w.w == 0.0
    }

    pub fn perspective(fov: f32, aspect: f32, near_z: f32, far_z: f32) -> Self {
        Self::perspective_rh(fov, aspect, near_z, far_z)
    }

    pub fn perspective_rh(fov: f32, aspect: f32, near_z: f32, far_z: f32) -> Self {
        debug_assert!(aspect > 0.0);
        debug_assert!(fov > 0.0);
        debug_assert!(near_z > 0.0);
        debug_assert!(far_z > near_z);

        let f = 1.0 / (fov * 0.5).tan();
        Self {
            matrix: Matrix4::new(
                f / aspect, 0.0, 0.0, 0.0, //
                0.0, f, 0.0, 0.0, //
                0.0, 0.0, far_z / (near_z - far_z), -1.0, //
                0.0, 0.0, -(far_z * near_z) / (far_z - near_z), 0.0,
            ),
        }
    }

    pub fn perspective_lh(fov: f32, aspect: f32, near_z: f32, far_z: f32) -> Self {
        debug_assert!(aspect > 0.0);
        debug_assert!(fov > 0.0);
        debug_assert!(near_z > 0.0);
        debug_assert!(far_z > near_z);

        let f = 1.0 / (fov * 0.5).tan();
        Self {
            matrix: Matrix4::new(
                f / aspect, 0.0, 0.0, 0.0, //
                0.0, f, 0.0, 0.0, //
                0.0, 0.0, far_z / (far_z - near_z), 1.0, //
                0.0, 0.0, -(far_z * near_z) / (far_z - near_z), 0.0,
            ),
        }
    }

    pub fn orthographic(width: f32, height: f32, near_z: f32, far_z: f32) -> Self {
        Self::orthographic_rh(
            width * -0.5,
            width * 0.5,
            height * -0.5,
            height * 0.5,
            near_z,
            far_z,
        )
    }

    pub fn orthographic_rh(
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near_z: f32,
        far_z: f32,
    ) -> Self {
        Self {
            matrix: Matrix4::new(
                2.0 / (right - left), 0.0, 0.0, 0.0, //
                0.0, 2.0 / (top - bottom), 0.0, 0.0, //
                0.0, 0.0, 1.0 / (near_z - far_z), 0.0, //
                -(right + left) / (right - left),
                -(top + bottom) / (top - bottom),
                -near_z / (near_z - far_z),
                1.0,
            ),
        }
    }

    pub fn orthographic_lh(
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near_z: f32,
        far_z: f32,
    ) -> Self {
        Self {
            matrix: Matrix4::new(
                2.0 / (right - left), 0.0, 0.0, 0.0, //
                0.0, 2.0 / (top - bottom), 0.0, 0.0, //
                0.0, 0.0, 1.0 / (far_z - near_z), 0.0, //
                -(right + left) / (right - left),
                -(top + bottom) / (top - bottom),
                -near_z / (far_z - near_z),
                1.0,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cgmath::Transform as _;

    #[test]
    fn look_at_maps_target_onto_negative_z() {
        let view = ViewTransform::look_at(
            Vector3::new(0.0, 0.0, 5.0),
            Vector3::new(0.0, 0.0, -1.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let m = view.matrix4();
        let p = m.transform_point(cgmath::Point3::new(0.0, 0.0, 0.0));
        assert!((p.x).abs() < 1e-6);
        assert!((p.y).abs() < 1e-6);
        assert!((p.z - -5.0).abs() < 1e-6);
        assert!((view.position() - Vector3::new(0.0, 0.0, 5.0)).magnitude() < 1e-5);
    }

    #[test]
    fn perspective_marks_itself() {
        let p = ProjectionTransform::perspective(1.0, 1.5, 0.1, 100.0);
        assert!(p.is_perspective());
        let o = ProjectionTransform::orthographic(10.0, 10.0, 0.1, 100.0);
        assert!(!o.is_perspective());
    }

    #[test]
    fn perspective_depth_range() {
        let p = ProjectionTransform::perspective(1.2, 1.0, 1.0, 10.0);
        let near = p.matrix.transform_point(cgmath::Point3::new(0.0, 0.0, -1.0));
        let far = p.matrix.transform_point(cgmath::Point3::new(0.0, 0.0, -10.0));
        assert!(near.z.abs() < 1e-5);
        assert!((far.z - 1.0).abs() < 1e-5);
    }
}
