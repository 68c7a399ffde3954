// Geometry primitives used by the spatial indices and the renderer.
//
// Vectors, matrices and quaternions come from cgmath; this module only
// adds the types cgmath does not have. All matrix math is column-major
// with column vectors, right-handed unless a constructor says otherwise.

mod aabb;
mod color;
mod float16;
mod plane;
mod sphere;
mod transform;
mod triangle;
mod viewproj;

pub use aabb::Aabb;
pub use color::{Color, Rgba8};
pub use float16::Float16;
pub use plane::Plane;
pub use sphere::Sphere;
pub use transform::AffineTransform3;
pub use triangle::{LineSegment, RayTestResult, Triangle};
pub use viewproj::{ProjectionTransform, ViewTransform};

#[cfg(test)]
mod tests {
    use cgmath::{InnerSpace, Quaternion, Rad, Rotation3, Vector3};

    fn close(a: Quaternion<f32>, b: Quaternion<f32>) -> bool {
        // q and -q are the same rotation
        (a - b).magnitude() < 1e-5 || (a + b).magnitude() < 1e-5
    }

    #[test]
    fn slerp_endpoints_and_identity() {
        let a = Quaternion::from_axis_angle(Vector3::unit_y(), Rad(0.3));
        let b = Quaternion::from_axis_angle(Vector3::unit_x(), Rad(1.2));

        assert!(close(a.slerp(a, 0.5), a));
        assert!(close(a.slerp(b, 0.0), a));
        assert!(close(a.slerp(b, 1.0), b));
    }
}
