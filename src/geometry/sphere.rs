// Bounding sphere

use cgmath::{InnerSpace, Vector3};

use super::Aabb;

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sphere {
    pub center: Vector3<f32>,
    pub radius: f32,
}

impl Sphere {
    pub fn new(center: Vector3<f32>, radius: f32) -> Self {
        Self { center, radius }
    }

    pub fn is_valid(&self) -> bool {
        self.radius >= 0.0
    }

    pub fn is_point_inside(&self, pt: Vector3<f32>) -> bool {
        (pt - self.center).magnitude2() <= self.radius * self.radius
    }

    pub fn aabb(&self) -> Aabb {
        if !self.is_valid() {
            return Aabb::null();
        }
        let ext = Vector3::new(self.radius, self.radius, self.radius);
        Aabb::new(self.center - ext, self.center + ext)
    }

    /// Ray parameter of the first intersection, zero if the origin is
    /// inside the sphere.
    pub fn ray_test(&self, origin: Vector3<f32>, dir: Vector3<f32>) -> Option<f32> {
        if !self.is_valid() {
            return None;
        }
        let m = origin - self.center;
        let c = m.magnitude2() - self.radius * self.radius;
        if c <= 0.0 {
            return Some(0.0);
        }
        let d2 = dir.magnitude2();
        if d2 == 0.0 {
            return None;
        }
        let b = m.dot(dir);
        if b > 0.0 {
            return None;
        }
        let discr = b * b - d2 * c;
        if discr < 0.0 {
            return None;
        }
        Some((-b - discr.sqrt()) / d2)
    }
}
