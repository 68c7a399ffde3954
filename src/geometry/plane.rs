// Plane in constant-normal form: normal . x + d = 0

use cgmath::{InnerSpace, Vector3};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Plane {
    pub normal: Vector3<f32>,
    pub d: f32,
}

impl Plane {
    pub fn new(normal: Vector3<f32>, d: f32) -> Self {
        Self { normal, d }
    }

    /// Plane through three points, normal following the winding.
    pub fn from_points(p0: Vector3<f32>, p1: Vector3<f32>, p2: Vector3<f32>) -> Self {
        let n = (p1 - p0).cross(p2 - p0);
        Self {
            normal: n,
            d: -n.dot(p0),
        }
    }

    /// Signed distance scaled by the normal's magnitude.
    pub fn dot(&self, v: Vector3<f32>) -> f32 {
        self.normal.dot(v) + self.d
    }
}
