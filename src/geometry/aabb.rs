// Axis-aligned bounding boxes
//
// The null box (min > max on every axis) doubles as the "empty" value:
// expanding a null box by a point yields a degenerate box at that point.

use cgmath::{InnerSpace, Vector3};

use super::{Plane, Triangle};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Aabb {
    pub min: Vector3<f32>,
    pub max: Vector3<f32>,
}

impl Default for Aabb {
    fn default() -> Self {
        Self::null()
    }
}

impl Aabb {
    pub fn new(min: Vector3<f32>, max: Vector3<f32>) -> Self {
        Self { min, max }
    }

    /// The empty box. Any test against it misses and any union with it
    /// is a no-op.
    pub fn null() -> Self {
        Self {
            min: Vector3::new(f32::MAX, f32::MAX, f32::MAX),
            max: Vector3::new(-f32::MAX, -f32::MAX, -f32::MAX),
        }
    }

    pub fn is_null(&self) -> bool {
        self.max.x < self.min.x || self.max.y < self.min.y || self.max.z < self.min.z
    }

    pub fn is_point_inside(&self, pt: Vector3<f32>) -> bool {
        pt.x >= self.min.x
            && pt.x <= self.max.x
            && pt.y >= self.min.y
            && pt.y <= self.max.y
            && pt.z >= self.min.z
            && pt.z <= self.max.z
    }

    pub fn expand(&mut self, point: Vector3<f32>) -> &mut Self {
        if self.is_null() {
            self.min = point;
            self.max = point;
        } else {
            self.min = vmin(self.min, point);
            self.max = vmax(self.max, point);
        }
        self
    }

    pub fn expand_points(&mut self, pts: &[Vector3<f32>]) -> &mut Self {
        for p in pts {
            self.expand(*p);
        }
        self
    }

    pub fn intersection(&self, other: &Aabb) -> Aabb {
        if self.is_null() || other.is_null() {
            return Aabb::null();
        }
        Aabb {
            min: vmax(self.min, other.min),
            max: vmin(self.max, other.max),
        }
    }

    pub fn combining(&self, other: &Aabb) -> Aabb {
        let mut ret = *self;
        ret.combine(other);
        ret
    }

    pub fn combine(&mut self, other: &Aabb) -> &mut Self {
        if !other.is_null() {
            if self.is_null() {
                self.min = other.min;
                self.max = other.max;
            } else {
                self.min = vmin(self.min, other.min);
                self.max = vmax(self.max, other.max);
            }
        }
        self
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        !self.intersection(other).is_null()
    }

    pub fn center(&self) -> Vector3<f32> {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vector3<f32> {
        if self.is_null() {
            return Vector3::new(0.0, 0.0, 0.0);
        }
        self.max - self.min
    }

    /// Slab test. Returns the ray parameter of the entry point, zero if
    /// the origin is already inside the box.
    pub fn ray_test(&self, origin: Vector3<f32>, dir: Vector3<f32>) -> Option<f32> {
        if self.is_null() {
            return None;
        }

        let mut inside = true;
        let mut max_t = [-1.0f32; 3];

        for i in 0..3 {
            if origin[i] < self.min[i] {
                inside = false;
                if dir[i] != 0.0 {
                    max_t[i] = (self.min[i] - origin[i]) / dir[i];
                }
            } else if origin[i] > self.max[i] {
                inside = false;
                if dir[i] != 0.0 {
                    max_t[i] = (self.max[i] - origin[i]) / dir[i];
                }
            }
        }
        if inside {
            return Some(0.0);
        }

        // the candidate plane is the axis with the latest entry
        let mut plane = 0;
        if max_t[1] > max_t[plane] {
            plane = 1;
        }
        if max_t[2] > max_t[plane] {
            plane = 2;
        }
        if max_t[plane] < 0.0 {
            return None;
        }

        for i in 0..3 {
            if i != plane {
                let coord = origin[i] + max_t[plane] * dir[i];
                if coord < self.min[i] || coord > self.max[i] {
                    return None;
                }
            }
        }
        Some(max_t[plane])
    }

    pub fn overlap_plane(&self, plane: &Plane) -> bool {
        if self.is_null() {
            return false;
        }

        let mut vmin_p = Vector3::new(0.0, 0.0, 0.0);
        let mut vmax_p = Vector3::new(0.0, 0.0, 0.0);
        for n in 0..3 {
            if plane.normal[n] > 0.0 {
                vmin_p[n] = self.min[n];
                vmax_p[n] = self.max[n];
            } else {
                vmin_p[n] = self.max[n];
                vmax_p[n] = self.min[n];
            }
        }
        if plane.dot(vmax_p) < 0.0 {
            return false; // box is below plane
        }
        if plane.dot(vmin_p) > 0.0 {
            return false; // box is above plane
        }
        true
    }

    /// Triangle overlap via the separating axis theorem: nine
    /// edge-cross-axis tests, the three axis-aligned tests, then the
    /// triangle-plane test. Based on Tomas Akenine-Möller's method.
    pub fn overlap_triangle(&self, tri: &Triangle) -> bool {
        if self.is_null() {
            return false;
        }

        let boxcenter = self.center();
        let boxhalfsize = self.extents() * 0.5;

        // move everything so that the boxcenter is at the origin
        let v0 = tri.p0 - boxcenter;
        let v1 = tri.p1 - boxcenter;
        let v2 = tri.p2 - boxcenter;

        let axis_test = |a: f32, b: f32, fa: f32, fb: f32, va: Vector3<f32>, vb: Vector3<f32>, i1: usize, i2: usize| -> bool {
            let p1 = a * va[i1] + b * va[i2];
            let p2 = a * vb[i1] + b * vb[i2];
            let (min, max) = if p1 > p2 { (p2, p1) } else { (p1, p2) };
            let rad = fa * boxhalfsize[i1] + fb * boxhalfsize[i2];
            !(min > rad || max < -rad)
        };

        const X: usize = 0;
        const Y: usize = 1;
        const Z: usize = 2;

        let e0 = v1 - v0;
        let e1 = v2 - v1;
        let e2 = v0 - v2;

        let (fex, fey, fez) = (e0.x.abs(), e0.y.abs(), e0.z.abs());
        if !axis_test(e0.z, -e0.y, fez, fey, v0, v2, Y, Z) {
            return false;
        }
        if !axis_test(-e0.z, e0.x, fez, fex, v0, v2, X, Z) {
            return false;
        }
        if !axis_test(e0.y, -e0.x, fey, fex, v1, v2, X, Y) {
            return false;
        }

        let (fex, fey, fez) = (e1.x.abs(), e1.y.abs(), e1.z.abs());
        if !axis_test(e1.z, -e1.y, fez, fey, v0, v2, Y, Z) {
            return false;
        }
        if !axis_test(-e1.z, e1.x, fez, fex, v0, v2, X, Z) {
            return false;
        }
        if !axis_test(e1.y, -e1.x, fey, fex, v0, v1, X, Y) {
            return false;
        }

        let (fex, fey, fez) = (e2.x.abs(), e2.y.abs(), e2.z.abs());
        if !axis_test(e2.z, -e2.y, fez, fey, v0, v1, Y, Z) {
            return false;
        }
        if !axis_test(-e2.z, e2.x, fez, fex, v0, v1, X, Z) {
            return false;
        }
        if !axis_test(e2.y, -e2.x, fey, fex, v1, v2, X, Y) {
            return false;
        }

        // axis-aligned extents of the triangle against the box
        let find_min_max = |x0: f32, x1: f32, x2: f32| (x0.min(x1).min(x2), x0.max(x1).max(x2));

        let (min, max) = find_min_max(v0.x, v1.x, v2.x);
        if min > boxhalfsize.x || max < -boxhalfsize.x {
            return false;
        }
        let (min, max) = find_min_max(v0.y, v1.y, v2.y);
        if min > boxhalfsize.y || max < -boxhalfsize.y {
            return false;
        }
        let (min, max) = find_min_max(v0.z, v1.z, v2.z);
        if min > boxhalfsize.z || max < -boxhalfsize.z {
            return false;
        }

        // finally the triangle plane against the box
        let plane_box_overlap = |normal: Vector3<f32>, vert: Vector3<f32>, maxbox: Vector3<f32>| -> bool {
            let mut vmin_p = Vector3::new(0.0, 0.0, 0.0);
            let mut vmax_p = Vector3::new(0.0, 0.0, 0.0);
            for q in 0..3 {
                let v = vert[q];
                if normal[q] > 0.0 {
                    vmin_p[q] = -maxbox[q] - v;
                    vmax_p[q] = maxbox[q] - v;
                } else {
                    vmin_p[q] = maxbox[q] - v;
                    vmax_p[q] = -maxbox[q] - v;
                }
            }
            if normal.dot(vmin_p) > 0.0 {
                return false;
            }
            normal.dot(vmax_p) >= 0.0
        };
        let normal = e0.cross(e1);
        if !plane_box_overlap(normal, v0, boxhalfsize) {
            return false;
        }

        true
    }
}

fn vmin(a: Vector3<f32>, b: Vector3<f32>) -> Vector3<f32> {
    Vector3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z))
}

fn vmax(a: Vector3<f32>, b: Vector3<f32>) -> Vector3<f32> {
    Vector3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_and_intersection_are_idempotent() {
        let a = Aabb::new(Vector3::new(-1.0, 0.0, 2.0), Vector3::new(3.0, 4.0, 5.0));
        assert_eq!(a.combining(&a), a);
        assert_eq!(a.intersection(&a), a);
    }

    #[test]
    fn null_behaves_as_empty() {
        let null = Aabb::null();
        assert!(null.is_null());

        let a = Aabb::new(Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 1.0, 1.0));
        assert_eq!(null.combining(&a), a);
        assert!(null.intersection(&a).is_null());
        assert!(null
            .ray_test(Vector3::new(0.5, 0.5, -10.0), Vector3::new(0.0, 0.0, 1.0))
            .is_none());
    }

    #[test]
    fn ray_entry_point() {
        let a = Aabb::new(Vector3::new(-1.0, -1.0, -1.0), Vector3::new(1.0, 1.0, 1.0));
        let t = a
            .ray_test(Vector3::new(0.0, 0.0, -3.0), Vector3::new(0.0, 0.0, 1.0))
            .unwrap();
        assert!((t - 2.0).abs() < 1e-6);

        // origin inside reports entry at the origin
        let t = a
            .ray_test(Vector3::new(0.2, 0.2, 0.2), Vector3::new(0.0, 0.0, 1.0))
            .unwrap();
        assert_eq!(t, 0.0);

        // pointing away misses
        assert!(a
            .ray_test(Vector3::new(0.0, 0.0, -3.0), Vector3::new(0.0, 0.0, -1.0))
            .is_none());
    }

    #[test]
    fn triangle_overlap() {
        let a = Aabb::new(Vector3::new(-1.0, -1.0, -1.0), Vector3::new(1.0, 1.0, 1.0));
        let inside = Triangle {
            p0: Vector3::new(0.0, 0.0, 0.0),
            p1: Vector3::new(0.5, 0.0, 0.0),
            p2: Vector3::new(0.0, 0.5, 0.0),
        };
        assert!(a.overlap_triangle(&inside));

        let outside = Triangle {
            p0: Vector3::new(5.0, 5.0, 5.0),
            p1: Vector3::new(6.0, 5.0, 5.0),
            p2: Vector3::new(5.0, 6.0, 5.0),
        };
        assert!(!a.overlap_triangle(&outside));

        // triangle plane cuts through the box without any vertex inside
        let cutting = Triangle {
            p0: Vector3::new(-5.0, 0.0, 0.0),
            p1: Vector3::new(5.0, 0.0, 0.0),
            p2: Vector3::new(0.0, 5.0, 0.0),
        };
        assert!(a.overlap_triangle(&cutting));
    }
}
