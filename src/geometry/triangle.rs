// Triangles and their intersection tests
//
// Ray tests are Möller-Trumbore; the triangle-triangle test is the
// interval overlap method (Tomas Möller, "A Fast Triangle-Triangle
// Intersection Test"), with the optional intersection segment variant.

use cgmath::{InnerSpace, Vector3};

use super::Aabb;

const EPSILON: f32 = f32::EPSILON;

/// Parametric ray hit. The intersection point is
/// `(1-u-v)*p0 + u*p1 + v*p2`, at distance `t` along the ray.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RayTestResult {
    pub t: f32,
    pub u: f32,
    pub v: f32,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct LineSegment {
    pub p0: Vector3<f32>,
    pub p1: Vector3<f32>,
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Triangle {
    pub p0: Vector3<f32>,
    pub p1: Vector3<f32>,
    pub p2: Vector3<f32>,
}

impl Triangle {
    pub fn new(p0: Vector3<f32>, p1: Vector3<f32>, p2: Vector3<f32>) -> Self {
        Self { p0, p1, p2 }
    }

    pub fn area(&self) -> f32 {
        let ab = self.p1 - self.p0;
        let ac = self.p2 - self.p0;
        ab.cross(ac).magnitude() * 0.5
    }

    pub fn aabb(&self) -> Aabb {
        let mut aabb = Aabb::null();
        aabb.expand_points(&[self.p0, self.p1, self.p2]);
        aabb
    }

    /// Barycentric coordinates (u, v, w) of a point with respect to
    /// this triangle.
    pub fn barycentric(&self, p: Vector3<f32>) -> Vector3<f32> {
        let v0 = self.p1 - self.p0;
        let v1 = self.p2 - self.p0;
        let v2 = p - self.p0;
        let d00 = v0.dot(v0);
        let d01 = v0.dot(v1);
        let d11 = v1.dot(v1);
        let d20 = v2.dot(v0);
        let d21 = v2.dot(v1);
        let denom = d00 * d11 - d01 * d01;
        let inv_denom = 1.0 / denom;
        let v = (d11 * d20 - d01 * d21) * inv_denom;
        let w = (d00 * d21 - d01 * d20) * inv_denom;
        Vector3::new(1.0 - v - w, v, w)
    }

    /// Double-sided ray intersection. Degenerate (zero-area) triangles
    /// never hit.
    pub fn ray_test(&self, origin: Vector3<f32>, dir: Vector3<f32>) -> Option<RayTestResult> {
        let edge1 = self.p1 - self.p0;
        let edge2 = self.p2 - self.p0;
        let p = dir.cross(edge2);
        let det = edge1.dot(p);

        if det > -EPSILON && det < EPSILON {
            return None;
        }
        let inv_det = 1.0 / det;

        let s = origin - self.p0;
        let u = s.dot(p) * inv_det;
        if u < 0.0 || u > 1.0 {
            return None;
        }

        let q = s.cross(edge1);
        let v = dir.dot(q) * inv_det;
        if v < 0.0 || u + v > 1.0 {
            return None;
        }

        Some(RayTestResult {
            t: edge2.dot(q) * inv_det,
            u,
            v,
        })
    }

    /// Front-face-only test with clockwise winding.
    pub fn ray_test_cw(&self, origin: Vector3<f32>, dir: Vector3<f32>) -> Option<RayTestResult> {
        Triangle::new(self.p2, self.p1, self.p0).ray_test_ccw(origin, dir)
    }

    /// Front-face-only test with counter-clockwise winding.
    pub fn ray_test_ccw(&self, origin: Vector3<f32>, dir: Vector3<f32>) -> Option<RayTestResult> {
        let edge1 = self.p1 - self.p0;
        let edge2 = self.p2 - self.p0;
        let p = dir.cross(edge2);
        let det = edge1.dot(p);

        if det > -EPSILON && det < EPSILON {
            return None;
        }

        let s = origin - self.p0;
        let u = s.dot(p);
        if u < 0.0 || u > det {
            return None;
        }

        let q = s.cross(edge1);
        let v = dir.dot(q);
        if v < 0.0 || u + v > det {
            return None;
        }

        let inv_det = 1.0 / det;
        Some(RayTestResult {
            t: edge2.dot(q) * inv_det,
            u: u * inv_det,
            v: v * inv_det,
        })
    }

    /// Intersection with another triangle, reporting the shared line
    /// segment. Coplanar overlaps report a degenerate segment at the
    /// first contact point.
    pub fn intersection_test(&self, other: &Triangle) -> Option<LineSegment> {
        tri_tri_intersect(self, other, true).map(|seg| seg)
    }

    pub fn intersects(&self, other: &Triangle) -> bool {
        tri_tri_intersect(self, other, false).is_some()
    }
}

// Projects both triangles onto the line of intersection of their planes
// and compares the overlap intervals.
fn tri_tri_intersect(t1: &Triangle, t2: &Triangle, want_segment: bool) -> Option<LineSegment> {
    // plane of t1: n1 . x + d1 = 0
    let e1 = t1.p1 - t1.p0;
    let e2 = t1.p2 - t1.p0;
    let n1 = e1.cross(e2);
    let d1 = -n1.dot(t1.p0);

    let mut du0 = n1.dot(t2.p0) + d1;
    let mut du1 = n1.dot(t2.p1) + d1;
    let mut du2 = n1.dot(t2.p2) + d1;
    if du0.abs() < EPSILON {
        du0 = 0.0;
    }
    if du1.abs() < EPSILON {
        du1 = 0.0;
    }
    if du2.abs() < EPSILON {
        du2 = 0.0;
    }
    let du0du1 = du0 * du1;
    let du0du2 = du0 * du2;
    if du0du1 > 0.0 && du0du2 > 0.0 {
        return None; // all of t2 on one side
    }

    // plane of t2
    let e1 = t2.p1 - t2.p0;
    let e2 = t2.p2 - t2.p0;
    let n2 = e1.cross(e2);
    let d2 = -n2.dot(t2.p0);

    let mut dv0 = n2.dot(t1.p0) + d2;
    let mut dv1 = n2.dot(t1.p1) + d2;
    let mut dv2 = n2.dot(t1.p2) + d2;
    if dv0.abs() < EPSILON {
        dv0 = 0.0;
    }
    if dv1.abs() < EPSILON {
        dv1 = 0.0;
    }
    if dv2.abs() < EPSILON {
        dv2 = 0.0;
    }
    let dv0dv1 = dv0 * dv1;
    let dv0dv2 = dv0 * dv2;
    if dv0dv1 > 0.0 && dv0dv2 > 0.0 {
        return None;
    }

    // direction of the intersection line
    let d = n1.cross(n2);

    // largest component of d
    let mut index = 0;
    let mut max = d.x.abs();
    if d.y.abs() > max {
        max = d.y.abs();
        index = 1;
    }
    if d.z.abs() > max {
        index = 2;
    }

    if max < EPSILON {
        // coplanar triangles
        if coplanar_tri_tri(n1, t1, t2) {
            return Some(LineSegment {
                p0: t1.p0,
                p1: t1.p0,
            });
        }
        return None;
    }

    // simplified projection onto the line
    let vp = [t1.p0[index], t1.p1[index], t1.p2[index]];
    let up = [t2.p0[index], t2.p1[index], t2.p2[index]];

    let (isect1, pts1) = compute_intervals(t1, vp, dv0, dv1, dv2, dv0dv1, dv0dv2)?;
    let (isect2, pts2) = compute_intervals(t2, up, du0, du1, du2, du0du1, du0du2)?;

    let (a0, a1, pa0, pa1) = sort_interval(isect1, pts1);
    let (b0, b1, pb0, pb1) = sort_interval(isect2, pts2);

    if a1 < b0 || b1 < a0 {
        return None;
    }

    if !want_segment {
        return Some(LineSegment {
            p0: Vector3::new(0.0, 0.0, 0.0),
            p1: Vector3::new(0.0, 0.0, 0.0),
        });
    }

    // endpoints of the shared interval
    let p0 = if a0 > b0 { pa0 } else { pb0 };
    let p1 = if a1 < b1 { pa1 } else { pb1 };
    Some(LineSegment { p0, p1 })
}

// Interval of one triangle on the intersection line, with the 3D points
// where its edges cross the other plane. `dp` are the signed plane
// distances and `proj` the projections on the dominant axis.
fn compute_intervals(
    tri: &Triangle,
    proj: [f32; 3],
    d0: f32,
    d1: f32,
    d2: f32,
    d0d1: f32,
    d0d2: f32,
) -> Option<([f32; 2], [Vector3<f32>; 2])> {
    let verts = [tri.p0, tri.p1, tri.p2];
    let dist = [d0, d1, d2];

    // pick the vertex that is alone on its side of the plane
    let lone = if d0d1 > 0.0 {
        2 // p0, p1 on the same side
    } else if d0d2 > 0.0 {
        1
    } else if d1 * d2 > 0.0 || d0 != 0.0 {
        0
    } else if d1 != 0.0 {
        1
    } else if d2 != 0.0 {
        2
    } else {
        return None; // coplanar, handled by the caller
    };

    let (a, b) = match lone {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    };

    let isect = |i: usize, j: usize| -> (f32, Vector3<f32>) {
        let t = dist[i] / (dist[i] - dist[j]);
        let p = proj[i] + (proj[j] - proj[i]) * t;
        let pt = verts[i] + (verts[j] - verts[i]) * t;
        (p, pt)
    };
    let (i0, p0) = isect(a, lone);
    let (i1, p1) = isect(b, lone);
    Some(([i0, i1], [p0, p1]))
}

fn sort_interval(isect: [f32; 2], pts: [Vector3<f32>; 2]) -> (f32, f32, Vector3<f32>, Vector3<f32>) {
    if isect[0] > isect[1] {
        (isect[1], isect[0], pts[1], pts[0])
    } else {
        (isect[0], isect[1], pts[0], pts[1])
    }
}

// 2D overlap test for coplanar triangles, projected onto the plane's
// dominant axis pair.
fn coplanar_tri_tri(n: Vector3<f32>, t1: &Triangle, t2: &Triangle) -> bool {
    let a = [n.x.abs(), n.y.abs(), n.z.abs()];
    let (i0, i1) = if a[0] > a[1] {
        if a[0] > a[2] {
            (1, 2)
        } else {
            (0, 1)
        }
    } else if a[2] > a[1] {
        (0, 1)
    } else {
        (0, 2)
    };

    let p = |v: Vector3<f32>| (v[i0], v[i1]);
    let tri1 = [p(t1.p0), p(t1.p1), p(t1.p2)];
    let tri2 = [p(t2.p0), p(t2.p1), p(t2.p2)];

    for i in 0..3 {
        let e0 = tri1[i];
        let e1 = tri1[(i + 1) % 3];
        for j in 0..3 {
            if edges_intersect(e0, e1, tri2[j], tri2[(j + 1) % 3]) {
                return true;
            }
        }
    }
    point_in_tri(tri1[0], &tri2) || point_in_tri(tri2[0], &tri1)
}

fn edges_intersect(a0: (f32, f32), a1: (f32, f32), b0: (f32, f32), b1: (f32, f32)) -> bool {
    let ax = a1.0 - a0.0;
    let ay = a1.1 - a0.1;
    let bx = b1.0 - b0.0;
    let by = b1.1 - b0.1;
    let denom = ay * bx - ax * by;
    let num = (a0.1 - b0.1) * bx - (a0.0 - b0.0) * by;
    if denom == 0.0 {
        return false;
    }
    let s = num / denom;
    if s < 0.0 || s > 1.0 {
        return false;
    }
    let num2 = (a0.1 - b0.1) * ax - (a0.0 - b0.0) * ay;
    let t = num2 / denom;
    !(t < 0.0 || t > 1.0)
}

fn point_in_tri(pt: (f32, f32), tri: &[(f32, f32); 3]) -> bool {
    let mut sign = 0.0f32;
    for i in 0..3 {
        let (x0, y0) = tri[i];
        let (x1, y1) = tri[(i + 1) % 3];
        let cross = (x1 - x0) * (pt.1 - y0) - (y1 - y0) * (pt.0 - x0);
        if cross != 0.0 {
            if sign != 0.0 && cross.signum() != sign {
                return false;
            }
            sign = cross.signum();
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn area_and_aabb() {
        let t = Triangle::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        assert!((t.area() - 0.5).abs() < 1e-6);
        let aabb = t.aabb();
        assert_eq!(aabb.min, Vector3::new(0.0, 0.0, 0.0));
        assert_eq!(aabb.max, Vector3::new(1.0, 1.0, 0.0));
    }

    #[test]
    fn ray_hits_inside_misses_outside() {
        let t = Triangle::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        );
        let hit = t
            .ray_test(Vector3::new(0.25, 0.25, -1.0), Vector3::new(0.0, 0.0, 1.0))
            .unwrap();
        assert!((hit.t - 1.0).abs() < 1e-6);
        assert!((hit.u - 0.25).abs() < 1e-6);
        assert!((hit.v - 0.25).abs() < 1e-6);

        assert!(t
            .ray_test(Vector3::new(0.9, 0.9, -1.0), Vector3::new(0.0, 0.0, 1.0))
            .is_none());
    }

    #[test]
    fn zero_area_triangle_never_hits() {
        let t = Triangle::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
        );
        assert!(t
            .ray_test(Vector3::new(0.5, 0.0, -1.0), Vector3::new(0.0, 0.0, 1.0))
            .is_none());
    }

    #[test]
    fn winding_selects_front_face() {
        // counter-clockwise when viewed from -z (ray direction +z)
        let t = Triangle::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
        );
        let origin = Vector3::new(0.25, 0.25, -1.0);
        let dir = Vector3::new(0.0, 0.0, 1.0);
        assert!(t.ray_test_ccw(origin, dir).is_some());
        assert!(t.ray_test_cw(origin, dir).is_none());
    }

    #[test]
    fn barycentric_roundtrip() {
        let t = Triangle::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(2.0, 0.0, 0.0),
            Vector3::new(0.0, 2.0, 0.0),
        );
        let b = t.barycentric(Vector3::new(0.5, 0.5, 0.0));
        assert!((b.x + b.y + b.z - 1.0).abs() < 1e-6);
        let rebuilt = t.p0 * b.x + t.p1 * b.y + t.p2 * b.z;
        assert!((rebuilt - Vector3::new(0.5, 0.5, 0.0)).magnitude() < 1e-6);
    }

    #[test]
    fn crossing_triangles_intersect() {
        let a = Triangle::new(
            Vector3::new(-1.0, 0.0, -1.0),
            Vector3::new(1.0, 0.0, -1.0),
            Vector3::new(0.0, 0.0, 1.0),
        );
        let b = Triangle::new(
            Vector3::new(0.0, -1.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 2.0),
        );
        assert!(a.intersects(&b));
        let seg = a.intersection_test(&b).unwrap();
        assert!(seg.p0.x.abs() < 1e-5);
        assert!(seg.p0.y.abs() < 1e-5);

        let far = Triangle::new(
            Vector3::new(10.0, 10.0, 10.0),
            Vector3::new(11.0, 10.0, 10.0),
            Vector3::new(10.0, 11.0, 10.0),
        );
        assert!(!a.intersects(&far));
    }
}
