// Triangle-mesh spatial index: an octree built over a normalized unit
// cube, with a flat 16-byte-node "layer" form for GPU consumption.
//
// Tree nodes keep their centers in unit-cube space; the octree's AABB
// carries the transform back to world space. The flat layer quantizes
// centers to 16-bit unorm and can be marched with a single index: hit
// nodes advance by one, missed internal nodes skip their whole subtree
// via the stride-to-next-sibling field.

use cgmath::{InnerSpace, Vector3};

use crate::geometry::{Aabb, AffineTransform3, Triangle};

pub type Payload = u64;

/// Result selection for ray queries.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RayHitOption {
    AnyHit,
    ClosestHit,
    LongestHit,
}

#[derive(Debug)]
pub struct AabbOctreeNode {
    /// Center of this node's cube in unit-cube space.
    pub center: Vector3<f32>,
    /// Cube extent exponent: the half extent is `0.5 * 0.5^depth`.
    pub depth: u32,
    pub payload: Payload,
    pub subdivisions: Vec<AabbOctreeNode>,
}

impl AabbOctreeNode {
    pub fn aabb(&self) -> Aabb {
        let he = half_extent(self.depth);
        let ext = Vector3::new(he, he, he);
        Aabb::new(self.center - ext, self.center + ext)
    }

    fn count_descendants(&self) -> u64 {
        self.subdivisions
            .iter()
            .fold(1, |r, n| r + n.count_descendants())
    }

    fn count_leaf_nodes(&self) -> u64 {
        if self.subdivisions.is_empty() {
            return 1;
        }
        self.subdivisions
            .iter()
            .fold(0, |r, n| r + n.count_leaf_nodes())
    }
}

fn half_extent(depth: u32) -> f32 {
    let mut he = 0.5f32;
    for _ in 0..depth {
        he *= 0.5;
    }
    he
}

#[derive(Copy, Clone, Debug)]
pub struct RayHitResult<'a> {
    pub hit_point: Vector3<f32>,
    pub node: &'a AabbOctreeNode,
}

pub struct AabbOctree {
    pub aabb: Aabb,
    pub max_depth: u32,
    pub num_descendants: u64,
    pub num_leaf_nodes: u64,
    pub root: AabbOctreeNode,
}

impl AabbOctree {
    /// Build a tree over `num_triangles` triangles fetched through
    /// `triangle`. `payload` receives the overlapping triangle indices
    /// and the de-quantized (world-space) center of each created node.
    pub fn make_tree<F, G>(
        max_depth: u32,
        num_triangles: u64,
        base_index: u64,
        triangle: F,
        mut payload: G,
    ) -> Option<AabbOctree>
    where
        F: Fn(u64) -> Triangle,
        G: FnMut(&[u64], Vector3<f32>) -> Payload,
    {
        let mut triangles = Vec::with_capacity(num_triangles as usize);
        let mut aabb = Aabb::null();
        for i in 0..num_triangles {
            let tri = triangle(i + base_index);
            aabb.expand_points(&[tri.p0, tri.p1, tri.p2]);
            triangles.push(tri);
        }
        if aabb.is_null() {
            return None;
        }

        let mut scale = aabb.extents();
        for i in 0..3 {
            if scale[i] == 0.0 {
                scale[i] = 1.0;
            }
        }

        let quantize = AffineTransform3::identity()
            .scaled(scale)
            .translated(aabb.min);
        let normalize = quantize.inverted();

        // normalize triangles into the unit cube
        for tri in triangles.iter_mut() {
            tri.p0 = normalize.apply(tri.p0);
            tri.p1 = normalize.apply(tri.p1);
            tri.p2 = normalize.apply(tri.p2);
        }

        let indices: Vec<u64> = (base_index..base_index + num_triangles).collect();

        struct Counter {
            num_nodes: u64,
            num_leaf_nodes: u64,
        }

        fn subdivide<G>(
            node: &mut AabbOctreeNode,
            depth_level: u32,
            triangles: &[u64],
            base_index: u64,
            normalized: &[Triangle],
            payload: &mut G,
            quantize: &AffineTransform3,
            counter: &mut Counter,
        ) where
            G: FnMut(&[u64], Vector3<f32>) -> Payload,
        {
            if depth_level == 0 {
                return;
            }

            let he = half_extent(node.depth);
            let pivot = node.center - Vector3::new(he, he, he) * 0.5;

            let mut buffer = Vec::with_capacity(triangles.len());
            for n in 0..8u32 {
                let x = (n & 1) as f32;
                let y = ((n >> 1) & 1) as f32;
                let z = ((n >> 2) & 1) as f32;

                let center = pivot + Vector3::new(he * x, he * y, he * z);
                let mut child = AabbOctreeNode {
                    center,
                    depth: node.depth + 1,
                    payload: 0,
                    subdivisions: Vec::new(),
                };
                let child_aabb = child.aabb();

                buffer.clear();
                for &t in triangles {
                    if child_aabb.overlap_triangle(&normalized[(t - base_index) as usize]) {
                        buffer.push(t);
                    }
                }
                if !buffer.is_empty() {
                    child.payload = payload(&buffer, quantize.apply(child.center));
                    if depth_level > 1 {
                        subdivide(
                            &mut child,
                            depth_level - 1,
                            &buffer,
                            base_index,
                            normalized,
                            payload,
                            quantize,
                            counter,
                        );
                    } else {
                        counter.num_leaf_nodes += 1;
                    }
                    node.subdivisions.push(child);
                    counter.num_nodes += 1;
                }
            }
            node.subdivisions.shrink_to_fit();
        }

        let mut root = AabbOctreeNode {
            center: Vector3::new(0.5, 0.5, 0.5),
            depth: 0,
            payload: 0,
            subdivisions: Vec::new(),
        };
        root.payload = payload(&indices, quantize.apply(root.center));

        let mut counter = Counter {
            num_nodes: 0,
            num_leaf_nodes: 0,
        };
        subdivide(
            &mut root,
            max_depth,
            &indices,
            base_index,
            &triangles,
            &mut payload,
            &quantize,
            &mut counter,
        );
        if counter.num_leaf_nodes == 0 {
            counter.num_leaf_nodes = 1; // root
        }
        counter.num_nodes += 1; // root

        Some(AabbOctree {
            aabb,
            max_depth,
            num_descendants: counter.num_nodes,
            num_leaf_nodes: counter.num_leaf_nodes,
            root,
        })
    }

    pub fn number_of_descendants(&self) -> u64 {
        self.root.count_descendants()
    }

    pub fn number_of_leaf_nodes(&self) -> u64 {
        self.root.count_leaf_nodes()
    }

    /// Flatten into the GPU-consumable layer form, treating any node at
    /// `max_depth` as a leaf.
    pub fn make_layer(&self, max_depth: u32) -> AabbOctreeLayer {
        fn emit(node: &AabbOctreeNode, max_depth: u32, nodes: &mut Vec<LayerNode>) {
            let index = nodes.len();
            const Q: f32 = u16::MAX as f32;
            let mut n = LayerNode {
                center: [
                    (node.center.x * Q) as u16,
                    (node.center.y * Q) as u16,
                    (node.center.z * Q) as u16,
                ],
                depth: node.depth as u8,
                flags: 0,
                value: 0,
            };
            if node.subdivisions.is_empty() || node.depth >= max_depth {
                n.flags |= LayerNode::FLAG_PAYLOAD;
                n.value = node.payload;
                nodes.push(n);
            } else {
                nodes.push(n);
                for sub in node.subdivisions.iter() {
                    emit(sub, max_depth, nodes);
                }
                let stride = (nodes.len() - index) as u64;
                debug_assert!(stride < u32::MAX as u64);
                nodes[index].value = stride;
            }
        }

        let mut data = Vec::with_capacity(self.num_descendants as usize);
        emit(&self.root, max_depth, &mut data);
        data.shrink_to_fit();
        AabbOctreeLayer {
            aabb: self.aabb,
            data,
        }
    }

    /// Visit every leaf hit by the ray, in tree order. The filter
    /// returns false to stop; the number of leaf hits is returned.
    pub fn ray_test_filter<F>(&self, ray_origin: Vector3<f32>, dir: Vector3<f32>, mut filter: F) -> u64
    where
        F: FnMut(&RayHitResult) -> bool,
    {
        if self.aabb.is_null() {
            return 0;
        }

        let (quantize, normalize) = normalize_transforms(&self.aabb);
        let ray_start = normalize.apply(ray_origin);
        let ray_dir = normalize.apply_direction(dir);

        fn visit<'a, F>(
            node: &'a AabbOctreeNode,
            start: Vector3<f32>,
            dir: Vector3<f32>,
            quantize: &AffineTransform3,
            keep_going: &mut bool,
            filter: &mut F,
        ) -> u64
        where
            F: FnMut(&RayHitResult<'a>) -> bool,
        {
            if let Some(t) = node.aabb().ray_test(start, dir) {
                if node.subdivisions.is_empty() {
                    let hit_point = quantize.apply(start + dir * t);
                    if !filter(&RayHitResult {
                        hit_point,
                        node,
                    }) {
                        *keep_going = false;
                    }
                    return 1;
                }
                let mut num_hits = 0;
                for n in node.subdivisions.iter() {
                    if !*keep_going {
                        break;
                    }
                    num_hits += visit(n, start, dir, quantize, keep_going, filter);
                }
                return num_hits;
            }
            0
        }

        let mut keep_going = true;
        visit(
            &self.root,
            ray_start,
            ray_dir,
            &quantize,
            &mut keep_going,
            &mut filter,
        )
    }

    pub fn ray_test(
        &self,
        ray_origin: Vector3<f32>,
        dir: Vector3<f32>,
        option: RayHitOption,
    ) -> Option<(Vector3<f32>, Payload)> {
        select_hit(option, ray_origin, |filter| {
            self.ray_test_filter(ray_origin, dir, |hit| {
                filter(hit.hit_point, hit.node.payload)
            });
        })
    }
}

/// Flat node layout shared with the GPU: three quantized center
/// coordinates, the depth exponent, a flag byte, and an eight-byte
/// value slot read through `value()`. Total size is exactly 16 bytes.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct LayerNode {
    pub center: [u16; 3],
    pub depth: u8,
    pub flags: u8,
    value: u64,
}

/// Discriminated view of the value slot; the flag byte is the tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LayerNodeValue {
    Internal { stride_to_next_sibling: u32 },
    Leaf { payload: Payload },
}

impl LayerNode {
    pub const FLAG_MATERIAL: u8 = 1;
    pub const FLAG_PAYLOAD: u8 = 1 << 1;

    pub fn is_leaf(&self) -> bool {
        self.flags != 0
    }

    pub fn value(&self) -> LayerNodeValue {
        if self.is_leaf() {
            LayerNodeValue::Leaf {
                payload: self.value,
            }
        } else {
            LayerNodeValue::Internal {
                stride_to_next_sibling: self.value as u32,
            }
        }
    }

    pub fn payload(&self) -> Payload {
        self.value
    }

    fn stride_to_next_sibling(&self) -> usize {
        self.value as u32 as usize
    }

    fn aabb(&self) -> Aabb {
        const Q: f32 = 1.0 / (u16::MAX as f32);
        let center = Vector3::new(
            self.center[0] as f32,
            self.center[1] as f32,
            self.center[2] as f32,
        ) * Q;
        let he = half_extent(self.depth as u32);
        let ext = Vector3::new(he, he, he);
        Aabb::new(center - ext, center + ext)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct LayerRayHitResult<'a> {
    pub hit_point: Vector3<f32>,
    pub node: &'a LayerNode,
}

pub struct AabbOctreeLayer {
    pub aabb: Aabb,
    pub data: Vec<LayerNode>,
}

impl AabbOctreeLayer {
    /// Single-index march over the flat array. Leaves always advance by
    /// one; internal nodes advance by one on hit and by their sibling
    /// stride on miss.
    pub fn ray_test_filter<F>(&self, ray_origin: Vector3<f32>, dir: Vector3<f32>, mut filter: F) -> u32
    where
        F: FnMut(&LayerRayHitResult) -> bool,
    {
        if self.aabb.is_null() {
            return 0;
        }

        let (quantize, normalize) = normalize_transforms(&self.aabb);
        let ray_start = normalize.apply(ray_origin);
        let ray_dir = normalize.apply_direction(dir);

        let mut num_hits = 0;
        let mut index = 0usize;
        while index < self.data.len() {
            let node = &self.data[index];
            match node.aabb().ray_test(ray_start, ray_dir) {
                Some(t) => {
                    if node.is_leaf() {
                        num_hits += 1;
                        let hit_point = quantize.apply(ray_start + ray_dir * t);
                        if !filter(&LayerRayHitResult {
                            hit_point,
                            node,
                        }) {
                            break;
                        }
                    }
                    index += 1;
                }
                None => {
                    if node.is_leaf() {
                        index += 1;
                    } else {
                        index += node.stride_to_next_sibling();
                    }
                }
            }
        }
        num_hits
    }

    pub fn ray_test(
        &self,
        ray_origin: Vector3<f32>,
        dir: Vector3<f32>,
        option: RayHitOption,
    ) -> Option<(Vector3<f32>, Payload)> {
        select_hit(option, ray_origin, |filter| {
            self.ray_test_filter(ray_origin, dir, |hit| {
                filter(hit.hit_point, hit.node.payload())
            });
        })
    }
}

fn normalize_transforms(aabb: &Aabb) -> (AffineTransform3, AffineTransform3) {
    let origin = aabb.min;
    let mut scale = aabb.extents();
    for i in 0..3 {
        if scale[i] == 0.0 {
            scale[i] = 1.0;
        }
    }
    let quantize = AffineTransform3::identity()
        .scaled(scale)
        .translated(origin);
    let normalize = quantize.inverted();
    (quantize, normalize)
}

// Wraps a raw filter walk with the hit selection policy.
fn select_hit<R>(
    option: RayHitOption,
    ray_origin: Vector3<f32>,
    run: R,
) -> Option<(Vector3<f32>, Payload)>
where
    R: FnOnce(&mut dyn FnMut(Vector3<f32>, Payload) -> bool),
{
    let mut best: Option<(Vector3<f32>, Payload)> = None;
    {
        let mut filter = |hit_point: Vector3<f32>, payload: Payload| -> bool {
            match option {
                RayHitOption::AnyHit => {
                    best = Some((hit_point, payload));
                    false
                }
                RayHitOption::ClosestHit => {
                    let replace = match best {
                        Some((p, _)) => {
                            (hit_point - ray_origin).magnitude2() < (p - ray_origin).magnitude2()
                        }
                        None => true,
                    };
                    if replace {
                        best = Some((hit_point, payload));
                    }
                    true
                }
                RayHitOption::LongestHit => {
                    let replace = match best {
                        Some((p, _)) => {
                            (hit_point - ray_origin).magnitude2() > (p - ray_origin).magnitude2()
                        }
                        None => true,
                    };
                    if replace {
                        best = Some((hit_point, payload));
                    }
                    true
                }
            }
        };
        run(&mut filter);
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_triangle() -> Triangle {
        Triangle::new(
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
        )
    }

    #[test]
    fn layer_node_is_16_bytes() {
        assert_eq!(std::mem::size_of::<LayerNode>() % 16, 0);
        assert_eq!(std::mem::size_of::<LayerNode>(), 16);
    }

    #[test]
    fn layer_node_field_offsets() {
        assert_eq!(memoffset::offset_of!(LayerNode, center), 0);
        assert_eq!(memoffset::offset_of!(LayerNode, depth), 6);
        assert_eq!(memoffset::offset_of!(LayerNode, flags), 7);
        assert_eq!(memoffset::offset_of!(LayerNode, value), 8);
    }

    #[test]
    fn single_triangle_closest_hit() {
        let tri = single_triangle();
        let tree = AabbOctree::make_tree(2, 1, 0, |_| tri, |_, _| 7u64).unwrap();

        let origin = Vector3::new(0.25, 0.25, -1.0);
        let dir = Vector3::new(0.0, 0.0, 1.0);

        let (hit, payload) = tree.ray_test(origin, dir, RayHitOption::ClosestHit).unwrap();
        assert!(hit.z.abs() < 1e-3);
        assert_eq!(payload, 7);

        let layer = tree.make_layer(2);
        let (hit, payload) = layer.ray_test(origin, dir, RayHitOption::ClosestHit).unwrap();
        assert!(hit.z.abs() < 1e-3);
        assert_eq!(payload, 7);
    }

    #[test]
    fn flat_and_tree_closest_hits_agree() {
        // a small fan of triangles, payload = lowest overlapping index
        let tris = [
            Triangle::new(
                Vector3::new(-1.0, -1.0, 0.0),
                Vector3::new(1.0, -1.0, 0.0),
                Vector3::new(0.0, 1.0, 0.0),
            ),
            Triangle::new(
                Vector3::new(-1.0, -1.0, 1.0),
                Vector3::new(1.0, -1.0, 1.0),
                Vector3::new(0.0, 1.0, 1.0),
            ),
            Triangle::new(
                Vector3::new(-1.0, -1.0, -1.5),
                Vector3::new(1.0, -1.0, -1.5),
                Vector3::new(0.0, 1.0, -1.5),
            ),
        ];
        let tree = AabbOctree::make_tree(
            3,
            tris.len() as u64,
            0,
            |i| tris[i as usize],
            |indices, _| indices[0],
        )
        .unwrap();
        let layer = tree.make_layer(3);

        let rays = [
            (Vector3::new(0.0, -0.2, -3.0), Vector3::new(0.0, 0.0, 1.0)),
            (Vector3::new(0.1, 0.0, 3.0), Vector3::new(0.0, 0.0, -1.0)),
            (Vector3::new(-0.4, -0.6, -3.0), Vector3::new(0.05, 0.0, 1.0)),
        ];
        for (origin, dir) in rays.iter() {
            let a = tree.ray_test(*origin, *dir, RayHitOption::ClosestHit);
            let b = layer.ray_test(*origin, *dir, RayHitOption::ClosestHit);
            match (a, b) {
                (Some((pa, la)), Some((pb, lb))) => {
                    assert!((pa - pb).magnitude() < 1e-3, "{:?} vs {:?}", pa, pb);
                    assert_eq!(la, lb);
                }
                (None, None) => {}
                other => panic!("tree/layer disagree: {:?}", other.0.is_some()),
            }
        }
    }

    #[test]
    fn any_and_longest_hits() {
        let tri = single_triangle();
        let tree = AabbOctree::make_tree(2, 1, 0, |_| tri, |_, _| 1u64).unwrap();
        let layer = tree.make_layer(2);

        let origin = Vector3::new(0.25, 0.25, -1.0);
        let dir = Vector3::new(0.0, 0.0, 1.0);
        assert!(layer.ray_test(origin, dir, RayHitOption::AnyHit).is_some());
        assert!(layer.ray_test(origin, dir, RayHitOption::LongestHit).is_some());

        // ray that misses everything
        let miss = layer.ray_test(
            Vector3::new(10.0, 10.0, -1.0),
            Vector3::new(0.0, 0.0, 1.0),
            RayHitOption::AnyHit,
        );
        assert!(miss.is_none());
    }

    #[test]
    fn every_triangle_is_covered_by_a_leaf() {
        let tris = [
            Triangle::new(
                Vector3::new(0.0, 0.0, 0.0),
                Vector3::new(2.0, 0.0, 0.0),
                Vector3::new(0.0, 2.0, 0.0),
            ),
            Triangle::new(
                Vector3::new(-1.0, -1.0, -1.0),
                Vector3::new(-2.0, -1.0, -1.0),
                Vector3::new(-1.0, -2.0, -1.0),
            ),
        ];
        let tree = AabbOctree::make_tree(
            3,
            tris.len() as u64,
            0,
            |i| tris[i as usize],
            |_, _| 0u64,
        )
        .unwrap();

        // normalized copies of the inputs, for the unit-cube SAT test
        let (_, normalize) = super::normalize_transforms(&tree.aabb);
        let normalized: Vec<Triangle> = tris
            .iter()
            .map(|t| {
                Triangle::new(
                    normalize.apply(t.p0),
                    normalize.apply(t.p1),
                    normalize.apply(t.p2),
                )
            })
            .collect();

        fn leaves<'a>(node: &'a AabbOctreeNode, out: &mut Vec<&'a AabbOctreeNode>) {
            if node.subdivisions.is_empty() {
                out.push(node);
            }
            for sub in node.subdivisions.iter() {
                leaves(sub, out);
            }
        }
        let mut all = Vec::new();
        leaves(&tree.root, &mut all);

        for tri in normalized.iter() {
            assert!(
                all.iter().any(|leaf| leaf.aabb().overlap_triangle(tri)),
                "triangle not covered by any leaf"
            );
        }
    }

    #[test]
    fn stride_skips_whole_subtrees() {
        let tri = single_triangle();
        let tree = AabbOctree::make_tree(3, 1, 0, |_| tri, |_, _| 0u64).unwrap();
        let layer = tree.make_layer(3);

        // the root stride must cover the entire array
        match layer.data[0].value() {
            LayerNodeValue::Internal {
                stride_to_next_sibling,
            } => assert_eq!(stride_to_next_sibling as usize, layer.data.len()),
            LayerNodeValue::Leaf { .. } => panic!("root should be internal at depth 3"),
        }
    }
}
