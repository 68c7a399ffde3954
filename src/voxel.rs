// Sparse voxel volume: an octree whose nodes store a small PBR voxel
// value, with solid-branch merging, a flat array form for the GPU, and
// a compact file format.
//
// Children are a bitmask plus a contiguous array sized to the mask's
// popcount, so absent octants cost nothing and iteration walks set bits.

use std::io::{Read, Write};

use cgmath::{InnerSpace, Vector3};

use crate::geometry::{Aabb, AffineTransform3, Rgba8};
use crate::octree::RayHitOption;
use crate::{GraupelError, Result};

use utils::log;

/// Maximum octree depth. The flat-form half extent is reconstructed
/// from a float exponent, which runs out below 2^-125.
pub const MAX_DEPTH: u32 = 124;

/// Half extent of a node cube at the given depth, `0.5 * 2^-depth`,
/// built directly from the float exponent.
pub fn half_extent(depth: u32) -> f32 {
    let exp = (126 - depth.min(125)) << 23;
    f32::from_bits(exp)
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Voxel {
    pub color: Rgba8,
    pub metallic: u8,
    pub roughness: u8,
}

impl Voxel {
    pub fn new(color: Rgba8, metallic: u8, roughness: u8) -> Self {
        Self {
            color,
            metallic,
            roughness,
        }
    }
}

#[derive(Debug)]
pub struct VoxelOctree {
    pub value: Voxel,
    mask: u8,
    children: Vec<VoxelOctree>,
}

impl VoxelOctree {
    pub fn new() -> Self {
        Self::with_value(Voxel::default())
    }

    pub fn with_value(value: Voxel) -> Self {
        Self {
            value,
            mask: 0,
            children: Vec::new(),
        }
    }

    pub fn is_leaf_node(&self) -> bool {
        self.mask == 0
    }

    pub fn num_subdivisions(&self) -> u32 {
        self.mask.count_ones()
    }

    pub fn subdivision_mask(&self) -> u8 {
        self.mask
    }

    fn slot(&self, octant: u8) -> usize {
        (self.mask & ((1u16 << octant) as u8).wrapping_sub(1)).count_ones() as usize
    }

    pub fn child(&self, octant: u8) -> Option<&VoxelOctree> {
        if self.mask & (1 << octant) != 0 {
            Some(&self.children[self.slot(octant)])
        } else {
            None
        }
    }

    pub fn child_mut(&mut self, octant: u8) -> Option<&mut VoxelOctree> {
        if self.mask & (1 << octant) != 0 {
            let slot = self.slot(octant);
            Some(&mut self.children[slot])
        } else {
            None
        }
    }

    /// Materialize the octant if absent; returns the child either way.
    pub fn subdivide(&mut self, octant: u8, value: Voxel) -> &mut VoxelOctree {
        debug_assert!(octant < 8);
        if self.mask & (1 << octant) == 0 {
            let slot = self.slot(octant);
            self.children.insert(slot, VoxelOctree::with_value(value));
            self.mask |= 1 << octant;
        }
        let slot = self.slot(octant);
        &mut self.children[slot]
    }

    pub fn erase_child(&mut self, octant: u8) -> Option<VoxelOctree> {
        if self.mask & (1 << octant) != 0 {
            let slot = self.slot(octant);
            self.mask &= !(1 << octant);
            Some(self.children.remove(slot))
        } else {
            None
        }
    }

    /// Visit present children in octant order.
    pub fn enumerate<'a, F>(&'a self, mut f: F)
    where
        F: FnMut(u8, &'a VoxelOctree),
    {
        let mut slot = 0;
        for i in 0..8u8 {
            if self.mask & (1 << i) != 0 {
                f(i, &self.children[slot]);
                slot += 1;
            }
        }
    }

    pub fn num_descendants(&self) -> u64 {
        let mut n = 1;
        for c in self.children.iter() {
            n += c.num_descendants();
        }
        n
    }

    pub fn num_leaf_nodes(&self) -> u64 {
        if self.is_leaf_node() {
            return 1;
        }
        let mut n = 0;
        for c in self.children.iter() {
            n += c.num_leaf_nodes();
        }
        n
    }

    pub fn max_depth_levels(&self) -> u32 {
        let mut level = 0;
        for c in self.children.iter() {
            level = level.max(c.max_depth_levels() + 1);
        }
        level
    }

    /// Aggregate the children into this node's value (for LOD display)
    /// and collapse eight identical leaf children into this node.
    /// Returns false when there is nothing to aggregate.
    pub fn merge_solid_branches(&mut self) -> bool {
        let n = self.children.len() as u32;
        if n == 0 {
            return false;
        }

        let mut r = 0u32;
        let mut g = 0u32;
        let mut b = 0u32;
        let mut a = 0u32;
        let mut metallic = 0u32;
        let mut roughness = 0u32;
        for c in self.children.iter() {
            r += c.value.color.r as u32;
            g += c.value.color.g as u32;
            b += c.value.color.b as u32;
            a += c.value.color.a as u32;
            metallic += c.value.metallic as u32;
            roughness += c.value.roughness as u32;
        }
        self.value.color.r = (r / n) as u8;
        self.value.color.g = (g / n) as u8;
        self.value.color.b = (b / n) as u8;
        self.value.color.a = (a / n) as u8;
        self.value.metallic = (metallic / n) as u8;
        self.value.roughness = (roughness / n) as u8;

        if n == 8 {
            let combinable = self
                .children
                .iter()
                .all(|c| c.is_leaf_node() && c.value == self.value);
            if combinable {
                self.children.clear();
                self.mask = 0;
            }
        }
        true
    }

    /// Depth-first flattening into 16-byte nodes, clamped to `max_depth`.
    pub fn make_array(&self, aabb: Aabb, max_depth: u32) -> VolumeArray {
        if aabb.is_null() {
            return VolumeArray::default();
        }

        fn emit(
            node: &VoxelOctree,
            center: Vector3<f32>,
            depth: u32,
            max_depth: u32,
            vector: &mut Vec<VolumeNode>,
        ) {
            let index = vector.len();
            const Q: f32 = u16::MAX as f32;
            vector.push(VolumeNode {
                x: (center.x * Q) as u16,
                y: (center.y * Q) as u16,
                z: (center.z * Q) as u16,
                depth: depth as u8,
                flags: 0,
                advance: 0,
                color: node.value.color,
            });

            if depth < max_depth {
                let he = half_extent(depth);
                node.enumerate(|i, child| {
                    let x = (i & 1) as f32;
                    let y = ((i >> 1) & 1) as f32;
                    let z = ((i >> 2) & 1) as f32;
                    let pt = Vector3::new(
                        center.x + he * (x - 0.5),
                        center.y + he * (y - 0.5),
                        center.z + he * (z - 0.5),
                    );
                    emit(child, pt, depth + 1, max_depth, vector);
                });
            }
            let advance = (vector.len() - index) as u64;
            debug_assert!(advance < u32::MAX as u64);
            let n = &mut vector[index];
            n.advance = advance as u32;
            if n.advance == 1 {
                // leaf-node
                n.flags |= VolumeNode::FLAG_LEAF_NODE;
                n.flags |= VolumeNode::FLAG_MATERIAL;
            }
        }

        let mut data = Vec::with_capacity(self.num_descendants() as usize);
        let max_depth = max_depth.min(MAX_DEPTH);
        emit(self, Vector3::new(0.5, 0.5, 0.5), 0, max_depth, &mut data);
        data.shrink_to_fit();
        VolumeArray { data, aabb }
    }
}

impl Default for VoxelOctree {
    fn default() -> Self {
        Self::new()
    }
}

/// Flat voxel node. Exactly 16 bytes: quantized unit-cube coordinates,
/// the depth exponent, flags, the depth-first subtree size ("advance"),
/// and the node color.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct VolumeNode {
    pub x: u16,
    pub y: u16,
    pub z: u16,
    pub depth: u8,
    pub flags: u8,
    pub advance: u32,
    pub color: Rgba8,
}

impl VolumeNode {
    pub const FLAG_LEAF_NODE: u8 = 1;
    pub const FLAG_MATERIAL: u8 = 1 << 1;
    pub const FLAG_PAYLOAD: u8 = 1 << 2;

    pub fn is_leaf(&self) -> bool {
        self.flags != 0
    }

    /// Cube in unit-cube space.
    pub fn aabb(&self) -> Aabb {
        const Q: f32 = 1.0 / (u16::MAX as f32);
        let he = half_extent(self.depth as u32);
        let ext = Vector3::new(he, he, he);
        let center = Vector3::new(self.x as f32, self.y as f32, self.z as f32) * Q;
        Aabb::new(center - ext, center + ext)
    }

    /// Cube mapped into a world-space volume.
    pub fn aabb_in(&self, volume: &Aabb) -> Aabb {
        let aabb = self.aabb();
        let extents = volume.extents();
        Aabb::new(
            Vector3::new(
                aabb.min.x * extents.x,
                aabb.min.y * extents.y,
                aabb.min.z * extents.z,
            ) + volume.min,
            Vector3::new(
                aabb.max.x * extents.x,
                aabb.max.y * extents.y,
                aabb.max.z * extents.z,
            ) + volume.min,
        )
    }
}

#[derive(Default)]
pub struct VolumeArray {
    pub data: Vec<VolumeNode>,
    pub aabb: Aabb,
}

#[derive(Copy, Clone, Debug)]
pub struct VoxelRayHit<'a> {
    /// Distance from the ray origin in world units.
    pub t: f32,
    pub node: &'a VoxelOctree,
    pub location: (u32, u32, u32),
    pub depth: u32,
}

const FILE_TAG: &[u8] = b"FV.VoxelModel";
const HEADER_SIZE: u64 = 20 + 16 + 8;

/// A voxel volume with a fixed maximum subdivision depth and a world
/// placement (center + uniform scale).
pub struct VoxelModel {
    root: Option<VoxelOctree>,
    max_depth: u32,
    pub center: Vector3<f32>,
    pub scale: f32,
}

impl VoxelModel {
    pub fn new(depth: u32) -> Self {
        Self {
            root: None,
            max_depth: depth.min(MAX_DEPTH),
            center: Vector3::new(0.0, 0.0, 0.0),
            scale: 1.0,
        }
    }

    pub fn root(&self) -> Option<&VoxelOctree> {
        self.root.as_ref()
    }

    pub fn depth(&self) -> u32 {
        self.max_depth
    }

    pub fn resolution(&self) -> u32 {
        (1u64 << self.max_depth.min(63)) as u32
    }

    pub fn num_nodes(&self) -> u64 {
        self.root.as_ref().map_or(0, |r| r.num_descendants())
    }

    pub fn num_leaf_nodes(&self) -> u64 {
        self.root.as_ref().map_or(0, |r| r.num_leaf_nodes())
    }

    pub fn aabb(&self) -> Aabb {
        if self.scale < f32::EPSILON {
            return Aabb::null();
        }
        let half = Vector3::new(self.scale, self.scale, self.scale) * 0.5;
        Aabb::new(self.center - half, self.center + half)
    }

    fn check_range(&self, x: u32, y: u32, z: u32) -> Result<()> {
        let res = self.resolution();
        if x >= res || y >= res || z >= res {
            return Err(GraupelError::OUT_OF_RANGE);
        }
        Ok(())
    }

    pub fn update(&mut self, x: u32, y: u32, z: u32, value: Voxel) -> Result<()> {
        self.check_range(x, y, z)?;
        if self.scale < f32::EPSILON {
            return Err(GraupelError::INVALID);
        }

        fn update_node(
            node: &mut VoxelOctree,
            dim: u32,
            x: u32,
            y: u32,
            z: u32,
            value: Voxel,
        ) -> bool {
            debug_assert!(dim > 0);
            let nx = x / dim;
            let ny = y / dim;
            let nz = z / dim;
            let index = (((nz & 1) << 2) | ((ny & 1) << 1) | (nx & 1)) as u8;

            let mut updated = false;
            if node.child(index).is_none() {
                node.subdivide(index, value);
                updated = true;
            }
            if dim > 1 {
                let child = node.child_mut(index).unwrap();
                if update_node(child, dim >> 1, x % dim, y % dim, z % dim, value) {
                    updated = true;
                }
            } else {
                let child = node.child_mut(index).unwrap();
                if child.value != value {
                    child.value = value;
                    updated = true;
                }
            }
            if updated {
                node.merge_solid_branches();
            }
            updated
        }

        let res = self.resolution();
        if self.root.is_none() {
            self.root = Some(VoxelOctree::with_value(value));
        }
        let root = self.root.as_mut().unwrap();
        if res > 1 {
            if update_node(root, res >> 1, x, y, z, value) {
                root.merge_solid_branches();
            }
        } else {
            debug_assert!(root.is_leaf_node());
            root.value = value;
        }
        Ok(())
    }

    pub fn erase(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.check_range(x, y, z)?;

        fn erase_node(node: &mut VoxelOctree, dim: u32, x: u32, y: u32, z: u32) -> bool {
            debug_assert!(dim > 0);
            let nx = x / dim;
            let ny = y / dim;
            let nz = z / dim;
            let index = (((nz & 1) << 2) | ((ny & 1) << 1) | (nx & 1)) as u8;

            if dim > 1 {
                if node.is_leaf_node() {
                    // expand the implicit value into all eight octants
                    let value = node.value;
                    for i in 0..8u8 {
                        node.subdivide(i, value);
                    }
                }
                if node.child(index).is_some() {
                    let erased = {
                        let child = node.child_mut(index).unwrap();
                        erase_node(child, dim >> 1, x % dim, y % dim, z % dim)
                    };
                    if erased {
                        if node.child(index).map_or(false, |c| c.is_leaf_node()) {
                            node.erase_child(index);
                        }
                        node.merge_solid_branches();
                        return true;
                    }
                }
                false
            } else {
                if node.child(index).is_some() {
                    node.erase_child(index);
                    node.merge_solid_branches();
                    true
                } else if node.is_leaf_node() {
                    // preserve the implicit value in the seven siblings
                    let value = node.value;
                    for i in 0..8u8 {
                        if i != index {
                            node.subdivide(i, value);
                        }
                    }
                    true
                } else {
                    false
                }
            }
        }

        let res = self.resolution();
        if let Some(root) = self.root.as_mut() {
            if res > 1 {
                if erase_node(root, res >> 1, x, y, z) {
                    if root.is_leaf_node() {
                        self.root = None;
                    } else {
                        root.merge_solid_branches();
                    }
                }
            } else {
                debug_assert!(root.is_leaf_node());
                self.root = None;
            }
        }
        Ok(())
    }

    /// Value of the deepest explicit leaf covering the coordinate.
    pub fn lookup(&self, x: u32, y: u32, z: u32) -> Result<Option<Voxel>> {
        self.check_range(x, y, z)?;
        if self.scale < f32::EPSILON {
            return Ok(None);
        }

        fn lookup_node(node: &VoxelOctree, dim: u32, x: u32, y: u32, z: u32) -> &VoxelOctree {
            debug_assert!(dim > 0);
            let nx = x / dim;
            let ny = y / dim;
            let nz = z / dim;
            let index = (((nz & 1) << 2) | ((ny & 1) << 1) | (nx & 1)) as u8;
            match node.child(index) {
                Some(child) => lookup_node(child, dim >> 1, x % dim, y % dim, z % dim),
                None => node,
            }
        }

        if let Some(root) = self.root.as_ref() {
            let res = self.resolution();
            if res > 1 {
                let node = lookup_node(root, res >> 1, x, y, z);
                if node.is_leaf_node() {
                    return Ok(Some(node.value));
                }
            } else {
                debug_assert!(root.is_leaf_node());
                return Ok(Some(root.value));
            }
        }
        Ok(None)
    }

    /// Raising the depth only widens the addressable range; lowering it
    /// prunes everything below the new maximum.
    pub fn set_depth(&mut self, depth: u32) {
        let depth = depth.min(MAX_DEPTH);
        if depth > self.max_depth {
            self.max_depth = depth;
        } else if depth < self.max_depth {
            fn prune(node: &mut VoxelOctree, level: u32, max_depth: u32) {
                if level < max_depth {
                    for c in node.children.iter_mut() {
                        prune(c, level + 1, max_depth);
                    }
                } else {
                    node.children.clear();
                    node.mask = 0;
                }
            }
            self.max_depth = depth;
            if let Some(root) = self.root.as_mut() {
                prune(root, 0, depth);
            }
        }
    }

    /// Bottom-up solid-branch merge over the whole tree.
    pub fn optimize(&mut self) {
        fn backward(node: &mut VoxelOctree) {
            for c in node.children.iter_mut() {
                backward(c);
            }
            node.merge_solid_branches();
        }
        if let Some(root) = self.root.as_mut() {
            backward(root);
        }
    }

    /// Visit every node at `depth` with its world-space AABB. Returns
    /// the number of nodes visited.
    pub fn enumerate_level<F>(&self, depth: u32, mut cb: F) -> u32
    where
        F: FnMut(&Aabb, u32, &VoxelOctree),
    {
        fn iterate<F>(node: &VoxelOctree, aabb: Aabb, level: u32, depth: u32, cb: &mut F) -> u32
        where
            F: FnMut(&Aabb, u32, &VoxelOctree),
        {
            if level < depth {
                let pivot = aabb.min;
                let half = aabb.extents() * 0.5;
                let mut result = 0;
                node.enumerate(|i, child| {
                    let x = (i & 1) as f32;
                    let y = ((i >> 1) & 1) as f32;
                    let z = ((i >> 2) & 1) as f32;
                    let pt = Vector3::new(
                        pivot.x + half.x * x,
                        pivot.y + half.y * y,
                        pivot.z + half.z * z,
                    );
                    result += iterate(child, Aabb::new(pt, pt + half), level + 1, depth, cb);
                });
                return result;
            }
            debug_assert!(level == depth);
            cb(&aabb, level, node);
            1
        }

        if let Some(root) = self.root.as_ref() {
            let volume = self.aabb();
            if !volume.is_null() {
                return iterate(root, volume, 0, depth, &mut cb);
            }
        }
        0
    }

    pub fn make_array(&self, max_depth: u32) -> VolumeArray {
        match self.root.as_ref() {
            Some(root) => root.make_array(self.aabb(), max_depth),
            None => VolumeArray::default(),
        }
    }

    /// Visit every leaf the ray passes through; the filter returns
    /// false to stop. Returns the number of leaf hits.
    pub fn ray_test_filter<F>(&self, ray_origin: Vector3<f32>, dir: Vector3<f32>, mut filter: F) -> u64
    where
        F: FnMut(&VoxelRayHit) -> bool,
    {
        if self.scale < f32::EPSILON {
            return 0;
        }
        let root = match self.root.as_ref() {
            Some(r) => r,
            None => return 0,
        };

        let aabb = self.aabb();
        let scale = Vector3::new(self.scale, self.scale, self.scale);
        let quantize = AffineTransform3::identity()
            .scaled(scale)
            .translated(aabb.min);
        let normalize = quantize.inverted();

        let ray_start = normalize.apply(ray_origin);
        let ray_dir = normalize.apply_direction(dir);

        fn visit<'a, F>(
            node: &'a VoxelOctree,
            center: Vector3<f32>,
            depth: u32,
            resolution: u32,
            start: Vector3<f32>,
            dir: Vector3<f32>,
            keep_going: &mut bool,
            cb: &mut F,
        ) -> u64
        where
            F: FnMut(f32, &'a VoxelOctree, (u32, u32, u32), u32) -> bool,
        {
            let he = half_extent(depth);
            let ext = Vector3::new(he, he, he);
            let aabb = Aabb::new(center - ext, center + ext);
            if let Some(t) = aabb.ray_test(start, dir) {
                if node.is_leaf_node() {
                    let x = (center.x * resolution as f32).floor() as u32;
                    let y = (center.y * resolution as f32).floor() as u32;
                    let z = (center.z * resolution as f32).floor() as u32;
                    if !cb(t, node, (x, y, z), depth) {
                        *keep_going = false;
                    }
                    return 1;
                }
                let mut num_hits = 0;
                let mut slot = 0;
                for i in 0..8u8 {
                    if node.mask & (1 << i) == 0 {
                        continue;
                    }
                    if !*keep_going {
                        break;
                    }
                    let x = (i & 1) as f32;
                    let y = ((i >> 1) & 1) as f32;
                    let z = ((i >> 2) & 1) as f32;
                    let pt = Vector3::new(
                        center.x + he * (x - 0.5),
                        center.y + he * (y - 0.5),
                        center.z + he * (z - 0.5),
                    );
                    num_hits += visit(
                        &node.children[slot],
                        pt,
                        depth + 1,
                        resolution,
                        start,
                        dir,
                        keep_going,
                        cb,
                    );
                    slot += 1;
                }
                return num_hits;
            }
            0
        }

        let mut keep_going = true;
        let resolution = self.resolution();
        let mut cb = |t: f32, node: &VoxelOctree, location: (u32, u32, u32), depth: u32| -> bool {
            let hit = quantize.apply(ray_start + ray_dir * t);
            filter(&VoxelRayHit {
                t: (hit - ray_origin).magnitude(),
                node,
                location,
                depth,
            })
        };
        visit(
            root,
            Vector3::new(0.5, 0.5, 0.5),
            0,
            resolution,
            ray_start,
            ray_dir,
            &mut keep_going,
            &mut cb,
        )
    }

    pub fn ray_test(
        &self,
        ray_origin: Vector3<f32>,
        dir: Vector3<f32>,
        option: RayHitOption,
    ) -> Option<(f32, (u32, u32, u32), u32)> {
        let mut best: Option<(f32, (u32, u32, u32), u32)> = None;
        self.ray_test_filter(ray_origin, dir, |hit| match option {
            RayHitOption::AnyHit => {
                best = Some((hit.t, hit.location, hit.depth));
                false
            }
            RayHitOption::ClosestHit => {
                if best.map_or(true, |(t, _, _)| hit.t < t) {
                    best = Some((hit.t, hit.location, hit.depth));
                }
                true
            }
            RayHitOption::LongestHit => {
                if best.map_or(true, |(t, _, _)| hit.t > t) {
                    best = Some((hit.t, hit.location, hit.depth));
                }
                true
            }
        });
        best
    }

    /// Write the model in the `FV.VoxelModel` format. Returns the
    /// number of bytes written.
    pub fn serialize<W: Write>(&self, stream: &mut W) -> Result<u64> {
        fn write_node<W: Write>(node: &VoxelOctree, stream: &mut W) -> Result<u64> {
            let v = &node.value;
            stream.write_all(&[
                v.color.r,
                v.color.g,
                v.color.b,
                v.color.a,
                v.metallic,
                v.roughness,
                node.mask,
            ])?;
            let mut written = 7u64;
            for c in node.children.iter() {
                written += write_node(c, stream)?;
            }
            Ok(written)
        }

        let mut tag = [0u8; 20];
        tag[..FILE_TAG.len()].copy_from_slice(FILE_TAG);
        stream.write_all(&tag)?;
        stream.write_all(&self.center.x.to_ne_bytes())?;
        stream.write_all(&self.center.y.to_ne_bytes())?;
        stream.write_all(&self.center.z.to_ne_bytes())?;
        stream.write_all(&self.scale.to_ne_bytes())?;

        let total_nodes = self.num_nodes();
        stream.write_all(&total_nodes.to_ne_bytes())?;

        let mut written = HEADER_SIZE;
        if let Some(root) = self.root.as_ref() {
            written += write_node(root, stream)?;
        }
        Ok(written)
    }

    /// Rebuild the model from the `FV.VoxelModel` format. The existing
    /// contents are replaced only after the stream parses cleanly.
    pub fn deserialize<R: Read>(&mut self, stream: &mut R) -> Result<()> {
        let mut tag = [0u8; 20];
        stream.read_exact(&mut tag)?;
        if &tag[..FILE_TAG.len()] != FILE_TAG || tag[FILE_TAG.len()] != 0 {
            log::error!("VoxelModel header mismatch");
            return Err(GraupelError::INVALID);
        }

        let mut f = [0u8; 4];
        let mut bounds = [0f32; 4];
        for b in bounds.iter_mut() {
            stream.read_exact(&mut f)?;
            *b = f32::from_ne_bytes(f);
        }
        let mut q = [0u8; 8];
        stream.read_exact(&mut q)?;
        let total_nodes = u64::from_ne_bytes(q);

        fn read_node<R: Read>(stream: &mut R) -> Result<VoxelOctree> {
            let mut buf = [0u8; 7];
            stream.read_exact(&mut buf)?;
            let mut node = VoxelOctree::with_value(Voxel {
                color: Rgba8::new(buf[0], buf[1], buf[2], buf[3]),
                metallic: buf[4],
                roughness: buf[5],
            });
            let mask = buf[6];
            for i in 0..8u8 {
                if (mask >> i) & 1 != 0 {
                    let child = read_node(stream)?;
                    node.mask |= 1 << i;
                    node.children.push(child);
                }
            }
            Ok(node)
        }

        let root = if total_nodes > 0 {
            match read_node(stream) {
                Ok(node) => Some(node),
                Err(e) => {
                    log::error!("VoxelModel deserialization failed: {:?}", e);
                    return Err(e);
                }
            }
        } else {
            None
        };

        self.center = Vector3::new(bounds[0], bounds[1], bounds[2]);
        self.scale = bounds[3];
        self.max_depth = root.as_ref().map_or(0, |r| r.max_depth_levels());
        self.root = root;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red() -> Voxel {
        Voxel::new(Rgba8::new(255, 0, 0, 255), 128, 64)
    }

    #[test]
    fn volume_node_is_16_bytes() {
        assert_eq!(std::mem::size_of::<VolumeNode>(), 16);
        assert_eq!(memoffset::offset_of!(VolumeNode, depth), 6);
        assert_eq!(memoffset::offset_of!(VolumeNode, advance), 8);
        assert_eq!(memoffset::offset_of!(VolumeNode, color), 12);
    }

    #[test]
    fn half_extent_matches_powers_of_two() {
        assert_eq!(half_extent(0), 0.5);
        assert_eq!(half_extent(1), 0.25);
        assert_eq!(half_extent(2), 0.125);
        assert_eq!(half_extent(10), 0.5 * (0.5f32).powi(10));
    }

    #[test]
    fn update_then_lookup() {
        let mut model = VoxelModel::new(3);
        model.update(1, 1, 1, red()).unwrap();
        assert_eq!(model.lookup(1, 1, 1).unwrap(), Some(red()));
        assert_eq!(model.lookup(0, 0, 0).unwrap(), None);
    }

    #[test]
    fn out_of_range_coordinates_fail() {
        let mut model = VoxelModel::new(2); // resolution 4
        assert!(matches!(
            model.update(4, 0, 0, red()),
            Err(GraupelError::OUT_OF_RANGE)
        ));
        assert!(matches!(
            model.lookup(0, 4, 0),
            Err(GraupelError::OUT_OF_RANGE)
        ));
        assert!(matches!(
            model.erase(0, 0, 4),
            Err(GraupelError::OUT_OF_RANGE)
        ));
    }

    #[test]
    fn serialize_roundtrip() {
        let mut model = VoxelModel::new(3);
        model.update(1, 1, 1, red()).unwrap();
        model
            .update(5, 2, 7, Voxel::new(Rgba8::new(0, 255, 0, 255), 1, 2))
            .unwrap();

        let mut buffer = Vec::new();
        let written = model.serialize(&mut buffer).unwrap();
        assert_eq!(written, buffer.len() as u64);

        let mut restored = VoxelModel::new(0);
        restored.deserialize(&mut buffer.as_slice()).unwrap();

        assert_eq!(restored.depth(), model.depth());
        assert_eq!(restored.num_nodes(), model.num_nodes());
        assert_eq!(restored.lookup(1, 1, 1).unwrap(), Some(red()));
        assert_eq!(restored.lookup(0, 0, 0).unwrap(), None);
        assert_eq!(
            restored.lookup(5, 2, 7).unwrap(),
            Some(Voxel::new(Rgba8::new(0, 255, 0, 255), 1, 2))
        );
    }

    #[test]
    fn bad_header_is_rejected() {
        let mut buffer = vec![0u8; 64];
        buffer[..4].copy_from_slice(b"nope");
        let mut model = VoxelModel::new(1);
        assert!(model.deserialize(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn solid_fill_collapses_to_root_leaf() {
        let mut model = VoxelModel::new(2);
        let v = red();
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    model.update(x, y, z, v).unwrap();
                }
            }
        }
        let root = model.root().unwrap();
        assert!(root.is_leaf_node());
        assert_eq!(root.value, v);
        assert_eq!(model.num_nodes(), 1);
    }

    #[test]
    fn merged_tree_has_no_uniform_internal_nodes() {
        let mut model = VoxelModel::new(2);
        for z in 0..4 {
            for y in 0..4 {
                for x in 0..4 {
                    // two different values so nothing fully collapses
                    let v = if (x + y + z) % 2 == 0 {
                        red()
                    } else {
                        Voxel::new(Rgba8::new(0, 0, 255, 255), 0, 0)
                    };
                    model.update(x, y, z, v).unwrap();
                }
            }
        }

        fn check(node: &VoxelOctree) {
            if node.num_subdivisions() == 8 {
                let uniform = {
                    let mut all = true;
                    node.enumerate(|_, c| {
                        if !c.is_leaf_node() || c.value != node.value {
                            all = false;
                        }
                    });
                    all
                };
                assert!(!uniform, "internal node with eight identical leaf children");
            }
            node.enumerate(|_, c| check(c));
        }
        check(model.root().unwrap());
    }

    #[test]
    fn erase_expands_implicit_values() {
        let mut model = VoxelModel::new(1);
        let v = red();
        // fill everything, which collapses into a single root leaf
        for z in 0..2 {
            for y in 0..2 {
                for x in 0..2 {
                    model.update(x, y, z, v).unwrap();
                }
            }
        }
        assert_eq!(model.num_nodes(), 1);

        // erasing one voxel must keep the other seven intact
        model.erase(0, 0, 0).unwrap();
        assert_eq!(model.lookup(0, 0, 0).unwrap(), None);
        assert_eq!(model.lookup(1, 0, 0).unwrap(), Some(v));
        assert_eq!(model.lookup(1, 1, 1).unwrap(), Some(v));
    }

    #[test]
    fn erase_everything_drops_the_root() {
        let mut model = VoxelModel::new(1);
        model.update(0, 0, 0, red()).unwrap();
        model.erase(0, 0, 0).unwrap();
        assert!(model.root().is_none());
        assert_eq!(model.lookup(0, 0, 0).unwrap(), None);
    }

    #[test]
    fn lowering_depth_prunes_the_tree() {
        let mut model = VoxelModel::new(3);
        model.update(7, 7, 7, red()).unwrap();
        assert!(model.num_nodes() > 2);

        model.set_depth(1);
        assert_eq!(model.depth(), 1);
        assert!(model.root().map_or(0, |r| r.max_depth_levels()) <= 1);
    }

    #[test]
    fn flat_array_flags_and_advance() {
        let mut model = VoxelModel::new(2);
        model.update(0, 0, 0, red()).unwrap();
        model.update(3, 3, 3, red()).unwrap();
        let array = model.make_array(2);
        assert!(!array.data.is_empty());

        // root advance covers the whole array
        assert_eq!(array.data[0].advance as usize, array.data.len());
        for node in array.data.iter() {
            let is_leaf = node.advance == 1;
            assert_eq!(node.is_leaf(), is_leaf);
            if is_leaf {
                assert!(node.flags & VolumeNode::FLAG_LEAF_NODE != 0);
                assert!(node.flags & VolumeNode::FLAG_MATERIAL != 0);
            }
        }
    }

    #[test]
    fn ray_test_reports_the_closest_voxel() {
        let mut model = VoxelModel::new(2);
        model.update(0, 1, 1, red()).unwrap();
        model.update(3, 1, 1, red()).unwrap();

        // model occupies [-0.5, 0.5]^3; shoot along +x through y=z=0.375
        let origin = Vector3::new(-5.0, -0.12, -0.12);
        let dir = Vector3::new(1.0, 0.0, 0.0);
        let (t, location, depth) = model
            .ray_test(origin, dir, RayHitOption::ClosestHit)
            .unwrap();
        assert_eq!(location.0, 0);
        assert_eq!(depth, 2);
        assert!(t > 0.0);

        let (_, far_location, _) = model
            .ray_test(origin, dir, RayHitOption::LongestHit)
            .unwrap();
        assert_eq!(far_location.0, 3);
    }
}
