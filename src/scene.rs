// Scene-level state fed into shader uniform semantics at bind time.

use cgmath::{Matrix4, SquareMatrix};

use crate::geometry::{ProjectionTransform, ViewTransform};

#[derive(Copy, Clone, Debug)]
pub struct SceneState {
    pub view: ViewTransform,
    pub projection: ProjectionTransform,
    pub model: Matrix4<f32>,
}

impl Default for SceneState {
    fn default() -> Self {
        Self {
            view: ViewTransform::default(),
            projection: ProjectionTransform::new(Matrix4::identity()),
            model: Matrix4::identity(),
        }
    }
}
