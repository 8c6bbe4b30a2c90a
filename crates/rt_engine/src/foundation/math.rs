//! Math utilities and types
//!
//! Provides the nalgebra aliases used across the crate and the conversions
//! between nalgebra's column-major matrices and the layouts Vulkan expects.

use ash::vk;

pub use nalgebra::{
    Vector2, Vector3, Vector4,
    Matrix3, Matrix4,
    Quaternion,
    Unit,
};

/// 2D vector type
pub type Vec2 = Vector2<f32>;

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4D vector type
pub type Vec4 = Vector4<f32>;

/// 3x3 matrix type
pub type Mat3 = Matrix3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Quaternion type for rotations
pub type Quat = Unit<Quaternion<f32>>;

/// Transform representing position, rotation, and scale
#[derive(Debug, Clone, PartialEq)]
pub struct Transform {
    /// Position in 3D space
    pub position: Vec3,

    /// Rotation quaternion
    pub rotation: Quat,

    /// Scale factors
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Quat::identity(),
            scale: Vec3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Transform {
    /// Convert to a transformation matrix (translation * rotation * scale)
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * self.rotation.to_homogeneous()
            * Mat4::new_nonuniform_scaling(&self.scale)
    }
}

/// Row-major 3x4 affine part of a matrix, as consumed by acceleration structures
///
/// nalgebra stores matrices column-major, so the rows are read out explicitly.
/// The projective bottom row is dropped.
pub fn to_row_major_3x4(matrix: &Mat4) -> [f32; 12] {
    let mut rows = [0.0; 12];
    for row in 0..3 {
        for column in 0..4 {
            rows[row * 4 + column] = matrix[(row, column)];
        }
    }
    rows
}

/// Convert a world matrix to `VkTransformMatrixKHR`
pub fn to_vk_transform(matrix: &Mat4) -> vk::TransformMatrixKHR {
    vk::TransformMatrixKHR {
        matrix: to_row_major_3x4(matrix),
    }
}

/// Column-major 4x4 array, matching a GLSL `mat4` in a uniform block
pub fn to_cols_array_2d(matrix: &Mat4) -> [[f32; 4]; 4] {
    let mut columns = [[0.0; 4]; 4];
    for (column, out) in columns.iter_mut().enumerate() {
        for (row, value) in out.iter_mut().enumerate() {
            *value = matrix[(row, column)];
        }
    }
    columns
}

/// Right-handed view matrix
pub fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
    Mat4::look_at_rh(&Point3::from(eye), &Point3::from(target), &up)
}

/// Right-handed perspective projection with a vertical FOV in degrees
pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    Mat4::new_perspective(aspect, fov_y_degrees.to_radians(), near, far)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_row_major_translation_lands_in_last_column() {
        let matrix = Mat4::new_translation(&Vec3::new(1.0, 2.0, 3.0));
        let rows = to_row_major_3x4(&matrix);

        assert_relative_eq!(rows[3], 1.0);
        assert_relative_eq!(rows[7], 2.0);
        assert_relative_eq!(rows[11], 3.0);
        assert_relative_eq!(rows[0], 1.0);
        assert_relative_eq!(rows[5], 1.0);
        assert_relative_eq!(rows[10], 1.0);
    }

    #[test]
    fn test_row_major_is_transpose_of_storage() {
        let matrix = Mat4::new(
            1.0, 2.0, 3.0, 4.0,
            5.0, 6.0, 7.0, 8.0,
            9.0, 10.0, 11.0, 12.0,
            0.0, 0.0, 0.0, 1.0,
        );
        let rows = to_row_major_3x4(&matrix);
        let expected: Vec<f32> = (1..=12).map(|v| v as f32).collect();
        assert_eq!(rows.to_vec(), expected);

        // column-major storage reads 1, 5, 9, 0, 2, ...
        assert_relative_eq!(matrix.as_slice()[1], 5.0);
    }

    #[test]
    fn test_cols_array_matches_column_storage() {
        let matrix = Mat4::new_translation(&Vec3::new(4.0, 5.0, 6.0));
        let columns = to_cols_array_2d(&matrix);
        assert_eq!(columns[3], [4.0, 5.0, 6.0, 1.0]);
        assert_eq!(columns[0], [1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_transform_to_matrix_applies_scale_then_translation() {
        let transform = Transform {
            position: Vec3::new(1.0, 0.0, 0.0),
            scale: Vec3::new(2.0, 2.0, 2.0),
            ..Default::default()
        };
        let point = transform.to_matrix().transform_point(&Point3::new(1.0, 1.0, 1.0));
        assert_relative_eq!(point, Point3::new(3.0, 2.0, 2.0));
    }
}
