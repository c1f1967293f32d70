//! Visibility tests used by the transform scheduler's culling phase.

use glam::{Mat4, Vec3, Vec4};

/// Plane `normal · p + distance = 0`, normal pointing into the kept
/// half-space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Plane {
    pub normal: Vec3,
    pub distance: f32,
}

impl Plane {
    /// Normalized plane from raw `(a, b, c, d)` coefficients.
    fn from_coefficients(v: Vec4) -> Self {
        let normal = v.truncate();
        let len = normal.length();
        if len > f32::EPSILON {
            Self {
                normal: normal / len,
                distance: v.w / len,
            }
        } else {
            Self {
                normal: Vec3::ZERO,
                distance: 0.0,
            }
        }
    }

    pub fn signed_distance(&self, point: Vec3) -> f32 {
        self.normal.dot(point) + self.distance
    }
}

/// View frustum as six inward-facing planes: left, right, bottom, top, near,
/// far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    pub planes: [Plane; 6],
}

impl Frustum {
    /// Gribb-Hartmann extraction from a view-projection matrix with a
    /// `[0, 1]` depth range (what `Mat4::perspective_rh` produces).
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let r0 = vp.row(0);
        let r1 = vp.row(1);
        let r2 = vp.row(2);
        let r3 = vp.row(3);
        Self {
            planes: [
                Plane::from_coefficients(r3 + r0),
                Plane::from_coefficients(r3 - r0),
                Plane::from_coefficients(r3 + r1),
                Plane::from_coefficients(r3 - r1),
                Plane::from_coefficients(r2),
                Plane::from_coefficients(r3 - r2),
            ],
        }
    }

    /// Whether a sphere is at least partly inside.
    pub fn intersects_sphere(&self, center: Vec3, radius: f32) -> bool {
        self.planes
            .iter()
            .all(|plane| plane.signed_distance(center) >= -radius)
    }
}

/// Whether a sphere lies entirely beyond `max_distance` from `eye`.
pub fn beyond_distance(eye: Vec3, center: Vec3, radius: f32, max_distance: f32) -> bool {
    eye.distance(center) - radius > max_distance
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera_frustum() -> Frustum {
        // Eye at origin looking down -Z.
        let proj = Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, 0.1, 100.0);
        let view = Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        Frustum::from_view_projection(&(proj * view))
    }

    #[test]
    fn planes_are_normalized() {
        for plane in camera_frustum().planes {
            assert!((plane.normal.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn points_in_front_are_inside() {
        let f = camera_frustum();
        assert!(f.intersects_sphere(Vec3::new(0.0, 0.0, -10.0), 0.0));
        assert!(f.intersects_sphere(Vec3::new(5.0, 0.0, -10.0), 0.0));
    }

    #[test]
    fn points_behind_or_beyond_far_are_outside() {
        let f = camera_frustum();
        assert!(!f.intersects_sphere(Vec3::new(0.0, 0.0, 10.0), 0.5));
        assert!(!f.intersects_sphere(Vec3::new(0.0, 0.0, -150.0), 1.0));
        // 90 degree fov: x = 20 at depth 10 is well outside the right plane.
        assert!(!f.intersects_sphere(Vec3::new(20.0, 0.0, -10.0), 1.0));
    }

    #[test]
    fn radius_reaches_back_into_frustum() {
        let f = camera_frustum();
        assert!(f.intersects_sphere(Vec3::new(0.0, 0.0, 1.0), 2.0));
    }

    #[test]
    fn distance_test_accounts_for_radius() {
        let eye = Vec3::ZERO;
        assert!(beyond_distance(eye, Vec3::new(0.0, 0.0, 60.0), 5.0, 50.0));
        assert!(!beyond_distance(eye, Vec3::new(0.0, 0.0, 54.0), 5.0, 50.0));
    }
}
