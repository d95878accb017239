//! Spherical-polygon reach cone.
//!
//! The polygon is a closed loop of unit directions on the sphere, wound
//! consistently around the limit axis. A swing direction inside the polygon
//! passes through; one outside is projected onto the nearest boundary arc.

use nalgebra::{UnitQuaternion, Vector3};

use marionet_core::math::{from_to_rotation, SQR_EPSILON};

/// Clamp the swing of `axis` under `rotation` into the polygon.
///
/// Polygons with fewer than 3 usable points leave the rotation unchanged.
pub fn clamp_to_polygon(
    rotation: UnitQuaternion<f32>,
    axis: Vector3<f32>,
    points: &[Vector3<f32>],
) -> UnitQuaternion<f32> {
    if points.len() < 3 || axis.norm_squared() < SQR_EPSILON {
        return rotation;
    }

    let direction = rotation * axis.normalize();
    if inside(direction, points) {
        return rotation;
    }

    let clamped = nearest_boundary_point(direction, points);
    from_to_rotation(direction, clamped) * rotation
}

/// Winding sign of the polygon: +1 when the loop runs counter-clockwise
/// around its own centroid, -1 otherwise.
fn winding(points: &[Vector3<f32>]) -> f32 {
    let centroid = points
        .iter()
        .fold(Vector3::zeros(), |acc, p| acc + p);
    let mut total = 0.0;
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        total += a.cross(&b).dot(&centroid);
    }
    if total < 0.0 { -1.0 } else { 1.0 }
}

fn inside(direction: Vector3<f32>, points: &[Vector3<f32>]) -> bool {
    let sign = winding(points);
    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        if sign * a.cross(&b).dot(&direction) < -1.0e-6 {
            return false;
        }
    }
    true
}

/// The closest point to `direction` on the polygon's boundary arcs.
fn nearest_boundary_point(direction: Vector3<f32>, points: &[Vector3<f32>]) -> Vector3<f32> {
    let mut best = points[0];
    let mut best_dot = f32::MIN;

    for (i, a) in points.iter().enumerate() {
        let b = points[(i + 1) % points.len()];
        let candidate = closest_on_arc(direction, *a, b);
        let dot = candidate.dot(&direction);
        if dot > best_dot {
            best_dot = dot;
            best = candidate;
        }
    }
    best
}

/// Closest point to `direction` on the great-circle arc from `a` to `b`.
fn closest_on_arc(direction: Vector3<f32>, a: Vector3<f32>, b: Vector3<f32>) -> Vector3<f32> {
    let normal = a.cross(&b);
    if normal.norm_squared() < SQR_EPSILON {
        return a;
    }
    let normal = normal.normalize();

    let projected = direction - normal * normal.dot(&direction);
    if projected.norm_squared() < SQR_EPSILON {
        return a;
    }
    let projected = projected.normalize();

    // Between the arc endpoints?
    if a.cross(&projected).dot(&normal) >= 0.0 && projected.cross(&b).dot(&normal) >= 0.0 {
        return projected;
    }

    if direction.dot(&a) >= direction.dot(&b) { a } else { b }
}
