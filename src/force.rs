// cubefluid - GPU-Parallel Free-Surface Fluid Simulator
// Copyright (c) 2025 Filipe da Veiga Ventura Alves
// Licensed under MIT License

//! Pointer drag to force-vector mapping.

use glam::{Vec2, Vec3};

/// Squared drag length (px²) beyond which the force stops growing.
pub const MAX_SQUARED_DRAG: f32 = 1000.0;
/// Force per px² of drag.
pub const FORCE_PER_SQUARED_PIXEL: f32 = 1.0e-11;

/// Force for a drag from `start` to `end` in window pixels (y down), seen
/// from a camera rotated `camera_yaw` radians about the vertical axis.
///
/// The screen-space direction is mapped onto the vertical plane facing the
/// camera: the horizontal components follow the yaw, the vertical one does not.
pub fn force_from_drag(start: Vec2, end: Vec2, camera_yaw: f32) -> Vec3 {
    let delta = end - start;
    let squared_distance = delta.length_squared();
    let angle = (-delta.y).atan2(delta.x);
    let magnitude = squared_distance.min(MAX_SQUARED_DRAG) * FORCE_PER_SQUARED_PIXEL;
    Vec3::new(
        magnitude * angle.cos() * camera_yaw.cos(),
        magnitude * angle.sin(),
        -magnitude * angle.cos() * camera_yaw.sin(),
    )
}

/// Host-side drag tracking. Each frame's force covers only the pointer
/// motion since the previous frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct DragState {
    active: bool,
    start: Vec2,
    end: Vec2,
}

impl DragState {
    pub fn press(&mut self, position: Vec2) {
        self.active = true;
        self.start = position;
        self.end = position;
    }

    pub fn moved(&mut self, position: Vec2) {
        if self.active {
            self.end = position;
        }
    }

    pub fn release(&mut self) {
        self.active = false;
    }

    /// The pointer motion since the previous call, while a drag is held.
    /// Each frame hands this to [`crate::Simulator::apply_force`].
    pub fn take_segment(&mut self) -> Option<(Vec2, Vec2)> {
        let segment = self.active.then_some((self.start, self.end));
        self.start = self.end;
        segment
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f32::consts::FRAC_PI_2;

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).abs().max_element() < 1e-15
    }

    #[test]
    fn horizontal_drag_without_yaw() {
        let force = force_from_drag(Vec2::new(0.0, 0.0), Vec2::new(10.0, 0.0), 0.0);
        assert!(approx(force, Vec3::new(1.0e-9, 0.0, 0.0)), "{force:?}");
    }

    #[test]
    fn upward_drag_is_positive_y_regardless_of_yaw() {
        // Screen y grows downwards.
        let force = force_from_drag(Vec2::new(5.0, 20.0), Vec2::new(5.0, 10.0), 1.3);
        assert!(approx(force, Vec3::new(0.0, 1.0e-9, 0.0)), "{force:?}");
    }

    #[test]
    fn yaw_rotates_the_horizontal_component() {
        let force = force_from_drag(Vec2::ZERO, Vec2::new(10.0, 0.0), FRAC_PI_2);
        assert!(approx(force, Vec3::new(0.0, 0.0, -1.0e-9)), "{force:?}");
    }

    #[test]
    fn magnitude_saturates() {
        let force = force_from_drag(Vec2::ZERO, Vec2::new(500.0, 0.0), 0.0);
        assert!(approx(force, Vec3::new(1.0e-8, 0.0, 0.0)), "{force:?}");
    }

    #[test]
    fn released_drag_yields_no_segment() {
        let mut drag = DragState::default();
        drag.press(Vec2::ZERO);
        drag.moved(Vec2::new(30.0, 0.0));
        assert!(drag.take_segment().is_some());
        drag.release();
        assert_eq!(drag.take_segment(), None);
        assert_eq!(drag.take_segment(), None);
    }

    #[test]
    fn motion_is_consumed_once() {
        let mut drag = DragState::default();
        drag.press(Vec2::new(1.0, 1.0));
        drag.moved(Vec2::new(11.0, 1.0));
        assert_eq!(drag.take_segment(), Some((Vec2::new(1.0, 1.0), Vec2::new(11.0, 1.0))));

        // Still held but not moving: an empty segment and no force.
        let (start, end) = drag.take_segment().unwrap();
        assert_eq!(start, end);
        assert_eq!(force_from_drag(start, end, 0.0), Vec3::ZERO);

        drag.moved(Vec2::new(21.0, 1.0));
        let (start, end) = drag.take_segment().unwrap();
        assert!(approx(force_from_drag(start, end, 0.0), Vec3::new(1.0e-9, 0.0, 0.0)));
    }

    #[test]
    fn moves_without_press_are_ignored() {
        let mut drag = DragState::default();
        drag.moved(Vec2::new(100.0, 100.0));
        assert_eq!(drag.take_segment(), None);
    }
}
