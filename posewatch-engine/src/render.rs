//! Composition of the rendered frame: raw frame, pose overlay, indicators.

use glam::Vec2;

use posewatch_common::{BodyLayout, Frame, Pose, Resolution};

use crate::config::Configuration;
use crate::model::ModelRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Color(pub [u8; 3]);

impl Color {
    pub const WHITE: Color = Color([255, 255, 255]);
}

/// Colours assigned to tracked people, indexed by tracking id
pub const TRACK_PALETTE: [Color; 8] = [
    Color([255, 0, 0]),
    Color([0, 255, 0]),
    Color([0, 0, 255]),
    Color([255, 255, 0]),
    Color([0, 255, 255]),
    Color([255, 0, 255]),
    Color([255, 128, 0]),
    Color([128, 0, 255]),
];

/// Drawing primitives of the output canvas
pub trait Surface: Send {
    fn draw_frame(&mut self, frame: &Frame);
    fn draw_keypoint(&mut self, at: Vec2, color: Color);
    fn draw_segment(&mut self, from: Vec2, to: Vec2, color: Color);
    /// Border of the capture area
    fn draw_border(&mut self, resolution: Resolution);
}

/// How poses of the current detector are drawn
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Overlay {
    pub layout: BodyLayout,
    pub score_threshold: f32,
}

impl Overlay {
    pub fn new(request: &ModelRequest, config: &Configuration) -> Self {
        Self {
            layout: request.layout(),
            score_threshold: config.score_threshold(),
        }
    }

    pub fn color_of(pose: &Pose) -> Color {
        match pose.id {
            Some(id) => TRACK_PALETTE[id as usize % TRACK_PALETTE.len()],
            None => Color::WHITE,
        }
    }

    pub fn draw(&self, surface: &mut dyn Surface, poses: &[Pose]) {
        for pose in poses {
            let color = Self::color_of(pose);

            for kp in pose.keypoints.iter().filter(|kp| kp.is_visible(self.score_threshold)) {
                surface.draw_keypoint(kp.position, color);
            }

            for (a, b) in self.layout.adjacent_pairs() {
                let (Some(kp_a), Some(kp_b)) = (pose.keypoints.get(*a), pose.keypoints.get(*b)) else {
                    continue;
                };
                if kp_a.is_visible(self.score_threshold) && kp_b.is_visible(self.score_threshold) {
                    surface.draw_segment(kp_a.position, kp_b.position, color);
                }
            }
        }
    }
}

/// Surface that only traces what would be drawn
#[derive(Debug, Default)]
pub struct TracingSurface {
    keypoints: usize,
    segments: usize,
}

impl Surface for TracingSurface {
    fn draw_frame(&mut self, frame: &Frame) {
        self.keypoints = 0;
        self.segments = 0;
        tracing::trace!(
            "frame {} ({}x{})",
            frame.sequence,
            frame.resolution.w,
            frame.resolution.h
        );
    }

    fn draw_keypoint(&mut self, _at: Vec2, _color: Color) {
        self.keypoints += 1;
    }

    fn draw_segment(&mut self, _from: Vec2, _to: Vec2, _color: Color) {
        self.segments += 1;
    }

    fn draw_border(&mut self, _resolution: Resolution) {
        tracing::trace!(
            "overlay: {} keypoints, {} segments",
            self.keypoints,
            self.segments
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use posewatch_common::Keypoint;

    #[derive(Default)]
    struct Counter {
        keypoints: Vec<Color>,
        segments: usize,
    }

    impl Surface for Counter {
        fn draw_frame(&mut self, _frame: &Frame) {}
        fn draw_keypoint(&mut self, _at: Vec2, color: Color) {
            self.keypoints.push(color);
        }
        fn draw_segment(&mut self, _from: Vec2, _to: Vec2, _color: Color) {
            self.segments += 1;
        }
        fn draw_border(&mut self, _resolution: Resolution) {}
    }

    fn pose(scores: &[f32], id: Option<u32>) -> Pose {
        Pose {
            keypoints: scores
                .iter()
                .enumerate()
                .map(|(i, s)| Keypoint::new(i as f32, i as f32, *s))
                .collect(),
            score: None,
            id,
        }
    }

    #[test]
    fn hides_low_score_keypoints_and_their_bones() {
        let overlay = Overlay {
            layout: BodyLayout::Coco17,
            score_threshold: 0.5,
        };
        let mut scores = [0.9; 17];
        // Left eye hides bones (0, 1) and (1, 3)
        scores[1] = 0.1;

        let mut surface = Counter::default();
        overlay.draw(&mut surface, &[pose(&scores, None)]);

        assert_eq!(surface.keypoints.len(), 16);
        assert_eq!(surface.segments, 14);
        assert!(surface.keypoints.iter().all(|c| *c == Color::WHITE));
    }

    #[test]
    fn tracked_poses_use_palette() {
        let overlay = Overlay {
            layout: BodyLayout::Coco17,
            score_threshold: 0.3,
        };
        let mut surface = Counter::default();
        overlay.draw(&mut surface, &[pose(&[0.9], Some(9))]);

        assert_eq!(surface.keypoints, vec![TRACK_PALETTE[1]]);
        assert_eq!(surface.segments, 0);
    }
}
