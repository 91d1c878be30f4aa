use serde::{Deserialize, Serialize};

/// Keypoints names of the COCO17 body, used by MoveNet and PoseNet
pub const COCO17: [&str; 17] = [
    "nose",
    "left_eye",
    "right_eye",
    "left_ear",
    "right_ear",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
];

/// Keypoints names of the BlazePose body
pub const BLAZEPOSE33: [&str; 33] = [
    "nose",
    "left_eye_inner",
    "left_eye",
    "left_eye_outer",
    "right_eye_inner",
    "right_eye",
    "right_eye_outer",
    "left_ear",
    "right_ear",
    "mouth_left",
    "mouth_right",
    "left_shoulder",
    "right_shoulder",
    "left_elbow",
    "right_elbow",
    "left_wrist",
    "right_wrist",
    "left_pinky",
    "right_pinky",
    "left_index",
    "right_index",
    "left_thumb",
    "right_thumb",
    "left_hip",
    "right_hip",
    "left_knee",
    "right_knee",
    "left_ankle",
    "right_ankle",
    "left_heel",
    "right_heel",
    "left_foot_index",
    "right_foot_index",
];

const COCO17_PAIRS: [(usize, usize); 16] = [
    (0, 1), (0, 2), (1, 3), (2, 4),
    (5, 6), (5, 7), (5, 11), (6, 8),
    (6, 12), (7, 9), (8, 10), (11, 12),
    (11, 13), (12, 14), (13, 15), (14, 16),
];

const BLAZEPOSE33_PAIRS: [(usize, usize); 35] = [
    (0, 1), (0, 4), (1, 2), (2, 3), (3, 7),
    (4, 5), (5, 6), (6, 8), (9, 10), (11, 12),
    (11, 13), (11, 23), (12, 14), (14, 16), (12, 24),
    (13, 15), (15, 17), (16, 18), (16, 20), (15, 19),
    (15, 21), (16, 22), (17, 19), (18, 20), (23, 25),
    (23, 24), (24, 26), (25, 27), (26, 28), (27, 29),
    (28, 30), (27, 31), (28, 32), (29, 31), (30, 32),
];

/// Which reference body a model produces keypoints for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BodyLayout {
    Coco17,
    BlazePose33,
}

impl BodyLayout {
    /// Keypoint names, indexed like the keypoints of a pose
    pub fn names(&self) -> &'static [&'static str] {
        match self {
            BodyLayout::Coco17 => &COCO17,
            BodyLayout::BlazePose33 => &BLAZEPOSE33,
        }
    }

    /// Pairs of keypoint indices joined by a bone of the skeleton
    pub fn adjacent_pairs(&self) -> &'static [(usize, usize)] {
        match self {
            BodyLayout::Coco17 => &COCO17_PAIRS,
            BodyLayout::BlazePose33 => &BLAZEPOSE33_PAIRS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub w: usize,
    pub h: usize,
}

impl Resolution {
    pub fn new(w: usize, h: usize) -> Self {
        Self { w, h }
    }
}

/// A single detected body point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keypoint {
    /// Screen-space coordinates in pixels
    pub position: glam::Vec2,
    /// Confidence of the detection in [0, 1], if the model provides one
    pub score: Option<f32>,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, score: f32) -> Self {
        Self {
            position: glam::Vec2::new(x, y),
            score: Some(score),
        }
    }

    /// Keypoints without a score are always considered visible
    pub fn is_visible(&self, threshold: f32) -> bool {
        self.score.map_or(true, |s| s >= threshold)
    }
}

/// The detected pose of a person in a single frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pose {
    /// Keypoints in the order of the model's body layout
    pub keypoints: Vec<Keypoint>,
    /// Overall confidence of the pose
    pub score: Option<f32>,
    /// Tracking id, stable across frames when the model tracks people
    pub id: Option<u32>,
}

/// Ordered sequence of poses detected in one frame
pub type PoseResult = Vec<Pose>;

/// A captured video frame
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic index of the frame inside its capture stream
    pub sequence: u64,
    pub resolution: Resolution,
    /// Packed RGB pixels
    pub storage: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_reference_valid_keypoints() {
        for layout in [BodyLayout::Coco17, BodyLayout::BlazePose33] {
            let count = layout.names().len();
            for (a, b) in layout.adjacent_pairs() {
                assert!(*a < count && *b < count, "{layout:?} pair ({a}, {b})");
            }
        }
    }

    #[test]
    fn layouts_match_model_outputs() {
        assert_eq!(BodyLayout::Coco17.names().len(), 17);
        assert_eq!(BodyLayout::BlazePose33.names().len(), 33);
        assert_eq!(BodyLayout::Coco17.names()[10], "right_wrist");
        assert_eq!(BodyLayout::BlazePose33.names()[16], "right_wrist");
    }

    #[test]
    fn visibility_threshold() {
        let kp = Keypoint::new(0.0, 0.0, 0.29);
        assert!(!kp.is_visible(0.3));
        assert!(kp.is_visible(0.2));

        let unscored = Keypoint { position: glam::Vec2::ZERO, score: None };
        assert!(unscored.is_visible(0.99));
    }

    #[test]
    fn pose_serializes_with_positions() {
        let pose = Pose {
            keypoints: vec![Keypoint::new(1.0, 2.0, 0.5)],
            score: None,
            id: Some(3),
        };
        let json = serde_json::to_string(&pose).unwrap();
        let back: Pose = serde_json::from_str(&json).unwrap();
        assert_eq!(back, pose);
    }
}
