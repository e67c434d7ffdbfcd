#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ndarray::Array1;
use teachable::{
    ClassDefinition, ClassifierError, FeatureExtractor, ImageSample, TeachableMachine,
};

pub const DIM: usize = 8;

// Initialize test logger
pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Places each image near one axis: byte 0 picks the axis, byte 1 nudges the vector
/// towards the next axis.
pub struct ClusterExtractor {
    pub delay: Option<Duration>,
}

impl ClusterExtractor {
    pub fn new() -> Self {
        Self { delay: None }
    }

    pub fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }
}

impl FeatureExtractor for ClusterExtractor {
    fn embedding_size(&self) -> usize {
        DIM
    }

    fn embed(&self, image: &ImageSample) -> Result<Array1<f32>, ClassifierError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let bytes = image.as_bytes();
        if bytes.len() < 2 {
            return Err(ClassifierError::ImageError("payload too short".into()));
        }
        let axis = bytes[0] as usize % DIM;
        let jitter = bytes[1] as f32 / 255.0 * 0.2;
        let mut v = Array1::from_elem(DIM, 0.05f32);
        v[axis] = 1.0;
        v[(axis + 1) % DIM] += jitter;
        Ok(v)
    }
}

pub fn image(axis: u8, variant: u8) -> ImageSample {
    ImageSample::from_bytes(vec![axis, variant])
}

pub const CAT: u8 = 0;
pub const DOG: u8 = 3;

/// `cat` with 3 images and `dog` with 2, untrained.
pub fn cat_dog_machine(extractor: ClusterExtractor) -> TeachableMachine {
    TeachableMachine::builder()
        .with_extractor(Arc::new(extractor))
        .unwrap()
        .with_frame_interval(Duration::from_millis(1))
        .add_class(
            ClassDefinition::new("cat")
                .with_images(vec![image(CAT, 10), image(CAT, 60), image(CAT, 120)]),
        )
        .unwrap()
        .add_class(ClassDefinition::new("dog").with_images(vec![image(DOG, 20), image(DOG, 90)]))
        .unwrap()
        .build()
        .unwrap()
}
