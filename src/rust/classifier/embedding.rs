use std::collections::HashMap;
use std::path::Path;

use image::imageops::FilterType;
use image::DynamicImage;
use log::info;
use ndarray::{Array1, Array4};
use ort::session::Session;
use ort::value::Tensor;

use super::error::ClassifierError;
use crate::models::ExtractorOptions;
use crate::registry::ImageSample;
use crate::runtime::{create_session_builder, RuntimeConfig};

/// Maps an image to a fixed-length embedding vector.
///
/// Implementations must be deterministic for a given image and always return vectors of
/// `embedding_size()` elements. Calls may block; callers on an async runtime run them on
/// a blocking worker.
pub trait FeatureExtractor: Send + Sync {
    /// Number of elements in every vector this extractor produces
    fn embedding_size(&self) -> usize;

    /// Computes the embedding for one encoded image.
    ///
    /// # Errors
    /// - `ImageError` if the payload cannot be decoded
    /// - `ModelError` if inference fails
    fn embed(&self, image: &ImageSample) -> Result<Array1<f32>, ClassifierError>;
}

/// Feature extractor backed by an ONNX image model.
///
/// The model is expected to:
/// - Accept one float input of shape [1, 3, S, S] (NCHW, normalized RGB), where S and
///   the normalization come from [`ExtractorOptions`]
/// - Produce the feature vector on the selected output; every element after the batch
///   axis is taken, so [1, N] and [1, N, 1, 1] both work
///
/// Pick a feature output (pooled or projected embeddings), not a classification head.
#[derive(Debug)]
pub struct OnnxFeatureExtractor {
    session: Session,
    input_name: String,
    output_name: String,
    options: ExtractorOptions,
    embedding_size: usize,
}

impl OnnxFeatureExtractor {
    /// Loads a model taking ImageNet-normalized 224x224 input, reading its first output.
    pub fn from_file(model_path: impl AsRef<Path>, config: &RuntimeConfig) -> Result<Self, ClassifierError> {
        Self::from_file_with_options(model_path, config, ExtractorOptions::default())
    }

    /// Loads the model and infers the embedding width by running a blank image through it.
    ///
    /// # Errors
    /// - `ModelError` if the file is missing, or the named output does not exist
    pub fn from_file_with_options(
        model_path: impl AsRef<Path>,
        config: &RuntimeConfig,
        options: ExtractorOptions,
    ) -> Result<Self, ClassifierError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(ClassifierError::ModelError(format!("Model file not found: {:?}", model_path)));
        }
        if options.input_size == 0 {
            return Err(ClassifierError::ValidationError("Input size must be positive".into()));
        }

        let session = create_session_builder(config)?.commit_from_file(model_path)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| ClassifierError::ModelError("Model must have at least 1 input".into()))?;
        let available: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let output_name = match &options.output_name {
            Some(name) if available.contains(name) => name.clone(),
            Some(name) => {
                return Err(ClassifierError::ModelError(format!(
                    "Model has no output '{}' (outputs: {:?})",
                    name, available
                )))
            }
            None => available.first().cloned().ok_or_else(|| {
                ClassifierError::ModelError("Model must have at least 1 output for embeddings".into())
            })?,
        };

        let mut extractor = Self {
            session,
            input_name,
            output_name,
            options,
            embedding_size: 0,
        };
        let side = extractor.options.input_size;
        let blank = DynamicImage::new_rgb8(side, side);
        extractor.embedding_size = extractor.embed_image(&blank)?.len();
        info!(
            "Loaded feature extractor {:?} (input '{}', output '{}', embedding size {})",
            model_path, extractor.input_name, extractor.output_name, extractor.embedding_size
        );
        Ok(extractor)
    }

    /// Resizes to the model's square input and lays the pixels out as a normalized NCHW tensor.
    fn preprocess(image: &DynamicImage, options: &ExtractorOptions) -> Array4<f32> {
        let size = options.input_size;
        let rgb = image.resize_exact(size, size, FilterType::Triangle).to_rgb8();
        let side = size as usize;
        Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
            let pixel = rgb.get_pixel(x as u32, y as u32);
            (pixel[c] as f32 / 255.0 - options.mean[c]) / options.std[c]
        })
    }

    pub fn embed_image(&self, image: &DynamicImage) -> Result<Array1<f32>, ClassifierError> {
        let input = Self::preprocess(image, &self.options).into_dyn();

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            self.input_name.as_str(),
            Tensor::from_array(input)
                .map_err(|e| ClassifierError::ModelError(format!("Failed to create input tensor: {}", e)))?,
        );

        let outputs = self
            .session
            .run(input_tensors)
            .map_err(|e| ClassifierError::ModelError(format!("Failed to run model: {}", e)))?;
        // the name was checked against the session's outputs on load
        let output_tensor = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| ClassifierError::ModelError(format!("Failed to extract output tensor: {}", e)))?;

        let embedding = Array1::from_iter(output_tensor.iter().copied());
        if embedding.is_empty() {
            return Err(ClassifierError::ModelError("Model produced an empty embedding".into()));
        }
        Ok(embedding)
    }
}

impl FeatureExtractor for OnnxFeatureExtractor {
    fn embedding_size(&self) -> usize {
        self.embedding_size
    }

    fn embed(&self, image: &ImageSample) -> Result<Array1<f32>, ClassifierError> {
        let decoded = image.decode()?;
        let embedding = self.embed_image(&decoded)?;
        if embedding.len() != self.embedding_size {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.embedding_size,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    use crate::models::{BuiltinModel, CLIP_MEAN, CLIP_STD, IMAGENET_MEAN, IMAGENET_STD};

    #[test]
    fn test_preprocess_shape_and_normalization() {
        let white = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 20, Rgb([255, 255, 255])));
        let tensor = OnnxFeatureExtractor::preprocess(&white, &ExtractorOptions::default());
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);
        let expected_red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((tensor[[0, 0, 100, 100]] - expected_red).abs() < 1e-5);
    }

    #[test]
    fn test_preprocess_follows_model_options() {
        let black = DynamicImage::new_rgb8(8, 8);
        let options = ExtractorOptions {
            input_size: 32,
            ..BuiltinModel::ClipVitB32.extractor_options()
        };
        let tensor = OnnxFeatureExtractor::preprocess(&black, &options);
        assert_eq!(tensor.shape(), &[1, 3, 32, 32]);
        let expected_blue = -CLIP_MEAN[2] / CLIP_STD[2];
        assert!((tensor[[0, 2, 5, 5]] - expected_blue).abs() < 1e-5);
    }

    #[test]
    fn test_missing_model_file() {
        let result = OnnxFeatureExtractor::from_file("/nonexistent/model.onnx", &RuntimeConfig::default());
        assert!(matches!(result, Err(ClassifierError::ModelError(_))));
    }
}
