/// Feature-extractor models the crate knows how to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinModel {
    /// CLIP ViT-B/32 image tower (8-bit quantized ONNX export); no classification head
    ClipVitB32,
}

/// Static facts about a model, known before it is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelCharacteristics {
    pub embedding_size: usize,
    pub input_size: u32,
    pub model_size_mb: usize,
}

/// Where to fetch a model and how to check it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub model_url: String,
    /// Expected SHA-256 of the model file, lowercase hex. Without one, the digest of the
    /// first verified download is recorded and later loads are checked against it.
    pub model_hash: Option<String>,
}

/// How input pixels are prepared and which graph output carries the features.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractorOptions {
    /// Side of the square input image
    pub input_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    /// Output holding the feature vector; `None` takes the first output
    pub output_name: Option<String>,
}

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];
pub const CLIP_MEAN: [f32; 3] = [0.48145466, 0.4578275, 0.40821073];
pub const CLIP_STD: [f32; 3] = [0.26862954, 0.261_302_6, 0.275_777_1];

impl Default for ExtractorOptions {
    /// ImageNet-normalized 224x224 input, first output.
    fn default() -> Self {
        Self {
            input_size: 224,
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
            output_name: None,
        }
    }
}

impl BuiltinModel {
    pub fn get_model_info(&self) -> ModelInfo {
        match self {
            BuiltinModel::ClipVitB32 => ModelInfo {
                name: "clip-vit-b32".to_string(),
                model_url: "https://huggingface.co/Xenova/clip-vit-base-patch32/resolve/main/onnx/vision_model_quantized.onnx".to_string(),
                // TODO: pin the upstream SHA-256 of vision_model_quantized.onnx here once it is recorded from a verified download
                model_hash: None,
            },
        }
    }

    pub fn characteristics(&self) -> ModelCharacteristics {
        match self {
            BuiltinModel::ClipVitB32 => ModelCharacteristics {
                embedding_size: 512,
                input_size: 224,
                model_size_mb: 88,
            },
        }
    }

    pub fn extractor_options(&self) -> ExtractorOptions {
        match self {
            BuiltinModel::ClipVitB32 => ExtractorOptions {
                input_size: self.characteristics().input_size,
                mean: CLIP_MEAN,
                std: CLIP_STD,
                output_name: Some("image_embeds".to_string()),
            },
        }
    }
}
