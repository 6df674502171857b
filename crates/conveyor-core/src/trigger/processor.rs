use std::io::Cursor;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, ImageReader};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{ConfigError, ProcessingError};

/// Turns an object's bytes into the data stored for its key.
#[async_trait]
pub trait ObjectProcessor: Send + Sync + 'static {
    async fn process(&self, key: &str, bytes: &[u8]) -> Result<Map<String, Value>, ProcessingError>;
}

const CLASSIFICATIONS: [&str; 3] = ["Document", "Receipt", "Photo"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Sleep for the computed latency before returning.
    pub simulate_latency: bool,
    pub base_latency_ms: f64,
    /// Added on top of the base latency at full complexity.
    pub complexity_latency_ms: f64,
    /// Object size at which complexity saturates at 1.0.
    pub complexity_size_bytes: u64,
    pub long_tail_probability: f64,
    pub long_tail_ms: f64,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            simulate_latency: false,
            base_latency_ms: 200.0,
            complexity_latency_ms: 1800.0,
            complexity_size_bytes: 10 * 1024 * 1024,
            long_tail_probability: 0.05,
            long_tail_ms: 1000.0,
        }
    }
}

impl ImageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.long_tail_probability) {
            return Err(ConfigError::InvalidValue(
                "image.long_tail_probability must be in [0, 1]".into(),
            ));
        }
        if self.complexity_size_bytes == 0 {
            return Err(ConfigError::InvalidValue(
                "image.complexity_size_bytes must be > 0".into(),
            ));
        }
        if self.base_latency_ms < 0.0 || self.complexity_latency_ms < 0.0 || self.long_tail_ms < 0.0 {
            return Err(ConfigError::InvalidValue(
                "image latencies must be >= 0".into(),
            ));
        }
        Ok(())
    }

    pub fn complexity(&self, file_size: u64) -> f64 {
        (file_size as f64 / self.complexity_size_bytes as f64).min(1.0)
    }
}

/// Reads image dimensions and format and attaches a simulated
/// classification and latency.
pub struct ImageMetadataProcessor {
    config: ImageConfig,
}

impl ImageMetadataProcessor {
    pub fn new(config: ImageConfig) -> Self {
        Self { config }
    }
}

fn format_name(format: ImageFormat) -> String {
    format!("{format:?}").to_uppercase()
}

#[async_trait]
impl ObjectProcessor for ImageMetadataProcessor {
    async fn process(&self, key: &str, bytes: &[u8]) -> Result<Map<String, Value>, ProcessingError> {
        let reader = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| ProcessingError::permanent(format!("unreadable image: {e}")))?;
        let format = reader
            .format()
            .map(format_name)
            .unwrap_or_else(|| "Unknown".to_string());
        let (width, height) = reader
            .into_dimensions()
            .map_err(|e| ProcessingError::permanent(format!("undecodable image: {e}")))?;

        let file_size = bytes.len() as u64;
        let complexity = self.config.complexity(file_size);
        let (long_tail, classification) = {
            let mut rng = rand::thread_rng();
            let long_tail = rng.gen_bool(self.config.long_tail_probability);
            let classification = CLASSIFICATIONS.choose(&mut rng).copied().unwrap_or("Photo");
            (long_tail, classification)
        };
        let mut latency_ms =
            self.config.base_latency_ms + complexity * self.config.complexity_latency_ms;
        if long_tail {
            latency_ms += self.config.long_tail_ms;
            debug!(key, "long tail latency applied");
        }
        if self.config.simulate_latency {
            tokio::time::sleep(Duration::from_secs_f64(latency_ms / 1000.0)).await;
        }

        let mut data = Map::new();
        data.insert("filename".into(), Value::from(key));
        data.insert("file_size".into(), Value::from(file_size));
        data.insert("width".into(), Value::from(width));
        data.insert("height".into(), Value::from(height));
        data.insert("format".into(), Value::from(format));
        data.insert("complexity_score".into(), Value::from(complexity));
        data.insert(
            "processing_latency_ms".into(),
            Value::from((latency_ms * 100.0).round() / 100.0),
        );
        data.insert("simulated_classification".into(), Value::from(classification));
        Ok(data)
    }
}

#[cfg(test)]
pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    image::RgbImage::new(width, height)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> ImageMetadataProcessor {
        ImageMetadataProcessor::new(ImageConfig {
            long_tail_probability: 0.0,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn extracts_png_metadata() {
        let bytes = png_bytes(64, 32);
        let data = quiet().process("photo1.png", &bytes).await.unwrap();

        assert_eq!(data["filename"], "photo1.png");
        assert_eq!(data["file_size"], bytes.len() as u64);
        assert_eq!(data["width"], 64);
        assert_eq!(data["height"], 32);
        assert_eq!(data["format"], "PNG");
        let class = data["simulated_classification"].as_str().unwrap();
        assert!(CLASSIFICATIONS.contains(&class));
        let latency = data["processing_latency_ms"].as_f64().unwrap();
        assert!((200.0..200.1).contains(&latency), "got {latency}");
    }

    #[tokio::test]
    async fn garbage_is_a_permanent_error() {
        let err = quiet().process("notes.txt", b"hello world").await.unwrap_err();
        assert!(matches!(err, ProcessingError::Permanent(_)));
    }

    #[tokio::test]
    async fn long_tail_adds_latency() {
        let processor = ImageMetadataProcessor::new(ImageConfig {
            long_tail_probability: 1.0,
            ..Default::default()
        });
        let data = processor.process("a.png", &png_bytes(1, 1)).await.unwrap();
        assert!(data["processing_latency_ms"].as_f64().unwrap() >= 1200.0);
    }

    #[test]
    fn complexity_saturates() {
        let config = ImageConfig::default();
        assert_eq!(config.complexity(5 * 1024 * 1024), 0.5);
        assert_eq!(config.complexity(50 * 1024 * 1024), 1.0);
        assert!(ImageConfig {
            long_tail_probability: 1.5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
