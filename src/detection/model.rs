use image::RgbImage;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::time::Duration;
use tokio::runtime::Handle;

use crate::error::{Error, Result};

use super::overlay::encode_jpeg;

/// One raw detection as reported by the model, in model-input pixels.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawDetection {
    pub label: u32,
    #[serde(rename = "prob")]
    pub confidence: f32,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

/// The object-detection model. Opaque: an image already resized to the
/// model input goes in, raw detections come out.
pub trait Detector: Send + Sync {
    fn detect(&self, input: &RgbImage) -> Result<Vec<RawDetection>>;
}

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    detections: Vec<RawDetection>,
}

/// Runs the model on a local inference server: the input image is posted as
/// a JPEG and the server answers with its SSD parse result.
///
/// `detect` is called from the inference thread, so the async client is
/// driven through a runtime handle captured at construction.
pub struct HttpDetector {
    client: reqwest::Client,
    url: String,
    runtime: Handle,
}

impl HttpDetector {
    pub fn new(url: impl Into<String>, runtime: Handle) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
            runtime,
        })
    }

    async fn post(&self, jpeg: Vec<u8>) -> Result<Vec<RawDetection>> {
        let part = Part::bytes(jpeg)
            .file_name("frame.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new().part("file", part);

        let response = self
            .client
            .post(&self.url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?;
        let body: DetectResponse = response.json().await?;
        Ok(body.detections)
    }
}

impl Detector for HttpDetector {
    fn detect(&self, input: &RgbImage) -> Result<Vec<RawDetection>> {
        let jpeg = encode_jpeg(input, 90).map_err(|err| Error::ModelInference(err.to_string()))?;
        self.runtime
            .block_on(self.post(jpeg))
            .map_err(|err| Error::ModelInference(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ssd_result_payload() {
        let body = r#"{"detections":[
            {"label":1,"prob":0.91,"xmin":10.0,"ymin":20.0,"xmax":110.0,"ymax":290.0},
            {"label":77,"prob":0.12,"xmin":200.5,"ymin":150.0,"xmax":230.0,"ymax":190.0}
        ]}"#;
        let parsed: DetectResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.detections.len(), 2);
        assert_eq!(parsed.detections[1].label, 77);
        assert!((parsed.detections[1].confidence - 0.12).abs() < f32::EPSILON);
    }

    #[test]
    fn empty_payload_means_no_detections() {
        let parsed: DetectResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.detections.is_empty());
    }
}
