//! Optional image-analysis collaborator.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::io::model::{ModelError, reply_content, transport_error};

/// Prompt + base64 images in, description out.
pub trait VisionClient {
    fn analyze(&self, prompt: &str, images: &[String]) -> Result<String, ModelError>;
}

/// Ollama `/api/generate` client for a multimodal model.
#[derive(Debug, Clone)]
pub struct OllamaVision {
    client: Client,
    endpoint: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: &'a [String],
    stream: bool,
}

impl OllamaVision {
    pub fn new(endpoint: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        })
    }
}

impl VisionClient for OllamaVision {
    #[instrument(skip_all, fields(model = %self.model, images = images.len()))]
    fn analyze(&self, prompt: &str, images: &[String]) -> Result<String, ModelError> {
        let url = format!("{}/api/generate", self.endpoint);
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            images,
            stream: false,
        };
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .map_err(|err| transport_error(&err, self.timeout))?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|err| transport_error(&err, self.timeout))?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "vision server returned an error status");
            return Err(ModelError::Api {
                status: status.as_u16(),
                message: body.trim().to_string(),
            });
        }

        let description = reply_content(&body)?;
        debug!(bytes = description.len(), "vision model replied");
        Ok(description.trim().to_string())
    }
}

/// Base64-encode image files for a vision request.
pub fn encode_images<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<String>> {
    paths
        .iter()
        .map(|path| {
            let path = path.as_ref();
            let bytes = fs::read(path).with_context(|| format!("read image {}", path.display()))?;
            Ok(STANDARD.encode(bytes))
        })
        .collect()
}

/// Encode image files and ask the vision collaborator about them.
pub fn analyze_image_paths<V, P>(vision: &V, prompt: &str, paths: &[P]) -> Result<String>
where
    V: VisionClient + ?Sized,
    P: AsRef<Path>,
{
    let images = encode_images(paths)?;
    vision
        .analyze(prompt, &images)
        .context("analyze images")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct Recording {
        seen: RefCell<Vec<String>>,
    }

    impl VisionClient for Recording {
        fn analyze(&self, prompt: &str, images: &[String]) -> Result<String, ModelError> {
            self.seen.borrow_mut().extend(images.iter().cloned());
            Ok(format!("{prompt}: {} image(s)", images.len()))
        }
    }

    #[test]
    fn image_files_are_base64_encoded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("shot.png");
        fs::write(&path, b"png").expect("write");

        let vision = Recording {
            seen: RefCell::new(Vec::new()),
        };
        let text = analyze_image_paths(&vision, "describe", &[&path]).expect("analyze");
        assert_eq!(text, "describe: 1 image(s)");
        assert_eq!(vision.seen.borrow().as_slice(), ["cG5n".to_string()]);
    }

    #[test]
    fn missing_image_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = encode_images(&[temp.path().join("nope.png")]).expect_err("missing");
        assert!(format!("{err:#}").contains("read image"));
    }
}
