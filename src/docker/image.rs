// ABOUTME: Base image management for sandbox containers
// Checks for the sandbox image locally and builds it once from a Dockerfile when missing

use super::{archive, EnvironmentError};
use bollard::image::{BuildImageOptions, ListImagesOptions};
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

/// Dockerfile used when no custom one is configured
pub const DEFAULT_DOCKERFILE: &str = r#"FROM ubuntu:22.04
ENV DEBIAN_FRONTEND=noninteractive
RUN apt-get update \
    && apt-get install -y --no-install-recommends \
       bash coreutils findutils procps git nano vim python3 python3-pip nodejs npm \
    && rm -rf /var/lib/apt/lists/*
WORKDIR /workspace
CMD ["/bin/bash"]
"#;

pub struct ImageBuilder {
    docker: Docker,
    image: String,
    dockerfile: Option<PathBuf>,
    ready: OnceCell<()>,
}

impl ImageBuilder {
    pub fn new(docker: Docker, image: String, dockerfile: Option<PathBuf>) -> Self {
        Self {
            docker,
            image,
            dockerfile,
            ready: OnceCell::new(),
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Make sure the image exists. Concurrent callers wait on a single check/build;
    /// a failed build is retried by the next caller.
    pub async fn ensure_image(&self) -> Result<(), EnvironmentError> {
        self.ready
            .get_or_try_init(|| async {
                if self.image_exists().await? {
                    debug!("Image {} already exists locally", self.image);
                    return Ok(());
                }
                self.build().await
            })
            .await
            .map(|_| ())
    }

    async fn image_exists(&self) -> Result<bool, EnvironmentError> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                filters: {
                    let mut filters = HashMap::new();
                    filters.insert("reference".to_string(), vec![self.image.clone()]);
                    filters
                },
                ..Default::default()
            }))
            .await
            .map_err(|e| EnvironmentError::Provision(format!("Failed to list images: {e}")))?;

        Ok(!images.is_empty())
    }

    async fn dockerfile_contents(&self) -> Result<String, EnvironmentError> {
        match &self.dockerfile {
            Some(path) => tokio::fs::read_to_string(path).await.map_err(|e| {
                EnvironmentError::Provision(format!(
                    "Failed to read Dockerfile {}: {e}",
                    path.display()
                ))
            }),
            None => Ok(DEFAULT_DOCKERFILE.to_string()),
        }
    }

    async fn build(&self) -> Result<(), EnvironmentError> {
        info!("Building sandbox image {}", self.image);

        let dockerfile = self.dockerfile_contents().await?;
        let context = archive::build_context(&dockerfile)
            .map_err(|e| EnvironmentError::Provision(format!("Failed to pack build context: {e}")))?;

        let options = BuildImageOptions {
            dockerfile: "Dockerfile".to_string(),
            t: self.image.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(options, None, Some(context.into()));

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(message) = info.error {
                        error!("Image build for {} failed: {}", self.image, message);
                        return Err(EnvironmentError::Provision(format!(
                            "Image build failed: {message}"
                        )));
                    }
                    if let Some(line) = info.stream {
                        let line = line.trim_end();
                        if !line.is_empty() {
                            debug!("[build {}] {}", self.image, line);
                        }
                    }
                }
                Err(e) => {
                    error!("Failed to build image {}: {}", self.image, e);
                    return Err(EnvironmentError::Provision(format!(
                        "Failed to build image: {e}"
                    )));
                }
            }
        }

        info!("Sandbox image {} built successfully", self.image);
        Ok(())
    }
}
