//! Ephemeral image built from a source tree.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{ignore_missing, Fixture, NetworkHandle};
use crate::error::FixtureError;
use crate::runtime::{BuildRequest, ContainerRuntime, ImageId};

/// What to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSpec {
    /// Project name; the tag is derived from it.
    pub project: String,
    /// Build context directory.
    pub context: PathBuf,
    /// Build descriptor relative to `context`.
    pub dockerfile: PathBuf,
}

#[derive(Debug, Clone)]
enum ImageState {
    Unbuilt,
    Built(ImageId),
    Disposed,
}

/// An image whose lifecycle is independent from any container running it.
pub struct ImageFixture {
    spec: ImageSpec,
    tag: String,
    runtime: Arc<dyn ContainerRuntime>,
    state: Mutex<ImageState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ImageFixture {
    /// An image tagged `{project}-{uuid}`, lower-cased.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, spec: ImageSpec) -> Self {
        let tag = format!("{}-{}", spec.project, uuid::Uuid::new_v4()).to_lowercase();
        Self {
            spec,
            tag,
            runtime,
            state: Mutex::new(ImageState::Unbuilt),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// The generated tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The build description.
    pub fn spec(&self) -> &ImageSpec {
        &self.spec
    }

    /// Build the image, or return the existing one.
    ///
    /// A failed build is surfaced as [`FixtureError::Build`] and not retried.
    pub async fn build(&self) -> Result<ImageId, FixtureError> {
        let _guard = self.lifecycle.lock().await;

        let current = self.state.lock().clone();
        match current {
            ImageState::Built(id) => return Ok(id),
            ImageState::Disposed => {
                return Err(FixtureError::Disposed {
                    fixture: self.tag.clone(),
                })
            }
            ImageState::Unbuilt => {}
        }

        let request = BuildRequest {
            tag: self.tag.clone(),
            context: self.spec.context.clone(),
            dockerfile: self.spec.dockerfile.clone(),
        };
        let id = self
            .runtime
            .build_image(&request)
            .await
            .map_err(|err| FixtureError::Build {
                image: self.tag.clone(),
                reason: err.to_string(),
            })?;

        tracing::info!(image = %self.tag, "image built");
        *self.state.lock() = ImageState::Built(id.clone());
        Ok(id)
    }

    /// The built image.
    pub fn image_id(&self) -> Result<ImageId, FixtureError> {
        match &*self.state.lock() {
            ImageState::Built(id) => Ok(id.clone()),
            _ => Err(FixtureError::NotInitialized {
                fixture: self.tag.clone(),
            }),
        }
    }

    /// Remove the image. A no-op when never built or already disposed.
    pub async fn dispose_image(&self) -> Result<(), FixtureError> {
        let _guard = self.lifecycle.lock().await;

        let previous = std::mem::replace(&mut *self.state.lock(), ImageState::Disposed);
        if let ImageState::Built(id) = previous {
            if let Err(err) = ignore_missing(self.runtime.remove_image(&id).await) {
                *self.state.lock() = ImageState::Built(id);
                return Err(err);
            }
            tracing::info!(image = %self.tag, "image removed");
        }
        Ok(())
    }
}

#[async_trait]
impl Fixture for ImageFixture {
    fn name(&self) -> &str {
        &self.tag
    }

    async fn initialize(&self, _network: &NetworkHandle) -> Result<(), FixtureError> {
        self.build().await.map(|_| ())
    }

    async fn dispose(&self) -> Result<(), FixtureError> {
        self.dispose_image().await
    }
}
