//! Image label resolution.

use std::future::Future;

use scaleway_rs::{ScalewayImage, ScalewayListInstanceImagesBuilder};
use uuid::Uuid;

use super::{ScalewayBackendError, ScalewayCompute};

/// Image lookup inputs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(super) struct ImageQuery<'a> {
    pub(super) label: &'a str,
    pub(super) zone: &'a str,
    pub(super) arch: &'a str,
}

impl ScalewayCompute {
    pub(super) async fn resolve_image_id(
        &self,
        query: &ImageQuery<'_>,
    ) -> Result<String, ScalewayBackendError> {
        if Uuid::parse_str(query.label).is_ok() {
            return Ok(query.label.to_owned());
        }

        let project = self.config.default_project_id.as_str();
        let organization = self.config.default_organization_id.as_deref();
        Self::resolve_image_id_with(
            query,
            || async move {
                let mut scoped = ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                    .public(true)
                    .project(project)
                    .name(query.label)
                    .arch(query.arch);
                if let Some(org) = organization {
                    scoped = scoped.organization(org);
                }
                scoped.run_async().await.map_err(ScalewayBackendError::from)
            },
            || async move {
                ScalewayListInstanceImagesBuilder::new(self.api.clone(), query.zone)
                    .public(true)
                    .name(query.label)
                    .arch(query.arch)
                    .run_async()
                    .await
                    .map_err(ScalewayBackendError::from)
            },
        )
        .await
    }

    /// Tries the project-scoped listing first and falls back to public
    /// images only when it is empty.
    pub(super) async fn resolve_image_id_with<FutA, FutB, FetchA, FetchB>(
        query: &ImageQuery<'_>,
        project_fetch: FetchA,
        public_fetch: FetchB,
    ) -> Result<String, ScalewayBackendError>
    where
        FetchA: FnOnce() -> FutA,
        FetchB: FnOnce() -> FutB,
        FutA: Future<Output = Result<Vec<ScalewayImage>, ScalewayBackendError>>,
        FutB: Future<Output = Result<Vec<ScalewayImage>, ScalewayBackendError>>,
    {
        let project_images = project_fetch().await?;
        let images = if project_images.is_empty() {
            public_fetch().await?
        } else {
            project_images
        };
        Self::select_image_id(Self::filter_images(images, query.arch), query)
    }

    pub(super) fn select_image_id(
        mut candidates: Vec<ScalewayImage>,
        query: &ImageQuery<'_>,
    ) -> Result<String, ScalewayBackendError> {
        candidates.sort_by(|lhs, rhs| rhs.creation_date.cmp(&lhs.creation_date));
        candidates
            .into_iter()
            .next()
            .map(|image| image.id)
            .ok_or_else(|| ScalewayBackendError::ImageNotFound {
                label: query.label.to_owned(),
                arch: query.arch.to_owned(),
                zone: query.zone.to_owned(),
            })
    }

    pub(super) fn filter_images(images: Vec<ScalewayImage>, arch: &str) -> Vec<ScalewayImage> {
        images
            .into_iter()
            .filter(|image| image.arch == arch)
            .filter(|image| image.state == "available")
            .collect()
    }
}
