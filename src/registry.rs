use std::sync::Arc;

use async_trait::async_trait;
use rearch::CapsuleHandle;
use thiserror::Error;
use time::{Duration, OffsetDateTime};
use tracing::{error, info, instrument, warn};

use crate::{
    code_gen::{CodeGenerator, CustomCodeError, code_generator_capsule, validate_custom_code},
    config::settings_capsule,
    link_repo::{LinkRepository, LinkUpdate, SaveLinkError, link_repository_capsule},
    model::ShortLink,
    url_validator::{UrlRejection, UrlValidator, url_validator_capsule},
};

#[derive(Clone, Debug, Default)]
pub struct NewLink {
    pub original_url: String,
    /// Empty is treated the same as absent
    pub custom_code: Option<String>,
    /// May be negative, which creates an already-expired link
    pub expires_in: Option<Duration>,
    pub notes: String,
    pub tags: String,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidUrl(#[from] UrlRejection),
    #[error("custom code is too long ({len} characters, max {max})")]
    CustomCodeTooLong { len: usize, max: usize },
    #[error("custom code must be alphanumeric; found {invalid_chars:?}")]
    CustomCodeNotAlphanumeric { invalid_chars: String },
    #[error("custom short code {0} is already taken")]
    CustomCodeTaken(String),
    #[error("no free short code found after {attempts} attempts")]
    CodeSpaceExhausted { attempts: usize },
    #[error("storage failure: {0}")]
    StorageFailure(anyhow::Error), // NOTE: no #[from] so we have to be explicit
}

impl RegistryError {
    /// Whether the error was caused by the caller's input rather than the system.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl(_)
                | Self::CustomCodeTooLong { .. }
                | Self::CustomCodeNotAlphanumeric { .. }
                | Self::CustomCodeTaken(_)
        )
    }
}

impl From<CustomCodeError> for RegistryError {
    fn from(err: CustomCodeError) -> Self {
        match err {
            CustomCodeError::TooLong { len, max } => Self::CustomCodeTooLong { len, max },
            CustomCodeError::NotAlphanumeric { invalid_chars } => {
                Self::CustomCodeNotAlphanumeric { invalid_chars }
            }
        }
    }
}

fn storage_failure(err: anyhow::Error) -> RegistryError {
    error!(?err, "Encountered storage failure");
    RegistryError::StorageFailure(err)
}

/// The authoritative mapping from short code to redirect target.
pub fn url_registry_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> Arc<dyn UrlRegistry> {
    let link_repo = Arc::clone(get.as_ref(link_repository_capsule));
    let validator = Arc::clone(get.as_ref(url_validator_capsule));
    let generator = get.as_ref(code_generator_capsule).clone();
    let settings = get.as_ref(settings_capsule);
    Arc::new(UrlRegistryImpl::new(
        link_repo,
        validator,
        generator,
        settings.max_custom_code_length,
        settings.public_base_url.clone(),
    ))
}

#[async_trait]
pub trait UrlRegistry: Send + Sync {
    async fn create(&self, request: NewLink) -> Result<ShortLink, RegistryError>;

    /// The live link for `code`: present, active, and not yet expired.
    async fn lookup(&self, code: &str) -> Result<Option<ShortLink>, RegistryError>;

    async fn update(&self, code: &str, changes: LinkUpdate) -> Result<bool, RegistryError>;

    async fn soft_delete(&self, code: &str) -> Result<bool, RegistryError>;

    async fn hard_delete(&self, code: &str) -> Result<bool, RegistryError>;

    /// Newest first.
    async fn list(&self, include_inactive: bool) -> Result<Vec<ShortLink>, RegistryError>;

    async fn search(&self, term: &str) -> Result<Vec<ShortLink>, RegistryError>;

    /// Soft-deletes every active link whose expiration has passed.
    async fn expire_sweep(&self) -> Result<u64, RegistryError>;

    fn shortened_url(&self, code: &str) -> String;
}

pub struct UrlRegistryImpl {
    link_repo: Arc<dyn LinkRepository>,
    validator: Arc<dyn UrlValidator>,
    generator: CodeGenerator,
    max_custom_code_length: usize,
    public_base_url: String,
}

impl UrlRegistryImpl {
    #[must_use]
    pub fn new(
        link_repo: Arc<dyn LinkRepository>,
        validator: Arc<dyn UrlValidator>,
        generator: CodeGenerator,
        max_custom_code_length: usize,
        public_base_url: String,
    ) -> Self {
        Self {
            link_repo,
            validator,
            generator,
            max_custom_code_length,
            public_base_url,
        }
    }

    async fn insert_custom(&self, link: ShortLink) -> Result<ShortLink, RegistryError> {
        let code = link.short_code.clone();
        if self
            .link_repo
            .find_active(&code)
            .await
            .map_err(storage_failure)?
            .is_some()
        {
            info!(code, "Custom code taken");
            return Err(RegistryError::CustomCodeTaken(code));
        }

        // NOTE: a concurrent create can still win between the check and the insert
        match self.link_repo.insert(link).await {
            Ok(link) => Ok(link),
            Err(SaveLinkError::CodeTaken(code)) => {
                info!(code, "Custom code taken by a concurrent create");
                Err(RegistryError::CustomCodeTaken(code))
            }
            Err(SaveLinkError::Internal(err)) => Err(storage_failure(err)),
        }
    }

    async fn insert_generated(&self, template: ShortLink) -> Result<ShortLink, RegistryError> {
        let attempts = self.generator.max_attempts();
        for attempt in 1..=attempts {
            let candidate = ShortLink {
                short_code: self.generator.generate(),
                ..template.clone()
            };

            match self.link_repo.insert(candidate).await {
                Ok(link) => return Ok(link),
                // NOTE: collisions are retryable; generate a fresh code and try again
                Err(SaveLinkError::CodeTaken(code)) => {
                    warn!(attempt, code, "Generated short code was already taken");
                }
                Err(SaveLinkError::Internal(err)) => return Err(storage_failure(err)),
            }
        }

        error!(attempts, "Exhausted short code generation attempts");
        Err(RegistryError::CodeSpaceExhausted { attempts })
    }
}

#[async_trait]
impl UrlRegistry for UrlRegistryImpl {
    #[instrument(skip(self))]
    async fn create(&self, request: NewLink) -> Result<ShortLink, RegistryError> {
        let NewLink {
            original_url,
            custom_code,
            expires_in,
            notes,
            tags,
        } = request;

        if let Err(rejection) = self.validator.validate(&original_url).await {
            info!(original_url, %rejection, "Rejected URL");
            return Err(rejection.into());
        }

        let custom_code = custom_code.filter(|code| !code.is_empty());
        if let Some(code) = &custom_code {
            validate_custom_code(code, self.max_custom_code_length)?;
        }

        let now = OffsetDateTime::now_utc();
        let template = ShortLink {
            short_code: custom_code.clone().unwrap_or_default(),
            original_url: original_url.trim().to_owned(),
            is_custom: custom_code.is_some(),
            created_at: now,
            expires_at: expires_in.map(|expires_in| now + expires_in),
            is_active: true,
            notes,
            tags,
        };

        let link = if custom_code.is_some() {
            self.insert_custom(template).await?
        } else {
            self.insert_generated(template).await?
        };

        info!(
            short_code = link.short_code,
            original_url = link.original_url,
            is_custom = link.is_custom,
            "Short link created"
        );
        Ok(link)
    }

    #[instrument(skip(self))]
    async fn lookup(&self, code: &str) -> Result<Option<ShortLink>, RegistryError> {
        let Some(link) = self
            .link_repo
            .find_active(code)
            .await
            .map_err(storage_failure)?
        else {
            return Ok(None);
        };

        if link.is_expired_at(OffsetDateTime::now_utc()) {
            warn!(code, "Short link has expired");
            return Ok(None);
        }
        Ok(Some(link))
    }

    #[instrument(skip(self))]
    async fn update(&self, code: &str, changes: LinkUpdate) -> Result<bool, RegistryError> {
        let original_url = match changes.original_url {
            Some(original_url) => {
                self.validator.validate(&original_url).await?;
                Some(original_url.trim().to_owned())
            }
            None => None,
        };
        let changes = LinkUpdate {
            original_url,
            ..changes
        };

        let updated = self
            .link_repo
            .update_active(code, changes)
            .await
            .map_err(storage_failure)?;
        if updated {
            info!(code, "Short link updated");
        }
        Ok(updated)
    }

    #[instrument(skip(self))]
    async fn soft_delete(&self, code: &str) -> Result<bool, RegistryError> {
        let deleted = self
            .link_repo
            .deactivate(code)
            .await
            .map_err(storage_failure)?;
        if deleted {
            info!(code, "Short link deactivated");
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn hard_delete(&self, code: &str) -> Result<bool, RegistryError> {
        self.link_repo.purge(code).await.map_err(storage_failure)
    }

    #[instrument(skip(self))]
    async fn list(&self, include_inactive: bool) -> Result<Vec<ShortLink>, RegistryError> {
        self.link_repo
            .list(include_inactive)
            .await
            .map_err(storage_failure)
    }

    #[instrument(skip(self))]
    async fn search(&self, term: &str) -> Result<Vec<ShortLink>, RegistryError> {
        self.link_repo
            .search_active(term)
            .await
            .map_err(storage_failure)
    }

    #[instrument(skip(self))]
    async fn expire_sweep(&self) -> Result<u64, RegistryError> {
        let count = self
            .link_repo
            .deactivate_expired(OffsetDateTime::now_utc())
            .await
            .map_err(storage_failure)?;
        if count > 0 {
            info!(count, "Cleaned up expired short links");
        }
        Ok(count)
    }

    fn shortened_url(&self, code: &str) -> String {
        format!("{}/{code}", self.public_base_url)
    }
}
