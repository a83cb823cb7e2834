use rearch::CapsuleHandle;
use thiserror::Error;

use crate::config::settings_capsule;

pub const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

pub fn code_generator_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> CodeGenerator {
    let settings = get.as_ref(settings_capsule);
    CodeGenerator::new(settings.short_code_length, settings.max_generation_attempts)
}

/// Draws fixed-length candidate codes from [`ALPHABET`].
///
/// The generator knows nothing about storage; uniqueness is resolved by the
/// registry, which regenerates on collision up to `max_attempts` times.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeGenerator {
    length: usize,
    max_attempts: usize,
}

impl CodeGenerator {
    #[must_use]
    pub fn new(length: usize, max_attempts: usize) -> Self {
        Self {
            length: length.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    #[must_use]
    pub fn generate(&self) -> String {
        std::iter::repeat_with(|| char::from(ALPHABET[rand::random_range(0..ALPHABET.len())]))
            .take(self.length)
            .collect()
    }

    #[must_use]
    pub const fn length(&self) -> usize {
        self.length
    }

    #[must_use]
    pub const fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CustomCodeError {
    #[error("custom code is too long ({len} characters, max {max})")]
    TooLong { len: usize, max: usize },
    #[error("custom code must be alphanumeric; found {invalid_chars:?}")]
    NotAlphanumeric { invalid_chars: String },
}

/// Checks a user-supplied code against the length limit and the generator alphabet.
///
/// # Errors
/// Will return [`Err`] describing the first rule the code violates.
pub fn validate_custom_code(code: &str, max_len: usize) -> Result<(), CustomCodeError> {
    let len = code.chars().count();
    if len > max_len {
        return Err(CustomCodeError::TooLong { len, max: max_len });
    }

    let invalid_chars: String = code.chars().filter(|c| !c.is_ascii_alphanumeric()).collect();
    if !invalid_chars.is_empty() {
        return Err(CustomCodeError::NotAlphanumeric { invalid_chars });
    }

    Ok(())
}
