use rand::Rng;
use rand::seq::IndexedRandom;
use rand_core::RngCore;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Letters, punctuation and space.
const BASIC_ASCII: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~ ";
const ASCII_LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ASCII_UPPERCASE: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";

#[derive(Error, Debug)]
pub enum MutatorError {
    /// `next_mutation` was called before any input was loaded.
    #[error("No input loaded; call set_input before requesting mutations")]
    NoInput,
    #[error("Failed to read input {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Unknown mutator preset '{0}'")]
    UnknownPreset(String),
}

/// A `Mutator` produces variants of a loaded input.
///
/// The loaded bytes are the mutator's private state: every call to
/// `next_mutation` works on a fresh copy, so the original never drifts.
pub trait Mutator: Send {
    /// Loads the bytes stored at `path`, replacing any previously loaded input.
    fn set_input(&mut self, path: &Path) -> Result<(), MutatorError>;

    /// Returns a mutated copy of the loaded input.
    ///
    /// # Errors
    /// `MutatorError::NoInput` if `set_input` has not succeeded yet.
    fn next_mutation(&mut self, rng: &mut dyn RngCore) -> Result<Vec<u8>, MutatorError>;
}

/// A single in-place, length-preserving mutation. Operators leave an empty
/// buffer untouched.
pub type MutationOp = fn(&mut [u8], &mut dyn RngCore);

pub fn flip_random_bit(buf: &mut [u8], rng: &mut dyn RngCore) {
    if buf.is_empty() {
        return;
    }
    let bit_number = rng.random_range(0..buf.len() * 8);
    buf[bit_number / 8] ^= 1 << (bit_number % 8);
}

pub fn set_random_byte(buf: &mut [u8], rng: &mut dyn RngCore) {
    if buf.is_empty() {
        return;
    }
    let index = rng.random_range(0..buf.len());
    // Any value but the current one; 255 candidates keeps this a single draw.
    let offset = rng.random_range(1..=u8::MAX);
    buf[index] = buf[index].wrapping_add(offset);
}

/// Overwrites a random byte with a different member of `charset`.
fn set_random_from_charset(buf: &mut [u8], rng: &mut dyn RngCore, charset: &[u8]) {
    if buf.is_empty() {
        return;
    }
    let index = rng.random_range(0..buf.len());
    let current = buf[index];
    let candidates: Vec<u8> = charset.iter().copied().filter(|c| *c != current).collect();
    if let Some(value) = candidates.choose(rng) {
        buf[index] = *value;
    }
}

pub fn set_random_ascii(buf: &mut [u8], rng: &mut dyn RngCore) {
    set_random_from_charset(buf, rng, BASIC_ASCII);
}

pub fn set_random_letter(buf: &mut [u8], rng: &mut dyn RngCore) {
    set_random_from_charset(buf, rng, ASCII_LETTERS);
}

pub fn set_random_uppercase(buf: &mut [u8], rng: &mut dyn RngCore) {
    set_random_from_charset(buf, rng, ASCII_UPPERCASE);
}

/// Named operator sets. Which one is active is a configuration decision.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MutatorPreset {
    #[default]
    BasicRandom,
    Ascii,
    Letters,
    Uppercase,
}

impl MutatorPreset {
    pub fn name(&self) -> &'static str {
        match self {
            MutatorPreset::BasicRandom => "basic-random",
            MutatorPreset::Ascii => "ascii",
            MutatorPreset::Letters => "letters",
            MutatorPreset::Uppercase => "uppercase",
        }
    }

    pub fn operators(&self) -> Vec<MutationOp> {
        match self {
            MutatorPreset::BasicRandom => vec![flip_random_bit, set_random_byte],
            MutatorPreset::Ascii => vec![set_random_ascii],
            MutatorPreset::Letters => vec![set_random_letter],
            MutatorPreset::Uppercase => vec![set_random_uppercase],
        }
    }
}

impl fmt::Display for MutatorPreset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MutatorPreset {
    type Err = MutatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic-random" => Ok(MutatorPreset::BasicRandom),
            "ascii" => Ok(MutatorPreset::Ascii),
            "letters" => Ok(MutatorPreset::Letters),
            "uppercase" => Ok(MutatorPreset::Uppercase),
            other => Err(MutatorError::UnknownPreset(other.to_string())),
        }
    }
}

/// Applies one operator, chosen uniformly from a preset's set, per mutation.
pub struct PresetMutator {
    operators: Vec<MutationOp>,
    current_input: Option<Vec<u8>>,
}

impl PresetMutator {
    pub fn from_preset(preset: MutatorPreset) -> Self {
        Self {
            operators: preset.operators(),
            current_input: None,
        }
    }

    /// Loads bytes directly rather than from a file.
    #[cfg(test)]
    fn set_input_bytes(&mut self, bytes: Vec<u8>) {
        self.current_input = Some(bytes);
    }
}

impl Mutator for PresetMutator {
    fn set_input(&mut self, path: &Path) -> Result<(), MutatorError> {
        let bytes = fs::read(path).map_err(|source| MutatorError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.current_input = Some(bytes);
        Ok(())
    }

    fn next_mutation(&mut self, rng: &mut dyn RngCore) -> Result<Vec<u8>, MutatorError> {
        let original = self.current_input.as_ref().ok_or(MutatorError::NoInput)?;
        let operator = self.operators[rng.random_range(0..self.operators.len())];
        let mut mutated = original.clone();
        operator(&mut mutated, rng);
        Ok(mutated)
    }
}
