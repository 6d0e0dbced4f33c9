//! Value marshaling - typed buffers ⇄ flat register words
//!
//! Splits buffer-backed values into native-endian 64-bit words for the
//! call shim and rebuilds byte images from captured register state.

use smallvec::SmallVec;

use crate::abi::{PassingMode, WORD_SIZE};
use crate::types::Value;

/// Split a byte image into register words, in increasing offset order
///
/// A trailing partial word is zero-extended.
pub fn words_from_bytes(bytes: &[u8]) -> SmallVec<[u64; 4]> {
    let mut words = SmallVec::new();
    for chunk in bytes.chunks(WORD_SIZE) {
        let mut word = [0u8; WORD_SIZE];
        word[..chunk.len()].copy_from_slice(chunk);
        words.push(u64::from_ne_bytes(word));
    }
    words
}

/// Rebuild a `stride`-byte image from register words
pub fn buffer_from_words(words: &[u64], stride: usize) -> Vec<u8> {
    debug_assert!(
        words.len() * WORD_SIZE >= stride,
        "{} words cannot cover {stride} bytes",
        words.len()
    );

    let mut bytes = Vec::with_capacity(stride);
    for word in words {
        let remaining = stride - bytes.len();
        let take = remaining.min(WORD_SIZE);
        bytes.extend_from_slice(&word.to_ne_bytes()[..take]);
        if take < WORD_SIZE {
            break;
        }
    }
    bytes
}

/// Flatten one argument value into the words it contributes to the call
///
/// Indirect values contribute the address of their memory as a single
/// pointer word; everything else contributes its byte image word by word.
pub fn value_to_words(value: &Value, mode: PassingMode) -> SmallVec<[u64; 4]> {
    match mode {
        PassingMode::Indirect => {
            smallvec::smallvec![value.address() as u64]
        }
        PassingMode::ByValue { words } => match value.bytes() {
            Some(bytes) => {
                let split = words_from_bytes(bytes);
                debug_assert_eq!(
                    split.len(),
                    words,
                    "`{}` flattens to a different word count than its classification",
                    value.ty().name()
                );
                split
            }
            // Handle-backed by-value types (class references) are the
            // pointer word itself.
            None => smallvec::smallvec![value.address() as u64],
        },
    }
}
