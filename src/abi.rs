//! ABI classification for the Swift calling convention on AArch64
//!
//! Decides how each type travels through a call: in a single register
//! word, spread across consecutive register words, or indirectly by
//! reference to out-of-line memory.

use smallvec::SmallVec;

use crate::types::{SwiftType, TypeKind};

/// Register word size in bytes
pub const WORD_SIZE: usize = 8;

/// Aggregates wider than this are always passed indirectly
pub const INDIRECT_STRIDE_LIMIT: usize = 32;

/// Explicit argument words representable in registers (x0-x7)
pub const MAX_ARGUMENT_WORDS: usize = 8;

/// Return words loadable from registers (x0-x3)
pub const MAX_RETURN_WORDS: usize = 4;

/// How a classified type travels through a call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassingMode {
    /// Passed directly as `words` consecutive register words
    ByValue { words: usize },
    /// Passed by reference to caller-owned memory
    Indirect,
}

impl PassingMode {
    #[inline]
    pub const fn is_indirect(self) -> bool {
        matches!(self, Self::Indirect)
    }

    /// Register words this mode occupies in a flattened signature
    ///
    /// Indirect values occupy one pointer word.
    #[inline]
    pub const fn words(self) -> usize {
        match self {
            Self::ByValue { words } => words,
            Self::Indirect => 1,
        }
    }
}

/// Shape of one flattened native word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WordShape {
    /// 64-bit scalar word sliced from a value's byte image
    Scalar,
    /// Pointer-sized word (class handle or indirect reference)
    Pointer,
}

/// Declared return of the native call shim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeReturn {
    /// `n` register words, read back from x0..x{n-1}
    Words(usize),
    /// Single pointer word; the real result lands in the hidden buffer
    Pointer,
}

/// Classify a type under the target calling convention
///
/// Class handles are always a single pointer word: the reference itself
/// is the value. Aggregates go indirect when they cannot be moved by raw
/// byte copy or exceed [`INDIRECT_STRIDE_LIMIT`]; everything else takes
/// ceil(stride / 8) register words.
pub fn classify(ty: &SwiftType) -> PassingMode {
    if ty.kind() == TypeKind::Class {
        return PassingMode::ByValue { words: 1 };
    }

    let layout = ty.layout();
    if !layout.trivially_movable || layout.stride > INDIRECT_STRIDE_LIMIT {
        PassingMode::Indirect
    } else {
        PassingMode::ByValue {
            words: word_count(layout.stride),
        }
    }
}

/// Register words needed for a directly passed value of `stride` bytes
#[inline]
pub const fn word_count(stride: usize) -> usize {
    stride.div_ceil(WORD_SIZE)
}

/// Flatten a type into the word shapes it contributes to a native
/// parameter list
///
/// One word is one shape; a multi-word value is a tuple of scalar words.
/// The same flattening describes returns, since a multi-word return is
/// only loadable through the flattening the platform applies to
/// multi-word parameters.
pub fn flatten(ty: &SwiftType) -> SmallVec<[WordShape; 4]> {
    match classify(ty) {
        PassingMode::Indirect => smallvec::smallvec![WordShape::Pointer],
        PassingMode::ByValue { words } => {
            if ty.kind() == TypeKind::Class {
                smallvec::smallvec![WordShape::Pointer]
            } else {
                smallvec::smallvec![WordShape::Scalar; words]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Layout;

    fn movable(stride: usize) -> SwiftType {
        SwiftType::aggregate(
            format!("Agg{stride}"),
            Layout {
                stride,
                alignment: 8,
                trivially_movable: true,
            },
        )
    }

    fn pinned(stride: usize) -> SwiftType {
        SwiftType::aggregate(
            format!("Pinned{stride}"),
            Layout {
                stride,
                alignment: 8,
                trivially_movable: false,
            },
        )
    }

    #[test]
    fn test_small_movable_is_one_word() {
        for stride in 1..=8 {
            assert_eq!(
                classify(&movable(stride)),
                PassingMode::ByValue { words: 1 },
                "stride {stride}"
            );
        }
    }

    #[test]
    fn test_medium_movable_takes_ceil_words() {
        assert_eq!(classify(&movable(9)), PassingMode::ByValue { words: 2 });
        assert_eq!(classify(&movable(16)), PassingMode::ByValue { words: 2 });
        assert_eq!(classify(&movable(17)), PassingMode::ByValue { words: 3 });
        assert_eq!(classify(&movable(24)), PassingMode::ByValue { words: 3 });
        assert_eq!(classify(&movable(32)), PassingMode::ByValue { words: 4 });
    }

    #[test]
    fn test_wide_or_pinned_goes_indirect() {
        assert_eq!(classify(&movable(33)), PassingMode::Indirect);
        assert_eq!(classify(&movable(40)), PassingMode::Indirect);
        assert_eq!(classify(&pinned(8)), PassingMode::Indirect);
        assert_eq!(classify(&pinned(16)), PassingMode::Indirect);
    }

    #[test]
    fn test_class_is_single_pointer_word() {
        let ty = SwiftType::class("NSObject");
        assert_eq!(classify(&ty), PassingMode::ByValue { words: 1 });
        assert_eq!(flatten(&ty).as_slice(), &[WordShape::Pointer]);
    }

    #[test]
    fn test_flatten_matches_classification() {
        assert_eq!(flatten(&movable(8)).as_slice(), &[WordShape::Scalar]);
        assert_eq!(
            flatten(&movable(16)).as_slice(),
            &[WordShape::Scalar, WordShape::Scalar]
        );
        assert_eq!(flatten(&pinned(16)).as_slice(), &[WordShape::Pointer]);
        assert_eq!(flatten(&movable(40)).as_slice(), &[WordShape::Pointer]);
    }

    #[test]
    fn test_indirect_occupies_one_word() {
        assert_eq!(PassingMode::Indirect.words(), 1);
        assert_eq!(PassingMode::ByValue { words: 3 }.words(), 3);
    }
}
