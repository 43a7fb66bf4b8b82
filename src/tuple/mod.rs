// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Order-preserving tuple encoding for keys.
//!
//! Keys in the metadata space are built from small tuples of byte strings,
//! text and integers. The encoding is self-delimiting and preserves the
//! natural ordering of each element type, so range reads over encoded keys
//! enumerate tuples in tuple order. This is the property the directory
//! layer relies on for child listing and prefix containment scans.

mod element;
pub mod hca;
mod pack;
mod subspace;

pub use element::{Bytes, Element};
pub use pack::{TuplePack, TupleUnpack};
pub use subspace::Subspace;

use std::fmt;

/// Tuple encoding/decoding errors.
#[derive(Debug, PartialEq)]
pub enum PackError {
    /// An element type code that is not part of the supported subset.
    BadCode {
        /// the type code found in the input
        found: u8,
        /// the type code the caller required, if any
        expected: Option<u8>,
    },
    /// A text element held invalid UTF-8.
    BadStringFormat,
    /// The key does not start with the subspace prefix it was unpacked with.
    BadPrefix,
    /// The input ended in the middle of an element.
    MissingBytes,
    /// The input continued past the decoded value.
    TrailingBytes,
    /// An integer element was wider than the requested integer type.
    UnsupportedIntLength,
    /// Free-form decoding error.
    Message(Box<str>),
}

/// A result type where the error is a [`PackError`].
pub type PackResult<T> = std::result::Result<T, PackError>;

impl fmt::Display for PackError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PackError::BadCode { found, .. } => write!(f, "bad element code {:#x}", found),
            PackError::BadStringFormat => write!(f, "text element is not valid UTF-8"),
            PackError::BadPrefix => write!(f, "key is not contained in the subspace"),
            PackError::MissingBytes => write!(f, "unexpected end of input"),
            PackError::TrailingBytes => write!(f, "unexpected trailing bytes"),
            PackError::UnsupportedIntLength => write!(f, "integer element is too wide"),
            PackError::Message(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for PackError {}

/// Tracks the nesting depth during tuple packing/unpacking.
///
/// Nested tuples are wrapped in markers and escape their nil elements; the
/// root level is written bare. The depth tells each element which of the two
/// forms applies.
#[derive(Copy, Clone)]
pub struct TupleDepth(usize);

impl TupleDepth {
    pub(crate) fn new() -> Self {
        TupleDepth(0)
    }

    /// Increment the depth by one; called when descending into a tuple-like
    /// element.
    pub fn increment(self) -> Self {
        TupleDepth(self.0 + 1)
    }

    /// The current depth, 0 meaning the root of the encoding.
    pub fn depth(self) -> usize {
        self.0
    }
}

/// Packs a value into a fresh buffer.
pub fn pack<T: TuplePack>(v: &T) -> Vec<u8> {
    v.pack_to_vec()
}

/// Unpacks a value, requiring the whole input to be consumed.
pub fn unpack<'de, T: TupleUnpack<'de>>(input: &'de [u8]) -> PackResult<T> {
    T::unpack_root(input)
}
