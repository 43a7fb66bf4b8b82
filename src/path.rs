// Copyright 2025 dirspace developers
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Directory paths.
//!
//! A [`Path`] is an ordered sequence of [`Segment`]s plus an absolute flag.
//! Each segment carries a name and an optional layer id tag; the tag is
//! asserted against the stored directory when the path is resolved, but it
//! is *not* part of path identity: the prefix predicates (`starts_with`,
//! `is_parent_of`, `relative_to`, …) compare names only.
//!
//! The text form uses `/` as separator, a leading `/` for absolute paths,
//! `\` to escape any of `/ \ [ ]`, and renders a nonempty layer id as
//! `[layer]` after the name:
//!
//! ```
//! use dirspace::Path;
//!
//! let path: Path = "/tenants/acme[docs]".parse().unwrap();
//! assert_eq!(path.len(), 2);
//! assert_eq!(path.get(1).unwrap().layer(), "docs");
//! assert_eq!(path.to_string(), "/tenants/acme[docs]");
//! ```

use std::fmt;
use std::str::FromStr;

/// An error from parsing or combining paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathError {
    /// A segment with an empty name.
    EmptySegment,
    /// A trailing `\` with nothing to escape.
    BadEscape,
    /// A `[` layer tag without its closing `]`.
    UnterminatedLayer,
    /// A `[` inside a layer tag.
    NestedLayer,
    /// Characters after a closing `]` within the same segment.
    TrailingAfterLayer,
    /// Joining an absolute path onto a nonempty path.
    AbsoluteJoin,
}

impl fmt::Display for PathError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PathError::EmptySegment => write!(f, "path segment is empty"),
            PathError::BadEscape => write!(f, "dangling escape character"),
            PathError::UnterminatedLayer => write!(f, "unterminated layer tag"),
            PathError::NestedLayer => write!(f, "layer tag inside a layer tag"),
            PathError::TrailingAfterLayer => write!(f, "characters after layer tag"),
            PathError::AbsoluteJoin => write!(f, "cannot append an absolute path"),
        }
    }
}

impl std::error::Error for PathError {}

/// One path element: a name plus an optional layer id tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    name: String,
    layer: String,
}

impl Segment {
    /// A segment without a layer tag.
    pub fn new(name: impl Into<String>) -> Self {
        Segment {
            name: name.into(),
            layer: String::new(),
        }
    }

    /// A segment carrying a layer tag.
    pub fn with_layer(name: impl Into<String>, layer: impl Into<String>) -> Self {
        Segment {
            name: name.into(),
            layer: layer.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn has_layer(&self) -> bool {
        !self.layer.is_empty()
    }
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        if matches!(c, '/' | '\\' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut out = String::with_capacity(self.name.len() + self.layer.len() + 2);
        escape_into(&mut out, &self.name);
        if !self.layer.is_empty() {
            out.push('[');
            escape_into(&mut out, &self.layer);
            out.push(']');
        }
        f.write_str(&out)
    }
}

/// A directory path: a sequence of segments, absolute or relative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Path {
    absolute: bool,
    segments: Vec<Segment>,
}

impl Path {
    /// The absolute root path `/`.
    pub fn root() -> Self {
        Path {
            absolute: true,
            segments: Vec::new(),
        }
    }

    /// The empty relative path.
    pub fn new() -> Self {
        Path::default()
    }

    /// An absolute path from segments.
    pub fn absolute(segments: Vec<Segment>) -> Self {
        Path {
            absolute: true,
            segments,
        }
    }

    /// A relative path from segments.
    pub fn relative(segments: Vec<Segment>) -> Self {
        Path {
            absolute: false,
            segments,
        }
    }

    /// A relative path from plain names, without layer tags.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Path {
            absolute: false,
            segments: names.into_iter().map(Segment::new).collect(),
        }
    }

    pub fn is_absolute(&self) -> bool {
        self.absolute
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Segment> {
        self.segments.get(index)
    }

    pub fn last(&self) -> Option<&Segment> {
        self.segments.last()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Appends one segment in place.
    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Returns this path extended by one unlabeled name.
    pub fn child(&self, name: impl Into<String>) -> Self {
        let mut path = self.clone();
        path.push(Segment::new(name));
        path
    }

    /// Returns the concatenation of this path and a relative one.
    ///
    /// Appending an absolute path to anything but the empty relative path
    /// would yield a second root and is rejected.
    pub fn join(&self, other: &Path) -> Result<Path, PathError> {
        if other.absolute && (self.absolute || !self.is_empty()) {
            return Err(PathError::AbsoluteJoin);
        }
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Ok(Path {
            absolute: self.absolute || other.absolute,
            segments,
        })
    }

    /// Returns the path without its final segment, `None` for an empty path.
    pub fn parent(&self) -> Option<Path> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Path {
            absolute: self.absolute,
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Returns the sub-path covering `range`.
    ///
    /// The result keeps the absolute flag only when it still starts at the
    /// root.
    pub fn slice(&self, range: std::ops::Range<usize>) -> Path {
        Path {
            absolute: self.absolute && range.start == 0,
            segments: self.segments[range].to_vec(),
        }
    }

    fn names_match(&self, other: &Path) -> bool {
        other
            .segments
            .iter()
            .zip(self.segments.iter())
            .all(|(a, b)| a.name == b.name)
    }

    /// Name-only prefix test. Paths of different kinds never match.
    pub fn starts_with(&self, other: &Path) -> bool {
        self.absolute == other.absolute && other.len() <= self.len() && self.names_match(other)
    }

    /// Name-only suffix test against a relative path.
    pub fn ends_with(&self, other: &Path) -> bool {
        if other.absolute {
            return self.absolute && self.len() == other.len() && self.names_match(other);
        }
        other.len() <= self.len()
            && self.segments[self.len() - other.len()..]
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a.name == b.name)
    }

    /// True when `other` is exactly one segment below this path.
    pub fn is_parent_of(&self, other: &Path) -> bool {
        other.len() == self.len() + 1 && other.starts_with(self)
    }

    /// True when this path is exactly one segment below `other`.
    pub fn is_child_of(&self, other: &Path) -> bool {
        other.is_parent_of(self)
    }

    /// The remainder of this path below `parent`, as a relative path.
    pub fn relative_to(&self, parent: &Path) -> Option<Path> {
        if !self.starts_with(parent) {
            return None;
        }
        Some(Path {
            absolute: false,
            segments: self.segments[parent.len()..].to_vec(),
        })
    }

    /// The segment names, without layer tags.
    pub fn names(&self) -> Vec<&str> {
        self.segments.iter().map(|s| s.name.as_str()).collect()
    }

    /// True when any segment but the last carries a layer tag.
    pub(crate) fn has_interior_layer_tags(&self) -> bool {
        let len = self.segments.len();
        len > 1 && self.segments[..len - 1].iter().any(Segment::has_layer)
    }

    /// Rejects paths holding an empty segment name.
    pub(crate) fn check_segments(&self) -> Result<(), PathError> {
        if self.segments.iter().any(|s| s.name.is_empty()) {
            return Err(PathError::EmptySegment);
        }
        Ok(())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.absolute {
            f.write_str("/")?;
        }
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "{}", segment)?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (absolute, rest) = match s.strip_prefix('/') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let mut segments = Vec::new();
        if rest.is_empty() {
            return Ok(Path { absolute, segments });
        }

        let mut name = String::new();
        let mut layer = String::new();
        let mut in_layer = false;
        let mut layer_done = false;
        let mut chars = rest.chars();

        let finish =
            |name: &mut String, layer: &mut String, segments: &mut Vec<Segment>| -> Result<(), PathError> {
                if name.is_empty() {
                    return Err(PathError::EmptySegment);
                }
                segments.push(Segment {
                    name: std::mem::take(name),
                    layer: std::mem::take(layer),
                });
                Ok(())
            };

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    let escaped = chars.next().ok_or(PathError::BadEscape)?;
                    if layer_done {
                        return Err(PathError::TrailingAfterLayer);
                    }
                    if in_layer {
                        layer.push(escaped);
                    } else {
                        name.push(escaped);
                    }
                }
                '/' => {
                    if in_layer {
                        return Err(PathError::UnterminatedLayer);
                    }
                    finish(&mut name, &mut layer, &mut segments)?;
                    layer_done = false;
                }
                '[' => {
                    if in_layer {
                        return Err(PathError::NestedLayer);
                    }
                    if layer_done {
                        return Err(PathError::TrailingAfterLayer);
                    }
                    in_layer = true;
                }
                ']' => {
                    if !in_layer {
                        return Err(PathError::TrailingAfterLayer);
                    }
                    in_layer = false;
                    layer_done = true;
                }
                c => {
                    if layer_done {
                        return Err(PathError::TrailingAfterLayer);
                    }
                    if in_layer {
                        layer.push(c);
                    } else {
                        name.push(c);
                    }
                }
            }
        }
        if in_layer {
            return Err(PathError::UnterminatedLayer);
        }
        finish(&mut name, &mut layer, &mut segments)?;

        Ok(Path { absolute, segments })
    }
}
