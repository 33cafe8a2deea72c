use std::ops::Range;
use std::path::PathBuf;

use ariadne::{Color, Label, Report, ReportKind, Source};
use droid_shared::mapfile::MapFileError;
use droid_shared::FormatError;
use thiserror::Error;

use crate::trees::SourceLocation;

/// Failure of the pipeline for one method
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompilerError {
    #[error("unsupported construct at {location}: {message}")]
    UnsupportedConstruct { location: SourceLocation, message: String },
    #[error("unknown type {0}")]
    UnknownType(String),
    #[error("unknown member {0}")]
    UnknownMember(String),
    #[error(transparent)]
    Format(#[from] FormatError),
}

impl CompilerError {
    pub fn unsupported(location: &SourceLocation, message: impl Into<String>) -> Self {
        CompilerError::UnsupportedConstruct {
            location: location.clone(),
            message: message.into(),
        }
    }
}

/// A cached body names an internal entity the current build no longer knows
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheFixupError {
    #[error("type {0} has no counterpart in the current build")]
    UnresolvedType(String),
    #[error("field {0} has no counterpart in the current build")]
    UnresolvedField(String),
    #[error("method {0} has no counterpart in the current build")]
    UnresolvedMethod(String),
    #[error("signature {0} cannot be parsed")]
    MalformedSignature(String),
    #[error("delegate instance {0} cannot be re-created in this build")]
    SyntheticReference(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodFailure {
    pub method: String,
    pub location: SourceLocation,
    pub error: CompilerError,
}

impl MethodFailure {
    pub fn new(method: impl Into<String>, fallback: &SourceLocation, error: CompilerError) -> Self {
        let location = match &error {
            CompilerError::UnsupportedConstruct { location, .. } if location.is_known() => location.clone(),
            _ => fallback.clone(),
        };
        MethodFailure {
            method: method.into(),
            location,
            error,
        }
    }
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot load input {path}: {message}")]
    Input { path: PathBuf, message: String },
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Map(#[from] MapFileError),
    #[error("{} method(s) failed to compile", .0.len())]
    MethodFailures(Vec<MethodFailure>),
    #[error("the build was cancelled")]
    Cancelled,
}

/// Byte range of the reported line, starting at the reported column
fn line_span(text: &str, location: &SourceLocation) -> Option<Range<usize>> {
    let mut start = 0;
    for (index, line) in text.split_inclusive('\n').enumerate() {
        if index + 1 == location.line as usize {
            let length = line.trim_end_matches(['\r', '\n']).len();
            let column = (location.column.max(1) as usize - 1).min(length);
            return Some(start + column..start + length.max(column + 1));
        }
        start += line.len();
    }
    None
}

/// Prints every failure, with the offending line when its document can be read
pub fn report_failures(failures: &[MethodFailure]) {
    for failure in failures {
        let document = failure.location.document.as_str();
        let source = std::fs::read_to_string(document)
            .ok()
            .and_then(|text| line_span(&text, &failure.location).map(|span| (text, span)));
        let Some((text, span)) = source else {
            log::error!("{}: {} ({})", failure.method, failure.error, failure.location);
            continue;
        };
        let result = Report::build(ReportKind::Error, (document, span.clone()))
            .with_message(format!("cannot compile {}", failure.method))
            .with_label(
                Label::new((document, span))
                    .with_message(failure.error.to_string())
                    .with_color(Color::Red),
            )
            .finish()
            .eprint((document, Source::from(text)));
        if let Err(error) = result {
            log::error!("{}: {} ({}), report failed: {}", failure.method, failure.error, failure.location, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_span() {
        let text = "first\n  second line\nthird";
        let span = line_span(text, &SourceLocation::new("a.cs", 2, 3)).unwrap();
        assert_eq!(&text[span], "second line");
        assert!(line_span(text, &SourceLocation::new("a.cs", 9, 1)).is_none());
    }

    #[test]
    fn test_failure_prefers_error_location() {
        let error = CompilerError::unsupported(&SourceLocation::new("a.cs", 4, 1), "pointer arithmetic");
        let failure = MethodFailure::new("App.Main::Run", &SourceLocation::new("a.cs", 1, 1), error);
        assert_eq!(failure.location.line, 4);
        assert!(failure.error.to_string().contains("pointer arithmetic"));
    }
}
