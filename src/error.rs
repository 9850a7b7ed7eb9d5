//! Shared error utilities used across the compilation pipeline.
//!
//! Diagnostics are kept lightweight on purpose: every error renders the
//! source line holding the fault, then a caret under the offending byte
//! followed by the message. The first fault is the only one reported.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
pub enum CompileError {
  /// A character matched no token rule.
  #[snafu(display("{line}\n{marker} {message}"))]
  Lex {
    loc: usize,
    line: String,
    marker: String,
    message: String,
  },
  /// An expected token or production was absent.
  #[snafu(display("{line}\n{marker} {message}"))]
  Syntax {
    loc: usize,
    line: String,
    marker: String,
    message: String,
  },
}

impl CompileError {
  /// Construct a lexical error anchored at a byte offset in the source.
  pub fn lex(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (line, marker) = locate(source, loc);
    Self::Lex {
      loc,
      line,
      marker,
      message: message.into(),
    }
  }

  /// Construct a syntax error anchored at a byte offset in the source.
  pub fn syntax(source: &str, loc: usize, message: impl Into<String>) -> Self {
    let (line, marker) = locate(source, loc);
    Self::Syntax {
      loc,
      line,
      marker,
      message: message.into(),
    }
  }

  /// Byte offset of the fault in the original source.
  pub fn loc(&self) -> usize {
    match self {
      Self::Lex { loc, .. } | Self::Syntax { loc, .. } => *loc,
    }
  }

  /// The bare message, without the source excerpt.
  pub fn message(&self) -> &str {
    match self {
      Self::Lex { message, .. } | Self::Syntax { message, .. } => message,
    }
  }
}

/// Find the line containing `loc` and build the caret marker for it.
fn locate(source: &str, loc: usize) -> (String, String) {
  let mut loc = loc.min(source.len());
  while !source.is_char_boundary(loc) {
    loc -= 1;
  }

  let start = source[..loc].rfind('\n').map_or(0, |i| i + 1);
  let end = source[loc..].find('\n').map_or(source.len(), |i| loc + i);
  let column = source[start..loc].chars().count();

  let line = source[start..end].to_string();
  let marker = format!("{}^", " ".repeat(column));
  (line, marker)
}
