//! Errors reported by the engine.
//!
//! Operations never stop at the first problem. They collect every
//! [`Diagnostic`] into a [`Diagnostics`] batch, so that an operator sees the
//! failures of all independent parts of a deployment at once.

use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Diagnostic {
    /// A problem with the configuration, detected before any change is made:
    /// cycles, unresolvable references, values that do not fit the schema.
    #[error("{}{message}", prefix(.addr))]
    Config { addr: Option<String>, message: String },

    /// A value that must be known to proceed is only known after apply.
    #[error(
        "{addr}: {message}; to work around this, first apply the resources it depends on using --target, then plan again"
    )]
    UnknownValue { addr: String, message: String },

    /// A provider call failed.
    #[error("{addr}: {message}")]
    Provider { addr: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

fn prefix(addr: &Option<String>) -> String {
    match addr {
        Some(addr) => format!("{}: ", addr),
        None => String::new(),
    }
}

impl Diagnostic {
    pub fn config(message: impl Into<String>) -> Self {
        Diagnostic::Config {
            addr: None,
            message: message.into(),
        }
    }

    pub fn config_at(addr: impl Display, message: impl Into<String>) -> Self {
        Diagnostic::Config {
            addr: Some(addr.to_string()),
            message: message.into(),
        }
    }

    pub fn unknown_value(addr: impl Display, message: impl Into<String>) -> Self {
        Diagnostic::UnknownValue {
            addr: addr.to_string(),
            message: message.into(),
        }
    }

    /// A provider failure, keeping the whole error chain of `err`.
    pub fn provider(addr: impl Display, err: &anyhow::Error) -> Self {
        Diagnostic::Provider {
            addr: addr.to_string(),
            message: format!("{:#}", err),
        }
    }

    pub fn provider_msg(addr: impl Display, message: impl Into<String>) -> Self {
        Diagnostic::Provider {
            addr: addr.to_string(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Diagnostic::Internal(message.into())
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Diagnostic::Config { .. })
    }
}

/// An ordered batch of diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(Vec<Diagnostic>);

impl Diagnostics {
    pub fn new() -> Self {
        Diagnostics(Vec::new())
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.0.push(diagnostic);
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.0.extend(other.0);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.0.iter()
    }

    /// `Ok(())` if there is nothing to report.
    pub fn into_result(self) -> Result<(), Diagnostics> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl From<Diagnostic> for Diagnostics {
    fn from(d: Diagnostic) -> Self {
        Diagnostics(vec![d])
    }
}

impl FromIterator<Diagnostic> for Diagnostics {
    fn from_iter<T: IntoIterator<Item = Diagnostic>>(iter: T) -> Self {
        Diagnostics(iter.into_iter().collect())
    }
}

impl IntoIterator for Diagnostics {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;
    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Display for Diagnostics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.len() {
            0 => write!(f, "no errors"),
            1 => write!(f, "{}", self.0[0]),
            n => {
                write!(f, "{} errors:", n)?;
                for d in &self.0 {
                    write!(f, "\n  - {}", d)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for Diagnostics {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        assert_eq!(
            Diagnostic::config_at("local_file.a", "bad").to_string(),
            "local_file.a: bad"
        );
        assert_eq!(Diagnostic::config("cycle").to_string(), "cycle");
        let unknown = Diagnostic::unknown_value("local_file.a", "count is not known").to_string();
        assert!(unknown.contains("--target"), "{}", unknown);

        let mut diags = Diagnostics::new();
        diags.push(Diagnostic::config("one"));
        diags.push(Diagnostic::internal("two"));
        assert_eq!(diags.to_string(), "2 errors:\n  - one\n  - internal error: two");
    }

    #[test]
    fn provider_keeps_error_chain() {
        let err = anyhow::anyhow!("disk full").context("could not write");
        let d = Diagnostic::provider("local_file.a", &err);
        assert_eq!(d.to_string(), "local_file.a: could not write: disk full");
    }
}
