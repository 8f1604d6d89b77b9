//! Admin password collection
//!
//! The password is read interactively, confirmed, checked against a minimum
//! length and then held in a [`SecretValue`] that never prints its content.

use std::fmt;
use std::io;

use dialoguer::Password;
use dialoguer::theme::ColorfulTheme;

/// A value that must never reach logs, reports or disk
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a secret
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Consume the wrapper and hand out the plaintext
    pub fn into_inner(self) -> String {
        self.0
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }

    /// Whether the secret is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretValue(<redacted>)")
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Where secrets come from
pub trait SecretSource {
    /// Read one secret without echo
    fn read_secret(&mut self, prompt: &str) -> io::Result<String>;

    /// Tell the operator why an entry was rejected
    fn notify(&mut self, message: &str);
}

/// Prompts on the controlling terminal
#[derive(Debug, Default)]
pub struct TerminalSource;

impl SecretSource for TerminalSource {
    fn read_secret(&mut self, prompt: &str) -> io::Result<String> {
        Password::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()
            .map_err(|e| io::Error::other(e.to_string()))
    }

    fn notify(&mut self, message: &str) {
        eprintln!("{message}");
    }
}

/// Entry-and-confirmation loop for a new password
pub struct SecretPrompt<S> {
    source: S,
    label: String,
}

impl<S: SecretSource> SecretPrompt<S> {
    /// Create a prompt for the secret called `label`
    pub fn new(source: S, label: impl Into<String>) -> Self {
        Self {
            source,
            label: label.into(),
        }
    }

    /// Ask until two matching entries of at least `min_length` characters
    /// are given.
    ///
    /// There is no retry limit. An I/O error from the source (for example
    /// end of input) aborts collection.
    pub fn collect(&mut self, min_length: usize) -> io::Result<SecretValue> {
        loop {
            let first = self.source.read_secret(&format!("Password for {}", self.label))?;
            let second = self.source.read_secret("Confirm password")?;

            if first != second {
                self.source.notify("Passwords do not match, try again.");
                continue;
            }
            if first.chars().count() < min_length {
                self.source.notify(&format!(
                    "Password must be at least {min_length} characters, try again."
                ));
                continue;
            }

            tracing::debug!(label = %self.label, "password collected");
            return Ok(SecretValue::new(first));
        }
    }
}
