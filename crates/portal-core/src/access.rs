//! Optional shared-key gate in front of the API

use crate::{CoreError, Result};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct AccessCheck {
    pub valid: bool,
}

/// Without a configured key every caller passes
#[derive(Clone, Default)]
pub struct AccessGate {
    key: Option<SecretString>,
}

impl AccessGate {
    pub fn new(key: Option<SecretString>) -> Self {
        Self { key }
    }

    pub fn is_enabled(&self) -> bool {
        self.key.is_some()
    }

    pub fn check(&self, supplied: Option<&str>) -> AccessCheck {
        let valid = match &self.key {
            None => true,
            Some(key) => supplied == Some(key.expose_secret().as_str()),
        };
        AccessCheck { valid }
    }

    pub fn verify(&self, supplied: Option<&str>) -> Result<()> {
        if self.check(supplied).valid {
            Ok(())
        } else {
            Err(CoreError::Unauthorized("invalid portal key".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_gate_accepts_anything() {
        let gate = AccessGate::default();
        assert!(gate.check(None).valid);
        assert!(gate.check(Some("whatever")).valid);
        gate.verify(None).unwrap();
    }

    #[test]
    fn test_keyed_gate_requires_exact_match() {
        let gate = AccessGate::new(Some(SecretString::new("s3cret".to_string())));
        assert!(gate.check(Some("s3cret")).valid);
        assert!(!gate.check(Some("S3CRET")).valid);
        assert!(!gate.check(None).valid);
        assert!(matches!(
            gate.verify(Some("nope")),
            Err(CoreError::Unauthorized(_))
        ));
    }
}
