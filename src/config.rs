//! Textual runtime overrides.
//!
//! One override per line, `<operation>/<Kind>/<field>=<value>`. The operation id may
//! itself contain `/`, so the key is split from the right:
//!
//! ```
//! use faultline::config::{parse_overrides, OverrideKey};
//! use faultline::PolicyKind;
//!
//! let parsed = parse_overrides(
//!     "# tighten the greeter\ncom.acme.Greeter/hello/Retry/maxRetries = 5\n",
//! )
//! .unwrap();
//! assert_eq!(parsed.len(), 1);
//! let (key, value) = &parsed[0];
//! assert_eq!(key.operation.as_str(), "com.acme.Greeter/hello");
//! assert_eq!(key.kind, PolicyKind::Retry);
//! assert_eq!(key.field, "maxRetries");
//! assert_eq!(value, "5");
//! ```

use crate::error::PolicyError;
use crate::policy::{OperationId, PolicyKind};
use std::fmt;
use std::str::FromStr;

/// Address of one overridable field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OverrideKey {
    pub operation: OperationId,
    pub kind: PolicyKind,
    pub field: String,
}

impl fmt::Display for OverrideKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.operation, self.kind, self.field)
    }
}

impl FromStr for OverrideKey {
    type Err = PolicyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key = raw.trim();
        let mut parts = key.rsplitn(3, '/');
        let (field, kind, operation) = match (parts.next(), parts.next(), parts.next()) {
            (Some(field), Some(kind), Some(operation)) => (field.trim(), kind.trim(), operation.trim()),
            _ => return Err(PolicyError::MalformedOverride(key.to_string())),
        };
        if field.is_empty() || operation.is_empty() {
            return Err(PolicyError::MalformedOverride(key.to_string()));
        }
        Ok(Self { operation: OperationId::from(operation), kind: kind.parse()?, field: field.to_string() })
    }
}

/// Parse override lines, skipping blanks and `#` comments.
pub fn parse_overrides(text: &str) -> Result<Vec<(OverrideKey, String)>, PolicyError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| PolicyError::MalformedOverride(line.to_string()))?;
            Ok((key.parse()?, value.trim().to_string()))
        })
        .collect()
}
