use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

/// Wraps an owner identity (parent email, child id) so that it never shows up
/// verbatim in `tracing` output. Serialization still emits the real value
/// because API responses and stored rows need it.
#[derive(Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct Masked<T>(pub T);

impl<T: AsRef<str>> Masked<T> {
    /// Keeps the first two characters and the domain of an email, if any.
    fn redacted(&self) -> String {
        let raw = self.0.as_ref();
        let (local, domain) = match raw.split_once('@') {
            Some((local, domain)) => (local, Some(domain)),
            None => (raw, None),
        };
        let visible: String = local.chars().take(2).collect();
        match domain {
            Some(domain) => format!("{}***@{}", visible, domain),
            None => format!("{}***", visible),
        }
    }
}

impl<T: AsRef<str>> fmt::Debug for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Masked({})", self.redacted())
    }
}

impl<T: AsRef<str>> fmt::Display for Masked<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl<T: Serialize> Serialize for Masked<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<T> Masked<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: AsRef<str>> AsRef<str> for Masked<T> {
    fn as_ref(&self) -> &str {
        self.0.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_is_redacted_in_logs() {
        let owner = Masked("parent.one@example.com".to_string());
        assert_eq!(owner.to_string(), "pa***@example.com");
        assert_eq!(format!("{:?}", owner), "Masked(pa***@example.com)");
    }

    #[test]
    fn test_plain_identity_is_redacted() {
        let owner = Masked("child-42");
        assert_eq!(owner.to_string(), "ch***");
    }

    #[test]
    fn test_serializes_real_value() {
        let owner = Masked("parent@example.com".to_string());
        let json = serde_json::to_string(&owner).unwrap();
        assert_eq!(json, "\"parent@example.com\"");
    }
}
