use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Display;

/// Deterministic content hash of a process declaration. Reload compares
/// fingerprints to decide whether a declaration materially changed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Hashes the canonical YAML serialization of the declaration. Field
    /// order is the declaration order of the struct, so equal declarations
    /// always produce equal fingerprints.
    pub fn of<T: Serialize>(value: &T) -> Self {
        let serialized =
            serde_yaml::to_string(value).expect("a declaration always serializes to YAML");
        let mut hasher = Sha256::new();
        hasher.update(serialized.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Declaration {
        command: Vec<String>,
        scale: usize,
    }

    #[test]
    fn equal_declarations_share_a_fingerprint() {
        let a = Declaration {
            command: vec!["/bin/true".to_string()],
            scale: 2,
        };
        let b = Declaration {
            command: vec!["/bin/true".to_string()],
            scale: 2,
        };
        assert_eq!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn changed_declarations_differ() {
        let a = Declaration {
            command: vec!["/bin/true".to_string()],
            scale: 2,
        };
        let b = Declaration {
            command: vec!["/bin/false".to_string()],
            scale: 2,
        };
        assert_ne!(Fingerprint::of(&a), Fingerprint::of(&b));
    }

    #[test]
    fn display_is_hex() {
        let a = Declaration {
            command: vec![],
            scale: 1,
        };
        let rendered = Fingerprint::of(&a).to_string();
        assert_eq!(rendered.len(), 64);
        assert!(rendered.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
