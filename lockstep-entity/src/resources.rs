//! Active game configuration, as seen by the entity.

use crate::types::{ContentHash, ResourceCorrection};

/// Supplies the active configuration version that clients must match.
pub trait ResourceProvider: Send + Sync {
    /// Content hash of the active configuration.
    fn active_version(&self) -> ContentHash;

    /// Correction a client on `client_version` needs, if any.
    fn correction_for(&self, client_version: &ContentHash) -> Option<ResourceCorrection> {
        let server_version = self.active_version();
        if &server_version == client_version {
            None
        } else {
            Some(ResourceCorrection {
                client_version: client_version.clone(),
                server_version,
            })
        }
    }
}

/// A fixed configuration version.
#[derive(Debug, Clone)]
pub struct StaticResources {
    version: ContentHash,
}

impl StaticResources {
    pub fn new(version: ContentHash) -> Self {
        Self { version }
    }
}

impl ResourceProvider for StaticResources {
    fn active_version(&self) -> ContentHash {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_only_on_mismatch() {
        let resources = StaticResources::new(ContentHash::new("v2"));
        assert_eq!(resources.correction_for(&ContentHash::new("v2")), None);

        let correction = resources.correction_for(&ContentHash::new("v1")).unwrap();
        assert_eq!(correction.client_version, ContentHash::new("v1"));
        assert_eq!(correction.server_version, ContentHash::new("v2"));
    }
}
