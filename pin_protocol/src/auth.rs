use blake3::derive_key;

const SECRET_CONTEXT: &str = "pin-cluster/auth/shared-secret";

/// The shared cluster secret, kept only as a derived digest.
///
/// Comparing `blake3::Hash` values is constant-time, so a peer probing
/// secrets learns nothing from response timing.
#[derive(Clone)]
pub struct ClusterSecret {
    digest: blake3::Hash,
    plain: String,
}

impl ClusterSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        let plain = secret.into();
        Self {
            digest: blake3::Hash::from_bytes(derive_key(SECRET_CONTEXT, plain.as_bytes())),
            plain,
        }
    }

    pub fn verify(&self, presented: &str) -> bool {
        blake3::Hash::from_bytes(derive_key(SECRET_CONTEXT, presented.as_bytes())) == self.digest
    }

    /// The secret as sent in our own `AUTH` messages.
    pub fn expose(&self) -> &str {
        &self.plain
    }
}

impl std::fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClusterSecret(..)")
    }
}
