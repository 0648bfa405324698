//! Connection security: identity credentials, hello exchange and the
//! per-connection session cipher.
//!
//! Each process carries an Ed25519 identity credential. Without a configured
//! secret the credential is freshly random each run (open-trust mode). With a
//! secret, the credential is derived deterministically from SHA-256 of the
//! secret, so two nodes sharing the secret present byte-identical public keys
//! and can verify each other.
//!
//! On connection set-up both sides exchange a [`Hello`]: identity public key,
//! a secret-derived flag, an ephemeral X25519 public key and an Ed25519
//! signature over the ephemeral key. After policy verification the session
//! key is HKDF-SHA256 over the X25519 agreement, and every subsequent frame
//! is sealed with AES-256-GCM (random 12-byte nonce prepended).

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::digest;
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair as _, UnparsedPublicKey, ED25519};
use ring::{agreement, hkdf};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

/// Version of the hello exchange; bumped on incompatible changes.
pub const HELLO_VERSION: u32 = 1;

const SESSION_INFO: &[u8] = b"clipmesh-session-v1";

/// Security / handshake errors
#[derive(Debug, Error)]
pub enum SecurityError {
    /// The peer presented a secret-derived key but we have none, or vice versa
    #[error("shared secret missing on one side; asymmetric trust is not accepted")]
    SecretMissing,

    /// Both sides are secret-derived but the keys differ
    #[error("shared secret mismatch")]
    SecretMismatch,

    /// The hello payload could not be decoded or has a bad shape
    #[error("invalid hello: {0}")]
    InvalidHello(String),

    /// The peer's signature over its ephemeral key failed verification
    #[error("hello signature verification failed")]
    BadSignature,

    /// Hello version we do not speak
    #[error("unsupported hello version {0}")]
    UnsupportedVersion(u32),

    /// Underlying cryptographic failure
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// A sealed frame failed to authenticate or decrypt
    #[error("frame failed to decrypt")]
    Unsealed,
}

/// Process identity credential.
pub struct Identity {
    keypair: Ed25519KeyPair,
    public: Vec<u8>,
    secret_derived: bool,
}

impl Identity {
    /// Fresh random credential (no shared secret configured).
    pub fn generate() -> Result<Self, SecurityError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let keypair = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref())
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let public = keypair.public_key().as_ref().to_vec();
        Ok(Self {
            keypair,
            public,
            secret_derived: false,
        })
    }

    /// Credential deterministically derived from a shared secret. Two nodes
    /// configured with the same secret produce identical public keys.
    pub fn from_secret(secret: &str) -> Result<Self, SecurityError> {
        let seed = Zeroizing::new(
            digest::digest(&digest::SHA256, secret.as_bytes())
                .as_ref()
                .to_vec(),
        );
        let keypair = Ed25519KeyPair::from_seed_unchecked(&seed)
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let public = keypair.public_key().as_ref().to_vec();
        Ok(Self {
            keypair,
            public,
            secret_derived: true,
        })
    }

    /// Build from an optional configured secret.
    pub fn from_config(secret: Option<&str>) -> Result<Self, SecurityError> {
        match secret {
            Some(s) if !s.is_empty() => Self::from_secret(s),
            _ => Self::generate(),
        }
    }

    /// Identity public key bytes presented to peers.
    pub fn public_key(&self) -> &[u8] {
        &self.public
    }

    /// Whether this credential is derived from a configured secret.
    pub fn secret_derived(&self) -> bool {
        self.secret_derived
    }

    /// SHA-256 fingerprint of the public key, for logs.
    pub fn fingerprint(&self) -> String {
        let hash = digest::digest(&digest::SHA256, &self.public);
        let encoded = BASE64.encode(hash.as_ref());
        format!("SHA256:{}", encoded.trim_end_matches('='))
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.keypair.sign(message).as_ref().to_vec()
    }

    /// Verification policy for a peer hello:
    /// both plain: accept (open-trust); flags differ: [`SecurityError::SecretMissing`];
    /// both secret-derived: accept iff the public keys are byte-identical.
    pub fn verify_peer(&self, hello: &Hello) -> Result<(), SecurityError> {
        match (self.secret_derived, hello.secret_derived) {
            (false, false) => Ok(()),
            (true, true) => {
                if hello.identity_key == self.public {
                    Ok(())
                } else {
                    Err(SecurityError::SecretMismatch)
                }
            }
            _ => Err(SecurityError::SecretMissing),
        }
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("secret_derived", &self.secret_derived)
            .finish()
    }
}

/// First payload in each direction on a new connection, sent in the clear
/// before any encrypted traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    /// Hello exchange version
    pub version: u32,
    /// Ed25519 identity public key
    pub identity_key: Vec<u8>,
    /// Whether the identity key is derived from a configured secret
    pub secret_derived: bool,
    /// Ephemeral X25519 public key for this connection
    pub session_key: Vec<u8>,
    /// Ed25519 signature by `identity_key` over `session_key`
    pub signature: Vec<u8>,
}

impl Hello {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, SecurityError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SecurityError::InvalidHello(e.to_string()))
    }

    /// Deserialize from wire bytes.
    pub fn decode(data: &[u8]) -> Result<Self, SecurityError> {
        let (hello, _): (Self, usize) =
            bincode::serde::decode_from_slice(data, bincode::config::standard())
                .map_err(|e| SecurityError::InvalidHello(e.to_string()))?;
        if hello.version != HELLO_VERSION {
            return Err(SecurityError::UnsupportedVersion(hello.version));
        }
        Ok(hello)
    }
}

/// In-progress connection security exchange. Holds the ephemeral private key
/// between producing our hello and receiving the peer's.
pub struct SessionSetup {
    hello: Hello,
    ephemeral: agreement::EphemeralPrivateKey,
}

impl SessionSetup {
    /// Generate the ephemeral key and our hello.
    pub fn new(identity: &Identity) -> Result<Self, SecurityError> {
        let rng = SystemRandom::new();
        let ephemeral = agreement::EphemeralPrivateKey::generate(&agreement::X25519, &rng)
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let session_public = ephemeral
            .compute_public_key()
            .map_err(|e| SecurityError::Crypto(e.to_string()))?;
        let session_key = session_public.as_ref().to_vec();
        let signature = identity.sign(&session_key);
        let hello = Hello {
            version: HELLO_VERSION,
            identity_key: identity.public_key().to_vec(),
            secret_derived: identity.secret_derived(),
            session_key,
            signature,
        };
        Ok(Self { hello, ephemeral })
    }

    /// Our hello, to be sent before the peer's is read.
    pub fn hello(&self) -> &Hello {
        &self.hello
    }

    /// Verify the peer hello under the secret policy and complete the key
    /// agreement, producing the session cipher for this connection.
    pub fn establish(
        self,
        identity: &Identity,
        peer: &Hello,
    ) -> Result<SessionCipher, SecurityError> {
        identity.verify_peer(peer)?;

        let peer_identity = UnparsedPublicKey::new(&ED25519, &peer.identity_key);
        peer_identity
            .verify(&peer.session_key, &peer.signature)
            .map_err(|_| SecurityError::BadSignature)?;

        // Both sides must derive the same salt; order the two ephemeral keys.
        let mut salt_material = [self.hello.session_key.clone(), peer.session_key.clone()];
        salt_material.sort();
        let salt_bytes: Vec<u8> = salt_material.concat();

        let peer_session = agreement::UnparsedPublicKey::new(&agreement::X25519, &peer.session_key);
        let key = agreement::agree_ephemeral(self.ephemeral, &peer_session, |shared| {
            let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt_bytes);
            let prk = salt.extract(shared);
            let okm = prk
                .expand(&[SESSION_INFO], hkdf::HKDF_SHA256)
                .map_err(|e| SecurityError::Crypto(e.to_string()))?;
            let mut key = Zeroizing::new([0u8; 32]);
            okm.fill(key.as_mut())
                .map_err(|e| SecurityError::Crypto(e.to_string()))?;
            Ok::<_, SecurityError>(key)
        })
        .map_err(|e| SecurityError::Crypto(e.to_string()))??;

        SessionCipher::new(&key)
    }
}

/// AES-256-GCM cipher sealing every frame on one connection.
pub struct SessionCipher {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

impl SessionCipher {
    fn new(key: &[u8; 32]) -> Result<Self, SecurityError> {
        let cipher =
            Aes256Gcm::new_from_slice(key).map_err(|e| SecurityError::Crypto(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt a frame; the random nonce is prepended to the ciphertext.
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| SecurityError::Crypto("encryption failed".into()))?;
        let mut out = Vec::with_capacity(nonce.len() + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a sealed frame produced by [`SessionCipher::seal`].
    pub fn open(&self, data: &[u8]) -> Result<Vec<u8>, SecurityError> {
        if data.len() < 12 {
            return Err(SecurityError::Unsealed);
        }
        let (nonce, ciphertext) = data.split_at(12);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SecurityError::Unsealed)
    }
}
