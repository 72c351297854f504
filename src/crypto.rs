/// Sensor public keys and signature verification
///
/// Devices sign with RSASSA-PKCS1-v1_5 / SHA-256 using an RSA-2048 key, so
/// every signature on the wire is exactly 256 bytes. The public key travels
/// as DER-encoded PKCS#1 `RSAPublicKey` and is stored hex-encoded.
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Public};
use openssl::rsa::Rsa;
use openssl::sign::Verifier;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const SIGNATURE_LEN: usize = 256;
const KEY_BITS: u32 = 2048;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("public key is not a DER sequence")]
    NotDer,
    #[error("invalid public key: {0}")]
    Invalid(#[from] openssl::error::ErrorStack),
    #[error("unsupported key size: {0} bits (expected 2048)")]
    UnsupportedSize(u32),
    #[error("invalid hex key encoding: {0}")]
    Hex(#[from] hex::FromHexError),
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PublicKey {
    der: Vec<u8>,
    key: PKey<Public>,
}

impl PublicKey {
    pub fn from_der(der: &[u8]) -> Result<Self, KeyError> {
        let rsa = Rsa::public_key_from_der_pkcs1(der)?;
        let bits = rsa.size() * 8;
        if bits != KEY_BITS {
            return Err(KeyError::UnsupportedSize(bits));
        }
        Ok(PublicKey {
            der: der.to_vec(),
            key: PKey::from_rsa(rsa)?,
        })
    }

    /// Parses a key at the start of `bytes` and returns whatever follows it.
    pub fn from_der_prefix(bytes: &[u8]) -> Result<(Self, &[u8]), KeyError> {
        let len = der_sequence_len(bytes).ok_or(KeyError::NotDer)?;
        let (der, rest) = bytes.split_at(len);
        Ok((Self::from_der(der)?, rest))
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// True when `signature` is a valid signature of `message` under this key.
    /// Verification errors count as a bad signature.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        if signature.len() != SIGNATURE_LEN {
            return false;
        }
        let verify = || -> Result<bool, openssl::error::ErrorStack> {
            let mut verifier = Verifier::new(MessageDigest::sha256(), &self.key)?;
            verifier.update(message)?;
            verifier.verify(signature)
        };
        verify().unwrap_or(false)
    }
}

/// Total length (header included) of the DER SEQUENCE starting `bytes`.
fn der_sequence_len(bytes: &[u8]) -> Option<usize> {
    if *bytes.first()? != 0x30 {
        return None;
    }
    let first = *bytes.get(1)? as usize;
    let (header, body) = if first < 0x80 {
        (2, first)
    } else {
        let count = first & 0x7f;
        if count == 0 || count > 4 {
            return None;
        }
        let len_bytes = bytes.get(2..2 + count)?;
        let body = len_bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
        (2 + count, body)
    };
    let total = header.checked_add(body)?;
    (total <= bytes.len()).then_some(total)
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PublicKey")
            .field("der_len", &self.der.len())
            .finish()
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl TryFrom<String> for PublicKey {
    type Error = KeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_der(&hex::decode(value)?)
    }
}

impl From<PublicKey> for String {
    fn from(key: PublicKey) -> Self {
        hex::encode(key.der)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::PublicKey;
    use openssl::hash::MessageDigest;
    use openssl::pkey::{PKey, Private};
    use openssl::rsa::Rsa;
    use openssl::sign::Signer;

    /// Device-side key pair for building signed frames in tests.
    pub struct TestKey {
        key: PKey<Private>,
    }

    impl TestKey {
        pub fn generate() -> Self {
            let rsa = Rsa::generate(2048).unwrap();
            TestKey {
                key: PKey::from_rsa(rsa).unwrap(),
            }
        }

        pub fn public_der(&self) -> Vec<u8> {
            self.key.rsa().unwrap().public_key_to_der_pkcs1().unwrap()
        }

        pub fn public_key(&self) -> PublicKey {
            PublicKey::from_der(&self.public_der()).unwrap()
        }

        pub fn sign(&self, message: &[u8]) -> Vec<u8> {
            let mut signer = Signer::new(MessageDigest::sha256(), &self.key).unwrap();
            signer.update(message).unwrap();
            signer.sign_to_vec().unwrap()
        }

        /// `message ‖ signature(message)`
        pub fn signed(&self, message: &[u8]) -> Vec<u8> {
            let mut frame = message.to_vec();
            frame.extend(self.sign(message));
            frame
        }
    }
}
