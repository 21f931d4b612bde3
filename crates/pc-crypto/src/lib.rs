use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer as DalekSigner, SigningKey, Verifier, VerifyingKey};
use pc_api_types::SignPurpose;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

const DOMAIN_PREFIX: &[u8] = b"points-console:v1:";

/// Signs with key material held by this process.
pub trait Signer: Send + Sync {
    fn sign(&self, payload: &[u8], purpose: SignPurpose) -> Result<Vec<u8>>;
}

/// Signs on behalf of an account whose key lives elsewhere (a wallet extension
/// or a remote signing service). The connection delegates to it at submission time.
#[async_trait]
pub trait ExternalSigner: Send + Sync {
    fn source(&self) -> &str;
    async fn sign(&self, address: &str, payload: &[u8], purpose: SignPurpose) -> Result<Vec<u8>>;
}

pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn new_random() -> Self {
        let mut rng = OsRng;
        let signing_key = SigningKey::generate(&mut rng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(secret_key: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret_key),
        }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        to_hex(&self.public_key_bytes())
    }

    pub fn address(&self) -> String {
        address_for_public_key(&self.public_key_bytes())
    }

    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing_key.to_bytes())
    }

    pub fn verify(&self, payload: &[u8], purpose: SignPurpose, signature: &[u8]) -> Result<bool> {
        verify_signature(&self.public_key_bytes(), payload, purpose, signature)
    }
}

impl Signer for Ed25519Signer {
    fn sign(&self, payload: &[u8], purpose: SignPurpose) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Err(anyhow!("payload cannot be empty"));
        }

        let signature: Signature = self.signing_key.sign(&signing_input(payload, purpose));
        Ok(signature.to_bytes().to_vec())
    }
}

pub fn verify_signature(
    public_key: &[u8; 32],
    payload: &[u8],
    purpose: SignPurpose,
    signature: &[u8],
) -> Result<bool> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|err| anyhow!("invalid public key: {err}"))?;
    let signature =
        Signature::from_slice(signature).map_err(|err| anyhow!("invalid signature: {err}"))?;
    Ok(verifying_key
        .verify(&signing_input(payload, purpose), &signature)
        .is_ok())
}

/// Address scheme for locally created accounts: sha256 of the public key, truncated to 20 bytes.
pub fn address_for_public_key(public_key: &[u8; 32]) -> String {
    let digest = Sha256::digest(public_key);
    format!("0x{}", to_hex(&digest[..20]))
}

fn signing_input(payload: &[u8], purpose: SignPurpose) -> Vec<u8> {
    let purpose_tag: &[u8] = match purpose {
        SignPurpose::Transaction => b"transaction",
        SignPurpose::Message => b"message",
    };

    let mut input = Vec::with_capacity(DOMAIN_PREFIX.len() + purpose_tag.len() + 1 + payload.len());
    input.extend_from_slice(DOMAIN_PREFIX);
    input.extend_from_slice(purpose_tag);
    input.push(b':');
    input.extend_from_slice(payload);
    input
}

pub fn to_hex(input: &[u8]) -> String {
    hex::encode(input)
}

pub fn from_hex(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim();
    let digits = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    hex::decode(digits).context("invalid hex string")
}

pub fn encrypt_key_material(secret_key: &[u8; 32], encryption_key: &str) -> Result<Vec<u8>> {
    if encryption_key.trim().is_empty() {
        return Err(anyhow!("encryption key cannot be empty"));
    }

    let key_stream = derive_key_stream(encryption_key, secret_key.len());
    Ok(secret_key
        .iter()
        .zip(key_stream.iter())
        .map(|(byte, mask)| byte ^ mask)
        .collect())
}

pub fn decrypt_key_material(encrypted: &[u8], encryption_key: &str) -> Result<Zeroizing<[u8; 32]>> {
    if encryption_key.trim().is_empty() {
        return Err(anyhow!("encryption key cannot be empty"));
    }

    if encrypted.len() != 32 {
        return Err(anyhow!("invalid encrypted key length"));
    }

    let key_stream = derive_key_stream(encryption_key, encrypted.len());
    let mut decrypted = Zeroizing::new([0_u8; 32]);
    for (index, byte) in encrypted.iter().enumerate() {
        decrypted[index] = byte ^ key_stream[index];
    }

    Ok(decrypted)
}

fn derive_key_stream(seed: &str, len: usize) -> Zeroizing<Vec<u8>> {
    let mut stream = Zeroizing::new(Vec::with_capacity(len));
    let mut counter: u64 = 0;
    while stream.len() < len {
        let mut hasher = Sha256::new();
        hasher.update(seed.as_bytes());
        hasher.update(counter.to_le_bytes());
        let block = hasher.finalize();
        let remaining = len - stream.len();
        stream.extend(block.iter().take(remaining));
        counter += 1;
    }
    stream
}
