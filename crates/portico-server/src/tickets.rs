//! TLS session-ticket keys: derivation and weekly rotation.
//!
//! Ticket keys are not random: they are derived from a configured secret
//! (falling back to the TLS private key) and a slowly moving context
//! string, so every replica of a deployment mints interchangeable tickets
//! without coordination. Rotation re-derives weekly; the previous key is
//! kept for decryption so outstanding tickets survive one rotation.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use chrono::{Datelike, Utc};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::{Result, ServerError};

type HmacSha256 = Hmac<Sha256>;

/// Derived key material: 16-byte key name + 32-byte AES-256-GCM key.
pub const TICKET_KEY_LEN: usize = 48;

/// Keys are re-derived on this cadence.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Session (and ticket) lifetime advertised to clients: 7 days.
pub const SESSION_LIFETIME_SECS: u32 = 7 * 24 * 60 * 60;

const NONCE_LEN: usize = 12;
const NAME_LEN: usize = 16;

/// Derives 48 bytes of ticket-key material from `(seed, context)`.
///
/// HKDF-SHA256 with the context as salt: extract, then expand two blocks
/// and truncate.
pub fn derive_ticket_key(seed: &[u8], context: &str) -> [u8; TICKET_KEY_LEN] {
    // Extract
    let mut mac = <HmacSha256 as Mac>::new_from_slice(context.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(seed);
    let prk = mac.finalize().into_bytes();

    // Expand
    let info = b"portico session-ticket";
    let mut okm = [0u8; TICKET_KEY_LEN];
    let mut block: Vec<u8> = Vec::new();
    let mut filled = 0usize;
    let mut counter = 1u8;
    while filled < TICKET_KEY_LEN {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&prk)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(&block);
        mac.update(info);
        mac.update(&[counter]);
        block = mac.finalize().into_bytes().to_vec();

        let take = std::cmp::min(block.len(), TICKET_KEY_LEN - filled);
        okm[filled..filled + take].copy_from_slice(&block[..take]);
        filled += take;
        counter += 1;
    }

    okm
}

/// Builds the rotation context: `"<UTC-year> <UTC-month><image_ref>"`, or
/// empty when no image reference is configured.
pub fn rotation_context(image_ref: Option<&str>) -> String {
    match image_ref {
        Some(image) => {
            let now = Utc::now();
            format!("{} {}{}", now.year(), now.month(), image)
        }
        None => String::new(),
    }
}

/// Resolves the derivation seed: the base64 secret when configured, else
/// the TLS private key bytes.
pub fn ticket_seed(secret_b64: Option<&str>, tls_key: &[u8]) -> Result<Vec<u8>> {
    match secret_b64 {
        Some(b64) => base64::engine::general_purpose::STANDARD
            .decode(b64)
            .map_err(|e| ServerError::Config(format!("bad ticket secret: {e}"))),
        None => Ok(tls_key.to_vec()),
    }
}

struct TicketKey {
    name: [u8; NAME_LEN],
    cipher: Aes256Gcm,
}

impl TicketKey {
    fn from_material(material: &[u8; TICKET_KEY_LEN]) -> Self {
        let mut name = [0u8; NAME_LEN];
        name.copy_from_slice(&material[..NAME_LEN]);
        let cipher = Aes256Gcm::new_from_slice(&material[NAME_LEN..])
            .unwrap_or_else(|_| unreachable!("32-byte key"));
        Self { name, cipher }
    }
}

/// Session-ticket encrypter with one active and one previous key.
///
/// Installed as the rustls ticketer on every TLS listener; `install`
/// swaps keys atomically under the lock.
pub struct RotatingTicketer {
    keys: RwLock<(TicketKey, Option<TicketKey>)>,
}

impl std::fmt::Debug for RotatingTicketer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RotatingTicketer").finish_non_exhaustive()
    }
}

impl RotatingTicketer {
    pub fn new(material: [u8; TICKET_KEY_LEN]) -> Arc<Self> {
        Arc::new(Self {
            keys: RwLock::new((TicketKey::from_material(&material), None)),
        })
    }

    /// Makes `material` the active key; the prior key stays valid for
    /// decryption until the next rotation.
    pub fn install(&self, material: [u8; TICKET_KEY_LEN]) {
        let next = TicketKey::from_material(&material);
        let mut keys = self.keys.write();
        let old = std::mem::replace(&mut keys.0, next);
        keys.1 = Some(old);
    }
}

impl rustls::server::ProducesTickets for RotatingTicketer {
    fn enabled(&self) -> bool {
        true
    }

    fn lifetime(&self) -> u32 {
        SESSION_LIFETIME_SECS
    }

    fn encrypt(&self, plain: &[u8]) -> Option<Vec<u8>> {
        let keys = self.keys.read();
        let key = &keys.0;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let sealed = key
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plain,
                    aad: &key.name,
                },
            )
            .ok()?;

        let mut out = Vec::with_capacity(NAME_LEN + NONCE_LEN + sealed.len());
        out.extend_from_slice(&key.name);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Some(out)
    }

    fn decrypt(&self, cipher: &[u8]) -> Option<Vec<u8>> {
        if cipher.len() < NAME_LEN + NONCE_LEN {
            return None;
        }

        let (name, rest) = cipher.split_at(NAME_LEN);
        let (nonce, sealed) = rest.split_at(NONCE_LEN);

        let keys = self.keys.read();
        let key = if keys.0.name == name {
            &keys.0
        } else {
            match &keys.1 {
                Some(prev) if prev.name == name => prev,
                _ => return None,
            }
        };

        key.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: name,
                },
            )
            .ok()
    }
}

/// Runs the weekly rotation until shutdown.
///
/// Derivation happens off the async threads; failures are logged and the
/// previous key stays in service.
pub fn spawn_rotation(
    ticketer: Arc<RotatingTicketer>,
    seed: Vec<u8>,
    image_ref: Option<String>,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ROTATION_PERIOD);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick is immediate and redundant with the startup key.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.recv() => {
                    debug!("ticket rotation stopped");
                    return;
                }
            }

            let seed = seed.clone();
            let context = rotation_context(image_ref.as_deref());
            match tokio::task::spawn_blocking(move || derive_ticket_key(&seed, &context))
                .await
            {
                Ok(material) => {
                    ticketer.install(material);
                    info!("session-ticket key rotated");
                }
                Err(e) => {
                    warn!(error = %e, "session-ticket key rotation failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::server::ProducesTickets;

    #[test]
    fn test_derivation_is_deterministic() {
        let a = derive_ticket_key(b"seed", "2026 8img");
        let b = derive_ticket_key(b"seed", "2026 8img");
        assert_eq!(a, b);

        let c = derive_ticket_key(b"seed", "2026 9img");
        assert_ne!(a, c);

        let d = derive_ticket_key(b"other", "2026 8img");
        assert_ne!(a, d);
    }

    #[test]
    fn test_seed_prefers_secret() {
        let seed = ticket_seed(Some("c2VjcmV0"), b"keybytes").unwrap();
        assert_eq!(seed, b"secret");

        let seed = ticket_seed(None, b"keybytes").unwrap();
        assert_eq!(seed, b"keybytes");

        assert!(ticket_seed(Some("!!not-base64!!"), b"k").is_err());
    }

    #[test]
    fn test_rotation_context_shape() {
        assert_eq!(rotation_context(None), "");

        let ctx = rotation_context(Some("img@sha256:abc"));
        assert!(ctx.ends_with("img@sha256:abc"));
        assert!(ctx.contains(' '));
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let ticketer = RotatingTicketer::new(derive_ticket_key(b"seed", "ctx"));

        let sealed = ticketer.encrypt(b"session state").unwrap();
        assert_ne!(&sealed[..], b"session state");
        assert_eq!(ticketer.decrypt(&sealed).unwrap(), b"session state");
    }

    #[test]
    fn test_previous_key_still_decrypts() {
        let ticketer = RotatingTicketer::new(derive_ticket_key(b"seed", "old"));
        let sealed = ticketer.encrypt(b"state").unwrap();

        ticketer.install(derive_ticket_key(b"seed", "new"));
        assert_eq!(ticketer.decrypt(&sealed).unwrap(), b"state");

        // Two rotations later the old ticket is gone.
        ticketer.install(derive_ticket_key(b"seed", "newer"));
        assert!(ticketer.decrypt(&sealed).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        let ticketer = RotatingTicketer::new(derive_ticket_key(b"seed", "ctx"));
        assert!(ticketer.decrypt(b"short").is_none());
        assert!(ticketer.decrypt(&[0u8; 64]).is_none());

        let mut sealed = ticketer.encrypt(b"state").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert!(ticketer.decrypt(&sealed).is_none());
    }

    #[test]
    fn test_lifetime_is_seven_days() {
        let ticketer = RotatingTicketer::new(derive_ticket_key(b"s", ""));
        assert!(ticketer.enabled());
        assert_eq!(ticketer.lifetime(), 7 * 24 * 60 * 60);
    }
}
