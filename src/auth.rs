//! Peer Authentication
//!
//! Runs over an already established channel. Both ends send a random
//! challenge, answer the other side's challenge with an HMAC keyed by their
//! own pre-shared key, and verify the answer they receive against the key
//! the registry holds for the claimed address.

use std::net::Ipv4Addr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::network::codec::{Message, TunnelCodec, NONCE_LEN, PROOF_LEN};
use crate::peers::{PeerDefinition, PeerRegistry};

type HmacSha256 = Hmac<Sha256>;

const PROOF_CONTEXT: &[u8] = b"etherdwarf-auth-v1";

/// Validates connecting peers against the registry
#[derive(Debug, Clone)]
pub struct Authenticator {
    registry: Arc<PeerRegistry>,
}

impl Authenticator {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    /// Run the identity exchange and return the verified remote peer.
    ///
    /// Any failure leaves the channel unusable; the caller drops it.
    pub async fn authenticate<S>(&self, framed: &mut Framed<S, TunnelCodec>) -> Result<Arc<PeerDefinition>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let local = self.registry.local();

        let mut our_nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut our_nonce);
        framed.send(Message::Challenge { nonce: our_nonce }).await?;

        let their_nonce = match next_message(framed).await? {
            Message::Challenge { nonce } => nonce,
            other => return Err(unexpected(&other, "Challenge")),
        };

        let proof = compute_proof(&local.preshared_key, local.address, &their_nonce)?;
        framed.send(Message::Identify { address: local.address, proof }).await?;

        let (claimed, presented) = match next_message(framed).await? {
            Message::Identify { address, proof } => (address, proof),
            Message::Rejected => return Err(Error::Authentication("rejected by peer".into())),
            other => return Err(unexpected(&other, "Identify")),
        };

        let peer = match self.verify(claimed, &our_nonce, &presented) {
            Ok(peer) => peer,
            Err(e) => {
                let _ = framed.send(Message::Rejected).await;
                return Err(e);
            }
        };
        framed.send(Message::Accepted).await?;

        match next_message(framed).await? {
            Message::Accepted => Ok(peer),
            Message::Rejected => Err(Error::Authentication(format!("rejected by peer {}", claimed))),
            other => Err(unexpected(&other, "Accepted")),
        }
    }

    /// Check a claimed identity against the registry
    pub fn verify(
        &self,
        claimed: Ipv4Addr,
        our_nonce: &[u8; NONCE_LEN],
        presented: &[u8; PROOF_LEN],
    ) -> Result<Arc<PeerDefinition>> {
        let peer = self
            .registry
            .remote(&claimed)
            .ok_or_else(|| Error::Authentication(format!("unknown peer {}", claimed)))?;

        let mut mac = keyed(&peer.preshared_key)?;
        mac.update(PROOF_CONTEXT);
        mac.update(&claimed.octets());
        mac.update(our_nonce);
        mac.verify_slice(presented)
            .map_err(|_| Error::Authentication(format!("pre-shared key mismatch for {}", claimed)))?;

        Ok(Arc::clone(peer))
    }
}

/// Proof that the holder of `key` speaks for `address`, bound to `nonce`
pub fn compute_proof(key: &[u8], address: Ipv4Addr, nonce: &[u8; NONCE_LEN]) -> Result<[u8; PROOF_LEN]> {
    let mut mac = keyed(key)?;
    mac.update(PROOF_CONTEXT);
    mac.update(&address.octets());
    mac.update(nonce);

    let mut proof = [0u8; PROOF_LEN];
    proof.copy_from_slice(&mac.finalize().into_bytes());
    Ok(proof)
}

fn keyed(key: &[u8]) -> Result<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| Error::Authentication(format!("unusable pre-shared key: {}", e)))
}

async fn next_message<S>(framed: &mut Framed<S, TunnelCodec>) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(message) => message,
        None => Err(Error::Authentication("connection closed during authentication".into())),
    }
}

fn unexpected(message: &Message, expected: &str) -> Error {
    Error::Protocol(format!("expected {} during authentication, got {}", expected, message.type_name()))
}
