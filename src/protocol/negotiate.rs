//! Capability negotiation.
//!
//! The initiating side advertises its native type. The responding side
//! confirms it if it matches its own, otherwise answers with fallback, and
//! both ends then use the generic tree stream.

use crate::error::{MigrationError, Result};
use crate::protocol::message::{MigrationControl, MigrationHeader, TransferType};
use crate::transport::{Channel, MessageType, WireMessage};

/// Decide the transfer type from our own capability and the advertised one.
pub fn negotiate(own: TransferType, advertised: Option<TransferType>) -> TransferType {
    match advertised {
        Some(peer) if peer == own => own,
        _ => TransferType::Fallback,
    }
}

/// Read the peer's header. A frame that is not a well-formed header is a
/// negotiation failure; socket errors stay transport errors.
async fn recv_header(control: &Channel) -> Result<MigrationHeader> {
    let (msg_type, payload) = control.recv_frame().await?;
    match msg_type {
        MessageType::Header => MigrationHeader::decode(payload).map_err(|e| {
            MigrationError::Negotiation(format!("Malformed migration header: {:#}", e))
        }),
        MessageType::Control => match MigrationControl::decode(payload) {
            Ok(msg) if !msg.success => Err(MigrationError::Remote(msg.message)),
            _ => Err(MigrationError::Negotiation(
                "Expected migration header, got a control message".to_string(),
            )),
        },
        other => Err(MigrationError::Negotiation(format!(
            "Expected migration header, got {:?} frame",
            other
        ))),
    }
}

/// Source side: send our header, read the reply, settle on a transfer type.
pub async fn initiate(control: &Channel, offer: &MigrationHeader) -> Result<TransferType> {
    let own = offer.transfer_type();

    if let Err(e) = control.send(offer).await {
        tracing::error!("Failed to send migration header: {}", e);
        return Err(report(control, e).await);
    }

    let reply = match recv_header(control).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::error!("Failed to receive migration header: {}", e);
            return Err(report(control, e).await);
        }
    };

    let negotiated = negotiate(own, reply.fs);
    if let Some(peer) = reply.fs {
        if peer.is_native() && peer != own {
            let e = MigrationError::Negotiation(format!(
                "Peer answered {} to an offer of {}",
                peer, own
            ));
            return Err(report(control, e).await);
        }
    }

    tracing::debug!(offered = %own, negotiated = %negotiated, "Migration header exchanged");
    Ok(negotiated)
}

/// Sink side: read the peer's header and answer with the agreed type.
///
/// Returns the peer's header (snapshot list, flags, idmap) and the agreed type.
pub async fn respond(
    control: &Channel,
    own: TransferType,
) -> Result<(MigrationHeader, TransferType)> {
    let offer = match recv_header(control).await {
        Ok(offer) => offer,
        Err(e) => {
            tracing::error!("Failed to receive migration header: {}", e);
            return Err(report(control, e).await);
        }
    };

    let negotiated = negotiate(own, offer.fs);
    if negotiated != own {
        tracing::info!(
            ours = %own,
            theirs = %offer.transfer_type(),
            "Storage types differ, using fallback transfer"
        );
    }

    let reply = MigrationHeader::new(negotiated, offer.flags);
    if let Err(e) = control.send(&reply).await {
        tracing::error!("Failed to send migration header: {}", e);
        return Err(report(control, e).await);
    }

    Ok((offer, negotiated))
}

/// Report a failure on the control channel, best-effort, and hand the error
/// back for propagation.
pub async fn report(control: &Channel, err: MigrationError) -> MigrationError {
    if let Err(send_err) = control
        .send(&MigrationControl::failure(err.to_string()))
        .await
    {
        tracing::warn!("Failed to report migration failure to peer: {}", send_err);
    }
    err
}
