//! Async handshake drivers over [`AsyncConnection`]. Same engines, same outcomes as
//! [`super::blocking`].

use anyhow::anyhow;

use super::fault::send_fault_async;
use super::{
    ClientHandshake, ClientOptions, ClientSession, ClientStep, Endpoint, EnvelopeReader, Feed,
    ServerHandshake, ServerSession, ServerStep, ViaValidation,
};
use crate::config::FramingSettings;
use crate::connection::{AsyncConnection, AsyncPreReadConnection, ReadBuffer, TimeoutHelper};
use crate::framing::{FramingMode, HandshakeModeDecoder};
use crate::upgrade::{AsyncUpgradeAcceptor, AsyncUpgradeInitiator};
use crate::{Error, Result};

async fn write_all<C: AsyncConnection + ?Sized>(
    conn: &mut C,
    bytes: &[u8],
    helper: &TimeoutHelper,
) -> Result<()> {
    conn.write(bytes, true, helper.remaining_or_timeout()?)
        .await
        .map_err(|e| helper.classify(e).into())
}

async fn feed<C: AsyncConnection + ?Sized, F: Feed>(
    conn: &mut C,
    buffer: &mut ReadBuffer,
    helper: &TimeoutHelper,
    engine: &mut F,
) -> Result<()> {
    if buffer.is_empty() {
        let read = buffer
            .fill_async(conn, helper.remaining_or_timeout()?)
            .await
            .map_err(|e| helper.classify(e))?;
        if read == 0 {
            return Err(engine.premature_eof().into());
        }
    }
    let consumed = engine.on_read(buffer.filled())?;
    buffer.consume(consumed);
    Ok(())
}

async fn fail<C: AsyncConnection + ?Sized>(
    conn: &mut C,
    err: &Error,
    max_drain: usize,
    helper: &TimeoutHelper,
) {
    tracing::debug!(connection_id = %conn.connection_id(), error = %err, "server handshake failed");
    match err.fault_to_send() {
        Some(fault) => send_fault_async(conn, fault, max_drain, helper).await,
        None => conn.abort(),
    }
}

/// See [`super::blocking::read_mode`].
pub async fn read_mode(
    conn: &mut dyn AsyncConnection,
    buffer: &mut ReadBuffer,
    settings: &FramingSettings,
    helper: &TimeoutHelper,
) -> Result<(FramingMode, u64)> {
    let mut decoder = HandshakeModeDecoder::new();
    while !decoder.is_done() {
        if let Err(e) = feed(conn, buffer, helper, &mut decoder).await {
            fail(conn, &e, settings.max_drain_size, helper).await;
            return Err(e);
        }
    }
    match decoder.mode() {
        Some(mode) => {
            tracing::debug!(connection_id = %conn.connection_id(), ?mode, "framing mode negotiated");
            Ok((mode, decoder.stream_position()))
        }
        None => Err(decoder.premature_eof().into()),
    }
}

/// Run the client handshake over `conn`, applying the initiator's upgrades in order.
pub async fn connect(
    conn: Box<dyn AsyncConnection>,
    options: &ClientOptions,
    mut initiator: Option<&mut dyn AsyncUpgradeInitiator>,
) -> Result<ClientSession<dyn AsyncConnection>> {
    let settings = &options.settings;
    let helper = TimeoutHelper::new(settings.open_timeout);
    let mut buffer = ReadBuffer::new(settings.connection_buffer_size);
    let mut handshake =
        ClientHandshake::new(options.mode, &options.via, &options.content_type, settings);
    let mut conn = conn;
    tracing::debug!(
        connection_id = %conn.connection_id(),
        via = %options.via,
        mode = ?options.mode,
        "starting client handshake"
    );

    loop {
        let result = match handshake.next_step() {
            ClientStep::Write(bytes) => write_all(conn.as_mut(), &bytes, &helper).await,
            ClientStep::NextUpgrade => {
                let next = initiator.as_deref_mut().and_then(|i| i.next_upgrade());
                handshake.on_next_upgrade(next)
            }
            ClientStep::Read => feed(conn.as_mut(), &mut buffer, &helper, &mut handshake).await,
            ClientStep::Upgrade(upgrade) => {
                let Some(initiator) = initiator.as_deref_mut() else {
                    conn.abort();
                    return Err(anyhow!("upgrade {upgrade:?} requested without an initiator").into());
                };
                let timeout = match helper.remaining_or_timeout() {
                    Ok(timeout) => timeout,
                    Err(e) => {
                        conn.abort();
                        return Err(e.into());
                    }
                };
                let id = conn.connection_id();
                tracing::debug!(connection_id = %id, upgrade = %upgrade, "initiating stream upgrade");
                let raw = AsyncPreReadConnection::wrap(conn, &buffer.take_remaining());
                // A failed upgrade consumes the connection; the provider has already closed it.
                match initiator.initiate_upgrade(raw, timeout).await {
                    Ok(upgraded) => conn = upgraded,
                    Err(e) => {
                        let e = helper.classify_error(e);
                        tracing::debug!(connection_id = %id, error = %e, "client stream upgrade failed");
                        return Err(e);
                    }
                }
                handshake.on_upgraded()
            }
            ClientStep::Done => break,
        };
        if let Err(e) = result {
            tracing::debug!(connection_id = %conn.connection_id(), error = %e, "client handshake failed");
            conn.abort();
            return Err(e);
        }
    }

    let remote_security = initiator.and_then(|i| i.remote_security().cloned());
    let (decoder, upgrades) = handshake.into_parts();
    let reader = EnvelopeReader::new(
        decoder,
        settings.max_message_size,
        options.via.as_str(),
        options.content_type.as_str(),
    );
    tracing::debug!(connection_id = %conn.connection_id(), upgrades = upgrades.len(), "client handshake complete");
    Ok(ClientSession::new(
        conn,
        options.mode,
        upgrades,
        remote_security,
        reader,
        buffer,
    ))
}

/// Run the server handshake over `conn`: mode, preamble, upgrades and the ack.
pub async fn accept(
    conn: Box<dyn AsyncConnection>,
    settings: &FramingSettings,
    endpoint: &Endpoint,
    mut acceptor: Option<&mut dyn AsyncUpgradeAcceptor>,
) -> Result<ServerSession<dyn AsyncConnection>> {
    let helper = TimeoutHelper::new(settings.open_timeout);
    let mut buffer = ReadBuffer::new(settings.connection_buffer_size);
    let mut conn = conn;
    let (mode, position) = read_mode(conn.as_mut(), &mut buffer, settings, &helper).await?;
    let mut handshake = ServerHandshake::new(mode, position, settings, endpoint);

    loop {
        let result = match handshake.next_step() {
            ServerStep::Read => feed(conn.as_mut(), &mut buffer, &helper, &mut handshake).await,
            ServerStep::Validate(via) => {
                let validation = if conn.validate(&via).await {
                    endpoint.validate_via(&via)
                } else {
                    ViaValidation::Rejected
                };
                handshake.on_validated(validation)
            }
            ServerStep::CheckUpgrade(upgrade) => {
                let accepted = acceptor
                    .as_deref()
                    .is_some_and(|a| a.can_upgrade(&upgrade));
                handshake.on_upgrade_checked(accepted)
            }
            ServerStep::Write(bytes) => write_all(conn.as_mut(), &bytes, &helper).await,
            ServerStep::Upgrade(upgrade) => {
                let Some(acceptor) = acceptor.as_deref_mut() else {
                    conn.abort();
                    return Err(anyhow!("upgrade {upgrade:?} accepted without an acceptor").into());
                };
                let timeout = match helper.remaining_or_timeout() {
                    Ok(timeout) => timeout,
                    Err(e) => {
                        conn.abort();
                        return Err(e.into());
                    }
                };
                let id = conn.connection_id();
                tracing::debug!(connection_id = %id, upgrade = %upgrade, "accepting stream upgrade");
                let raw = AsyncPreReadConnection::wrap(conn, &buffer.take_remaining());
                // A failed upgrade consumes the connection; the provider has already closed it.
                match acceptor.accept_upgrade(raw, timeout).await {
                    Ok(upgraded) => conn = upgraded,
                    Err(e) => {
                        let e = helper.classify_error(e);
                        tracing::debug!(connection_id = %id, error = %e, "server stream upgrade failed");
                        return Err(e);
                    }
                }
                handshake.on_upgraded()
            }
            ServerStep::Done => break,
        };
        if let Err(e) = result {
            fail(conn.as_mut(), &e, settings.max_drain_size, &helper).await;
            return Err(e);
        }
    }

    let remote_security = acceptor.and_then(|a| a.remote_security().cloned());
    let via = handshake.via().to_string();
    let content_type = handshake.content_type().to_string();
    let (decoder, upgrades) = handshake.into_parts();
    tracing::debug!(connection_id = %conn.connection_id(), via = %via, ?mode, "server handshake complete");
    let reader = EnvelopeReader::new(decoder, settings.max_message_size, via, content_type);
    Ok(ServerSession::new(
        conn,
        mode,
        upgrades,
        remote_security,
        reader,
        buffer,
        settings.max_message_size,
        settings.max_drain_size,
    ))
}
