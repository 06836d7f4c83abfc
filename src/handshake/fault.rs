//! Sending faults to the peer and mapping received ones to errors.

use crate::connection::{AsyncConnection, Connection, TimeoutHelper};
use crate::error::{Error, NegotiatedFault};
use crate::framing::{encode_fault, FaultKind};

const DRAIN_CHUNK: usize = 1024;

/// Error for a fault string received from the peer.
pub fn fault_error(fault: &str, via: &str, content_type: &str) -> Error {
    NegotiatedFault {
        kind: FaultKind::from_fault_string(fault),
        fault: fault.to_string(),
        via: via.to_string(),
        content_type: content_type.to_string(),
    }
    .into()
}

/// Write `kind` to the peer, half-close, and discard its input until it closes or
/// `max_drain` bytes have been read. Best effort; the connection is aborted afterwards.
pub(crate) fn send_fault<C: Connection + ?Sized>(
    conn: &mut C,
    kind: FaultKind,
    max_drain: usize,
    helper: &TimeoutHelper,
) {
    tracing::warn!(connection_id = %conn.connection_id(), fault = %kind, "sending fault");
    let frame = encode_fault(&kind.fault_string());
    let sent = helper
        .remaining_or_timeout()
        .and_then(|t| conn.write(&frame, true, t))
        .and_then(|_| helper.remaining_or_timeout())
        .and_then(|t| conn.shutdown(t));
    if sent.is_ok() {
        let mut scratch = [0u8; DRAIN_CHUNK];
        let mut drained = 0;
        while drained < max_drain {
            let Ok(timeout) = helper.remaining_or_timeout() else {
                break;
            };
            let want = (max_drain - drained).min(DRAIN_CHUNK);
            match conn.read(&mut scratch[..want], timeout) {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
        tracing::trace!(drained, "drained peer after fault");
    }
    conn.abort();
}

pub(crate) async fn send_fault_async<C: AsyncConnection + ?Sized>(
    conn: &mut C,
    kind: FaultKind,
    max_drain: usize,
    helper: &TimeoutHelper,
) {
    tracing::warn!(connection_id = %conn.connection_id(), fault = %kind, "sending fault");
    let frame = encode_fault(&kind.fault_string());
    let sent = async {
        conn.write(&frame, true, helper.remaining_or_timeout()?).await?;
        conn.shutdown(helper.remaining_or_timeout()?).await
    }
    .await;
    if sent.is_ok() {
        let mut scratch = [0u8; DRAIN_CHUNK];
        let mut drained = 0;
        while drained < max_drain {
            let Ok(timeout) = helper.remaining_or_timeout() else {
                break;
            };
            let want = (max_drain - drained).min(DRAIN_CHUNK);
            match conn.read(&mut scratch[..want], timeout).await {
                Ok(0) | Err(_) => break,
                Ok(n) => drained += n,
            }
        }
        tracing::trace!(drained, "drained peer after fault");
    }
    conn.abort();
}
