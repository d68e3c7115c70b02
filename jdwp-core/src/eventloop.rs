// JDWP receive and write loops
//
// The receive loop is the only reader of the connection. Replies are handed
// to the command that is waiting for them; composite event packets are
// decoded and each event is routed to the delivery loop of the request that
// produced it. The write loop is the only writer: commands queue encoded
// packets and it puts each one on the wire whole.

use std::sync::Weak;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::decode_exact;
use crate::commands::{command_sets, event_packet_commands};
use crate::events::EventSet;
use crate::protocol::{JdwpError, JdwpResult, Packet, HEADER_SIZE};
use crate::session::SessionInner;

/// An encoded packet queued for the write loop.
pub(crate) struct Outbound {
    pub(crate) bytes: Vec<u8>,
    /// Answered once the packet is flushed, or with the write error.
    pub(crate) written: oneshot::Sender<JdwpResult<()>>,
}

/// Main write loop task. A packet taken off the queue is written to the end
/// even if the command that queued it is no longer waiting. A write error
/// ends the session.
pub(crate) async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let packet = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = outbound.recv() => match next {
                Some(packet) => packet,
                None => break,
            },
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = write_packet(&mut writer, &packet.bytes) => result,
        };

        match result {
            Ok(()) => {
                let _ = packet.written.send(Ok(()));
            }
            Err(e) => {
                error!("Failed to write packet: {}", e);
                let _ = packet.written.send(Err(e));
                shutdown.cancel();
                break;
            }
        }
    }

    debug!("Write loop shutting down");
}

async fn write_packet<W>(writer: &mut W, bytes: &[u8]) -> JdwpResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one complete packet off the stream.
pub(crate) async fn read_packet<R>(reader: &mut R, max_packet_size: usize) -> JdwpResult<Packet>
where
    R: AsyncRead + Unpin,
{
    let frame = read_frame(reader, max_packet_size).await?;
    Packet::decode(&frame)
}

// Reads exactly one length-prefixed frame. An error here leaves the stream
// unsynchronized; a frame that later fails to decode does not.
async fn read_frame<R>(reader: &mut R, max_packet_size: usize) -> JdwpResult<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut header = BytesMut::zeroed(HEADER_SIZE);
    reader.read_exact(&mut header).await?;

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;

    if length < HEADER_SIZE {
        return Err(JdwpError::Protocol(format!(
            "Invalid packet length: {}",
            length
        )));
    }

    if length > max_packet_size {
        return Err(JdwpError::Protocol(format!(
            "Packet too large: {} bytes (max: {} bytes)",
            length, max_packet_size
        )));
    }

    let mut full_packet = header.to_vec();
    full_packet.resize(length, 0);
    reader.read_exact(&mut full_packet[HEADER_SIZE..]).await?;

    Ok(full_packet)
}

/// Main receive loop task. Ends on EOF, read error or cancellation; on the
/// way out every pending command is failed and every route dropped.
pub(crate) async fn receive_loop<R>(
    mut reader: R,
    session: Weak<SessionInner>,
    shutdown: CancellationToken,
    max_packet_size: usize,
) where
    R: AsyncRead + Unpin,
{
    info!("Receive loop started");

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Receive loop cancelled");
                break;
            }
            result = read_frame(&mut reader, max_packet_size) => match result {
                Ok(frame) => frame,
                Err(JdwpError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("Target closed the connection");
                    break;
                }
                Err(e) => {
                    error!("Failed to read packet: {}", e);
                    break;
                }
            }
        };

        let packet = match Packet::decode(&frame) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Dropping undecodable packet: {}", e);
                continue;
            }
        };

        let Some(inner) = session.upgrade() else {
            break;
        };
        dispatch(&inner, packet);
    }

    shutdown.cancel();
    if let Some(inner) = session.upgrade() {
        inner.close_tables();
    }

    info!("Receive loop shutting down");
}

fn dispatch(inner: &SessionInner, packet: Packet) {
    match packet {
        Packet::Reply(reply) => {
            let id = reply.id;
            debug!("Received reply id={}", id);
            if !inner.complete_reply(reply) {
                warn!("Received reply for unknown command id={}", id);
            }
        }
        Packet::Command(command)
            if command.command_set == command_sets::EVENT
                && command.command == event_packet_commands::COMPOSITE =>
        {
            debug!("Received event packet, len={}", command.data.len());

            let event_set: EventSet = match decode_exact(&command.data, inner.id_sizes()) {
                Ok(set) => set,
                Err(e) => {
                    warn!("Failed to decode composite event: {}", e);
                    return;
                }
            };

            debug!(
                "Parsed event set: {} events, suspend_policy={:?}",
                event_set.events.len(),
                event_set.suspend_policy
            );

            for event in event_set.events {
                let kind = event.kind();
                match inner.route_event(event) {
                    Ok(()) => {}
                    Err(JdwpError::UnknownSubscription(0)) => {
                        // Automatically generated by the target (e.g. VM start with suspend=y).
                        debug!("Dropping unrequested {:?} event", kind);
                    }
                    Err(e) => warn!("Dropping {:?} event: {}", kind, e),
                }
            }
        }
        Packet::Command(command) => {
            warn!(
                "Ignoring command packet ({}, {}) from target",
                command.command_set, command.command
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandPacket, ReplyPacket};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_packet_reads_reply() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let reply = ReplyPacket::new(5, 0, vec![1, 2, 3]);
        tx.write_all(&reply.encode()).await.unwrap();

        let packet = read_packet(&mut rx, 1024).await.unwrap();
        assert_eq!(packet, Packet::Reply(reply));
    }

    #[tokio::test]
    async fn test_read_packet_reads_split_writes() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let command = CommandPacket::new(9, 64, 100).with_data(vec![0; 20]);
        let bytes = command.encode();

        let writer = tokio::spawn(async move {
            for chunk in bytes.chunks(3) {
                tx.write_all(chunk).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let packet = read_packet(&mut rx, 1024).await.unwrap();
        writer.await.unwrap();
        assert_eq!(packet, Packet::Command(command));
    }

    #[tokio::test]
    async fn test_read_packet_rejects_oversized() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        tx.write_all(&[0, 0, 4, 0, 0, 0, 0, 1, 0x80, 0, 0]).await.unwrap();

        let err = read_packet(&mut rx, 512).await.unwrap_err();
        assert!(matches!(err, JdwpError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_packet_rejects_short_length() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        tx.write_all(&[0, 0, 0, 3, 0, 0, 0, 1, 0x80, 0, 0]).await.unwrap();

        assert!(read_packet(&mut rx, 512).await.is_err());
    }

    #[tokio::test]
    async fn test_eof_is_io_error() {
        let (tx, mut rx) = tokio::io::duplex(256);
        drop(tx);

        assert!(matches!(
            read_packet(&mut rx, 512).await,
            Err(JdwpError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_or_unrouted_events_are_dropped() {
        use crate::eventrequest::SuspendPolicy;
        use crate::events::EventResponse;
        use crate::testing::FakeTarget;
        use crate::types::ThreadId;

        let target = FakeTarget::builder().spawn();
        let session = target.attach().await.unwrap();

        // Truncated composite: policy and a count, but no events.
        target.inject(command_sets::EVENT, event_packet_commands::COMPOSITE, vec![2, 0, 0, 0, 1]);
        target.emit(
            SuspendPolicy::None,
            vec![EventResponse::ThreadStart {
                request_id: 77,
                thread: ThreadId(1),
            }],
        );
        target.inject(1, 99, Vec::new());

        // The loop is still reading: replies keep arriving.
        let err = session.get_all_threads().await.unwrap_err();
        assert_eq!(err.error_code(), Some(99));
        assert!(!session.is_closed());
        assert_eq!(session.route_count(), 0);
    }

    #[tokio::test]
    async fn test_reply_with_extra_flag_bits_reaches_caller() {
        use crate::commands::vm_commands;
        use crate::testing::FakeTarget;

        let target = FakeTarget::builder()
            .silent(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION)
            .spawn();
        let session = target.attach().await.unwrap();

        let pending = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .send_command_raw(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION, Vec::new())
                    .await
            })
        };
        target.wait_for_command(command_sets::VIRTUAL_MACHINE, vm_commands::VERSION).await;
        let id = target.commands().last().unwrap().id;

        let mut bytes = ReplyPacket::new(id, 0, vec![4, 2]).encode();
        bytes[8] |= 0x01;
        target.send_raw(bytes);

        let reply = pending.await.unwrap().unwrap();
        assert_eq!(reply.data(), &[4, 2]);
        assert!(!session.is_closed());
    }
}
