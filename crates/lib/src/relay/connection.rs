//! Per-connection pump: a writer task drains the peer's outbox into the socket,
//! the reader loop decodes frames and forwards them to the channel actor.

use crate::protocol;
use crate::relay::channel::{ChannelHandle, ConnectionId, Outbound, Peer, Role};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};

/// Serve one upgraded socket on `channel` until either side closes it.
pub async fn serve_connection(socket: WebSocket, channel: ChannelHandle, role: Role, queue: usize) {
    let id = ConnectionId::new();
    let (mut sink, mut stream) = socket.split();
    let (peer, mut outbox) = Peer::new(queue);

    if !channel.join(id, role, peer.clone()).await {
        log::error!("channel {} is not running, dropping connection {}", channel.path(), id);
        return;
    }

    let mut writer = tokio::spawn(async move {
        loop {
            match outbox.next().await {
                Outbound::Text(text) => {
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut writer => break,
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(e) => {
                            log::warn!(
                                "binary frame is not utf-8, closing connection {} on {}: {}",
                                id,
                                channel.path(),
                                e
                            );
                            peer.close();
                            break;
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        log::info!(
                            "connection {} close, {}, code: {:?}",
                            id,
                            channel.path(),
                            frame.map(|f| f.code)
                        );
                        break;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("connection {} {} error: {}", id, channel.path(), e);
                        break;
                    }
                    None => break,
                };
                match protocol::decode(&text) {
                    Ok(envelope) => {
                        if !channel.frame(id, envelope, text).await {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "message handling failed, closing connection {} on {}: {} ({})",
                            id,
                            channel.path(),
                            e,
                            text
                        );
                        peer.close();
                        break;
                    }
                }
            }
        }
    }

    channel.leave(id).await;
    drop(peer);
}
