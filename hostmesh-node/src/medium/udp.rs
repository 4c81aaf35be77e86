//! LAN pub/sub over one IPv4 multicast group. Each datagram carries its channel name in
//! front of the payload; receivers filter on their subscriptions.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{MediumMessage, PubSubMedium};
use crate::error::MediumError;

/// Largest UDP payload over IPv4.
const MAX_DATAGRAM: usize = 65_507;
/// Longest channel name carried in the envelope.
const MAX_CHANNEL_LEN: usize = 64;

struct Open {
    socket: Arc<UdpSocket>,
    receiver: JoinHandle<()>,
}

pub struct UdpMulticastMedium {
    group: SocketAddrV4,
    channels: Arc<RwLock<HashSet<String>>>,
    open: Mutex<Option<Open>>,
}

impl UdpMulticastMedium {
    pub fn new(group: SocketAddrV4) -> Self {
        Self {
            group,
            channels: Arc::default(),
            open: Mutex::new(None),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, MediumError> {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|o| o.socket.clone())
            .ok_or(MediumError::NotConnected)
    }
}

fn make_multicast_socket(group: SocketAddrV4) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, group.port()))?;
    std_sock.join_multicast_v4(group.ip(), &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_multicast_loop_v4(true)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

fn encode_envelope(channel: &str, payload: &[u8]) -> Result<Bytes, MediumError> {
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(MediumError::Rejected(format!(
            "channel name of {} bytes exceeds {MAX_CHANNEL_LEN}",
            channel.len()
        )));
    }
    if 2 + channel.len() + payload.len() > MAX_DATAGRAM {
        return Err(MediumError::Rejected(format!(
            "{} byte payload does not fit one datagram",
            payload.len()
        )));
    }
    let len = channel.len() as u16;
    let mut out = BytesMut::with_capacity(2 + channel.len() + payload.len());
    out.put_u16_le(len);
    out.put_slice(channel.as_bytes());
    out.put_slice(payload);
    Ok(out.freeze())
}

fn decode_envelope(mut datagram: Bytes) -> Option<MediumMessage> {
    if datagram.len() < 2 {
        return None;
    }
    let len = usize::from(datagram.get_u16_le());
    if datagram.len() < len {
        return None;
    }
    let channel = String::from_utf8(datagram.split_to(len).to_vec()).ok()?;
    Some(MediumMessage {
        channel,
        payload: datagram,
    })
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    channels: Arc<RwLock<HashSet<String>>>,
    inbox: mpsc::UnboundedSender<MediumMessage>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "multicast receive failed");
                return;
            }
        };
        let Some(msg) = decode_envelope(Bytes::copy_from_slice(&buf[..n])) else {
            debug!(%from, "dropping malformed multicast datagram");
            continue;
        };
        let wanted = channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&msg.channel);
        if wanted && inbox.send(msg).is_err() {
            return;
        }
    }
}

#[async_trait]
impl PubSubMedium for UdpMulticastMedium {
    async fn open(&self) -> Result<mpsc::UnboundedReceiver<MediumMessage>, MediumError> {
        self.close().await;
        let socket = Arc::new(make_multicast_socket(self.group).map_err(|e| MediumError::from_io(&e))?);
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        let receiver = tokio::spawn(receive_loop(socket.clone(), self.channels.clone(), tx));
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = Some(Open { socket, receiver });
        debug!(group = %self.group, "joined multicast group");
        Ok(rx)
    }

    async fn close(&self) {
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(open) = open {
            open.receiver.abort();
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<(), MediumError> {
        self.socket()?;
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), MediumError> {
        self.socket()?;
        self.channels
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(channel);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<(), MediumError> {
        let datagram = encode_envelope(channel, &payload)?;
        let socket = self.socket()?;
        socket
            .send_to(&datagram, SocketAddr::V4(self.group))
            .await
            .map_err(|e| MediumError::from_io(&e))?;
        Ok(())
    }

    fn max_payload(&self) -> Option<usize> {
        Some(MAX_DATAGRAM - 2 - MAX_CHANNEL_LEN)
    }
}

impl Drop for UdpMulticastMedium {
    fn drop(&mut self) {
        if let Some(open) = self.open.lock().unwrap_or_else(PoisonError::into_inner).take() {
            open.receiver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_channel_and_payload() {
        let env = encode_envelope("hostmesh.presence", b"v1:Hello").unwrap();
        let msg = decode_envelope(env).unwrap();
        assert_eq!(msg.channel, "hostmesh.presence");
        assert_eq!(&msg.payload[..], b"v1:Hello");
    }

    #[test]
    fn truncated_envelope_rejected() {
        assert!(decode_envelope(Bytes::from_static(&[5])).is_none());
        assert!(decode_envelope(Bytes::from_static(&[5, 0, b'a'])).is_none());
    }

    #[tokio::test]
    async fn oversized_channel_is_refused_not_fatal() {
        let m = UdpMulticastMedium::new(SocketAddrV4::new(Ipv4Addr::new(239, 255, 60, 61), 45690));
        let err = m.publish(&"c".repeat(300), Bytes::new()).await.unwrap_err();
        assert!(matches!(err, MediumError::Rejected(_)));
        assert!(!err.is_fatal());
        let err = encode_envelope("c", &vec![0u8; MAX_DATAGRAM]).unwrap_err();
        assert!(matches!(err, MediumError::Rejected(_)));
    }

    #[tokio::test]
    async fn operations_require_open() {
        let m = UdpMulticastMedium::new(SocketAddrV4::new(Ipv4Addr::new(239, 255, 60, 61), 45690));
        assert_eq!(m.subscribe("x").await, Err(MediumError::NotConnected));
        assert_eq!(
            m.publish("x", Bytes::new()).await,
            Err(MediumError::NotConnected)
        );
    }
}
