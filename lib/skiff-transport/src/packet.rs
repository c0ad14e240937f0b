use std::collections::VecDeque;

use skiff_format::{numbers, Reader};
use tracing::{debug, trace};

use crate::crypto::Tunnel;
use crate::{disconnect_error, peer_error, Result, SshRng};

/*
packet terminology used throughout this crate:

length | padding_length | payload | random padding | MAC

-------------------------------------------------------- "full"
--------------------------------------------------       "frame", covered by the MAC and the cipher
                          -------                        "payload"
*/

/// Block size before any keys are active.
pub const PLAINTEXT_BLOCK_SIZE: usize = 8;
/// Upper bound for `packet_length + 4`.
pub const MAX_PACKET_SIZE: usize = 256 * 1024;
const MIN_PADDING: usize = 4;

/// Version lines are at most 255 bytes including the line ending.
/// <https://datatracker.ietf.org/doc/html/rfc4253#section-4.2>
const MAX_IDENT_LINE: usize = 255;
/// How many bytes of lines before the identification we accept.
const MAX_IDENT_PREAMBLE: usize = 16 * 1024;

/// Bytes ready to be written to the peer.
#[derive(Debug)]
pub struct Msg(pub(crate) MsgKind);

#[derive(Debug, PartialEq)]
pub(crate) enum MsgKind {
    ProtocolIdent(Vec<u8>),
    Packet(Vec<u8>),
}

impl Msg {
    pub fn to_bytes(self) -> Vec<u8> {
        match self.0 {
            MsgKind::ProtocolIdent(v) | MsgKind::Packet(v) => v,
        }
    }
}

/// A plaintext SSH packet payload.
#[derive(Debug, PartialEq)]
pub struct Packet {
    pub payload: Vec<u8>,
}

impl Packet {
    /// # Panics
    /// If the payload is empty, which [`PacketTransport`] never produces.
    pub fn packet_type(&self) -> u8 {
        self.payload[0]
    }

    pub fn payload_parser(&self) -> Reader<'_> {
        Reader::new(&self.payload)
    }
}

/// The number of padding bytes for a payload, so that
/// `(payload_len + padding_len + 5) % block_size == 0` with at least four bytes of padding.
/// <https://datatracker.ietf.org/doc/html/rfc4253#section-6>
pub fn padding_len(payload_len: usize, block_size: usize) -> usize {
    let unpadded = payload_len + 5;
    let padding = unpadded.next_multiple_of(block_size) - unpadded;
    if padding < MIN_PADDING {
        padding + block_size
    } else {
        padding
    }
}

/// The first block of a packet that has already been decrypted while we wait for the rest.
struct PartialPacket {
    frame: Vec<u8>,
    packet_length: usize,
}

/// Frames the byte stream into packets, in both directions.
pub(crate) struct PacketTransport {
    recv_buf: Vec<u8>,
    partial: Option<PartialPacket>,
    incoming: Option<Tunnel>,
    recv_next_seq_nr: u32,
    recv_bytes: u64,

    outgoing: Option<Tunnel>,
    msgs_to_send: VecDeque<Msg>,
    send_next_seq_nr: u32,
    sent_bytes: u64,
}

impl PacketTransport {
    pub(crate) fn new() -> Self {
        Self {
            recv_buf: Vec::new(),
            partial: None,
            incoming: None,
            recv_next_seq_nr: 0,
            recv_bytes: 0,

            outgoing: None,
            msgs_to_send: VecDeque::new(),
            send_next_seq_nr: 0,
            sent_bytes: 0,
        }
    }

    /// Buffers bytes, they are parsed by [`Self::recv_next_packet`].
    pub(crate) fn recv_bytes(&mut self, bytes: &[u8]) {
        self.recv_buf.extend_from_slice(bytes);
    }

    fn recv_block_size(&self) -> usize {
        self.incoming
            .as_ref()
            .map_or(PLAINTEXT_BLOCK_SIZE, |tunnel| tunnel.block_size.max(PLAINTEXT_BLOCK_SIZE))
    }

    /// Parses one packet with the keys active right now.
    /// Packets are parsed one at a time so that a key change after NEWKEYS applies to the very next packet.
    pub(crate) fn recv_next_packet(&mut self) -> Result<Option<(u32, Packet)>> {
        let block_size = self.recv_block_size();

        let partial = match self.partial.take() {
            Some(partial) => partial,
            None => {
                if self.recv_buf.len() < block_size {
                    return Ok(None);
                }
                let mut first_block = self.recv_buf.drain(..block_size).collect::<Vec<u8>>();
                if let Some(tunnel) = &mut self.incoming {
                    tunnel.cipher.apply(&mut first_block);
                }
                let packet_length =
                    u32::from_be_bytes([first_block[0], first_block[1], first_block[2], first_block[3]])
                        as usize;

                let full_len = packet_length + 4;
                if full_len > MAX_PACKET_SIZE {
                    return Err(peer_error!("packet too large: {packet_length}"));
                }
                if full_len < block_size || full_len % block_size != 0 {
                    return Err(peer_error!(
                        "packet length {packet_length} is not a multiple of the block size {block_size}"
                    ));
                }

                PartialPacket {
                    frame: first_block,
                    packet_length,
                }
            }
        };

        let remaining = partial.packet_length + 4 - partial.frame.len();
        let mac_len = self.incoming.as_ref().map_or(0, |tunnel| tunnel.mac_len);
        if self.recv_buf.len() < remaining + mac_len {
            self.partial = Some(partial);
            return Ok(None);
        }

        let PartialPacket {
            mut frame,
            packet_length,
        } = partial;
        let mut rest = self.recv_buf.drain(..remaining).collect::<Vec<u8>>();
        let seq_nr = self.recv_next_seq_nr;

        if let Some(tunnel) = &mut self.incoming {
            tunnel.cipher.apply(&mut rest);
            frame.extend_from_slice(&rest);
            let mac = self.recv_buf.drain(..mac_len).collect::<Vec<u8>>();
            if !tunnel.integrity.verify(seq_nr, &frame, &mac) {
                return Err(disconnect_error!(
                    numbers::SSH_DISCONNECT_MAC_ERROR,
                    "invalid MAC on packet {seq_nr}"
                ));
            }
        } else {
            frame.extend_from_slice(&rest);
        }

        self.recv_next_seq_nr = self.recv_next_seq_nr.wrapping_add(1);
        self.recv_bytes += (frame.len() + mac_len) as u64;

        let padding_length = frame[4] as usize;
        if padding_length < MIN_PADDING {
            return Err(peer_error!("packet padding too short: {padding_length}"));
        }
        let Some(payload_len) = (packet_length - 1).checked_sub(padding_length) else {
            return Err(peer_error!("packet padding longer than packet"));
        };
        if payload_len == 0 {
            return Err(peer_error!("empty packet"));
        }
        // Compression is always `none`, the payload is used as is.
        let payload = frame[5..][..payload_len].to_vec();

        trace!(
            packet_type = payload[0],
            packet_type_string = numbers::packet_type_to_string(payload[0]),
            packet_len = payload_len,
            "Received packet"
        );

        Ok(Some((seq_nr, Packet { payload })))
    }

    /// Frames, encrypts and queues a packet with the keys active right now.
    pub(crate) fn queue_packet(&mut self, payload: Vec<u8>, rng: &mut dyn SshRng) {
        let packet_type = payload.first().copied().unwrap_or_default();
        trace!(
            %packet_type,
            packet_type_string = numbers::packet_type_to_string(packet_type),
            packet_len = payload.len(),
            "Sending packet"
        );

        let block_size = self
            .outgoing
            .as_ref()
            .map_or(PLAINTEXT_BLOCK_SIZE, |tunnel| tunnel.block_size.max(PLAINTEXT_BLOCK_SIZE));
        let padding_len = padding_len(payload.len(), block_size);
        let packet_length = payload.len() + padding_len + 1;

        let mut frame = Vec::with_capacity(packet_length + 4 + 64);
        frame.extend_from_slice(&(packet_length as u32).to_be_bytes());
        frame.push(padding_len as u8);
        frame.extend_from_slice(&payload);
        let padding_start = frame.len();
        frame.resize(padding_start + padding_len, 0);
        rng.fill_bytes(&mut frame[padding_start..]);

        let seq_nr = self.send_next_seq_nr;
        self.send_next_seq_nr = self.send_next_seq_nr.wrapping_add(1);

        if let Some(tunnel) = &mut self.outgoing {
            let mac = tunnel.integrity.compute(seq_nr, &frame);
            tunnel.cipher.apply(&mut frame);
            frame.extend_from_slice(&mac);
        }

        self.sent_bytes += frame.len() as u64;
        self.msgs_to_send.push_back(Msg(MsgKind::Packet(frame)));
    }

    pub(crate) fn queue_send_protocol_info(&mut self, identification: Vec<u8>) {
        self.msgs_to_send
            .push_back(Msg(MsgKind::ProtocolIdent(identification)));
    }

    pub(crate) fn next_msg_to_send(&mut self) -> Option<Msg> {
        self.msgs_to_send.pop_front()
    }

    pub(crate) fn next_send_sequence_number(&self) -> u32 {
        self.send_next_seq_nr
    }

    pub(crate) fn set_outgoing(&mut self, tunnel: Tunnel) {
        self.outgoing = Some(tunnel);
    }

    pub(crate) fn set_incoming(&mut self, tunnel: Tunnel) {
        self.incoming = Some(tunnel);
    }

    /// Bytes received and sent since the last call to [`Self::reset_byte_counters`].
    pub(crate) fn bytes_transferred(&self) -> u64 {
        self.recv_bytes + self.sent_bytes
    }

    pub(crate) fn reset_byte_counters(&mut self) {
        self.recv_bytes = 0;
        self.sent_bytes = 0;
    }
}

/// Reads the peer's identification line.
/// Lines before it that do not start with `SSH-` are skipped.
/// <https://datatracker.ietf.org/doc/html/rfc4253#section-4.2>
pub(crate) struct ProtocolIdentParser {
    buf: Vec<u8>,
    preamble_len: usize,
}

impl ProtocolIdentParser {
    pub(crate) fn new() -> Self {
        Self {
            buf: Vec::new(),
            preamble_len: 0,
        }
    }

    /// Returns the identification without its line ending, and the bytes after it.
    pub(crate) fn recv_bytes(&mut self, bytes: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.buf.extend_from_slice(bytes);

        loop {
            let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
                if self.buf.len() > MAX_IDENT_LINE {
                    return Err(peer_error!("identification line too long"));
                }
                return Ok(None);
            };

            let rest = self.buf.split_off(newline + 1);
            let mut line = std::mem::replace(&mut self.buf, rest);
            if line.len() > MAX_IDENT_LINE {
                return Err(peer_error!("identification line too long"));
            }
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }

            if line.starts_with(b"SSH-") {
                let ident_string = String::from_utf8_lossy(&line);
                if !line.starts_with(b"SSH-2.0-") {
                    return Err(disconnect_error!(
                        numbers::SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED,
                        "unsupported protocol version: {ident_string:?}"
                    ));
                }
                if line.iter().any(|b| !b.is_ascii() || b.is_ascii_control()) {
                    return Err(peer_error!("identification contains invalid characters"));
                }
                debug!(identification = %ident_string, "Peer identifier");
                return Ok(Some((line, std::mem::take(&mut self.buf))));
            }

            self.preamble_len += line.len();
            if self.preamble_len > MAX_IDENT_PREAMBLE {
                return Err(peer_error!("too many lines before the identification"));
            }
            trace!(line = %String::from_utf8_lossy(&line), "Skipping line before identification");
        }
    }
}

#[cfg(test)]
mod tests {
    use skiff_format::numbers;

    use super::{padding_len, MsgKind, PacketTransport, ProtocolIdentParser};
    use crate::testing::TestRng;

    #[test]
    fn padding_fills_block() {
        for block_size in [8, 16] {
            for payload_len in 0..200 {
                let padding = padding_len(payload_len, block_size);
                assert_eq!((payload_len + padding + 5) % block_size, 0);
                assert!((4..=255).contains(&padding), "{padding}");
            }
        }
        // 5 + 3 = 8 leaves no room for padding, so a whole block is added.
        assert_eq!(padding_len(3, 8), 8);
        assert_eq!(padding_len(2, 8), 9);
    }

    #[test]
    fn plaintext_packet_roundtrip() {
        let mut rng = TestRng::new(7);
        let mut sender = PacketTransport::new();
        sender.queue_packet(vec![numbers::SSH_MSG_IGNORE, 1, 2, 3], &mut rng);
        sender.queue_packet(vec![numbers::SSH_MSG_DEBUG], &mut rng);

        let mut receiver = PacketTransport::new();
        while let Some(msg) = sender.next_msg_to_send() {
            assert!(matches!(msg.0, MsgKind::Packet(_)));
            let bytes = msg.to_bytes();
            assert_eq!(bytes.len() % 8, 0);
            // Feed byte by byte to exercise partial packets.
            for byte in bytes {
                receiver.recv_bytes(&[byte]);
            }
        }

        let (seq, packet) = receiver.recv_next_packet().unwrap().unwrap();
        assert_eq!(seq, 0);
        assert_eq!(packet.payload, [numbers::SSH_MSG_IGNORE, 1, 2, 3]);
        let (seq, packet) = receiver.recv_next_packet().unwrap().unwrap();
        assert_eq!(seq, 1);
        assert_eq!(packet.packet_type(), numbers::SSH_MSG_DEBUG);
        assert!(receiver.recv_next_packet().unwrap().is_none());
        assert_eq!(receiver.bytes_transferred(), sender.bytes_transferred());
    }

    #[test]
    fn incomplete_packet_waits() {
        let mut receiver = PacketTransport::new();
        receiver.recv_bytes(&[0, 0, 0, 12, 4, 2]);
        assert!(receiver.recv_next_packet().unwrap().is_none());
        receiver.recv_bytes(&[0; 5]);
        assert!(receiver.recv_next_packet().unwrap().is_none());
        receiver.recv_bytes(&[0; 5]);
        let (_, packet) = receiver.recv_next_packet().unwrap().unwrap();
        assert_eq!(packet.payload, [2, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn invalid_lengths_rejected() {
        // Not a multiple of the block size.
        let mut receiver = PacketTransport::new();
        receiver.recv_bytes(&[0, 0, 0, 13, 4, 2, 0, 0]);
        assert!(receiver.recv_next_packet().is_err());

        // Way too large.
        let mut receiver = PacketTransport::new();
        receiver.recv_bytes(&[0x10, 0, 0, 4, 4, 2, 0, 0]);
        assert!(receiver.recv_next_packet().is_err());

        // Padding shorter than four bytes.
        let mut receiver = PacketTransport::new();
        receiver.recv_bytes(&[0, 0, 0, 4, 3, 2, 0, 0]);
        assert!(receiver.recv_next_packet().is_err());

        // Padding longer than the packet.
        let mut receiver = PacketTransport::new();
        receiver.recv_bytes(&[0, 0, 0, 4, 8, 2, 0, 0]);
        assert!(receiver.recv_next_packet().is_err());
    }

    #[test]
    fn ident_with_crlf() {
        let mut p = ProtocolIdentParser::new();
        assert!(p.recv_bytes(b"SSH-2.0-OpenSSH_9.7").unwrap().is_none());
        let (ident, rest) = p.recv_bytes(b"\r\n\0\0").unwrap().unwrap();
        assert_eq!(ident, b"SSH-2.0-OpenSSH_9.7");
        assert_eq!(rest, [0, 0]);
    }

    #[test]
    fn ident_with_lf_and_preamble() {
        let mut p = ProtocolIdentParser::new();
        let (ident, rest) = p
            .recv_bytes(b"hello there\r\nwelcome\nSSH-2.0-PuTTY\n")
            .unwrap()
            .unwrap();
        assert_eq!(ident, b"SSH-2.0-PuTTY");
        assert!(rest.is_empty());
    }

    #[test]
    fn ssh_prefixed_preamble_is_the_identification() {
        let mut p = ProtocolIdentParser::new();
        assert!(p
            .recv_bytes(b"SSH-banner-ish line\nSSH-2.0-PuTTY\n")
            .is_err());
    }

    #[test]
    fn old_protocol_versions_rejected() {
        for ident in [&b"SSH-1.5-old\r\n"[..], b"SSH-1.99-compat\r\n"] {
            let err = ProtocolIdentParser::new().recv_bytes(ident).unwrap_err();
            assert_eq!(
                err.disconnect_reason(),
                Some(numbers::SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED)
            );
        }
    }

    #[test]
    fn endless_line_rejected() {
        let mut p = ProtocolIdentParser::new();
        assert!(p.recv_bytes(&[b'a'; 300]).is_err());
    }
}
