//! MQTT 3.1.1 packet encoder.

use bytes::{BufMut, BytesMut};

use super::{variable_int_len, write_binary, write_string, write_variable_int};
use crate::protocol::{EncodeError, Packet};

/// Encodes MQTT 3.1.1 packets onto the wire.
///
/// `encode_publish` additionally reports the byte offset of the packet
/// identifier field (when present) within the buffer it wrote to, so a
/// caller holding the serialized bytes for retry can rewrite the identifier
/// in place without re-serializing the whole packet.
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder {
    _private: (),
}

impl Encoder {
    pub fn new() -> Self {
        Self { _private: () }
    }

    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(connect) => self.encode_connect(connect, buf),
            Packet::ConnAck(connack) => self.encode_connack(connack, buf),
            Packet::Publish(publish) => self.encode_publish(publish, buf).map(|_| ()),
            Packet::PubAck(puback) => self.encode_puback(puback, buf),
            Packet::Subscribe(subscribe) => self.encode_subscribe(subscribe, buf),
            Packet::SubAck(suback) => self.encode_suback(suback, buf),
            Packet::Unsubscribe(unsubscribe) => self.encode_unsubscribe(unsubscribe, buf),
            Packet::UnsubAck(unsuback) => self.encode_unsuback(unsuback, buf),
            Packet::PingReq => self.encode_header_only(12, buf),
            Packet::PingResp => self.encode_header_only(13, buf),
            Packet::Disconnect => self.encode_header_only(14, buf),
        }
    }

    fn encode_header_only(&self, packet_type: u8, buf: &mut BytesMut) -> Result<(), EncodeError> {
        buf.put_u8(packet_type << 4);
        write_variable_int(buf, 0)?;
        Ok(())
    }

    fn encode_connect(
        &self,
        connect: &crate::protocol::Connect,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        write_string(&mut body, "MQTT")?;
        body.put_u8(4); // protocol level, MQTT 3.1.1

        let mut flags = 0u8;
        if connect.clean_session {
            flags |= 0x02;
        }
        if let Some(will) = &connect.will {
            flags |= 0x04;
            flags |= (will.qos as u8) << 3;
            if will.retain {
                flags |= 0x20;
            }
        }
        if connect.password.is_some() {
            flags |= 0x40;
        }
        if connect.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(connect.keep_alive);

        write_string(&mut body, &connect.client_id)?;

        if let Some(will) = &connect.will {
            write_string(&mut body, &will.topic)?;
            write_binary(&mut body, &will.payload)?;
        }
        if let Some(username) = &connect.username {
            write_string(&mut body, username)?;
        }
        if let Some(password) = &connect.password {
            write_binary(&mut body, password)?;
        }

        buf.put_u8(1 << 4);
        write_variable_int(buf, body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn encode_connack(
        &self,
        connack: &crate::protocol::ConnAck,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(2 << 4);
        write_variable_int(buf, 2)?;
        buf.put_u8(if connack.session_present { 0x01 } else { 0x00 });
        buf.put_u8(connack.return_code as u8);
        Ok(())
    }

    /// Encode a PUBLISH packet. Returns the offset of the two packet-id
    /// bytes within `buf` (measured from the start of this call's output),
    /// or `None` for QoS 0 where no packet identifier is present.
    pub fn encode_publish(
        &self,
        publish: &crate::protocol::Publish,
        buf: &mut BytesMut,
    ) -> Result<Option<usize>, EncodeError> {
        use crate::protocol::QoS;

        let header_start = buf.len();

        let mut flags = 0u8;
        if publish.dup {
            flags |= 0x08;
        }
        flags |= (publish.qos as u8) << 1;
        if publish.retain {
            flags |= 0x01;
        }

        let mut body = BytesMut::new();
        write_string(&mut body, &publish.topic)?;

        let packet_id_offset_in_body = if publish.qos != QoS::AtMostOnce {
            let offset = body.len();
            let packet_id = publish.packet_id.ok_or(EncodeError::BufferTooSmall)?;
            body.put_u16(packet_id);
            Some(offset)
        } else {
            None
        };

        body.extend_from_slice(&publish.payload);

        buf.put_u8((3 << 4) | flags);
        write_variable_int(buf, body.len() as u32)?;
        let remaining_len_size = variable_int_len(body.len() as u32);
        buf.extend_from_slice(&body);

        Ok(packet_id_offset_in_body.map(|o| header_start + 1 + remaining_len_size + o))
    }

    fn encode_puback(
        &self,
        puback: &crate::protocol::PubAck,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(4 << 4);
        write_variable_int(buf, 2)?;
        buf.put_u16(puback.packet_id);
        Ok(())
    }

    fn encode_subscribe(
        &self,
        subscribe: &crate::protocol::Subscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        body.put_u16(subscribe.packet_id);
        for filter in &subscribe.filters {
            write_string(&mut body, &filter.filter)?;
            body.put_u8(filter.qos as u8);
        }

        buf.put_u8((8 << 4) | 0x02);
        write_variable_int(buf, body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn encode_suback(
        &self,
        suback: &crate::protocol::SubAck,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        body.put_u16(suback.packet_id);
        for code in &suback.return_codes {
            body.put_u8(code.to_u8());
        }

        buf.put_u8(9 << 4);
        write_variable_int(buf, body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn encode_unsubscribe(
        &self,
        unsubscribe: &crate::protocol::Unsubscribe,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        body.put_u16(unsubscribe.packet_id);
        for filter in &unsubscribe.filters {
            write_string(&mut body, filter)?;
        }

        buf.put_u8((10 << 4) | 0x02);
        write_variable_int(buf, body.len() as u32)?;
        buf.extend_from_slice(&body);
        Ok(())
    }

    fn encode_unsuback(
        &self,
        unsuback: &crate::protocol::UnsubAck,
        buf: &mut BytesMut,
    ) -> Result<(), EncodeError> {
        buf.put_u8(11 << 4);
        write_variable_int(buf, 2)?;
        buf.put_u16(unsuback.packet_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoder;
    use crate::protocol::{Publish, QoS};
    use std::sync::Arc;

    #[test]
    fn publish_qos1_reports_packet_id_offset() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Arc::from("sensors/1/temp"),
            packet_id: Some(0x1234),
            payload: bytes::Bytes::from_static(b"21.5"),
        };

        let mut buf = BytesMut::new();
        let offset = Encoder::new().encode_publish(&publish, &mut buf).unwrap().unwrap();
        assert_eq!(u16::from_be_bytes([buf[offset], buf[offset + 1]]), 0x1234);

        // rewrite in place and confirm it decodes with the new id
        buf[offset] = 0x43;
        buf[offset + 1] = 0x21;
        let mut decoder = Decoder::new();
        let (packet, _) = decoder.decode(&buf).unwrap().unwrap();
        match packet {
            crate::protocol::Packet::Publish(p) => assert_eq!(p.packet_id, Some(0x4321)),
            _ => panic!("expected Publish"),
        }
    }

    #[test]
    fn publish_qos0_has_no_packet_id_offset() {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from("sensors/1/temp"),
            packet_id: None,
            payload: bytes::Bytes::from_static(b"21.5"),
        };
        let mut buf = BytesMut::new();
        let offset = Encoder::new().encode_publish(&publish, &mut buf).unwrap();
        assert_eq!(offset, None);
    }
}
