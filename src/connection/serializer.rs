//! Pluggable packet serialization.
//!
//! A connection's default codec is the crate's own [`Encoder`](crate::codec::Encoder).
//! A caller that needs a different wire format for one or more outgoing
//! packet types — interop with a broker-specific encoding extension, or a
//! test harness that wants to inject malformed bytes — can supply a
//! [`SerializerOverrides`] implementation covering just the packet types it
//! cares about; every method defaults to falling back to the built-in
//! encoder via `default_*` helpers handed to it, so an override only needs
//! to handle what it overrides.
//!
//! Overrides are honored only when [`RuntimeConfig::enable_serializer_overrides`]
//! is set — a process-wide kill switch independent of whether any given
//! connection was configured with one, so overrides can be disabled
//! everywhere (e.g. for diagnosing whether an override is the source of a
//! wire-level bug) without touching per-connection configuration.

use bytes::BytesMut;

use crate::protocol::{Connect, EncodeError, Publish, Subscribe, Unsubscribe};

/// Per-packet-type override points for outgoing packet serialization.
///
/// Every method receives the packet value and the default-codec bytes
/// already encoded into `default`, so an override that only cares about
/// one packet type can pass the rest straight through.
pub trait SerializerOverrides: Send + Sync {
    fn connect(&self, _packet: &Connect, default: BytesMut) -> Result<BytesMut, EncodeError> {
        Ok(default)
    }

    /// Returns the encoded packet and, in AWS mode, the byte offset of the
    /// packet-id field within it (for later in-place retransmission
    /// rewrite) — same contract as [`crate::codec::Encoder::encode_publish`].
    fn publish(
        &self,
        _packet: &Publish,
        default: (BytesMut, Option<usize>),
    ) -> Result<(BytesMut, Option<usize>), EncodeError> {
        Ok(default)
    }

    fn subscribe(&self, _packet: &Subscribe, default: BytesMut) -> Result<BytesMut, EncodeError> {
        Ok(default)
    }

    fn unsubscribe(
        &self,
        _packet: &Unsubscribe,
        default: BytesMut,
    ) -> Result<BytesMut, EncodeError> {
        Ok(default)
    }

    fn pingreq(&self, default: BytesMut) -> Result<BytesMut, EncodeError> {
        Ok(default)
    }

    fn disconnect(&self, default: BytesMut) -> Result<BytesMut, EncodeError> {
        Ok(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;
    use crate::protocol::Packet;

    struct UppercaseClientIdOverride;

    impl SerializerOverrides for UppercaseClientIdOverride {
        fn connect(&self, packet: &Connect, _default: BytesMut) -> Result<BytesMut, EncodeError> {
            let mut shouted = packet.clone();
            shouted.client_id = shouted.client_id.to_uppercase();
            let mut buf = BytesMut::new();
            Encoder::new().encode(&Packet::Connect(Box::new(shouted)), &mut buf)?;
            Ok(buf)
        }
    }

    #[test]
    fn default_impls_pass_through_untouched() {
        let overrides = UppercaseClientIdOverride;
        let packet = Subscribe {
            packet_id: 1,
            filters: vec![crate::protocol::SubscribeFilter {
                filter: "a/b".to_string(),
                qos: crate::protocol::QoS::AtLeastOnce,
            }],
        };
        let mut default = BytesMut::new();
        Encoder::new()
            .encode(&Packet::Subscribe(packet.clone()), &mut default)
            .unwrap();
        let out = overrides.subscribe(&packet, default.clone()).unwrap();
        assert_eq!(out, default);
    }

    #[test]
    fn override_replaces_only_the_packet_type_it_targets() {
        let overrides = UppercaseClientIdOverride;
        let packet = Connect {
            client_id: "device-1".to_string(),
            clean_session: true,
            keep_alive: 60,
            username: None,
            password: None,
            will: None,
        };
        let mut default = BytesMut::new();
        Encoder::new()
            .encode(&Packet::Connect(Box::new(packet.clone())), &mut default)
            .unwrap();
        let out = overrides.connect(&packet, default.clone()).unwrap();
        assert_ne!(out, default);
    }
}
