//! Scheduler job bodies: `process-send`, `process-receive` (as the receive
//! loop's packet dispatch), `process-complete`, and `process-keep-alive`.
//! These are the only places that touch the transport directly or invoke a
//! user callback/semaphore signal; they never do the latter while holding
//! `state` or `subscriptions`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf};

use crate::codec::Decoder;
use crate::error::Status;
use crate::pool::boxed;
use crate::protocol::{ConnAck, Packet, PubAck, Publish, QoS, SubAck, UnsubAck};
use crate::transport::Transport;

use super::core::Connection;
use super::operation::{Notify, Operation, OperationType, RetryState};

const READ_CHUNK: usize = 4096;

impl Connection {
    fn expects_ack(op: &Operation) -> bool {
        op.op_type.expects_ack()
            || (op.op_type == OperationType::PublishToServer && op.packet_id != 0)
    }

    /// Removes `op` from whichever list it is currently on, if any. Safe to
    /// call even if it has already been removed (e.g. by `close`).
    fn remove_pending(&self, op: &Arc<Operation>) {
        let mut state = self.inner.state.lock();
        state.pending_send.retain(|queued| !Arc::ptr_eq(queued, op));
        if op.op_type == OperationType::Connect {
            if matches!(&state.pending_connect, Some(pending) if Arc::ptr_eq(pending, op)) {
                state.pending_connect = None;
            }
        } else if op.packet_id != 0 {
            if matches!(state.pending_response.get(&op.packet_id), Some(pending) if Arc::ptr_eq(pending, op))
            {
                state.pending_response.remove(&op.packet_id);
            }
        }
    }

    pub(super) async fn process_send(self, op: Arc<Operation>) {
        if op.is_terminal() {
            // A deferred retry fired after the operation already completed
            // via an ack or a prior exhaustion; nothing left to send.
            self.process_complete(op).await;
            return;
        }

        let expects_ack = Self::expects_ack(&op);
        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                drop(state);
                op.complete(Status::NetworkError);
                self.process_complete(op).await;
                return;
            }
            state.pending_send.retain(|queued| !Arc::ptr_eq(queued, &op));
            if expects_ack && op.retry().count == 0 {
                match op.op_type {
                    OperationType::Connect => state.pending_connect = Some(op.clone()),
                    _ => {
                        state.pending_response.insert(op.packet_id, op.clone());
                    }
                }
            }
        }

        if self.inner.aws_mode && op.op_type == OperationType::PublishToServer {
            op.rewrite_packet_id();
        }

        let bytes = op.packet_bytes();
        let write_result = {
            let mut writer = self.inner.write_half.lock().await;
            writer.write_all(&bytes).await
        };

        if let Err(e) = write_result {
            tracing::warn!(error = %e, op = op.op_type.name(), "transport write failed");
            self.remove_pending(&op);
            op.complete(Status::NetworkError);
            self.process_complete(op).await;
            return;
        }

        if !expects_ack {
            op.clear_retry();
            op.complete(Status::Success);
            self.process_complete(op).await;
            return;
        }

        let retry = op.retry();
        if retry.limit > 0 {
            op.acquire();
            let delay = Duration::from_millis(retry.next_period_ms.max(1) as u64);
            tracing::trace!(
                op = op.op_type.name(),
                packet_id = op.packet_id,
                delay_ms = delay.as_millis() as u64,
                "arming retry"
            );
            let conn = self.clone();
            let retry_op = op.clone();
            self.inner
                .pool
                .spawn_after(delay, boxed(async move { conn.retry_send(retry_op).await }));
        }
    }

    /// A deferred retry timer firing: either the operation already
    /// completed (drop the extra reference held for this timer) or it is
    /// still pending, in which case re-send unless the retry budget is
    /// spent.
    async fn retry_send(self, op: Arc<Operation>) {
        if op.is_terminal() {
            op.release();
            return;
        }
        let retry = op.retry();
        if retry.exhausted() {
            tracing::trace!(
                op = op.op_type.name(),
                packet_id = op.packet_id,
                "retry budget exhausted"
            );
            self.remove_pending(&op);
            op.complete(Status::RetryNoResponse);
            self.process_complete(op).await;
            return;
        }
        tracing::trace!(op = op.op_type.name(), packet_id = op.packet_id, "retrying");
        op.advance_retry(self.inner.retry_ms_ceiling);
        self.process_send(op).await;
    }

    /// Removes `op` from its list, signals completion exactly once, and
    /// releases the scheduler's reference.
    pub(super) async fn process_complete(self, op: Arc<Operation>) {
        self.remove_pending(&op);
        op.notify().signal(op.status());
        self.inner.allocator.free(op.take_packet());
        op.release();
    }

    async fn send_puback(&self, packet_id: u16) {
        let mut buf = self.inner.allocator.allocate(0).unwrap_or_default();
        if self
            .inner
            .encoder
            .encode(&Packet::PubAck(PubAck { packet_id }), &mut buf)
            .is_err()
        {
            return;
        }
        let op = Operation::new(
            OperationType::PubAck,
            0,
            buf,
            packet_id,
            None,
            RetryState::none(),
            Notify::None,
        );
        {
            let mut state = self.inner.state.lock();
            if state.disconnected {
                return;
            }
            state.pending_send.push_back(op.clone());
        }
        self.clone().process_send(op).await;
    }

    /// Reads MQTT packets off `read_half` until the transport closes or a
    /// framing error occurs, dispatching each one. Plays the role of the
    /// transport's receive callback, run as a dedicated task instead of a
    /// registered function pointer.
    pub(super) async fn spawn_receive_loop(self, mut read_half: ReadHalf<Box<dyn Transport>>) {
        let mut decoder = Decoder::new();
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            let read = read_half.read(&mut chunk).await;
            let n = match read {
                Ok(0) => {
                    self.close(Status::NetworkError).await;
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "transport read failed");
                    self.close(Status::NetworkError).await;
                    return;
                }
            };
            buf.extend_from_slice(&chunk[..n]);

            loop {
                match decoder.decode(&buf) {
                    Ok(Some((packet, consumed))) => {
                        buf.advance(consumed);
                        if self.dispatch_inbound(packet).await.is_err() {
                            self.close(Status::NetworkError).await;
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = ?e, "malformed packet from broker");
                        self.close(Status::NetworkError).await;
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch_inbound(&self, packet: Packet) -> Result<(), ()> {
        match packet {
            Packet::ConnAck(connack) => self.handle_connack(connack).await,
            Packet::SubAck(suback) => self.handle_suback(suback).await,
            Packet::UnsubAck(unsuback) => self.handle_unsuback(unsuback).await,
            Packet::Publish(publish) => self.handle_inbound_publish(publish).await,
            Packet::PubAck(puback) => self.handle_puback(puback).await,
            Packet::PingResp => {
                self.inner.pingresp_seen.store(true, Ordering::Release);
                Ok(())
            }
            // A broker never legitimately sends a client-originated packet
            // type; treat it as a protocol violation and close.
            Packet::Connect(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq
            | Packet::Disconnect => Err(()),
        }
    }

    async fn handle_connack(&self, connack: ConnAck) -> Result<(), ()> {
        let op = {
            let mut state = self.inner.state.lock();
            state.pending_connect.take()
        };
        let Some(op) = op else {
            return Err(());
        };
        let status = if connack.return_code.is_accepted() {
            Status::Success
        } else {
            Status::ServerRefused
        };
        op.complete(status);
        self.clone().process_complete(op).await;
        Ok(())
    }

    async fn handle_suback(&self, suback: SubAck) -> Result<(), ()> {
        let op = {
            let mut state = self.inner.state.lock();
            state.pending_response.remove(&suback.packet_id)
        };
        let Some(op) = op else {
            return Err(());
        };
        let accepted: Vec<bool> = suback.return_codes.iter().map(|c| c.is_success()).collect();
        {
            let mut subs = self.inner.subscriptions.lock();
            subs.apply_suback(suback.packet_id, &accepted);
        }
        let status = if accepted.iter().any(|ok| *ok) {
            Status::Success
        } else {
            Status::ServerRefused
        };
        op.complete(status);
        self.clone().process_complete(op).await;
        Ok(())
    }

    async fn handle_unsuback(&self, unsuback: UnsubAck) -> Result<(), ()> {
        let op = {
            let mut state = self.inner.state.lock();
            state.pending_response.remove(&unsuback.packet_id)
        };
        let Some(op) = op else {
            return Err(());
        };
        op.complete(Status::Success);
        self.clone().process_complete(op).await;
        Ok(())
    }

    async fn handle_puback(&self, puback: PubAck) -> Result<(), ()> {
        let op = {
            let mut state = self.inner.state.lock();
            state.pending_response.remove(&puback.packet_id)
        };
        // A late or duplicate PUBACK after we already gave up (or after a
        // retry replaced this entry) is not a protocol violation worth
        // closing the connection over.
        let Some(op) = op else {
            return Ok(());
        };
        op.clear_retry();
        op.complete(Status::Success);
        self.clone().process_complete(op).await;
        Ok(())
    }

    async fn handle_inbound_publish(&self, publish: Publish) -> Result<(), ()> {
        let matches = {
            let subs = self.inner.subscriptions.lock();
            subs.matches(&publish.topic)
        };
        for sub in matches {
            (sub.callback)(&publish.topic, &publish.payload, publish.qos);
            sub.release();
        }
        if publish.qos == QoS::AtLeastOnce {
            if let Some(packet_id) = publish.packet_id {
                self.send_puback(packet_id).await;
            }
        }
        Ok(())
    }

    /// The keep-alive job body: send PINGREQ, then immediately rearm the
    /// next keep-alive tick for `keep_alive_ms` out so the steady-state
    /// period stays exactly `keep_alive_ms` regardless of how long a
    /// PINGRESP takes to arrive. The PINGRESP deadline is checked by a
    /// separate deferred job racing the next tick, not by blocking this one.
    pub(super) async fn process_keep_alive(self) {
        if self.inner.state.lock().disconnected {
            return;
        }
        self.inner.pingresp_seen.store(false, Ordering::Release);
        tracing::trace!("sending keep-alive PINGREQ");
        let send_result = {
            let mut writer = self.inner.write_half.lock().await;
            writer.write_all(&self.inner.pingreq_packet).await
        };
        if send_result.is_err() {
            self.close(Status::NetworkError).await;
            return;
        }
        if self.inner.state.lock().disconnected {
            return;
        }

        self.clone().arm_keep_alive();

        let response_wait = self.inner.response_wait;
        let conn = self.clone();
        self.inner.pool.spawn_after(
            response_wait,
            boxed(async move { conn.check_pingresp_deadline().await }),
        );
    }

    /// Fires `response_wait` after a PINGREQ; closes the connection if no
    /// PINGRESP arrived in that window.
    async fn check_pingresp_deadline(self) {
        if self.inner.state.lock().disconnected {
            return;
        }
        if !self.inner.pingresp_seen.load(Ordering::Acquire) {
            tracing::trace!("PINGRESP deadline missed");
            self.close(Status::NetworkError).await;
        }
    }
}
