//! The message channel: reliable, ordered delivery on top of a session.
//!
//! Outbound, every sequenced message gets the next server id and sits in
//! the outbox until the client acknowledges it. Inbound, the client's
//! ids must arrive contiguously; anything else is a duplicate (dropped)
//! or a gap (answered with `sync`).
//!
//! ```text
//!   enqueue ──→ outbox ──→ transmit ──→ client
//!                 ↑                       │
//!                 └──── purge(ack) ←──────┘
//! ```

use std::ops::RangeInclusive;

use serde::Serialize;
use tether_protocol::{
    Codec, JsonCodec, OutboundBody, OutboundFrame, OutboundKind, SessionBody,
    now_millis,
};
use tracing::{debug, trace};

use crate::{ClientLink, Session, SessionError};

/// A sequenced message waiting for acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxMessage {
    pub id: u64,
    pub body: OutboundBody,
}

/// What to do with an inbound sequenced frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sequencing {
    /// The next expected id. The counter has advanced; process it.
    Accepted,
    /// Already processed. Drop silently.
    Duplicate,
    /// Something was skipped. Tell the client where we are with `sync`;
    /// the counter has not moved.
    Gap { expected: u64 },
}

/// Encodes and sends an unsequenced frame (`session`, `sync`, or a
/// pre-session `error`) straight to `link`.
pub fn send_unsequenced<B: Serialize>(
    link: &ClientLink,
    kind: OutboundKind,
    ack: u64,
    body: Option<&B>,
) -> Result<(), SessionError> {
    let frame = OutboundFrame {
        kind,
        id: None,
        ack,
        ts: now_millis(),
        body,
    };
    link.send(JsonCodec.encode(&frame)?)
}

impl Session {
    // -----------------------------------------------------------------
    // Outbound
    // -----------------------------------------------------------------

    /// Assigns the next server id, appends to the outbox, and transmits
    /// if a client is bound. Returns the assigned id.
    ///
    /// With no client bound the message just waits in the outbox for a
    /// resume to replay it.
    pub fn enqueue(&mut self, body: OutboundBody) -> u64 {
        self.server_message_id += 1;
        let id = self.server_message_id;
        self.outbox.push_back(OutboxMessage { id, body });

        if let Some(message) = self.outbox.back() {
            if let Some(sent) = self.transmit(message) {
                self.last_sent_message_id = self.last_sent_message_id.max(sent);
            }
        }
        id
    }

    /// Sends one outbox message to the bound client. Returns its id if it
    /// was handed to the writer.
    ///
    /// Failures are logged and swallowed: the message stays in the
    /// outbox either way.
    fn transmit(&self, message: &OutboxMessage) -> Option<u64> {
        let client = self.client.as_ref()?;
        let frame = OutboundFrame {
            kind: message.body.kind(),
            id: Some(message.id),
            ack: self.client_message_id,
            ts: now_millis(),
            body: Some(&message.body),
        };
        let result = self
            .codec
            .encode(&frame)
            .map_err(SessionError::from)
            .and_then(|bytes| client.send(bytes));

        match result {
            Ok(()) => Some(message.id),
            Err(e) => {
                debug!(
                    session = %self.id,
                    id = message.id,
                    error = %e,
                    "transmit failed, message kept in outbox"
                );
                None
            }
        }
    }

    /// Re-sends every outbox message, in order, to the bound client.
    /// Returns how many were handed to the writer.
    pub fn replay(&mut self) -> usize {
        let mut sent = 0;
        let mut highest = self.last_sent_message_id;
        for message in &self.outbox {
            match self.transmit(message) {
                Some(id) => {
                    sent += 1;
                    highest = highest.max(id);
                }
                None => break,
            }
        }
        self.last_sent_message_id = highest;
        trace!(session = %self.id, sent, "outbox replayed");
        sent
    }

    /// Removes every outbox message with `id <= ack`.
    ///
    /// Idempotent. Acks beyond what was ever sent only purge up to the
    /// last sent id, so unsent messages are never lost.
    pub fn purge(&mut self, ack: u64) -> usize {
        let ack = ack.min(self.last_sent_message_id);
        let mut purged = 0;
        while self.outbox.front().is_some_and(|m| m.id <= ack) {
            self.outbox.pop_front();
            purged += 1;
        }
        purged
    }

    /// Sends a bare `sync` frame carrying the current ack.
    pub fn send_sync(&self) -> Result<(), SessionError> {
        self.send_unsequenced::<()>(OutboundKind::Sync, None)
    }

    /// Sends an unsequenced `session` frame.
    pub fn send_session(&self, body: &SessionBody) -> Result<(), SessionError> {
        self.send_unsequenced(OutboundKind::Session, Some(body))
    }

    fn send_unsequenced<B: Serialize>(
        &self,
        kind: OutboundKind,
        body: Option<&B>,
    ) -> Result<(), SessionError> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| SessionError::Unbound(self.id.clone()))?;
        send_unsequenced(client, kind, self.client_message_id, body)
    }

    // -----------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------

    /// Checks an inbound sequenced id against the last one processed,
    /// advancing the counter when it is the next in line.
    pub fn sequence(&mut self, id: u64) -> Sequencing {
        let expected = self.client_message_id + 1;
        if id == expected {
            self.client_message_id = id;
            Sequencing::Accepted
        } else if id < expected {
            Sequencing::Duplicate
        } else {
            Sequencing::Gap { expected }
        }
    }

    // -----------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------

    /// The acks a resuming client may legitimately present.
    ///
    /// Lower bound: everything before the oldest unacknowledged message
    /// (or the latest id, if nothing is pending). Upper bound: the last
    /// message actually sent. Anything outside means the client saw
    /// messages that no longer exist or were never sent.
    pub fn ack_window(&self) -> RangeInclusive<u64> {
        let low = self
            .outbox
            .front()
            .map_or(self.server_message_id, |m| m.id - 1);
        low..=self.last_sent_message_id.max(low)
    }

    pub fn accepts_resume_ack(&self, ack: u64) -> bool {
        self.ack_window().contains(&ack)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use tether_protocol::{ConnectionId, ResponseBody};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{Outgoing, SessionId};

    fn response(n: u64) -> OutboundBody {
        OutboundBody::Response(ResponseBody {
            request_id: n,
            data: json!(n),
        })
    }

    fn bound_session() -> (Session, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = ClientLink::new(ConnectionId::new(1), tx);
        (Session::new(SessionId::generate(), link), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outgoing>) -> Vec<OutboundFrame> {
        let mut frames = Vec::new();
        while let Ok(Outgoing::Frame(bytes)) = rx.try_recv() {
            frames.push(serde_json::from_slice(&bytes).unwrap());
        }
        frames
    }

    #[test]
    fn test_enqueue_assigns_ascending_ids_and_transmits() {
        let (mut session, mut rx) = bound_session();
        assert_eq!(session.enqueue(response(1)), 1);
        assert_eq!(session.enqueue(response(2)), 2);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].id, Some(1));
        assert_eq!(frames[1].kind, OutboundKind::Response);
        assert_eq!(session.outbox_ids(), vec![1, 2]);
        assert_eq!(session.last_sent_message_id(), 2);
    }

    #[test]
    fn test_enqueue_while_unbound_only_stores() {
        let (mut session, mut rx) = bound_session();
        session.unbind(ConnectionId::new(1));

        session.enqueue(response(1));
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.outbox_ids(), vec![1]);
        assert_eq!(session.last_sent_message_id(), 0);
    }

    #[test]
    fn test_frames_carry_current_inbound_ack() {
        let (mut session, mut rx) = bound_session();
        session.sequence(1);
        session.sequence(2);
        session.enqueue(response(1));
        assert_eq!(drain(&mut rx)[0].ack, 2);
    }

    #[test]
    fn test_purge_is_idempotent() {
        let (mut session, _rx) = bound_session();
        for n in 1..=3 {
            session.enqueue(response(n));
        }
        assert_eq!(session.purge(2), 2);
        assert_eq!(session.purge(2), 0);
        assert_eq!(session.outbox_ids(), vec![3]);
    }

    #[test]
    fn test_purge_never_drops_unsent_messages() {
        let (mut session, _rx) = bound_session();
        session.enqueue(response(1));
        session.unbind(ConnectionId::new(1));
        session.enqueue(response(2));

        assert_eq!(session.purge(99), 1);
        assert_eq!(session.outbox_ids(), vec![2]);
    }

    #[test]
    fn test_sequence_accepts_duplicates_and_gaps() {
        let (mut session, _rx) = bound_session();
        assert_eq!(session.sequence(1), Sequencing::Accepted);
        assert_eq!(session.sequence(1), Sequencing::Duplicate);
        assert_eq!(session.sequence(3), Sequencing::Gap { expected: 2 });
        assert_eq!(session.client_message_id(), 1, "gap does not advance");
        assert_eq!(session.sequence(2), Sequencing::Accepted);
    }

    #[test]
    fn test_replay_resends_exact_outbox_in_order() {
        let (mut session, mut rx) = bound_session();
        for n in 1..=3 {
            session.enqueue(response(n));
        }
        session.purge(1);
        drain(&mut rx);

        assert_eq!(session.replay(), 2);
        let ids: Vec<_> = drain(&mut rx).iter().map(|f| f.id).collect();
        assert_eq!(ids, vec![Some(2), Some(3)]);
    }

    #[test]
    fn test_replay_after_rebind_sends_messages_queued_while_idle() {
        let (mut session, _rx) = bound_session();
        session.enqueue(response(1));
        session.unbind(ConnectionId::new(1));
        session.enqueue(response(2));

        let (tx, mut rx2) = mpsc::unbounded_channel();
        session.bind(ClientLink::new(ConnectionId::new(2), tx));
        session.replay();

        assert_eq!(drain(&mut rx2).len(), 2);
        assert_eq!(session.last_sent_message_id(), 2);
    }

    #[test]
    fn test_ack_window_bounds() {
        let (mut session, _rx) = bound_session();
        assert_eq!(session.ack_window(), 0..=0);

        for n in 1..=4 {
            session.enqueue(response(n));
        }
        session.purge(1);
        assert_eq!(session.ack_window(), 1..=4);
        assert!(!session.accepts_resume_ack(0));
        assert!(!session.accepts_resume_ack(5));

        session.purge(4);
        assert_eq!(session.ack_window(), 4..=4);
    }

    #[test]
    fn test_ack_window_excludes_unsent_messages() {
        let (mut session, _rx) = bound_session();
        session.enqueue(response(1));
        session.unbind(ConnectionId::new(1));
        session.enqueue(response(2));

        assert_eq!(session.ack_window(), 0..=1);
    }

    #[test]
    fn test_sync_frame_is_unsequenced() {
        let (mut session, mut rx) = bound_session();
        session.sequence(1);
        session.send_sync().unwrap();

        let frame = drain(&mut rx).remove(0);
        assert_eq!(frame.kind, OutboundKind::Sync);
        assert_eq!(frame.id, None);
        assert_eq!(frame.ack, 1);
        assert_eq!(frame.body, None::<Value>);
        assert!(session.outbox_ids().is_empty());
    }

    #[test]
    fn test_sync_without_client_fails() {
        let (mut session, _rx) = bound_session();
        session.unbind(ConnectionId::new(1));
        assert!(matches!(session.send_sync(), Err(SessionError::Unbound(_))));
    }

    #[test]
    fn test_transmit_failure_keeps_message() {
        let (mut session, rx) = bound_session();
        drop(rx);
        session.enqueue(response(1));
        assert_eq!(session.outbox_ids(), vec![1]);
        assert_eq!(session.last_sent_message_id(), 0);
    }
}
