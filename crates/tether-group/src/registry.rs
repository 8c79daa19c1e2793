//! Group registry: who is in which group, and who hears about it.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tether_protocol::{EventPayload, JoinedBody, LeftBody, OutboundBody, PresenceBody};
use tether_session::SessionId;
use tracing::{debug, info};

use crate::GroupError;

/// Identifies a group: the owning service plus the group name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey {
    pub service: String,
    pub group: String,
}

impl GroupKey {
    pub fn new(service: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.group)
    }
}

/// Who inside a group an event is addressed to.
///
/// Always resolved against current membership: naming a session or
/// user that is not in the group reaches nobody.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    /// Every member session.
    All,
    /// One specific session.
    Session(SessionId),
    /// Every session holding this identity.
    User(String),
    /// Every member session except this one.
    AllExcept(SessionId),
}

/// One outbound body for one session.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub to: SessionId,
    pub body: OutboundBody,
}

/// Members of one group, in join order.
#[derive(Debug, Default)]
struct Group {
    members: Vec<(SessionId, String)>,
}

impl Group {
    fn has_user(&self, user: &str) -> bool {
        self.members.iter().any(|(_, u)| u == user)
    }

    /// Distinct identities, first appearance first.
    fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = Vec::new();
        for (_, user) in &self.members {
            if !users.contains(user) {
                users.push(user.clone());
            }
        }
        users
    }
}

/// Tracks membership for every group of every service.
///
/// Membership is per session; presence notifications (`enter`/`exit`)
/// are per identity, so a user with two sessions in a group is
/// announced once and only leaves when the last session does.
///
/// The registry itself never sends anything. Every mutating operation
/// returns the [`Delivery`]s it implies, in order, and the caller
/// enqueues them on the addressed sessions.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: HashMap<GroupKey, Group>,

    /// Reverse index: the groups each session belongs to, in join order.
    /// Kept in sync with `groups`.
    session_groups: HashMap<SessionId, Vec<GroupKey>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `session` to the group as `user`.
    ///
    /// Returns an `enter` for every existing member when `user` is new to
    /// the group, followed by the `join` confirmation for `session`
    /// listing every distinct identity (including its own).
    ///
    /// # Errors
    /// [`GroupError::AlreadyJoined`] if the session is already a member.
    pub fn join(
        &mut self,
        key: &GroupKey,
        session: &SessionId,
        user: &str,
        request_id: Option<u64>,
    ) -> Result<Vec<Delivery>, GroupError> {
        let group = self.groups.entry(key.clone()).or_default();
        if group.members.iter().any(|(s, _)| s == session) {
            return Err(GroupError::AlreadyJoined {
                key: key.clone(),
                session: session.clone(),
            });
        }

        let mut deliveries = Vec::new();
        if !group.has_user(user) {
            let enter = OutboundBody::Enter(presence(key, user));
            deliveries.extend(group.members.iter().map(|(to, _)| Delivery {
                to: to.clone(),
                body: enter.clone(),
            }));
        }

        group.members.push((session.clone(), user.to_owned()));
        let users = group.users();

        self.session_groups
            .entry(session.clone())
            .or_default()
            .push(key.clone());

        deliveries.push(Delivery {
            to: session.clone(),
            body: OutboundBody::Join(JoinedBody {
                request_id,
                service: key.service.clone(),
                group: key.group.clone(),
                users,
            }),
        });

        info!(%key, %session, user, "joined group");
        Ok(deliveries)
    }

    /// Removes `session` from the group.
    ///
    /// Returns an `exit` for the remaining members when no other session
    /// of the same identity is left, followed by the `leave`
    /// confirmation for `session`. An emptied group is deleted.
    ///
    /// # Errors
    /// [`GroupError::NotMember`] if the session is not in the group.
    pub fn leave(
        &mut self,
        key: &GroupKey,
        session: &SessionId,
    ) -> Result<Vec<Delivery>, GroupError> {
        let not_member = || GroupError::NotMember {
            key: key.clone(),
            session: session.clone(),
        };
        let group = self.groups.get_mut(key).ok_or_else(not_member)?;
        let index = group
            .members
            .iter()
            .position(|(s, _)| s == session)
            .ok_or_else(not_member)?;

        let (_, user) = group.members.remove(index);
        let mut deliveries = Vec::new();

        if group.members.is_empty() {
            self.groups.remove(key);
            debug!(%key, "group emptied");
        } else if !group.has_user(&user) {
            let exit = OutboundBody::Exit(presence(key, &user));
            deliveries.extend(group.members.iter().map(|(to, _)| Delivery {
                to: to.clone(),
                body: exit.clone(),
            }));
        }

        self.forget(session, key);
        deliveries.push(Delivery {
            to: session.clone(),
            body: left(key),
        });

        info!(%key, %session, user = %user, "left group");
        Ok(deliveries)
    }

    /// Tears the group down: every member gets a `leave`, then the group
    /// is gone.
    ///
    /// # Errors
    /// [`GroupError::NotFound`] if the group does not exist.
    pub fn close(&mut self, key: &GroupKey) -> Result<Vec<Delivery>, GroupError> {
        let group = self
            .groups
            .remove(key)
            .ok_or_else(|| GroupError::NotFound(key.clone()))?;

        let deliveries = group
            .members
            .into_iter()
            .map(|(session, _)| {
                self.forget(&session, key);
                Delivery {
                    to: session,
                    body: left(key),
                }
            })
            .collect();

        info!(%key, "group closed");
        Ok(deliveries)
    }

    /// Addresses an event to `recipient` within the group.
    ///
    /// # Errors
    /// [`GroupError::NotFound`] if the group does not exist.
    pub fn event(
        &self,
        key: &GroupKey,
        recipient: &Recipient,
        kind: &str,
        data: Value,
    ) -> Result<Vec<Delivery>, GroupError> {
        let group = self
            .groups
            .get(key)
            .ok_or_else(|| GroupError::NotFound(key.clone()))?;

        let body = OutboundBody::Event(EventPayload {
            service: key.service.clone(),
            group: key.group.clone(),
            kind: kind.to_owned(),
            data,
        });

        let deliveries: Vec<Delivery> = group
            .members
            .iter()
            .filter(|(session, user)| match recipient {
                Recipient::All => true,
                Recipient::Session(target) => session == target,
                Recipient::User(target) => user == target,
                Recipient::AllExcept(excluded) => session != excluded,
            })
            .map(|(session, _)| Delivery {
                to: session.clone(),
                body: body.clone(),
            })
            .collect();

        debug!(%key, kind, recipients = deliveries.len(), "event fan-out");
        Ok(deliveries)
    }

    /// Whether `session` is a member of the group.
    pub fn is_member(&self, key: &GroupKey, session: &SessionId) -> bool {
        self.groups
            .get(key)
            .is_some_and(|g| g.members.iter().any(|(s, _)| s == session))
    }

    /// The groups `session` belongs to, in join order.
    pub fn groups_of(&self, session: &SessionId) -> Vec<GroupKey> {
        self.session_groups.get(session).cloned().unwrap_or_default()
    }

    /// Distinct identities in the group.
    pub fn users(&self, key: &GroupKey) -> Vec<String> {
        self.groups.get(key).map(Group::users).unwrap_or_default()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    fn forget(&mut self, session: &SessionId, key: &GroupKey) {
        if let Some(keys) = self.session_groups.get_mut(session) {
            keys.retain(|k| k != key);
            if keys.is_empty() {
                self.session_groups.remove(session);
            }
        }
    }
}

fn presence(key: &GroupKey, user: &str) -> PresenceBody {
    PresenceBody {
        service: key.service.clone(),
        group: key.group.clone(),
        user: user.to_owned(),
    }
}

fn left(key: &GroupKey) -> OutboundBody {
    OutboundBody::Leave(LeftBody {
        service: key.service.clone(),
        group: key.group.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> GroupKey {
        GroupKey::new("chat", "lobby")
    }

    #[test]
    fn test_group_key_display() {
        assert_eq!(key().to_string(), "chat:lobby");
    }

    #[test]
    fn test_first_join_only_confirms() {
        let mut reg = GroupRegistry::new();
        let s1 = SessionId::from("s1");
        let out = reg.join(&key(), &s1, "u1", Some(4)).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to, s1);
        match &out[0].body {
            OutboundBody::Join(body) => {
                assert_eq!(body.request_id, Some(4));
                assert_eq!(body.users, vec!["u1".to_string()]);
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn test_join_twice_is_rejected() {
        let mut reg = GroupRegistry::new();
        let s1 = SessionId::from("s1");
        reg.join(&key(), &s1, "u1", None).unwrap();

        let err = reg.join(&key(), &s1, "u1", None).unwrap_err();
        assert!(matches!(err, GroupError::AlreadyJoined { .. }));
        assert_eq!(err.code().as_u16(), 412);
        assert_eq!(reg.users(&key()), vec!["u1"]);
    }

    #[test]
    fn test_leave_unknown_group_is_not_member() {
        let mut reg = GroupRegistry::new();
        let err = reg.leave(&key(), &SessionId::from("s1")).unwrap_err();
        assert!(matches!(err, GroupError::NotMember { .. }));
        assert_eq!(err.code().as_u16(), 404);
    }

    #[test]
    fn test_last_leave_deletes_group() {
        let mut reg = GroupRegistry::new();
        let s1 = SessionId::from("s1");
        reg.join(&key(), &s1, "u1", None).unwrap();

        let out = reg.leave(&key(), &s1).unwrap();
        assert_eq!(out.len(), 1, "only the leave confirmation");
        assert_eq!(reg.group_count(), 0);
        assert!(reg.groups_of(&s1).is_empty());
    }

    #[test]
    fn test_reverse_index_tracks_join_order() {
        let mut reg = GroupRegistry::new();
        let s1 = SessionId::from("s1");
        let other = GroupKey::new("chat", "random");
        reg.join(&key(), &s1, "u1", None).unwrap();
        reg.join(&other, &s1, "u1", None).unwrap();

        assert_eq!(reg.groups_of(&s1), vec![key(), other.clone()]);
        reg.leave(&key(), &s1).unwrap();
        assert_eq!(reg.groups_of(&s1), vec![other]);
    }
}
