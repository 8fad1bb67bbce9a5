//! Correlation of outgoing requests with their responses.
//!
//! Iq requests are keyed by id and matched against the result or error
//! coming back from the addressed entity. Nonzas without ids (SASL
//! exchanges, stream management answers) wait on a [`Criteria`] instead and
//! are matched in registration order. Every entry is removed when it
//! resolves, so a response is delivered at most once. Entries whose
//! [`PendingResponse`] was dropped are released on the next registration.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use jid::{BareJid, Jid};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::criteria::Criteria;
use crate::error::{ErrorCondition, XmppError};
use crate::stanza::{Stanza, StanzaKind, StanzaType};

/// Default time to wait for a response.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = Result<Stanza, XmppError>;

/// Handle on a registered entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ResponseKey {
    Id(String),
    Criteria(u64),
}

struct IdEntry {
    jid: Option<Jid>,
    sender: oneshot::Sender<Reply>,
}

struct CriteriaEntry {
    key: u64,
    criteria: Criteria,
    sender: oneshot::Sender<Reply>,
}

#[derive(Default)]
struct Entries {
    by_id: HashMap<String, IdEntry>,
    by_criteria: Vec<CriteriaEntry>,
    next_key: u64,
}

impl Entries {
    /// Drop entries nobody is waiting for any more.
    fn release_abandoned(&mut self) {
        let before = self.by_id.len() + self.by_criteria.len();
        self.by_id.retain(|_, entry| !entry.sender.is_closed());
        self.by_criteria.retain(|entry| !entry.sender.is_closed());
        let released = before - self.by_id.len() - self.by_criteria.len();
        if released > 0 {
            debug!(released, "Released abandoned requests");
        }
    }
}

/// A response that has been registered but not yet received.
#[derive(Debug)]
pub struct PendingResponse {
    key: ResponseKey,
    receiver: oneshot::Receiver<Reply>,
}

impl PendingResponse {
    pub fn key(&self) -> &ResponseKey {
        &self.key
    }
}

/// Resolves one waiting request. Obtained from [`ResponseManager::continuation`].
#[derive(Debug)]
pub struct Continuation {
    sender: oneshot::Sender<Reply>,
}

impl Continuation {
    pub fn resolve(self, stanza: Stanza) {
        if self.sender.send(Ok(stanza)).is_err() {
            debug!("Response arrived after the requester gave up");
        }
    }
}

#[derive(Default)]
pub struct ResponseManager {
    entries: Mutex<Entries>,
}

impl ResponseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an iq request. The stanza must already carry an id.
    pub fn register_iq(&self, stanza: &Stanza) -> Result<PendingResponse, XmppError> {
        let id = stanza
            .id()
            .ok_or_else(|| XmppError::with_message(ErrorCondition::BadRequest, "iq without id"))?
            .to_string();
        let (sender, receiver) = oneshot::channel();
        let mut entries = self.lock();
        entries.release_abandoned();
        if entries.by_id.contains_key(&id) {
            return Err(XmppError::with_message(
                ErrorCondition::Conflict,
                format!("request {id} is already pending"),
            ));
        }
        entries.by_id.insert(
            id.clone(),
            IdEntry {
                jid: stanza.to().cloned(),
                sender,
            },
        );
        Ok(PendingResponse {
            key: ResponseKey::Id(id),
            receiver,
        })
    }

    /// Wait for the first inbound element matching `criteria`.
    pub fn register_criteria(&self, criteria: Criteria) -> PendingResponse {
        let (sender, receiver) = oneshot::channel();
        let mut entries = self.lock();
        entries.release_abandoned();
        let key = entries.next_key;
        entries.next_key += 1;
        entries.by_criteria.push(CriteriaEntry {
            key,
            criteria,
            sender,
        });
        PendingResponse {
            key: ResponseKey::Criteria(key),
            receiver,
        }
    }

    /// Look up and remove the entry waiting for `stanza`.
    ///
    /// `own_jid` is the account's bare JID: replies from it without a
    /// resource (or without any `from`) answer requests sent with no `to`.
    pub fn continuation(&self, stanza: &Stanza, own_jid: Option<&BareJid>) -> Option<Continuation> {
        let mut entries = self.lock();

        if stanza.kind() == StanzaKind::Iq {
            let reply = matches!(
                stanza.stanza_type(),
                Some(StanzaType::Result | StanzaType::Error)
            );
            if let (true, Some(id)) = (reply, stanza.id()) {
                if let Some(entry) = entries.by_id.get(id) {
                    if addressed_by(entry.jid.as_ref(), stanza.from(), own_jid) {
                        return entries
                            .by_id
                            .remove(id)
                            .map(|entry| Continuation {
                                sender: entry.sender,
                            });
                    }
                    debug!(id, from = ?stanza.from(), "Ignoring reply from unexpected sender");
                }
            }
            return None;
        }

        let position = entries
            .by_criteria
            .iter()
            .position(|entry| entry.criteria.matches(stanza.element()))?;
        let entry = entries.by_criteria.remove(position);
        Some(Continuation {
            sender: entry.sender,
        })
    }

    /// Await `pending`, dropping the entry when `timeout` passes first.
    pub async fn wait(&self, pending: PendingResponse, timeout: Duration) -> Result<Stanza, XmppError> {
        let PendingResponse { key, receiver } = pending;
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(XmppError::with_message(
                ErrorCondition::UndefinedCondition,
                "request was dropped",
            )),
            Err(_) => {
                self.remove(&key);
                warn!(?key, "Request timed out");
                Err(XmppError::with_message(
                    ErrorCondition::RemoteServerTimeout,
                    "no response received",
                ))
            }
        }
    }

    /// Fail one entry, e.g. when sending the request failed.
    pub fn cancel(&self, key: &ResponseKey, error: XmppError) {
        let sender = match key {
            ResponseKey::Id(id) => self.lock().by_id.remove(id).map(|entry| entry.sender),
            ResponseKey::Criteria(k) => {
                let mut entries = self.lock();
                let position = entries.by_criteria.iter().position(|e| e.key == *k);
                position.map(|position| entries.by_criteria.remove(position).sender)
            }
        };
        if let Some(sender) = sender {
            let _ = sender.send(Err(error));
        }
    }

    /// Fail every pending entry with `error`.
    pub fn fail_all(&self, error: XmppError) {
        let (by_id, by_criteria) = {
            let mut entries = self.lock();
            (
                std::mem::take(&mut entries.by_id),
                std::mem::take(&mut entries.by_criteria),
            )
        };
        if !by_id.is_empty() || !by_criteria.is_empty() {
            debug!(
                requests = by_id.len() + by_criteria.len(),
                "Failing pending requests"
            );
        }
        for (_, entry) in by_id {
            let _ = entry.sender.send(Err(error.clone()));
        }
        for entry in by_criteria {
            let _ = entry.sender.send(Err(error.clone()));
        }
    }

    /// Fail only the entries waiting on criteria. Nonzas never outlive
    /// their stream, while iq requests may still be answered after a
    /// resumption.
    pub fn fail_criteria(&self, error: XmppError) {
        let by_criteria = std::mem::take(&mut self.lock().by_criteria);
        for entry in by_criteria {
            let _ = entry.sender.send(Err(error.clone()));
        }
    }

    pub fn pending(&self) -> usize {
        let mut entries = self.lock();
        entries.release_abandoned();
        entries.by_id.len() + entries.by_criteria.len()
    }

    fn remove(&self, key: &ResponseKey) {
        let mut entries = self.lock();
        match key {
            ResponseKey::Id(id) => {
                entries.by_id.remove(id);
            }
            ResponseKey::Criteria(k) => entries.by_criteria.retain(|e| e.key != *k),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn addressed_by(expected: Option<&Jid>, from: Option<&Jid>, own_jid: Option<&BareJid>) -> bool {
    let own_bare = |jid: &Jid| jid.resource().is_none() && own_jid.is_some_and(|own| jid.to_bare() == *own);
    match from {
        Some(from) => match expected {
            Some(expected) => expected == from,
            None => own_bare(from),
        },
        None => expected.is_none_or(|expected| own_bare(expected)),
    }
}
