//! # Participant Roster
//!
//! The set of remote members currently in the voice channel, as known to this
//! client. Insertion order is preserved so member lists render in join order.
//!
//! ## Update Policy:
//! - **`participants`**: full replace (sending the same list twice is a no-op)
//! - **`participant_joined`**: upsert; an id that is already present replaces the
//!   stored entry in place, so the roster never holds duplicates
//! - **`participant_left`**: remove by id; unknown ids are ignored
//!
//! The local user is tracked in the session state, never in here: once
//! [`Roster::set_local_user`] names it, every write path drops that id.

use crate::protocol::{Participant, ParticipantId};

/// Ordered participant map keyed by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    members: Vec<Participant>,
    local_user: Option<ParticipantId>,
}

/// What an upsert did, so callers can log joins and refreshes differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Inserted,
    Replaced,
    /// The entry was the local user and was not stored
    SkippedLocal,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name the local user so it is kept out of the roster.
    pub fn set_local_user(&mut self, id: Option<ParticipantId>) {
        if let Some(local) = &id {
            self.members.retain(|p| &p.id != local);
        }
        self.local_user = id;
    }

    pub fn local_user(&self) -> Option<&ParticipantId> {
        self.local_user.as_ref()
    }

    /// Replace the whole roster with `participants`.
    ///
    /// Duplicate ids inside the incoming list collapse onto their first position
    /// with the last entry's data.
    pub fn replace(&mut self, participants: Vec<Participant>) {
        self.members.clear();
        for participant in participants {
            self.upsert(participant);
        }
    }

    /// Insert a participant, or overwrite the existing entry with the same id.
    pub fn upsert(&mut self, participant: Participant) -> Upsert {
        if self.local_user.as_ref() == Some(&participant.id) {
            return Upsert::SkippedLocal;
        }
        match self.members.iter_mut().find(|p| p.id == participant.id) {
            Some(existing) => {
                *existing = participant;
                Upsert::Replaced
            }
            None => {
                self.members.push(participant);
                Upsert::Inserted
            }
        }
    }

    /// Remove by id. Returns the removed participant, `None` if it was not present.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let index = self.members.iter().position(|p| &p.id == id)?;
        Some(self.members.remove(index))
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.members.iter().find(|p| &p.id == id)
    }

    pub fn get_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.members.iter_mut().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.get(id).is_some()
    }

    pub fn clear(&mut self) {
        self.members.clear();
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.members.iter()
    }

    pub fn to_vec(&self) -> Vec<Participant> {
        self.members.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(id: u64, name: &str) -> Participant {
        Participant::new(id, name)
    }

    #[test]
    fn test_replace_is_idempotent() {
        let list = vec![member(1, "a"), member(2, "b")];
        let mut roster = Roster::new();
        roster.replace(list.clone());
        let first = roster.clone();
        roster.replace(list);
        assert_eq!(roster, first);
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_replace_drops_previous_members() {
        let mut roster = Roster::new();
        roster.replace(vec![member(1, "a"), member(2, "b")]);
        roster.replace(vec![member(3, "c")]);
        assert_eq!(roster.len(), 1);
        assert!(roster.contains(&ParticipantId::new("3")));
        assert!(!roster.contains(&ParticipantId::new("1")));
    }

    #[test]
    fn test_local_user_never_stored() {
        let mut roster = Roster::new();
        roster.upsert(member(9, "me"));
        roster.set_local_user(Some(ParticipantId::new("9")));
        assert!(roster.is_empty());

        roster.replace(vec![member(9, "me"), member(1, "a")]);
        assert_eq!(roster.upsert(member(9, "me")), Upsert::SkippedLocal);
        let ids: Vec<_> = roster.iter().map(|p| p.id.to_string()).collect();
        assert_eq!(ids, vec!["1"]);
    }

    #[test]
    fn test_joined_twice_replaces_in_place() {
        let mut roster = Roster::new();
        assert_eq!(roster.upsert(member(1, "a")), Upsert::Inserted);
        assert_eq!(roster.upsert(member(2, "b")), Upsert::Inserted);

        let mut renamed = member(1, "a2");
        renamed.is_muted = true;
        assert_eq!(roster.upsert(renamed), Upsert::Replaced);

        let names: Vec<_> = roster.iter().map(|p| p.username.as_str()).collect();
        assert_eq!(names, vec!["a2", "b"]);
        assert!(roster.get(&ParticipantId::new("1")).unwrap().is_muted);
    }

    #[test]
    fn test_remove_unknown_id_is_noop() {
        let mut roster = Roster::new();
        roster.replace(vec![member(1, "a")]);
        assert!(roster.remove(&ParticipantId::new("99")).is_none());
        assert_eq!(roster.len(), 1);
        assert!(roster.remove(&ParticipantId::new("1")).is_some());
        assert!(roster.is_empty());
    }
}
