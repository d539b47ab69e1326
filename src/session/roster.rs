//! Participant roster, self entry first

use serde::Serialize;

use crate::media::MediaStatus;
use crate::signaling::protocol::{RemoteParticipant, UserId};

/// One connected user as shown in the room
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    pub id: String,
    pub user_id: UserId,
    pub name: String,
    pub muted: bool,
    pub camera_off: bool,
    pub screen_sharing: bool,
    pub hand_raised: bool,
    pub speaking: bool,
}

impl Participant {
    fn from_remote(remote: RemoteParticipant) -> Self {
        Self {
            id: remote.id,
            user_id: remote.user_id,
            name: remote.name,
            muted: remote.muted,
            camera_off: remote.camera_off,
            screen_sharing: remote.is_screen_sharing,
            hand_raised: remote.hand_raised,
            speaking: false,
        }
    }
}

/// Everyone in the session
///
/// The local entry is always built from local state; server echoes of it
/// are ignored.
#[derive(Debug, Clone)]
pub struct Roster {
    local: Participant,
    remote: Vec<Participant>,
}

impl Roster {
    pub fn new(user_id: UserId, name: impl Into<String>) -> Self {
        Self {
            local: Participant {
                id: user_id.participant_id(),
                user_id,
                name: name.into(),
                muted: true,
                camera_off: true,
                screen_sharing: false,
                hand_raised: false,
                speaking: false,
            },
            remote: vec![],
        }
    }

    pub fn local(&self) -> &Participant {
        &self.local
    }

    pub fn local_id(&self) -> &str {
        &self.local.id
    }

    fn is_local(&self, id: &str, user_id: &UserId) -> bool {
        id == self.local.id || *user_id == self.local.user_id
    }

    pub fn set_local_status(&mut self, status: MediaStatus) {
        self.local.muted = status.muted;
        self.local.camera_off = status.camera_off;
        self.local.screen_sharing = status.is_screen_sharing;
    }

    pub fn set_local_hand(&mut self, raised: bool) {
        self.local.hand_raised = raised;
    }

    pub fn set_local_speaking(&mut self, speaking: bool) {
        self.local.speaking = speaking;
    }

    /// Replace the remote part of the roster with a server list
    ///
    /// Duplicate ids keep their first entry; the speaking flag of a
    /// participant already present survives.
    pub fn replace_remote(&mut self, list: Vec<RemoteParticipant>) {
        let mut remote: Vec<Participant> = Vec::with_capacity(list.len());
        for entry in list {
            if self.is_local(&entry.id, &entry.user_id) || remote.iter().any(|p| p.id == entry.id) {
                continue;
            }
            let mut participant = Participant::from_remote(entry);
            participant.speaking = self
                .remote
                .iter()
                .find(|p| p.id == participant.id)
                .is_some_and(|p| p.speaking);
            remote.push(participant);
        }
        self.remote = remote;
    }

    /// Drop one remote participant; returns `false` if it was not listed
    pub fn remove(&mut self, participant_id: &str) -> bool {
        let before = self.remote.len();
        self.remote.retain(|p| p.id != participant_id);
        self.remote.len() != before
    }

    pub fn clear_remote(&mut self) {
        self.remote.clear();
    }

    /// Remote participant ids in server order
    pub fn remote_ids(&self) -> Vec<String> {
        self.remote.iter().map(|p| p.id.clone()).collect()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.remote.iter().any(|p| p.id == participant_id)
    }

    pub fn get(&self, participant_id: &str) -> Option<&Participant> {
        if participant_id == self.local.id {
            return Some(&self.local);
        }
        self.remote.iter().find(|p| p.id == participant_id)
    }

    /// Number of participants including self
    pub fn count(&self) -> usize {
        self.remote.len() + 1
    }

    /// Full roster, local participant first
    pub fn participants(&self) -> Vec<Participant> {
        let mut all = Vec::with_capacity(self.count());
        all.push(self.local.clone());
        all.extend(self.remote.iter().cloned());
        all
    }

    fn remote_by_user(&mut self, user_id: &UserId) -> Option<&mut Participant> {
        self.remote.iter_mut().find(|p| p.user_id == *user_id)
    }

    /// Merge a remote `status_update`; returns whether anything changed
    pub fn update_status(&mut self, user_id: &UserId, muted: bool, camera_off: bool, sharing: bool) -> bool {
        let Some(p) = self.remote_by_user(user_id) else {
            return false;
        };
        let changed = p.muted != muted || p.camera_off != camera_off || p.screen_sharing != sharing;
        p.muted = muted;
        p.camera_off = camera_off;
        p.screen_sharing = sharing;
        changed
    }

    pub fn update_speaking(&mut self, user_id: &UserId, speaking: bool) -> bool {
        let Some(p) = self.remote_by_user(user_id) else {
            return false;
        };
        let changed = p.speaking != speaking;
        p.speaking = speaking;
        changed
    }

    /// Merge a `hand_raise_update`, matched by user id when given, else by name
    pub fn update_hand(&mut self, name: &str, user_id: Option<&UserId>, raised: bool) -> bool {
        let target = match user_id {
            Some(uid) if *uid == self.local.user_id => Some(&mut self.local),
            Some(uid) => self.remote.iter_mut().find(|p| p.user_id == *uid),
            None if self.local.name == name => Some(&mut self.local),
            None => self.remote.iter_mut().find(|p| p.name == name),
        };
        match target {
            Some(p) if p.hand_raised != raised => {
                p.hand_raised = raised;
                true
            }
            _ => false,
        }
    }
}
