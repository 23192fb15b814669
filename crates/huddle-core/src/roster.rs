use crate::events::UserInfo;

/// Authoritative list of users in the current session, in join order.
///
/// Mutated only by the session event loop. At most one user carries the
/// host flag at any time.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    users: Vec<UserInfo>,
    myself: Option<u64>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole roster, e.g. from a welcome snapshot.
    pub fn reset(&mut self, users: Vec<UserInfo>, myself: u64) {
        self.users.clear();
        self.myself = Some(myself);
        for user in users {
            self.add_user(user);
        }
        self.normalize_host();
    }

    pub fn myself_id(&self) -> Option<u64> {
        self.myself
    }

    pub fn myself(&self) -> Option<&UserInfo> {
        self.myself.and_then(|id| self.user(id))
    }

    /// Returns `false` for a duplicate id.
    pub fn add_user(&mut self, user: UserInfo) -> bool {
        if self.users.iter().any(|u| u.user_id == user.user_id) {
            return false;
        }
        let is_host = user.is_host;
        let id = user.user_id;
        self.users.push(user);
        if is_host {
            self.set_host(id);
        }
        true
    }

    pub fn remove_user(&mut self, user_id: u64) -> Option<UserInfo> {
        let idx = self.users.iter().position(|u| u.user_id == user_id)?;
        Some(self.users.remove(idx))
    }

    pub fn users(&self) -> &[UserInfo] {
        &self.users
    }

    pub fn remote_users(&self) -> impl Iterator<Item = &UserInfo> {
        self.users.iter().filter(move |u| Some(u.user_id) != self.myself)
    }

    pub fn user(&self, user_id: u64) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.user_id == user_id)
    }

    pub fn user_mut(&mut self, user_id: u64) -> Option<&mut UserInfo> {
        self.users.iter_mut().find(|u| u.user_id == user_id)
    }

    pub fn contains(&self, user_id: u64) -> bool {
        self.user(user_id).is_some()
    }

    pub fn host(&self) -> Option<&UserInfo> {
        self.users.iter().find(|u| u.is_host)
    }

    pub fn managers(&self) -> Vec<&UserInfo> {
        self.users.iter().filter(|u| u.is_manager).collect()
    }

    /// Move the host flag to `user_id` in one step. Returns `false` if the
    /// user is unknown, leaving the roster untouched.
    pub fn set_host(&mut self, user_id: u64) -> bool {
        if !self.contains(user_id) {
            return false;
        }
        for user in &mut self.users {
            user.is_host = user.user_id == user_id;
            if user.is_host {
                user.is_manager = false;
            }
        }
        true
    }

    /// Used when the host moved somewhere this roster cannot see.
    pub fn clear_host(&mut self) {
        self.users.iter_mut().for_each(|u| u.is_host = false);
    }

    pub fn set_spotlighted(&mut self, user_ids: &[u64]) {
        for user in &mut self.users {
            user.spotlighted = user_ids.contains(&user.user_id);
        }
    }

    pub fn set_manager(&mut self, user_id: u64, manager: bool) -> bool {
        match self.user_mut(user_id) {
            Some(user) => {
                user.is_manager = manager && !user.is_host;
                true
            }
            None => false,
        }
    }

    pub fn is_privileged(&self, user_id: u64) -> bool {
        self.user(user_id).is_some_and(|u| u.is_host || u.is_manager)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }

    pub fn clear(&mut self) {
        self.users.clear();
        self.myself = None;
    }

    pub fn host_count(&self) -> usize {
        self.users.iter().filter(|u| u.is_host).count()
    }

    fn normalize_host(&mut self) {
        if let Some(first) = self.users.iter().find(|u| u.is_host).map(|u| u.user_id) {
            self.set_host(first);
        }
    }
}
