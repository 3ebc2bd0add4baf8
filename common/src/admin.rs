use thiserror::Error;

pub const MAX_ADMINS: usize = 20;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AdminError {
    #[error("admin id must be a positive number")]
    InvalidId,
    #[error("admin list is full ({MAX_ADMINS})")]
    CapacityExceeded,
    #[error("the owner cannot be removed")]
    OwnerProtected,
    #[error("the last admin cannot be removed")]
    LastAdmin,
    #[error("id {0} is not an admin")]
    NotFound(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAdd {
    Added,
    AlreadyPresent,
}

/// Bounded list of identities allowed to run gated commands. The owner is
/// always a member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdminSet {
    owner: i64,
    ids: heapless::Vec<i64, MAX_ADMINS>,
}

impl AdminSet {
    pub fn new(owner: i64) -> Self {
        let mut ids = heapless::Vec::new();
        let _ = ids.push(owner);
        Self { owner, ids }
    }

    /// Rebuilds from persisted ids, dropping invalid and duplicate entries. A
    /// full list without the owner loses its last entry to make room.
    pub fn from_stored(owner: i64, stored: &[i64]) -> Self {
        let mut ids: heapless::Vec<i64, MAX_ADMINS> = heapless::Vec::new();
        for &id in stored {
            if id <= 0 || ids.contains(&id) {
                continue;
            }
            if ids.push(id).is_err() {
                break;
            }
        }

        if !ids.contains(&owner) {
            if ids.is_full() {
                ids.pop();
            }
            let _ = ids.push(owner);
        }
        Self { owner, ids }
    }

    pub fn owner(&self) -> i64 {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn contains(&self, id: i64) -> bool {
        self.ids.contains(&id)
    }

    pub fn add(&mut self, id: i64) -> Result<AdminAdd, AdminError> {
        if id <= 0 {
            return Err(AdminError::InvalidId);
        }
        if self.contains(id) {
            return Ok(AdminAdd::AlreadyPresent);
        }
        self.ids
            .push(id)
            .map_err(|_| AdminError::CapacityExceeded)?;
        Ok(AdminAdd::Added)
    }

    pub fn remove(&mut self, id: i64) -> Result<(), AdminError> {
        if id == self.owner {
            return Err(AdminError::OwnerProtected);
        }
        if self.ids.len() <= 1 {
            return Err(AdminError::LastAdmin);
        }
        if !self.contains(id) {
            return Err(AdminError::NotFound(id));
        }
        self.ids = self.ids.iter().copied().filter(|x| *x != id).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const OWNER: i64 = 1_000;

    #[test]
    fn owner_is_never_removed() {
        let mut admins = AdminSet::new(OWNER);
        assert_eq!(admins.remove(OWNER), Err(AdminError::OwnerProtected));
        admins.add(5).unwrap();
        assert_eq!(admins.remove(OWNER), Err(AdminError::OwnerProtected));
        assert!(admins.contains(OWNER));
    }

    #[test]
    fn add_is_idempotent_and_bounded() {
        let mut admins = AdminSet::new(OWNER);
        assert_eq!(admins.add(5), Ok(AdminAdd::Added));
        assert_eq!(admins.add(5), Ok(AdminAdd::AlreadyPresent));
        assert_eq!(admins.len(), 2);

        for id in 10..28 {
            admins.add(id).unwrap();
        }
        assert_eq!(admins.len(), MAX_ADMINS);
        let before = admins.clone();
        assert_eq!(admins.add(99), Err(AdminError::CapacityExceeded));
        assert_eq!(admins, before);
        assert_eq!(admins.add(0), Err(AdminError::InvalidId));
    }

    #[test]
    fn remove_reports_unknown_ids() {
        let mut admins = AdminSet::new(OWNER);
        admins.add(5).unwrap();
        assert_eq!(admins.remove(6), Err(AdminError::NotFound(6)));
        assert_eq!(admins.remove(5), Ok(()));
        assert_eq!(admins.ids(), &[OWNER]);
    }

    #[test]
    fn sole_admin_cannot_be_removed() {
        // Only reachable with a stored list that lost the owner; the rebuild
        // re-adds the owner, so the sole member is always the owner.
        let mut admins = AdminSet::from_stored(OWNER, &[]);
        assert_eq!(admins.ids(), &[OWNER]);
        assert_eq!(admins.remove(OWNER), Err(AdminError::OwnerProtected));
        assert_eq!(admins.remove(42), Err(AdminError::LastAdmin));
    }

    #[test]
    fn from_stored_repairs_list() {
        let admins = AdminSet::from_stored(OWNER, &[5, -3, 5, 0, 9]);
        assert_eq!(admins.ids(), &[5, 9, OWNER]);

        let full: Vec<i64> = (1..=20).collect();
        let admins = AdminSet::from_stored(OWNER, &full);
        assert_eq!(admins.len(), MAX_ADMINS);
        assert!(admins.contains(OWNER));
        assert!(!admins.contains(20));
    }
}
