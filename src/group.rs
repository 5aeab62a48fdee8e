//! The group registry.
//!
//! Groups let a user share a different file list with different sets of
//! peers. Every nickname belongs to at most one group; nicknames never
//! explicitly assigned resolve to the default group. The registry keeps a
//! dual index (group to members and nick to group) so lookups stay constant
//! time either way.

use std::{
    collections::{HashMap, HashSet},
    sync::Mutex,
};

use crate::error::{Error, Result};

pub(crate) struct GroupRegistry {
    base: String,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    members: HashMap<String, HashSet<String>>,
    nick_index: HashMap<String, String>,
}

impl GroupRegistry {
    pub(crate) fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        let mut members = HashMap::new();
        members.insert(base.clone(), HashSet::new());
        Self {
            base,
            inner: Mutex::new(Inner {
                members,
                nick_index: HashMap::new(),
            }),
        }
    }

    /// The name of the default group.
    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    /// Creates a new group. Fails without side effects if the name is taken.
    pub(crate) fn create(&self, group: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.members.contains_key(group) {
            return Err(Error::GroupExists(group.into()));
        }
        inner.members.insert(group.into(), HashSet::new());
        log::debug!("Created group {}", group);
        Ok(())
    }

    /// Adds a nick to a group, removing it from every other group first so
    /// that each nick belongs to at most one group.
    pub(crate) fn add(&self, group: &str, nick: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.members.contains_key(group) {
            return Err(Error::UnknownGroup(group.into()));
        }
        if let Some(old) = inner.nick_index.remove(nick) {
            if let Some(old_members) = inner.members.get_mut(&old) {
                old_members.remove(nick);
            }
        }
        inner.members.get_mut(group).unwrap().insert(nick.into());
        inner.nick_index.insert(nick.into(), group.into());
        log::debug!("Added {} to group {}", nick, group);
        Ok(())
    }

    /// Removes a nick from a group.
    pub(crate) fn remove(&self, group: &str, nick: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.members.get_mut(group) {
            Some(members) => {
                members.remove(nick);
            }
            None => return Err(Error::UnknownGroup(group.into())),
        }
        if inner.nick_index.get(nick).map(String::as_str) == Some(group) {
            inner.nick_index.remove(nick);
        }
        Ok(())
    }

    /// Returns whether the nick is an explicit member of the group.
    pub(crate) fn check(&self, group: &str, nick: &str) -> bool {
        let inner = self.inner.lock().unwrap();
        inner
            .members
            .get(group)
            .map(|members| members.contains(nick))
            .unwrap_or(false)
    }

    /// Returns the group the nick belongs to, falling back to the default.
    pub(crate) fn find(&self, nick: &str) -> String {
        let inner = self.inner.lock().unwrap();
        inner
            .nick_index
            .get(nick)
            .cloned()
            .unwrap_or_else(|| self.base.clone())
    }

    /// Deletes a group; its members fall back to the default group. The
    /// default group itself cannot be deleted.
    pub(crate) fn delete(&self, group: &str) -> Result<()> {
        if group == self.base {
            return Err(Error::DefaultGroup);
        }
        let mut inner = self.inner.lock().unwrap();
        match inner.members.remove(group) {
            Some(members) => {
                for nick in members {
                    inner.nick_index.remove(&nick);
                }
                log::debug!("Deleted group {}", group);
                Ok(())
            }
            None => Err(Error::UnknownGroup(group.into())),
        }
    }

    /// Renames a group, carrying its membership over.
    pub(crate) fn rename(&self, group: &str, newname: &str) -> Result<()> {
        if group == self.base {
            return Err(Error::DefaultGroup);
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.members.contains_key(newname) {
            return Err(Error::GroupExists(newname.into()));
        }
        let members = inner
            .members
            .remove(group)
            .ok_or_else(|| Error::UnknownGroup(group.into()))?;
        for nick in &members {
            inner.nick_index.insert(nick.clone(), newname.into());
        }
        inner.members.insert(newname.into(), members);
        Ok(())
    }

    /// All group names, the default included.
    pub(crate) fn names(&self) -> Vec<String> {
        self.inner.lock().unwrap().members.keys().cloned().collect()
    }

    /// A persistable copy of the membership map.
    pub(crate) fn snapshot(&self) -> HashMap<String, Vec<String>> {
        let inner = self.inner.lock().unwrap();
        inner
            .members
            .iter()
            .map(|(group, members)| {
                let mut members: Vec<_> = members.iter().cloned().collect();
                members.sort();
                (group.clone(), members)
            })
            .collect()
    }

    /// Replaces the registry contents from a persisted snapshot, re-deriving
    /// the nick index and enforcing the one-group invariant.
    pub(crate) fn restore(&self, snapshot: HashMap<String, Vec<String>>) {
        let mut inner = self.inner.lock().unwrap();
        inner.members.clear();
        inner.nick_index.clear();
        inner.members.insert(self.base.clone(), HashSet::new());
        for (group, members) in snapshot {
            inner.members.entry(group.clone()).or_default();
            for nick in members {
                // the last group mentioning a nick wins; strip it elsewhere
                if let Some(old) = inner.nick_index.insert(nick.clone(), group.clone()) {
                    if old != group {
                        if let Some(old_members) = inner.members.get_mut(&old) {
                            old_members.remove(&nick);
                        }
                    }
                }
                inner.members.get_mut(&group).unwrap().insert(nick);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn registry() -> GroupRegistry {
        GroupRegistry::new("general")
    }

    #[test]
    fn test_create_is_idempotent_failure() {
        let groups = registry();
        groups.create("friends").unwrap();
        assert!(matches!(
            groups.create("friends"),
            Err(Error::GroupExists(_))
        ));
        assert!(groups.names().contains(&"friends".to_string()));
    }

    #[test]
    fn test_one_group_per_nick() {
        let groups = registry();
        groups.create("friends").unwrap();
        groups.create("work").unwrap();
        groups.add("friends", "alice").unwrap();
        groups.add("work", "alice").unwrap();
        assert!(!groups.check("friends", "alice"));
        assert!(groups.check("work", "alice"));
        assert_eq!(groups.find("alice"), "work");
    }

    #[test]
    fn test_find_falls_back_to_default() {
        let groups = registry();
        assert_eq!(groups.find("stranger"), "general");
        groups.create("friends").unwrap();
        groups.add("friends", "bob").unwrap();
        groups.remove("friends", "bob").unwrap();
        assert_eq!(groups.find("bob"), "general");
    }

    #[test]
    fn test_remove_removes_the_nick_not_the_group() {
        let groups = registry();
        groups.create("friends").unwrap();
        groups.add("friends", "bob").unwrap();
        groups.remove("friends", "bob").unwrap();
        assert!(groups.names().contains(&"friends".to_string()));
        assert!(!groups.check("friends", "bob"));
    }

    #[test]
    fn test_delete_refuses_default() {
        let groups = registry();
        assert!(matches!(groups.delete("general"), Err(Error::DefaultGroup)));
        groups.create("friends").unwrap();
        groups.add("friends", "carol").unwrap();
        groups.delete("friends").unwrap();
        assert_eq!(groups.find("carol"), "general");
    }

    #[test]
    fn test_rename_carries_members() {
        let groups = registry();
        groups.create("friends").unwrap();
        groups.add("friends", "dave").unwrap();
        groups.rename("friends", "buddies").unwrap();
        assert!(groups.check("buddies", "dave"));
        assert_eq!(groups.find("dave"), "buddies");
        assert!(matches!(
            groups.rename("friends", "x"),
            Err(Error::UnknownGroup(_))
        ));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let groups = registry();
        groups.create("friends").unwrap();
        groups.add("friends", "erin").unwrap();
        let snapshot = groups.snapshot();

        let restored = registry();
        restored.restore(snapshot);
        assert!(restored.check("friends", "erin"));
        assert_eq!(restored.find("erin"), "friends");
        assert_eq!(restored.find("nobody"), "general");
    }
}
