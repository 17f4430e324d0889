//! Session id → backend instance table.

use std::collections::HashMap;

use indexmap::IndexMap;
use indexmap::map::Entry;

use crate::backend::{BackendModule, InstanceHandle};
use crate::error::KernelError;

/// One live backend instance, tagged with the generation of the module that created it.
#[derive(Debug)]
pub struct SessionEntry {
    pub instance: InstanceHandle,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct SessionTable {
    entries: IndexMap<String, SessionEntry>,
    aliases: HashMap<String, String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session key `id` routes to, after `attach` aliases.
    pub fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.aliases.get(id).map(String::as_str).unwrap_or(id)
    }

    pub fn get(&self, id: &str) -> Option<&SessionEntry> {
        self.entries.get(self.resolve(id))
    }

    /// Returns the session's entry, creating a backend instance on first use.
    /// Nothing is inserted when creation fails.
    pub fn get_or_create(
        &mut self,
        id: &str,
        backend: &mut dyn BackendModule,
        generation: u64,
    ) -> Result<&mut SessionEntry, KernelError> {
        let key = self.resolve(id).to_string();
        match self.entries.entry(key) {
            Entry::Occupied(entry) => {
                let entry = entry.into_mut();
                debug_assert_eq!(
                    entry.generation, generation,
                    "session instance outlived its backend module"
                );
                Ok(entry)
            }
            Entry::Vacant(slot) => {
                let instance =
                    backend
                        .create_instance()
                        .map_err(|err| KernelError::SessionCreation {
                            session: slot.key().clone(),
                            reason: err.message,
                        })?;
                log::info!(
                    "created backend instance {} for session '{}'",
                    instance.id(),
                    slot.key()
                );
                Ok(slot.insert(SessionEntry {
                    instance,
                    generation,
                }))
            }
        }
    }

    /// Routes `alias` to the instance of the existing session `target`.
    /// Sessions already attached to `alias` follow it to the new target.
    pub fn attach(&mut self, alias: &str, target: &str) -> Result<(), KernelError> {
        let target = self.resolve(target).to_string();
        if !self.entries.contains_key(&target) {
            return Err(KernelError::UnknownSession(target));
        }
        if alias == target {
            self.aliases.remove(alias);
            return Ok(());
        }
        // Alias targets are always entry keys, never other aliases.
        for routed in self.aliases.values_mut() {
            if *routed == alias {
                routed.clone_from(&target);
            }
        }
        self.aliases.insert(alias.to_string(), target);
        Ok(())
    }

    /// Drains every entry in insertion order; the caller frees the instances.
    pub fn remove_all(&mut self) -> Vec<(String, SessionEntry)> {
        self.aliases.clear();
        self.entries.drain(..).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(self.resolve(id))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
