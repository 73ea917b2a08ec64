//! Process-scoped machine registry: installed documents plus the named
//! machines instantiated from them.
//!
//! The registry is an explicit context object; embedders create as many as
//! they want and share one via `Arc` where a process-wide registry is
//! desired. Machines are pumped in registration order and released in
//! reverse registration order on shutdown.

use crate::document::Document;
use crate::error::EngineError;
use crate::machine::Machine;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

/// Shared, lockable reference to a registry-owned machine.
pub type MachineHandle = Arc<Mutex<Machine>>;

/// Documents indexed by name, machines in registration order.
pub struct MachineRegistry {
    documents: RwLock<HashMap<String, Arc<Document>>>,
    machines: RwLock<Vec<(String, MachineHandle)>>,
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            machines: RwLock::new(Vec::new()),
        }
    }

    /// Parses and installs a document under `name`. Re-installing the same
    /// content is an idempotent success (`false`); different content
    /// replaces the entry (`true`) and affects only future
    /// [`MachineRegistry::get_machine`] calls, existing machines keep the
    /// document they were created with.
    pub fn install_document(&self, name: &str, text: &str) -> Result<(u32, bool), EngineError> {
        let doc = Document::parse(name, text)?;
        let checksum = doc.checksum();

        let mut documents = self.documents.write();
        if let Some(existing) = documents.get(name) {
            if existing.checksum() == checksum {
                return Ok((checksum, false));
            }
            tracing::info!(
                document = name,
                "document replaced, existing machines keep the previous content"
            );
        } else {
            tracing::info!(document = name, checksum, "document installed");
        }
        documents.insert(name.to_string(), Arc::new(doc));
        Ok((checksum, true))
    }

    /// The installed document under `name`, if any.
    pub fn document(&self, name: &str) -> Option<Arc<Document>> {
        self.documents.read().get(name).cloned()
    }

    /// Looks up the machine named `name`, creating it from the installed
    /// document on first access.
    pub fn get_machine(&self, name: &str) -> Result<MachineHandle, EngineError> {
        if let Some((_, handle)) = self.machines.read().iter().find(|(n, _)| n == name) {
            return Ok(handle.clone());
        }

        let doc = self
            .documents
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownMachine {
                name: name.to_string(),
            })?;

        let mut machines = self.machines.write();
        // Lost a race with another creator for the same name.
        if let Some((_, existing)) = machines.iter().find(|(n, _)| n == name) {
            return Ok(existing.clone());
        }
        let handle: MachineHandle = Arc::new(Mutex::new(Machine::new(name, doc)));
        machines.push((name.to_string(), handle.clone()));
        tracing::info!(machine = name, "machine created");
        Ok(handle)
    }

    /// Names of instantiated machines, in registration order.
    pub fn machine_names(&self) -> Vec<String> {
        self.machines
            .read()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    pub fn machine_count(&self) -> usize {
        self.machines.read().len()
    }

    /// Drains every machine's queue, in registration order. Stops at the
    /// first engine error.
    pub fn pump_mach_events(&self) -> Result<(), EngineError> {
        let handles: Vec<MachineHandle> = self
            .machines
            .read()
            .iter()
            .map(|(_, h)| h.clone())
            .collect();
        for handle in handles {
            handle.lock().pump_events()?;
        }
        Ok(())
    }

    /// Releases every machine, newest registration first. A machine whose
    /// handle is still held elsewhere is only detached; it is destroyed
    /// when the last handle drops.
    pub fn shutdown(&self) {
        let mut machines = self.machines.write();
        while let Some((name, handle)) = machines.pop() {
            tracing::debug!(machine = %name, "releasing machine");
            drop(handle);
        }
    }
}

impl Default for MachineRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MachineRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
