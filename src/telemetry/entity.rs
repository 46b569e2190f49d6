//! Monitored entity metadata.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

use super::{EntityKey, Sample};

/// What kind of network element an entity is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// PPPoE account (usage + reachability).
    Account,
    /// ONU/ONT optical transceiver.
    Optical,
    /// WAN interface of a core router.
    Wan,
    /// Customer address pinged from the core.
    AccountPing,
    /// ISP uplink probe source.
    IspProbe,
}

/// Which status words an entity reports in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vocabulary {
    /// `stable` / `monitor` / `issue`
    Health,
    /// `up` / `down`
    Reachability,
}

impl EntityKind {
    pub fn vocabulary(self) -> Vocabulary {
        match self {
            EntityKind::Wan | EntityKind::IspProbe => Vocabulary::Reachability,
            EntityKind::Account | EntityKind::Optical | EntityKind::AccountPing => {
                Vocabulary::Health
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Account => "account",
            EntityKind::Optical => "optical",
            EntityKind::Wan => "wan",
            EntityKind::AccountPing => "account_ping",
            EntityKind::IspProbe => "isp_probe",
        }
    }

    /// Best guess for an entity first seen through a sample.
    pub fn infer(sample: &Sample) -> Self {
        if sample.optical.is_some() {
            EntityKind::Optical
        } else if sample.usage.is_some() {
            EntityKind::Account
        } else {
            EntityKind::AccountPing
        }
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" => Ok(EntityKind::Account),
            "optical" => Ok(EntityKind::Optical),
            "wan" => Ok(EntityKind::Wan),
            "account_ping" => Ok(EntityKind::AccountPing),
            "isp_probe" => Ok(EntityKind::IspProbe),
            other => Err(format!("unknown entity kind: {}", other)),
        }
    }
}

/// Display metadata for an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityInfo {
    pub key: EntityKey,
    pub kind: EntityKind,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    /// Transceiver class for optical range overrides.
    #[serde(default)]
    pub device_class: Option<String>,
}

impl EntityInfo {
    pub fn new(key: EntityKey, kind: EntityKind) -> Self {
        Self {
            name: key.to_string(),
            key,
            kind,
            ip: None,
            device_class: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            self.key.as_str()
        } else {
            &self.name
        }
    }
}

/// In-memory registry of known entities.
#[derive(Default)]
pub struct EntityRegistry {
    entries: RwLock<HashMap<EntityKey, EntityInfo>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace metadata. Returns true when something changed.
    pub fn upsert(&self, info: EntityInfo) -> bool {
        let mut entries = self.entries.write();
        match entries.get(&info.key) {
            Some(existing) if *existing == info => false,
            _ => {
                entries.insert(info.key.clone(), info);
                true
            }
        }
    }

    /// Register `key` from its first sample if unknown.
    ///
    /// Returns the new metadata when the entity was auto-registered.
    pub fn ensure(&self, key: &EntityKey, sample: &Sample) -> Option<EntityInfo> {
        if self.entries.read().contains_key(key) {
            return None;
        }
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return None;
        }
        let info = EntityInfo::new(key.clone(), EntityKind::infer(sample));
        entries.insert(key.clone(), info.clone());
        Some(info)
    }

    pub fn get(&self, key: &EntityKey) -> Option<EntityInfo> {
        self.entries.read().get(key).cloned()
    }

    pub fn all(&self) -> Vec<EntityInfo> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn restore(&self, infos: Vec<EntityInfo>) {
        let mut entries = self.entries.write();
        for info in infos {
            entries.insert(info.key.clone(), info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_ensure_registers_once() {
        let registry = EntityRegistry::new();
        let key = EntityKey::new("onu-1").unwrap();
        let sample = Sample::optical(Utc::now(), Some(-20.0), Some(2.0));

        let created = registry.ensure(&key, &sample).unwrap();
        assert_eq!(created.kind, EntityKind::Optical);
        assert_eq!(created.display_name(), "onu-1");
        assert!(registry.ensure(&key, &sample).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_upsert_reports_changes() {
        let registry = EntityRegistry::new();
        let mut info = EntityInfo::new(EntityKey::new("wan1").unwrap(), EntityKind::Wan);
        assert!(registry.upsert(info.clone()));
        assert!(!registry.upsert(info.clone()));

        info.ip = Some("10.0.0.1".to_string());
        assert!(registry.upsert(info));
        assert_eq!(
            registry.get(&EntityKey::new("wan1").unwrap()).unwrap().ip.as_deref(),
            Some("10.0.0.1")
        );
    }

    #[test]
    fn test_vocabulary_by_kind() {
        assert_eq!(EntityKind::Wan.vocabulary(), Vocabulary::Reachability);
        assert_eq!(EntityKind::IspProbe.vocabulary(), Vocabulary::Reachability);
        assert_eq!(EntityKind::Optical.vocabulary(), Vocabulary::Health);
        assert_eq!("account_ping".parse::<EntityKind>().unwrap(), EntityKind::AccountPing);
    }
}
