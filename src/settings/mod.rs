//! Per-bot settings store (`SPEC_FULL.md` §3 added): small feature-flag /
//! key-value knobs not worth a SQLite migration, backed by `redb`.

use crate::error::Result;
use crate::BotId;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;

const SETTINGS_TABLE: TableDefinition<&str, &str> = TableDefinition::new("bot_settings");

pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| anyhow::anyhow!(e))?;
        Ok(Self { db: Arc::new(db) })
    }

    fn key(bot_id: BotId, name: &str) -> String {
        format!("{bot_id}:{name}")
    }

    pub fn get(&self, bot_id: BotId, name: &str) -> Result<Option<String>> {
        let tx = self.db.begin_read().map_err(|e| anyhow::anyhow!(e))?;
        let table = match tx.open_table(SETTINGS_TABLE) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(anyhow::anyhow!(e).into()),
        };
        let key = Self::key(bot_id, name);
        Ok(table
            .get(key.as_str())
            .map_err(|e| anyhow::anyhow!(e))?
            .map(|v| v.value().to_string()))
    }

    pub fn set(&self, bot_id: BotId, name: &str, value: &str) -> Result<()> {
        let tx = self.db.begin_write().map_err(|e| anyhow::anyhow!(e))?;
        {
            let mut table = tx.open_table(SETTINGS_TABLE).map_err(|e| anyhow::anyhow!(e))?;
            let key = Self::key(bot_id, name);
            table
                .insert(key.as_str(), value)
                .map_err(|e| anyhow::anyhow!(e))?;
        }
        tx.commit().map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    pub fn get_bool(&self, bot_id: BotId, name: &str, default: bool) -> Result<bool> {
        Ok(self
            .get(bot_id, name)?
            .map(|v| v == "true")
            .unwrap_or(default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get_roundtrips() {
        let path = std::env::temp_dir().join(format!("meshbot-settings-{}.redb", uuid::Uuid::new_v4()));
        let store = SettingsStore::open(&path).unwrap();
        let bot_id = BotId::new();

        assert_eq!(store.get(bot_id, "reasoning").unwrap(), None);
        store.set(bot_id, "reasoning", "true").unwrap();
        assert_eq!(store.get(bot_id, "reasoning").unwrap(), Some("true".into()));
        assert!(store.get_bool(bot_id, "reasoning", false).unwrap());
    }
}
