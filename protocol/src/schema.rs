//! DESCRIBE_SCHEMA response body builder (spec §6.2).
//!
//! Built once when the catalog finishes its initial load and served as an
//! immutable `Bytes` blob afterward; table/index layout never changes
//! without a restart.

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyTypeName {
    Int,
    String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexDescriptor {
    pub id: u8,
    pub column: String,
    #[serde(rename = "type")]
    pub key_type: KeyTypeName,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableDescriptor {
    pub id: u8,
    pub name: String,
    pub period: u64,
    pub indexes: Vec<IndexDescriptor>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchemaDocument {
    pub tables: Vec<TableDescriptor>,
}

impl SchemaDocument {
    pub fn to_json_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("schema document is always serializable")
    }
}
