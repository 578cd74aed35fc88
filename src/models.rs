//! Registry records mirrored from the remote tenant registry
//!
//! All fields are optional on the wire: registry records are partial during
//! migrations and a missing field must never stop a record from mirroring.

use crate::indexed_cache::{FieldMap, Indexed};
use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

/// A tenant's backend configuration
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Instance {
    pub id: String,
    /// Owning user
    pub uid: String,
    /// Owning machine. Empty for tenants still on the legacy fleet.
    #[serde(rename = "machineId")]
    pub machine_id: String,
    pub subdomain: String,
    pub cname: String,
    pub cname_active: bool,
    pub power: bool,
    /// Suspension reason, empty when not suspended
    pub suspension: String,
    pub status: String,
    pub region: String,
    pub version: String,
    pub dev: bool,
    /// Seconds of inactivity before the local backend is stopped. Zero uses the node default.
    #[serde(rename = "idleTtl")]
    pub idle_ttl: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub secrets: HashMap<String, String>,
    pub updated: String,
}

impl Instance {
    pub fn is_legacy(&self) -> bool {
        self.machine_id.is_empty()
    }

    pub fn is_suspended(&self) -> bool {
        !self.suspension.is_empty()
    }
}

impl Indexed for Instance {
    fn field_map(&self) -> FieldMap {
        vec![
            ("id", self.id.clone()),
            ("cname", self.cname.clone()),
            ("subdomain", self.subdomain.clone()),
        ]
    }
}

/// An account owning instances
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub email: String,
    pub username: String,
    pub verified: bool,
    pub double_verified: bool,
    /// Suspension reason, empty when not suspended
    pub suspension: String,
    pub updated: String,
}

impl User {
    pub fn is_suspended(&self) -> bool {
        !self.suspension.is_empty()
    }
}

impl Indexed for User {
    fn field_map(&self) -> FieldMap {
        vec![
            ("id", self.id.clone()),
            ("email", self.email.clone()),
            ("username", self.username.clone()),
        ]
    }
}

/// A node that hosts instances
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(default)]
pub struct Machine {
    pub id: String,
    pub name: String,
    pub uuid: String,
    pub region: String,
    /// Base URL of the node on the private network, e.g. `http://10.0.0.5:8080`
    #[serde(rename = "privateUrl")]
    pub private_url: String,
}

impl Indexed for Machine {
    fn field_map(&self) -> FieldMap {
        vec![
            ("id", self.id.clone()),
            ("name", self.name.clone()),
            ("uuid", self.uuid.clone()),
            ("privateUrl", self.private_url.clone()),
        ]
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
