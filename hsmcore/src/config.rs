// hsmcore is the cryptographic core shared by the HSM dispatcher and the
// static channel backup engine of a Lightning-style payment node.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::ConfigError;

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A `NodeConfig` describes the on-disk layout and static infrastructure
/// grants a single node's `hsmd`/`chanbackup` pair loads at startup.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding `hsm_secret`, `emergency.recover` and `scb.tmp`.
    pub data_dir: PathBuf,
    /// Path of the Unix-domain control socket the dispatcher listens on.
    pub socket_path: PathBuf,
    /// Statically known infrastructure clients granted a session at
    /// startup (in addition to the master), keyed by `db_id`.
    pub infra_clients: Vec<InfraClient>,
}

impl NodeConfig {
    pub const DEFAULT_PATH: &'static str = "node.conf";

    /// Loads the configuration file from `path`, rejecting group/world
    /// readable or writable permissions.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut f = File::open(path)?;

        if f.metadata()?.permissions().mode() & 0o077 > 0 {
            return Err(ConfigError::InsecurePerms);
        }

        let mut s = String::new();
        f.read_to_string(&mut s)?;

        Ok(toml::from_str(&s)?)
    }

    /// Saves the configuration to `path` with mode `0600`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let s = toml::to_string_pretty(self)?;

        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;

        write!(f, "{}", s)?;
        Ok(())
    }
}

/// A statically provisioned infrastructure client: a session the
/// dispatcher creates at startup rather than on a `CLIENT_HSMFD` request
/// from the master, identified by `db_id` and granted a fixed capability
/// bitmask.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct InfraClient {
    /// Numeric database id identifying this session; must be nonzero
    /// (`db_id == 0` is reserved for the master).
    pub db_id: u64,
    /// Capability bits granted to this session, as the bitwise-OR of
    /// [`crate::dispatch::Capability`] values.
    pub capabilities: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_toml() {
        let config = NodeConfig {
            data_dir: PathBuf::from("/var/lib/node"),
            socket_path: PathBuf::from("/var/lib/node/hsmd.sock"),
            infra_clients: vec![InfraClient {
                db_id: 1,
                capabilities: 0b0110,
            }],
        };

        let s = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&s).unwrap();
        assert_eq!(config, parsed);
    }
}
