// Labmesh - Peer-to-peer instant-messaging and file-sharing overlay for LAN classrooms over a minimal framed protocol
// Copyright (C) 2021  rumblefrog

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use serde::Deserialize;

use crate::error::LabmeshResult;

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(rename(deserialize = "General"))]
    pub general: General,

    #[serde(rename(deserialize = "Paths"))]
    pub paths: Paths,

    #[serde(rename(deserialize = "Peers"), default)]
    pub peers: Vec<PeerEntry>,
}

impl Config {
    pub fn load(path: &str) -> LabmeshResult<Config> {
        Ok(toml::from_slice(&std::fs::read(path)?)?)
    }
}

#[derive(Deserialize, Debug)]
pub struct General {
    pub bind_address: String,

    /// Well-known TCP port every lab host accepts overlay links on.
    pub tcp_port: u16,

    /// Identity of this host within the lab overlay.
    pub local_uuid: String,

    /// One of "master", "router", "member".
    pub local_role: String,
}

#[derive(Deserialize, Debug)]
pub struct Paths {
    /// Directory received pictures are stored into.
    pub tmp_dir: String,

    /// Directory group-shared files are stored into.
    pub group_dir: String,
}

/// Statically-known lab host, used to seed the directory until the
/// bootstrap layer takes over.
#[derive(Deserialize, Debug)]
pub struct PeerEntry {
    pub uuid: String,
    pub ip: String,
    pub mac: String,

    #[serde(default)]
    pub groups: Vec<String>,
}
