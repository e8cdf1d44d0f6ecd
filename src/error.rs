// Labmesh - Peer-to-peer instant-messaging and file-sharing overlay for LAN classrooms over a minimal framed protocol
// Copyright (C) 2021  rumblefrog
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LabmeshError {
    #[error("IO error {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Config error {0}")]
    ConfigError(#[from] toml::de::Error),

    #[error("Frame of {0} bytes exceeds the 65535 byte frame limit")]
    FrameTooLarge(usize),

    #[error("Invalid net address {0}")]
    InvalidAddress(#[from] std::net::AddrParseError),

    #[error("Invalid role {0}")]
    InvalidRole(String),

    #[error("Task rejected: {0}")]
    TaskRejected(String),
}

pub type LabmeshResult<T> = std::result::Result<T, LabmeshError>;
