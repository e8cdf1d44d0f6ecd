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

use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LabmeshError;

/// Family carried by relay envelopes between overlay nodes.
pub const CONN_MANAGE_FAMILY: &str = "ConnManage";
pub const SEND_SINGLE_ACTION: &str = "SendSingle";
pub const SEND_GROUP_ACTION: &str = "SendGroup";
pub const SEND_BROADCAST_ACTION: &str = "SendBroadcast";

/// Service names announced in the leading header frame of a connection.
pub const NET_STRUCTURE_SERVICE: &str = "NetStructureService";
pub const PIC_TRANSFER_SERVICE: &str = "PicTransferService";
pub const FILE_DOWNLOAD_SERVICE: &str = "FileDownloadService";
pub const GROUP_FILE_UPLOAD_SERVICE: &str = "GroupFileUploadService";
pub const FILE_SEND_SERVICE: &str = "FileSendService";

/// Task-control frames multiplexed into a file download stream.
pub const TASK_PAUSE: &str = "TaskPause";
pub const TASK_RESTART: &str = "TaskRestart";
pub const TASK_STOP: &str = "TaskStop";

/// Lateral (brother-hop) TTL for routed messages.
pub const MAX_ROUTE_COUNT: u32 = 1;

/// Raw-body chunk size for file-streaming services.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Message mode marking a group session, mirrored in `MessageInfo::mode`.
pub const GROUP_SESSION: i32 = 1;

pub type ConnId = String;

/// A connection's place in the overlay hierarchy.
///
/// Parent, brother and child links are long-lived; a temp link carries
/// one bulk transfer and is torn down at completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkKind {
    Parent,
    Brother,
    Child,
    Temp,
}

impl LinkKind {
    pub const ALL: [LinkKind; 4] = [
        LinkKind::Parent,
        LinkKind::Brother,
        LinkKind::Child,
        LinkKind::Temp,
    ];

    /// The long-lived partitions that make up the overlay proper.
    pub const OVERLAY: [LinkKind; 3] = [LinkKind::Parent, LinkKind::Brother, LinkKind::Child];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Router,
    Member,
}

impl FromStr for Role {
    type Err = LabmeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "master" => Ok(Role::Master),
            "router" => Ok(Role::Router),
            "member" => Ok(Role::Member),
            other => Err(LabmeshError::InvalidRole(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    Single,
    Group,
    Broadcast,
    Random,
}

/// Identity and transport hints for a lab host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDescriptor {
    pub uuid: String,
    pub ip: Ipv4Addr,
    pub mac: String,
}

/// Leading frame of every connection, naming the service the stream
/// will speak. Also the shape of task-control frames, which carry a
/// bare `serviceName`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHeader {
    pub service_name: String,

    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub service_param: Value,
}

impl ServiceHeader {
    pub fn new(name: &str) -> Self {
        Self {
            service_name: name.to_string(),
            service_param: Value::Null,
        }
    }

    pub fn with_param<T: Serialize>(name: &str, param: &T) -> serde_json::Result<Self> {
        Ok(Self {
            service_name: name.to_string(),
            service_param: serde_json::to_value(param)?,
        })
    }
}

/// Picture transfer parameters, carried in the service header and
/// relayed as-is when a group picture fans out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PicParam {
    pub pic_store_name: String,
    pub pic_size: u64,
    pub msg_id: String,
    pub msg_source: String,
    pub msg_dest: String,
    pub msg_type: i32,
    pub msg_date: String,
    pub msg_mode: i32,

    /// Local path of the picture on the sending host.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pic_real_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_count: Option<u32>,
}

/// Group shared-file metadata, carried in the upload service header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFileMeta {
    pub file_name: String,
    pub file_size: u64,
    pub file_group: String,
    pub file_owner: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_count: Option<u32>,
}

/// Download request sent by the consumer; the provider streams the
/// file named here back over the same socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub task_id: String,
    pub file_size: u64,
    pub file_source_path: String,
    pub rsource: String,
    pub rdest: String,
}

/// Direct file send parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSendParam {
    pub file_name: String,
    pub file_size: u64,
}

/// A message handed to the session layer once a transfer lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub id: String,
    pub source: String,
    pub dest: String,
    pub kind: i32,
    pub body: String,
    pub date: String,
    pub mode: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    FileTransfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    New,
    Running,
    Paused,
    Finished,
    Errored,
}

/// Bookkeeping record for a long-lived transfer, owned by the task sink.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub source: String,
    pub dest: String,
    pub kind: TaskKind,
    pub mode: TransferMode,
    pub payload: String,
    pub state: TaskState,
}

impl TaskInfo {
    pub fn transfer(source: String, dest: String, mode: TransferMode, payload: String) -> Self {
        Self {
            source,
            dest,
            kind: TaskKind::FileTransfer,
            mode,
            payload,
            state: TaskState::New,
        }
    }
}

/// A file registered with the group shared-file store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFileInfo {
    pub path: String,
    pub owner: String,
    pub group: String,
}

/// Helpers over the dynamic `{family, action, data, routeCount?}` shape
/// every control frame shares.
pub mod envelope {
    use serde_json::{json, Value};

    pub fn wrap(family: &str, action: &str, data: Value) -> Value {
        json!({
            "family": family,
            "action": action,
            "data": data,
        })
    }

    pub fn family(msg: &Value) -> Option<&str> {
        msg.get("family")?.as_str()
    }

    pub fn action(msg: &Value) -> Option<&str> {
        msg.get("action")?.as_str()
    }

    pub fn route_count(msg: &Value) -> Option<u32> {
        msg.get("routeCount")?.as_u64().map(|c| c as u32)
    }

    pub fn set_route_count(msg: &mut Value, count: u32) {
        if let Value::Object(obj) = msg {
            obj.insert("routeCount".to_string(), count.into());
        }
    }
}
