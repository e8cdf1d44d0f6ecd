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

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::PeerEntry;
use crate::error::LabmeshResult;
use crate::protocol::{
    LinkKind, MessageInfo, PeerDescriptor, Role, SharedFileInfo, TaskInfo, TaskState,
};

/// Supplies local identity and role; told when overlay links come and go.
///
/// Implementations are called from the overlay loop and must not block.
pub trait Topology: Send + Sync {
    fn local_uuid(&self) -> String;

    fn local_role(&self) -> Role;

    fn neighbors_changed(&self, uuid: &str, kind: LinkKind, joined: bool);
}

/// User address lookup and per-user group membership.
pub trait Directory: Send + Sync {
    fn get_user(&self, uuid: &str) -> Option<PeerDescriptor>;

    fn list_join_group(&self, uuid: &str) -> Vec<String>;
}

/// Delivery point for messages that have finished arriving.
pub trait SessionSink: Send + Sync {
    fn create_message(&self, info: MessageInfo, is_local_origin: bool);
}

/// Bookkeeping for long-lived transfers.
pub trait TaskSink: Send + Sync {
    /// Register a task; returns the minted task id.
    fn create_task(&self, task: TaskInfo) -> LabmeshResult<String>;

    fn pause_task(&self, id: &str);

    fn restore_task(&self, id: &str);

    fn finish_task(&self, id: &str);

    fn error_task(&self, id: &str);
}

/// Registry of files shared into a group space.
pub trait SharedFileStore: Send + Sync {
    fn add_shared_file(&self, file: SharedFileInfo);
}

/// Neighbor-table maintenance for freshly learned transport hints.
pub trait ArpTable: Send + Sync {
    fn set_host_arp(&self, ip: Ipv4Addr, mac: &str);
}

/// Collaborator handles threaded through the overlay and every
/// connection task in place of process-global singletons.
#[derive(Clone)]
pub struct Ctx {
    pub topology: Arc<dyn Topology>,
    pub directory: Arc<dyn Directory>,
    pub sessions: Arc<dyn SessionSink>,
    pub tasks: Arc<dyn TaskSink>,
    pub shared_files: Arc<dyn SharedFileStore>,
    pub arp: Arc<dyn ArpTable>,

    /// Directory received pictures are stored into.
    pub tmp_dir: PathBuf,

    /// Directory group-shared files are stored into.
    pub group_dir: PathBuf,

    /// Well-known TCP port every lab host accepts overlay links on.
    pub tcp_port: u16,
}

/// Fixed identity from the config file; stands in for the role-election
/// layer.
pub struct StaticTopology {
    uuid: String,
    role: Role,
}

impl StaticTopology {
    pub fn new(uuid: String, role: Role) -> Self {
        Self { uuid, role }
    }
}

impl Topology for StaticTopology {
    fn local_uuid(&self) -> String {
        self.uuid.clone()
    }

    fn local_role(&self) -> Role {
        self.role
    }

    fn neighbors_changed(&self, uuid: &str, kind: LinkKind, joined: bool) {
        debug!(
            "Neighbor set changed (uuid = {}) (kind = {:?}) (joined = {})",
            uuid, kind, joined
        );
    }
}

/// Directory seeded from the `[[Peers]]` config section.
pub struct StaticDirectory {
    peers: HashMap<String, (PeerDescriptor, Vec<String>)>,
}

impl StaticDirectory {
    pub fn from_entries(entries: &[PeerEntry]) -> LabmeshResult<Self> {
        let mut peers = HashMap::new();

        for entry in entries {
            let descriptor = PeerDescriptor {
                uuid: entry.uuid.clone(),
                ip: entry.ip.parse()?,
                mac: entry.mac.clone(),
            };

            peers.insert(entry.uuid.clone(), (descriptor, entry.groups.clone()));
        }

        Ok(Self { peers })
    }
}

impl Directory for StaticDirectory {
    fn get_user(&self, uuid: &str) -> Option<PeerDescriptor> {
        self.peers.get(uuid).map(|(descriptor, _)| descriptor.clone())
    }

    fn list_join_group(&self, uuid: &str) -> Vec<String> {
        self.peers
            .get(uuid)
            .map(|(_, groups)| groups.clone())
            .unwrap_or_default()
    }
}

/// Session sink that surfaces arrivals in the log; a real host wires
/// its UI layer here instead.
pub struct LogSessionSink;

impl SessionSink for LogSessionSink {
    fn create_message(&self, info: MessageInfo, is_local_origin: bool) {
        info!(
            "Message stored (id = {}) (source = {}) (dest = {}) (local = {})",
            info.id, info.source, info.dest, is_local_origin
        );
    }
}

/// In-memory task ledger; mints ids and tracks state transitions.
pub struct MemoryTaskSink {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<String, TaskState>>,
}

impl MemoryTaskSink {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn set_state(&self, id: &str, state: TaskState) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(current) = tasks.get_mut(id) {
            *current = state;
            debug!("Task state changed (id = {}) (state = {:?})", id, state);
        }
    }
}

impl TaskSink for MemoryTaskSink {
    fn create_task(&self, task: TaskInfo) -> LabmeshResult<String> {
        let id = format!("task-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(id.clone(), TaskState::Running);

        info!(
            "Task created (id = {}) (source = {}) (dest = {}) (mode = {:?})",
            id, task.source, task.dest, task.mode
        );

        Ok(id)
    }

    fn pause_task(&self, id: &str) {
        self.set_state(id, TaskState::Paused);
    }

    fn restore_task(&self, id: &str) {
        self.set_state(id, TaskState::Running);
    }

    fn finish_task(&self, id: &str) {
        self.set_state(id, TaskState::Finished);
    }

    fn error_task(&self, id: &str) {
        self.set_state(id, TaskState::Errored);
    }
}

/// In-memory shared-file registry.
pub struct MemorySharedFileStore {
    files: Mutex<Vec<SharedFileInfo>>,
}

impl MemorySharedFileStore {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(Vec::new()),
        }
    }
}

impl SharedFileStore for MemorySharedFileStore {
    fn add_shared_file(&self, file: SharedFileInfo) {
        info!(
            "Shared file registered (path = {}) (owner = {}) (group = {})",
            file.path, file.owner, file.group
        );

        let mut files = self.files.lock().unwrap_or_else(|e| e.into_inner());
        files.push(file);
    }
}

/// ARP adapter that records the hint in the log; a privileged host
/// implementation would program the neighbor table instead.
pub struct LogArpTable;

impl ArpTable for LogArpTable {
    fn set_host_arp(&self, ip: Ipv4Addr, mac: &str) {
        debug!("ARP hint recorded (ip = {}) (mac = {})", ip, mac);
    }
}
