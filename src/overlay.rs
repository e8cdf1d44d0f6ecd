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

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::select;
use tokio::sync::{mpsc, oneshot};

use serde_json::Value;

use crate::codec;
use crate::connection::{ConnCmd, ConnHandle, Connection};
use crate::error::LabmeshResult;
use crate::protocol::{
    envelope, ConnId, GroupFileMeta, LinkKind, PeerDescriptor, PicParam, Role, TransferMode,
    CONN_MANAGE_FAMILY, MAX_ROUTE_COUNT, SEND_BROADCAST_ACTION, SEND_GROUP_ACTION,
    SEND_SINGLE_ACTION,
};
use crate::service::Service;
use crate::sinks::Ctx;

/// Events and commands funnelled into the overlay loop.
///
/// Connection tasks report lifecycle and decoded frames; handles post
/// application commands. Everything is applied on the loop, so the
/// partitions and dispatch tables are never touched concurrently.
pub enum Message {
    /// Outbound connect completed; index the connection.
    Opened {
        id: ConnId,
        kind: LinkKind,
        handle: ConnHandle,
    },

    /// Connection task exited.
    Closed { id: ConnId },

    /// Decoded control frame, headed for family dispatch.
    Envelope { id: ConnId, msg: Value },

    /// Originate an enveloped message into the overlay.
    SendAction {
        mode: TransferMode,
        family: String,
        action: String,
        data: Value,
    },

    /// Enqueue a frame for one known connection.
    SendTo { id: ConnId, msg: Value },

    /// Dial a peer and bind the given service to the new link.
    Connect {
        kind: LinkKind,
        id: Option<ConnId>,
        peer: PeerDescriptor,
        service: Service,
        notify: Option<oneshot::Sender<LabmeshResult<ConnId>>>,
    },

    Pause { id: ConnId },

    Restore { id: ConnId },

    Stop { id: ConnId },

    Progress {
        id: ConnId,
        reply: oneshot::Sender<Option<u8>>,
    },

    /// Look up the peer descriptor a connection was admitted with.
    PeerInfo {
        id: ConnId,
        reply: oneshot::Sender<Option<PeerDescriptor>>,
    },

    /// Bootstrap learned a temp connection's identity; move it into
    /// its overlay partition.
    Classify {
        id: ConnId,
        uuid: String,
        kind: LinkKind,
    },

    /// Group membership changed in the directory.
    GroupsChanged,

    /// Fan a received or originated group picture out over temp links.
    UploadPicToGroup {
        group_id: String,
        param: PicParam,
        is_route: bool,
    },

    /// Push a local file into a group space.
    ShareGroupFile { path: PathBuf, group_id: String },

    /// Relay a landed group file one brother hop further.
    UploadGroupFile { meta: GroupFileMeta },
}

pub type Handler = Arc<dyn Fn(&mut Overlay, Value, Option<ConnId>) + Send + Sync>;

/// Registry of overlay links and the routing engine over them.
///
/// Owns the listener, the four link partitions and the family/action
/// dispatch tables, all driven from a single event loop.
pub struct Overlay {
    /// TCP listener bind for the overlay's well-known port.
    listener: TcpListener,

    /// Link partitions. BTreeMap keeps neighbor enumeration (and so
    /// "first neighbor" tie-breaks) deterministic for a given set.
    conns: HashMap<LinkKind, BTreeMap<ConnId, ConnHandle>>,

    families: HashMap<String, Handler>,
    actions: HashMap<String, Handler>,

    /// uuid -> joined groups, rebuilt lazily after neighbor or
    /// membership changes.
    group_map: HashMap<String, HashSet<String>>,
    group_map_dirty: bool,

    ctx: Ctx,

    /// Loop ingress; cloned into handles and connection tasks.
    tx: mpsc::UnboundedSender<Message>,
    rx: mpsc::UnboundedReceiver<Message>,

    temp_conn_id: Arc<AtomicU64>,
}

/// Cloneable command face of a running overlay.
#[derive(Clone)]
pub struct OverlayHandle {
    tx: mpsc::UnboundedSender<Message>,
}

impl Overlay {
    pub async fn bind<A>(addr: A, ctx: Ctx) -> LabmeshResult<(Overlay, OverlayHandle)>
    where
        A: ToSocketAddrs,
    {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut conns = HashMap::new();
        for kind in &LinkKind::ALL {
            conns.insert(*kind, BTreeMap::new());
        }

        let mut overlay = Overlay {
            listener: TcpListener::bind(addr).await?,
            conns,
            families: HashMap::new(),
            actions: HashMap::new(),
            group_map: HashMap::new(),
            group_map_dirty: true,
            ctx,
            tx: tx.clone(),
            rx,
            temp_conn_id: Arc::new(AtomicU64::new(0)),
        };

        overlay.register_family_handler(
            CONN_MANAGE_FAMILY,
            Arc::new(|overlay, msg, conn| overlay.dispatch_action(msg, conn)),
        );

        overlay.register_action_handler(
            SEND_SINGLE_ACTION,
            Arc::new(|overlay, msg, _| overlay.send_single_msg(msg, false)),
        );
        overlay.register_action_handler(
            SEND_GROUP_ACTION,
            Arc::new(|overlay, msg, _| overlay.send_group_msg(msg, false)),
        );
        overlay.register_action_handler(
            SEND_BROADCAST_ACTION,
            Arc::new(|overlay, msg, _| overlay.send_broadcast_msg(msg, false)),
        );

        Ok((overlay, OverlayHandle { tx }))
    }

    pub fn register_family_handler(&mut self, family: &str, handler: Handler) {
        self.families.insert(family.to_string(), handler);
    }

    pub fn register_action_handler(&mut self, action: &str, handler: Handler) {
        self.actions.insert(action.to_string(), handler);
    }

    /// Start the event loop: admit inbound links, apply connection
    /// events and handle commands until interrupted.
    pub async fn up(&mut self) -> LabmeshResult<()> {
        info!(
            "Started processing connections (local = {}) (role = {:?})",
            self.ctx.topology.local_uuid(),
            self.ctx.topology.local_role()
        );

        loop {
            select! {
                _ = tokio::signal::ctrl_c() => {
                    return Ok(());
                }
                Ok((stream, addr)) = self.listener.accept() => {
                    self.admit(stream, addr);
                }
                Some(message) = self.rx.recv() => {
                    self.handle(message);
                }
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Opened { id, kind, handle } => self.register(id, kind, handle),
            Message::Closed { id } => self.unregister(&id),
            Message::Envelope { id, msg } => self.dispatch_family(msg, Some(id)),
            Message::SendAction {
                mode,
                family,
                action,
                data,
            } => self.send_action_msg(mode, &family, &action, data),
            Message::SendTo { id, msg } => self.send_to(&id, &msg),
            Message::Connect {
                kind,
                id,
                peer,
                service,
                notify,
            } => self.connect_peer(kind, id, peer, service, notify),
            Message::Pause { id } => {
                if let Some((_, handle)) = self.find(&id) {
                    let _ = handle.tx_cmd.send(ConnCmd::Pause);
                }
            }
            Message::Restore { id } => {
                if let Some((_, handle)) = self.find(&id) {
                    let _ = handle.tx_cmd.send(ConnCmd::Restore);
                }
            }
            Message::Stop { id } => self.stop_conn(&id),
            Message::Progress { id, reply } => {
                let pct = self
                    .find(&id)
                    .map(|(_, handle)| handle.progress.load(Ordering::Relaxed));
                let _ = reply.send(pct);
            }
            Message::PeerInfo { id, reply } => {
                let peer = self.find(&id).map(|(_, handle)| handle.peer.clone());
                let _ = reply.send(peer);
            }
            Message::Classify { id, uuid, kind } => self.classify(&id, uuid, kind),
            Message::GroupsChanged => self.group_map_dirty = true,
            Message::UploadPicToGroup {
                group_id,
                param,
                is_route,
            } => self.upload_pic_to_group(&group_id, param, is_route),
            Message::ShareGroupFile { path, group_id } => {
                self.upload_group_file_origin(path, group_id)
            }
            Message::UploadGroupFile { meta } => self.upload_group_file_relay(meta),
        }
    }

    /// Index an accepted socket as a temp link speaking the control
    /// greeting; the bootstrap layer reclassifies it once identity is
    /// known.
    fn admit(&mut self, stream: TcpStream, addr: SocketAddr) {
        let id = self.mint_temp_id();

        debug!("Peer has connected (id = {}) (addr = {})", id, addr);

        let ip = match addr.ip() {
            IpAddr::V4(ip) => ip,
            IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
        };

        let peer = PeerDescriptor {
            uuid: String::new(),
            ip,
            mac: String::new(),
        };

        let (handle, conn) = Connection::open(
            id.clone(),
            peer,
            stream,
            Service::control_receiver(),
            self.tx.clone(),
            self.ctx.clone(),
        );

        self.register(id, LinkKind::Temp, handle);
        tokio::spawn(conn.run());
    }

    fn mint_temp_id(&self) -> ConnId {
        format!("{}", self.temp_conn_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn register(&mut self, id: ConnId, kind: LinkKind, handle: ConnHandle) {
        info!("Connection registered (id = {}) (kind = {:?})", id, kind);

        self.conns.entry(kind).or_default().insert(id.clone(), handle);

        if kind != LinkKind::Temp {
            self.group_map_dirty = true;
            self.ctx.topology.neighbors_changed(&id, kind, true);
        }
    }

    fn unregister(&mut self, id: &str) {
        for kind in &LinkKind::ALL {
            if let Some(conns) = self.conns.get_mut(kind) {
                if conns.remove(id).is_some() {
                    debug!("Connection unregistered (id = {}) (kind = {:?})", id, kind);

                    if *kind != LinkKind::Temp {
                        self.group_map_dirty = true;
                        self.ctx.topology.neighbors_changed(id, *kind, false);
                    }

                    return;
                }
            }
        }
    }

    fn find(&self, id: &str) -> Option<(LinkKind, &ConnHandle)> {
        for kind in &LinkKind::ALL {
            if let Some(handle) = self.conns[kind].get(id) {
                return Some((*kind, handle));
            }
        }

        None
    }

    fn stop_conn(&mut self, id: &str) {
        if let Some((_, handle)) = self.find(id) {
            let _ = handle.tx_shutdown.send(true);
        }

        self.unregister(id);
    }

    fn classify(&mut self, id: &str, uuid: String, kind: LinkKind) {
        let mut taken = None;

        for k in &LinkKind::ALL {
            if let Some(conns) = self.conns.get_mut(k) {
                if let Some(handle) = conns.remove(id) {
                    taken = Some(handle);
                    break;
                }
            }
        }

        match taken {
            Some(handle) => {
                info!(
                    "Connection classified (id = {}) (uuid = {}) (kind = {:?})",
                    id, uuid, kind
                );
                self.register(uuid, kind, handle);
            }
            None => debug!("Classify for unknown connection ignored (id = {})", id),
        }
    }

    /// Dial `peer` on the well-known port and bind `service` to the
    /// link. Registration happens on success; failure is reported
    /// through `notify` and the log.
    fn connect_peer(
        &mut self,
        kind: LinkKind,
        id: Option<ConnId>,
        peer: PeerDescriptor,
        service: Service,
        notify: Option<oneshot::Sender<LabmeshResult<ConnId>>>,
    ) {
        let id = id.unwrap_or_else(|| self.mint_temp_id());

        self.ctx.arp.set_host_arp(peer.ip, &peer.mac);

        let events = self.tx.clone();
        let ctx = self.ctx.clone();
        let port = self.ctx.tcp_port;

        tokio::spawn(async move {
            match TcpStream::connect((peer.ip, port)).await {
                Ok(stream) => {
                    debug!("Peer link established (id = {}) (addr = {})", id, peer.ip);

                    let (handle, conn) =
                        Connection::open(id.clone(), peer, stream, service, events.clone(), ctx);

                    let _ = events.send(Message::Opened {
                        id: id.clone(),
                        kind,
                        handle,
                    });

                    if let Some(notify) = notify {
                        let _ = notify.send(Ok(id));
                    }

                    conn.run().await;
                }
                Err(e) => {
                    warn!(
                        "Peer connect failed (id = {}) (addr = {}): {}",
                        id, peer.ip, e
                    );

                    if let Some(notify) = notify {
                        let _ = notify.send(Err(e.into()));
                    }
                }
            }
        });
    }

    /// Encode and enqueue a frame for one connection; unknown ids are
    /// a silent no-op.
    fn send_to(&self, id: &str, msg: &Value) {
        if let Some((_, handle)) = self.find(id) {
            Self::push_frame(id, handle, msg);
        }
    }

    fn send_on(&self, kind: LinkKind, id: &str, msg: &Value) {
        if let Some(handle) = self.conns[&kind].get(id) {
            Self::push_frame(id, handle, msg);
        }
    }

    fn first_in(&self, kind: LinkKind) -> Option<(&str, &ConnHandle)> {
        self.conns[&kind]
            .iter()
            .next()
            .map(|(id, handle)| (id.as_str(), handle))
    }

    fn push_frame(id: &str, handle: &ConnHandle, msg: &Value) {
        match codec::encode(msg) {
            Ok(bytes) => {
                if handle.tx_cmd.send(ConnCmd::Send(bytes)).is_err() {
                    debug!("Connection writer gone (id = {})", id);
                }
            }
            Err(e) => warn!("Frame encode failed (id = {}): {}", id, e),
        }
    }

    pub fn dispatch_family(&mut self, msg: Value, conn: Option<ConnId>) {
        let family = match envelope::family(&msg) {
            Some(family) => family.to_string(),
            None => {
                debug!("Frame without family ignored");
                return;
            }
        };

        match self.families.get(&family).cloned() {
            Some(handler) => handler(self, msg, conn),
            None => debug!("No handler for family (family = {})", family),
        }
    }

    pub fn dispatch_action(&mut self, msg: Value, conn: Option<ConnId>) {
        let action = match envelope::action(&msg) {
            Some(action) => action.to_string(),
            None => {
                debug!("Frame without action ignored");
                return;
            }
        };

        match self.actions.get(&action).cloned() {
            Some(handler) => handler(self, msg, conn),
            None => debug!("No handler for action (action = {})", action),
        }
    }

    /// Envelope `data` and route it by `mode`.
    pub fn send_action_msg(&mut self, mode: TransferMode, family: &str, action: &str, data: Value) {
        let msg = envelope::wrap(family, action, data);

        match mode {
            TransferMode::Single => self.send_single_msg(msg, true),
            TransferMode::Group => self.send_group_msg(msg, true),
            TransferMode::Broadcast => self.send_broadcast_msg(msg, true),
            TransferMode::Random => self.send_random_msg(msg),
        }
    }

    /// Route a single-destination message. The origin (`is_repackage`)
    /// wraps it in a relay envelope; relays forward as-is, touching
    /// only the routeCount TTL.
    fn send_single_msg(&mut self, mut msg: Value, is_repackage: bool) {
        debug!("Single message (origin = {})", is_repackage);

        let data = if is_repackage {
            msg.get("data").cloned()
        } else {
            msg.get("data").and_then(|d| d.get("data")).cloned()
        };

        let dest = match data.as_ref().and_then(|d| d.get("dest")).and_then(Value::as_str) {
            Some(dest) => dest.to_string(),
            None => {
                debug!("Single message without dest dropped");
                return;
            }
        };

        if dest == self.ctx.topology.local_uuid() {
            let inner = if is_repackage {
                msg
            } else {
                msg.get_mut("data").map(Value::take).unwrap_or(Value::Null)
            };

            self.dispatch_family(inner, None);
            return;
        }

        let mut send_msg = if is_repackage {
            envelope::wrap(CONN_MANAGE_FAMILY, SEND_SINGLE_ACTION, msg)
        } else {
            msg
        };

        match self.ctx.topology.local_role() {
            Role::Master => {
                if self.conns[&LinkKind::Child].contains_key(&dest) {
                    self.send_on(LinkKind::Child, &dest, &send_msg);
                } else {
                    debug!("Single message to unknown child dropped (dest = {})", dest);
                }
            }
            Role::Router => {
                if self.conns[&LinkKind::Child].contains_key(&dest) {
                    self.send_on(LinkKind::Child, &dest, &send_msg);
                    return;
                }

                let first_hop = envelope::route_count(&send_msg).is_none();
                let hops = envelope::route_count(&send_msg).unwrap_or(0) + 1;
                envelope::set_route_count(&mut send_msg, hops);

                if first_hop && self.conns[&LinkKind::Parent].contains_key(&dest) {
                    self.send_on(LinkKind::Parent, &dest, &send_msg);
                    return;
                }

                if hops > MAX_ROUTE_COUNT {
                    debug!("Single message past brother TTL dropped (dest = {})", dest);
                    return;
                }

                if let Some((id, handle)) = self.first_in(LinkKind::Brother) {
                    Self::push_frame(id, handle, &send_msg);
                }
            }
            Role::Member => {
                if is_repackage {
                    if let Some((id, handle)) = self.first_in(LinkKind::Parent) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }
            }
        }
    }

    /// Route a group message: deliver locally when this host is in the
    /// group, then fan out along group membership.
    fn send_group_msg(&mut self, msg: Value, is_repackage: bool) {
        debug!("Group message (origin = {})", is_repackage);

        self.refresh_group_map();

        let data = if is_repackage {
            msg.get("data").cloned()
        } else {
            msg.get("data").and_then(|d| d.get("data")).cloned()
        };

        let group_id = match data.as_ref().and_then(|d| d.get("dest")).and_then(Value::as_str) {
            Some(group_id) => group_id.to_string(),
            None => {
                debug!("Group message without dest dropped");
                return;
            }
        };

        let local = self.ctx.topology.local_uuid();
        if self.in_group(&local, &group_id) {
            let inner = if is_repackage {
                msg.clone()
            } else {
                msg.get("data").cloned().unwrap_or(Value::Null)
            };

            self.dispatch_family(inner, None);
        }

        let mut send_msg = if is_repackage {
            envelope::wrap(CONN_MANAGE_FAMILY, SEND_GROUP_ACTION, msg)
        } else {
            msg
        };

        match self.ctx.topology.local_role() {
            Role::Master => {
                if is_repackage {
                    if let Some((id, handle)) = self.first_in(LinkKind::Child) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }
            }
            Role::Router => {
                let first_hop = envelope::route_count(&send_msg).is_none();
                let hops = envelope::route_count(&send_msg).unwrap_or(0) + 1;
                envelope::set_route_count(&mut send_msg, hops);

                if first_hop {
                    for (id, handle) in &self.conns[&LinkKind::Parent] {
                        if self.in_group(id, &group_id) {
                            Self::push_frame(id, handle, &send_msg);
                        }
                    }
                }

                for (id, handle) in &self.conns[&LinkKind::Child] {
                    if self.in_group(id, &group_id) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }

                if hops <= MAX_ROUTE_COUNT {
                    if let Some((id, handle)) = self.first_in(LinkKind::Brother) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }
            }
            Role::Member => {
                if is_repackage {
                    if let Some((id, handle)) = self.first_in(LinkKind::Parent) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }
            }
        }
    }

    /// Route a broadcast: always delivered locally; routers flood
    /// parents and children and pass it one brother hop within the TTL.
    fn send_broadcast_msg(&mut self, msg: Value, is_repackage: bool) {
        debug!("Broadcast message (origin = {})", is_repackage);

        let inner = if is_repackage {
            msg.clone()
        } else {
            msg.get("data").cloned().unwrap_or(Value::Null)
        };
        self.dispatch_family(inner, None);

        let mut send_msg = if is_repackage {
            envelope::wrap(CONN_MANAGE_FAMILY, SEND_BROADCAST_ACTION, msg)
        } else {
            msg
        };

        match self.ctx.topology.local_role() {
            Role::Master => {
                if is_repackage {
                    if let Some((id, handle)) = self.first_in(LinkKind::Child) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }
            }
            Role::Router => {
                let hops = envelope::route_count(&send_msg).unwrap_or(0) + 1;
                envelope::set_route_count(&mut send_msg, hops);

                for (id, handle) in &self.conns[&LinkKind::Parent] {
                    Self::push_frame(id, handle, &send_msg);
                }

                for (id, handle) in &self.conns[&LinkKind::Child] {
                    Self::push_frame(id, handle, &send_msg);
                }

                if hops <= MAX_ROUTE_COUNT {
                    if let Some((id, handle)) = self.first_in(LinkKind::Brother) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }
            }
            Role::Member => {
                if is_repackage {
                    if let Some((id, handle)) = self.first_in(LinkKind::Parent) {
                        Self::push_frame(id, handle, &send_msg);
                    }
                }
            }
        }
    }

    /// Single hop to an arbitrary neighbor; no relay envelope and no
    /// TTL.
    fn send_random_msg(&mut self, msg: Value) {
        debug!("Random message");

        let kind = match self.ctx.topology.local_role() {
            Role::Master => LinkKind::Child,
            Role::Router => LinkKind::Brother,
            Role::Member => LinkKind::Parent,
        };

        if let Some((id, handle)) = self.first_in(kind) {
            Self::push_frame(id, handle, &msg);
        }
    }

    fn in_group(&self, uuid: &str, group_id: &str) -> bool {
        self.group_map
            .get(uuid)
            .map_or(false, |groups| groups.contains(group_id))
    }

    /// Rebuild the membership cache from the directory: one entry per
    /// overlay neighbor plus the local host.
    fn refresh_group_map(&mut self) {
        if !self.group_map_dirty {
            return;
        }

        let mut map = HashMap::new();

        for kind in &LinkKind::OVERLAY {
            for id in self.conns[kind].keys() {
                map.insert(
                    id.clone(),
                    self.ctx.directory.list_join_group(id).into_iter().collect(),
                );
            }
        }

        let local = self.ctx.topology.local_uuid();
        map.insert(
            local.clone(),
            self.ctx.directory.list_join_group(&local).into_iter().collect(),
        );

        self.group_map = map;
        self.group_map_dirty = false;

        debug!("Group membership cache rebuilt (entries = {})", self.group_map.len());
    }

    /// Fan a group picture out over temp links, one transfer per
    /// destination, following the same membership rules as group
    /// routing but carrying a live file body.
    fn upload_pic_to_group(&mut self, group_id: &str, mut param: PicParam, is_route: bool) {
        self.refresh_group_map();

        let mut dest_nodes: Vec<ConnId> = Vec::new();

        match self.ctx.topology.local_role() {
            Role::Master => {
                if !is_route {
                    if let Some((id, _)) = self.first_in(LinkKind::Child) {
                        dest_nodes.push(id.to_string());
                    }
                }
            }
            Role::Router => {
                let first_hop = param.route_count.is_none();
                let hops = param.route_count.unwrap_or(0) + 1;
                param.route_count = Some(hops);

                if first_hop {
                    for id in self.conns[&LinkKind::Parent].keys() {
                        if self.in_group(id, group_id) {
                            dest_nodes.push(id.clone());
                        }
                    }
                }

                for id in self.conns[&LinkKind::Child].keys() {
                    if self.in_group(id, group_id) {
                        dest_nodes.push(id.clone());
                    }
                }

                if hops <= MAX_ROUTE_COUNT {
                    if let Some((id, _)) = self.first_in(LinkKind::Brother) {
                        dest_nodes.push(id.to_string());
                    }
                }
            }
            Role::Member => {
                if !is_route {
                    if let Some((id, _)) = self.first_in(LinkKind::Parent) {
                        dest_nodes.push(id.to_string());
                    }
                }
            }
        }

        let pic_path = match &param.pic_real_name {
            Some(path) => PathBuf::from(path),
            None => {
                warn!("Picture fan-out without a local path dropped (group = {})", group_id);
                return;
            }
        };

        for node in dest_nodes {
            match self.ctx.directory.get_user(&node) {
                Some(peer) => {
                    let service = Service::pic_sender(pic_path.clone(), param.clone());
                    self.connect_peer(LinkKind::Temp, None, peer, service, None);
                }
                None => debug!("Picture fan-out to unknown user dropped (uuid = {})", node),
            }
        }
    }

    /// Push a local file into its group space: members and masters hand
    /// it toward a router, a router stores it with itself.
    fn upload_group_file_origin(&mut self, path: PathBuf, group_id: String) {
        self.refresh_group_map();

        let dest = match self.ctx.topology.local_role() {
            Role::Master => self.first_in(LinkKind::Child).map(|(id, _)| id.to_string()),
            Role::Router => Some(self.ctx.topology.local_uuid()),
            Role::Member => self.first_in(LinkKind::Parent).map(|(id, _)| id.to_string()),
        };

        let dest = match dest {
            Some(dest) if !dest.is_empty() => dest,
            _ => {
                debug!("Group file upload without a destination dropped (group = {})", group_id);
                return;
            }
        };

        match self.ctx.directory.get_user(&dest) {
            Some(peer) => {
                let service = Service::group_upload_origin(path, group_id);
                self.connect_peer(LinkKind::Temp, None, peer, service, None);
            }
            None => debug!("Group file upload to unknown user dropped (uuid = {})", dest),
        }
    }

    /// Relay a landed group file one brother hop further, within the
    /// TTL. Only routers take part.
    fn upload_group_file_relay(&mut self, mut meta: GroupFileMeta) {
        if self.ctx.topology.local_role() != Role::Router {
            return;
        }

        let hops = meta.route_count.unwrap_or(0) + 1;
        meta.route_count = Some(hops);

        if hops > MAX_ROUTE_COUNT {
            debug!("Group file relay past brother TTL dropped (file = {})", meta.file_name);
            return;
        }

        let dest = match self.first_in(LinkKind::Brother) {
            Some((id, _)) => id.to_string(),
            None => return,
        };

        match self.ctx.directory.get_user(&dest) {
            Some(peer) => {
                let service = Service::group_upload_relay(meta, &self.ctx.group_dir);
                self.connect_peer(LinkKind::Temp, None, peer, service, None);
            }
            None => debug!("Group file relay to unknown user dropped (uuid = {})", dest),
        }
    }
}

impl OverlayHandle {
    pub fn send_action_msg(&self, mode: TransferMode, family: &str, action: &str, data: Value) {
        let _ = self.tx.send(Message::SendAction {
            mode,
            family: family.to_string(),
            action: action.to_string(),
            data,
        });
    }

    pub fn send_to(&self, id: &str, msg: Value) {
        let _ = self.tx.send(Message::SendTo {
            id: id.to_string(),
            msg,
        });
    }

    /// Dial a peer and bind `service` to the link; resolves with the
    /// connection id once the link is up.
    pub fn connect_peer(
        &self,
        kind: LinkKind,
        id: Option<ConnId>,
        peer: PeerDescriptor,
        service: Service,
    ) -> oneshot::Receiver<LabmeshResult<ConnId>> {
        let (tx, rx) = oneshot::channel();

        let _ = self.tx.send(Message::Connect {
            kind,
            id,
            peer,
            service,
            notify: Some(tx),
        });

        rx
    }

    pub fn pause(&self, id: &str) {
        let _ = self.tx.send(Message::Pause { id: id.to_string() });
    }

    pub fn restore(&self, id: &str) {
        let _ = self.tx.send(Message::Restore { id: id.to_string() });
    }

    pub fn stop(&self, id: &str) {
        let _ = self.tx.send(Message::Stop { id: id.to_string() });
    }

    pub async fn progress(&self, id: &str) -> Option<u8> {
        let (tx, rx) = oneshot::channel();

        let _ = self.tx.send(Message::Progress {
            id: id.to_string(),
            reply: tx,
        });

        rx.await.ok().flatten()
    }

    /// Peer descriptor a live connection was admitted or dialed with.
    pub async fn peer_of(&self, id: &str) -> Option<PeerDescriptor> {
        let (tx, rx) = oneshot::channel();

        let _ = self.tx.send(Message::PeerInfo {
            id: id.to_string(),
            reply: tx,
        });

        rx.await.ok().flatten()
    }

    pub fn classify(&self, id: &str, uuid: &str, kind: LinkKind) {
        let _ = self.tx.send(Message::Classify {
            id: id.to_string(),
            uuid: uuid.to_string(),
            kind,
        });
    }

    pub fn groups_changed(&self) {
        let _ = self.tx.send(Message::GroupsChanged);
    }

    pub fn upload_pic_to_group(&self, group_id: &str, param: PicParam) {
        let _ = self.tx.send(Message::UploadPicToGroup {
            group_id: group_id.to_string(),
            param,
            is_route: false,
        });
    }

    pub fn share_group_file(&self, path: PathBuf, group_id: &str) {
        let _ = self.tx.send(Message::ShareGroupFile {
            path,
            group_id: group_id.to_string(),
        });
    }

    pub fn download_file(
        &self,
        peer: PeerDescriptor,
        store_path: PathBuf,
        req: crate::protocol::DownloadRequest,
    ) -> oneshot::Receiver<LabmeshResult<ConnId>> {
        self.connect_peer(
            LinkKind::Temp,
            None,
            peer,
            Service::download_consumer(store_path, req),
        )
    }

    pub fn send_file(
        &self,
        peer: PeerDescriptor,
        path: PathBuf,
        store_path: &str,
    ) -> oneshot::Receiver<LabmeshResult<ConnId>> {
        self.connect_peer(
            LinkKind::Temp,
            None,
            peer,
            Service::file_sender(path, store_path.to_string()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicU8, AtomicUsize};
    use std::sync::Mutex;
    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::watch;

    use crate::codec::FrameReader;
    use crate::error::LabmeshResult;
    use crate::protocol::{
        MessageInfo, SharedFileInfo, TaskInfo, FILE_DOWNLOAD_SERVICE, GROUP_FILE_UPLOAD_SERVICE,
        PIC_TRANSFER_SERVICE,
    };
    use crate::sinks::{
        Directory, LogArpTable, SessionSink, SharedFileStore, TaskSink, Topology,
    };

    struct TestTopology {
        uuid: String,
        role: Role,
    }

    impl Topology for TestTopology {
        fn local_uuid(&self) -> String {
            self.uuid.clone()
        }

        fn local_role(&self) -> Role {
            self.role
        }

        fn neighbors_changed(&self, _uuid: &str, _kind: LinkKind, _joined: bool) {}
    }

    struct GroupsDirectory(HashMap<String, Vec<String>>);

    impl Directory for GroupsDirectory {
        fn get_user(&self, uuid: &str) -> Option<PeerDescriptor> {
            Some(PeerDescriptor {
                uuid: uuid.to_string(),
                ip: Ipv4Addr::LOCALHOST,
                mac: String::new(),
            })
        }

        fn list_join_group(&self, uuid: &str) -> Vec<String> {
            self.0.get(uuid).cloned().unwrap_or_default()
        }
    }

    #[derive(Default)]
    struct RecordingSessions(Mutex<Vec<MessageInfo>>);

    impl SessionSink for RecordingSessions {
        fn create_message(&self, info: MessageInfo, _is_local_origin: bool) {
            self.0.lock().unwrap().push(info);
        }
    }

    #[derive(Default)]
    struct RecordingTasks(Mutex<Vec<String>>);

    impl TaskSink for RecordingTasks {
        fn create_task(&self, _task: TaskInfo) -> LabmeshResult<String> {
            self.0.lock().unwrap().push("create".into());
            Ok("task-1".into())
        }

        fn pause_task(&self, _id: &str) {
            self.0.lock().unwrap().push("pause".into());
        }

        fn restore_task(&self, _id: &str) {
            self.0.lock().unwrap().push("restore".into());
        }

        fn finish_task(&self, _id: &str) {
            self.0.lock().unwrap().push("finish".into());
        }

        fn error_task(&self, _id: &str) {
            self.0.lock().unwrap().push("error".into());
        }
    }

    #[derive(Default)]
    struct RecordingStore(Mutex<Vec<SharedFileInfo>>);

    impl SharedFileStore for RecordingStore {
        fn add_shared_file(&self, file: SharedFileInfo) {
            self.0.lock().unwrap().push(file);
        }
    }

    struct TestCtx {
        sessions: Arc<RecordingSessions>,
        tasks: Arc<RecordingTasks>,
        store: Arc<RecordingStore>,
        ctx: Ctx,
    }

    fn test_ctx(uuid: &str, role: Role, groups: &[(&str, &[&str])], dir: &std::path::Path) -> TestCtx {
        let sessions = Arc::new(RecordingSessions::default());
        let tasks = Arc::new(RecordingTasks::default());
        let store = Arc::new(RecordingStore::default());

        let groups: HashMap<String, Vec<String>> = groups
            .iter()
            .map(|(uuid, gs)| {
                (
                    uuid.to_string(),
                    gs.iter().map(|g| g.to_string()).collect(),
                )
            })
            .collect();

        let ctx = Ctx {
            topology: Arc::new(TestTopology {
                uuid: uuid.to_string(),
                role,
            }),
            directory: Arc::new(GroupsDirectory(groups)),
            sessions: sessions.clone(),
            tasks: tasks.clone(),
            shared_files: store.clone(),
            arp: Arc::new(LogArpTable),
            tmp_dir: dir.to_path_buf(),
            group_dir: dir.to_path_buf(),
            tcp_port: 0,
        };

        TestCtx {
            sessions,
            tasks,
            store,
            ctx,
        }
    }

    async fn overlay_with(
        uuid: &str,
        role: Role,
        groups: &[(&str, &[&str])],
    ) -> (Overlay, OverlayHandle) {
        let tc = test_ctx(uuid, role, groups, &std::env::temp_dir());
        Overlay::bind("127.0.0.1:0", tc.ctx).await.unwrap()
    }

    fn stub_conn(
        uuid: &str,
    ) -> (
        ConnHandle,
        mpsc::UnboundedReceiver<ConnCmd>,
        watch::Receiver<bool>,
    ) {
        let (tx_cmd, rx_cmd) = mpsc::unbounded_channel();
        let (tx_shutdown, rx_shutdown) = watch::channel(false);

        let handle = ConnHandle {
            peer: PeerDescriptor {
                uuid: uuid.to_string(),
                ip: Ipv4Addr::LOCALHOST,
                mac: String::new(),
            },
            tx_cmd,
            tx_shutdown,
            progress: Arc::new(AtomicU8::new(0)),
        };

        (handle, rx_cmd, rx_shutdown)
    }

    fn sent_frames(rx: &mut mpsc::UnboundedReceiver<ConnCmd>) -> Vec<Value> {
        let mut out = Vec::new();

        while let Ok(cmd) = rx.try_recv() {
            if let ConnCmd::Send(bytes) = cmd {
                let mut reader = FrameReader::new();
                reader.extend(&bytes);
                while let Some(frame) = reader.next() {
                    out.push(frame);
                }
            }
        }

        out
    }

    fn counting_handler(hits: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_, _, _| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    async fn wait_for(what: &str, cond: impl Fn() -> bool) {
        for _ in 0..250 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn connection_lives_in_exactly_one_partition() {
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        let (c1, _rx, _sd) = stub_conn("C1");
        overlay.register("C1".into(), LinkKind::Child, c1);

        let (kind, handle) = overlay.find("C1").unwrap();
        assert_eq!(kind, LinkKind::Child);
        assert_eq!(handle.peer.uuid, "C1");
        assert_eq!(handle.peer.ip, Ipv4Addr::LOCALHOST);

        let holding: Vec<_> = LinkKind::ALL
            .iter()
            .filter(|kind| overlay.conns[kind].contains_key("C1"))
            .collect();
        assert_eq!(holding, vec![&LinkKind::Child]);

        overlay.unregister("C1");
        assert!(overlay.find("C1").is_none());

        for kind in &LinkKind::ALL {
            assert!(overlay.conns[kind].is_empty());
        }
    }

    #[tokio::test]
    async fn stop_removes_connection_and_signals_shutdown() {
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        let (c1, _rx, shutdown) = stub_conn("C1");
        overlay.register("C1".into(), LinkKind::Child, c1);

        overlay.stop_conn("C1");

        assert!(overlay.find("C1").is_none());
        assert!(*shutdown.borrow());
    }

    #[tokio::test]
    async fn temp_ids_are_minted_monotonically() {
        let (overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        assert_eq!(overlay.mint_temp_id(), "1");
        assert_eq!(overlay.mint_temp_id(), "2");
        assert_eq!(overlay.mint_temp_id(), "3");
    }

    #[tokio::test]
    async fn group_cache_rebuilds_after_neighbor_changes() {
        let (mut overlay, _handle) =
            overlay_with("R1", Role::Router, &[("C1", &["G1"]), ("C2", &["G2"])]).await;

        let (c1, _rx1, _sd1) = stub_conn("C1");
        overlay.register("C1".into(), LinkKind::Child, c1);
        overlay.refresh_group_map();

        assert!(overlay.in_group("C1", "G1"));
        assert!(!overlay.in_group("C2", "G2"));

        let (c2, _rx2, _sd2) = stub_conn("C2");
        overlay.register("C2".into(), LinkKind::Child, c2);
        assert!(overlay.group_map_dirty);

        overlay.refresh_group_map();
        assert!(overlay.in_group("C2", "G2"));

        overlay.unregister("C1");
        overlay.refresh_group_map();
        assert!(!overlay.in_group("C1", "G1"));
    }

    #[tokio::test]
    async fn self_addressed_single_dispatches_locally_once() {
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        let hits = Arc::new(AtomicUsize::new(0));
        overlay.register_family_handler("Chat", counting_handler(hits.clone()));

        let (c1, mut rx_c1, _sd) = stub_conn("C1");
        overlay.register("C1".into(), LinkKind::Child, c1);

        overlay.send_action_msg(
            TransferMode::Single,
            "Chat",
            "Text",
            json!({ "source": "R1", "dest": "R1", "body": "hi" }),
        );

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(sent_frames(&mut rx_c1).is_empty());
    }

    #[tokio::test]
    async fn router_single_reaches_only_the_matching_child() {
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        let (c1, mut rx_c1, _sd1) = stub_conn("C1");
        let (c2, mut rx_c2, _sd2) = stub_conn("C2");
        let (p1, mut rx_p1, _sd3) = stub_conn("P1");
        let (b1, mut rx_b1, _sd4) = stub_conn("B1");
        overlay.register("C1".into(), LinkKind::Child, c1);
        overlay.register("C2".into(), LinkKind::Child, c2);
        overlay.register("P1".into(), LinkKind::Parent, p1);
        overlay.register("B1".into(), LinkKind::Brother, b1);

        overlay.send_action_msg(
            TransferMode::Single,
            "Chat",
            "Text",
            json!({ "source": "R1", "dest": "C2", "body": "hi" }),
        );

        let frames = sent_frames(&mut rx_c2);
        assert_eq!(frames.len(), 1);
        assert_eq!(envelope::family(&frames[0]), Some(CONN_MANAGE_FAMILY));
        assert_eq!(envelope::action(&frames[0]), Some(SEND_SINGLE_ACTION));
        assert_eq!(frames[0]["data"]["data"]["dest"], "C2");

        assert!(sent_frames(&mut rx_c1).is_empty());
        assert!(sent_frames(&mut rx_p1).is_empty());
        assert!(sent_frames(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn master_single_without_matching_child_is_dropped() {
        let (mut overlay, _handle) = overlay_with("M0", Role::Master, &[]).await;

        let (c1, mut rx_c1, _sd) = stub_conn("C1");
        overlay.register("C1".into(), LinkKind::Child, c1);

        overlay.send_action_msg(
            TransferMode::Single,
            "Chat",
            "Text",
            json!({ "source": "M0", "dest": "unknown", "body": "hi" }),
        );

        assert!(sent_frames(&mut rx_c1).is_empty());
    }

    #[tokio::test]
    async fn router_group_first_hop_follows_membership() {
        let groups: &[(&str, &[&str])] = &[
            ("P1", &["G1"]),
            ("C1", &["G1"]),
            ("R1", &["G1"]),
        ];
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, groups).await;

        let hits = Arc::new(AtomicUsize::new(0));
        overlay.register_family_handler("Chat", counting_handler(hits.clone()));

        let (p1, mut rx_p1, _sd1) = stub_conn("P1");
        let (p2, mut rx_p2, _sd2) = stub_conn("P2");
        let (c1, mut rx_c1, _sd3) = stub_conn("C1");
        let (b1, mut rx_b1, _sd4) = stub_conn("B1");
        overlay.register("P1".into(), LinkKind::Parent, p1);
        overlay.register("P2".into(), LinkKind::Parent, p2);
        overlay.register("C1".into(), LinkKind::Child, c1);
        overlay.register("B1".into(), LinkKind::Brother, b1);

        overlay.send_action_msg(
            TransferMode::Group,
            "Chat",
            "Text",
            json!({ "source": "R1", "dest": "G1", "body": "hi group" }),
        );

        // Local host joined G1, so the message is delivered here too.
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let frames_p1 = sent_frames(&mut rx_p1);
        assert_eq!(frames_p1.len(), 1);
        assert_eq!(envelope::route_count(&frames_p1[0]), Some(1));
        assert_eq!(envelope::action(&frames_p1[0]), Some(SEND_GROUP_ACTION));

        let frames_c1 = sent_frames(&mut rx_c1);
        assert_eq!(frames_c1.len(), 1);
        assert_eq!(envelope::route_count(&frames_c1[0]), Some(1));

        let frames_b1 = sent_frames(&mut rx_b1);
        assert_eq!(frames_b1.len(), 1);
        assert_eq!(envelope::route_count(&frames_b1[0]), Some(1));

        assert!(sent_frames(&mut rx_p2).is_empty());
    }

    #[tokio::test]
    async fn relayed_group_message_skips_parents_and_ttl_capped_brother() {
        let groups: &[(&str, &[&str])] = &[("P1", &["G1"]), ("C1", &["G1"])];
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, groups).await;

        let (p1, mut rx_p1, _sd1) = stub_conn("P1");
        let (c1, mut rx_c1, _sd2) = stub_conn("C1");
        let (b1, mut rx_b1, _sd3) = stub_conn("B1");
        overlay.register("P1".into(), LinkKind::Parent, p1);
        overlay.register("C1".into(), LinkKind::Child, c1);
        overlay.register("B1".into(), LinkKind::Brother, b1);

        let inner = envelope::wrap("Chat", "Text", json!({ "source": "M9", "dest": "G1" }));
        let mut relay = envelope::wrap(CONN_MANAGE_FAMILY, SEND_GROUP_ACTION, inner);
        envelope::set_route_count(&mut relay, 1);

        overlay.dispatch_family(relay, Some("B1".into()));

        // Not the first hop: parents are skipped, children still served,
        // and the incremented TTL suppresses another brother hop.
        assert!(sent_frames(&mut rx_p1).is_empty());

        let frames = sent_frames(&mut rx_c1);
        assert_eq!(frames.len(), 1);
        assert_eq!(envelope::route_count(&frames[0]), Some(2));

        assert!(sent_frames(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn relayed_broadcast_at_ttl_still_floods_up_and_down() {
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        let hits = Arc::new(AtomicUsize::new(0));
        overlay.register_family_handler("Chat", counting_handler(hits.clone()));

        let (p1, mut rx_p1, _sd1) = stub_conn("P1");
        let (p2, mut rx_p2, _sd2) = stub_conn("P2");
        let (c1, mut rx_c1, _sd3) = stub_conn("C1");
        let (b1, mut rx_b1, _sd4) = stub_conn("B1");
        overlay.register("P1".into(), LinkKind::Parent, p1);
        overlay.register("P2".into(), LinkKind::Parent, p2);
        overlay.register("C1".into(), LinkKind::Child, c1);
        overlay.register("B1".into(), LinkKind::Brother, b1);

        let inner = envelope::wrap("Chat", "Text", json!({ "source": "M9", "body": "all" }));
        let mut relay = envelope::wrap(CONN_MANAGE_FAMILY, SEND_BROADCAST_ACTION, inner);
        envelope::set_route_count(&mut relay, 2);

        overlay.dispatch_family(relay, Some("B1".into()));

        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let frames_p1 = sent_frames(&mut rx_p1);
        assert_eq!(frames_p1.len(), 1);
        assert_eq!(envelope::route_count(&frames_p1[0]), Some(3));

        let frames_p2 = sent_frames(&mut rx_p2);
        assert_eq!(frames_p2.len(), 1);
        assert_eq!(envelope::route_count(&frames_p2[0]), Some(3));

        let frames_c1 = sent_frames(&mut rx_c1);
        assert_eq!(frames_c1.len(), 1);
        assert_eq!(envelope::route_count(&frames_c1[0]), Some(3));

        assert!(sent_frames(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn router_single_first_hop_falls_back_to_brother() {
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        let (c1, mut rx_c1, _sd1) = stub_conn("C1");
        let (p1, mut rx_p1, _sd2) = stub_conn("P1");
        let (b1, mut rx_b1, _sd3) = stub_conn("B1");
        overlay.register("C1".into(), LinkKind::Child, c1);
        overlay.register("P1".into(), LinkKind::Parent, p1);
        overlay.register("B1".into(), LinkKind::Brother, b1);

        // Destination known to neither children nor parents: the first
        // hop goes to one brother at routeCount 1.
        overlay.send_action_msg(
            TransferMode::Single,
            "Chat",
            "Text",
            json!({ "source": "R1", "dest": "M404", "body": "hi" }),
        );

        let frames = sent_frames(&mut rx_b1);
        assert_eq!(frames.len(), 1);
        assert_eq!(envelope::route_count(&frames[0]), Some(1));
        assert_eq!(envelope::action(&frames[0]), Some(SEND_SINGLE_ACTION));

        assert!(sent_frames(&mut rx_c1).is_empty());
        assert!(sent_frames(&mut rx_p1).is_empty());
    }

    #[tokio::test]
    async fn single_past_brother_ttl_is_dropped() {
        let (mut overlay, _handle) = overlay_with("R1", Role::Router, &[]).await;

        let (b1, mut rx_b1, _sd) = stub_conn("B1");
        overlay.register("B1".into(), LinkKind::Brother, b1);

        let inner = envelope::wrap("Chat", "Text", json!({ "source": "M9", "dest": "M7" }));
        let mut relay = envelope::wrap(CONN_MANAGE_FAMILY, SEND_SINGLE_ACTION, inner);
        envelope::set_route_count(&mut relay, 1);

        overlay.dispatch_family(relay, Some("B2".into()));

        assert!(sent_frames(&mut rx_b1).is_empty());
    }

    #[tokio::test]
    async fn random_message_takes_one_role_specific_hop() {
        let (mut overlay, _handle) = overlay_with("M7", Role::Member, &[]).await;

        let (p1, mut rx_p1, _sd) = stub_conn("P1");
        overlay.register("P1".into(), LinkKind::Parent, p1);

        overlay.send_action_msg(
            TransferMode::Random,
            "Probe",
            "Ping",
            json!({ "source": "M7" }),
        );

        let frames = sent_frames(&mut rx_p1);
        assert_eq!(frames.len(), 1);
        // Random sends go raw: no relay envelope, no routeCount.
        assert_eq!(envelope::family(&frames[0]), Some("Probe"));
        assert_eq!(envelope::route_count(&frames[0]), None);
    }

    #[tokio::test]
    async fn handle_commands_are_safe_on_unknown_ids() {
        use crate::protocol::DownloadRequest;

        let tc = test_ctx("M7", Role::Member, &[], &std::env::temp_dir());
        let (mut overlay, handle) = Overlay::bind("127.0.0.1:0", tc.ctx).await.unwrap();
        tokio::spawn(async move {
            let _ = overlay.up().await;
        });

        handle.send_action_msg(
            TransferMode::Single,
            "Chat",
            "Text",
            json!({ "source": "M7", "dest": "M7", "body": "to self, unhandled" }),
        );
        handle.send_to("nope", json!({ "family": "Chat" }));
        handle.pause("nope");
        handle.restore("nope");
        handle.stop("nope");
        handle.classify("nope", "X1", LinkKind::Child);
        handle.groups_changed();

        handle.upload_pic_to_group(
            "G1",
            PicParam {
                pic_store_name: "p.png".into(),
                pic_size: 1,
                msg_id: "m1".into(),
                msg_source: "M7".into(),
                msg_dest: "G1".into(),
                msg_type: 2,
                msg_date: "2021-03-14".into(),
                msg_mode: 1,
                pic_real_name: None,
                route_count: None,
            },
        );
        handle.share_group_file(PathBuf::from("/nonexistent/file.bin"), "G1");

        // The loop applies commands in order, so a reply here proves the
        // batch above was handled without touching any socket.
        assert_eq!(handle.progress("nope").await, None);
        assert_eq!(handle.peer_of("nope").await, None);

        // tcp_port 0 can never connect; both sugar calls must fail over
        // the notify channel rather than register anything.
        let peer = PeerDescriptor {
            uuid: "X1".into(),
            ip: Ipv4Addr::LOCALHOST,
            mac: String::new(),
        };

        let req = DownloadRequest {
            task_id: "t1".into(),
            file_size: 1,
            file_source_path: "/nonexistent".into(),
            rsource: "X1".into(),
            rdest: "M7".into(),
        };
        let result = handle
            .download_file(peer.clone(), std::env::temp_dir().join("never.bin"), req)
            .await
            .unwrap();
        assert!(result.is_err());

        let result = handle
            .send_file(peer, PathBuf::from("/nonexistent/file.bin"), "/tmp")
            .await
            .unwrap();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn accepted_picture_transfer_lands_with_residual() {
        let dir = std::env::temp_dir().join(format!("labmesh-pic-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let tc = test_ctx("M7", Role::Member, &[], &dir);
        let sessions = tc.sessions.clone();

        let (overlay, _handle) = Overlay::bind("127.0.0.1:0", tc.ctx).await.unwrap();
        let addr = overlay.listener.local_addr().unwrap();
        let mut overlay = overlay;
        tokio::spawn(async move {
            let _ = overlay.up().await;
        });

        let content: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

        let param = json!({
            "picStoreName": "landed.bin",
            "picSize": content.len(),
            "msgId": "m1",
            "msgSource": "M9",
            "msgDest": "M7",
            "msgType": 2,
            "msgDate": "2021-03-14",
            "msgMode": 0,
        });
        let header = codec::encode(&json!({
            "serviceName": PIC_TRANSFER_SERVICE,
            "serviceParam": param,
        }))
        .unwrap();

        let mut sock = TcpStream::connect(addr).await.unwrap();

        // The prefix of the picture rides in the same write as the
        // header; the receiver must treat it as residual.
        let mut first = header.to_vec();
        first.extend_from_slice(&content[..64 * 1024]);
        sock.write_all(&first).await.unwrap();
        sock.write_all(&content[64 * 1024..]).await.unwrap();
        sock.flush().await.unwrap();

        wait_for("picture message", || !sessions.0.lock().unwrap().is_empty()).await;

        let stored = tokio::fs::read(dir.join("landed.bin")).await.unwrap();
        assert_eq!(stored.len(), content.len());
        assert_eq!(stored, content);

        let messages = sessions.0.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m1");
        assert_eq!(messages[0].source, "M9");
        assert!(messages[0].body.ends_with("landed.bin"));
    }

    #[tokio::test]
    async fn download_provider_streams_the_advertised_file() {
        let dir = std::env::temp_dir().join(format!("labmesh-dl-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let content: Vec<u8> = (0..1_200_000u32).map(|i| (i % 241) as u8).collect();
        let source = dir.join("shared-notes.bin");
        tokio::fs::write(&source, &content).await.unwrap();

        let tc = test_ctx("M7", Role::Member, &[], &dir);
        let tasks = tc.tasks.clone();

        let (overlay, _handle) = Overlay::bind("127.0.0.1:0", tc.ctx).await.unwrap();
        let addr = overlay.listener.local_addr().unwrap();
        let mut overlay = overlay;
        tokio::spawn(async move {
            let _ = overlay.up().await;
        });

        let request = json!({
            "taskId": "t-req",
            "fileSize": content.len(),
            "fileSourcePath": source.to_string_lossy(),
            "rsource": "M9",
            "rdest": "M7",
        });
        let header = codec::encode(&json!({
            "serviceName": FILE_DOWNLOAD_SERVICE,
            "serviceParam": request,
        }))
        .unwrap();

        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(&header).await.unwrap();

        let mut received = Vec::with_capacity(content.len());
        let mut buf = vec![0u8; 64 * 1024];
        while received.len() < content.len() {
            let n = sock.read(&mut buf).await.unwrap();
            assert!(n > 0, "provider closed early at {} bytes", received.len());
            received.extend_from_slice(&buf[..n]);
        }

        assert_eq!(received, content);

        wait_for("task bookkeeping", || {
            tasks.0.lock().unwrap().ends_with(&["finish".to_string()])
        })
        .await;

        let log = tasks.0.lock().unwrap();
        assert_eq!(*log, vec!["create".to_string(), "finish".to_string()]);
    }

    #[tokio::test]
    async fn landed_group_file_registers_with_the_shared_store() {
        let dir = std::env::temp_dir().join(format!("labmesh-grp-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let tc = test_ctx("M7", Role::Member, &[], &dir);
        let store = tc.store.clone();

        let (overlay, _handle) = Overlay::bind("127.0.0.1:0", tc.ctx).await.unwrap();
        let addr = overlay.listener.local_addr().unwrap();
        let mut overlay = overlay;
        tokio::spawn(async move {
            let _ = overlay.up().await;
        });

        let content = b"group homework handout".repeat(512);

        let meta = json!({
            "fileName": "handout.bin",
            "fileSize": content.len(),
            "fileGroup": "G1",
            "fileOwner": "M9",
        });
        let header = codec::encode(&json!({
            "serviceName": GROUP_FILE_UPLOAD_SERVICE,
            "serviceParam": meta,
        }))
        .unwrap();

        let mut sock = TcpStream::connect(addr).await.unwrap();
        sock.write_all(&header).await.unwrap();
        sock.write_all(&content).await.unwrap();
        sock.flush().await.unwrap();

        wait_for("shared file", || !store.0.lock().unwrap().is_empty()).await;

        let stored = tokio::fs::read(dir.join("handout.bin")).await.unwrap();
        assert_eq!(stored, content);

        let files = store.0.lock().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].owner, "M9");
        assert_eq!(files[0].group, "G1");
        assert!(files[0].path.ends_with("handout.bin"));
    }
}

