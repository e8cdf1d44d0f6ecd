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

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{BytesCodec, Framed};

use bytes::Bytes;

use futures::sink::SinkExt;

use crate::codec::{self, FrameReader};
use crate::error::LabmeshResult;
use crate::overlay::Message;
use crate::protocol::{
    DownloadRequest, FileSendParam, GroupFileMeta, MessageInfo, PicParam, ServiceHeader,
    SharedFileInfo, TaskInfo, TransferMode, CHUNK_SIZE, FILE_DOWNLOAD_SERVICE, FILE_SEND_SERVICE,
    GROUP_FILE_UPLOAD_SERVICE, GROUP_SESSION, NET_STRUCTURE_SERVICE, PIC_TRANSFER_SERVICE,
    TASK_PAUSE, TASK_RESTART, TASK_STOP,
};
use crate::sinks::Ctx;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
    Paused,
    Finished,
    Errored,
}

impl ServiceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Finished | ServiceState::Errored)
    }
}

/// What the connection loop should do after a service step.
#[derive(Debug)]
pub enum Flow {
    Continue,

    /// The service reached its end; the connection can close.
    Done,

    /// The control greeting named another service; install it and feed
    /// it the residual bytes buffered past the header frame.
    Swap(Box<Service>, Bytes),
}

/// Borrowed plumbing a service step runs against.
pub struct ServiceIo<'a> {
    pub framed: &'a mut Framed<TcpStream, BytesCodec>,
    pub events: &'a mpsc::UnboundedSender<Message>,
    pub ctx: &'a Ctx,
    pub conn_id: &'a str,
    pub progress: &'a AtomicU8,
}

/// File half of a streaming service: lazily opened handle, reusable
/// chunk buffer, byte accounting against the advertised total.
#[derive(Debug)]
struct FileBody {
    path: PathBuf,
    file: Option<File>,
    buf: Vec<u8>,
    total: u64,
    handled: u64,
}

impl FileBody {
    fn new(path: PathBuf, total: u64) -> Self {
        Self {
            path,
            file: None,
            buf: Vec::new(),
            total,
            handled: 0,
        }
    }

    /// Read and send the next raw chunk; returns true once the
    /// zero-length final write has gone out.
    async fn send_next(
        &mut self,
        framed: &mut Framed<TcpStream, BytesCodec>,
    ) -> LabmeshResult<bool> {
        if self.file.is_none() {
            self.file = Some(File::open(&self.path).await?);
            self.buf = vec![0u8; CHUNK_SIZE];
        }

        let read_bytes = match self.file.as_mut() {
            Some(file) => file.read(&mut self.buf).await?,
            None => 0,
        };

        if read_bytes == 0 {
            framed.send(Bytes::new()).await?;
            self.close();
            return Ok(true);
        }

        self.handled += read_bytes as u64;
        framed.send(Bytes::copy_from_slice(&self.buf[..read_bytes])).await?;

        Ok(false)
    }

    /// Append a received chunk; returns true once `total` bytes landed.
    async fn write_chunk(&mut self, chunk: &[u8]) -> LabmeshResult<bool> {
        if self.file.is_none() {
            self.file = Some(File::create(&self.path).await?);
        }

        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
        }

        self.handled += chunk.len() as u64;

        if self.handled >= self.total {
            if let Some(mut file) = self.file.take() {
                file.flush().await?;
            }
            return Ok(true);
        }

        Ok(false)
    }

    fn close(&mut self) {
        self.file = None;
        self.buf = Vec::new();
    }

    fn complete(&self) -> bool {
        self.total > 0 && self.handled >= self.total
    }

    fn pct(&self) -> u8 {
        if self.total == 0 {
            return 0;
        }

        ((self.handled.min(self.total) * 100) / self.total) as u8
    }
}

/// Long-lived control dialect: length-prefixed JSON frames routed into
/// the overlay dispatcher. A receiver-side control born on accept also
/// plays greeter: the first frame names the service the stream will
/// actually speak.
#[derive(Debug)]
pub struct Control {
    announce: bool,
    greeting: bool,
    reader: FrameReader,
    state: ServiceState,
}

#[derive(Debug)]
pub struct PicTransfer {
    sender: bool,
    param: PicParam,
    body: FileBody,
    state: ServiceState,
}

#[derive(Debug)]
pub struct FileDownload {
    provider: bool,
    req: DownloadRequest,
    task_id: String,
    is_executing: bool,
    reader: FrameReader,
    body: FileBody,
    state: ServiceState,
}

#[derive(Debug)]
pub struct GroupFileUpload {
    sender: bool,
    is_route: bool,
    group_id: String,
    meta: Option<GroupFileMeta>,
    task_id: Option<String>,
    is_executing: bool,
    body: FileBody,
    state: ServiceState,
}

#[derive(Debug)]
pub struct FileSend {
    sender: bool,
    store_path: String,
    body: FileBody,
    state: ServiceState,
}

/// The protocol currently driving a connection's framing and lifecycle.
#[derive(Debug)]
pub enum Service {
    Control(Control),
    PicTransfer(PicTransfer),
    FileDownload(FileDownload),
    GroupFileUpload(GroupFileUpload),
    FileSend(FileSend),
}

impl Service {
    /// Outbound overlay link: announces the control service, then stays
    /// in the frame loop.
    pub fn control_sender() -> Service {
        Service::Control(Control {
            announce: true,
            greeting: false,
            reader: FrameReader::new(),
            state: ServiceState::Idle,
        })
    }

    /// Accepted link: awaits the peer's service header before settling
    /// on a dialect.
    pub fn control_receiver() -> Service {
        Service::Control(Control {
            announce: false,
            greeting: true,
            reader: FrameReader::new(),
            state: ServiceState::Idle,
        })
    }

    pub fn pic_sender(path: PathBuf, param: PicParam) -> Service {
        let total = param.pic_size;
        Service::PicTransfer(PicTransfer {
            sender: true,
            param,
            body: FileBody::new(path, total),
            state: ServiceState::Idle,
        })
    }

    pub fn pic_receiver(param: PicParam, tmp_dir: &Path) -> Service {
        let path = tmp_dir.join(&param.pic_store_name);
        let total = param.pic_size;
        Service::PicTransfer(PicTransfer {
            sender: false,
            param,
            body: FileBody::new(path, total),
            state: ServiceState::Idle,
        })
    }

    /// Requesting side of a download: sends the request header, then
    /// receives the file into `store_path`.
    pub fn download_consumer(store_path: PathBuf, req: DownloadRequest) -> Service {
        let total = req.file_size;
        let task_id = req.task_id.clone();
        Service::FileDownload(FileDownload {
            provider: false,
            req,
            task_id,
            is_executing: true,
            reader: FrameReader::new(),
            body: FileBody::new(store_path, total),
            state: ServiceState::Idle,
        })
    }

    /// Providing side, built from the request header: streams the
    /// advertised file and listens for task-control frames.
    pub fn download_provider(req: DownloadRequest) -> Service {
        let path = PathBuf::from(&req.file_source_path);
        let total = req.file_size;
        Service::FileDownload(FileDownload {
            provider: true,
            req,
            task_id: String::new(),
            is_executing: false,
            reader: FrameReader::new(),
            body: FileBody::new(path, total),
            state: ServiceState::Idle,
        })
    }

    pub fn group_upload_origin(path: PathBuf, group_id: String) -> Service {
        Service::GroupFileUpload(GroupFileUpload {
            sender: true,
            is_route: false,
            group_id,
            meta: None,
            task_id: None,
            is_executing: true,
            body: FileBody::new(path, 0),
            state: ServiceState::Idle,
        })
    }

    pub fn group_upload_relay(meta: GroupFileMeta, group_dir: &Path) -> Service {
        let path = group_dir.join(&meta.file_name);
        let total = meta.file_size;
        let group_id = meta.file_group.clone();
        Service::GroupFileUpload(GroupFileUpload {
            sender: true,
            is_route: true,
            group_id,
            meta: Some(meta),
            task_id: None,
            is_executing: true,
            body: FileBody::new(path, total),
            state: ServiceState::Idle,
        })
    }

    pub fn group_upload_receiver(meta: GroupFileMeta, group_dir: &Path) -> Service {
        let path = group_dir.join(&meta.file_name);
        let total = meta.file_size;
        let group_id = meta.file_group.clone();
        Service::GroupFileUpload(GroupFileUpload {
            sender: false,
            is_route: true,
            group_id,
            meta: Some(meta),
            task_id: None,
            is_executing: false,
            body: FileBody::new(path, total),
            state: ServiceState::Idle,
        })
    }

    pub fn file_sender(path: PathBuf, store_path: String) -> Service {
        Service::FileSend(FileSend {
            sender: true,
            store_path,
            body: FileBody::new(path, 0),
            state: ServiceState::Idle,
        })
    }

    pub fn file_receiver(param: FileSendParam) -> Service {
        Service::FileSend(FileSend {
            sender: false,
            store_path: String::new(),
            body: FileBody::new(PathBuf::from(&param.file_name), param.file_size),
            state: ServiceState::Idle,
        })
    }

    /// Build the receiver side of the service a greeting header names.
    ///
    /// `Ok(None)` means the name is unknown and the greeting should be
    /// ignored; a malformed param for a known service is an error and
    /// tears the connection down.
    pub fn from_header(
        name: &str,
        param: serde_json::Value,
        ctx: &Ctx,
    ) -> LabmeshResult<Option<Service>> {
        match name {
            PIC_TRANSFER_SERVICE => Ok(Some(Service::pic_receiver(
                serde_json::from_value(param)?,
                &ctx.tmp_dir,
            ))),
            FILE_DOWNLOAD_SERVICE => Ok(Some(Service::download_provider(
                serde_json::from_value(param)?,
            ))),
            GROUP_FILE_UPLOAD_SERVICE => Ok(Some(Service::group_upload_receiver(
                serde_json::from_value(param)?,
                &ctx.group_dir,
            ))),
            FILE_SEND_SERVICE => Ok(Some(Service::file_receiver(serde_json::from_value(
                param,
            )?))),
            _ => Ok(None),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Service::Control(_) => NET_STRUCTURE_SERVICE,
            Service::PicTransfer(_) => PIC_TRANSFER_SERVICE,
            Service::FileDownload(_) => FILE_DOWNLOAD_SERVICE,
            Service::GroupFileUpload(_) => GROUP_FILE_UPLOAD_SERVICE,
            Service::FileSend(_) => FILE_SEND_SERVICE,
        }
    }

    pub fn state(&self) -> ServiceState {
        match self {
            Service::Control(c) => c.state,
            Service::PicTransfer(p) => p.state,
            Service::FileDownload(d) => d.state,
            Service::GroupFileUpload(g) => g.state,
            Service::FileSend(f) => f.state,
        }
    }

    /// Whether the connection loop should drive a send step this turn.
    pub fn wants_send(&self) -> bool {
        match self {
            Service::Control(_) => false,
            Service::PicTransfer(p) => p.sender && p.state == ServiceState::Running,
            Service::FileDownload(d) => {
                d.provider && d.is_executing && d.state == ServiceState::Running
            }
            Service::GroupFileUpload(g) => {
                g.sender && g.is_executing && g.state == ServiceState::Running
            }
            Service::FileSend(f) => f.sender && f.state == ServiceState::Running,
        }
    }

    pub fn progress(&self) -> u8 {
        match self {
            Service::Control(_) => 0,
            Service::PicTransfer(p) => p.body.pct(),
            Service::FileDownload(d) => d.body.pct(),
            Service::GroupFileUpload(g) => g.body.pct(),
            Service::FileSend(f) => f.body.pct(),
        }
    }

    /// Sender sides announce themselves with a service header; the
    /// download provider registers its task instead.
    pub async fn start(&mut self, io: &mut ServiceIo<'_>) -> LabmeshResult<()> {
        match self {
            Service::Control(c) => {
                if c.announce {
                    let header = ServiceHeader::new(NET_STRUCTURE_SERVICE);
                    io.framed.send(codec::encode(&header)?).await?;
                }
                c.state = ServiceState::Running;
            }
            Service::PicTransfer(p) => {
                if p.sender {
                    let header = ServiceHeader::with_param(PIC_TRANSFER_SERVICE, &p.param)?;
                    io.framed.send(codec::encode(&header)?).await?;
                }
                p.state = ServiceState::Running;
            }
            Service::FileDownload(d) => {
                if d.provider {
                    let payload = serde_json::to_string(&d.req)?;
                    let task = TaskInfo::transfer(
                        d.req.rsource.clone(),
                        d.req.rdest.clone(),
                        TransferMode::Single,
                        payload,
                    );

                    match io.ctx.tasks.create_task(task) {
                        Ok(task_id) => {
                            d.task_id = task_id;
                            d.is_executing = true;
                        }
                        Err(e) => {
                            d.state = ServiceState::Errored;
                            return Err(e);
                        }
                    }
                } else {
                    let header = ServiceHeader::with_param(FILE_DOWNLOAD_SERVICE, &d.req)?;
                    io.framed.send(codec::encode(&header)?).await?;
                }
                d.state = ServiceState::Running;
            }
            Service::GroupFileUpload(g) => {
                if g.sender {
                    if !g.is_route {
                        let attr = fs::metadata(&g.body.path).await?;

                        let file_name = g
                            .body
                            .path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();

                        let meta = GroupFileMeta {
                            file_name,
                            file_size: attr.len(),
                            file_group: g.group_id.clone(),
                            file_owner: io.ctx.topology.local_uuid(),
                            route_count: None,
                        };

                        g.body.total = attr.len();

                        let task = TaskInfo::transfer(
                            meta.file_owner.clone(),
                            g.group_id.clone(),
                            TransferMode::Group,
                            serde_json::to_string(&meta)?,
                        );
                        g.task_id = Some(io.ctx.tasks.create_task(task)?);

                        g.meta = Some(meta);
                    }

                    if let Some(meta) = &g.meta {
                        let header = ServiceHeader::with_param(GROUP_FILE_UPLOAD_SERVICE, meta)?;
                        io.framed.send(codec::encode(&header)?).await?;
                    }
                }
                g.state = ServiceState::Running;
            }
            Service::FileSend(f) => {
                if f.sender {
                    let attr = fs::metadata(&f.body.path).await?;
                    f.body.total = attr.len();

                    let file_name = f
                        .body
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().into_owned())
                        .unwrap_or_default();

                    let param = FileSendParam {
                        file_name: format!("{}/{}", f.store_path, file_name),
                        file_size: attr.len(),
                    };

                    let header = ServiceHeader::with_param(FILE_SEND_SERVICE, &param)?;
                    io.framed.send(codec::encode(&header)?).await?;
                }
                f.state = ServiceState::Running;
            }
        }

        Ok(())
    }

    /// Feed received bytes into the active dialect.
    pub async fn on_chunk(
        &mut self,
        io: &mut ServiceIo<'_>,
        chunk: &[u8],
    ) -> LabmeshResult<Flow> {
        match self {
            Service::Control(c) => c.on_chunk(io, chunk),
            Service::PicTransfer(p) => {
                if p.sender {
                    debug!("Ignoring inbound bytes on picture sender (id = {})", io.conn_id);
                    return Ok(Flow::Continue);
                }

                let done = match p.body.write_chunk(chunk).await {
                    Ok(done) => done,
                    Err(e) => {
                        p.body.close();
                        p.state = ServiceState::Errored;
                        return Err(e);
                    }
                };

                io.progress.store(p.body.pct(), Ordering::Relaxed);

                if !done {
                    return Ok(Flow::Continue);
                }

                p.state = ServiceState::Finished;
                debug!(
                    "Picture received (id = {}) (file = {})",
                    io.conn_id,
                    p.body.path.display()
                );

                let info = MessageInfo {
                    id: p.param.msg_id.clone(),
                    source: p.param.msg_source.clone(),
                    dest: p.param.msg_dest.clone(),
                    kind: p.param.msg_type,
                    body: format!("file://{}", p.body.path.display()),
                    date: p.param.msg_date.clone(),
                    mode: p.param.msg_mode,
                };
                io.ctx.sessions.create_message(info, false);

                if p.param.msg_mode == GROUP_SESSION {
                    let mut param = p.param.clone();
                    param.pic_real_name = Some(p.body.path.to_string_lossy().into_owned());

                    let _ = io.events.send(Message::UploadPicToGroup {
                        group_id: p.param.msg_dest.clone(),
                        param,
                        is_route: true,
                    });
                }

                Ok(Flow::Done)
            }
            Service::FileDownload(d) => {
                if d.provider {
                    // Task-control frames multiplexed into the stream.
                    d.reader.extend(chunk);

                    while let Some(frame) = d.reader.next() {
                        match serde_json::from_value::<ServiceHeader>(frame) {
                            Ok(ctrl) => match ctrl.service_name.as_str() {
                                TASK_PAUSE => {
                                    d.is_executing = false;
                                    d.state = ServiceState::Paused;
                                    io.ctx.tasks.pause_task(&d.task_id);
                                }
                                TASK_RESTART => {
                                    d.is_executing = true;
                                    d.state = ServiceState::Running;
                                    io.ctx.tasks.restore_task(&d.task_id);
                                }
                                TASK_STOP => {
                                    debug!("TaskStop is not wired (task = {})", d.task_id);
                                }
                                other => {
                                    debug!("Unknown task control ignored (name = {})", other);
                                }
                            },
                            Err(e) => debug!("Unparseable task control frame: {}", e),
                        }
                    }

                    return Ok(Flow::Continue);
                }

                let done = match d.body.write_chunk(chunk).await {
                    Ok(done) => done,
                    Err(e) => {
                        d.body.close();
                        d.state = ServiceState::Errored;
                        io.ctx.tasks.error_task(&d.task_id);
                        return Err(e);
                    }
                };

                io.progress.store(d.body.pct(), Ordering::Relaxed);

                if !done {
                    return Ok(Flow::Continue);
                }

                d.state = ServiceState::Finished;
                io.ctx.tasks.finish_task(&d.task_id);
                debug!(
                    "Download received (id = {}) (file = {})",
                    io.conn_id,
                    d.body.path.display()
                );

                Ok(Flow::Done)
            }
            Service::GroupFileUpload(g) => {
                if g.sender {
                    debug!(
                        "Ignoring inbound bytes on group upload sender (id = {})",
                        io.conn_id
                    );
                    return Ok(Flow::Continue);
                }

                let done = match g.body.write_chunk(chunk).await {
                    Ok(done) => done,
                    Err(e) => {
                        g.body.close();
                        g.state = ServiceState::Errored;
                        return Err(e);
                    }
                };

                io.progress.store(g.body.pct(), Ordering::Relaxed);

                if !done {
                    return Ok(Flow::Continue);
                }

                g.state = ServiceState::Finished;
                debug!(
                    "Group file received (id = {}) (file = {})",
                    io.conn_id,
                    g.body.path.display()
                );

                if let Some(meta) = g.meta.clone() {
                    io.ctx.shared_files.add_shared_file(SharedFileInfo {
                        path: g.body.path.to_string_lossy().into_owned(),
                        owner: meta.file_owner.clone(),
                        group: meta.file_group.clone(),
                    });

                    // Hand the file onward so an intermediate node
                    // relays it across the router mesh.
                    let _ = io.events.send(Message::UploadGroupFile { meta });
                }

                Ok(Flow::Done)
            }
            Service::FileSend(f) => {
                if f.sender {
                    debug!("Ignoring inbound bytes on file sender (id = {})", io.conn_id);
                    return Ok(Flow::Continue);
                }

                let done = match f.body.write_chunk(chunk).await {
                    Ok(done) => done,
                    Err(e) => {
                        f.body.close();
                        f.state = ServiceState::Errored;
                        return Err(e);
                    }
                };

                io.progress.store(f.body.pct(), Ordering::Relaxed);

                if done {
                    f.state = ServiceState::Finished;
                    debug!(
                        "File received (id = {}) (file = {})",
                        io.conn_id,
                        f.body.path.display()
                    );
                    return Ok(Flow::Done);
                }

                Ok(Flow::Continue)
            }
        }
    }

    /// Push one raw body chunk; called only while `wants_send` holds.
    pub async fn send_step(&mut self, io: &mut ServiceIo<'_>) -> LabmeshResult<Flow> {
        match self {
            Service::Control(_) => Ok(Flow::Continue),
            Service::PicTransfer(p) => {
                let finished = match p.body.send_next(io.framed).await {
                    Ok(finished) => finished,
                    Err(e) => {
                        p.body.close();
                        p.state = ServiceState::Errored;
                        return Err(e);
                    }
                };

                io.progress.store(p.body.pct(), Ordering::Relaxed);

                if finished {
                    p.state = ServiceState::Finished;
                    debug!("Picture sent (id = {})", io.conn_id);
                    return Ok(Flow::Done);
                }

                Ok(Flow::Continue)
            }
            Service::FileDownload(d) => {
                let finished = match d.body.send_next(io.framed).await {
                    Ok(finished) => finished,
                    Err(e) => {
                        d.body.close();
                        d.state = ServiceState::Errored;
                        io.ctx.tasks.error_task(&d.task_id);
                        return Err(e);
                    }
                };

                io.progress.store(d.body.pct(), Ordering::Relaxed);

                if finished {
                    d.state = ServiceState::Finished;
                    io.ctx.tasks.finish_task(&d.task_id);
                    debug!("Download served (id = {}) (task = {})", io.conn_id, d.task_id);
                    return Ok(Flow::Done);
                }

                Ok(Flow::Continue)
            }
            Service::GroupFileUpload(g) => {
                let finished = match g.body.send_next(io.framed).await {
                    Ok(finished) => finished,
                    Err(e) => {
                        g.body.close();
                        g.state = ServiceState::Errored;
                        if let Some(task_id) = &g.task_id {
                            io.ctx.tasks.error_task(task_id);
                        }
                        return Err(e);
                    }
                };

                io.progress.store(g.body.pct(), Ordering::Relaxed);

                if finished {
                    g.state = ServiceState::Finished;
                    if let Some(task_id) = &g.task_id {
                        io.ctx.tasks.finish_task(task_id);
                    }
                    debug!("Group file sent (id = {})", io.conn_id);
                    return Ok(Flow::Done);
                }

                Ok(Flow::Continue)
            }
            Service::FileSend(f) => {
                let finished = match f.body.send_next(io.framed).await {
                    Ok(finished) => finished,
                    Err(e) => {
                        f.body.close();
                        f.state = ServiceState::Errored;
                        return Err(e);
                    }
                };

                io.progress.store(f.body.pct(), Ordering::Relaxed);

                if finished {
                    f.state = ServiceState::Finished;
                    debug!("File sent (id = {})", io.conn_id);
                    return Ok(Flow::Done);
                }

                Ok(Flow::Continue)
            }
        }
    }

    /// Only downloads and group uploads honor pause; a download
    /// consumer asks the far side over the wire, everything else flips
    /// its local executing flag.
    pub async fn pause(&mut self, io: &mut ServiceIo<'_>) -> LabmeshResult<()> {
        match self {
            Service::FileDownload(d) => {
                if d.provider {
                    d.is_executing = false;
                } else {
                    let frame = codec::encode(&ServiceHeader::new(TASK_PAUSE))?;
                    io.framed.send(frame).await?;
                }

                if d.state == ServiceState::Running {
                    d.state = ServiceState::Paused;
                }
            }
            Service::GroupFileUpload(g) => {
                if g.sender {
                    g.is_executing = false;
                    if g.state == ServiceState::Running {
                        g.state = ServiceState::Paused;
                    }
                }
            }
            _ => (),
        }

        Ok(())
    }

    pub async fn restore(&mut self, io: &mut ServiceIo<'_>) -> LabmeshResult<()> {
        match self {
            Service::FileDownload(d) => {
                if d.provider {
                    d.is_executing = true;
                } else {
                    let frame = codec::encode(&ServiceHeader::new(TASK_RESTART))?;
                    io.framed.send(frame).await?;
                }

                if d.state == ServiceState::Paused {
                    d.state = ServiceState::Running;
                }
            }
            Service::GroupFileUpload(g) => {
                if g.sender {
                    g.is_executing = true;
                    if g.state == ServiceState::Paused {
                        g.state = ServiceState::Running;
                    }
                }
            }
            _ => (),
        }

        Ok(())
    }

    /// Resolve the terminal state and release file handles; called once
    /// when the connection winds down. An incomplete transfer counts as
    /// errored and is reported to the task sink.
    pub fn close_out(&mut self, ctx: &Ctx) {
        match self {
            Service::Control(c) => {
                if !c.state.is_terminal() {
                    c.state = ServiceState::Finished;
                }
            }
            Service::PicTransfer(p) => {
                p.body.close();
                if !p.state.is_terminal() {
                    p.state = ServiceState::Errored;
                }
            }
            Service::FileDownload(d) => {
                d.body.close();
                if !d.state.is_terminal() {
                    d.state = ServiceState::Errored;
                    if !d.task_id.is_empty() {
                        ctx.tasks.error_task(&d.task_id);
                    }
                }
            }
            Service::GroupFileUpload(g) => {
                g.body.close();
                if !g.state.is_terminal() {
                    g.state = ServiceState::Errored;
                    if let Some(task_id) = &g.task_id {
                        ctx.tasks.error_task(task_id);
                    }
                }
            }
            Service::FileSend(f) => {
                f.body.close();
                if !f.state.is_terminal() {
                    f.state = ServiceState::Errored;
                }
            }
        }
    }
}

impl Control {
    fn on_chunk(&mut self, io: &mut ServiceIo<'_>, chunk: &[u8]) -> LabmeshResult<Flow> {
        self.reader.extend(chunk);

        while let Some(frame) = self.reader.next() {
            if self.greeting {
                match serde_json::from_value::<ServiceHeader>(frame.clone()) {
                    Ok(header) if header.service_name == NET_STRUCTURE_SERVICE => {
                        self.greeting = false;
                        continue;
                    }
                    Ok(header) => {
                        match Service::from_header(&header.service_name, header.service_param, io.ctx)? {
                            Some(service) => {
                                self.state = ServiceState::Finished;
                                let residual = self.reader.take_remain();

                                debug!(
                                    "Service swap (id = {}) (service = {}) (residual = {})",
                                    io.conn_id,
                                    service.name(),
                                    residual.len()
                                );

                                return Ok(Flow::Swap(Box::new(service), residual));
                            }
                            None => {
                                debug!(
                                    "Unknown service greeting ignored (name = {})",
                                    header.service_name
                                );
                                continue;
                            }
                        }
                    }
                    Err(_) => {
                        debug!("Non-header greeting frame ignored (id = {})", io.conn_id);
                        continue;
                    }
                }
            }

            let _ = io.events.send(Message::Envelope {
                id: io.conn_id.to_string(),
                msg: frame,
            });
        }

        Ok(Flow::Continue)
    }
}
